//! The ST-side DAMA agent.
//!
//! Watches the local return FIFOs, emits capacity requests on the
//! terminal's OBR slot, and turns received TTPs into a per-frame allocation
//! for the return scheduler. The agent is a state machine: only `Running`
//! emits requests and accepts allocations.

use crate::band::RateConverter;
use crate::config::FifoAccess;
use crate::frame::{CrEntry, CrKind, Ttp};
use crate::{Kbps, TalId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Off,
    WaitLogonResp,
    Running,
}

/// What the agent sees of one return FIFO when building a request.
#[derive(Debug, Clone, Copy)]
pub struct FifoCrInput {
    pub access: FifoAccess,
    pub backlog_pkts: u32,
    /// Bits that arrived into the FIFO since the last request was built.
    pub arrived_bits: u64,
}

#[derive(Debug)]
pub struct DamaAgent {
    state: AgentState,
    tal_id: TalId,

    cra_kbps: Kbps,
    max_rbdc_kbps: Kbps,
    max_vbdc_pkts: u32,
    cra_decrease: bool,

    obr_period: u32,
    obr_slot_frame: u32,

    converter: RateConverter,
    frames_per_superframe: u32,

    /// Exponentially averaged arrival rate over the RBDC FIFOs.
    rbdc_rate_kbps: f64,
    /// VBDC packets requested but not yet observed leaving the FIFOs.
    vbdc_pending_pkts: u32,

    /// Allocation received for the current superframe, and what is left of
    /// it for the remaining frames.
    sf_alloc_pkts: u32,
    frames_left_in_sf: u32,
}

impl DamaAgent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tal_id: TalId,
        cra_kbps: Kbps,
        max_rbdc_kbps: Kbps,
        max_vbdc_pkts: u32,
        cra_decrease: bool,
        obr_period: u32,
        frames_per_superframe: u32,
        converter: RateConverter,
    ) -> Self {
        // spread capacity requests deterministically across the OBR period
        let obr_slot_frame = tal_id as u32 % obr_period;
        log::info!(
            "dama agent: terminal {tal_id}, obr period {obr_period}, obr slot {obr_slot_frame}"
        );
        Self {
            state: AgentState::Off,
            tal_id,
            cra_kbps,
            max_rbdc_kbps,
            max_vbdc_pkts,
            cra_decrease,
            obr_period,
            obr_slot_frame,
            converter,
            frames_per_superframe,
            rbdc_rate_kbps: 0.0,
            vbdc_pending_pkts: 0,
            sf_alloc_pkts: 0,
            frames_left_in_sf: 0,
        }
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn tal_id(&self) -> TalId {
        self.tal_id
    }

    pub fn cra_kbps(&self) -> Kbps {
        self.cra_kbps
    }

    /// The logon request was sent; allocations are refused until the
    /// response arrives.
    pub fn start_logon(&mut self) {
        self.state = AgentState::WaitLogonResp;
    }

    pub fn here_is_logon_resp(&mut self) {
        log::info!("dama agent: terminal {} running", self.tal_id);
        self.state = AgentState::Running;
    }

    /// NCC reboot or local shutdown: forget every grant and request.
    pub fn reset(&mut self) {
        self.state = AgentState::WaitLogonResp;
        self.rbdc_rate_kbps = 0.0;
        self.vbdc_pending_pkts = 0;
        self.sf_alloc_pkts = 0;
        self.frames_left_in_sf = 0;
    }

    /// Whether this frame is the terminal's OBR slot.
    pub fn is_obr_slot(&self, global_frame_number: u32) -> bool {
        global_frame_number % self.obr_period == self.obr_slot_frame
    }

    /// Build the capacity-request entries for an SAC, from the state of the
    /// return FIFOs. `elapsed_ms` is the time covered by `arrived_bits`.
    /// Returns `None` outside `Running` or when there is nothing to say.
    pub fn build_cr(&mut self, fifos: &[FifoCrInput], elapsed_ms: u64) -> Option<Vec<CrEntry>> {
        if self.state != AgentState::Running {
            return None;
        }
        let mut entries = Vec::new();

        let has_rbdc = fifos.iter().any(|f| f.access == FifoAccess::Rbdc);
        if has_rbdc && elapsed_ms > 0 {
            let arrived_bits: u64 = fifos
                .iter()
                .filter(|f| f.access == FifoAccess::Rbdc)
                .map(|f| f.arrived_bits)
                .sum();
            // bits over milliseconds is exactly kbits/s
            let instant_kbps = arrived_bits as f64 / elapsed_ms as f64;
            self.rbdc_rate_kbps = (self.rbdc_rate_kbps + instant_kbps) / 2.0;

            let mut request = self.rbdc_rate_kbps;
            if self.cra_decrease {
                request -= self.cra_kbps as f64;
            }
            let request_kbps = request.max(0.0).min(self.max_rbdc_kbps as f64) as u16;
            // RBDC is persistent at the NCC: a zero must be sent to cancel
            // a previous request
            entries.push(CrEntry {
                cr_type: CrKind::Rbdc,
                wrap_count: 0,
                value: request_kbps,
            });
        }

        let vbdc_backlog: u32 = fifos
            .iter()
            .filter(|f| f.access == FifoAccess::Vbdc)
            .map(|f| f.backlog_pkts)
            .sum();
        let vbdc_request = vbdc_backlog
            .saturating_sub(self.vbdc_pending_pkts)
            .min(self.max_vbdc_pkts);
        if vbdc_request > 0 {
            self.vbdc_pending_pkts += vbdc_request;
            entries.push(CrEntry {
                cr_type: CrKind::Vbdc,
                wrap_count: 0,
                value: vbdc_request.min(u16::MAX as u32) as u16,
            });
        }

        if entries.is_empty() {
            None
        } else {
            Some(entries)
        }
    }

    /// Packets drained from VBDC FIFOs under an allocation; shrinks the
    /// outstanding-request estimate.
    pub fn note_vbdc_sent(&mut self, pkts: u32) {
        self.vbdc_pending_pkts = self.vbdc_pending_pkts.saturating_sub(pkts);
    }

    /// Consume a TTP. Outside `Running` the plan is dropped silently (the
    /// NCC may lag a logon exchange).
    pub fn here_is_ttp(&mut self, ttp: &Ttp<'_>) {
        if self.state != AgentState::Running {
            log::debug!("dama agent: ttp ignored in state {:?}", self.state);
            return;
        }
        let alloc = ttp.allocation_for(self.tal_id).unwrap_or(0) as u32;
        self.sf_alloc_pkts = alloc;
        self.frames_left_in_sf = self.frames_per_superframe;
        log::debug!(
            "dama agent: terminal {} got {alloc} pkts for SF#{}",
            self.tal_id,
            ttp.sfn()
        );
    }

    /// Allocation available for the coming frame: the CRA share plus this
    /// frame's slice of the dynamic superframe grant.
    pub fn process_on_frame_tick(&mut self) -> u32 {
        let cra_pkts = self.converter.kbps_to_pkts(self.cra_kbps);
        if self.frames_left_in_sf == 0 {
            return cra_pkts;
        }
        // even split, remainder to the earliest frames
        let share = self.sf_alloc_pkts / self.frames_per_superframe;
        let frame_idx = self.frames_per_superframe - self.frames_left_in_sf;
        let remainder = self.sf_alloc_pkts % self.frames_per_superframe;
        let extra = if frame_idx < remainder { 1 } else { 0 };
        self.frames_left_in_sf -= 1;
        cra_pkts + share + extra
    }
}
