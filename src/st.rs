//! The satellite-terminal block.
//!
//! Downward channel: logon handshake with indefinite retransmission,
//! superframe tracking from SoF beacons (including NCC-reboot recovery),
//! per-frame return scheduling under the DAMA agent's allocation, capacity
//! requests on the terminal's OBR slot. Upward channel: forward-link
//! reception (BBFrames) with the robustness check and real-MODCOD
//! advertisement handling.

use crate::band::{RateConverter, SpotCarriers};
use crate::config::Config;
use crate::dama::{AgentState, DamaAgent, FifoCrInput};
use crate::fifo::QosFifo;
use crate::frame::{
    self, DvbFrame, LogonRequestBuf, LogonResponse, MsgType, SacBuf, Sof, SyncBuf, Ttp,
};
use crate::ret_sched::ReturnScheduler;
use crate::runtime::{Channel, ChannelCtx, Event, Message, MessageBody, MsgKind, TimerId};
use crate::standard::{ReceptionStd, S2Std};
use crate::telemetry::Probes;
use crate::{GroupId, Kbps, TalId, TimeMs};

pub const TIMER_ST_FRAME: TimerId = 1;
pub const TIMER_ST_LOGON: TimerId = 2;

/// Logon responses slower than this trigger a retransmission, forever.
pub const LOGON_TIMEOUT_MS: TimeMs = 5000;

pub struct StDownward {
    mac: TalId,
    carriers: SpotCarriers,
    cra_kbps: Kbps,
    max_rbdc_kbps: Kbps,
    max_vbdc_pkts: u32,

    agent: DamaAgent,
    ret_sched: ReturnScheduler,
    fifos: Vec<QosFifo>,

    frame_duration_ms: TimeMs,
    frames_per_superframe: u32,
    sync_period_frames: u32,

    /// Local superframe counter, tracking the wire value in serial-number
    /// arithmetic so a 16-bit wrap is a continuation and a step back is an
    /// NCC reboot.
    super_frame_counter: u64,
    frame_counter: u32,
    seen_first_sof: bool,

    group_id: Option<GroupId>,
    logon_id: Option<TalId>,

    last_cr_time: TimeMs,
    /// Channel quality the physical layer reports for this terminal;
    /// carried in every SAC when the phy layer is enabled.
    current_cni_db: f64,

    probes: Probes,
}

impl StDownward {
    pub fn new(
        cfg: &Config,
        mac: TalId,
        cra_kbps: Kbps,
        max_rbdc_kbps: Kbps,
        max_vbdc_pkts: u32,
        carriers: SpotCarriers,
        probes: Probes,
    ) -> Self {
        let frame_duration_ms =
            cfg.ret_up_frame_duration_ms / cfg.frames_per_superframe.max(1) as u64;
        let converter = RateConverter::new(cfg.ret_pkt_size(), frame_duration_ms.max(1));
        let agent = DamaAgent::new(
            mac,
            cra_kbps,
            max_rbdc_kbps,
            max_vbdc_pkts,
            cfg.cra_decrease,
            cfg.obr_period_frames,
            cfg.frames_per_superframe,
            converter,
        );
        let sync_period_frames = if frame_duration_ms > 0 {
            (cfg.sync_period_ms / frame_duration_ms) as u32
        } else {
            0
        };
        Self {
            mac,
            carriers,
            cra_kbps,
            max_rbdc_kbps,
            max_vbdc_pkts,
            agent,
            ret_sched: ReturnScheduler::new(carriers.spot_id, cfg.ret_pkt_type, probes.clone()),
            fifos: QosFifo::build_set(&cfg.fifos),
            frame_duration_ms,
            frames_per_superframe: cfg.frames_per_superframe,
            sync_period_frames,
            super_frame_counter: 0,
            frame_counter: 0,
            seen_first_sof: false,
            group_id: None,
            logon_id: None,
            last_cr_time: 0,
            current_cni_db: 0.0,
            probes,
        }
    }

    /// The logon request fires immediately; everything else waits for the
    /// first SoF.
    pub fn initial_events(&self) -> Vec<(TimeMs, Event)> {
        vec![(0, Event::Timer(TIMER_ST_LOGON))]
    }

    pub fn state(&self) -> AgentState {
        self.agent.state()
    }

    pub fn super_frame_counter(&self) -> u64 {
        self.super_frame_counter
    }

    pub fn group_id(&self) -> Option<GroupId> {
        self.group_id
    }

    pub fn logon_id(&self) -> Option<TalId> {
        self.logon_id
    }

    pub fn backlog_pkts(&self) -> usize {
        self.fifos.iter().map(|f| f.fifo.len()).sum()
    }

    /// Feed the physical layer's C/N estimate for the forward channel.
    pub fn set_cni_db(&mut self, cni_db: f64) {
        self.current_cni_db = cni_db;
    }

    fn send_logon_request(&mut self, ctx: &mut ChannelCtx) {
        let req = LogonRequestBuf {
            spot_id: self.carriers.spot_id,
            carrier_id: self.carriers.logon_in,
            mac: self.mac,
            cra_kbps: self.cra_kbps.min(u16::MAX as u32) as u16,
            max_rbdc_kbps: self.max_rbdc_kbps.min(u16::MAX as u32) as u16,
            max_vbdc_pkts: self.max_vbdc_pkts.min(u16::MAX as u32) as u16,
        };
        ctx.send_frame(self.carriers.logon_in, req.to_bytes());
        log::info!("st {}: logon request sent", self.mac);
        self.probes.incr("st.logon_requests");
    }

    fn on_logon_timer(&mut self, ctx: &mut ChannelCtx) -> bool {
        if self.agent.state() == AgentState::Running {
            return true;
        }
        self.agent.start_logon();
        self.send_logon_request(ctx);
        ctx.set_timer(TIMER_ST_LOGON, LOGON_TIMEOUT_MS);
        true
    }

    fn on_logon_response(&mut self, bytes: &[u8], ctx: &mut ChannelCtx) -> bool {
        let Ok(resp) = LogonResponse::from_bytes(bytes) else {
            self.probes.incr("st.malformed_frames");
            return false;
        };
        if resp.mac() != self.mac {
            // someone else's response on the shared control carrier
            return true;
        }
        self.group_id = Some(resp.group_id());
        self.logon_id = Some(resp.logon_id());
        self.agent.here_is_logon_resp();
        ctx.send_upper(Message {
            kind: MsgKind::LinkUp,
            body: MessageBody::LinkUp {
                group_id: resp.group_id(),
                tal_id: resp.logon_id(),
            },
        });
        true
    }

    /// SoF reception: reboot detection, superframe bookkeeping and the
    /// first frame tick of the new superframe.
    fn on_start_of_frame(&mut self, bytes: &[u8], ctx: &mut ChannelCtx) -> bool {
        let Ok(sof) = Sof::from_bytes(bytes) else {
            self.probes.incr("st.malformed_frames");
            return false;
        };
        let sfn_wire = sof.sfn();
        let delta = sfn_wire.wrapping_sub(self.super_frame_counter as u16) as i16;

        if self.seen_first_sof && delta < 0 {
            // the NCC rebooted: flush everything and log on again
            log::warn!(
                "st {}: SoF#{sfn_wire} behind local SF#{}, NCC reboot assumed",
                self.mac,
                self.super_frame_counter
            );
            let mut flushed = 0usize;
            for qf in self.fifos.iter_mut() {
                flushed += qf.fifo.flush().len();
            }
            self.probes.add("st.reboot_flushed_pkts", flushed as u64);
            self.agent.reset();
            self.send_logon_request(ctx);
            ctx.set_timer(TIMER_ST_LOGON, LOGON_TIMEOUT_MS);
            self.super_frame_counter = sfn_wire as u64;
            self.seen_first_sof = false;
            return true;
        }

        if self.seen_first_sof {
            self.super_frame_counter += delta as u64;
        } else {
            self.super_frame_counter = sfn_wire as u64;
        }

        // start this superframe's first frame immediately if the previous
        // superframe consumed all of its frames; otherwise the running
        // frame timer keeps ticking and this frame counts as frame zero
        if !self.seen_first_sof || self.frame_counter >= self.frames_per_superframe {
            self.seen_first_sof = true;
            self.frame_counter = 0;
            self.process_on_frame_tick(ctx)
        } else {
            self.frame_counter = 0;
            true
        }
    }

    fn on_ttp(&mut self, bytes: &[u8]) -> bool {
        let Ok(ttp) = Ttp::from_bytes(bytes) else {
            self.probes.incr("st.malformed_frames");
            return false;
        };
        self.agent.here_is_ttp(&ttp);
        true
    }

    fn process_on_frame_tick(&mut self, ctx: &mut ChannelCtx) -> bool {
        self.frame_counter += 1;
        // re-arm at the start of the tick so that scheduling time does not
        // push the next frame back
        if self.frame_counter < self.frames_per_superframe {
            ctx.set_timer(TIMER_ST_FRAME, self.frame_duration_ms);
        }
        let now = ctx.now();
        let running = self.agent.state() == AgentState::Running;

        let alloc = self.agent.process_on_frame_tick();
        if running {
            let out = self.ret_sched.schedule(now, &mut self.fifos, alloc);
            self.agent.note_vbdc_sent(out.vbdc_sent_pkts);
            for mut frame_bytes in out.frames {
                frame::set_carrier_id(&mut frame_bytes, self.carriers.data_in_st);
                ctx.send_frame(self.carriers.data_in_st, frame_bytes);
            }
        }

        let global_frame_number = self
            .super_frame_counter
            .saturating_sub(1)
            .wrapping_mul(self.frames_per_superframe as u64)
            .wrapping_add(self.frame_counter as u64) as u32;

        if running && self.agent.is_obr_slot(global_frame_number) {
            self.send_capacity_request(now, ctx);
        }
        if running
            && self.sync_period_frames > 0
            && global_frame_number % self.sync_period_frames == 0
        {
            let sync = SyncBuf {
                spot_id: self.carriers.spot_id,
                carrier_id: self.carriers.ctrl_in,
                tal_id: self.mac,
            };
            ctx.send_frame(self.carriers.ctrl_in, sync.to_bytes());
        }
        true
    }

    fn send_capacity_request(&mut self, now: TimeMs, ctx: &mut ChannelCtx) {
        let inputs: Vec<FifoCrInput> = self
            .fifos
            .iter_mut()
            .map(|qf| FifoCrInput {
                access: qf.access,
                backlog_pkts: qf.fifo.len() as u32,
                arrived_bits: qf.take_arrived_bits(),
            })
            .collect();
        let elapsed_ms = now - self.last_cr_time;
        self.last_cr_time = now;

        let Some(entries) = self.agent.build_cr(&inputs, elapsed_ms) else {
            return;
        };
        let sac = SacBuf {
            spot_id: self.carriers.spot_id,
            carrier_id: self.carriers.ctrl_in,
            tal_id: self.mac,
            entries,
            cni_q8: frame::cni_to_q8(self.current_cni_db),
        };
        ctx.send_frame(self.carriers.ctrl_in, sac.to_bytes());
        log::debug!("st {}: capacity request sent", self.mac);
        self.probes.incr("st.capacity_requests");
    }

    /// Return traffic from the upper layer, spread by QoS.
    fn on_encap_burst(&mut self, burst: crate::NetBurst, now: TimeMs) -> bool {
        let mut ok = true;
        for pkt in burst {
            let qos = pkt.qos as usize;
            let idx = if qos < self.fifos.len() { qos } else { 0 };
            if !self.fifos[idx].push_packet(pkt, now) {
                // visible as return-link loss
                self.probes.incr("st.ret_fifo_drops");
                ok = false;
            }
        }
        ok
    }
}

impl Channel for StDownward {
    fn on_event(&mut self, event: Event, ctx: &mut ChannelCtx) -> bool {
        match event {
            Event::Timer(TIMER_ST_FRAME) => self.process_on_frame_tick(ctx),
            Event::Timer(TIMER_ST_LOGON) => self.on_logon_timer(ctx),
            Event::Timer(id) => {
                log::error!("st down: unknown timer {id}");
                false
            }
            Event::Message(Message { body, .. }) => match body {
                MessageBody::Frame(bytes) => {
                    match DvbFrame::from_bytes(&bytes).map(|f| f.msg_type()) {
                        Ok(MsgType::Sof) => self.on_start_of_frame(&bytes, ctx),
                        Ok(MsgType::Ttp) => self.on_ttp(&bytes),
                        Ok(MsgType::LogonResp) => self.on_logon_response(&bytes, ctx),
                        Ok(other) => {
                            log::debug!("st down: unexpected shared frame {other:?}");
                            true
                        }
                        Err(_) => {
                            self.probes.incr("st.malformed_frames");
                            false
                        }
                    }
                }
                MessageBody::Burst(burst) => self.on_encap_burst(burst, ctx.now()),
                _ => true,
            },
        }
    }
}

/*
 * Upward channel
 */

pub struct StUpward {
    mac: TalId,
    reception: S2Std,
    probes: Probes,
}

impl StUpward {
    pub fn new(cfg: &Config, mac: TalId, probes: Probes) -> Self {
        Self {
            mac,
            reception: S2Std::new(cfg.fwd_modcod_defs.highest_id()),
            probes,
        }
    }

    pub fn received_modcod(&self) -> crate::ModcodId {
        self.reception.received_modcod()
    }

    pub fn real_modcod(&self) -> crate::ModcodId {
        self.reception.real_modcod()
    }

    /// Physical-layer feedback on what this terminal can decode.
    pub fn set_real_modcod(&mut self, modcod: crate::ModcodId) {
        self.reception.set_real_modcod(modcod);
    }

    fn on_frame(&mut self, bytes: Vec<u8>, ctx: &mut ChannelCtx) -> bool {
        let Ok(hdr) = DvbFrame::from_bytes(&bytes) else {
            self.probes.incr("st.malformed_frames");
            return false;
        };
        match hdr.msg_type() {
            MsgType::BbFrame | MsgType::Corrupted => {
                match self.reception.on_receive_frame(&bytes, Some(self.mac)) {
                    Ok(burst) => {
                        self.probes
                            .put("st.received_modcod", self.reception.received_modcod() as u64);
                        if !burst.is_empty() {
                            ctx.send_upper(Message {
                                kind: MsgKind::EncapBurst,
                                body: MessageBody::Burst(burst),
                            });
                        }
                        true
                    }
                    Err(err) => {
                        log::warn!("st {} up: reception failed: {err}", self.mac);
                        self.probes.incr("st.reception_errors");
                        false
                    }
                }
            }
            // control plane for the downward channel, in arrival order
            MsgType::Sof | MsgType::Ttp | MsgType::LogonResp => {
                ctx.share(Message {
                    kind: MsgKind::Sig,
                    body: MessageBody::Frame(bytes),
                });
                true
            }
            MsgType::SalohaData | MsgType::SalohaCtrl => {
                self.probes.incr("st.saloha_frames");
                true
            }
            // our own transmissions echoed on shared carriers
            _ => true,
        }
    }
}

impl Channel for StUpward {
    fn on_event(&mut self, event: Event, ctx: &mut ChannelCtx) -> bool {
        match event {
            Event::Message(Message {
                body: MessageBody::Frame(bytes),
                ..
            }) => self.on_frame(bytes, ctx),
            Event::Message(_) => true,
            Event::Timer(id) => {
                log::error!("st up: unexpected timer {id}");
                false
            }
        }
    }
}
