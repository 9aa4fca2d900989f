//! The Legacy DAMA controller run by the NCC.
//!
//! Once per superframe, turns the registered terminals' capacity requests
//! (RBDC in kbits/s, VBDC in packets) plus their static CRA into a
//! per-terminal allocation table, encoded into a TTP. Allocation passes run
//! in packets per superframe; the CRA reservation comes off the top and is
//! never listed in the TTP (terminals assume it).

use std::collections::BTreeMap;

use crate::band::RateConverter;
use crate::error::{ProtocolError, ResourceConflict};
use crate::frame::{CrKind, Sac, TtpBuf, TtpEntry};
use crate::telemetry::Probes;
use crate::{Kbps, ModcodId, TalId};

/// Internal per-terminal context.
#[derive(Debug, Clone)]
struct TerminalCtx {
    cra_kbps: Kbps,
    max_rbdc_kbps: Kbps,
    max_vbdc_pkts: u32,
    ret_modcod: ModcodId,

    /// Last RBDC request, packets per superframe; persistent until the
    /// terminal sends a new one.
    rbdc_request_pkts: u32,
    /// Outstanding VBDC backlog, packets; decremented as it is served.
    vbdc_pending_pkts: u32,
    /// Banked fractional RBDC share.
    rbdc_credit: f64,

    // per-superframe assignments, cleared after the TTP is built
    rbdc_alloc: u32,
    vbdc_alloc: u32,
    fca_alloc: u32,
}

impl TerminalCtx {
    fn dynamic_alloc(&self) -> u32 {
        self.rbdc_alloc + self.vbdc_alloc + self.fca_alloc
    }
}

/// A resource command from the external policy-enforcement point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PepRequest {
    pub tal_id: TalId,
    pub cra_kbps: Option<Kbps>,
    pub rbdc_kbps: Option<Kbps>,
    pub vbdc_pkts: Option<u32>,
}

#[derive(Debug)]
pub struct DamaController {
    terminals: BTreeMap<TalId, TerminalCtx>,
    band_capacity_pkts: u32,
    converter: RateConverter,
    fca_kbps: Kbps,
    min_vbdc_pkts: u32,

    rbdc_start_ptr: Option<TalId>,
    vbdc_start_ptr: Option<TalId>,
    fca_start_ptr: Option<TalId>,

    probes: Probes,
}

impl DamaController {
    pub fn new(
        band_capacity_pkts: u32,
        converter: RateConverter,
        fca_kbps: Kbps,
        probes: Probes,
    ) -> Self {
        Self {
            terminals: BTreeMap::new(),
            band_capacity_pkts,
            converter,
            fca_kbps,
            min_vbdc_pkts: super::DEFAULT_MIN_VBDC_PKTS,
            rbdc_start_ptr: None,
            vbdc_start_ptr: None,
            fca_start_ptr: None,
            probes,
        }
    }

    pub fn band_capacity_pkts(&self) -> u32 {
        self.band_capacity_pkts
    }

    pub fn is_registered(&self, tal_id: TalId) -> bool {
        self.terminals.contains_key(&tal_id)
    }

    pub fn terminal_count(&self) -> usize {
        self.terminals.len()
    }

    /// Register a terminal from its accepted logon parameters. A relogon
    /// replaces the previous context.
    pub fn register_terminal(
        &mut self,
        tal_id: TalId,
        cra_kbps: Kbps,
        max_rbdc_kbps: Kbps,
        max_vbdc_pkts: u32,
        ret_modcod: ModcodId,
    ) {
        log::info!(
            "dama: terminal {tal_id} registered (cra {cra_kbps} kbps, \
             max rbdc {max_rbdc_kbps} kbps, max vbdc {max_vbdc_pkts} pkts)"
        );
        self.terminals.insert(
            tal_id,
            TerminalCtx {
                cra_kbps,
                max_rbdc_kbps,
                max_vbdc_pkts,
                ret_modcod,
                rbdc_request_pkts: 0,
                vbdc_pending_pkts: 0,
                rbdc_credit: 0.0,
                rbdc_alloc: 0,
                vbdc_alloc: 0,
                fca_alloc: 0,
            },
        );
    }

    pub fn deregister_terminal(&mut self, tal_id: TalId) {
        if self.terminals.remove(&tal_id).is_some() {
            log::info!("dama: terminal {tal_id} removed");
        }
    }

    /// Refresh the return MODCOD of a terminal after an FMT scenario step.
    pub fn update_terminal_modcod(&mut self, tal_id: TalId, modcod: ModcodId) {
        if let Some(t) = self.terminals.get_mut(&tal_id) {
            t.ret_modcod = modcod;
        }
    }

    /// Ingest a capacity request.
    pub fn here_is_sac(&mut self, sac: &Sac<'_>) -> Result<(), ProtocolError> {
        let tal_id = sac.tal_id();
        let converter = self.converter;
        let t = self
            .terminals
            .get_mut(&tal_id)
            .ok_or(ProtocolError::UnknownSacSource(tal_id))?;
        for entry in sac.entries() {
            match entry.cr_type {
                CrKind::Rbdc => {
                    let kbps = (entry.value as Kbps).min(t.max_rbdc_kbps);
                    t.rbdc_request_pkts = converter.kbps_to_pkts(kbps);
                    log::debug!(
                        "dama: terminal {tal_id} rbdc request {kbps} kbps ({} pkts/sf)",
                        t.rbdc_request_pkts
                    );
                }
                CrKind::Vbdc => {
                    t.vbdc_pending_pkts =
                        (t.vbdc_pending_pkts + entry.value as u32).min(t.max_vbdc_pkts);
                    log::debug!(
                        "dama: terminal {tal_id} vbdc request +{} (pending {})",
                        entry.value,
                        t.vbdc_pending_pkts
                    );
                }
                CrKind::Avbdc => {
                    // absolute VBDC replaces the outstanding backlog
                    t.vbdc_pending_pkts = (entry.value as u32).min(t.max_vbdc_pkts);
                }
                CrKind::Fca => {
                    // terminals never request FCA; ignore but keep counting
                    log::warn!("dama: terminal {tal_id} sent an FCA request, ignored");
                }
            }
        }
        Ok(())
    }

    /// Apply a PEP resource command, refusing anything beyond the
    /// terminal's logon bounds.
    pub fn apply_pep_command(&mut self, req: &PepRequest) -> Result<(), ResourceConflict> {
        let converter = self.converter;
        let Some(t) = self.terminals.get_mut(&req.tal_id) else {
            return Err(ResourceConflict {
                tal_id: req.tal_id,
                requested: 0,
                limit: 0,
                bound: "registration",
            });
        };
        if let Some(rbdc) = req.rbdc_kbps {
            if rbdc > t.max_rbdc_kbps {
                return Err(ResourceConflict {
                    tal_id: req.tal_id,
                    requested: rbdc,
                    limit: t.max_rbdc_kbps,
                    bound: "max_rbdc_kbps",
                });
            }
            t.rbdc_request_pkts = converter.kbps_to_pkts(rbdc);
        }
        if let Some(vbdc) = req.vbdc_pkts {
            if vbdc > t.max_vbdc_pkts {
                return Err(ResourceConflict {
                    tal_id: req.tal_id,
                    requested: vbdc,
                    limit: t.max_vbdc_pkts,
                    bound: "max_vbdc_pkts",
                });
            }
            t.vbdc_pending_pkts = vbdc;
        }
        if let Some(cra) = req.cra_kbps {
            t.cra_kbps = cra;
        }
        Ok(())
    }

    /// Run the allocation for the coming superframe and build its TTP.
    pub fn run_on_super_frame_change(&mut self, sfn: u16) -> TtpBuf {
        let total_cra_pkts: u32 = self
            .terminals
            .values()
            .map(|t| self.converter.kbps_to_pkts(t.cra_kbps))
            .sum();

        let total_capacity = if total_cra_pkts > self.band_capacity_pkts {
            log::error!(
                "dama: CRA over-booked ({total_cra_pkts} pkts reserved on a \
                 {} pkts band), dynamic capacity clamped to zero",
                self.band_capacity_pkts
            );
            self.probes
                .add("dama.cra_overbooked_pkts", (total_cra_pkts - self.band_capacity_pkts) as u64);
            0
        } else {
            self.band_capacity_pkts - total_cra_pkts
        };

        log::debug!(
            "dama: SF#{sfn} allocation starts, dynamic capacity {total_capacity} pkts \
             (band {}, cra {total_cra_pkts})",
            self.band_capacity_pkts
        );

        let mut remaining = self.run_dama_rbdc(total_capacity);
        self.probes
            .put("dama.rbdc_alloc_pkts", (total_capacity - remaining) as u64);

        let before_vbdc = remaining;
        remaining = self.run_dama_vbdc(remaining);
        self.probes
            .put("dama.vbdc_alloc_pkts", (before_vbdc - remaining) as u64);

        let before_fca = remaining;
        if self.fca_kbps > 0 {
            remaining = self.run_dama_fca(remaining);
        }
        self.probes
            .put("dama.fca_alloc_pkts", (before_fca - remaining) as u64);

        self.build_ttp(sfn)
    }

    /// RBDC pass: fair share, then round-robin over banked fractions.
    fn run_dama_rbdc(&mut self, mut tac: u32) -> u32 {
        if tac == 0 {
            log::debug!("dama: rbdc skipped, no capacity");
            return tac;
        }

        let total_request: u32 = self.terminals.values().map(|t| t.rbdc_request_pkts).sum();
        if total_request == 0 {
            return tac;
        }

        let raw_share = total_request as f64 / tac as f64;
        self.probes.put_f64("dama.fair_share", raw_share);
        // below congestion, do not scale requests down
        let fair_share = raw_share.max(1.0);
        log::debug!("dama: rbdc sum {total_request} pkts, fair share {fair_share:.3}");

        // integer part of every scaled request
        for (tal_id, t) in self.terminals.iter_mut() {
            let need = t.rbdc_request_pkts as f64 / fair_share;
            let serve = need as u32;
            t.rbdc_alloc = serve;
            tac -= serve.min(tac);
            if fair_share > 1.0 {
                t.rbdc_credit += need - serve as f64;
            }
            log::trace!("dama: rbdc terminal {tal_id} integer part {serve} pkts");
        }

        // fractional parts, one packet at a time round-robin
        if fair_share > 1.0 && tac > 0 {
            let Some(start) = self.resolve_ptr(self.rbdc_start_ptr) else {
                return tac;
            };
            self.rbdc_start_ptr = Some(start);
            let mut current = start;
            let mut first_unserved: Option<TalId> = None;
            let mut pass_progress = false;
            while tac > 0 {
                let max_rbdc_pkts = {
                    let t = &self.terminals[&current];
                    self.converter.kbps_to_pkts(t.max_rbdc_kbps)
                };
                let t = self.terminals.get_mut(&current).unwrap();
                if t.rbdc_credit >= 1.0 {
                    if t.rbdc_alloc < max_rbdc_pkts {
                        t.rbdc_alloc += 1;
                        t.rbdc_credit -= 1.0;
                        tac -= 1;
                        pass_progress = true;
                    } else if first_unserved.is_none() {
                        first_unserved = Some(current);
                    }
                }
                current = self.next_terminal(current);
                if current == start {
                    if !pass_progress {
                        break;
                    }
                    pass_progress = false;
                }
            }
            // capacity exhausted mid-pass: restart at the first terminal we
            // did not reach; otherwise at the first one whose credit could
            // not be served, falling back to where the scan stopped
            self.rbdc_start_ptr = Some(if tac == 0 {
                current
            } else {
                first_unserved.unwrap_or(current)
            });
        }

        tac
    }

    /// VBDC passes: a floor of `min_vbdc_pkts` for every requester first,
    /// then the remainders.
    fn run_dama_vbdc(&mut self, mut tac: u32) -> u32 {
        if tac == 0 {
            log::debug!("dama: vbdc skipped, no capacity");
            return tac;
        }
        let Some(start) = self.resolve_ptr(self.vbdc_start_ptr) else {
            return tac;
        };
        self.vbdc_start_ptr = Some(start);

        let mut current = start;
        let mut first_unserved: Option<TalId> = None;
        for step in 0..2 {
            loop {
                if tac == 0 {
                    break;
                }
                let t = self.terminals.get_mut(&current).unwrap();
                let mut request = t.vbdc_pending_pkts;
                if step == 0 {
                    // the floor is served first; the remainder waits for
                    // the second pass
                    request = request.min(self.min_vbdc_pkts);
                }
                if request > 0 {
                    let room = t.max_vbdc_pkts.saturating_sub(t.vbdc_alloc).min(tac);
                    let serve = request.min(room);
                    if serve > 0 {
                        t.vbdc_alloc += serve;
                        t.vbdc_pending_pkts -= serve;
                        tac -= serve;
                        log::trace!("dama: vbdc terminal {current} step {step} serve {serve}");
                    }
                    if serve < request && first_unserved.is_none() {
                        first_unserved = Some(current);
                    }
                }
                current = self.next_terminal(current);
                if current == start {
                    break;
                }
            }
        }
        self.vbdc_start_ptr = Some(first_unserved.unwrap_or(current));

        tac
    }

    /// FCA pass: lap the ring handing out fixed chunks of the leftover
    /// capacity, one chunk per visit, until the leftovers dip below a chunk
    /// or a full lap finds nobody able to accept one.
    fn run_dama_fca(&mut self, mut tac: u32) -> u32 {
        let chunk = self.converter.kbps_to_pkts(self.fca_kbps);
        if chunk == 0 {
            return tac;
        }
        if tac < chunk {
            log::debug!("dama: fca skipped, {tac} pkts left is below one chunk");
            return tac;
        }
        let Some(start) = self.resolve_ptr(self.fca_start_ptr) else {
            return tac;
        };
        self.fca_start_ptr = Some(start);
        let mut current = start;
        let mut lap_progress = false;
        while tac >= chunk {
            // a terminal can absorb free capacity up to what its logon
            // bounds would let it use, plus the chunk in flight
            let ceiling = {
                let t = &self.terminals[&current];
                self.converter.kbps_to_pkts(t.max_rbdc_kbps) + t.max_vbdc_pkts + chunk
            };
            let t = self.terminals.get_mut(&current).unwrap();
            if t.dynamic_alloc() + chunk <= ceiling {
                t.fca_alloc += chunk;
                tac -= chunk;
                lap_progress = true;
                log::trace!("dama: fca terminal {current} +{chunk} pkts");
            }
            current = self.next_terminal(current);
            if current == start {
                if !lap_progress {
                    break;
                }
                lap_progress = false;
            }
        }
        self.fca_start_ptr = Some(current);

        tac
    }

    /// Build the TTP and clear the per-superframe assignments.
    fn build_ttp(&mut self, sfn: u16) -> TtpBuf {
        let mut entries = Vec::new();
        let mut total = 0u32;
        for (tal_id, t) in self.terminals.iter_mut() {
            let alloc = t.dynamic_alloc();
            if alloc > 0 {
                entries.push(TtpEntry {
                    tal_id: *tal_id,
                    pkts: alloc.min(u16::MAX as u32) as u16,
                });
                total += alloc;
            }
            t.rbdc_alloc = 0;
            t.vbdc_alloc = 0;
            t.fca_alloc = 0;
        }
        // allocation passes each decrement the same capacity pool, so the
        // sum can only exceed it through a bug
        assert!(
            total <= self.band_capacity_pkts,
            "allocated {total} pkts on a {} pkts band",
            self.band_capacity_pkts
        );
        TtpBuf {
            spot_id: 0,
            carrier_id: 0,
            sfn,
            entries,
        }
    }

    /// Resolve a persisted round-robin pointer, falling back to the first
    /// terminal when the saved one logged off.
    fn resolve_ptr(&self, ptr: Option<TalId>) -> Option<TalId> {
        let first = *self.terminals.keys().next()?;
        match ptr {
            Some(id) if self.terminals.contains_key(&id) => Some(id),
            _ => Some(first),
        }
    }

    /// Ring successor by ascending terminal id.
    fn next_terminal(&self, current: TalId) -> TalId {
        self.terminals
            .range((
                std::ops::Bound::Excluded(current),
                std::ops::Bound::Unbounded,
            ))
            .next()
            .map(|(id, _)| *id)
            .unwrap_or_else(|| *self.terminals.keys().next().unwrap())
    }
}
