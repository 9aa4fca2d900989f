//! MODCOD-aware BBFrame scheduler for the forward (DVB-S2) link.
//!
//! One in-progress BBFrame is kept per MODCOD; frames complete in the order
//! they were first filled. Air time is accounted in integer microseconds:
//! each tick grants the forward frame duration on top of the carry from the
//! previous tick, and opening a BBFrame reserves that frame's duration.
//! Unused credit below one frame duration carries over, which lets short
//! BBFrames on robust MODCODs reach their full rate without ever exceeding
//! the time budget.

use std::collections::BTreeMap;

use crate::fifo::QosFifo;
use crate::fmt::{FmtSimulation, ModcodDefinitionTable};
use crate::frame::{record_len, BbFrameBuf, RealModcodOption, PKT_RECORD_OVERHEAD};
use crate::telemetry::Probes;
use crate::{ModcodId, NetPacket, PktType, SpotId, TimeMs, BROADCAST_TAL_ID};

/// Below this many payload bytes a refragmented tail is dropped instead of
/// being carried to the next BBFrame.
pub const MIN_FRAGMENT_BYTES: usize = 3;

#[derive(Debug)]
pub struct ForwardScheduler {
    spot_id: SpotId,
    pkt_type: PktType,
    defs: ModcodDefinitionTable,
    bandwidth_khz: u32,
    frame_duration_us: u64,
    remaining_credit_us: u64,

    incomplete: BTreeMap<ModcodId, BbFrameBuf>,
    /// MODCODs in first-fill order; completion is FIFO along this list.
    fill_order: Vec<ModcodId>,

    probes: Probes,
}

enum Stop {
    /// Credit exhausted; the pending packet went back to its FIFO.
    Credit,
    /// The packet was fully placed (or dropped); keep draining.
    Continue,
}

impl ForwardScheduler {
    pub fn new(
        spot_id: SpotId,
        pkt_type: PktType,
        defs: ModcodDefinitionTable,
        bandwidth_khz: u32,
        frame_duration_ms: TimeMs,
        probes: Probes,
    ) -> Self {
        Self {
            spot_id,
            pkt_type,
            defs,
            bandwidth_khz,
            frame_duration_us: frame_duration_ms * 1000,
            remaining_credit_us: 0,
            incomplete: BTreeMap::new(),
            fill_order: Vec::new(),
            probes,
        }
    }

    pub fn remaining_credit_us(&self) -> u64 {
        self.remaining_credit_us
    }

    /// Pack everything eligible in `fifos` (priority order) into BBFrames.
    /// Complete frames are appended to `complete`, encoded and padded.
    pub fn schedule(
        &mut self,
        now: TimeMs,
        fifos: &mut [QosFifo],
        fmt: &mut FmtSimulation,
        complete: &mut Vec<Vec<u8>>,
    ) {
        if fifos.iter().all(|f| f.fifo.is_empty()) {
            // nothing to send; the sub-frame carry survives for the next
            // tick, idle grants do not accumulate
            return;
        }

        let carried_us = self.remaining_credit_us;
        let mut credit_us = self.frame_duration_us + carried_us;
        self.remaining_credit_us = 0;
        log::debug!("fwd sched: tick at {now} ms, credit {credit_us} us ({carried_us} us carried)");

        let mut sent_packets = 0usize;
        'fifos: for qf in fifos.iter_mut() {
            loop {
                match qf.fifo.peek() {
                    None => break,
                    Some(head) if head.tick_out > now => break,
                    Some(_) => {}
                }
                let elem = qf.fifo.pop_front().unwrap();
                match self.place_packet(elem.payload, &mut credit_us, fmt, qf, complete) {
                    Stop::Credit => break 'fifos,
                    Stop::Continue => sent_packets += 1,
                }
            }
        }

        // every open frame already paid its air time when it was opened
        self.flush_incomplete(complete);

        // idle grants are lost air time, not bankable credit: a tick that
        // emitted nothing keeps only its previous carry, and the carry
        // never reaches a full frame duration
        self.remaining_credit_us = if credit_us == self.frame_duration_us + carried_us {
            carried_us
        } else {
            credit_us.min(self.frame_duration_us - 1)
        };

        if sent_packets > 0 {
            log::debug!(
                "fwd sched: {sent_packets} packets scheduled, {} frames complete, \
                 {} us credit left",
                complete.len(),
                self.remaining_credit_us
            );
        }
        self.probes.add("fwd.sched_packets", sent_packets as u64);
    }

    /// MODCOD to encode with for a destination, honouring advertisement:
    /// an unadvertised change keeps transmitting at the previous MODCOD and
    /// rides the new one in a header option.
    fn select_modcod(&self, dst: crate::TalId, fmt: &FmtSimulation) -> Option<(ModcodId, bool)> {
        if dst == BROADCAST_TAL_ID {
            // everyone must decode broadcast traffic
            return Some((self.defs.lowest_id(), false));
        }
        match fmt.is_advertised(dst)? {
            true => Some((fmt.current_modcod(dst)?, false)),
            false => Some((fmt.previous_modcod(dst)?, true)),
        }
    }

    fn place_packet(
        &mut self,
        mut pkt: NetPacket,
        credit_us: &mut u64,
        fmt: &mut FmtSimulation,
        qf: &mut QosFifo,
        complete: &mut Vec<Vec<u8>>,
    ) -> Stop {
        let dst = pkt.dst_tal;
        let Some((modcod, advertise)) = self.select_modcod(dst, fmt) else {
            log::warn!("fwd sched: packet for unregistered terminal {dst}, dropped");
            self.probes.incr("fwd.unknown_terminal_drops");
            return Stop::Continue;
        };
        let Some(frame_size) = self.defs.bbframe_bytes(modcod) else {
            log::warn!("fwd sched: no definition for modcod {modcod}, packet dropped");
            self.probes.incr("fwd.unknown_modcod_drops");
            return Stop::Continue;
        };
        let duration_us = self
            .defs
            .bbframe_duration_us(modcod, self.bandwidth_khz)
            .unwrap_or(self.frame_duration_us);

        if !self.open_frame(modcod, duration_us, credit_us) {
            qf.fifo.push_front(crate::fifo::FifoElement {
                payload: pkt,
                tick_in: 0,
                tick_out: 0,
            });
            return Stop::Credit;
        }
        if advertise {
            let real = fmt.current_modcod(dst).unwrap_or(modcod);
            let frame = self.incomplete.get_mut(&modcod).unwrap();
            if !frame.has_option_for(dst) {
                frame.add_option(RealModcodOption {
                    tal_id: dst,
                    real_modcod: real,
                });
                fmt.set_advertised(dst);
            }
        }

        loop {
            let frame = self.incomplete.get_mut(&modcod).unwrap();
            let free = frame.free_space(frame_size);
            let need = record_len(&pkt);
            if need <= free {
                frame.add_packet(pkt);
                return Stop::Continue;
            }

            match self.pkt_type.fixed_length() {
                Some(_) => {
                    // constant-length encapsulation cannot be fragmented:
                    // pad this frame out and retry in a fresh one
                    self.close_frame(modcod, frame_size, complete);
                    if !self.open_frame(modcod, duration_us, credit_us) {
                        qf.fifo.push_front(crate::fifo::FifoElement {
                            payload: pkt,
                            tick_in: 0,
                            tick_out: 0,
                        });
                        return Stop::Credit;
                    }
                    let frame = self.incomplete.get_mut(&modcod).unwrap();
                    if need > frame.free_space(frame_size) {
                        log::error!(
                            "fwd sched: packet of {} bytes can never fit a modcod {modcod} \
                             frame, dropped",
                            pkt.len()
                        );
                        self.probes.incr("fwd.oversized_drops");
                        return Stop::Continue;
                    }
                }
                None => {
                    // refragmentable encapsulation: fill the remaining room
                    // exactly, the tail goes back to the head of the FIFO
                    if free <= PKT_RECORD_OVERHEAD + MIN_FRAGMENT_BYTES {
                        self.close_frame(modcod, frame_size, complete);
                        if !self.open_frame(modcod, duration_us, credit_us) {
                            qf.fifo.push_front(crate::fifo::FifoElement {
                                payload: pkt,
                                tick_in: 0,
                                tick_out: 0,
                            });
                            return Stop::Credit;
                        }
                        continue;
                    }
                    let head_len = free - PKT_RECORD_OVERHEAD;
                    let tail_data = pkt.data.split_off(head_len);
                    let tail = NetPacket::new(pkt.pkt_type, pkt.src_tal, pkt.dst_tal, pkt.qos, tail_data);
                    let frame = self.incomplete.get_mut(&modcod).unwrap();
                    frame.add_packet(pkt);
                    self.close_frame(modcod, frame_size, complete);

                    if tail.len() < MIN_FRAGMENT_BYTES {
                        log::debug!("fwd sched: {} byte tail below fragment minimum, dropped", tail.len());
                        self.probes.incr("fwd.frag_losses");
                        return Stop::Continue;
                    }
                    if !self.open_frame(modcod, duration_us, credit_us) {
                        qf.fifo.push_front(crate::fifo::FifoElement {
                            payload: tail,
                            tick_in: 0,
                            tick_out: 0,
                        });
                        return Stop::Credit;
                    }
                    pkt = tail;
                }
            }
        }
    }

    /// Make sure an in-progress frame exists for `modcod`, reserving its
    /// air time out of the credit. False when the credit cannot afford it.
    fn open_frame(&mut self, modcod: ModcodId, duration_us: u64, credit_us: &mut u64) -> bool {
        if self.incomplete.contains_key(&modcod) {
            return true;
        }
        if *credit_us < duration_us {
            log::debug!(
                "fwd sched: {credit_us} us left, too few for a modcod {modcod} frame \
                 ({duration_us} us); carried to the next tick"
            );
            return false;
        }
        *credit_us -= duration_us;
        self.incomplete
            .insert(modcod, BbFrameBuf::new(self.spot_id, modcod, self.pkt_type));
        if !self.fill_order.contains(&modcod) {
            self.fill_order.push(modcod);
        }
        true
    }

    fn close_frame(&mut self, modcod: ModcodId, frame_size: usize, complete: &mut Vec<Vec<u8>>) {
        if let Some(frame) = self.incomplete.remove(&modcod) {
            if frame.num_packets() > 0 {
                complete.push(frame.to_bytes_padded(frame_size));
                self.probes.incr("fwd.bbframes");
            }
            self.fill_order.retain(|m| *m != modcod);
        }
    }

    /// Close every open frame, first-fill order, at the end of a tick.
    /// No frame survives to the next tick and none is emitted empty.
    fn flush_incomplete(&mut self, complete: &mut Vec<Vec<u8>>) {
        let order = std::mem::take(&mut self.fill_order);
        for modcod in order {
            if let Some(frame) = self.incomplete.remove(&modcod) {
                if frame.num_packets() > 0 {
                    let frame_size = self
                        .defs
                        .bbframe_bytes(modcod)
                        .unwrap_or_else(|| frame.total_len());
                    complete.push(frame.to_bytes_padded(frame_size));
                    self.probes.incr("fwd.bbframes");
                }
            }
        }
        self.incomplete.clear();
    }
}
