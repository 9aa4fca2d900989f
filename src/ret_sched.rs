//! Return-link (DVB-RCS) frame scheduler.
//!
//! The return link carries fixed-length encapsulation only. Packing is
//! slot-based, bounded by the frame's DAMA allocation in packets; there is
//! no time-credit accounting. Frames are padded to the DVB-RCS frame size
//! when closed.

use crate::config::FifoAccess;
use crate::fifo::QosFifo;
use crate::frame::{record_len, DvbRcsFrameBuf};
use crate::telemetry::Probes;
use crate::{PktType, SpotId, TimeMs};

/// Largest on-air DVB-RCS frame in bytes.
pub const DVB_RCS_SIZE_MAX: usize = 1440;

#[derive(Debug, Default)]
pub struct ScheduleOutput {
    pub frames: Vec<Vec<u8>>,
    pub sent_pkts: u32,
    /// Packets that left FIFOs with VBDC access; the DAMA agent shrinks its
    /// outstanding-request estimate by this.
    pub vbdc_sent_pkts: u32,
}

#[derive(Debug)]
pub struct ReturnScheduler {
    spot_id: SpotId,
    pkt_type: PktType,
    probes: Probes,
}

impl ReturnScheduler {
    pub fn new(spot_id: SpotId, pkt_type: PktType, probes: Probes) -> Self {
        Self {
            spot_id,
            pkt_type,
            probes,
        }
    }

    /// Drain up to `alloc_pkts` packets from `fifos` (priority order) into
    /// DVB-RCS frames.
    pub fn schedule(
        &mut self,
        now: TimeMs,
        fifos: &mut [QosFifo],
        alloc_pkts: u32,
    ) -> ScheduleOutput {
        let mut out = ScheduleOutput::default();
        if alloc_pkts == 0 {
            return out;
        }

        let mut frame: Option<DvbRcsFrameBuf> = None;
        for qf in fifos.iter_mut() {
            if qf.access == FifoAccess::Aloha {
                // random-access traffic does not consume DAMA slots
                continue;
            }
            loop {
                if out.sent_pkts >= alloc_pkts {
                    break;
                }
                let Some(elem) = qf.fifo.pop_ready(now) else {
                    break;
                };
                let pkt = elem.payload;

                let need = record_len(&pkt);
                let current = frame.get_or_insert_with(|| {
                    DvbRcsFrameBuf::new(self.spot_id, self.pkt_type)
                });
                if need > current.free_space(DVB_RCS_SIZE_MAX) {
                    let full = frame.take().unwrap();
                    if full.num_packets() > 0 {
                        out.frames.push(full.to_bytes_padded(DVB_RCS_SIZE_MAX));
                    }
                    frame = Some(DvbRcsFrameBuf::new(self.spot_id, self.pkt_type));
                }
                frame.as_mut().unwrap().add_packet(pkt);
                out.sent_pkts += 1;
                if qf.access == FifoAccess::Vbdc {
                    out.vbdc_sent_pkts += 1;
                }
            }
            if out.sent_pkts >= alloc_pkts {
                break;
            }
        }

        if let Some(last) = frame {
            if last.num_packets() > 0 {
                out.frames.push(last.to_bytes_padded(DVB_RCS_SIZE_MAX));
            }
        }

        if out.sent_pkts > 0 {
            log::debug!(
                "ret sched: {} packets in {} frames (alloc {alloc_pkts})",
                out.sent_pkts,
                out.frames.len()
            );
        }
        self.probes.add("ret.sched_packets", out.sent_pkts as u64);
        self.probes.add("ret.frames", out.frames.len() as u64);
        out
    }
}
