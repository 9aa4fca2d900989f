//! Bounded MAC FIFOs with tick-in / tick-out timestamps.
//!
//! Every element remembers when it was pushed and when it becomes eligible
//! to leave; an element may only be popped once `tick_out <= now`. Satellite
//! propagation is emulated entirely through this rule.

use std::collections::VecDeque;

use crate::config::{FifoAccess, FifoConfig};
use crate::{NetPacket, TimeMs};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FifoElement<T> {
    pub payload: T,
    pub tick_in: TimeMs,
    pub tick_out: TimeMs,
}

/// A count-bounded queue of delayed elements.
///
/// The bound is on element count, not bytes: the emulated link is
/// provisioned in packets and frames.
#[derive(Debug)]
pub struct DvbFifo<T> {
    name: String,
    capacity: usize,
    queue: VecDeque<FifoElement<T>>,
    /// Elements refused because the queue was full.
    pub drop_count: u64,
}

impl<T> DvbFifo<T> {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
            queue: VecDeque::new(),
            drop_count: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Push with a delivery delay. On a full queue the payload is handed
    /// back so the caller decides whether the loss is counted upstream or
    /// here (`drop_count` is bumped either way).
    pub fn push(&mut self, payload: T, now: TimeMs, delay_ms: TimeMs) -> Result<(), T> {
        if self.queue.len() >= self.capacity {
            self.drop_count += 1;
            log::debug!("fifo {}: full ({} elements), push refused", self.name, self.capacity);
            return Err(payload);
        }
        self.queue.push_back(FifoElement {
            payload,
            tick_in: now,
            tick_out: now + delay_ms,
        });
        Ok(())
    }

    /// Reinsert an element at the head, keeping its original timestamps.
    /// Used for the unsent tail of a refragmented packet; bypasses the
    /// capacity bound since the element was already accounted for.
    pub fn push_front(&mut self, elem: FifoElement<T>) {
        self.queue.push_front(elem);
    }

    pub fn peek(&self) -> Option<&FifoElement<T>> {
        self.queue.front()
    }

    pub fn pop_front(&mut self) -> Option<FifoElement<T>> {
        self.queue.pop_front()
    }

    /// Pop the head only if its tick-out has passed.
    pub fn pop_ready(&mut self, now: TimeMs) -> Option<FifoElement<T>> {
        match self.queue.front() {
            Some(head) if head.tick_out <= now => self.queue.pop_front(),
            _ => None,
        }
    }

    /// Tick-out of the head element, if any.
    pub fn front_tick_out(&self) -> Option<TimeMs> {
        self.queue.front().map(|e| e.tick_out)
    }

    /// Drain everything regardless of tick-out. NCC-reboot recovery.
    pub fn flush(&mut self) -> Vec<T> {
        self.queue.drain(..).map(|e| e.payload).collect()
    }
}

/// A per-QoS packet FIFO with its configuration and arrival accounting,
/// as held by the schedulers on both ends of a link.
#[derive(Debug)]
pub struct QosFifo {
    pub access: FifoAccess,
    pub priority: u8,
    pub fifo: DvbFifo<NetPacket>,
    /// Bits pushed since the accounting was last read; feeds the RBDC
    /// arrival-rate estimate.
    pub arrived_bits: u64,
}

impl QosFifo {
    pub fn new(cfg: &FifoConfig) -> Self {
        Self {
            access: cfg.access,
            priority: cfg.priority,
            fifo: DvbFifo::new(cfg.name.clone(), cfg.size_pkts),
            arrived_bits: 0,
        }
    }

    /// Build one FIFO per config entry, highest priority (lowest value)
    /// first.
    pub fn build_set(cfgs: &[FifoConfig]) -> Vec<QosFifo> {
        let mut set: Vec<QosFifo> = cfgs.iter().map(QosFifo::new).collect();
        set.sort_by_key(|f| f.priority);
        set
    }

    /// Push a packet, tracking its bits for rate estimation. A refused
    /// packet is dropped here: the loss is what the emulated link shows.
    pub fn push_packet(&mut self, pkt: NetPacket, now: TimeMs) -> bool {
        let bits = pkt.len() as u64 * 8;
        match self.fifo.push(pkt, now, 0) {
            Ok(()) => {
                self.arrived_bits += bits;
                true
            }
            Err(_) => false,
        }
    }

    /// Read and reset the arrival accounting.
    pub fn take_arrived_bits(&mut self) -> u64 {
        std::mem::take(&mut self.arrived_bits)
    }
}
