//! Event demultiplex and channel glue.
//!
//! Every block is a pair of channels (upward, downward). A channel is a
//! single-threaded event consumer: it receives typed events in arrival
//! order, may arm timers, emit frames toward the lower layer, hand messages
//! to the upper layer, and share messages with its peer channel. Channels
//! of one block never touch each other's state directly; the share queue is
//! the only path between them and it preserves send order.
//!
//! Time is simulated: the runtime owns a millisecond clock that jumps from
//! event to event, which keeps every scenario deterministic regardless of
//! host load.

use std::collections::BinaryHeap;

use crate::{CarrierId, GroupId, NetBurst, SpotId, TalId, TimeMs};

/// Opaque timer identifier, allocated by each block at init.
pub type TimerId = u32;

/// Index of a registered channel inside the runtime.
pub type ChannelId = usize;

/// Tag of an inter-channel / inter-layer message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    /// A signalling frame (SoF, control) shared without queueing delay.
    Sig,
    /// Slotted-Aloha traffic, carried opaquely.
    Saloha,
    /// Channel-quality report extracted from an SAC.
    Cni,
    /// A burst of encapsulation packets.
    EncapBurst,
    /// The link came up after a logon exchange.
    LinkUp,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Frame(Vec<u8>),
    Burst(NetBurst),
    /// A burst already routed to a destination spot (regenerative SAT,
    /// upward to downward).
    SpotBurst { spot_id: SpotId, burst: NetBurst },
    Cni { tal_id: TalId, cni_db: f64 },
    LinkUp { group_id: GroupId, tal_id: TalId },
}

/// An owned message; the receiving handler consumes it exactly once.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub kind: MsgKind,
    pub body: MessageBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Message(Message),
    Timer(TimerId),
}

/// What a handler may do to the outside world. Collected per event and
/// integrated by the runtime after the handler returns, so that a failing
/// handler cannot leave half-applied side effects in the queues.
#[derive(Debug, Default)]
pub struct ChannelCtx {
    now: TimeMs,
    pub(crate) timers: Vec<(TimerId, TimeMs)>,
    pub(crate) lower_out: Vec<(CarrierId, Vec<u8>)>,
    pub(crate) upper_out: Vec<Message>,
    pub(crate) shared_out: Vec<Message>,
}

impl ChannelCtx {
    /// A context for driving a channel by hand (tests, embedding harnesses
    /// that bring their own event loop).
    pub fn at(now: TimeMs) -> Self {
        Self {
            now,
            ..Default::default()
        }
    }

    pub fn now(&self) -> TimeMs {
        self.now
    }

    /// (Re-)arm a timer relative to now. Handlers arm their periodic timer
    /// at the start of the tick so that processing time cannot accumulate
    /// drift.
    pub fn set_timer(&mut self, id: TimerId, delay_ms: TimeMs) {
        self.timers.push((id, self.now + delay_ms));
    }

    /// Emit an encoded frame on a carrier of the lower layer.
    pub fn send_frame(&mut self, carrier_id: CarrierId, frame: Vec<u8>) {
        self.lower_out.push((carrier_id, frame));
    }

    /// Hand a message to the upper layer.
    pub fn send_upper(&mut self, msg: Message) {
        self.upper_out.push(msg);
    }

    /// Share a message with the peer channel of the same block.
    pub fn share(&mut self, msg: Message) {
        self.shared_out.push(msg);
    }

    /// Drain the frames emitted toward the lower layer.
    pub fn take_lower_out(&mut self) -> Vec<(CarrierId, Vec<u8>)> {
        std::mem::take(&mut self.lower_out)
    }

    /// Drain the messages handed to the upper layer.
    pub fn take_upper_out(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.upper_out)
    }

    /// Drain the messages shared with the peer channel.
    pub fn take_shared_out(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.shared_out)
    }

    /// Timers armed by the handler, as `(id, deadline)` pairs.
    pub fn armed_timers(&self) -> &[(TimerId, TimeMs)] {
        &self.timers
    }
}

/// One channel of a block.
pub trait Channel {
    /// Handle one event. The returned status feeds statistics only; errors
    /// must not propagate (a handler drops, counts, logs and moves on).
    fn on_event(&mut self, event: Event, ctx: &mut ChannelCtx) -> bool;
}

struct Scheduled {
    at: TimeMs,
    seq: u64,
    target: ChannelId,
    event: Event,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}
impl Eq for Scheduled {}
impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; invert so the earliest (and on a tie
        // the first-enqueued) event comes out first
        (other.at, other.seq).cmp(&(self.at, self.seq))
    }
}

/// Where a frame emitted on a carrier should be delivered. A carrier is a
/// broadcast medium: every listener receives its own copy.
pub trait FrameRouter {
    /// Channels listening on this carrier, with the transport latency to
    /// each. An empty list drops the frame (unconnected carrier).
    fn route(&mut self, carrier_id: CarrierId, frame: &[u8]) -> Vec<(ChannelId, TimeMs)>;
}

/// The simulated-clock event loop driving a set of channels.
pub struct Runtime {
    queue: BinaryHeap<Scheduled>,
    now: TimeMs,
    seq: u64,
    peer: Vec<ChannelId>,
    /// Upper-layer deliveries per channel, for the harness to consume.
    pub upper: Vec<Vec<Message>>,
    /// Handlers that reported failure, for statistics.
    pub handler_failures: u64,
}

impl Runtime {
    pub fn new() -> Self {
        Self {
            queue: BinaryHeap::new(),
            now: 0,
            seq: 0,
            peer: Vec::new(),
            upper: Vec::new(),
            handler_failures: 0,
        }
    }

    pub fn now(&self) -> TimeMs {
        self.now
    }

    /// Register the two channels of a block; returns (upward, downward)
    /// ids. The ids index into the channel slice passed to [`Self::step`].
    pub fn register_block(&mut self) -> (ChannelId, ChannelId) {
        let up = self.peer.len();
        let down = up + 1;
        self.peer.push(down);
        self.peer.push(up);
        self.upper.push(Vec::new());
        self.upper.push(Vec::new());
        (up, down)
    }

    /// Enqueue an event for a channel at an absolute time.
    pub fn post_at(&mut self, at: TimeMs, target: ChannelId, event: Event) {
        let at = at.max(self.now);
        self.queue.push(Scheduled {
            at,
            seq: self.seq,
            target,
            event,
        });
        self.seq += 1;
    }

    pub fn post(&mut self, target: ChannelId, event: Event) {
        self.post_at(self.now, target, event);
    }

    /// Process one event if one is due at or before `until`. Returns false
    /// when the queue has nothing left in the window.
    pub fn step(
        &mut self,
        channels: &mut [&mut dyn Channel],
        router: &mut dyn FrameRouter,
        until: TimeMs,
    ) -> bool {
        match self.queue.peek() {
            Some(head) if head.at <= until => {}
            _ => return false,
        }
        let sched = self.queue.pop().unwrap();
        self.now = sched.at;

        let mut ctx = ChannelCtx {
            now: self.now,
            ..Default::default()
        };
        let ok = channels[sched.target].on_event(sched.event, &mut ctx);
        if !ok {
            self.handler_failures += 1;
        }

        for (id, at) in ctx.timers.drain(..) {
            self.post_at(at, sched.target, Event::Timer(id));
        }
        for msg in ctx.shared_out.drain(..) {
            let peer = self.peer[sched.target];
            self.post(peer, Event::Message(msg));
        }
        for msg in ctx.upper_out.drain(..) {
            self.upper[sched.target].push(msg);
        }
        for (carrier, frame) in ctx.lower_out.drain(..) {
            let targets = router.route(carrier, &frame);
            if targets.is_empty() {
                log::debug!("runtime: no listener on carrier {carrier}, frame dropped");
                continue;
            }
            for (target, latency) in targets {
                let at = self.now + latency;
                self.post_at(
                    at,
                    target,
                    Event::Message(Message {
                        kind: MsgKind::Sig,
                        body: MessageBody::Frame(frame.clone()),
                    }),
                );
            }
        }
        true
    }

    /// Run every event due up to and including `until`.
    pub fn run_until(
        &mut self,
        channels: &mut [&mut dyn Channel],
        router: &mut dyn FrameRouter,
        until: TimeMs,
    ) {
        while self.step(channels, router, until) {}
        self.now = self.now.max(until);
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}
