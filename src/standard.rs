//! Physical-standard reception handlers.
//!
//! One handler per transmission standard, holding the reception-side state
//! (real and last-received MODCOD for DVB-S2, the regenerative switch table
//! for DVB-RCS). The two variants share the small [`ReceptionStd`] surface
//! the blocks actually invoke.

use std::collections::BTreeMap;

use crate::error::DvbError;
use crate::frame::{BbFrame, DvbFrame, DvbRcsFrame, MsgType};
use crate::{ModcodId, NetBurst, SpotId, TalId, BROADCAST_TAL_ID};

pub trait ReceptionStd {
    /// Decode one incoming frame into a burst of encapsulation packets.
    /// A dropped (corrupted or undecodable) frame yields an empty burst.
    fn on_receive_frame(&mut self, bytes: &[u8], own_tal: Option<TalId>)
        -> Result<NetBurst, DvbError>;

    /// MODCOD of the last frame seen, decodable or not. Feeds ACM
    /// statistics.
    fn received_modcod(&self) -> ModcodId;

    /// Install the regenerative spot switch; ignored by standards without
    /// one.
    fn set_switch(&mut self, switch: BTreeMap<TalId, SpotId>, default_spot: SpotId);
}

/// Tagged variant over the two standards, picked at init.
#[derive(Debug)]
pub enum PhysicStd {
    Rcs(RcsStd),
    S2(S2Std),
}

impl ReceptionStd for PhysicStd {
    fn on_receive_frame(
        &mut self,
        bytes: &[u8],
        own_tal: Option<TalId>,
    ) -> Result<NetBurst, DvbError> {
        match self {
            PhysicStd::Rcs(std) => std.on_receive_frame(bytes, own_tal),
            PhysicStd::S2(std) => std.on_receive_frame(bytes, own_tal),
        }
    }

    fn received_modcod(&self) -> ModcodId {
        match self {
            PhysicStd::Rcs(std) => std.received_modcod(),
            PhysicStd::S2(std) => std.received_modcod(),
        }
    }

    fn set_switch(&mut self, switch: BTreeMap<TalId, SpotId>, default_spot: SpotId) {
        match self {
            PhysicStd::Rcs(std) => std.set_switch(switch, default_spot),
            PhysicStd::S2(std) => std.set_switch(switch, default_spot),
        }
    }
}

/// DVB-RCS reception: bursts of fixed-size packets, plus the spot switch
/// used on a regenerative satellite.
#[derive(Debug, Default)]
pub struct RcsStd {
    received_modcod: ModcodId,
    switch: BTreeMap<TalId, SpotId>,
    default_spot: SpotId,
    has_switch: bool,
}

impl RcsStd {
    pub fn new() -> Self {
        Self::default()
    }

    /// Destination spot for a packet, when a switch is installed.
    pub fn switch_spot(&self, dst_tal: TalId) -> Option<SpotId> {
        if !self.has_switch {
            return None;
        }
        Some(
            self.switch
                .get(&dst_tal)
                .copied()
                .unwrap_or(self.default_spot),
        )
    }
}

impl ReceptionStd for RcsStd {
    fn on_receive_frame(
        &mut self,
        bytes: &[u8],
        own_tal: Option<TalId>,
    ) -> Result<NetBurst, DvbError> {
        let hdr = DvbFrame::from_bytes(bytes)?;
        if hdr.msg_type() == MsgType::Corrupted {
            // emulated physical loss; nothing to decode
            return Ok(NetBurst::new());
        }
        let frame = DvbRcsFrame::from_bytes(bytes)?;
        let mut burst = frame.packets()?;
        if let Some(me) = own_tal {
            burst.retain(|p| p.dst_tal == me || p.dst_tal == BROADCAST_TAL_ID);
        }
        log::debug!("rcs std: burst of {} packets received", burst.len());
        Ok(burst)
    }

    fn received_modcod(&self) -> ModcodId {
        self.received_modcod
    }

    fn set_switch(&mut self, switch: BTreeMap<TalId, SpotId>, default_spot: SpotId) {
        self.switch = switch;
        self.default_spot = default_spot;
        self.has_switch = true;
    }
}

/// DVB-S2 reception: BBFrames, real-MODCOD advertisement options and the
/// robustness check emulating physical-layer loss.
#[derive(Debug)]
pub struct S2Std {
    /// MODCOD this receiver can currently decode, as learnt from
    /// advertisements (or the phy-layer feedback when enabled).
    real_modcod: ModcodId,
    received_modcod: ModcodId,
}

impl S2Std {
    pub fn new(initial_real_modcod: ModcodId) -> Self {
        Self {
            real_modcod: initial_real_modcod,
            received_modcod: initial_real_modcod,
        }
    }

    pub fn real_modcod(&self) -> ModcodId {
        self.real_modcod
    }

    /// Physical-layer feedback path: the channel dictates what is
    /// decodable, overriding advertisements.
    pub fn set_real_modcod(&mut self, modcod: ModcodId) {
        self.real_modcod = modcod;
    }
}

impl ReceptionStd for S2Std {
    fn on_receive_frame(
        &mut self,
        bytes: &[u8],
        own_tal: Option<TalId>,
    ) -> Result<NetBurst, DvbError> {
        let hdr = DvbFrame::from_bytes(bytes)?;
        let corrupted = hdr.msg_type() == MsgType::Corrupted;
        let frame = if corrupted {
            BbFrame::from_corrupted(bytes)?
        } else {
            BbFrame::from_bytes(bytes)?
        };

        // the robustness check runs against the value before any update
        // carried by this very frame
        let real_before = self.real_modcod;

        if let Some(me) = own_tal {
            for opt in frame.options() {
                if opt.tal_id == me {
                    log::debug!("s2 std: real modcod updated to {}", opt.real_modcod);
                    self.real_modcod = opt.real_modcod;
                }
            }
        }

        self.received_modcod = frame.used_modcod();

        if corrupted {
            return Ok(NetBurst::new());
        }
        if frame.used_modcod() > real_before {
            // not robust enough for this receiver: emulate a lost frame
            log::debug!(
                "s2 std: frame at modcod {} above real modcod {}, dropped",
                frame.used_modcod(),
                real_before
            );
            return Ok(NetBurst::new());
        }

        let mut burst = frame.packets()?;
        if let Some(me) = own_tal {
            burst.retain(|p| p.dst_tal == me || p.dst_tal == BROADCAST_TAL_ID);
        }
        Ok(burst)
    }

    fn received_modcod(&self) -> ModcodId {
        self.received_modcod
    }

    fn set_switch(&mut self, _switch: BTreeMap<TalId, SpotId>, _default_spot: SpotId) {
        // no switching on the forward standard
    }
}
