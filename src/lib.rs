//! MAC-layer core of a DVB-S2 / DVB-RCS satellite emulation testbed.
//!
//! Emulates the three roles of a geostationary bent-pipe (or regenerative)
//! satellite system:
//!
//!  - Gateway (GW), running the Network Control Centre: DAMA allocation on
//!    the return link, MODCOD-aware BBFrame scheduling on the forward link
//!  - Satellite Terminal (ST): capacity requests, allocation consumption,
//!    return-link frame scheduling
//!  - Satellite payload (SAT): per-spot carrier dispatch with emulated
//!    propagation delay, optionally regenerative
//!
//! Each role is a block made of two cooperating channels (upward: toward the
//! upper layer, downward: toward the lower layer) driven by typed events
//! from a simulated-clock runtime. The encapsulation stack, configuration
//! loading and the sat-carrier transport are external collaborators; frames
//! enter and leave the core as raw byte buffers tagged with a carrier id.

pub mod band;
pub mod config;
pub mod dama;
pub mod error;
pub mod fifo;
pub mod fmt;
pub mod frame;
pub mod fwd_sched;
pub mod gw;
pub mod ret_sched;
pub mod runtime;
pub mod sat;
pub mod standard;
pub mod st;
pub mod telemetry;

pub use config::Config;
pub use error::DvbError;

/// Terminal logical identifier. The GW has a well-known id.
pub type TalId = u16;

/// Spot identifier, fixed for the whole run.
pub type SpotId = u8;

/// Carrier identifier, unique across all spots.
pub type CarrierId = u8;

/// Logon group identifier.
pub type GroupId = u8;

/// MODCOD identifier; selects spectral efficiency and required C/N.
pub type ModcodId = u8;

/// Rate in kilobits per second.
pub type Kbps = u32;

/// Simulated time in milliseconds since the start of the run.
pub type TimeMs = u64;

/// Destination id carried by frames addressed to every terminal of a spot.
pub const BROADCAST_TAL_ID: TalId = 0xFFFF;

/// Well-known terminal id of the gateway itself.
pub const GW_TAL_ID: TalId = 0;

/// How a carrier group (or a FIFO) gains access to the return link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    /// Forward-link time-division multiplex, scheduled by the GW.
    Tdm,
    /// Demand-assigned return capacity (CRA/RBDC/VBDC/FCA).
    Dama,
    /// Random access, carried but not scheduled by this core.
    Aloha,
}

/// Whether the satellite payload decodes-and-reschedules or bent-pipes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SatelliteType {
    Transparent,
    Regenerative,
}

/// Direction of an FMT simulation instance.
///
/// Two instances of the same table are kept rather than dispatching
/// virtually on the direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDirection {
    Forward,
    Return,
}

/// The role a carrier plays inside its spot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarrierRole {
    CtrlIn,
    CtrlOut,
    DataInSt,
    DataInGw,
    DataOutSt,
    DataOutGw,
    LogonIn,
    LogonOut,
    Sof,
}

/// Encapsulation packet families understood by the schedulers.
///
/// MPEG2-TS and ATM are fixed-length and never fragmented; GSE is
/// variable-length and may be refragmented to fill a BBFrame.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PktType {
    Atm = 0,
    Mpeg = 1,
    Gse = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PktTypeOutOfRange;

impl TryFrom<u8> for PktType {
    type Error = PktTypeOutOfRange;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => PktType::Atm,
            1 => PktType::Mpeg,
            2 => PktType::Gse,
            _ => return Err(PktTypeOutOfRange),
        })
    }
}

impl PktType {
    /// Fixed on-air length, if the family has one.
    pub const fn fixed_length(&self) -> Option<usize> {
        match *self {
            PktType::Atm => Some(53),
            PktType::Mpeg => Some(188),
            PktType::Gse => None,
        }
    }
}

/// One encapsulation packet as seen by the MAC layer.
///
/// The encapsulation plug-in stack owns the real headers; the core only
/// needs the addressing fields and the raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetPacket {
    pub pkt_type: PktType,
    pub src_tal: TalId,
    pub dst_tal: TalId,
    pub qos: u8,
    pub data: Vec<u8>,
}

impl NetPacket {
    pub fn new(pkt_type: PktType, src_tal: TalId, dst_tal: TalId, qos: u8, data: Vec<u8>) -> Self {
        Self {
            pkt_type,
            src_tal,
            dst_tal,
            qos,
            data,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A burst of decapsulated packets handed to the upper layer.
pub type NetBurst = Vec<NetPacket>;
