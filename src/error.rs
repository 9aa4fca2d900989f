use thiserror::Error;

use crate::frame::FrameParseError;
use crate::{CarrierId, TalId};

/// Top-level error kinds of the emulation core.
///
/// Handlers never propagate these to the runtime; each handler catches,
/// counts and logs, then reports a plain boolean status. `Internal` is the
/// exception: the block exits so that the run is invalid rather than
/// silently corrupt.
#[derive(Error, Debug)]
pub enum DvbError {
    /// Missing or malformed configuration, fatal at init.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Malformed or out-of-context frame; dropped, counted, not fatal.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// FIFO full on push; the upstream decides to drop.
    #[error("fifo {fifo} full ({capacity} elements)")]
    ResourceExhausted { fifo: String, capacity: usize },

    /// A frame references a terminal with no live record.
    #[error("unknown terminal {0}")]
    UnknownTerminal(TalId),

    /// Invariant violation; the block must exit.
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no spot defined")]
    NoSpot,
    #[error("carrier {0} assigned twice")]
    DuplicateCarrier(CarrierId),
    #[error("{name} duration must not be zero")]
    ZeroDuration { name: &'static str },
    #[error("obr period must not be zero")]
    ZeroObrPeriod,
    #[error("fifo list is empty")]
    NoFifo,
    #[error("modcod {modcod}: BBFrame duration {duration_us}us exceeds forward frame duration {frame_us}us")]
    BbframeTooLong {
        modcod: u8,
        duration_us: u64,
        frame_us: u64,
    },
    #[error("modcod definition table is empty")]
    NoModcod,
    #[error("fmt scenario for column {0} is missing")]
    MissingFmtColumn(usize),
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("frame parse failed: {0:?}")]
    Malformed(FrameParseError),
    #[error("unknown carrier {0}")]
    UnknownCarrier(CarrierId),
    #[error("unexpected message type {msg_type} in {context}")]
    UnexpectedMessage { msg_type: u8, context: &'static str },
    #[error("capacity request from unregistered terminal {0}")]
    UnknownSacSource(TalId),
}

impl From<FrameParseError> for DvbError {
    fn from(other: FrameParseError) -> Self {
        DvbError::Protocol(ProtocolError::Malformed(other))
    }
}

/// Error of a PEP resource command that would exceed a terminal's
/// logon-time bounds.
#[derive(Error, Debug)]
#[error("terminal {tal_id}: requested {requested} exceeds {bound} {limit}")]
pub struct ResourceConflict {
    pub tal_id: TalId,
    pub requested: u32,
    pub limit: u32,
    pub bound: &'static str,
}
