//! On-wire frames of the emulated DVB network, providing encoding and decoding.
//!
//! Every frame starts with the common header:
//!
//! ```norust
//!  1        | 2          | 1       | 1
//! msg_type  | msg_length | spot_id | carrier_id
//! ```
//!
//! `msg_length` covers the whole frame, header included. All multi-byte
//! fields are network byte order. Decoding is zero-copy: each frame type is
//! a view over a byte slice with accessor methods, paired with an owned
//! builder (`*Buf`) for the emitting side.
//!
//! Encapsulation packets cross the core as length-delimited records inside
//! BBFrame and DVB-RCS payloads:
//!
//! ```norust
//!  2        | 2        | 1    | 2    | n
//!  dst_tal  | src_tal  | qos  | len  | data
//! ```
//!
//! Real ATM/MPEG/GSE headers carry the addressing themselves; the record
//! header stands in for them so that the encapsulation stack stays an
//! external plug-in.

use modular_bitfield::prelude::*;

use crate::{CarrierId, ModcodId, NetPacket, PktType, SpotId, TalId};

/// Length of the common header.
pub const DVB_HDR_LEN: usize = 5;

/// Per-packet record overhead inside a frame payload.
pub const PKT_RECORD_OVERHEAD: usize = 7;

/// Message type codes. Stable across a build; the values below are the ones
/// every role of the testbed is compiled with.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    DvbBurst = 1,
    BbFrame = 2,
    Corrupted = 3,
    Sac = 4,
    Ttp = 5,
    Sof = 6,
    LogonReq = 7,
    LogonResp = 8,
    Logoff = 9,
    SalohaData = 10,
    SalohaCtrl = 11,
    Sync = 12,
    Cni = 13,
}

impl TryFrom<u8> for MsgType {
    type Error = FrameParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use MsgType::*;
        Ok(match value {
            1 => DvbBurst,
            2 => BbFrame,
            3 => Corrupted,
            4 => Sac,
            5 => Ttp,
            6 => Sof,
            7 => LogonReq,
            8 => LogonResp,
            9 => Logoff,
            10 => SalohaData,
            11 => SalohaCtrl,
            12 => Sync,
            13 => Cni,
            _ => return Err(FrameParseError::UnknownMsgType { msg_type: value }),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameParseError {
    SmallerThanMinSize { have: usize, need: usize },
    LengthFieldMismatch { field: usize, actual: usize },
    UnknownMsgType { msg_type: u8 },
    UnexpectedMsgType { have: u8, want: u8 },
    BadPktType { pkt_type: u8 },
    TruncatedEntries { have: usize, need: usize },
    TruncatedPacketRecord { offset: usize },
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_be_bytes(bytes[at..at + 2].try_into().unwrap())
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

/// Check the common header of `bytes` and the exact frame type.
fn check_frame(bytes: &[u8], want: MsgType, min_len: usize) -> Result<(), FrameParseError> {
    let have = bytes.len();
    if have < min_len {
        return Err(FrameParseError::SmallerThanMinSize {
            have,
            need: min_len,
        });
    }
    let field = read_u16(bytes, 1) as usize;
    if field != have {
        return Err(FrameParseError::LengthFieldMismatch {
            field,
            actual: have,
        });
    }
    if bytes[0] != want as u8 {
        return Err(FrameParseError::UnexpectedMsgType {
            have: bytes[0],
            want: want as u8,
        });
    }
    Ok(())
}

fn push_header(out: &mut Vec<u8>, msg_type: MsgType, spot_id: SpotId, carrier_id: CarrierId) {
    out.push(msg_type as u8);
    put_u16(out, 0); // patched by finish_header
    out.push(spot_id);
    out.push(carrier_id);
}

fn finish_header(out: &mut Vec<u8>) {
    let len = out.len() as u16;
    out[1..3].copy_from_slice(&len.to_be_bytes());
}

/// Untyped view over any frame; used to demultiplex on `msg_type` before
/// handing the bytes to the typed views.
#[derive(Clone, Copy)]
pub struct DvbFrame<'a> {
    bytes: &'a [u8],
}

impl<'a> DvbFrame<'a> {
    pub fn from_bytes(bytes: &'a [u8]) -> Result<Self, FrameParseError> {
        let have = bytes.len();
        if have < DVB_HDR_LEN {
            return Err(FrameParseError::SmallerThanMinSize {
                have,
                need: DVB_HDR_LEN,
            });
        }
        let field = read_u16(bytes, 1) as usize;
        if field != have {
            return Err(FrameParseError::LengthFieldMismatch {
                field,
                actual: have,
            });
        }
        // reject unknown types early so every later dispatch is exhaustive
        MsgType::try_from(bytes[0])?;
        Ok(Self { bytes })
    }

    pub fn msg_type(&self) -> MsgType {
        MsgType::try_from(self.bytes[0]).unwrap()
    }

    pub fn msg_length(&self) -> u16 {
        read_u16(self.bytes, 1)
    }

    pub fn spot_id(&self) -> SpotId {
        self.bytes[3]
    }

    pub fn carrier_id(&self) -> CarrierId {
        self.bytes[4]
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[DVB_HDR_LEN..]
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }
}

/// Rewrite the carrier id of an already-encoded frame. Used by the SAT when
/// a frame leaves on a different carrier than it arrived on.
pub fn set_carrier_id(frame: &mut [u8], carrier_id: CarrierId) {
    if frame.len() >= DVB_HDR_LEN {
        frame[4] = carrier_id;
    }
}

/// Tag an already-encoded frame as corrupted by the physical layer. The
/// original type is lost; the body is kept so that receivers can still read
/// ACM fields for statistics.
pub fn mark_corrupted(frame: &mut [u8]) {
    if frame.len() >= DVB_HDR_LEN {
        frame[0] = MsgType::Corrupted as u8;
    }
}

/// Convert a C/N value in dB to the Q8.8 fixed point carried in SAC frames.
pub fn cni_to_q8(cni_db: f64) -> i16 {
    (cni_db * 256.0).round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
}

pub fn q8_to_cni(q8: i16) -> f64 {
    q8 as f64 / 256.0
}

/*
 * Start-of-Frame beacon
 */

/// ```norust
/// hdr | super_frame_count: u16
/// ```
#[derive(Clone, Copy)]
pub struct Sof<'a> {
    bytes: &'a [u8],
}

impl<'a> Sof<'a> {
    pub const LEN: usize = DVB_HDR_LEN + 2;

    pub fn from_bytes(bytes: &'a [u8]) -> Result<Self, FrameParseError> {
        check_frame(bytes, MsgType::Sof, Self::LEN)?;
        Ok(Self { bytes })
    }

    pub fn sfn(&self) -> u16 {
        read_u16(self.bytes, DVB_HDR_LEN)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SofBuf {
    pub spot_id: SpotId,
    pub carrier_id: CarrierId,
    pub sfn: u16,
}

impl SofBuf {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Sof::LEN);
        push_header(&mut out, MsgType::Sof, self.spot_id, self.carrier_id);
        put_u16(&mut out, self.sfn);
        finish_header(&mut out);
        out
    }
}

/// Periodic synchronisation burst sent by a running terminal so the NCC
/// sees it alive between capacity requests.
///
/// ```norust
/// hdr | tal_id: u16
/// ```
#[derive(Clone, Copy)]
pub struct Sync<'a> {
    bytes: &'a [u8],
}

impl<'a> Sync<'a> {
    pub const LEN: usize = DVB_HDR_LEN + 2;

    pub fn from_bytes(bytes: &'a [u8]) -> Result<Self, FrameParseError> {
        check_frame(bytes, MsgType::Sync, Self::LEN)?;
        Ok(Self { bytes })
    }

    pub fn tal_id(&self) -> TalId {
        read_u16(self.bytes, DVB_HDR_LEN)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncBuf {
    pub spot_id: SpotId,
    pub carrier_id: CarrierId,
    pub tal_id: TalId,
}

impl SyncBuf {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Sync::LEN);
        push_header(&mut out, MsgType::Sync, self.spot_id, self.carrier_id);
        put_u16(&mut out, self.tal_id);
        finish_header(&mut out);
        out
    }
}

/*
 * Session logon
 */

/// ```norust
/// hdr | mac: u16 | cra_kbps: u16 | max_rbdc_kbps: u16 | max_vbdc_pkts: u16
/// ```
#[derive(Clone, Copy)]
pub struct LogonRequest<'a> {
    bytes: &'a [u8],
}

impl<'a> LogonRequest<'a> {
    pub const LEN: usize = DVB_HDR_LEN + 8;

    pub fn from_bytes(bytes: &'a [u8]) -> Result<Self, FrameParseError> {
        check_frame(bytes, MsgType::LogonReq, Self::LEN)?;
        Ok(Self { bytes })
    }

    pub fn mac(&self) -> TalId {
        read_u16(self.bytes, DVB_HDR_LEN)
    }

    pub fn cra_kbps(&self) -> u16 {
        read_u16(self.bytes, DVB_HDR_LEN + 2)
    }

    pub fn max_rbdc_kbps(&self) -> u16 {
        read_u16(self.bytes, DVB_HDR_LEN + 4)
    }

    pub fn max_vbdc_pkts(&self) -> u16 {
        read_u16(self.bytes, DVB_HDR_LEN + 6)
    }

    pub fn to_owned(&self) -> LogonRequestBuf {
        LogonRequestBuf {
            spot_id: self.bytes[3],
            carrier_id: self.bytes[4],
            mac: self.mac(),
            cra_kbps: self.cra_kbps(),
            max_rbdc_kbps: self.max_rbdc_kbps(),
            max_vbdc_pkts: self.max_vbdc_pkts(),
        }
    }
}

impl<'a> core::fmt::Debug for LogonRequest<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LogonRequest")
            .field("mac", &self.mac())
            .field("cra_kbps", &self.cra_kbps())
            .field("max_rbdc_kbps", &self.max_rbdc_kbps())
            .field("max_vbdc_pkts", &self.max_vbdc_pkts())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogonRequestBuf {
    pub spot_id: SpotId,
    pub carrier_id: CarrierId,
    pub mac: TalId,
    pub cra_kbps: u16,
    pub max_rbdc_kbps: u16,
    pub max_vbdc_pkts: u16,
}

impl LogonRequestBuf {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(LogonRequest::LEN);
        push_header(&mut out, MsgType::LogonReq, self.spot_id, self.carrier_id);
        put_u16(&mut out, self.mac);
        put_u16(&mut out, self.cra_kbps);
        put_u16(&mut out, self.max_rbdc_kbps);
        put_u16(&mut out, self.max_vbdc_pkts);
        finish_header(&mut out);
        out
    }
}

/// ```norust
/// hdr | mac: u16 | group_id: u8 | logon_id: u16
/// ```
#[derive(Clone, Copy)]
pub struct LogonResponse<'a> {
    bytes: &'a [u8],
}

impl<'a> LogonResponse<'a> {
    pub const LEN: usize = DVB_HDR_LEN + 5;

    pub fn from_bytes(bytes: &'a [u8]) -> Result<Self, FrameParseError> {
        check_frame(bytes, MsgType::LogonResp, Self::LEN)?;
        Ok(Self { bytes })
    }

    pub fn mac(&self) -> TalId {
        read_u16(self.bytes, DVB_HDR_LEN)
    }

    pub fn group_id(&self) -> u8 {
        self.bytes[DVB_HDR_LEN + 2]
    }

    pub fn logon_id(&self) -> TalId {
        read_u16(self.bytes, DVB_HDR_LEN + 3)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogonResponseBuf {
    pub spot_id: SpotId,
    pub carrier_id: CarrierId,
    pub mac: TalId,
    pub group_id: u8,
    pub logon_id: TalId,
}

impl LogonResponseBuf {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(LogonResponse::LEN);
        push_header(&mut out, MsgType::LogonResp, self.spot_id, self.carrier_id);
        put_u16(&mut out, self.mac);
        out.push(self.group_id);
        put_u16(&mut out, self.logon_id);
        finish_header(&mut out);
        out
    }
}

/// ```norust
/// hdr | mac: u16
/// ```
#[derive(Clone, Copy)]
pub struct Logoff<'a> {
    bytes: &'a [u8],
}

impl<'a> Logoff<'a> {
    pub const LEN: usize = DVB_HDR_LEN + 2;

    pub fn from_bytes(bytes: &'a [u8]) -> Result<Self, FrameParseError> {
        check_frame(bytes, MsgType::Logoff, Self::LEN)?;
        Ok(Self { bytes })
    }

    pub fn mac(&self) -> TalId {
        read_u16(self.bytes, DVB_HDR_LEN)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogoffBuf {
    pub spot_id: SpotId,
    pub carrier_id: CarrierId,
    pub mac: TalId,
}

impl LogoffBuf {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Logoff::LEN);
        push_header(&mut out, MsgType::Logoff, self.spot_id, self.carrier_id);
        put_u16(&mut out, self.mac);
        finish_header(&mut out);
        out
    }
}

/*
 * Satellite Access Control (capacity requests + CNI)
 */

/// Capacity request kind, 2 bits on the wire.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, BitfieldSpecifier)]
#[bits = 2]
pub enum CrKind {
    Rbdc = 0,
    Vbdc = 1,
    Avbdc = 2,
    Fca = 3,
}

/// Flag byte of one capacity-request entry.
#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrFlags {
    #[bits = 2]
    pub cr_type: CrKind,
    pub wrap_count: B6,
}

/// One decoded capacity-request entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrEntry {
    pub cr_type: CrKind,
    pub wrap_count: u8,
    /// kbits/s for RBDC, packets for VBDC/AVBDC/FCA.
    pub value: u16,
}

const CR_ENTRY_LEN: usize = 3;

/// ```norust
/// hdr | tal_id: u16 | request_count: u8 | (flags: u8 | value: u16) * count | cni_db_q8: i16
/// ```
#[derive(Clone, Copy)]
pub struct Sac<'a> {
    bytes: &'a [u8],
}

impl<'a> Sac<'a> {
    pub const MIN_LEN: usize = DVB_HDR_LEN + 3 + 2;

    pub fn from_bytes(bytes: &'a [u8]) -> Result<Self, FrameParseError> {
        check_frame(bytes, MsgType::Sac, Self::MIN_LEN)?;
        let count = bytes[DVB_HDR_LEN + 2] as usize;
        let need = Self::MIN_LEN + count * CR_ENTRY_LEN;
        if bytes.len() != need {
            return Err(FrameParseError::TruncatedEntries {
                have: bytes.len(),
                need,
            });
        }
        Ok(Self { bytes })
    }

    pub fn tal_id(&self) -> TalId {
        read_u16(self.bytes, DVB_HDR_LEN)
    }

    pub fn request_count(&self) -> usize {
        self.bytes[DVB_HDR_LEN + 2] as usize
    }

    pub fn entry(&self, i: usize) -> CrEntry {
        let at = DVB_HDR_LEN + 3 + i * CR_ENTRY_LEN;
        let flags = CrFlags::from_bytes([self.bytes[at]]);
        CrEntry {
            cr_type: flags.cr_type(),
            wrap_count: flags.wrap_count(),
            value: read_u16(self.bytes, at + 1),
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = CrEntry> + '_ {
        (0..self.request_count()).map(move |i| self.entry(i))
    }

    pub fn cni_q8(&self) -> i16 {
        read_u16(self.bytes, self.bytes.len() - 2) as i16
    }

    pub fn to_owned(&self) -> SacBuf {
        SacBuf {
            spot_id: self.bytes[3],
            carrier_id: self.bytes[4],
            tal_id: self.tal_id(),
            entries: self.entries().collect(),
            cni_q8: self.cni_q8(),
        }
    }
}

impl<'a> core::fmt::Debug for Sac<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Sac")
            .field("tal_id", &self.tal_id())
            .field("entries", &self.entries().collect::<Vec<_>>())
            .field("cni_q8", &self.cni_q8())
            .finish()
    }
}

/// Overwrite the CNI of an encoded SAC in place. The regenerative SAT uses
/// this to replace the terminal's downlink estimate with the measured
/// uplink value before forwarding to the NCC.
pub fn sac_set_cni(frame: &mut [u8], cni_q8: i16) {
    let len = frame.len();
    if len >= Sac::MIN_LEN && frame[0] == MsgType::Sac as u8 {
        frame[len - 2..].copy_from_slice(&cni_q8.to_be_bytes());
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SacBuf {
    pub spot_id: SpotId,
    pub carrier_id: CarrierId,
    pub tal_id: TalId,
    pub entries: Vec<CrEntry>,
    pub cni_q8: i16,
}

impl SacBuf {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Sac::MIN_LEN + self.entries.len() * CR_ENTRY_LEN);
        push_header(&mut out, MsgType::Sac, self.spot_id, self.carrier_id);
        put_u16(&mut out, self.tal_id);
        out.push(self.entries.len() as u8);
        for e in &self.entries {
            let flags = CrFlags::new()
                .with_cr_type(e.cr_type)
                .with_wrap_count(e.wrap_count);
            out.push(flags.into_bytes()[0]);
            put_u16(&mut out, e.value);
        }
        put_u16(&mut out, self.cni_q8 as u16);
        finish_header(&mut out);
        out
    }
}

/*
 * Terminal burst Time Plan
 */

/// Allocation of one terminal for the coming superframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtpEntry {
    pub tal_id: TalId,
    pub pkts: u16,
}

const TTP_ENTRY_LEN: usize = 4;

/// ```norust
/// hdr | super_frame_count: u16 | entry_count: u16 | (tal_id: u16 | pkts: u16) * count
/// ```
#[derive(Clone, Copy)]
pub struct Ttp<'a> {
    bytes: &'a [u8],
}

impl<'a> Ttp<'a> {
    pub const MIN_LEN: usize = DVB_HDR_LEN + 4;

    pub fn from_bytes(bytes: &'a [u8]) -> Result<Self, FrameParseError> {
        check_frame(bytes, MsgType::Ttp, Self::MIN_LEN)?;
        let count = read_u16(bytes, DVB_HDR_LEN + 2) as usize;
        let need = Self::MIN_LEN + count * TTP_ENTRY_LEN;
        if bytes.len() != need {
            return Err(FrameParseError::TruncatedEntries {
                have: bytes.len(),
                need,
            });
        }
        Ok(Self { bytes })
    }

    pub fn sfn(&self) -> u16 {
        read_u16(self.bytes, DVB_HDR_LEN)
    }

    pub fn entry_count(&self) -> usize {
        read_u16(self.bytes, DVB_HDR_LEN + 2) as usize
    }

    pub fn entry(&self, i: usize) -> TtpEntry {
        let at = Self::MIN_LEN + i * TTP_ENTRY_LEN;
        TtpEntry {
            tal_id: read_u16(self.bytes, at),
            pkts: read_u16(self.bytes, at + 2),
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = TtpEntry> + '_ {
        (0..self.entry_count()).map(move |i| self.entry(i))
    }

    /// Allocation for one terminal, if it appears in the plan.
    pub fn allocation_for(&self, tal_id: TalId) -> Option<u16> {
        self.entries().find(|e| e.tal_id == tal_id).map(|e| e.pkts)
    }
}

impl<'a> core::fmt::Debug for Ttp<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Ttp")
            .field("sfn", &self.sfn())
            .field("entries", &self.entries().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtpBuf {
    pub spot_id: SpotId,
    pub carrier_id: CarrierId,
    pub sfn: u16,
    pub entries: Vec<TtpEntry>,
}

impl TtpBuf {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Ttp::MIN_LEN + self.entries.len() * TTP_ENTRY_LEN);
        push_header(&mut out, MsgType::Ttp, self.spot_id, self.carrier_id);
        put_u16(&mut out, self.sfn);
        put_u16(&mut out, self.entries.len() as u16);
        for e in &self.entries {
            put_u16(&mut out, e.tal_id);
            put_u16(&mut out, e.pkts);
        }
        finish_header(&mut out);
        out
    }
}

/*
 * Packet records (shared by BBFrame and DVB-RCS payloads)
 */

pub fn record_len(pkt: &NetPacket) -> usize {
    PKT_RECORD_OVERHEAD + pkt.len()
}

fn encode_packet(out: &mut Vec<u8>, pkt: &NetPacket) {
    put_u16(out, pkt.dst_tal);
    put_u16(out, pkt.src_tal);
    out.push(pkt.qos);
    put_u16(out, pkt.data.len() as u16);
    out.extend_from_slice(&pkt.data);
}

fn decode_packets(
    pkt_type: PktType,
    payload: &[u8],
    count: usize,
) -> Result<Vec<NetPacket>, FrameParseError> {
    let mut packets = Vec::with_capacity(count);
    let mut at = 0usize;
    for _ in 0..count {
        if payload.len() < at + PKT_RECORD_OVERHEAD {
            return Err(FrameParseError::TruncatedPacketRecord { offset: at });
        }
        let dst_tal = read_u16(payload, at);
        let src_tal = read_u16(payload, at + 2);
        let qos = payload[at + 4];
        let len = read_u16(payload, at + 5) as usize;
        at += PKT_RECORD_OVERHEAD;
        if payload.len() < at + len {
            return Err(FrameParseError::TruncatedPacketRecord { offset: at });
        }
        packets.push(NetPacket::new(
            pkt_type,
            src_tal,
            dst_tal,
            qos,
            payload[at..at + len].to_vec(),
        ));
        at += len;
    }
    Ok(packets)
}

/*
 * DVB-S2 baseband frame
 */

/// Advertisement of a terminal's real forward MODCOD, carried in BBFrame
/// headers until the terminal has seen it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RealModcodOption {
    pub tal_id: TalId,
    pub real_modcod: ModcodId,
}

const REAL_MODCOD_OPTION_LEN: usize = 3;

/// ```norust
/// hdr | used_modcod: u8 | option_count: u8 | pkt_type: u8 | data_length: u16
///     | (tal_id: u16 | real_modcod: u8) * option_count | payload
/// ```
///
/// `data_length` is the number of packet records in the payload.
#[derive(Clone, Copy)]
pub struct BbFrame<'a> {
    bytes: &'a [u8],
}

impl<'a> BbFrame<'a> {
    pub const MIN_LEN: usize = DVB_HDR_LEN + 5;

    pub fn from_bytes(bytes: &'a [u8]) -> Result<Self, FrameParseError> {
        check_frame(bytes, MsgType::BbFrame, Self::MIN_LEN)?;
        Self::from_checked(bytes)
    }

    /// Accept a frame whose type byte was rewritten to `Corrupted`; the ACM
    /// fields stay readable for reception statistics.
    pub fn from_corrupted(bytes: &'a [u8]) -> Result<Self, FrameParseError> {
        check_frame(bytes, MsgType::Corrupted, Self::MIN_LEN)?;
        Self::from_checked(bytes)
    }

    fn from_checked(bytes: &'a [u8]) -> Result<Self, FrameParseError> {
        let frame = Self { bytes };
        PktType::try_from(bytes[DVB_HDR_LEN + 2]).map_err(|_| FrameParseError::BadPktType {
            pkt_type: bytes[DVB_HDR_LEN + 2],
        })?;
        let need = Self::MIN_LEN + frame.option_count() * REAL_MODCOD_OPTION_LEN;
        if bytes.len() < need {
            return Err(FrameParseError::TruncatedEntries {
                have: bytes.len(),
                need,
            });
        }
        Ok(frame)
    }

    pub fn used_modcod(&self) -> ModcodId {
        self.bytes[DVB_HDR_LEN]
    }

    pub fn option_count(&self) -> usize {
        self.bytes[DVB_HDR_LEN + 1] as usize
    }

    pub fn pkt_type(&self) -> PktType {
        PktType::try_from(self.bytes[DVB_HDR_LEN + 2]).unwrap()
    }

    pub fn data_length(&self) -> usize {
        read_u16(self.bytes, DVB_HDR_LEN + 3) as usize
    }

    pub fn option(&self, i: usize) -> RealModcodOption {
        let at = Self::MIN_LEN + i * REAL_MODCOD_OPTION_LEN;
        RealModcodOption {
            tal_id: read_u16(self.bytes, at),
            real_modcod: self.bytes[at + 2],
        }
    }

    pub fn options(&self) -> impl Iterator<Item = RealModcodOption> + '_ {
        (0..self.option_count()).map(move |i| self.option(i))
    }

    fn payload(&self) -> &'a [u8] {
        &self.bytes[Self::MIN_LEN + self.option_count() * REAL_MODCOD_OPTION_LEN..]
    }

    pub fn packets(&self) -> Result<Vec<NetPacket>, FrameParseError> {
        decode_packets(self.pkt_type(), self.payload(), self.data_length())
    }
}

impl<'a> core::fmt::Debug for BbFrame<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BbFrame")
            .field("used_modcod", &self.used_modcod())
            .field("pkt_type", &self.pkt_type())
            .field("data_length", &self.data_length())
            .field("options", &self.options().collect::<Vec<_>>())
            .finish()
    }
}

/// In-construction BBFrame owned by the forward scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BbFrameBuf {
    pub spot_id: SpotId,
    pub carrier_id: CarrierId,
    pub used_modcod: ModcodId,
    pub pkt_type: PktType,
    options: Vec<RealModcodOption>,
    packets: Vec<NetPacket>,
    payload_len: usize,
}

impl BbFrameBuf {
    pub fn new(spot_id: SpotId, used_modcod: ModcodId, pkt_type: PktType) -> Self {
        Self {
            spot_id,
            carrier_id: 0,
            used_modcod,
            pkt_type,
            options: Vec::new(),
            packets: Vec::new(),
            payload_len: 0,
        }
    }

    /// Total encoded size if the frame were closed now.
    pub fn total_len(&self) -> usize {
        BbFrame::MIN_LEN + self.options.len() * REAL_MODCOD_OPTION_LEN + self.payload_len
    }

    /// Room left for packet records given the MODCOD's frame size.
    pub fn free_space(&self, frame_size: usize) -> usize {
        frame_size.saturating_sub(self.total_len())
    }

    pub fn add_option(&mut self, opt: RealModcodOption) {
        self.options.push(opt);
    }

    pub fn has_option_for(&self, tal_id: TalId) -> bool {
        self.options.iter().any(|o| o.tal_id == tal_id)
    }

    pub fn add_packet(&mut self, pkt: NetPacket) {
        self.payload_len += record_len(&pkt);
        self.packets.push(pkt);
    }

    pub fn num_packets(&self) -> usize {
        self.packets.len()
    }

    /// Encode, padding the payload up to `frame_size` with zero bytes so
    /// that the on-air length always matches the MODCOD's frame size.
    pub fn to_bytes_padded(&self, frame_size: usize) -> Vec<u8> {
        let mut out = self.to_bytes();
        if out.len() < frame_size {
            out.resize(frame_size, 0);
            finish_header(&mut out);
        }
        out
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_len());
        push_header(&mut out, MsgType::BbFrame, self.spot_id, self.carrier_id);
        out.push(self.used_modcod);
        out.push(self.options.len() as u8);
        out.push(self.pkt_type as u8);
        put_u16(&mut out, self.packets.len() as u16);
        for o in &self.options {
            put_u16(&mut out, o.tal_id);
            out.push(o.real_modcod);
        }
        for p in &self.packets {
            encode_packet(&mut out, p);
        }
        finish_header(&mut out);
        out
    }
}

/*
 * DVB-RCS frame
 */

/// ```norust
/// hdr | qty_element: u16 | pkt_type: u8 | payload
/// ```
#[derive(Clone, Copy)]
pub struct DvbRcsFrame<'a> {
    bytes: &'a [u8],
}

impl<'a> DvbRcsFrame<'a> {
    pub const MIN_LEN: usize = DVB_HDR_LEN + 3;

    pub fn from_bytes(bytes: &'a [u8]) -> Result<Self, FrameParseError> {
        check_frame(bytes, MsgType::DvbBurst, Self::MIN_LEN)?;
        PktType::try_from(bytes[DVB_HDR_LEN + 2]).map_err(|_| FrameParseError::BadPktType {
            pkt_type: bytes[DVB_HDR_LEN + 2],
        })?;
        Ok(Self { bytes })
    }

    pub fn qty_element(&self) -> usize {
        read_u16(self.bytes, DVB_HDR_LEN) as usize
    }

    pub fn pkt_type(&self) -> PktType {
        PktType::try_from(self.bytes[DVB_HDR_LEN + 2]).unwrap()
    }

    pub fn payload_length(&self) -> usize {
        self.bytes.len() - Self::MIN_LEN
    }

    pub fn packets(&self) -> Result<Vec<NetPacket>, FrameParseError> {
        decode_packets(
            self.pkt_type(),
            &self.bytes[Self::MIN_LEN..],
            self.qty_element(),
        )
    }
}

impl<'a> core::fmt::Debug for DvbRcsFrame<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DvbRcsFrame")
            .field("qty_element", &self.qty_element())
            .field("pkt_type", &self.pkt_type())
            .finish()
    }
}

/// In-construction DVB-RCS frame owned by the return scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DvbRcsFrameBuf {
    pub spot_id: SpotId,
    pub carrier_id: CarrierId,
    pub pkt_type: PktType,
    packets: Vec<NetPacket>,
    payload_len: usize,
}

impl DvbRcsFrameBuf {
    pub fn new(spot_id: SpotId, pkt_type: PktType) -> Self {
        Self {
            spot_id,
            carrier_id: 0,
            pkt_type,
            packets: Vec::new(),
            payload_len: 0,
        }
    }

    pub fn total_len(&self) -> usize {
        DvbRcsFrame::MIN_LEN + self.payload_len
    }

    pub fn free_space(&self, frame_size: usize) -> usize {
        frame_size.saturating_sub(self.total_len())
    }

    pub fn add_packet(&mut self, pkt: NetPacket) {
        self.payload_len += record_len(&pkt);
        self.packets.push(pkt);
    }

    pub fn num_packets(&self) -> usize {
        self.packets.len()
    }

    /// Encode, padding up to `frame_size` so the on-air length matches the
    /// slot capacity.
    pub fn to_bytes_padded(&self, frame_size: usize) -> Vec<u8> {
        let mut out = self.to_bytes();
        if out.len() < frame_size {
            out.resize(frame_size, 0);
            finish_header(&mut out);
        }
        out
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_len());
        push_header(&mut out, MsgType::DvbBurst, self.spot_id, self.carrier_id);
        put_u16(&mut out, self.packets.len() as u16);
        out.push(self.pkt_type as u8);
        for p in &self.packets {
            encode_packet(&mut out, p);
        }
        finish_header(&mut out);
        out
    }
}
