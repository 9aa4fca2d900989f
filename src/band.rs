//! Static band plan: terminal categories, carrier groups and the
//! carrier-to-spot mapping, plus rate/packet conversion helpers.
//!
//! Everything here is computed once at init and inert afterwards.

use std::collections::BTreeMap;

use crate::error::ConfigError;
use crate::{AccessType, CarrierId, CarrierRole, Kbps, SpotId, TalId, TimeMs};

/// One carrier group of a terminal category.
#[derive(Debug, Clone, PartialEq)]
pub struct CarrierGroup {
    pub carrier_id: CarrierId,
    pub fmt_group_id: u8,
    /// Relative share of the category's band.
    pub ratio: u32,
    pub symbol_rate_symps: u64,
    pub access_type: AccessType,
}

impl CarrierGroup {
    /// Raw carrier rate at a given spectral efficiency.
    pub fn rate_kbps(&self, spectral_efficiency: f64) -> Kbps {
        (self.symbol_rate_symps as f64 * spectral_efficiency / 1000.0) as Kbps
    }
}

/// A terminal category: the set of carrier groups its terminals share.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalCategory {
    pub name: String,
    pub groups: Vec<CarrierGroup>,
}

impl TerminalCategory {
    pub fn new(name: impl Into<String>, groups: Vec<CarrierGroup>) -> Self {
        Self {
            name: name.into(),
            groups,
        }
    }

    /// Aggregate rate of the groups matching an access type.
    pub fn rate_kbps(&self, access: AccessType, spectral_efficiency: f64) -> Kbps {
        self.groups
            .iter()
            .filter(|g| g.access_type == access)
            .map(|g| g.rate_kbps(spectral_efficiency))
            .sum()
    }
}

/// Conversion between rates in kbits/s and fixed-size packets per
/// superframe. All DAMA arithmetic runs in packets; the wire carries kbits/s
/// for rate-based requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateConverter {
    pub pkt_size_bytes: usize,
    pub frame_duration_ms: TimeMs,
}

impl RateConverter {
    pub fn new(pkt_size_bytes: usize, frame_duration_ms: TimeMs) -> Self {
        Self {
            pkt_size_bytes,
            frame_duration_ms,
        }
    }

    /// kbits/s -> whole packets per superframe. One kbit/s sustained over
    /// one millisecond is exactly one bit.
    pub fn kbps_to_pkts(&self, kbps: Kbps) -> u32 {
        let bits = kbps as u64 * self.frame_duration_ms;
        (bits / (8 * self.pkt_size_bytes as u64)) as u32
    }

    /// Packets per superframe -> kbits/s, rounded down.
    pub fn pkts_to_kbps(&self, pkts: u32) -> Kbps {
        if self.frame_duration_ms == 0 {
            return 0;
        }
        let bits = pkts as u64 * 8 * self.pkt_size_bytes as u64;
        (bits / self.frame_duration_ms) as Kbps
    }
}

/// Resolution of a carrier id inside the band plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CarrierEntry {
    pub spot_id: SpotId,
    pub gw_id: TalId,
    pub role: CarrierRole,
}

/// The immutable `carrier_id -> (spot, gw, role)` table, loaded once at
/// startup.
#[derive(Debug, Clone, Default)]
pub struct CarrierTable {
    entries: BTreeMap<CarrierId, CarrierEntry>,
}

impl CarrierTable {
    pub fn add(
        &mut self,
        carrier_id: CarrierId,
        spot_id: SpotId,
        gw_id: TalId,
        role: CarrierRole,
    ) -> Result<(), ConfigError> {
        if self.entries.contains_key(&carrier_id) {
            return Err(ConfigError::DuplicateCarrier(carrier_id));
        }
        self.entries.insert(
            carrier_id,
            CarrierEntry {
                spot_id,
                gw_id,
                role,
            },
        );
        Ok(())
    }

    pub fn resolve(&self, carrier_id: CarrierId) -> Option<CarrierEntry> {
        self.entries.get(&carrier_id).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The carriers one GW owns inside one spot, by role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpotCarriers {
    pub spot_id: SpotId,
    pub gw_id: TalId,
    pub sof: CarrierId,
    pub ctrl_in: CarrierId,
    pub ctrl_out: CarrierId,
    pub logon_in: CarrierId,
    pub logon_out: CarrierId,
    pub data_in_st: CarrierId,
    pub data_in_gw: CarrierId,
    pub data_out_st: CarrierId,
    pub data_out_gw: CarrierId,
}

impl SpotCarriers {
    /// Register every carrier of this spot/GW pair into the lookup table.
    pub fn fill_table(&self, table: &mut CarrierTable) -> Result<(), ConfigError> {
        let pairs = [
            (self.sof, CarrierRole::Sof),
            (self.ctrl_in, CarrierRole::CtrlIn),
            (self.ctrl_out, CarrierRole::CtrlOut),
            (self.logon_in, CarrierRole::LogonIn),
            (self.logon_out, CarrierRole::LogonOut),
            (self.data_in_st, CarrierRole::DataInSt),
            (self.data_in_gw, CarrierRole::DataInGw),
            (self.data_out_st, CarrierRole::DataOutSt),
            (self.data_out_gw, CarrierRole::DataOutGw),
        ];
        for (carrier, role) in pairs {
            table.add(carrier, self.spot_id, self.gw_id, role)?;
        }
        Ok(())
    }
}
