//! The configuration record of a run.
//!
//! Loading (XML, command line, whatever the testbed wraps around the core)
//! is an external concern; the core receives one [`Config`] value at init,
//! validates it once and never mutates it. MODCOD definition and scenario
//! files are likewise read by the loader and handed over as tables.

use crate::band::{CarrierTable, SpotCarriers, TerminalCategory};
use crate::error::ConfigError;
use crate::fmt::ModcodDefinitionTable;
use crate::{Kbps, ModcodId, PktType, SatelliteType, SpotId, TalId, TimeMs};

/// How a return FIFO obtains capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FifoAccess {
    /// Served by the static CRA reservation, never requested.
    Cra,
    /// Rate-based requests from the measured arrival rate.
    Rbdc,
    /// Volume-based requests from the backlog.
    Vbdc,
    /// Random access; carried but not scheduled by this core.
    Aloha,
}

/// One per-QoS MAC FIFO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FifoConfig {
    /// Lower value drains first.
    pub priority: u8,
    pub name: String,
    pub size_pkts: usize,
    pub access: FifoAccess,
}

/// Band plan of one GW inside one spot.
#[derive(Debug, Clone, PartialEq)]
pub struct BandConfig {
    pub spot_id: SpotId,
    pub gw_id: TalId,
    pub category: TerminalCategory,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub satellite_type: SatelliteType,
    pub sat_delay_ms: TimeMs,

    pub fwd_down_frame_duration_ms: TimeMs,
    pub ret_up_frame_duration_ms: TimeMs,
    pub dvb_scenario_refresh_ms: TimeMs,
    pub frames_per_superframe: u32,

    pub with_phy_layer: bool,
    /// Only the Legacy controller is implemented; kept as data so that the
    /// option stays visible in dumps.
    pub dama_algo: String,
    pub fca_kbps: Kbps,
    pub cra_decrease: bool,
    pub sync_period_ms: TimeMs,
    pub obr_period_frames: u32,

    pub fwd_pkt_type: PktType,
    pub ret_pkt_type: PktType,
    /// Bandwidth of the forward carrier, for BBFrame air-time accounting.
    pub fwd_bandwidth_khz: u32,

    pub spots: Vec<SpotCarriers>,
    pub forward_band: Vec<BandConfig>,
    pub return_band: Vec<BandConfig>,
    pub fifos: Vec<FifoConfig>,

    pub fwd_modcod_defs: ModcodDefinitionTable,
    pub ret_modcod_defs: ModcodDefinitionTable,
    /// `scenario[step][column]`, already read from the time-series files.
    pub fwd_scenario: Vec<Vec<ModcodId>>,
    pub ret_scenario: Vec<Vec<ModcodId>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            satellite_type: SatelliteType::Transparent,
            sat_delay_ms: 125,
            fwd_down_frame_duration_ms: 20,
            ret_up_frame_duration_ms: 53,
            dvb_scenario_refresh_ms: 1000,
            frames_per_superframe: 1,
            with_phy_layer: false,
            dama_algo: "Legacy".into(),
            fca_kbps: 0,
            cra_decrease: true,
            sync_period_ms: 0,
            obr_period_frames: 16,
            fwd_pkt_type: PktType::Gse,
            ret_pkt_type: PktType::Atm,
            fwd_bandwidth_khz: 20_000,
            spots: Vec::new(),
            forward_band: Vec::new(),
            return_band: Vec::new(),
            fifos: Vec::new(),
            fwd_modcod_defs: ModcodDefinitionTable::default_s2(),
            ret_modcod_defs: ModcodDefinitionTable::default_s2(),
            fwd_scenario: Vec::new(),
            ret_scenario: Vec::new(),
        }
    }
}

impl Config {
    /// Check the whole record; called once before any block starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.spots.is_empty() {
            return Err(ConfigError::NoSpot);
        }
        if self.fifos.is_empty() {
            return Err(ConfigError::NoFifo);
        }
        if self.fwd_down_frame_duration_ms == 0 {
            return Err(ConfigError::ZeroDuration {
                name: "fwd_down_frame_duration_ms",
            });
        }
        if self.ret_up_frame_duration_ms == 0 {
            return Err(ConfigError::ZeroDuration {
                name: "ret_up_frame_duration_ms",
            });
        }
        if self.frames_per_superframe == 0 {
            return Err(ConfigError::ZeroDuration {
                name: "frames_per_superframe",
            });
        }
        if self.obr_period_frames == 0 {
            return Err(ConfigError::ZeroObrPeriod);
        }
        // the carrier table build detects duplicate carrier assignments
        self.carrier_table()?;

        // a BBFrame longer than a forward tick could never be credited;
        // refuse the band instead of starving its MODCOD
        let frame_us = self.fwd_down_frame_duration_ms * 1000;
        for id in self.fwd_modcod_defs.ids().collect::<Vec<_>>() {
            if let Some(duration_us) = self
                .fwd_modcod_defs
                .bbframe_duration_us(id, self.fwd_bandwidth_khz)
            {
                if duration_us > frame_us {
                    return Err(ConfigError::BbframeTooLong {
                        modcod: id,
                        duration_us,
                        frame_us,
                    });
                }
            }
        }
        Ok(())
    }

    /// Build the immutable carrier lookup table from the spot list.
    pub fn carrier_table(&self) -> Result<CarrierTable, ConfigError> {
        let mut table = CarrierTable::default();
        for spot in &self.spots {
            spot.fill_table(&mut table)?;
        }
        Ok(table)
    }

    /// Fixed size of return-link packets; the return band only carries
    /// fixed-length encapsulation.
    pub fn ret_pkt_size(&self) -> usize {
        self.ret_pkt_type.fixed_length().unwrap_or(53)
    }

    /// Total return capacity in packets per superframe for one GW, derived
    /// from its DAMA carrier groups at the most robust return MODCOD.
    pub fn ret_capacity_pkts(&self, spot_id: SpotId, gw_id: TalId) -> u32 {
        let eff = self
            .ret_modcod_defs
            .get(self.ret_modcod_defs.lowest_id())
            .map(|d| d.spectral_efficiency)
            .unwrap_or(1.0);
        let kbps: Kbps = self
            .return_band
            .iter()
            .filter(|b| b.spot_id == spot_id && b.gw_id == gw_id)
            .map(|b| b.category.rate_kbps(crate::AccessType::Dama, eff))
            .sum();
        let bits = kbps as u64 * self.ret_up_frame_duration_ms * self.frames_per_superframe as u64;
        (bits / (8 * self.ret_pkt_size() as u64)) as u32
    }
}
