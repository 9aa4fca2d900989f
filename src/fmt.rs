//! MODCOD definitions and the fade-mitigation (FMT) simulation engine.
//!
//! A MODCOD scenario is a table `scenario[step][column] -> modcod id`; each
//! registered terminal owns a column. The scenario advances one row per
//! refresh timer tick and wraps at the end. Forward and return links each
//! run their own instance of [`FmtSimulation`]; there is no dispatch on the
//! direction, callers just hold two values.

use std::collections::BTreeMap;

use crate::error::ConfigError;
use crate::{ModcodId, TalId};

/// Largest on-air BBFrame size in bytes; the duration of a BBFrame is the
/// time this many bytes take at the MODCOD's spectral efficiency.
pub const BBFRAME_SIZE_MAX: usize = 8100;

/// LDPC coding rates supported on the forward link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodingRate {
    Cr1_3,
    Cr1_2,
    Cr2_3,
    Cr3_4,
    Cr5_6,
    Cr8_9,
    Cr9_10,
}

impl CodingRate {
    /// Usable BBFrame bytes for this rate (normal FECFRAME).
    pub const fn bbframe_bytes(&self) -> usize {
        match *self {
            CodingRate::Cr1_3 => 2676,
            CodingRate::Cr1_2 => 4026,
            CodingRate::Cr2_3 => 5380,
            CodingRate::Cr3_4 => 6051,
            CodingRate::Cr5_6 => 6730,
            CodingRate::Cr8_9 => 7274,
            CodingRate::Cr9_10 => BBFRAME_SIZE_MAX,
        }
    }
}

/// One row of the MODCOD definition table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModcodDefinition {
    pub id: ModcodId,
    pub modulation: Modulation,
    pub coding_rate: CodingRate,
    /// Bits per symbol after coding.
    pub spectral_efficiency: f64,
    /// Es/N0 threshold in dB below which the frame cannot be decoded.
    pub required_es_n0_db: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modulation {
    Bpsk,
    Qpsk,
    Psk8,
    Apsk16,
    Apsk32,
}

/// Definition table, ordered by ascending id (and therefore by robustness:
/// lower ids are more robust, higher ids need a better channel).
#[derive(Debug, Clone, Default)]
pub struct ModcodDefinitionTable {
    defs: Vec<ModcodDefinition>,
}

impl ModcodDefinitionTable {
    pub fn new(mut defs: Vec<ModcodDefinition>) -> Result<Self, ConfigError> {
        if defs.is_empty() {
            return Err(ConfigError::NoModcod);
        }
        defs.sort_by_key(|d| d.id);
        Ok(Self { defs })
    }

    /// A small DVB-S2 table for runs without a definition file.
    pub fn default_s2() -> Self {
        use CodingRate::*;
        use Modulation::*;
        let defs = vec![
            ModcodDefinition { id: 1, modulation: Qpsk, coding_rate: Cr1_3, spectral_efficiency: 0.66, required_es_n0_db: -1.2 },
            ModcodDefinition { id: 2, modulation: Qpsk, coding_rate: Cr1_2, spectral_efficiency: 0.99, required_es_n0_db: 1.0 },
            ModcodDefinition { id: 3, modulation: Qpsk, coding_rate: Cr2_3, spectral_efficiency: 1.32, required_es_n0_db: 3.1 },
            ModcodDefinition { id: 4, modulation: Qpsk, coding_rate: Cr3_4, spectral_efficiency: 1.49, required_es_n0_db: 4.0 },
            ModcodDefinition { id: 5, modulation: Qpsk, coding_rate: Cr5_6, spectral_efficiency: 1.65, required_es_n0_db: 5.2 },
            ModcodDefinition { id: 6, modulation: Qpsk, coding_rate: Cr8_9, spectral_efficiency: 1.77, required_es_n0_db: 6.2 },
            ModcodDefinition { id: 7, modulation: Psk8, coding_rate: Cr2_3, spectral_efficiency: 1.98, required_es_n0_db: 6.6 },
            ModcodDefinition { id: 8, modulation: Psk8, coding_rate: Cr3_4, spectral_efficiency: 2.23, required_es_n0_db: 7.9 },
            ModcodDefinition { id: 9, modulation: Psk8, coding_rate: Cr8_9, spectral_efficiency: 2.65, required_es_n0_db: 10.7 },
            ModcodDefinition { id: 10, modulation: Apsk16, coding_rate: Cr3_4, spectral_efficiency: 2.97, required_es_n0_db: 10.2 },
            ModcodDefinition { id: 11, modulation: Apsk16, coding_rate: Cr8_9, spectral_efficiency: 3.52, required_es_n0_db: 13.1 },
            ModcodDefinition { id: 12, modulation: Apsk32, coding_rate: Cr9_10, spectral_efficiency: 4.45, required_es_n0_db: 16.1 },
        ];
        Self { defs }
    }

    pub fn exists(&self, id: ModcodId) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: ModcodId) -> Option<&ModcodDefinition> {
        self.defs.iter().find(|d| d.id == id)
    }

    pub fn lowest_id(&self) -> ModcodId {
        self.defs.first().map(|d| d.id).unwrap_or(0)
    }

    pub fn highest_id(&self) -> ModcodId {
        self.defs.last().map(|d| d.id).unwrap_or(0)
    }

    pub fn ids(&self) -> impl Iterator<Item = ModcodId> + '_ {
        self.defs.iter().map(|d| d.id)
    }

    /// Usable BBFrame bytes for a MODCOD.
    pub fn bbframe_bytes(&self, id: ModcodId) -> Option<usize> {
        self.get(id).map(|d| d.coding_rate.bbframe_bytes())
    }

    /// Air time of one maximum-size BBFrame at this MODCOD, in microseconds.
    pub fn bbframe_duration_us(&self, id: ModcodId, bandwidth_khz: u32) -> Option<u64> {
        let def = self.get(id)?;
        if bandwidth_khz == 0 {
            return None;
        }
        let bits = (BBFRAME_SIZE_MAX * 8) as f64;
        let us = bits * 1000.0 / (def.spectral_efficiency * bandwidth_khz as f64);
        Some(us.round() as u64)
    }

    /// Most efficient MODCOD decodable at the given C/N, falling back to the
    /// most robust one when the channel is below every threshold.
    pub fn from_cni(&self, cni_db: f64) -> ModcodId {
        self.defs
            .iter()
            .filter(|d| d.required_es_n0_db <= cni_db)
            .map(|d| d.id)
            .max()
            .unwrap_or_else(|| self.lowest_id())
    }
}

/// Per-terminal state of one FMT simulation instance.
#[derive(Debug, Clone)]
struct TerminalFmt {
    column: usize,
    current: ModcodId,
    previous: ModcodId,
    /// Whether the current MODCOD was carried in an emitted BBFrame option.
    advertised: bool,
}

/// Scenario playback over the registered terminals of one link direction.
#[derive(Debug)]
pub struct FmtSimulation {
    /// `scenario[step][column]`; empty means every terminal stays on
    /// `default_modcod` forever.
    scenario: Vec<Vec<ModcodId>>,
    step: usize,
    default_modcod: ModcodId,
    terminals: BTreeMap<TalId, TerminalFmt>,
}

impl FmtSimulation {
    pub fn new(scenario: Vec<Vec<ModcodId>>, default_modcod: ModcodId) -> Self {
        Self {
            scenario,
            step: 0,
            default_modcod,
            terminals: BTreeMap::new(),
        }
    }

    fn scenario_modcod(&self, column: usize) -> Option<ModcodId> {
        self.scenario.get(self.step)?.get(column).copied()
    }

    /// Declare a terminal with its scenario column. Called on logon.
    pub fn register(&mut self, tal_id: TalId, column: usize) -> Result<(), ConfigError> {
        let initial = if self.scenario.is_empty() {
            self.default_modcod
        } else {
            self.scenario_modcod(column)
                .ok_or(ConfigError::MissingFmtColumn(column))?
        };
        self.terminals.insert(
            tal_id,
            TerminalFmt {
                column,
                current: initial,
                previous: initial,
                advertised: true,
            },
        );
        log::info!("fmt: terminal {tal_id} registered on column {column}, modcod {initial}");
        Ok(())
    }

    pub fn deregister(&mut self, tal_id: TalId) {
        self.terminals.remove(&tal_id);
    }

    pub fn is_registered(&self, tal_id: TalId) -> bool {
        self.terminals.contains_key(&tal_id)
    }

    pub fn column(&self, tal_id: TalId) -> Option<usize> {
        self.terminals.get(&tal_id).map(|t| t.column)
    }

    /// Advance the scenario one row, wrapping at the end, and refresh the
    /// MODCOD of every registered terminal from its column.
    pub fn go_next_scenario_step(&mut self) {
        if self.scenario.is_empty() {
            return;
        }
        self.step = (self.step + 1) % self.scenario.len();
        let row = &self.scenario[self.step];
        for (tal_id, t) in self.terminals.iter_mut() {
            let Some(&new) = row.get(t.column) else {
                log::warn!("fmt: no column {} in scenario step {}", t.column, self.step);
                continue;
            };
            if new != t.current {
                t.previous = t.current;
                t.current = new;
                t.advertised = false;
                log::debug!(
                    "fmt: terminal {tal_id} modcod {} -> {new} (step {})",
                    t.previous,
                    self.step
                );
            }
        }
    }

    pub fn current_modcod(&self, tal_id: TalId) -> Option<ModcodId> {
        self.terminals.get(&tal_id).map(|t| t.current)
    }

    pub fn previous_modcod(&self, tal_id: TalId) -> Option<ModcodId> {
        self.terminals.get(&tal_id).map(|t| t.previous)
    }

    pub fn is_advertised(&self, tal_id: TalId) -> Option<bool> {
        self.terminals.get(&tal_id).map(|t| t.advertised)
    }

    /// Record that the current MODCOD reached the terminal in a BBFrame
    /// option.
    pub fn set_advertised(&mut self, tal_id: TalId) {
        if let Some(t) = self.terminals.get_mut(&tal_id) {
            t.advertised = true;
        }
    }

    /// Physical-layer feedback: override the scenario value with the MODCOD
    /// matching a reported C/N, until the next scenario step rewrites it.
    pub fn set_required_modcod(
        &mut self,
        tal_id: TalId,
        cni_db: f64,
        defs: &ModcodDefinitionTable,
    ) {
        let id = defs.from_cni(cni_db);
        if let Some(t) = self.terminals.get_mut(&tal_id) {
            if id != t.current {
                t.previous = t.current;
                t.current = id;
                t.advertised = false;
                log::debug!("fmt: terminal {tal_id} required modcod {id} from cni {cni_db:.2} dB");
            }
        }
    }

    pub fn tal_ids(&self) -> impl Iterator<Item = TalId> + '_ {
        self.terminals.keys().copied()
    }
}
