//! Statistics façade.
//!
//! Components record counters and gauges through a shared [`Probes`]
//! handle; nothing in the emulation reads them back, so the registry has no
//! semantic effect on correctness. The testbed's output layer samples it
//! between superframes.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct Registry {
    counters: BTreeMap<&'static str, u64>,
    gauges: BTreeMap<&'static str, u64>,
    gauges_f64: BTreeMap<&'static str, f64>,
}

/// Cheap-to-clone probe handle threaded through every component at init.
#[derive(Debug, Clone, Default)]
pub struct Probes {
    registry: Arc<Mutex<Registry>>,
}

impl Probes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add to a monotonic counter.
    pub fn add(&self, name: &'static str, value: u64) {
        let mut reg = self.registry.lock().unwrap();
        *reg.counters.entry(name).or_default() += value;
    }

    /// Bump a monotonic counter by one.
    pub fn incr(&self, name: &'static str) {
        self.add(name, 1);
    }

    /// Record the last value of a gauge.
    pub fn put(&self, name: &'static str, value: u64) {
        self.registry.lock().unwrap().gauges.insert(name, value);
    }

    pub fn put_f64(&self, name: &'static str, value: f64) {
        self.registry.lock().unwrap().gauges_f64.insert(name, value);
    }

    pub fn counter(&self, name: &'static str) -> u64 {
        self.registry
            .lock()
            .unwrap()
            .counters
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    pub fn gauge(&self, name: &'static str) -> Option<u64> {
        self.registry.lock().unwrap().gauges.get(name).copied()
    }

    pub fn gauge_f64(&self, name: &'static str) -> Option<f64> {
        self.registry.lock().unwrap().gauges_f64.get(name).copied()
    }

    /// Snapshot of every counter, for the output layer.
    pub fn counters(&self) -> Vec<(&'static str, u64)> {
        self.registry
            .lock()
            .unwrap()
            .counters
            .iter()
            .map(|(k, v)| (*k, *v))
            .collect()
    }
}
