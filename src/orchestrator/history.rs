//! Per-tick state recording
//!
//! The harness appends one [`TickSnapshot`] per tick. Memory grows linearly
//! with the run; long simulations can attach a [`HistorySink`] that flushes
//! and truncates the in-memory list at a configured interval.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::core::error::SimulationError;
use crate::models::State;

/// States of every component at the end of one tick
#[derive(Debug, Clone, Serialize)]
pub struct TickSnapshot {
    #[serde(skip)]
    pub tick: u64,
    pub time: f64,
    pub states: BTreeMap<String, State>,
}

/// Append-only tick history
#[derive(Debug, Default)]
pub struct SimulationHistory {
    snapshots: Vec<TickSnapshot>,
}

impl SimulationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, snapshot: TickSnapshot) {
        self.snapshots.push(snapshot);
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn snapshots(&self) -> &[TickSnapshot] {
        &self.snapshots
    }

    pub fn last(&self) -> Option<&TickSnapshot> {
        self.snapshots.last()
    }

    /// Drain the buffered snapshots (used by the streaming flush)
    pub fn drain(&mut self) -> Vec<TickSnapshot> {
        std::mem::take(&mut self.snapshots)
    }
}

/// Receives flushed history batches during long runs
pub trait HistorySink {
    fn flush(&mut self, snapshots: &[TickSnapshot]) -> Result<(), SimulationError>;
}

/// The structured artifact emitted at the end of a run
#[derive(Debug, Serialize)]
pub struct SimulationResult {
    pub dt: f64,
    pub num_steps: u64,
    pub components: Vec<String>,
    pub history: Vec<TickSnapshot>,
}

impl SimulationResult {
    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<String, SimulationError> {
        serde_json::to_string_pretty(self).map_err(|e| SimulationError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(tick: u64, level: f64) -> TickSnapshot {
        TickSnapshot {
            tick,
            time: tick as f64,
            states: BTreeMap::from([(
                "res_1".to_string(),
                State::from([("water_level".to_string(), level)]),
            )]),
        }
    }

    #[test]
    fn test_record_and_drain() {
        let mut history = SimulationHistory::new();
        history.record(snapshot(0, 10.0));
        history.record(snapshot(1, 9.5));
        assert_eq!(history.len(), 2);
        let drained = history.drain();
        assert_eq!(drained.len(), 2);
        assert!(history.is_empty());
    }

    #[test]
    fn test_result_serializes_time_and_states() {
        let result = SimulationResult {
            dt: 1.0,
            num_steps: 1,
            components: vec!["res_1".to_string()],
            history: vec![snapshot(0, 10.0)],
        };
        let json = result.to_json().unwrap();
        assert!(json.contains("\"time\""));
        assert!(json.contains("\"water_level\""));
        assert!(json.contains("\"num_steps\": 1"));
    }
}
