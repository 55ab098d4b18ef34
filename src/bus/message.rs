//! Message payloads exchanged over the bus
//!
//! Payloads are flat key-to-scalar maps. Using a `BTreeMap` keeps iteration
//! and serialization order stable, which the determinism guarantee relies
//! on. A delivered message additionally carries the tick and simulated time
//! at which it was published.

use std::collections::BTreeMap;

/// Flat key-to-scalar payload map
pub type FieldMap = BTreeMap<String, f64>;

/// Build a [`FieldMap`] from key/value pairs
///
/// # Example
/// ```
/// use water_simulator_core_rs::bus::payload;
///
/// let fields = payload(&[("control_signal", 0.75)]);
/// assert_eq!(fields.get("control_signal"), Some(&0.75));
/// ```
pub fn payload(pairs: &[(&str, f64)]) -> FieldMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), *v))
        .collect()
}

/// An immutable message as seen by subscribers
///
/// Handlers receive a shared reference and copy any value they retain;
/// the message itself is dropped when the publish that created it returns.
#[derive(Debug, Clone)]
pub struct Message {
    topic: String,
    tick: u64,
    time: f64,
    fields: FieldMap,
}

impl Message {
    pub(crate) fn new(topic: &str, tick: u64, time: f64, fields: FieldMap) -> Self {
        Self {
            topic: topic.to_string(),
            tick,
            time,
            fields,
        }
    }

    /// Topic this message was published on
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Tick index at publication
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Simulated time at publication
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Look up a scalar field
    pub fn get(&self, key: &str) -> Option<f64> {
        self.fields.get(key).copied()
    }

    /// True if the payload carries `key`
    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// The full payload map
    pub fn fields(&self) -> &FieldMap {
        &self.fields
    }
}
