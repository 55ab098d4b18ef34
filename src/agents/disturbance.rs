//! Disturbance agents
//!
//! Inject external forcing into the network over the bus: rainfall bursts,
//! water withdrawals, historical series replayed from CSV. Components pick
//! the values up through their subscribed inflow/outflow topics during
//! Phase A, before the physics step reads them.

use std::path::Path;

use serde::Deserialize;
use tracing::{debug, info};

use crate::agents::Agent;
use crate::bus::{payload, MessageBus};
use crate::core::error::SimulationError;
use crate::rng::RngManager;
use std::rc::Rc;

/// Constant-rate rainfall over an activation window
#[derive(Debug, Clone, Deserialize)]
pub struct RainfallConfig {
    pub topic: String,
    pub start_time: f64,
    pub duration: f64,
    pub inflow_rate: f64,
}

/// Publishes `inflow_rate` while `start_time <= t < start_time + duration`
pub struct RainfallAgent {
    id: String,
    bus: Rc<MessageBus>,
    config: RainfallConfig,
}

impl RainfallAgent {
    pub fn new(id: &str, bus: Rc<MessageBus>, config: RainfallConfig) -> Self {
        info!(
            id,
            topic = config.topic.as_str(),
            start = config.start_time,
            duration = config.duration,
            "rainfall agent created"
        );
        Self {
            id: id.to_string(),
            bus,
            config,
        }
    }

    fn active(&self, t: f64) -> bool {
        t >= self.config.start_time && t < self.config.start_time + self.config.duration
    }
}

impl Agent for RainfallAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn run(&mut self, current_time: f64) -> Result<(), SimulationError> {
        if self.active(current_time) {
            self.bus.publish(
                &self.config.topic,
                payload(&[("inflow_rate", self.config.inflow_rate)]),
            )?;
        }
        Ok(())
    }
}

/// Rainfall with seeded multiplicative noise around the base rate
#[derive(Debug, Clone, Deserialize)]
pub struct DynamicRainfallConfig {
    pub topic: String,
    pub start_time: f64,
    pub duration: f64,
    pub base_inflow_rate: f64,
    /// Noise fraction, e.g. 0.2 for +-20%
    pub spread: f64,
    pub seed: u64,
}

/// Stochastic rainfall; reproducible under a fixed seed
pub struct DynamicRainfallAgent {
    id: String,
    bus: Rc<MessageBus>,
    config: DynamicRainfallConfig,
    rng: RngManager,
}

impl DynamicRainfallAgent {
    pub fn new(
        id: &str,
        bus: Rc<MessageBus>,
        config: DynamicRainfallConfig,
    ) -> Result<Self, SimulationError> {
        if !(0.0..1.0).contains(&config.spread) {
            return Err(SimulationError::InvalidConfig(format!(
                "rainfall spread must be in [0, 1), got {}",
                config.spread
            )));
        }
        let rng = RngManager::new(config.seed);
        info!(id, topic = config.topic.as_str(), "dynamic rainfall agent created");
        Ok(Self {
            id: id.to_string(),
            bus,
            config,
            rng,
        })
    }
}

impl Agent for DynamicRainfallAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn run(&mut self, current_time: f64) -> Result<(), SimulationError> {
        let end = self.config.start_time + self.config.duration;
        if current_time >= self.config.start_time && current_time < end {
            let rate = if self.config.spread > 0.0 {
                self.rng.jitter(self.config.base_inflow_rate, self.config.spread)
            } else {
                self.config.base_inflow_rate
            };
            self.bus
                .publish(&self.config.topic, payload(&[("inflow_rate", rate)]))?;
        }
        Ok(())
    }
}

/// Water withdrawal over an activation window
#[derive(Debug, Clone, Deserialize)]
pub struct WaterUseConfig {
    /// Outflow topic of the affected component
    pub topic: String,
    pub start_time: f64,
    pub duration: f64,
    /// Diverted flow in volume units per second
    pub diversion_rate: f64,
}

/// Publishes `diversion_rate` on an outflow topic while active
///
/// The affected component subscribes the topic as an outflow binding; the
/// withdrawal therefore flows through the bus like every other
/// cross-component effect instead of mutating foreign state.
pub struct WaterUseAgent {
    id: String,
    bus: Rc<MessageBus>,
    config: WaterUseConfig,
}

impl WaterUseAgent {
    pub fn new(id: &str, bus: Rc<MessageBus>, config: WaterUseConfig) -> Self {
        info!(id, topic = config.topic.as_str(), "water use agent created");
        Self {
            id: id.to_string(),
            bus,
            config,
        }
    }
}

impl Agent for WaterUseAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn run(&mut self, current_time: f64) -> Result<(), SimulationError> {
        let end = self.config.start_time + self.config.duration;
        if current_time >= self.config.start_time && current_time < end {
            self.bus.publish(
                &self.config.topic,
                payload(&[("diversion_rate", self.config.diversion_rate)]),
            )?;
        }
        Ok(())
    }
}

/// Replays a time-indexed series from a CSV file
///
/// Lookup is step-and-hold: at time `t` the last sample with
/// `sample_time <= t` is published. Useful for driving a scenario with
/// historical inflow or demand records.
pub struct CsvInflowAgent {
    id: String,
    bus: Rc<MessageBus>,
    topic: String,
    /// (time, value), sorted by time
    samples: Vec<(f64, f64)>,
}

impl CsvInflowAgent {
    pub fn new(
        id: &str,
        bus: Rc<MessageBus>,
        csv_path: &Path,
        time_column: &str,
        data_column: &str,
        topic: &str,
    ) -> Result<Self, SimulationError> {
        let mut reader = csv::Reader::from_path(csv_path).map_err(|e| {
            SimulationError::InvalidConfig(format!(
                "cannot open CSV '{}': {}",
                csv_path.display(),
                e
            ))
        })?;
        let headers = reader
            .headers()
            .map_err(|e| SimulationError::InvalidConfig(format!("bad CSV header: {}", e)))?
            .clone();
        let time_idx = headers.iter().position(|h| h == time_column).ok_or_else(|| {
            SimulationError::InvalidConfig(format!("CSV column '{}' not found", time_column))
        })?;
        let data_idx = headers.iter().position(|h| h == data_column).ok_or_else(|| {
            SimulationError::InvalidConfig(format!("CSV column '{}' not found", data_column))
        })?;

        let mut samples = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = record.map_err(|e| {
                SimulationError::InvalidConfig(format!("bad CSV record at line {}: {}", line + 2, e))
            })?;
            let parse = |idx: usize| -> Result<f64, SimulationError> {
                record
                    .get(idx)
                    .and_then(|v| v.trim().parse::<f64>().ok())
                    .ok_or_else(|| {
                        SimulationError::InvalidConfig(format!(
                            "non-numeric CSV value at line {}",
                            line + 2
                        ))
                    })
            };
            samples.push((parse(time_idx)?, parse(data_idx)?));
        }
        samples.sort_by(|a, b| a.0.total_cmp(&b.0));
        info!(id, samples = samples.len(), topic, "csv inflow agent created");
        Ok(Self {
            id: id.to_string(),
            bus,
            topic: topic.to_string(),
            samples,
        })
    }
}

impl Agent for CsvInflowAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn run(&mut self, current_time: f64) -> Result<(), SimulationError> {
        let idx = self.samples.partition_point(|(t, _)| *t <= current_time);
        if idx == 0 {
            debug!(id = self.id.as_str(), current_time, "no CSV sample yet");
            return Ok(());
        }
        let (_, value) = self.samples[idx - 1];
        self.bus
            .publish(&self.topic, payload(&[("inflow_rate", value)]))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::io::Write;

    fn probe(bus: &Rc<MessageBus>, topic: &str, key: &'static str) -> Rc<Cell<f64>> {
        let seen = Rc::new(Cell::new(f64::NAN));
        let sink = Rc::clone(&seen);
        bus.subscribe(topic, "probe", move |msg| {
            if let Some(v) = msg.get(key) {
                sink.set(v);
            }
            Ok(())
        });
        seen
    }

    #[test]
    fn test_rainfall_window() {
        let bus = MessageBus::new();
        let seen = probe(&bus, "disturbance/rainfall/r1", "inflow_rate");
        let mut agent = RainfallAgent::new(
            "rain_1",
            bus.clone(),
            RainfallConfig {
                topic: "disturbance/rainfall/r1".to_string(),
                start_time: 300.0,
                duration: 200.0,
                inflow_rate: 150.0,
            },
        );

        agent.run(299.0).unwrap();
        assert!(seen.get().is_nan(), "inactive before the window");
        agent.run(300.0).unwrap();
        assert_eq!(seen.get(), 150.0);
        seen.set(f64::NAN);
        agent.run(500.0).unwrap();
        assert!(seen.get().is_nan(), "window end is exclusive");
    }

    #[test]
    fn test_dynamic_rainfall_is_deterministic_per_seed() {
        let run_once = || {
            let bus = MessageBus::new();
            let seen = probe(&bus, "d/rain", "inflow_rate");
            let mut agent = DynamicRainfallAgent::new(
                "rain",
                bus,
                DynamicRainfallConfig {
                    topic: "d/rain".to_string(),
                    start_time: 0.0,
                    duration: 10.0,
                    base_inflow_rate: 100.0,
                    spread: 0.2,
                    seed: 42,
                },
            )
            .unwrap();
            let mut values = Vec::new();
            for t in 0..10 {
                agent.run(t as f64).unwrap();
                values.push(seen.get());
            }
            values
        };
        let a = run_once();
        let b = run_once();
        assert_eq!(a, b);
        assert!(a.iter().all(|v| (80.0..=120.0).contains(v)));
    }

    #[test]
    fn test_csv_inflow_step_and_hold() {
        let bus = MessageBus::new();
        let seen = probe(&bus, "inflow/res_1", "inflow_rate");

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "time,inflow").unwrap();
        writeln!(file, "0,10").unwrap();
        writeln!(file, "60,20").unwrap();
        writeln!(file, "120,5").unwrap();
        file.flush().unwrap();

        let mut agent = CsvInflowAgent::new(
            "csv_1",
            bus.clone(),
            file.path(),
            "time",
            "inflow",
            "inflow/res_1",
        )
        .unwrap();

        agent.run(0.0).unwrap();
        assert_eq!(seen.get(), 10.0);
        agent.run(59.0).unwrap();
        assert_eq!(seen.get(), 10.0);
        agent.run(60.0).unwrap();
        assert_eq!(seen.get(), 20.0);
        agent.run(1000.0).unwrap();
        assert_eq!(seen.get(), 5.0);
    }

    #[test]
    fn test_csv_missing_column_rejected() {
        let bus = MessageBus::new();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "time,inflow").unwrap();
        writeln!(file, "0,10").unwrap();
        file.flush().unwrap();
        let err = CsvInflowAgent::new("c", bus, file.path(), "time", "missing", "t")
            .err()
            .expect("expected error");
        assert!(matches!(err, SimulationError::InvalidConfig(_)));
    }
}
