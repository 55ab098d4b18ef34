//! Parameter identification agent
//!
//! Collects time-aligned samples from configured data topics. Once enough
//! new samples have arrived it hands the batch to its target component's
//! `identify_parameters`, publishes the resulting summary on
//! `identified_parameters/<component>`, and clears the buffer for the next
//! cycle. Identification runs inline and blocks tick progress; long fits
//! show up as a latency spike on the tick that triggers them.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use serde::Deserialize;
use tracing::{info, warn};

use crate::agents::Agent;
use crate::bus::{HandlerError, MessageBus};
use crate::core::error::SimulationError;
use crate::models::{IdentificationBatch, PhysicalComponent};

fn default_data_key() -> String {
    "value".to_string()
}
fn default_interval() -> usize {
    100
}

/// Where one model series comes from
#[derive(Debug, Clone, Deserialize)]
pub struct DataSource {
    pub topic: String,
    /// Payload key to extract
    #[serde(default = "default_data_key")]
    pub key: String,
}

/// Configuration for [`ParameterIdentificationAgent`]
#[derive(Debug, Clone, Deserialize)]
pub struct IdentificationConfig {
    /// Model series name (as expected by `identify_parameters`) to source
    pub data_map: BTreeMap<String, DataSource>,
    /// New samples on the primary series required to trigger a fit
    #[serde(default = "default_interval")]
    pub identification_interval: usize,
}

/// Orchestrates the data-collection / fit / publish cycle for one model
pub struct ParameterIdentificationAgent {
    id: String,
    bus: Rc<MessageBus>,
    target: Rc<RefCell<dyn PhysicalComponent>>,
    interval: usize,
    dt: f64,
    /// Collected samples per model series
    history: Rc<RefCell<BTreeMap<String, Vec<f64>>>>,
    /// New samples on the primary series since the last fit
    new_samples: Rc<RefCell<usize>>,
}

impl ParameterIdentificationAgent {
    /// Create the agent and subscribe its data handlers
    pub fn spawn(
        id: &str,
        bus: &Rc<MessageBus>,
        target: Rc<RefCell<dyn PhysicalComponent>>,
        config: IdentificationConfig,
        dt: f64,
    ) -> Result<Rc<RefCell<Self>>, SimulationError> {
        if config.data_map.is_empty() {
            return Err(SimulationError::InvalidConfig(
                "identification data_map must not be empty".to_string(),
            ));
        }
        if config.identification_interval == 0 {
            return Err(SimulationError::InvalidConfig(
                "identification_interval must be > 0".to_string(),
            ));
        }

        let history = Rc::new(RefCell::new(
            config
                .data_map
                .keys()
                .map(|k| (k.clone(), Vec::new()))
                .collect::<BTreeMap<_, _>>(),
        ));
        let new_samples = Rc::new(RefCell::new(0));

        // The first series (in name order) is the primary counter stream
        let primary = config.data_map.keys().next().cloned().unwrap();

        for (series, source) in &config.data_map {
            let history = Rc::clone(&history);
            let new_samples = Rc::clone(&new_samples);
            let series = series.clone();
            let key = source.key.clone();
            let is_primary = series == primary;
            let label = format!("{}/{}", id, series);
            bus.subscribe(&source.topic, &label, move |msg| {
                let Some(value) = msg.get(&key) else {
                    return Ok(());
                };
                let mut history = history
                    .try_borrow_mut()
                    .map_err(|_| HandlerError::Reentrant)?;
                history.get_mut(&series).unwrap().push(value);
                if is_primary {
                    *new_samples.borrow_mut() += 1;
                }
                Ok(())
            });
        }

        info!(
            id,
            target = target.borrow().id(),
            interval = config.identification_interval,
            "identification agent created"
        );
        Ok(Rc::new(RefCell::new(Self {
            id: id.to_string(),
            bus: Rc::clone(bus),
            target,
            interval: config.identification_interval,
            dt,
            history,
            new_samples,
        })))
    }

    fn clear(&self) {
        for series in self.history.borrow_mut().values_mut() {
            series.clear();
        }
        *self.new_samples.borrow_mut() = 0;
    }
}

impl Agent for ParameterIdentificationAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn run(&mut self, current_time: f64) -> Result<(), SimulationError> {
        if *self.new_samples.borrow() < self.interval {
            return Ok(());
        }

        // Truncate all series to a common length before fitting
        let mut batch = IdentificationBatch::new(self.dt);
        {
            let history = self.history.borrow();
            let min_len = history.values().map(|v| v.len()).min().unwrap_or(0);
            if min_len < 2 {
                warn!(id = self.id.as_str(), min_len, "not enough aligned data, skipping fit");
                return Ok(());
            }
            for (name, series) in history.iter() {
                batch
                    .series
                    .insert(name.clone(), series[..min_len].to_vec());
            }
        }

        let target_id = self.target.borrow().id().to_string();
        info!(
            id = self.id.as_str(),
            target = target_id.as_str(),
            current_time,
            samples = batch.common_len(),
            "triggering parameter identification"
        );
        match self.target.borrow_mut().identify_parameters(&batch) {
            Ok(summary) => {
                let topic = format!("identified_parameters/{}", target_id);
                self.bus.publish(&topic, summary)?;
            }
            Err(err) => {
                // A failed fit is not fatal to the run; keep simulating
                // with the previous parameters.
                warn!(id = self.id.as_str(), error = %err, "parameter identification failed");
            }
        }
        self.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::payload;
    use crate::models::{Gate, GateParameters, State, GRAVITY};
    use std::cell::Cell;

    #[test]
    fn test_identification_cycle_fits_and_publishes() {
        let bus = MessageBus::new();
        let initial = State::from([("opening".to_string(), 0.5)]);
        let gate = Rc::new(RefCell::new(
            Gate::new(
                "gate_1",
                &initial,
                GateParameters {
                    discharge_coefficient: 0.9,
                    width: 4.0,
                    ..Default::default()
                },
            )
            .unwrap(),
        ));

        let mut data_map = BTreeMap::new();
        for (series, topic) in [
            ("upstream_levels", "obs/up"),
            ("downstream_levels", "obs/down"),
            ("openings", "obs/opening"),
            ("observed_flows", "obs/flow"),
        ] {
            data_map.insert(
                series.to_string(),
                DataSource {
                    topic: topic.to_string(),
                    key: "value".to_string(),
                },
            );
        }
        let agent = ParameterIdentificationAgent::spawn(
            "ident_1",
            &bus,
            gate.clone(),
            IdentificationConfig {
                data_map,
                identification_interval: 10,
            },
            1.0,
        )
        .unwrap();

        let published = Rc::new(Cell::new(f64::NAN));
        let sink = Rc::clone(&published);
        bus.subscribe("identified_parameters/gate_1", "probe", move |msg| {
            sink.set(msg.get("discharge_coefficient").unwrap());
            Ok(())
        });

        // Stream 10 consistent samples generated with C = 0.55
        let true_c = 0.55;
        for i in 0..10 {
            let up = 5.0 + i as f64 * 0.2;
            let down = 1.0;
            let opening = 0.3 + i as f64 * 0.05;
            let flow = true_c * 4.0 * opening * (2.0 * GRAVITY * (up - down)).sqrt();
            bus.publish("obs/up", payload(&[("value", up)])).unwrap();
            bus.publish("obs/down", payload(&[("value", down)])).unwrap();
            bus.publish("obs/opening", payload(&[("value", opening)]))
                .unwrap();
            bus.publish("obs/flow", payload(&[("value", flow)])).unwrap();
        }

        agent.borrow_mut().run(10.0).unwrap();
        assert!((published.get() - true_c).abs() < 1e-9);
        // Gate parameters were updated in place
        assert!(
            (gate.borrow().parameters()["discharge_coefficient"] - true_c).abs() < 1e-9
        );
        // Buffer cleared: running again does not re-fit
        published.set(f64::NAN);
        agent.borrow_mut().run(11.0).unwrap();
        assert!(published.get().is_nan());
    }
}
