//! Digital twin (perception) agent
//!
//! Acts as the sensor feed for one physical component: every tick it reads
//! the component's state and publishes it on a state topic. Optional
//! exponential-moving-average smoothing is applied to the configured keys
//! only; all other keys pass through unchanged.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use serde::Deserialize;
use tracing::info;

use crate::agents::Agent;
use crate::bus::{FieldMap, MessageBus};
use crate::core::error::SimulationError;
use crate::models::PhysicalComponent;

fn default_alpha() -> f64 {
    0.3
}

/// EMA smoothing configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SmoothingConfig {
    /// Weight of the newest sample, in (0, 1]
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    /// State keys to smooth; keys not listed pass through unchanged
    pub keys: Vec<String>,
}

/// Publishes a component's (optionally smoothed) state each tick
pub struct DigitalTwinAgent {
    id: String,
    component: Rc<RefCell<dyn PhysicalComponent>>,
    bus: Rc<MessageBus>,
    state_topic: String,
    smoothing: Option<SmoothingConfig>,
    ema: BTreeMap<String, f64>,
}

impl DigitalTwinAgent {
    pub fn new(
        id: &str,
        component: Rc<RefCell<dyn PhysicalComponent>>,
        bus: Rc<MessageBus>,
        state_topic: &str,
        smoothing: Option<SmoothingConfig>,
    ) -> Result<Self, SimulationError> {
        if let Some(cfg) = &smoothing {
            if !(cfg.alpha > 0.0 && cfg.alpha <= 1.0) {
                return Err(SimulationError::InvalidConfig(format!(
                    "smoothing alpha must be in (0, 1], got {}",
                    cfg.alpha
                )));
            }
        }
        info!(
            id,
            component = component.borrow().id(),
            state_topic,
            "digital twin created"
        );
        Ok(Self {
            id: id.to_string(),
            component,
            bus,
            state_topic: state_topic.to_string(),
            smoothing,
            ema: BTreeMap::new(),
        })
    }

    fn smoothed(&mut self, state: FieldMap) -> FieldMap {
        let Some(cfg) = &self.smoothing else {
            return state;
        };
        let mut out = state;
        for key in &cfg.keys {
            if let Some(raw) = out.get(key).copied() {
                let value = match self.ema.get(key) {
                    Some(prev) => cfg.alpha * raw + (1.0 - cfg.alpha) * prev,
                    None => raw,
                };
                self.ema.insert(key.clone(), value);
                out.insert(key.clone(), value);
            }
        }
        out
    }
}

impl Agent for DigitalTwinAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn run(&mut self, _current_time: f64) -> Result<(), SimulationError> {
        let state = self.component.borrow().state();
        let message = self.smoothed(state);
        self.bus.publish(&self.state_topic, message)?;
        Ok(())
    }
}
