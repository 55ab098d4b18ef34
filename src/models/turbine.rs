//! Hydropower turbine model
//!
//! Releases a commanded flow through a head difference and generates
//! `P = eta * rho * g * Q * H`. Flow targets arrive as `target_outflow`
//! action messages (typically from a hydropower station agent) or as a
//! direct control signal; actuation is rate limited and bounded by the
//! device's rated flow. No generation without positive head.

use std::cell::RefCell;
use std::rc::Rc;

use serde::Deserialize;
use tracing::{debug, info};

use crate::bus::{HandlerError, MessageBus};
use crate::models::{
    ModelError, Parameters, PhysicalComponent, State, StepInput, GRAVITY, WATER_DENSITY,
};

fn default_efficiency() -> f64 {
    0.9
}
fn default_max_flow_rate() -> f64 {
    100.0
}
fn default_max_rate_of_change() -> f64 {
    50.0
}

/// Construction parameters
#[derive(Debug, Clone, Deserialize)]
pub struct TurbineParameters {
    #[serde(default = "default_efficiency")]
    pub efficiency: f64,
    #[serde(default = "default_max_flow_rate")]
    pub max_flow_rate: f64,
    /// Maximum flow change per second
    #[serde(default = "default_max_rate_of_change")]
    pub max_rate_of_change: f64,
}

impl Default for TurbineParameters {
    fn default() -> Self {
        Self {
            efficiency: default_efficiency(),
            max_flow_rate: default_max_flow_rate(),
            max_rate_of_change: default_max_rate_of_change(),
        }
    }
}

/// A hydropower turbine
pub struct WaterTurbine {
    id: String,
    efficiency: f64,
    max_flow_rate: f64,
    max_rate_of_change: f64,

    outflow: f64,
    target_outflow: f64,
    /// Generated power in watts
    power: f64,
    external_inflow: f64,
}

impl WaterTurbine {
    pub fn new(
        id: &str,
        initial_state: &State,
        params: TurbineParameters,
    ) -> Result<Self, ModelError> {
        if !(params.efficiency > 0.0 && params.efficiency <= 1.0) {
            return Err(ModelError::InvalidParameter {
                name: "efficiency",
                reason: format!("must be in (0, 1], got {}", params.efficiency),
            });
        }
        if !(params.max_flow_rate > 0.0) {
            return Err(ModelError::InvalidParameter {
                name: "max_flow_rate",
                reason: format!("must be > 0, got {}", params.max_flow_rate),
            });
        }
        if !(params.max_rate_of_change > 0.0) {
            return Err(ModelError::InvalidParameter {
                name: "max_rate_of_change",
                reason: format!("must be > 0, got {}", params.max_rate_of_change),
            });
        }

        let outflow = initial_state
            .get("outflow")
            .copied()
            .unwrap_or(0.0)
            .clamp(0.0, params.max_flow_rate);
        info!(id, outflow, "turbine created");
        Ok(Self {
            id: id.to_string(),
            efficiency: params.efficiency,
            max_flow_rate: params.max_flow_rate,
            max_rate_of_change: params.max_rate_of_change,
            outflow,
            target_outflow: outflow,
            power: 0.0,
            external_inflow: 0.0,
        })
    }

    /// Subscribe the turbine's action handler
    ///
    /// Accepted payload keys: `target_outflow` or `control_signal`, both a
    /// flow target in m^3/s.
    pub fn connect_bus(this: &Rc<RefCell<Self>>, bus: &Rc<MessageBus>, action_topic: &str) {
        let label = this.borrow().id.clone();
        let weak = Rc::downgrade(this);
        bus.subscribe(action_topic, &label, move |msg| {
            let this = weak.upgrade().ok_or(HandlerError::SubscriberGone)?;
            let mut turbine = this.try_borrow_mut().map_err(|_| HandlerError::Reentrant)?;
            if let Some(target) = msg.get("target_outflow").or_else(|| msg.get("control_signal")) {
                let max = turbine.max_flow_rate;
                turbine.target_outflow = target.clamp(0.0, max);
            }
            Ok(())
        });
        debug!(id = this.borrow().id.as_str(), action_topic, "turbine subscribed");
    }
}

impl PhysicalComponent for WaterTurbine {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> State {
        State::from([
            ("outflow".to_string(), self.outflow),
            ("power".to_string(), self.power),
        ])
    }

    fn parameters(&self) -> Parameters {
        Parameters::from([
            ("efficiency".to_string(), self.efficiency),
            ("max_flow_rate".to_string(), self.max_flow_rate),
            ("max_rate_of_change".to_string(), self.max_rate_of_change),
        ])
    }

    fn set_state(&mut self, key: &str, value: f64) {
        match key {
            "outflow" => {
                self.outflow = value.clamp(0.0, self.max_flow_rate);
                self.target_outflow = self.outflow;
            }
            "power" => self.power = value,
            other => debug!(id = self.id.as_str(), key = other, "ignored unknown state key"),
        }
    }

    fn set_inflow(&mut self, value: f64) {
        self.external_inflow = value;
    }

    fn step(&mut self, input: &StepInput, dt: f64) -> Result<State, ModelError> {
        if let Some(signal) = input.control_signal {
            self.target_outflow = signal.clamp(0.0, self.max_flow_rate);
        }

        let upstream = input.upstream_head_or_zero(&self.id);
        let downstream = input.downstream_head_or_zero(&self.id);
        let head = upstream - downstream;

        let target = if head > 0.0 { self.target_outflow } else { 0.0 };
        let max_delta = self.max_rate_of_change * dt;
        let delta = (target - self.outflow).clamp(-max_delta, max_delta);
        self.outflow = (self.outflow + delta).clamp(0.0, self.max_flow_rate);

        self.power = if head > 0.0 {
            self.efficiency * WATER_DENSITY * GRAVITY * self.outflow * head
        } else {
            0.0
        };

        if !self.outflow.is_finite() || !self.power.is_finite() {
            return Err(ModelError::NonFinite { key: "outflow" });
        }
        Ok(self.state())
    }
}
