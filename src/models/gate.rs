//! Controllable gate model
//!
//! Outflow follows the orifice equation from the upstream and downstream
//! heads; the opening tracks a target subject to an actuation rate limit.
//! The target comes either from the harness (`control_signal` in the step
//! input, orchestrated mode) or from action messages on the bus.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use serde::Deserialize;
use tracing::{debug, info};

use crate::bus::{HandlerError, MessageBus};
use crate::models::{
    IdentificationBatch, ModelError, Parameters, PhysicalComponent, State, StepInput, GRAVITY,
};

fn default_discharge_coefficient() -> f64 {
    0.6
}
fn default_width() -> f64 {
    2.0
}
fn default_max_opening() -> f64 {
    1.0
}
fn default_max_rate_of_change() -> f64 {
    0.05
}

/// Construction parameters
#[derive(Debug, Clone, Deserialize)]
pub struct GateParameters {
    #[serde(default = "default_discharge_coefficient")]
    pub discharge_coefficient: f64,
    #[serde(default = "default_width")]
    pub width: f64,
    #[serde(default = "default_max_opening")]
    pub max_opening: f64,
    /// Maximum opening change per second
    #[serde(default = "default_max_rate_of_change")]
    pub max_rate_of_change: f64,
}

impl Default for GateParameters {
    fn default() -> Self {
        Self {
            discharge_coefficient: default_discharge_coefficient(),
            width: default_width(),
            max_opening: default_max_opening(),
            max_rate_of_change: default_max_rate_of_change(),
        }
    }
}

/// A controllable gate
pub struct Gate {
    id: String,
    discharge_coefficient: f64,
    width: f64,
    max_opening: f64,
    max_rate_of_change: f64,

    opening: f64,
    outflow: f64,
    target_opening: f64,
    /// Head difference seen on the last step, kept for the inverse orifice
    /// calculation when a flow target arrives before any step has run
    last_head_diff: f64,
    external_inflow: f64,
}

impl Gate {
    pub fn new(id: &str, initial_state: &State, params: GateParameters) -> Result<Self, ModelError> {
        if !(params.discharge_coefficient > 0.0 && params.discharge_coefficient <= 1.5) {
            return Err(ModelError::InvalidParameter {
                name: "discharge_coefficient",
                reason: format!("must be in (0, 1.5], got {}", params.discharge_coefficient),
            });
        }
        if !(params.width > 0.0) {
            return Err(ModelError::InvalidParameter {
                name: "width",
                reason: format!("must be > 0, got {}", params.width),
            });
        }
        if !(params.max_opening > 0.0) {
            return Err(ModelError::InvalidParameter {
                name: "max_opening",
                reason: format!("must be > 0, got {}", params.max_opening),
            });
        }
        if !(params.max_rate_of_change > 0.0) {
            return Err(ModelError::InvalidParameter {
                name: "max_rate_of_change",
                reason: format!("must be > 0, got {}", params.max_rate_of_change),
            });
        }

        let opening = initial_state
            .get("opening")
            .copied()
            .unwrap_or(0.0)
            .clamp(0.0, params.max_opening);

        info!(id, opening, "gate created");
        Ok(Self {
            id: id.to_string(),
            discharge_coefficient: params.discharge_coefficient,
            width: params.width,
            max_opening: params.max_opening,
            max_rate_of_change: params.max_rate_of_change,
            opening,
            outflow: initial_state.get("outflow").copied().unwrap_or(0.0),
            target_opening: opening,
            last_head_diff: 1.0,
            external_inflow: 0.0,
        })
    }

    /// Subscribe the gate's action handler on `action_topic`
    ///
    /// Accepted payload keys: `control_signal` or `target_opening` for a
    /// direct opening target, `gate_target_outflow` for a flow target
    /// converted through the inverse orifice relation.
    pub fn connect_bus(this: &Rc<RefCell<Self>>, bus: &Rc<MessageBus>, action_topic: &str) {
        let label = this.borrow().id.clone();
        let weak = Rc::downgrade(this);
        bus.subscribe(action_topic, &label, move |msg| {
            let this = weak.upgrade().ok_or(HandlerError::SubscriberGone)?;
            let mut gate = this.try_borrow_mut().map_err(|_| HandlerError::Reentrant)?;
            if let Some(target) = msg.get("control_signal").or_else(|| msg.get("target_opening")) {
                gate.target_opening = target;
            } else if let Some(flow) = msg.get("gate_target_outflow") {
                gate.target_opening = gate.opening_for_flow(flow);
            }
            Ok(())
        });
        debug!(id = this.borrow().id.as_str(), action_topic, "gate subscribed");
    }

    /// Orifice flow `Q = C_d * W * opening * sqrt(2 g (h_up - h_down))`
    fn flow(&self, opening: f64, upstream: f64, downstream: f64, c_d: f64) -> f64 {
        let head = upstream - downstream;
        if head <= 0.0 {
            return 0.0;
        }
        c_d * self.width * opening * (2.0 * GRAVITY * head).sqrt()
    }

    /// Inverse orifice: opening that realizes `target_flow` under the last
    /// observed head difference
    fn opening_for_flow(&self, target_flow: f64) -> f64 {
        if self.last_head_diff <= 0.0 {
            return 0.0;
        }
        let denominator = self.discharge_coefficient
            * self.width
            * (2.0 * GRAVITY * self.last_head_diff).sqrt();
        if denominator == 0.0 {
            return self.max_opening;
        }
        (target_flow / denominator).clamp(0.0, self.max_opening)
    }
}

impl PhysicalComponent for Gate {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> State {
        State::from([
            ("opening".to_string(), self.opening),
            ("outflow".to_string(), self.outflow),
        ])
    }

    fn parameters(&self) -> Parameters {
        Parameters::from([
            ("discharge_coefficient".to_string(), self.discharge_coefficient),
            ("width".to_string(), self.width),
            ("max_opening".to_string(), self.max_opening),
            ("max_rate_of_change".to_string(), self.max_rate_of_change),
        ])
    }

    fn set_state(&mut self, key: &str, value: f64) {
        match key {
            "opening" => self.opening = value.clamp(0.0, self.max_opening),
            "outflow" => self.outflow = value,
            "target_opening" => self.target_opening = value,
            other => debug!(id = self.id.as_str(), key = other, "ignored unknown state key"),
        }
    }

    fn set_inflow(&mut self, value: f64) {
        self.external_inflow = value;
    }

    fn step(&mut self, input: &StepInput, dt: f64) -> Result<State, ModelError> {
        if let Some(signal) = input.control_signal {
            self.target_opening = signal;
        }

        // Move toward the target, at most max_rate_of_change * dt per tick
        let max_delta = self.max_rate_of_change * dt;
        let delta = (self.target_opening - self.opening).clamp(-max_delta, max_delta);
        self.opening = (self.opening + delta).clamp(0.0, self.max_opening);

        let upstream = input.upstream_head_or_zero(&self.id);
        let downstream = input.downstream_head_or_zero(&self.id);
        self.last_head_diff = upstream - downstream;
        self.outflow = self.flow(self.opening, upstream, downstream, self.discharge_coefficient);

        if !self.outflow.is_finite() {
            return Err(ModelError::NonFinite { key: "outflow" });
        }
        Ok(self.state())
    }

    fn identify_parameters(&mut self, batch: &IdentificationBatch) -> Result<Parameters, ModelError> {
        let up = batch.series("upstream_levels")?;
        let down = batch.series("downstream_levels")?;
        let openings = batch.series("openings")?;
        let flows = batch.series("observed_flows")?;
        let n = up.len().min(down.len()).min(openings.len()).min(flows.len());
        if n < 2 {
            return Err(ModelError::InsufficientData(format!(
                "need at least 2 aligned samples, got {}",
                n
            )));
        }

        // Q_i = C * k_i with k_i = W * opening_i * sqrt(2 g h_i): the least
        // squares C has a closed form
        let mut num = 0.0;
        let mut den = 0.0;
        for i in 0..n {
            let head = up[i] - down[i];
            if head <= 0.0 {
                continue;
            }
            let k = self.width * openings[i] * (2.0 * GRAVITY * head).sqrt();
            num += k * flows[i];
            den += k * k;
        }
        if den == 0.0 {
            return Err(ModelError::InsufficientData(
                "no samples with positive head".to_string(),
            ));
        }
        let fitted = (num / den).clamp(0.1, 1.0);
        info!(
            id = self.id.as_str(),
            discharge_coefficient = fitted,
            "gate identification applied"
        );
        self.discharge_coefficient = fitted;

        let mut summary = BTreeMap::new();
        summary.insert("discharge_coefficient".to_string(), fitted);
        summary.insert("samples".to_string(), n as f64);
        Ok(summary)
    }
}
