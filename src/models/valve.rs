//! Valve model
//!
//! A fractional device: the opening percentage scales either the upstream
//! feed (when the valve sits inline in a flow path) or an orifice flow
//! computed from the head difference. Opening changes are rate limited.

use std::cell::RefCell;
use std::f64::consts::PI;
use std::rc::Rc;

use serde::Deserialize;
use tracing::{debug, info};

use crate::bus::{HandlerError, MessageBus};
use crate::models::{ModelError, Parameters, PhysicalComponent, State, StepInput, GRAVITY};

fn default_discharge_coefficient() -> f64 {
    0.8
}
fn default_diameter() -> f64 {
    0.5
}
fn default_max_rate_of_change() -> f64 {
    100.0
}

/// Construction parameters
#[derive(Debug, Clone, Deserialize)]
pub struct ValveParameters {
    #[serde(default = "default_discharge_coefficient")]
    pub discharge_coefficient: f64,
    #[serde(default = "default_diameter")]
    pub diameter: f64,
    /// Maximum opening change in percent per second
    #[serde(default = "default_max_rate_of_change")]
    pub max_rate_of_change: f64,
}

impl Default for ValveParameters {
    fn default() -> Self {
        Self {
            discharge_coefficient: default_discharge_coefficient(),
            diameter: default_diameter(),
            max_rate_of_change: default_max_rate_of_change(),
        }
    }
}

/// A controllable valve; opening in percent [0, 100]
pub struct Valve {
    id: String,
    discharge_coefficient: f64,
    diameter: f64,
    max_rate_of_change: f64,

    opening: f64,
    target_opening: f64,
    outflow: f64,
    external_inflow: f64,
}

impl Valve {
    pub fn new(id: &str, initial_state: &State, params: ValveParameters) -> Result<Self, ModelError> {
        if !(params.discharge_coefficient > 0.0 && params.discharge_coefficient <= 1.5) {
            return Err(ModelError::InvalidParameter {
                name: "discharge_coefficient",
                reason: format!("must be in (0, 1.5], got {}", params.discharge_coefficient),
            });
        }
        if !(params.diameter > 0.0) {
            return Err(ModelError::InvalidParameter {
                name: "diameter",
                reason: format!("must be > 0, got {}", params.diameter),
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
            .unwrap_or(100.0)
            .clamp(0.0, 100.0);
        info!(id, opening, "valve created");
        Ok(Self {
            id: id.to_string(),
            discharge_coefficient: params.discharge_coefficient,
            diameter: params.diameter,
            max_rate_of_change: params.max_rate_of_change,
            opening,
            target_opening: opening,
            outflow: initial_state.get("outflow").copied().unwrap_or(0.0),
            external_inflow: 0.0,
        })
    }

    /// Subscribe the valve's action handler; `control_signal` in percent
    pub fn connect_bus(this: &Rc<RefCell<Self>>, bus: &Rc<MessageBus>, action_topic: &str) {
        let label = this.borrow().id.clone();
        let weak = Rc::downgrade(this);
        bus.subscribe(action_topic, &label, move |msg| {
            let this = weak.upgrade().ok_or(HandlerError::SubscriberGone)?;
            let mut valve = this.try_borrow_mut().map_err(|_| HandlerError::Reentrant)?;
            if let Some(signal) = msg.get("control_signal") {
                valve.target_opening = signal.clamp(0.0, 100.0);
            }
            Ok(())
        });
        debug!(id = this.borrow().id.as_str(), action_topic, "valve subscribed");
    }

    fn orifice_flow(&self, upstream: f64, downstream: f64) -> f64 {
        let head = upstream - downstream;
        if head <= 0.0 {
            return 0.0;
        }
        let effective_cd = self.discharge_coefficient * self.opening / 100.0;
        let area = PI * (self.diameter / 2.0) * (self.diameter / 2.0);
        effective_cd * area * (2.0 * GRAVITY * head).sqrt()
    }
}

impl PhysicalComponent for Valve {
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
            ("diameter".to_string(), self.diameter),
            ("max_rate_of_change".to_string(), self.max_rate_of_change),
        ])
    }

    fn set_state(&mut self, key: &str, value: f64) {
        match key {
            "opening" => {
                self.opening = value.clamp(0.0, 100.0);
                self.target_opening = self.opening;
            }
            "outflow" => self.outflow = value,
            other => debug!(id = self.id.as_str(), key = other, "ignored unknown state key"),
        }
    }

    fn set_inflow(&mut self, value: f64) {
        self.external_inflow = value;
    }

    fn step(&mut self, input: &StepInput, dt: f64) -> Result<State, ModelError> {
        if let Some(signal) = input.control_signal {
            self.target_opening = signal.clamp(0.0, 100.0);
        }

        let max_delta = self.max_rate_of_change * dt;
        let delta = (self.target_opening - self.opening).clamp(-max_delta, max_delta);
        self.opening = (self.opening + delta).clamp(0.0, 100.0);

        let total_inflow = input.inflow + self.external_inflow;
        self.outflow = if total_inflow > 0.0 {
            // Inline in a flow path: pass the feed scaled by the opening
            total_inflow * self.opening / 100.0
        } else {
            let upstream = input.upstream_head_or_zero(&self.id);
            let downstream = input.downstream_head_or_zero(&self.id);
            self.orifice_flow(upstream, downstream)
        };

        if !self.outflow.is_finite() {
            return Err(ModelError::NonFinite { key: "outflow" });
        }
        Ok(self.state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valve() -> Valve {
        Valve::new("valve_1", &State::new(), ValveParameters::default()).unwrap()
    }

    #[test]
    fn test_pass_through_scaled_by_opening() {
        let mut v = valve();
        let input = StepInput {
            inflow: 8.0,
            control_signal: Some(50.0),
            ..Default::default()
        };
        let state = v.step(&input, 1.0).unwrap();
        assert_eq!(state["opening"], 50.0);
        assert_eq!(state["outflow"], 4.0);
    }

    #[test]
    fn test_closed_valve_blocks_flow() {
        let mut v = valve();
        let input = StepInput {
            inflow: 8.0,
            control_signal: Some(0.0),
            ..Default::default()
        };
        let state = v.step(&input, 1.0).unwrap();
        assert_eq!(state["outflow"], 0.0);
    }

    #[test]
    fn test_orifice_mode_without_inflow() {
        let mut v = valve();
        let input = StepInput {
            upstream_head: Some(5.0),
            downstream_head: Some(1.0),
            ..Default::default()
        };
        let state = v.step(&input, 1.0).unwrap();
        let area = PI * 0.25 * 0.25;
        let expected = 0.8 * area * (2.0 * GRAVITY * 4.0_f64).sqrt();
        assert!((state["outflow"] - expected).abs() < 1e-9);
    }

    #[test]
    fn test_rate_limited_opening_change() {
        let initial = State::from([("opening".to_string(), 0.0)]);
        let mut v = Valve::new(
            "v",
            &initial,
            ValveParameters {
                max_rate_of_change: 10.0,
                ..Default::default()
            },
        )
        .unwrap();
        let input = StepInput {
            control_signal: Some(100.0),
            ..Default::default()
        };
        let state = v.step(&input, 1.0).unwrap();
        assert_eq!(state["opening"], 10.0);
    }

    #[test]
    fn test_bus_command_clamped_to_percent_range() {
        let bus = MessageBus::new();
        let valve = Rc::new(RefCell::new(valve()));
        Valve::connect_bus(&valve, &bus, "action/valve/1");
        bus.publish("action/valve/1", crate::bus::payload(&[("control_signal", 180.0)]))
            .unwrap();
        let state = valve.borrow_mut().step(&StepInput::default(), 1.0).unwrap();
        assert_eq!(state["opening"], 100.0);
    }
}
