//! Pump model
//!
//! An on/off device that lifts water against a head difference. Delivers
//! its rated flow while running, nothing when the required lift exceeds
//! `max_head`. Commands arrive as 0/1 control signals, either from the
//! harness or over the bus.

use std::cell::RefCell;
use std::rc::Rc;

use serde::Deserialize;
use tracing::{debug, info};

use crate::bus::{HandlerError, MessageBus};
use crate::models::{ModelError, Parameters, PhysicalComponent, State, StepInput};

fn default_max_flow_rate() -> f64 {
    10.0
}
fn default_max_head() -> f64 {
    20.0
}
fn default_power_consumption_kw() -> f64 {
    50.0
}

/// Construction parameters
#[derive(Debug, Clone, Deserialize)]
pub struct PumpParameters {
    #[serde(default = "default_max_flow_rate")]
    pub max_flow_rate: f64,
    /// Largest lift (downstream minus upstream head) the pump can work against
    #[serde(default = "default_max_head")]
    pub max_head: f64,
    #[serde(default = "default_power_consumption_kw")]
    pub power_consumption_kw: f64,
}

impl Default for PumpParameters {
    fn default() -> Self {
        Self {
            max_flow_rate: default_max_flow_rate(),
            max_head: default_max_head(),
            power_consumption_kw: default_power_consumption_kw(),
        }
    }
}

/// An on/off pump
pub struct Pump {
    id: String,
    max_flow_rate: f64,
    max_head: f64,
    power_consumption_kw: f64,

    status: u8,
    target_status: u8,
    outflow: f64,
    power_draw_kw: f64,
    external_inflow: f64,
}

impl Pump {
    pub fn new(id: &str, initial_state: &State, params: PumpParameters) -> Result<Self, ModelError> {
        if !(params.max_flow_rate > 0.0) {
            return Err(ModelError::InvalidParameter {
                name: "max_flow_rate",
                reason: format!("must be > 0, got {}", params.max_flow_rate),
            });
        }
        if !(params.max_head > 0.0) {
            return Err(ModelError::InvalidParameter {
                name: "max_head",
                reason: format!("must be > 0, got {}", params.max_head),
            });
        }
        if params.power_consumption_kw < 0.0 {
            return Err(ModelError::InvalidParameter {
                name: "power_consumption_kw",
                reason: format!("must be >= 0, got {}", params.power_consumption_kw),
            });
        }

        let status = if initial_state.get("status").copied().unwrap_or(0.0) >= 0.5 {
            1
        } else {
            0
        };
        info!(id, status, "pump created");
        Ok(Self {
            id: id.to_string(),
            max_flow_rate: params.max_flow_rate,
            max_head: params.max_head,
            power_consumption_kw: params.power_consumption_kw,
            status,
            target_status: status,
            outflow: 0.0,
            power_draw_kw: 0.0,
            external_inflow: 0.0,
        })
    }

    /// Subscribe the pump's action handler; `control_signal` of 0 or 1
    pub fn connect_bus(this: &Rc<RefCell<Self>>, bus: &Rc<MessageBus>, action_topic: &str) {
        let label = this.borrow().id.clone();
        let weak = Rc::downgrade(this);
        bus.subscribe(action_topic, &label, move |msg| {
            let this = weak.upgrade().ok_or(HandlerError::SubscriberGone)?;
            let mut pump = this.try_borrow_mut().map_err(|_| HandlerError::Reentrant)?;
            if let Some(signal) = msg.get("control_signal") {
                if signal == 0.0 || signal == 1.0 {
                    pump.target_status = signal as u8;
                }
            }
            Ok(())
        });
        debug!(id = this.borrow().id.as_str(), action_topic, "pump subscribed");
    }

    fn flow(&self, upstream: f64, downstream: f64) -> f64 {
        if self.status == 0 {
            return 0.0;
        }
        let required_lift = downstream - upstream;
        if required_lift > self.max_head {
            return 0.0;
        }
        self.max_flow_rate
    }
}

impl PhysicalComponent for Pump {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> State {
        State::from([
            ("status".to_string(), self.status as f64),
            ("outflow".to_string(), self.outflow),
            ("power_draw_kw".to_string(), self.power_draw_kw),
        ])
    }

    fn parameters(&self) -> Parameters {
        Parameters::from([
            ("max_flow_rate".to_string(), self.max_flow_rate),
            ("max_head".to_string(), self.max_head),
            ("power_consumption_kw".to_string(), self.power_consumption_kw),
        ])
    }

    fn set_state(&mut self, key: &str, value: f64) {
        match key {
            "status" => {
                self.status = if value >= 0.5 { 1 } else { 0 };
                self.target_status = self.status;
            }
            "outflow" => self.outflow = value,
            other => debug!(id = self.id.as_str(), key = other, "ignored unknown state key"),
        }
    }

    fn set_inflow(&mut self, value: f64) {
        self.external_inflow = value;
    }

    fn step(&mut self, input: &StepInput, _dt: f64) -> Result<State, ModelError> {
        if let Some(signal) = input.control_signal {
            if signal == 0.0 || signal == 1.0 {
                self.target_status = signal as u8;
            }
        }
        self.status = self.target_status;

        let upstream = input.upstream_head_or_zero(&self.id);
        let downstream = input.downstream_head_or_zero(&self.id);
        self.outflow = self.flow(upstream, downstream);
        self.power_draw_kw = if self.outflow > 0.0 {
            self.power_consumption_kw
        } else {
            0.0
        };
        Ok(self.state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pump() -> Pump {
        Pump::new("pump_1", &State::new(), PumpParameters::default()).unwrap()
    }

    #[test]
    fn test_off_pump_delivers_nothing() {
        let mut p = pump();
        let state = p.step(&StepInput::default(), 1.0).unwrap();
        assert_eq!(state["outflow"], 0.0);
        assert_eq!(state["power_draw_kw"], 0.0);
    }

    #[test]
    fn test_on_pump_delivers_rated_flow() {
        let mut p = pump();
        let input = StepInput {
            control_signal: Some(1.0),
            upstream_head: Some(2.0),
            downstream_head: Some(10.0),
            ..Default::default()
        };
        let state = p.step(&input, 1.0).unwrap();
        assert_eq!(state["status"], 1.0);
        assert_eq!(state["outflow"], 10.0);
        assert_eq!(state["power_draw_kw"], 50.0);
    }

    #[test]
    fn test_lift_above_max_head_stalls() {
        let mut p = pump();
        let input = StepInput {
            control_signal: Some(1.0),
            upstream_head: Some(0.0),
            downstream_head: Some(25.0),
            ..Default::default()
        };
        let state = p.step(&input, 1.0).unwrap();
        assert_eq!(state["outflow"], 0.0);
        assert_eq!(state["power_draw_kw"], 0.0);
    }

    #[test]
    fn test_bus_command_toggles_pump() {
        let bus = MessageBus::new();
        let pump = Rc::new(RefCell::new(
            Pump::new("p", &State::new(), PumpParameters::default()).unwrap(),
        ));
        Pump::connect_bus(&pump, &bus, "action/pump/p");
        bus.publish("action/pump/p", crate::bus::payload(&[("control_signal", 1.0)]))
            .unwrap();
        let state = pump.borrow_mut().step(&StepInput::default(), 1.0).unwrap();
        assert_eq!(state["status"], 1.0);
        // Fractional values are not valid pump commands
        bus.publish("action/pump/p", crate::bus::payload(&[("control_signal", 0.4)]))
            .unwrap();
        let state = pump.borrow_mut().step(&StepInput::default(), 1.0).unwrap();
        assert_eq!(state["status"], 1.0);
    }
}
