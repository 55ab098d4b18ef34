//! Station-level control agents
//!
//! A station agent sits between the central dispatcher and a bank of
//! identical devices: it receives one station-level goal and decomposes it
//! into per-device commands. Three decomposition rules are covered:
//! count-based (switch on the first N pumps), equal-share (divide a flow
//! target across devices), and proportional (scale valve openings against
//! a station capacity). Hydropower stations convert a power target into
//! per-turbine flow through the generation equation.

use std::cell::RefCell;
use std::rc::Rc;

use serde::Deserialize;
use tracing::{debug, info};

use crate::agents::Agent;
use crate::bus::{payload, HandlerError, MessageBus};
use crate::core::error::SimulationError;
use crate::models::{GRAVITY, WATER_DENSITY};

/// Shared shape of the station goal subscription: the latest `target_flow`
/// (or power target) seen on the goal topic
fn subscribe_target(
    bus: &Rc<MessageBus>,
    topic: &str,
    label: &str,
    key: &'static str,
    target: &Rc<RefCell<Option<f64>>>,
) {
    let slot = Rc::clone(target);
    bus.subscribe(topic, label, move |msg| {
        if let Some(value) = msg.get(key) {
            *slot.borrow_mut() = Some(value);
        }
        Ok(())
    });
}

/// Count-based pump station control
///
/// Switches on the smallest number of pumps whose combined rated flow
/// covers the station target; the rest are commanded off.
pub struct PumpStationControlAgent {
    id: String,
    bus: Rc<MessageBus>,
    pump_action_topics: Vec<String>,
    flow_per_pump: f64,
    target_flow: Rc<RefCell<Option<f64>>>,
}

/// Configuration for [`PumpStationControlAgent`]
#[derive(Debug, Clone, Deserialize)]
pub struct PumpStationConfig {
    pub goal_topic: String,
    pub pump_action_topics: Vec<String>,
    /// Rated flow of one pump
    pub flow_per_pump: f64,
}

impl PumpStationControlAgent {
    pub fn new(
        id: &str,
        bus: Rc<MessageBus>,
        config: PumpStationConfig,
    ) -> Result<Self, SimulationError> {
        if !(config.flow_per_pump > 0.0) {
            return Err(SimulationError::InvalidConfig(format!(
                "flow_per_pump must be > 0, got {}",
                config.flow_per_pump
            )));
        }
        if config.pump_action_topics.is_empty() {
            return Err(SimulationError::InvalidConfig(
                "pump station needs at least one pump action topic".to_string(),
            ));
        }
        let target_flow = Rc::new(RefCell::new(None));
        subscribe_target(&bus, &config.goal_topic, id, "target_flow", &target_flow);
        info!(id, pumps = config.pump_action_topics.len(), "pump station agent created");
        Ok(Self {
            id: id.to_string(),
            bus,
            pump_action_topics: config.pump_action_topics,
            flow_per_pump: config.flow_per_pump,
            target_flow,
        })
    }
}

impl Agent for PumpStationControlAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn run(&mut self, _current_time: f64) -> Result<(), SimulationError> {
        let Some(target) = *self.target_flow.borrow() else {
            return Ok(());
        };
        let pumps_needed = ((target / self.flow_per_pump).ceil() as usize)
            .min(self.pump_action_topics.len());
        debug!(id = self.id.as_str(), target, pumps_needed, "pump count dispatch");
        for (idx, topic) in self.pump_action_topics.iter().enumerate() {
            let signal = if idx < pumps_needed { 1.0 } else { 0.0 };
            self.bus.publish(topic, payload(&[("control_signal", signal)]))?;
        }
        Ok(())
    }
}

/// Flow-based pump control
///
/// Divides the station flow target equally across the devices and sends
/// each its share as a flow command. Suited to variable devices; fixed
/// on/off pumps are better served by [`PumpStationControlAgent`].
pub struct PumpControlAgent {
    id: String,
    bus: Rc<MessageBus>,
    pump_action_topics: Vec<String>,
    target_flow: Rc<RefCell<Option<f64>>>,
}

/// Configuration for [`PumpControlAgent`]
#[derive(Debug, Clone, Deserialize)]
pub struct PumpFlowConfig {
    pub goal_topic: String,
    pub pump_action_topics: Vec<String>,
}

impl PumpControlAgent {
    pub fn new(
        id: &str,
        bus: Rc<MessageBus>,
        config: PumpFlowConfig,
    ) -> Result<Self, SimulationError> {
        if config.pump_action_topics.is_empty() {
            return Err(SimulationError::InvalidConfig(
                "pump control agent needs at least one action topic".to_string(),
            ));
        }
        let target_flow = Rc::new(RefCell::new(None));
        subscribe_target(&bus, &config.goal_topic, id, "target_flow", &target_flow);
        info!(id, pumps = config.pump_action_topics.len(), "pump flow agent created");
        Ok(Self {
            id: id.to_string(),
            bus,
            pump_action_topics: config.pump_action_topics,
            target_flow,
        })
    }
}

impl Agent for PumpControlAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn run(&mut self, _current_time: f64) -> Result<(), SimulationError> {
        let Some(target) = *self.target_flow.borrow() else {
            return Ok(());
        };
        let share = (target / self.pump_action_topics.len() as f64).max(0.0);
        for topic in &self.pump_action_topics {
            self.bus
                .publish(topic, payload(&[("target_flow", share), ("control_signal", share)]))?;
        }
        Ok(())
    }
}

/// Proportional valve station control
///
/// Maps the station flow target to a common opening percentage against the
/// station's rated capacity.
pub struct ValveStationControlAgent {
    id: String,
    bus: Rc<MessageBus>,
    valve_action_topics: Vec<String>,
    station_capacity: f64,
    target_flow: Rc<RefCell<Option<f64>>>,
}

/// Configuration for [`ValveStationControlAgent`]
#[derive(Debug, Clone, Deserialize)]
pub struct ValveStationConfig {
    pub goal_topic: String,
    pub valve_action_topics: Vec<String>,
    /// Station flow at fully open valves
    pub station_capacity: f64,
}

impl ValveStationControlAgent {
    pub fn new(
        id: &str,
        bus: Rc<MessageBus>,
        config: ValveStationConfig,
    ) -> Result<Self, SimulationError> {
        if !(config.station_capacity > 0.0) {
            return Err(SimulationError::InvalidConfig(format!(
                "station_capacity must be > 0, got {}",
                config.station_capacity
            )));
        }
        if config.valve_action_topics.is_empty() {
            return Err(SimulationError::InvalidConfig(
                "valve station needs at least one valve action topic".to_string(),
            ));
        }
        let target_flow = Rc::new(RefCell::new(None));
        subscribe_target(&bus, &config.goal_topic, id, "target_flow", &target_flow);
        info!(id, valves = config.valve_action_topics.len(), "valve station agent created");
        Ok(Self {
            id: id.to_string(),
            bus,
            valve_action_topics: config.valve_action_topics,
            station_capacity: config.station_capacity,
            target_flow,
        })
    }
}

impl Agent for ValveStationControlAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn run(&mut self, _current_time: f64) -> Result<(), SimulationError> {
        let Some(target) = *self.target_flow.borrow() else {
            return Ok(());
        };
        let opening = (target / self.station_capacity * 100.0).clamp(0.0, 100.0);
        for topic in &self.valve_action_topics {
            self.bus
                .publish(topic, payload(&[("control_signal", opening)]))?;
        }
        Ok(())
    }
}

/// Hydropower station control
///
/// Receives a station power target and a grid export limit, converts the
/// effective target into per-turbine outflow with `Q = P / (eta rho g H)`,
/// and commands every turbine with its share.
pub struct HydropowerStationAgent {
    id: String,
    bus: Rc<MessageBus>,
    turbine_action_topics: Vec<String>,
    head_m: f64,
    efficiency: f64,
    power_target_w: Rc<RefCell<Option<f64>>>,
    grid_limit_w: Rc<RefCell<Option<f64>>>,
}

/// Configuration for [`HydropowerStationAgent`]
#[derive(Debug, Clone, Deserialize)]
pub struct HydropowerStationConfig {
    pub power_target_topic: String,
    pub grid_limit_topic: String,
    pub turbine_action_topics: Vec<String>,
    /// Assumed constant head in meters
    pub head_m: f64,
    #[serde(default = "default_efficiency")]
    pub efficiency: f64,
}

fn default_efficiency() -> f64 {
    0.9
}

impl HydropowerStationAgent {
    pub fn new(
        id: &str,
        bus: Rc<MessageBus>,
        config: HydropowerStationConfig,
    ) -> Result<Self, SimulationError> {
        if !(config.head_m > 0.0) {
            return Err(SimulationError::InvalidConfig(format!(
                "head_m must be > 0, got {}",
                config.head_m
            )));
        }
        if !(config.efficiency > 0.0 && config.efficiency <= 1.0) {
            return Err(SimulationError::InvalidConfig(format!(
                "efficiency must be in (0, 1], got {}",
                config.efficiency
            )));
        }
        if config.turbine_action_topics.is_empty() {
            return Err(SimulationError::InvalidConfig(
                "hydropower station needs at least one turbine action topic".to_string(),
            ));
        }
        let power_target_w = Rc::new(RefCell::new(None));
        let grid_limit_w = Rc::new(RefCell::new(None));
        subscribe_target(&bus, &config.power_target_topic, id, "target_w", &power_target_w);
        subscribe_target(&bus, &config.grid_limit_topic, id, "limit_w", &grid_limit_w);
        info!(id, turbines = config.turbine_action_topics.len(), "hydropower station agent created");
        Ok(Self {
            id: id.to_string(),
            bus,
            turbine_action_topics: config.turbine_action_topics,
            head_m: config.head_m,
            efficiency: config.efficiency,
            power_target_w,
            grid_limit_w,
        })
    }
}

impl Agent for HydropowerStationAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn run(&mut self, _current_time: f64) -> Result<(), SimulationError> {
        let Some(target) = *self.power_target_w.borrow() else {
            return Ok(());
        };
        let effective = match *self.grid_limit_w.borrow() {
            Some(limit) => target.min(limit),
            None => target,
        };
        let per_turbine_w = effective / self.turbine_action_topics.len() as f64;
        let denominator = self.efficiency * WATER_DENSITY * GRAVITY * self.head_m;
        let outflow = if denominator > 1e-3 {
            (per_turbine_w / denominator).max(0.0)
        } else {
            0.0
        };
        debug!(id = self.id.as_str(), effective, outflow, "hydropower dispatch");
        for topic in &self.turbine_action_topics {
            self.bus
                .publish(topic, payload(&[("target_outflow", outflow)]))?;
        }
        Ok(())
    }
}
