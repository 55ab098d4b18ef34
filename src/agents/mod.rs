//! Autonomous agents
//!
//! Agents never own physical state. They perceive over the bus, decide,
//! and act by publishing messages; components pick those up through their
//! own handlers. The harness calls `run` once per tick (Phase A, in
//! registration order); most agents do their real work inside bus
//! callbacks registered at construction and use `run` only for periodic
//! behavior (publishing state, evaluating rules, emitting disturbances).

pub mod digital_twin;
pub mod dispatcher;
pub mod disturbance;
pub mod identification;
pub mod local_control;
pub mod scenario;
pub mod station;

pub use digital_twin::{DigitalTwinAgent, SmoothingConfig};
pub use dispatcher::{CentralDispatcher, DispatchRule, StateSubscription};
pub use disturbance::{
    CsvInflowAgent, DynamicRainfallAgent, DynamicRainfallConfig, RainfallAgent, RainfallConfig,
    WaterUseAgent, WaterUseConfig,
};
pub use identification::{DataSource, IdentificationConfig, ParameterIdentificationAgent};
pub use local_control::{LocalControlAgent, LocalControlConfig};
pub use scenario::{ScenarioAgent, ScriptedEvent};
pub use station::{
    HydropowerStationAgent, HydropowerStationConfig, PumpControlAgent, PumpFlowConfig,
    PumpStationConfig, PumpStationControlAgent, ValveStationConfig, ValveStationControlAgent,
};

use crate::core::error::SimulationError;

/// An autonomous decision entity driven once per tick
pub trait Agent {
    /// Unique agent id
    fn id(&self) -> &str;

    /// Execute one tick of agent behavior
    ///
    /// Returning an error is rare: cascade-depth overflow is fatal and
    /// aborts the run; any other error is logged by the harness as a
    /// recovered handler fault and the simulation continues.
    fn run(&mut self, current_time: f64) -> Result<(), SimulationError>;
}
