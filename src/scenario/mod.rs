//! Declarative scenarios
//!
//! A scenario file (JSON or YAML) describes the simulation settings, the
//! physical components and their topology, the agents or controllers, and
//! optional timed disturbances and scripted events. The loader materializes
//! the whole ensemble through name-to-constructor registries and returns a
//! built harness ready to run.

pub mod config;
pub mod loader;
pub mod output;
pub mod registry;

pub use config::{
    AgentSpec, ComponentSpec, ControllerSpecConfig, ControllerWiring, DisturbanceSpec, Edge,
    OutputConfig, OutputFormat, ScenarioConfig, SimulationSettings,
};
pub use loader::{build_scenario, load_scenario, LoadedScenario};
pub use output::write_result;
