//! Scenario configuration tree
//!
//! The on-disk shape of a scenario. Class-specific parameter and config
//! blocks stay as raw JSON values here; the registries deserialize them
//! into the concrete parameter structs when instantiating, so unknown
//! classes and malformed blocks fail with precise context.

use std::path::PathBuf;

use serde::Deserialize;

use crate::agents::ScriptedEvent;
use crate::models::{State, TopicBinding};
use crate::orchestrator::DisturbanceAction;

/// Top-level scenario file
#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioConfig {
    #[serde(alias = "simulation")]
    pub simulation_settings: SimulationSettings,
    pub components: Vec<ComponentSpec>,
    #[serde(default)]
    pub topology: Vec<Edge>,
    #[serde(default)]
    pub agents: Vec<AgentSpec>,
    /// Orchestrated-mode controller wiring; mutually exclusive with agents
    #[serde(default)]
    pub controllers: Vec<ControllerSpecConfig>,
    #[serde(default)]
    pub disturbances: Vec<DisturbanceSpec>,
    #[serde(default)]
    pub scenario_script: Vec<ScriptedEvent>,
    #[serde(default)]
    pub output: Option<OutputConfig>,
}

/// Clock settings; exactly one of `num_steps` / `duration` is required
#[derive(Debug, Clone, Deserialize)]
pub struct SimulationSettings {
    pub dt: f64,
    #[serde(default)]
    pub num_steps: Option<u64>,
    /// Total simulated seconds; `num_steps = floor(duration / dt)`
    #[serde(default)]
    pub duration: Option<f64>,
}

/// One physical component
#[derive(Debug, Clone, Deserialize)]
pub struct ComponentSpec {
    pub id: String,
    /// Registered class name, e.g. `Reservoir`, `Gate`, `UnifiedCanal`
    pub class: String,
    #[serde(default)]
    pub initial_state: State,
    /// Class-specific parameters, deserialized by the constructor
    #[serde(default)]
    pub parameters: serde_json::Value,
    /// Topic whose action messages drive this component's target
    #[serde(default)]
    pub action_topic: Option<String>,
    /// Data-driven inflow subscriptions (reservoirs)
    #[serde(default)]
    pub inflow_topics: Vec<TopicBinding>,
    /// Data-driven outflow subscriptions (reservoirs)
    #[serde(default)]
    pub outflow_topics: Vec<TopicBinding>,
}

/// One directed flow edge
#[derive(Debug, Clone, Deserialize)]
pub struct Edge {
    pub upstream: String,
    pub downstream: String,
}

/// One agent
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSpec {
    pub id: String,
    /// Registered class name, e.g. `LocalControlAgent`, `RainfallAgent`
    pub class: String,
    /// Class-specific configuration, deserialized by the constructor
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Orchestrated-mode controller entry
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerSpecConfig {
    pub id: String,
    /// Registered controller type, e.g. `PIDController`
    #[serde(rename = "type")]
    pub controller_type: String,
    #[serde(default)]
    pub params: serde_json::Value,
    pub wiring: ControllerWiring,
}

/// Which component a controller observes and which it drives
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerWiring {
    pub controlled_id: String,
    pub observed_id: String,
    pub observation_key: String,
}

/// One timed disturbance, applied by the harness at `time_step`
#[derive(Debug, Clone, Deserialize)]
pub struct DisturbanceSpec {
    pub time_step: u64,
    pub component_id: String,
    pub action: DisturbanceAction,
    /// State key, required for `set_state`
    #[serde(default)]
    pub key: Option<String>,
    pub value: f64,
}

/// Result artifact format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Single JSON document with the full history
    Json,
    /// One CSV file per component under a directory
    CsvPerComponent,
}

fn default_format() -> OutputFormat {
    OutputFormat::Json
}

/// Output sink configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_format")]
    pub format: OutputFormat,
    /// File (json) or directory (csv_per_component); defaults next to the
    /// scenario file
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: default_format(),
            path: None,
        }
    }
}
