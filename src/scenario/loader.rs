//! Scenario loader
//!
//! Turns a parsed [`ScenarioConfig`] into a fully-assembled, built
//! [`SimulationHarness`]: message bus, components, topology, agents or
//! controllers, timed disturbances, and scripted events. The run mode
//! follows the config shape: controllers select orchestrated mode, agents
//! (or a scenario script) select multi-agent mode; mixing both is invalid.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::info;

use crate::bus::MessageBus;
use crate::core::error::SimulationError;
use crate::core::time::SimClock;
use crate::orchestrator::{
    ControllerBinding, DisturbanceAction, RunMode, SimulationHarness, TimedDisturbance,
};
use crate::scenario::config::{OutputConfig, ScenarioConfig, SimulationSettings};
use crate::scenario::registry::{
    build_agent, build_component, build_controller, AgentContext, SharedComponent,
};

/// A loaded, built scenario ready to run
pub struct LoadedScenario {
    pub harness: SimulationHarness,
    pub mode: RunMode,
    pub output: OutputConfig,
}

impl std::fmt::Debug for LoadedScenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedScenario")
            .field("mode", &self.mode)
            .field("output", &self.output)
            .finish()
    }
}

fn clock_from_settings(settings: &SimulationSettings) -> Result<SimClock, SimulationError> {
    match (settings.num_steps, settings.duration) {
        (Some(num_steps), None) => SimClock::new(settings.dt, num_steps),
        (None, Some(duration)) => SimClock::from_duration(settings.dt, duration),
        (Some(_), Some(_)) => Err(SimulationError::InvalidConfig(
            "specify either num_steps or duration, not both".to_string(),
        )),
        (None, None) => Err(SimulationError::InvalidConfig(
            "simulation_settings needs num_steps or duration".to_string(),
        )),
    }
}

/// Parse a scenario file (`.json`, `.yaml`/`.yml`) and build it
pub fn load_scenario(path: &Path) -> Result<LoadedScenario, SimulationError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        SimulationError::InvalidConfig(format!("cannot read '{}': {}", path.display(), e))
    })?;
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    let config: ScenarioConfig = match extension.as_str() {
        "yaml" | "yml" => serde_yaml::from_str(&text)
            .map_err(|e| SimulationError::InvalidConfig(format!("YAML parse error: {}", e)))?,
        "json" => serde_json::from_str(&text)
            .map_err(|e| SimulationError::InvalidConfig(format!("JSON parse error: {}", e)))?,
        other => {
            return Err(SimulationError::InvalidConfig(format!(
                "unsupported config extension '{}' (expected json, yaml or yml)",
                other
            )))
        }
    };
    let base_dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
    build_scenario(config, base_dir)
}

/// Build a scenario from an already-parsed configuration
pub fn build_scenario(
    config: ScenarioConfig,
    base_dir: PathBuf,
) -> Result<LoadedScenario, SimulationError> {
    let clock = clock_from_settings(&config.simulation_settings)?;
    let dt = clock.dt();
    let bus = MessageBus::new();
    let mut harness = SimulationHarness::new(clock, Rc::clone(&bus));

    info!(components = config.components.len(), "loading scenario");

    // Components first: agents and controllers reference them by id
    let mut components: BTreeMap<String, SharedComponent> = BTreeMap::new();
    for spec in &config.components {
        let component = build_component(spec, &bus)?;
        harness.add_component(Rc::clone(&component))?;
        components.insert(spec.id.clone(), component);
    }

    for edge in &config.topology {
        harness.add_connection(&edge.upstream, &edge.downstream)?;
    }

    let has_agents = !config.agents.is_empty() || !config.scenario_script.is_empty();
    let has_controllers = !config.controllers.is_empty();
    if has_agents && has_controllers {
        return Err(SimulationError::InvalidConfig(
            "a scenario is either agent-driven or controller-driven, not both".to_string(),
        ));
    }

    let ctx = AgentContext {
        bus: &bus,
        components: &components,
        dt,
        base_dir,
    };
    for spec in &config.agents {
        let agent = build_agent(spec, &ctx)?;
        harness.add_agent(agent);
    }

    if !config.scenario_script.is_empty() {
        let agent = crate::agents::ScenarioAgent::new(
            "scenario_script",
            Rc::clone(&bus),
            config.scenario_script.clone(),
        );
        harness.add_agent(Rc::new(std::cell::RefCell::new(agent)));
    }

    for spec in &config.controllers {
        let controller = build_controller(&spec.controller_type, &spec.params, &spec.id)?;
        harness.add_controller(ControllerBinding {
            controller,
            controlled_id: spec.wiring.controlled_id.clone(),
            observed_id: spec.wiring.observed_id.clone(),
            observation_key: spec.wiring.observation_key.clone(),
        });
    }

    for spec in &config.disturbances {
        if spec.action == DisturbanceAction::SetState && spec.key.is_none() {
            return Err(SimulationError::InvalidConfig(format!(
                "set_state disturbance on '{}' needs a key",
                spec.component_id
            )));
        }
        if !components.contains_key(&spec.component_id) {
            return Err(SimulationError::WiringError(format!(
                "disturbance references unknown component '{}'",
                spec.component_id
            )));
        }
        harness.add_disturbance(
            spec.time_step,
            TimedDisturbance {
                component_id: spec.component_id.clone(),
                action: spec.action,
                key: spec.key.clone(),
                value: spec.value,
            },
        );
    }

    harness.build()?;

    let mode = if has_controllers {
        RunMode::Orchestrated
    } else {
        RunMode::MultiAgent
    };
    info!(?mode, "scenario loaded and built");

    Ok(LoadedScenario {
        harness,
        mode,
        output: config.output.unwrap_or_default(),
    })
}
