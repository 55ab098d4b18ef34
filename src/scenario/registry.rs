//! Class registries
//!
//! Name-to-constructor maps for the three class families (components,
//! agents, controllers). Each registry is built once at first use and is
//! read-only afterwards; the loader resolves class names through it and
//! fails with `UnknownClass` for anything unregistered.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::OnceLock;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::agents::{
    Agent, CentralDispatcher, CsvInflowAgent, DigitalTwinAgent, DispatchRule,
    DynamicRainfallAgent, DynamicRainfallConfig, HydropowerStationAgent,
    HydropowerStationConfig, IdentificationConfig, LocalControlAgent, LocalControlConfig,
    ParameterIdentificationAgent, PumpControlAgent, PumpFlowConfig, PumpStationConfig,
    PumpStationControlAgent, RainfallAgent, RainfallConfig, ScenarioAgent, ScriptedEvent,
    SmoothingConfig, StateSubscription, ValveStationConfig, ValveStationControlAgent,
    WaterUseAgent, WaterUseConfig,
};
use crate::bus::MessageBus;
use crate::control::{
    BangBangController, BangBangParameters, Controller, PidController, PidParameters,
};
use crate::core::error::SimulationError;
use crate::models::{
    CanalParameters, Gate, GateParameters, ModelError, PhysicalComponent, Pipe, PipeParameters,
    Pump, PumpParameters, Reservoir, ReservoirParameters, TurbineParameters, UnifiedCanal, Valve,
    ValveParameters, WaterTurbine,
};
use crate::scenario::config::{AgentSpec, ComponentSpec};

pub type SharedComponent = Rc<RefCell<dyn PhysicalComponent>>;
pub type SharedAgent = Rc<RefCell<dyn Agent>>;

/// Everything an agent constructor may need
pub struct AgentContext<'a> {
    pub bus: &'a Rc<MessageBus>,
    pub components: &'a BTreeMap<String, SharedComponent>,
    pub dt: f64,
    /// Directory scenario-relative paths (CSV files) resolve against
    pub base_dir: PathBuf,
}

type ComponentCtor = fn(&ComponentSpec, &Rc<MessageBus>) -> Result<SharedComponent, SimulationError>;
type AgentCtor = fn(&AgentSpec, &AgentContext) -> Result<SharedAgent, SimulationError>;

/// Deserialize a class-specific block, treating an absent block as empty
fn parse_block<T: DeserializeOwned>(
    value: &serde_json::Value,
    owner: &str,
) -> Result<T, SimulationError> {
    let value = if value.is_null() {
        serde_json::Value::Object(Default::default())
    } else {
        value.clone()
    };
    serde_json::from_value(value)
        .map_err(|e| SimulationError::InvalidConfig(format!("'{}': {}", owner, e)))
}

/// Map a construction-time model error onto the loader error taxonomy
fn model_error(owner: &str, err: ModelError) -> SimulationError {
    match err {
        ModelError::InvalidParameter { name, reason } => SimulationError::InvalidParameter {
            owner: owner.to_string(),
            name,
            reason,
        },
        other => SimulationError::InvalidConfig(format!("'{}': {}", owner, other)),
    }
}

fn lookup_component<'a>(
    ctx: &'a AgentContext,
    agent_id: &str,
    component_id: &str,
) -> Result<&'a SharedComponent, SimulationError> {
    ctx.components.get(component_id).ok_or_else(|| {
        SimulationError::WiringError(format!(
            "agent '{}' references unknown component '{}'",
            agent_id, component_id
        ))
    })
}

// ============================================================================
// Component constructors
// ============================================================================

fn build_reservoir(
    spec: &ComponentSpec,
    bus: &Rc<MessageBus>,
) -> Result<SharedComponent, SimulationError> {
    let params: ReservoirParameters = parse_block(&spec.parameters, &spec.id)?;
    let reservoir = Reservoir::new(&spec.id, &spec.initial_state, params)
        .map_err(|e| model_error(&spec.id, e))?;
    let reservoir = Rc::new(RefCell::new(reservoir));
    if !spec.inflow_topics.is_empty() || !spec.outflow_topics.is_empty() {
        Reservoir::connect_bus(&reservoir, bus, &spec.inflow_topics, &spec.outflow_topics);
    }
    Ok(reservoir)
}

fn build_gate(
    spec: &ComponentSpec,
    bus: &Rc<MessageBus>,
) -> Result<SharedComponent, SimulationError> {
    let params: GateParameters = parse_block(&spec.parameters, &spec.id)?;
    let gate = Gate::new(&spec.id, &spec.initial_state, params)
        .map_err(|e| model_error(&spec.id, e))?;
    let gate = Rc::new(RefCell::new(gate));
    if let Some(topic) = &spec.action_topic {
        Gate::connect_bus(&gate, bus, topic);
    }
    Ok(gate)
}

fn build_canal(
    spec: &ComponentSpec,
    _bus: &Rc<MessageBus>,
) -> Result<SharedComponent, SimulationError> {
    let params: CanalParameters = parse_block(&spec.parameters, &spec.id)?;
    let canal = UnifiedCanal::new(&spec.id, &spec.initial_state, params)
        .map_err(|e| model_error(&spec.id, e))?;
    Ok(Rc::new(RefCell::new(canal)))
}

fn build_pipe(
    spec: &ComponentSpec,
    _bus: &Rc<MessageBus>,
) -> Result<SharedComponent, SimulationError> {
    let params: PipeParameters = parse_block(&spec.parameters, &spec.id)?;
    let pipe = Pipe::new(&spec.id, &spec.initial_state, params)
        .map_err(|e| model_error(&spec.id, e))?;
    Ok(Rc::new(RefCell::new(pipe)))
}

fn build_pump(
    spec: &ComponentSpec,
    bus: &Rc<MessageBus>,
) -> Result<SharedComponent, SimulationError> {
    let params: PumpParameters = parse_block(&spec.parameters, &spec.id)?;
    let pump = Pump::new(&spec.id, &spec.initial_state, params)
        .map_err(|e| model_error(&spec.id, e))?;
    let pump = Rc::new(RefCell::new(pump));
    if let Some(topic) = &spec.action_topic {
        Pump::connect_bus(&pump, bus, topic);
    }
    Ok(pump)
}

fn build_valve(
    spec: &ComponentSpec,
    bus: &Rc<MessageBus>,
) -> Result<SharedComponent, SimulationError> {
    let params: ValveParameters = parse_block(&spec.parameters, &spec.id)?;
    let valve = Valve::new(&spec.id, &spec.initial_state, params)
        .map_err(|e| model_error(&spec.id, e))?;
    let valve = Rc::new(RefCell::new(valve));
    if let Some(topic) = &spec.action_topic {
        Valve::connect_bus(&valve, bus, topic);
    }
    Ok(valve)
}

fn build_turbine(
    spec: &ComponentSpec,
    bus: &Rc<MessageBus>,
) -> Result<SharedComponent, SimulationError> {
    let params: TurbineParameters = parse_block(&spec.parameters, &spec.id)?;
    let turbine = WaterTurbine::new(&spec.id, &spec.initial_state, params)
        .map_err(|e| model_error(&spec.id, e))?;
    let turbine = Rc::new(RefCell::new(turbine));
    if let Some(topic) = &spec.action_topic {
        WaterTurbine::connect_bus(&turbine, bus, topic);
    }
    Ok(turbine)
}

fn component_registry() -> &'static BTreeMap<&'static str, ComponentCtor> {
    static REGISTRY: OnceLock<BTreeMap<&'static str, ComponentCtor>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        BTreeMap::from([
            ("Reservoir", build_reservoir as ComponentCtor),
            ("Lake", build_reservoir),
            ("Gate", build_gate),
            ("UnifiedCanal", build_canal),
            ("Canal", build_canal),
            ("Pipe", build_pipe),
            ("Pump", build_pump),
            ("Valve", build_valve),
            ("WaterTurbine", build_turbine),
        ])
    })
}

/// Instantiate a component by registered class name
pub fn build_component(
    spec: &ComponentSpec,
    bus: &Rc<MessageBus>,
) -> Result<SharedComponent, SimulationError> {
    let ctor = component_registry()
        .get(spec.class.as_str())
        .ok_or_else(|| SimulationError::UnknownClass {
            family: "component",
            class: spec.class.clone(),
        })?;
    ctor(spec, bus)
}

// ============================================================================
// Controller constructors
// ============================================================================

/// Instantiate a controller by registered type name
///
/// The MPC facade is intentionally absent: it needs an injected solver and
/// is wired programmatically, not from declarative config.
pub fn build_controller(
    controller_type: &str,
    params: &serde_json::Value,
    owner: &str,
) -> Result<Box<dyn Controller>, SimulationError> {
    match controller_type {
        "PIDController" => {
            let params: PidParameters = parse_block(params, owner)?;
            Ok(Box::new(PidController::new(params)?))
        }
        "BangBangController" => {
            let params: BangBangParameters = parse_block(params, owner)?;
            Ok(Box::new(BangBangController::new(params)?))
        }
        other => Err(SimulationError::UnknownClass {
            family: "controller",
            class: other.to_string(),
        }),
    }
}

// ============================================================================
// Agent constructors
// ============================================================================

#[derive(Deserialize)]
struct DigitalTwinSpec {
    component_id: String,
    state_topic: String,
    #[serde(default)]
    smoothing: Option<SmoothingConfig>,
}

fn build_digital_twin(
    spec: &AgentSpec,
    ctx: &AgentContext,
) -> Result<SharedAgent, SimulationError> {
    let cfg: DigitalTwinSpec = parse_block(&spec.config, &spec.id)?;
    let component = lookup_component(ctx, &spec.id, &cfg.component_id)?;
    let twin = DigitalTwinAgent::new(
        &spec.id,
        Rc::clone(component),
        Rc::clone(ctx.bus),
        &cfg.state_topic,
        cfg.smoothing,
    )?;
    Ok(Rc::new(RefCell::new(twin)))
}

#[derive(Deserialize)]
struct InlineController {
    #[serde(rename = "type")]
    controller_type: String,
    #[serde(default)]
    params: serde_json::Value,
}

#[derive(Deserialize)]
struct LocalControlSpec {
    controller: InlineController,
    #[serde(flatten)]
    messaging: LocalControlConfig,
}

fn build_local_control(
    spec: &AgentSpec,
    ctx: &AgentContext,
) -> Result<SharedAgent, SimulationError> {
    let cfg: LocalControlSpec = parse_block(&spec.config, &spec.id)?;
    let controller =
        build_controller(&cfg.controller.controller_type, &cfg.controller.params, &spec.id)?;
    Ok(LocalControlAgent::spawn(
        &spec.id,
        controller,
        ctx.bus,
        cfg.messaging,
        ctx.dt,
    ))
}

#[derive(Deserialize)]
struct DispatcherSpec {
    subscriptions: Vec<StateSubscription>,
    rules: Vec<DispatchRule>,
}

fn build_dispatcher(spec: &AgentSpec, ctx: &AgentContext) -> Result<SharedAgent, SimulationError> {
    let cfg: DispatcherSpec = parse_block(&spec.config, &spec.id)?;
    Ok(CentralDispatcher::spawn(
        &spec.id,
        ctx.bus,
        &cfg.subscriptions,
        cfg.rules,
    ))
}

fn build_rainfall(spec: &AgentSpec, ctx: &AgentContext) -> Result<SharedAgent, SimulationError> {
    let cfg: RainfallConfig = parse_block(&spec.config, &spec.id)?;
    Ok(Rc::new(RefCell::new(RainfallAgent::new(
        &spec.id,
        Rc::clone(ctx.bus),
        cfg,
    ))))
}

fn build_dynamic_rainfall(
    spec: &AgentSpec,
    ctx: &AgentContext,
) -> Result<SharedAgent, SimulationError> {
    let cfg: DynamicRainfallConfig = parse_block(&spec.config, &spec.id)?;
    Ok(Rc::new(RefCell::new(DynamicRainfallAgent::new(
        &spec.id,
        Rc::clone(ctx.bus),
        cfg,
    )?)))
}

fn build_water_use(spec: &AgentSpec, ctx: &AgentContext) -> Result<SharedAgent, SimulationError> {
    let cfg: WaterUseConfig = parse_block(&spec.config, &spec.id)?;
    Ok(Rc::new(RefCell::new(WaterUseAgent::new(
        &spec.id,
        Rc::clone(ctx.bus),
        cfg,
    ))))
}

#[derive(Deserialize)]
struct CsvInflowSpec {
    csv_file: PathBuf,
    time_column: String,
    data_column: String,
    topic: String,
}

fn build_csv_inflow(spec: &AgentSpec, ctx: &AgentContext) -> Result<SharedAgent, SimulationError> {
    let cfg: CsvInflowSpec = parse_block(&spec.config, &spec.id)?;
    let path = if cfg.csv_file.is_absolute() {
        cfg.csv_file.clone()
    } else {
        ctx.base_dir.join(&cfg.csv_file)
    };
    Ok(Rc::new(RefCell::new(CsvInflowAgent::new(
        &spec.id,
        Rc::clone(ctx.bus),
        &path,
        &cfg.time_column,
        &cfg.data_column,
        &cfg.topic,
    )?)))
}

#[derive(Deserialize)]
struct ScenarioAgentSpec {
    events: Vec<ScriptedEvent>,
}

fn build_scenario_agent(
    spec: &AgentSpec,
    ctx: &AgentContext,
) -> Result<SharedAgent, SimulationError> {
    let cfg: ScenarioAgentSpec = parse_block(&spec.config, &spec.id)?;
    Ok(Rc::new(RefCell::new(ScenarioAgent::new(
        &spec.id,
        Rc::clone(ctx.bus),
        cfg.events,
    ))))
}

#[derive(Deserialize)]
struct IdentificationSpec {
    target_component_id: String,
    #[serde(flatten)]
    config: IdentificationConfig,
}

fn build_identification(
    spec: &AgentSpec,
    ctx: &AgentContext,
) -> Result<SharedAgent, SimulationError> {
    let cfg: IdentificationSpec = parse_block(&spec.config, &spec.id)?;
    let target = lookup_component(ctx, &spec.id, &cfg.target_component_id)?;
    let agent: SharedAgent =
        ParameterIdentificationAgent::spawn(&spec.id, ctx.bus, Rc::clone(target), cfg.config, ctx.dt)?;
    Ok(agent)
}

fn build_pump_station(
    spec: &AgentSpec,
    ctx: &AgentContext,
) -> Result<SharedAgent, SimulationError> {
    let cfg: PumpStationConfig = parse_block(&spec.config, &spec.id)?;
    Ok(Rc::new(RefCell::new(PumpStationControlAgent::new(
        &spec.id,
        Rc::clone(ctx.bus),
        cfg,
    )?)))
}

fn build_pump_flow(spec: &AgentSpec, ctx: &AgentContext) -> Result<SharedAgent, SimulationError> {
    let cfg: PumpFlowConfig = parse_block(&spec.config, &spec.id)?;
    Ok(Rc::new(RefCell::new(PumpControlAgent::new(
        &spec.id,
        Rc::clone(ctx.bus),
        cfg,
    )?)))
}

fn build_valve_station(
    spec: &AgentSpec,
    ctx: &AgentContext,
) -> Result<SharedAgent, SimulationError> {
    let cfg: ValveStationConfig = parse_block(&spec.config, &spec.id)?;
    Ok(Rc::new(RefCell::new(ValveStationControlAgent::new(
        &spec.id,
        Rc::clone(ctx.bus),
        cfg,
    )?)))
}

fn build_hydropower_station(
    spec: &AgentSpec,
    ctx: &AgentContext,
) -> Result<SharedAgent, SimulationError> {
    let cfg: HydropowerStationConfig = parse_block(&spec.config, &spec.id)?;
    Ok(Rc::new(RefCell::new(HydropowerStationAgent::new(
        &spec.id,
        Rc::clone(ctx.bus),
        cfg,
    )?)))
}

fn agent_registry() -> &'static BTreeMap<&'static str, AgentCtor> {
    static REGISTRY: OnceLock<BTreeMap<&'static str, AgentCtor>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        BTreeMap::from([
            ("DigitalTwinAgent", build_digital_twin as AgentCtor),
            ("LocalControlAgent", build_local_control),
            ("CentralDispatcher", build_dispatcher),
            ("RainfallAgent", build_rainfall),
            ("DynamicRainfallAgent", build_dynamic_rainfall),
            ("WaterUseAgent", build_water_use),
            ("CsvInflowAgent", build_csv_inflow),
            ("ScenarioAgent", build_scenario_agent),
            ("ParameterIdentificationAgent", build_identification),
            ("PumpStationControlAgent", build_pump_station),
            ("PumpControlAgent", build_pump_flow),
            ("ValveStationControlAgent", build_valve_station),
            ("HydropowerStationAgent", build_hydropower_station),
        ])
    })
}

/// Instantiate an agent by registered class name
pub fn build_agent(spec: &AgentSpec, ctx: &AgentContext) -> Result<SharedAgent, SimulationError> {
    let ctor = agent_registry()
        .get(spec.class.as_str())
        .ok_or_else(|| SimulationError::UnknownClass {
            family: "agent",
            class: spec.class.clone(),
        })?;
    ctor(spec, ctx)
}
