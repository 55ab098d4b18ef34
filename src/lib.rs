//! Smart Water Platform Core - Rust Engine
//!
//! Discrete-time, message-driven simulation engine for hydraulic networks
//! controlled by a multi-agent system.
//!
//! # Architecture
//!
//! - **core**: Time management and the simulation error taxonomy
//! - **bus**: Synchronous publish/subscribe message bus
//! - **models**: Physical components (reservoirs, gates, canals, pipes,
//!   pumps, valves, turbines)
//! - **control**: Pluggable control strategies (PID, bang-bang, MPC facade)
//! - **agents**: Perception, control, coordination, disturbance, scenario
//!   playback and identification agents
//! - **orchestrator**: The simulation harness and per-tick history
//! - **scenario**: Declarative configuration, class registries, loader and
//!   output sinks
//! - **rng**: Deterministic random number generation
//!
//! # Critical Invariants
//!
//! 1. Execution is single-threaded and cooperative; bus delivery is
//!    synchronous and depth-first, bounded by a cascade depth limit
//! 2. Component stepping follows a deterministic topological order with
//!    lexicographic tie-breaking
//! 3. All randomness is seeded; identical config produces byte-identical
//!    histories

pub mod agents;
pub mod bus;
pub mod control;
pub mod core;
pub mod models;
pub mod orchestrator;
pub mod rng;
pub mod scenario;

// Re-exports for convenience
pub use agents::Agent;
pub use bus::{FieldMap, Message, MessageBus};
pub use control::Controller;
pub use core::error::SimulationError;
pub use core::time::SimClock;
pub use models::{PhysicalComponent, State, StepInput};
pub use orchestrator::{
    ControllerBinding, RunMode, SimulationHarness, SimulationHistory, SimulationResult,
    TickSnapshot,
};
pub use rng::RngManager;
pub use scenario::{load_scenario, LoadedScenario, ScenarioConfig};
