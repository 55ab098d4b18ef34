//! Orchestrator - the simulation harness
//!
//! Owns the clock, the topology graph, the component and agent registries
//! and the message bus, and drives the per-tick two-phase loop.
//!
//! See `engine.rs` for the full implementation and `history.rs` for the
//! per-tick state recording.

pub mod engine;
pub mod history;

pub use engine::{
    ControllerBinding, DisturbanceAction, NetworkSolver, RunMode, SimulationHarness,
    TimedDisturbance,
};
pub use history::{HistorySink, SimulationHistory, SimulationResult, TickSnapshot};
