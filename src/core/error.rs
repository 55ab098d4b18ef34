//! Simulation error taxonomy
//!
//! Every failure the engine can surface is one of the variants below.
//! `HandlerFault` is special: it is recovered at the message bus (logged,
//! delivery continues) and never propagates out of `publish`. Everything
//! else raised during `build` or `run` is fatal to the simulation and
//! carries enough context (tick, component/agent id, topic) for the CLI to
//! print a single structured error line.

use thiserror::Error;

/// Top-level simulation error
#[derive(Debug, Error)]
pub enum SimulationError {
    /// The configuration tree is malformed
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A class name in config does not map to a registered constructor
    #[error("unknown {family} class '{class}'")]
    UnknownClass {
        /// Registry family: "component", "agent" or "controller"
        family: &'static str,
        class: String,
    },

    /// A parameter is outside its physical range
    #[error("invalid parameter '{name}' for '{owner}': {reason}")]
    InvalidParameter {
        owner: String,
        name: &'static str,
        reason: String,
    },

    /// A referenced component/agent id is missing
    #[error("wiring error: {0}")]
    WiringError(String),

    /// Topology is not a DAG
    #[error("cycle detected in topology involving component '{0}'")]
    CycleDetected(String),

    /// Bus publish re-entered beyond the allowed depth
    #[error("publish cascade exceeded depth {depth} on topic '{topic}'")]
    CascadeDepthExceeded { topic: String, depth: usize },

    /// A component's step failed; fatal to the tick and the run
    #[error("component '{component}' failed at tick {tick}: {reason}")]
    StepFault {
        tick: u64,
        component: String,
        reason: String,
    },

    /// A solver call exceeded its configured bound
    #[error("optimization timed out after {elapsed_s:.3}s (limit {limit_s:.3}s)")]
    OptimizationTimeout { elapsed_s: f64, limit_s: f64 },

    /// An iterative hydraulic solver failed to converge
    #[error("solver diverged: {0}")]
    SolverDivergence(String),

    /// Result artifact could not be serialized
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Filesystem failure while loading config or writing results
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl SimulationError {
    /// Stable kind name for structured error lines
    pub fn kind(&self) -> &'static str {
        match self {
            SimulationError::InvalidConfig(_) => "InvalidConfig",
            SimulationError::UnknownClass { .. } => "UnknownClass",
            SimulationError::InvalidParameter { .. } => "InvalidParameter",
            SimulationError::WiringError(_) => "WiringError",
            SimulationError::CycleDetected(_) => "CycleDetected",
            SimulationError::CascadeDepthExceeded { .. } => "CascadeDepthExceeded",
            SimulationError::StepFault { .. } => "StepFault",
            SimulationError::OptimizationTimeout { .. } => "OptimizationTimeout",
            SimulationError::SolverDivergence(_) => "SolverDivergence",
            SimulationError::Serialization(_) => "SerializationError",
            SimulationError::Io(_) => "IoError",
        }
    }

    /// Process exit code for the CLI
    ///
    /// 0 success, 2 invalid config, 3 wiring error, 4 topology cycle,
    /// 5 any runtime failure during simulation.
    pub fn exit_code(&self) -> i32 {
        match self {
            SimulationError::InvalidConfig(_)
            | SimulationError::UnknownClass { .. }
            | SimulationError::InvalidParameter { .. } => 2,
            SimulationError::WiringError(_) => 3,
            SimulationError::CycleDetected(_) => 4,
            SimulationError::CascadeDepthExceeded { .. }
            | SimulationError::StepFault { .. }
            | SimulationError::OptimizationTimeout { .. }
            | SimulationError::SolverDivergence(_)
            | SimulationError::Serialization(_)
            | SimulationError::Io(_) => 5,
        }
    }
}
