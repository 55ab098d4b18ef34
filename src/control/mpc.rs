//! MPC facade
//!
//! Wraps a black-box minimizer behind the [`Controller`] interface. The
//! facade owns graceful degradation: when the solver times out or
//! diverges, the fault is logged and the last successful output is held so
//! a control agent keeps publishing a sane action. The optimizer internals
//! are out of scope here; callers inject a solve function.

use tracing::warn;

use crate::control::Controller;
use crate::core::error::SimulationError;

/// One optimization problem instance handed to the solver
#[derive(Debug, Clone)]
pub struct MpcProblem {
    pub observation: f64,
    pub setpoint: f64,
    pub dt: f64,
    /// Prediction horizon in ticks
    pub horizon: usize,
    /// Solver time budget in seconds; exceeded budgets surface
    /// [`SimulationError::OptimizationTimeout`]
    pub time_limit_s: f64,
}

type SolveFn = Box<dyn FnMut(&MpcProblem) -> Result<f64, SimulationError>>;

/// A model-predictive controller facade around an injected solver
pub struct MpcFacade {
    solver: SolveFn,
    setpoint: f64,
    horizon: usize,
    time_limit_s: f64,
    last_output: f64,
    last_error: Option<SimulationError>,
}

impl MpcFacade {
    pub fn new(
        solver: SolveFn,
        setpoint: f64,
        horizon: usize,
        time_limit_s: f64,
        initial_output: f64,
    ) -> Self {
        Self {
            solver,
            setpoint,
            horizon,
            time_limit_s,
            last_output: initial_output,
            last_error: None,
        }
    }

    /// The failure recorded by the most recent `compute_action`, if any
    pub fn last_error(&self) -> Option<&SimulationError> {
        self.last_error.as_ref()
    }
}

impl Controller for MpcFacade {
    fn compute_action(&mut self, observation: f64, dt: f64) -> f64 {
        let problem = MpcProblem {
            observation,
            setpoint: self.setpoint,
            dt,
            horizon: self.horizon,
            time_limit_s: self.time_limit_s,
        };
        match (self.solver)(&problem) {
            Ok(action) => {
                self.last_output = action;
                self.last_error = None;
                action
            }
            Err(err) => {
                warn!(error = %err, held_output = self.last_output, "MPC solve failed, holding last output");
                self.last_error = Some(err);
                self.last_output
            }
        }
    }

    fn set_setpoint(&mut self, value: f64) {
        self.setpoint = value;
    }

    fn setpoint(&self) -> f64 {
        self.setpoint
    }
}
