//! Bang-bang (relay) controller with hysteresis
//!
//! Emits one of two output levels and holds the last one inside the
//! deadband, so the actuator never chatters around the setpoint. Direction
//! is encoded by the choice of `low_output`/`high_output`: a reverse-acting
//! device simply swaps them.

use serde::Deserialize;

use crate::control::Controller;
use crate::core::error::SimulationError;

fn default_deadband() -> f64 {
    0.0
}

/// Construction parameters
#[derive(Debug, Clone, Deserialize)]
pub struct BangBangParameters {
    pub setpoint: f64,
    /// Output while the observation is below `setpoint - deadband/2`
    pub high_output: f64,
    /// Output while the observation is above `setpoint + deadband/2`
    pub low_output: f64,
    /// Full hysteresis width around the setpoint
    #[serde(default = "default_deadband")]
    pub deadband: f64,
}

/// A two-level relay controller
pub struct BangBangController {
    setpoint: f64,
    high_output: f64,
    low_output: f64,
    deadband: f64,
    last_output: f64,
}

impl BangBangController {
    pub fn new(params: BangBangParameters) -> Result<Self, SimulationError> {
        if params.deadband < 0.0 {
            return Err(SimulationError::InvalidConfig(format!(
                "bang-bang deadband must be >= 0, got {}",
                params.deadband
            )));
        }
        Ok(Self {
            setpoint: params.setpoint,
            high_output: params.high_output,
            low_output: params.low_output,
            deadband: params.deadband,
            // Until the observation leaves the deadband, hold the low side
            last_output: params.low_output,
        })
    }
}

impl Controller for BangBangController {
    fn compute_action(&mut self, observation: f64, _dt: f64) -> f64 {
        let error = self.setpoint - observation;
        if error > self.deadband / 2.0 {
            self.last_output = self.high_output;
        } else if error < -self.deadband / 2.0 {
            self.last_output = self.low_output;
        }
        self.last_output
    }

    fn set_setpoint(&mut self, value: f64) {
        self.setpoint = value;
    }

    fn setpoint(&self) -> f64 {
        self.setpoint
    }
}
