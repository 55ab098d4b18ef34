//! PID controller with output clamping and conditional anti-windup
//!
//! Gains may be signed: a reverse-acting process (opening a gate lowers the
//! observed level) uses negative gains. The anti-windup rule is therefore
//! stated in terms of the integral gain rather than the raw error sign:
//! while the output sits on a clamp, integration is skipped whenever the
//! increment would push the raw output further into that clamp.

use serde::Deserialize;
use tracing::debug;

use crate::control::Controller;
use crate::core::error::SimulationError;

fn default_min_output() -> f64 {
    f64::NEG_INFINITY
}
fn default_max_output() -> f64 {
    f64::INFINITY
}

/// Construction parameters
#[derive(Debug, Clone, Deserialize)]
pub struct PidParameters {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub setpoint: f64,
    #[serde(default = "default_min_output")]
    pub min_output: f64,
    #[serde(default = "default_max_output")]
    pub max_output: f64,
}

/// Which clamp (if any) the previous output landed on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Saturation {
    None,
    Low,
    High,
}

/// A standard PID controller
pub struct PidController {
    kp: f64,
    ki: f64,
    kd: f64,
    setpoint: f64,
    min_output: f64,
    max_output: f64,

    integral: f64,
    prev_error: f64,
    saturation: Saturation,
}

impl PidController {
    pub fn new(params: PidParameters) -> Result<Self, SimulationError> {
        if params.min_output >= params.max_output {
            return Err(SimulationError::InvalidConfig(format!(
                "PID min_output ({}) must be below max_output ({})",
                params.min_output, params.max_output
            )));
        }
        Ok(Self {
            kp: params.kp,
            ki: params.ki,
            kd: params.kd,
            setpoint: params.setpoint,
            min_output: params.min_output,
            max_output: params.max_output,
            integral: 0.0,
            prev_error: 0.0,
            saturation: Saturation::None,
        })
    }

    /// Accumulated integral term (exposed for inspection)
    pub fn integral(&self) -> f64 {
        self.integral
    }
}

impl Controller for PidController {
    fn compute_action(&mut self, observation: f64, dt: f64) -> f64 {
        let error = self.setpoint - observation;

        // Conditional anti-windup: while clamped, only integrate when the
        // increment drives the raw output back toward the admissible band.
        let increment_pushes_deeper = match self.saturation {
            Saturation::High => self.ki * error > 0.0,
            Saturation::Low => self.ki * error < 0.0,
            Saturation::None => false,
        };
        if !increment_pushes_deeper {
            self.integral += error * dt;
        }

        let derivative = (error - self.prev_error) / dt;
        let raw = self.kp * error + self.ki * self.integral + self.kd * derivative;
        let output = raw.clamp(self.min_output, self.max_output);

        self.saturation = if raw > self.max_output {
            Saturation::High
        } else if raw < self.min_output {
            Saturation::Low
        } else {
            Saturation::None
        };
        self.prev_error = error;
        output
    }

    fn set_setpoint(&mut self, value: f64) {
        // The integral carries over: a setpoint change must not kick the
        // actuator through a reset transient.
        debug!(from = self.setpoint, to = value, "PID setpoint updated");
        self.setpoint = value;
    }

    fn setpoint(&self) -> f64 {
        self.setpoint
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(kp: f64, ki: f64, kd: f64, setpoint: f64, lo: f64, hi: f64) -> PidController {
        PidController::new(PidParameters {
            kp,
            ki,
            kd,
            setpoint,
            min_output: lo,
            max_output: hi,
        })
        .unwrap()
    }

    #[test]
    fn test_invalid_bounds_rejected() {
        assert!(PidController::new(PidParameters {
            kp: 1.0,
            ki: 0.0,
            kd: 0.0,
            setpoint: 0.0,
            min_output: 1.0,
            max_output: 1.0,
        })
        .is_err());
    }

    #[test]
    fn test_proportional_only() {
        let mut c = pid(2.0, 0.0, 0.0, 10.0, -100.0, 100.0);
        assert_eq!(c.compute_action(7.0, 1.0), 6.0);
    }

    #[test]
    fn test_integral_accumulates() {
        let mut c = pid(0.0, 1.0, 0.0, 5.0, -100.0, 100.0);
        assert_eq!(c.compute_action(4.0, 1.0), 1.0);
        assert_eq!(c.compute_action(4.0, 1.0), 2.0);
        assert_eq!(c.compute_action(4.0, 1.0), 3.0);
    }

    #[test]
    fn test_derivative_on_error() {
        let mut c = pid(0.0, 0.0, 1.0, 0.0, -100.0, 100.0);
        // error goes 0 -> -3: derivative = -3
        assert_eq!(c.compute_action(3.0, 1.0), -3.0);
        // error stays -3: derivative = 0
        assert_eq!(c.compute_action(3.0, 1.0), 0.0);
    }

    #[test]
    fn test_output_clamped() {
        let mut c = pid(10.0, 0.0, 0.0, 10.0, 0.0, 1.0);
        assert_eq!(c.compute_action(0.0, 1.0), 1.0);
        assert_eq!(c.compute_action(20.0, 1.0), 0.0);
    }

    #[test]
    fn test_anti_windup_freezes_integral_on_clamp() {
        let mut c = pid(1.0, 1.0, 0.0, 10.0, 0.0, 1.0);
        // Persistent large error saturates the output high
        c.compute_action(0.0, 1.0);
        let after_first = c.integral();
        for _ in 0..50 {
            c.compute_action(0.0, 1.0);
        }
        // The integral must not have grown while clamped high with an
        // increment that pushes deeper into the clamp
        assert_eq!(c.integral(), after_first);
    }

    #[test]
    fn test_anti_windup_reverse_acting_gains() {
        // Negative gains: level above setpoint drives the output high
        let mut c = pid(-0.5, -0.01, 0.0, 12.0, 0.0, 1.0);
        c.compute_action(14.0, 1.0);
        let after_first = c.integral();
        for _ in 0..50 {
            let out = c.compute_action(14.0, 1.0);
            assert_eq!(out, 1.0);
        }
        assert_eq!(
            c.integral(),
            after_first,
            "reverse-acting windup must freeze too"
        );
    }

    #[test]
    fn test_integral_unwinds_when_error_reverses() {
        let mut c = pid(1.0, 1.0, 0.0, 10.0, 0.0, 1.0);
        c.compute_action(0.0, 1.0); // clamps high
        // Error reverses: integration resumes because the increment now
        // points back toward the band
        c.compute_action(20.0, 1.0);
        assert!(c.integral() < 10.0);
    }

    #[test]
    fn test_set_setpoint_keeps_integral() {
        let mut c = pid(0.0, 1.0, 0.0, 5.0, -100.0, 100.0);
        c.compute_action(0.0, 1.0);
        let integral = c.integral();
        assert!(integral > 0.0);
        c.set_setpoint(2.0);
        assert_eq!(c.integral(), integral);
        assert_eq!(c.setpoint(), 2.0);
    }
}
