//! Time management for the simulation
//!
//! The simulation operates in discrete ticks of fixed duration `dt`.
//! This module provides deterministic time advancement: simulated time is
//! always derived as `tick * dt`, never accumulated, so it cannot drift.

use serde::{Deserialize, Serialize};

use crate::core::error::SimulationError;

/// Manages simulation time in discrete ticks
///
/// # Example
/// ```
/// use water_simulator_core_rs::SimClock;
///
/// let mut clock = SimClock::new(1.0, 300).unwrap();
/// assert_eq!(clock.current_tick(), 0);
/// assert_eq!(clock.current_time(), 0.0);
///
/// clock.advance();
/// assert_eq!(clock.current_tick(), 1);
/// assert_eq!(clock.current_time(), 1.0);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimClock {
    /// Duration of one tick in seconds
    dt: f64,
    /// Total number of ticks the run will execute
    num_steps: u64,
    /// Ticks elapsed since simulation start
    current_tick: u64,
}

impl SimClock {
    /// Create a new clock
    ///
    /// # Arguments
    /// * `dt` - Tick duration in seconds, must be > 0
    /// * `num_steps` - Number of ticks to run, must be > 0
    pub fn new(dt: f64, num_steps: u64) -> Result<Self, SimulationError> {
        if !(dt > 0.0) || !dt.is_finite() {
            return Err(SimulationError::InvalidConfig(format!(
                "dt must be a positive finite number, got {}",
                dt
            )));
        }
        if num_steps == 0 {
            return Err(SimulationError::InvalidConfig(
                "num_steps must be > 0".to_string(),
            ));
        }
        Ok(Self {
            dt,
            num_steps,
            current_tick: 0,
        })
    }

    /// Create a clock from a total duration in seconds
    ///
    /// The number of steps is `floor(duration / dt)`, matching the
    /// truncating semantics of the scenario format.
    pub fn from_duration(dt: f64, duration: f64) -> Result<Self, SimulationError> {
        if !(duration > 0.0) || !duration.is_finite() {
            return Err(SimulationError::InvalidConfig(format!(
                "duration must be a positive finite number, got {}",
                duration
            )));
        }
        if !(dt > 0.0) || !dt.is_finite() {
            return Err(SimulationError::InvalidConfig(format!(
                "dt must be a positive finite number, got {}",
                dt
            )));
        }
        Self::new(dt, (duration / dt) as u64)
    }

    /// Advance time by one tick
    pub fn advance(&mut self) {
        self.current_tick += 1;
    }

    /// Ticks elapsed since start
    pub fn current_tick(&self) -> u64 {
        self.current_tick
    }

    /// Simulated time in seconds, exactly `tick * dt`
    pub fn current_time(&self) -> f64 {
        self.current_tick as f64 * self.dt
    }

    /// Tick duration in seconds
    pub fn dt(&self) -> f64 {
        self.dt
    }

    /// Total ticks this run will execute
    pub fn num_steps(&self) -> u64 {
        self.num_steps
    }

    /// True once every tick has been executed
    pub fn is_finished(&self) -> bool {
        self.current_tick >= self.num_steps
    }
}
