//! Physical component models
//!
//! Every hydraulic object in a scenario (reservoirs, gates, canal reaches,
//! pipes, pumps, valves, turbines) implements [`PhysicalComponent`]. A
//! component owns its state exclusively: the harness reads copies, feeds a
//! [`StepInput`] each tick, and never reaches into another component.
//!
//! Bus-aware components additionally register an action handler at
//! construction; incoming action messages set a `target_*` field which the
//! next `step` realizes subject to the device's rate limits.

pub mod canal;
pub mod gate;
pub mod pipe;
pub mod pump;
pub mod reservoir;
pub mod turbine;
pub mod valve;

use std::collections::BTreeMap;

use thiserror::Error;

pub use canal::{CanalModelType, CanalParameters, UnifiedCanal};
pub use gate::{Gate, GateParameters};
pub use pipe::{Pipe, PipeParameters};
pub use pump::{Pump, PumpParameters};
pub use reservoir::{Reservoir, ReservoirParameters, TopicBinding};
pub use turbine::{TurbineParameters, WaterTurbine};
pub use valve::{Valve, ValveParameters};

/// Gravitational acceleration, m/s^2
pub const GRAVITY: f64 = 9.81;

/// Density of water, kg/m^3
pub const WATER_DENSITY: f64 = 1000.0;

/// Component state: attribute name to scalar. Callers always receive copies.
pub type State = BTreeMap<String, f64>;

/// Scalar view of a component's parameters (introspection and logging)
pub type Parameters = BTreeMap<String, f64>;

/// Model-level error
#[derive(Debug, Error)]
pub enum ModelError {
    /// A parameter is outside its physical range at construction
    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    /// A `st_venant` canal was stepped by the ordinary tick loop
    #[error("'{component}' uses the st_venant model and must be driven by a network solver")]
    SolverRequired { component: String },

    /// The component has no identifiable parameters
    #[error("parameter identification is not supported by '{component}'")]
    IdentificationUnsupported { component: String },

    /// Identification input is missing a series or is too short
    #[error("identification data incomplete: {0}")]
    InsufficientData(String),

    /// A step produced a non-finite value; fatal to the run
    #[error("step produced a non-finite value for '{key}'")]
    NonFinite { key: &'static str },
}

/// Inputs assembled by the harness for one `step` call
///
/// `inflow` is always present (zero for source nodes). The optional heads
/// are `None` when the component has no neighbor on that side; models that
/// need a missing head treat it as zero and emit a debug diagnostic.
#[derive(Debug, Clone, Default)]
pub struct StepInput {
    /// Sum of upstream neighbors' outflow this tick
    pub inflow: f64,
    /// Mean head of upstream neighbors (this tick)
    pub upstream_head: Option<f64>,
    /// Mean head of downstream neighbors (start-of-tick snapshot)
    pub downstream_head: Option<f64>,
    /// Sum of downstream neighbors' outflow at start of tick; what storage
    /// components release to satisfy their downstream devices
    pub outflow_demand: f64,
    /// Direct controller output (orchestrated mode)
    pub control_signal: Option<f64>,
    /// Number of upstream neighbors in the topology
    pub upstream_count: usize,
}

impl StepInput {
    /// Upstream head, defaulting to zero with a diagnostic
    pub fn upstream_head_or_zero(&self, component: &str) -> f64 {
        match self.upstream_head {
            Some(h) => h,
            None => {
                tracing::debug!(component, "missing upstream_head, using 0");
                0.0
            }
        }
    }

    /// Downstream head, defaulting to zero with a diagnostic
    pub fn downstream_head_or_zero(&self, component: &str) -> f64 {
        match self.downstream_head {
            Some(h) => h,
            None => {
                tracing::debug!(component, "missing downstream_head, using 0");
                0.0
            }
        }
    }
}

/// Batch of time-aligned series handed to `identify_parameters`
#[derive(Debug, Clone)]
pub struct IdentificationBatch {
    /// Sample spacing in seconds
    pub dt: f64,
    /// Named series, all truncated to a common length by the caller
    pub series: BTreeMap<String, Vec<f64>>,
}

impl IdentificationBatch {
    pub fn new(dt: f64) -> Self {
        Self {
            dt,
            series: BTreeMap::new(),
        }
    }

    /// Fetch a required series by name
    pub fn series(&self, key: &str) -> Result<&[f64], ModelError> {
        self.series
            .get(key)
            .map(|v| v.as_slice())
            .ok_or_else(|| ModelError::InsufficientData(format!("missing series '{}'", key)))
    }

    /// Length of the shortest series (0 when empty)
    pub fn common_len(&self) -> usize {
        self.series.values().map(|v| v.len()).min().unwrap_or(0)
    }
}

/// The physical-model abstraction stepped by the harness
pub trait PhysicalComponent {
    /// Unique component id
    fn id(&self) -> &str;

    /// Copy of the current state
    fn state(&self) -> State;

    /// Scalar view of the model parameters
    fn parameters(&self) -> Parameters;

    /// Harness-only side channel: overwrite one state attribute
    fn set_state(&mut self, key: &str, value: f64);

    /// Harness-only side channel: constant external inflow added to the
    /// topology-derived inflow every subsequent step (disturbance injection)
    fn set_inflow(&mut self, value: f64);

    /// Advance one tick; returns the new state (also stored internally)
    fn step(&mut self, input: &StepInput, dt: f64) -> Result<State, ModelError>;

    /// True for models integrated by an external network solver rather
    /// than the ordinary per-component loop
    fn is_solver_driven(&self) -> bool {
        false
    }

    /// Re-estimate identifiable parameters from data, apply them, and
    /// return a scalar summary of what changed
    fn identify_parameters(&mut self, _batch: &IdentificationBatch) -> Result<Parameters, ModelError> {
        Err(ModelError::IdentificationUnsupported {
            component: self.id().to_string(),
        })
    }
}

/// Linear interpolation over a sorted table, clamped at both ends
///
/// Mirrors the storage-curve lookup semantics: inputs below the first knot
/// return the first value, inputs above the last knot return the last.
pub(crate) fn interp(xs: &[f64], ys: &[f64], x: f64) -> f64 {
    debug_assert_eq!(xs.len(), ys.len());
    if x <= xs[0] {
        return ys[0];
    }
    if x >= xs[xs.len() - 1] {
        return ys[ys.len() - 1];
    }
    let idx = xs.partition_point(|&v| v <= x);
    let (x0, x1) = (xs[idx - 1], xs[idx]);
    let (y0, y1) = (ys[idx - 1], ys[idx]);
    y0 + (y1 - y0) * (x - x0) / (x1 - x0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interp_midpoint() {
        let xs = [0.0, 10.0];
        let ys = [0.0, 100.0];
        assert_eq!(interp(&xs, &ys, 5.0), 50.0);
    }

    #[test]
    fn test_interp_clamps_at_ends() {
        let xs = [1.0, 2.0];
        let ys = [10.0, 20.0];
        assert_eq!(interp(&xs, &ys, 0.0), 10.0);
        assert_eq!(interp(&xs, &ys, 3.0), 20.0);
    }

    #[test]
    fn test_batch_common_len() {
        let mut batch = IdentificationBatch::new(1.0);
        batch.series.insert("a".into(), vec![1.0, 2.0, 3.0]);
        batch.series.insert("b".into(), vec![1.0, 2.0]);
        assert_eq!(batch.common_len(), 2);
        assert!(batch.series("c").is_err());
    }
}
