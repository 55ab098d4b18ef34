//! Unified canal reach model
//!
//! One component covers five simplified canal representations selected by
//! `model_type`. The first four are stepped by the ordinary tick loop; the
//! `st_venant` variant only exposes its linearized equation coefficients
//! and must be integrated by an external network solver.

use std::collections::VecDeque;

use serde::Deserialize;
use tracing::{debug, info};

use crate::models::{ModelError, Parameters, PhysicalComponent, State, StepInput};

/// Selectable canal sub-model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanalModelType {
    /// Storage basin with a level-driven outlet
    Integral,
    /// Pure transport delay on the inflow
    IntegralDelay,
    /// Transport delay plus a zero (lead) term on the outflow
    IntegralDelayZero,
    /// First-order linear reservoir routing
    LinearReservoir,
    /// Full dynamic-wave model, solver-driven
    StVenant,
}

/// Construction parameters; each sub-model reads its own subset
#[derive(Debug, Clone, Deserialize)]
pub struct CanalParameters {
    #[serde(default = "default_model_type")]
    pub model_type: CanalModelType,

    // integral
    #[serde(default)]
    pub surface_area: Option<f64>,
    #[serde(default)]
    pub outlet_coefficient: Option<f64>,

    // integral_delay, integral_delay_zero
    #[serde(default)]
    pub gain: Option<f64>,
    #[serde(default)]
    pub delay: Option<f64>,
    #[serde(default)]
    pub zero_time_constant: Option<f64>,

    // linear_reservoir
    #[serde(default)]
    pub storage_constant: Option<f64>,
    #[serde(default)]
    pub level_storage_ratio: Option<f64>,
}

fn default_model_type() -> CanalModelType {
    CanalModelType::IntegralDelay
}

impl Default for CanalParameters {
    fn default() -> Self {
        Self {
            model_type: default_model_type(),
            surface_area: None,
            outlet_coefficient: None,
            gain: None,
            delay: None,
            zero_time_constant: None,
            storage_constant: None,
            level_storage_ratio: None,
        }
    }
}

/// Linearized coefficients exposed to a network solver (`st_venant` only)
#[derive(Debug, Clone, Copy)]
pub struct CanalEquations {
    pub water_level: f64,
    pub flow: f64,
    pub surface_area: f64,
}

/// A canal reach
pub struct UnifiedCanal {
    id: String,
    model_type: CanalModelType,

    surface_area: f64,
    outlet_coefficient: f64,
    gain: f64,
    delay: f64,
    zero_time_constant: f64,
    storage_constant: f64,
    level_storage_ratio: f64,

    water_level: f64,
    inflow: f64,
    outflow: f64,
    /// Storage volume; meaning depends on the sub-model
    volume: f64,

    /// Inflow ring buffer for the delay models, sized on first step
    inflow_history: Option<VecDeque<f64>>,
    external_inflow: f64,
}

impl UnifiedCanal {
    pub fn new(
        id: &str,
        initial_state: &State,
        params: CanalParameters,
    ) -> Result<Self, ModelError> {
        let surface_area = params.surface_area.unwrap_or(10_000.0);
        let outlet_coefficient = params.outlet_coefficient.unwrap_or(5.0);
        let gain = params.gain.unwrap_or(0.001);
        let delay = params.delay.unwrap_or(300.0);
        let zero_time_constant = params.zero_time_constant.unwrap_or(50.0);
        let storage_constant = params.storage_constant.unwrap_or(1200.0);
        let level_storage_ratio = params.level_storage_ratio.unwrap_or(0.005);

        let positive: [(&'static str, f64); 3] = [
            ("surface_area", surface_area),
            ("storage_constant", storage_constant),
            ("level_storage_ratio", level_storage_ratio),
        ];
        for (name, value) in positive {
            if !(value > 0.0) {
                return Err(ModelError::InvalidParameter {
                    name,
                    reason: format!("must be > 0, got {}", value),
                });
            }
        }
        let non_negative: [(&'static str, f64); 2] =
            [("outlet_coefficient", outlet_coefficient), ("delay", delay)];
        for (name, value) in non_negative {
            if value < 0.0 {
                return Err(ModelError::InvalidParameter {
                    name,
                    reason: format!("must be >= 0, got {}", value),
                });
            }
        }

        let water_level = initial_state.get("water_level").copied().unwrap_or(5.0);
        let inflow = initial_state.get("inflow").copied().unwrap_or(0.0);
        let outflow = initial_state.get("outflow").copied().unwrap_or(0.0);
        let volume = match params.model_type {
            CanalModelType::Integral => water_level * surface_area,
            CanalModelType::LinearReservoir => water_level / level_storage_ratio,
            _ => initial_state.get("volume").copied().unwrap_or(0.0),
        };

        info!(id, model = ?params.model_type, water_level, "canal created");
        Ok(Self {
            id: id.to_string(),
            model_type: params.model_type,
            surface_area,
            outlet_coefficient,
            gain,
            delay,
            zero_time_constant,
            storage_constant,
            level_storage_ratio,
            water_level,
            inflow,
            outflow,
            volume,
            inflow_history: None,
            external_inflow: 0.0,
        })
    }

    pub fn model_type(&self) -> CanalModelType {
        self.model_type
    }

    /// Linearized equation coefficients for a network solver
    pub fn equation_coefficients(&self) -> CanalEquations {
        CanalEquations {
            water_level: self.water_level,
            flow: self.outflow,
            surface_area: self.surface_area,
        }
    }

    /// Applied by a network solver in place of `step`
    pub fn apply_network_update(&mut self, d_level: f64, d_flow: f64) {
        self.water_level = (self.water_level + d_level).max(0.0);
        self.outflow = (self.outflow + d_flow).max(0.0);
    }

    fn history(&mut self, dt: f64) -> &mut VecDeque<f64> {
        if self.inflow_history.is_none() {
            let size = if self.delay > 0.0 {
                (self.delay / dt) as usize + 2
            } else {
                2
            };
            self.inflow_history = Some(VecDeque::from(vec![self.inflow; size]));
        }
        self.inflow_history.as_mut().unwrap()
    }

    fn step_integral(&mut self, input: &StepInput, total_inflow: f64, dt: f64) {
        self.inflow = total_inflow;
        // Free outlet plus whatever downstream devices draw, bounded by
        // the water actually present this tick
        let requested = self.outlet_coefficient * self.water_level.max(0.0).sqrt()
            + input.outflow_demand;
        let available = self.water_level * self.surface_area / dt + total_inflow;
        self.outflow = requested.clamp(0.0, available.max(0.0));
        self.water_level += (total_inflow - self.outflow) / self.surface_area * dt;
        self.water_level = self.water_level.max(0.0);
        self.volume = self.water_level * self.surface_area;
    }

    fn step_integral_delay(&mut self, total_inflow: f64, dt: f64) {
        let gain = self.gain;
        let history = self.history(dt);
        history.pop_front();
        history.push_back(total_inflow);
        let delayed_inflow = *history.front().unwrap();

        self.inflow = total_inflow;
        self.outflow = delayed_inflow;
        self.water_level += gain * (total_inflow - delayed_inflow) * dt;
        self.water_level = self.water_level.max(0.0);
    }

    fn step_integral_delay_zero(&mut self, total_inflow: f64, dt: f64) {
        let gain = self.gain;
        let zero_tc = self.zero_time_constant;
        let history = self.history(dt);
        history.pop_front();
        history.push_back(total_inflow);
        let delayed = history[1];
        let delayed_previous = history[0];

        let derivative = (delayed - delayed_previous) / dt;
        self.inflow = total_inflow;
        self.outflow = delayed + zero_tc * derivative;
        self.water_level += gain * (total_inflow - self.outflow) * dt;
        self.water_level = self.water_level.max(0.0);
    }

    fn step_linear_reservoir(&mut self, total_inflow: f64, dt: f64) {
        self.inflow = total_inflow;
        let outflow_new =
            (self.storage_constant * self.outflow + dt * total_inflow) / (self.storage_constant + dt);
        self.outflow = outflow_new;
        self.volume += (total_inflow - outflow_new) * dt;
        self.water_level = (self.volume * self.level_storage_ratio).max(0.0);
    }
}

impl PhysicalComponent for UnifiedCanal {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> State {
        let mut state = State::from([
            ("water_level".to_string(), self.water_level),
            ("inflow".to_string(), self.inflow),
            ("outflow".to_string(), self.outflow),
        ]);
        if matches!(
            self.model_type,
            CanalModelType::Integral | CanalModelType::LinearReservoir
        ) {
            state.insert("volume".to_string(), self.volume);
        }
        state
    }

    fn parameters(&self) -> Parameters {
        let mut params = Parameters::new();
        match self.model_type {
            CanalModelType::Integral => {
                params.insert("surface_area".to_string(), self.surface_area);
                params.insert("outlet_coefficient".to_string(), self.outlet_coefficient);
            }
            CanalModelType::IntegralDelay => {
                params.insert("gain".to_string(), self.gain);
                params.insert("delay".to_string(), self.delay);
            }
            CanalModelType::IntegralDelayZero => {
                params.insert("gain".to_string(), self.gain);
                params.insert("delay".to_string(), self.delay);
                params.insert("zero_time_constant".to_string(), self.zero_time_constant);
            }
            CanalModelType::LinearReservoir => {
                params.insert("storage_constant".to_string(), self.storage_constant);
                params.insert("level_storage_ratio".to_string(), self.level_storage_ratio);
            }
            CanalModelType::StVenant => {
                params.insert("surface_area".to_string(), self.surface_area);
            }
        }
        params
    }

    fn set_state(&mut self, key: &str, value: f64) {
        match key {
            "water_level" => {
                self.water_level = value.max(0.0);
                if self.model_type == CanalModelType::Integral {
                    self.volume = self.water_level * self.surface_area;
                } else if self.model_type == CanalModelType::LinearReservoir {
                    self.volume = self.water_level / self.level_storage_ratio;
                }
            }
            "volume" => {
                self.volume = value.max(0.0);
                if self.model_type == CanalModelType::Integral {
                    self.water_level = self.volume / self.surface_area;
                } else if self.model_type == CanalModelType::LinearReservoir {
                    self.water_level = self.volume * self.level_storage_ratio;
                }
            }
            "inflow" => self.inflow = value,
            "outflow" => self.outflow = value,
            other => debug!(id = self.id.as_str(), key = other, "ignored unknown state key"),
        }
    }

    fn set_inflow(&mut self, value: f64) {
        self.external_inflow = value;
    }

    fn is_solver_driven(&self) -> bool {
        self.model_type == CanalModelType::StVenant
    }

    fn step(&mut self, input: &StepInput, dt: f64) -> Result<State, ModelError> {
        if self.model_type == CanalModelType::StVenant {
            return Err(ModelError::SolverRequired {
                component: self.id.clone(),
            });
        }

        let total_inflow = input.inflow + self.external_inflow;
        match self.model_type {
            CanalModelType::Integral => self.step_integral(input, total_inflow, dt),
            CanalModelType::IntegralDelay => self.step_integral_delay(total_inflow, dt),
            CanalModelType::IntegralDelayZero => self.step_integral_delay_zero(total_inflow, dt),
            CanalModelType::LinearReservoir => self.step_linear_reservoir(total_inflow, dt),
            CanalModelType::StVenant => unreachable!(),
        }

        if !self.water_level.is_finite() {
            return Err(ModelError::NonFinite { key: "water_level" });
        }
        if !self.outflow.is_finite() {
            return Err(ModelError::NonFinite { key: "outflow" });
        }
        Ok(self.state())
    }
}
