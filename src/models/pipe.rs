//! Pipe model
//!
//! Transports water between two heads. Flow is computed from the head
//! difference with either the Darcy-Weisbach or Manning relation; there is
//! no storage and no reverse flow.

use std::collections::BTreeMap;
use std::f64::consts::PI;

use serde::Deserialize;
use tracing::{debug, info};

use crate::models::{
    IdentificationBatch, ModelError, Parameters, PhysicalComponent, State, StepInput, GRAVITY,
};

/// Flow calculation method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipeMethod {
    DarcyWeisbach,
    Manning,
}

fn default_method() -> PipeMethod {
    PipeMethod::DarcyWeisbach
}
fn default_friction_factor() -> f64 {
    0.02
}
fn default_manning_n() -> f64 {
    0.013
}

/// Construction parameters
#[derive(Debug, Clone, Deserialize)]
pub struct PipeParameters {
    #[serde(default = "default_method")]
    pub calculation_method: PipeMethod,
    #[serde(default = "default_friction_factor")]
    pub friction_factor: f64,
    #[serde(default = "default_manning_n")]
    pub manning_n: f64,
    pub length: f64,
    pub diameter: f64,
}

/// A pressurized pipe
pub struct Pipe {
    id: String,
    method: PipeMethod,
    friction_factor: f64,
    manning_n: f64,
    length: f64,
    diameter: f64,

    outflow: f64,
    head_loss: f64,
    external_inflow: f64,
}

impl Pipe {
    pub fn new(id: &str, initial_state: &State, params: PipeParameters) -> Result<Self, ModelError> {
        if !(params.length > 0.0) {
            return Err(ModelError::InvalidParameter {
                name: "length",
                reason: format!("must be > 0, got {}", params.length),
            });
        }
        if !(params.diameter > 0.0) {
            return Err(ModelError::InvalidParameter {
                name: "diameter",
                reason: format!("must be > 0, got {}", params.diameter),
            });
        }
        if !(params.friction_factor > 0.0) {
            return Err(ModelError::InvalidParameter {
                name: "friction_factor",
                reason: format!("must be > 0, got {}", params.friction_factor),
            });
        }
        if !(params.manning_n > 0.0) {
            return Err(ModelError::InvalidParameter {
                name: "manning_n",
                reason: format!("must be > 0, got {}", params.manning_n),
            });
        }

        info!(id, method = ?params.calculation_method, "pipe created");
        Ok(Self {
            id: id.to_string(),
            method: params.calculation_method,
            friction_factor: params.friction_factor,
            manning_n: params.manning_n,
            length: params.length,
            diameter: params.diameter,
            outflow: initial_state.get("outflow").copied().unwrap_or(0.0),
            head_loss: initial_state.get("head_loss").copied().unwrap_or(0.0),
            external_inflow: 0.0,
        })
    }

    fn area(&self) -> f64 {
        PI / 4.0 * self.diameter * self.diameter
    }

    /// `Q = A * sqrt(2 g h D / (f L))`
    fn flow_darcy_weisbach(&self, head_difference: f64, f: f64) -> f64 {
        if head_difference <= 0.0 {
            return 0.0;
        }
        self.area()
            * (2.0 * GRAVITY * head_difference * self.diameter / (f * self.length)).sqrt()
    }

    /// Manning's equation for a full circular pipe
    fn flow_manning(&self, head_difference: f64, n: f64) -> f64 {
        if head_difference <= 0.0 {
            return 0.0;
        }
        let hydraulic_radius = self.diameter / 4.0;
        let slope = head_difference / self.length;
        (1.0 / n) * self.area() * hydraulic_radius.powf(2.0 / 3.0) * slope.sqrt()
    }

    fn flow(&self, head_difference: f64) -> f64 {
        match self.method {
            PipeMethod::DarcyWeisbach => {
                self.flow_darcy_weisbach(head_difference, self.friction_factor)
            }
            PipeMethod::Manning => self.flow_manning(head_difference, self.manning_n),
        }
    }
}

impl PhysicalComponent for Pipe {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> State {
        State::from([
            ("outflow".to_string(), self.outflow),
            ("head_loss".to_string(), self.head_loss),
        ])
    }

    fn parameters(&self) -> Parameters {
        let mut params = Parameters::from([
            ("length".to_string(), self.length),
            ("diameter".to_string(), self.diameter),
        ]);
        match self.method {
            PipeMethod::DarcyWeisbach => {
                params.insert("friction_factor".to_string(), self.friction_factor);
            }
            PipeMethod::Manning => {
                params.insert("manning_n".to_string(), self.manning_n);
            }
        }
        params
    }

    fn set_state(&mut self, key: &str, value: f64) {
        match key {
            "outflow" => self.outflow = value,
            "head_loss" => self.head_loss = value,
            other => debug!(id = self.id.as_str(), key = other, "ignored unknown state key"),
        }
    }

    fn set_inflow(&mut self, value: f64) {
        self.external_inflow = value;
    }

    fn step(&mut self, input: &StepInput, _dt: f64) -> Result<State, ModelError> {
        let upstream = input.upstream_head_or_zero(&self.id);
        let downstream = input.downstream_head_or_zero(&self.id);
        let head_difference = upstream - downstream;

        self.outflow = self.flow(head_difference);
        self.head_loss = head_difference.max(0.0);

        if !self.outflow.is_finite() {
            return Err(ModelError::NonFinite { key: "outflow" });
        }
        Ok(self.state())
    }

    fn identify_parameters(&mut self, batch: &IdentificationBatch) -> Result<Parameters, ModelError> {
        let up = batch.series("upstream_levels")?;
        let down = batch.series("downstream_levels")?;
        let flows = batch.series("observed_flows")?;
        let n = up.len().min(down.len()).min(flows.len());
        if n < 2 {
            return Err(ModelError::InsufficientData(format!(
                "need at least 2 aligned samples, got {}",
                n
            )));
        }

        // Both relations are linear in a transform of the roughness
        // parameter, so the least squares fit is closed form:
        //   darcy:   Q = K_i / sqrt(f),  K_i = A sqrt(2 g h_i D / L)
        //   manning: Q = M_i / n,        M_i = A R^(2/3) sqrt(h_i / L)
        let mut num = 0.0;
        let mut den = 0.0;
        for i in 0..n {
            let head = up[i] - down[i];
            if head <= 0.0 {
                continue;
            }
            let k = match self.method {
                PipeMethod::DarcyWeisbach => self
                    .area()
                    * (2.0 * GRAVITY * head * self.diameter / self.length).sqrt(),
                PipeMethod::Manning => {
                    self.area()
                        * (self.diameter / 4.0).powf(2.0 / 3.0)
                        * (head / self.length).sqrt()
                }
            };
            num += k * flows[i];
            den += k * k;
        }
        if den == 0.0 || num <= 0.0 {
            return Err(ModelError::InsufficientData(
                "no samples with positive head and flow".to_string(),
            ));
        }

        // inverse = 1/sqrt(f) or 1/n minimizing the residual
        let inverse = num / den;
        let mut summary = BTreeMap::new();
        summary.insert("samples".to_string(), n as f64);
        match self.method {
            PipeMethod::DarcyWeisbach => {
                let fitted = (1.0 / (inverse * inverse)).clamp(0.001, 0.5);
                info!(id = self.id.as_str(), friction_factor = fitted, "pipe identification applied");
                self.friction_factor = fitted;
                summary.insert("friction_factor".to_string(), fitted);
            }
            PipeMethod::Manning => {
                let fitted = (1.0 / inverse).clamp(0.001, 0.1);
                info!(id = self.id.as_str(), manning_n = fitted, "pipe identification applied");
                self.manning_n = fitted;
                summary.insert("manning_n".to_string(), fitted);
            }
        }
        Ok(summary)
    }
}
