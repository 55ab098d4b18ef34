//! Reservoir model
//!
//! State is driven by the balance of inflows and outflows. Physical inflow
//! arrives from upstream neighbors through the harness; data-driven inflow
//! (rainfall, observed series) arrives over the message bus. The
//! volume/level relationship is either linear (surface area) or a
//! table-interpolated storage curve. Also covers lakes: an optional
//! `max_volume` spills excess to the outflow, and an optional evaporation
//! rate drains the stored volume.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use serde::Deserialize;
use tracing::{debug, info};

use crate::bus::{HandlerError, MessageBus};
use crate::models::{
    interp, IdentificationBatch, ModelError, Parameters, PhysicalComponent, State, StepInput,
};

/// One bus topic a reservoir reads a flow value from
#[derive(Debug, Clone, Deserialize)]
pub struct TopicBinding {
    pub topic: String,
    /// Payload key carrying the flow value
    #[serde(default = "default_binding_key")]
    pub key: String,
}

fn default_binding_key() -> String {
    "inflow_rate".to_string()
}

/// Volume/level relationship
#[derive(Debug, Clone)]
enum Storage {
    /// `level = volume / surface_area`
    Linear { surface_area: f64 },
    /// Piecewise-linear storage curve, sorted by volume
    Curve { volumes: Vec<f64>, levels: Vec<f64> },
}

impl Storage {
    fn level_from_volume(&self, volume: f64) -> f64 {
        match self {
            Storage::Linear { surface_area } => volume / surface_area,
            Storage::Curve { volumes, levels } => interp(volumes, levels, volume),
        }
    }

    fn volume_from_level(&self, level: f64) -> f64 {
        match self {
            Storage::Linear { surface_area } => level * surface_area,
            Storage::Curve { volumes, levels } => interp(levels, volumes, level),
        }
    }
}

/// Construction parameters
///
/// Exactly one of `surface_area` / `storage_curve` drives the level lookup;
/// when both are present the curve wins.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReservoirParameters {
    #[serde(default)]
    pub surface_area: Option<f64>,
    /// `[volume, level]` pairs; volumes must be strictly increasing
    #[serde(default)]
    pub storage_curve: Option<Vec<[f64; 2]>>,
    /// Spill threshold; excess volume leaves through the outflow
    #[serde(default)]
    pub max_volume: Option<f64>,
    /// Constant evaporative loss in volume units per second
    #[serde(default)]
    pub evaporation_rate: f64,
}

/// A reservoir or lake
pub struct Reservoir {
    id: String,
    storage: Storage,
    max_volume: Option<f64>,
    evaporation_rate: f64,

    volume: f64,
    water_level: f64,
    inflow: f64,
    outflow: f64,
    evaporation: f64,

    /// `set_inflow` side channel; persists until overwritten
    external_inflow: f64,
    /// Latest value per subscribed inflow topic; zeroed after each step
    topic_inflows: BTreeMap<String, f64>,
    /// Latest value per subscribed outflow topic; zeroed after each step
    topic_outflows: BTreeMap<String, f64>,
}

impl Reservoir {
    pub fn new(
        id: &str,
        initial_state: &State,
        params: ReservoirParameters,
    ) -> Result<Self, ModelError> {
        let storage = match (&params.storage_curve, params.surface_area) {
            (Some(curve), _) => {
                if curve.len() < 2 {
                    return Err(ModelError::InvalidParameter {
                        name: "storage_curve",
                        reason: "needs at least 2 [volume, level] points".to_string(),
                    });
                }
                let mut sorted = curve.clone();
                sorted.sort_by(|a, b| a[0].total_cmp(&b[0]));
                let volumes: Vec<f64> = sorted.iter().map(|p| p[0]).collect();
                let levels: Vec<f64> = sorted.iter().map(|p| p[1]).collect();
                if volumes.windows(2).any(|w| w[1] <= w[0]) {
                    return Err(ModelError::InvalidParameter {
                        name: "storage_curve",
                        reason: "volumes must be strictly increasing".to_string(),
                    });
                }
                if levels.windows(2).any(|w| w[1] < w[0]) {
                    return Err(ModelError::InvalidParameter {
                        name: "storage_curve",
                        reason: "levels must be non-decreasing".to_string(),
                    });
                }
                Storage::Curve { volumes, levels }
            }
            (None, Some(area)) => {
                if !(area > 0.0) {
                    return Err(ModelError::InvalidParameter {
                        name: "surface_area",
                        reason: format!("must be > 0, got {}", area),
                    });
                }
                Storage::Linear { surface_area: area }
            }
            (None, None) => {
                return Err(ModelError::InvalidParameter {
                    name: "surface_area",
                    reason: "either surface_area or storage_curve is required".to_string(),
                })
            }
        };

        if params.evaporation_rate < 0.0 {
            return Err(ModelError::InvalidParameter {
                name: "evaporation_rate",
                reason: format!("must be >= 0, got {}", params.evaporation_rate),
            });
        }
        if let Some(mv) = params.max_volume {
            if !(mv > 0.0) {
                return Err(ModelError::InvalidParameter {
                    name: "max_volume",
                    reason: format!("must be > 0, got {}", mv),
                });
            }
        }

        // Initial volume from `volume`, else derived from `water_level`
        let volume = match initial_state.get("volume") {
            Some(v) if *v >= 0.0 => *v,
            Some(v) => {
                return Err(ModelError::InvalidParameter {
                    name: "volume",
                    reason: format!("initial volume must be >= 0, got {}", v),
                })
            }
            None => initial_state
                .get("water_level")
                .map(|l| storage.volume_from_level(*l))
                .unwrap_or(0.0),
        };
        let water_level = storage.level_from_volume(volume);

        info!(id, volume, water_level, "reservoir created");
        Ok(Self {
            id: id.to_string(),
            storage,
            max_volume: params.max_volume,
            evaporation_rate: params.evaporation_rate,
            volume,
            water_level,
            inflow: initial_state.get("inflow").copied().unwrap_or(0.0),
            outflow: initial_state.get("outflow").copied().unwrap_or(0.0),
            evaporation: 0.0,
            external_inflow: 0.0,
            topic_inflows: BTreeMap::new(),
            topic_outflows: BTreeMap::new(),
        })
    }

    /// Subscribe the reservoir to data-driven inflow and outflow topics
    ///
    /// Each binding records the latest published value; `step` consumes and
    /// zeroes them so stale data never carries over.
    pub fn connect_bus(
        this: &Rc<RefCell<Self>>,
        bus: &Rc<MessageBus>,
        inflow_topics: &[TopicBinding],
        outflow_topics: &[TopicBinding],
    ) {
        let id = this.borrow().id.clone();
        for (bindings, is_inflow) in [(inflow_topics, true), (outflow_topics, false)] {
            for binding in bindings {
                this.borrow_mut().register_topic(&binding.topic, is_inflow);
                let weak = Rc::downgrade(this);
                let topic = binding.topic.clone();
                let key = binding.key.clone();
                let label = format!("{}/{}", id, if is_inflow { "inflow" } else { "outflow" });
                bus.subscribe(&binding.topic, &label, move |msg| {
                    let this = weak.upgrade().ok_or(HandlerError::SubscriberGone)?;
                    let mut res = this.try_borrow_mut().map_err(|_| HandlerError::Reentrant)?;
                    if let Some(value) = msg.get(&key) {
                        if is_inflow {
                            res.topic_inflows.insert(topic.clone(), value);
                        } else {
                            res.topic_outflows.insert(topic.clone(), value);
                        }
                    }
                    Ok(())
                });
            }
        }
    }

    fn register_topic(&mut self, topic: &str, is_inflow: bool) {
        if is_inflow {
            self.topic_inflows.insert(topic.to_string(), 0.0);
        } else {
            self.topic_outflows.insert(topic.to_string(), 0.0);
        }
    }

    fn check_finite(&self) -> Result<(), ModelError> {
        if !self.volume.is_finite() {
            return Err(ModelError::NonFinite { key: "volume" });
        }
        if !self.water_level.is_finite() {
            return Err(ModelError::NonFinite { key: "water_level" });
        }
        Ok(())
    }
}

impl PhysicalComponent for Reservoir {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> State {
        State::from([
            ("volume".to_string(), self.volume),
            ("water_level".to_string(), self.water_level),
            ("inflow".to_string(), self.inflow),
            ("outflow".to_string(), self.outflow),
            ("evaporation".to_string(), self.evaporation),
        ])
    }

    fn parameters(&self) -> Parameters {
        let mut params = Parameters::new();
        match &self.storage {
            Storage::Linear { surface_area } => {
                params.insert("surface_area".to_string(), *surface_area);
            }
            Storage::Curve { volumes, .. } => {
                params.insert("storage_curve_points".to_string(), volumes.len() as f64);
            }
        }
        if let Some(mv) = self.max_volume {
            params.insert("max_volume".to_string(), mv);
        }
        params.insert("evaporation_rate".to_string(), self.evaporation_rate);
        params
    }

    fn set_state(&mut self, key: &str, value: f64) {
        match key {
            "volume" => {
                self.volume = value.max(0.0);
                self.water_level = self.storage.level_from_volume(self.volume);
            }
            "water_level" => {
                self.water_level = value;
                self.volume = self.storage.volume_from_level(value).max(0.0);
            }
            "inflow" => self.inflow = value,
            "outflow" => self.outflow = value,
            other => debug!(id = self.id.as_str(), key = other, "ignored unknown state key"),
        }
    }

    fn set_inflow(&mut self, value: f64) {
        self.external_inflow = value;
    }

    fn step(&mut self, input: &StepInput, dt: f64) -> Result<State, ModelError> {
        let total_inflow = input.inflow
            + self.external_inflow
            + self.topic_inflows.values().sum::<f64>();
        let requested_outflow =
            input.outflow_demand + self.topic_outflows.values().sum::<f64>();

        // The outflow can never exceed what the tick makes available.
        let available = self.volume / dt + total_inflow;
        let mut outflow = requested_outflow.clamp(0.0, available.max(0.0));

        let mut new_volume = (self.volume + (total_inflow - outflow) * dt).max(0.0);

        // Evaporation drains after the balance, bounded by remaining volume
        let evaporation = self.evaporation_rate.min(new_volume / dt);
        new_volume -= evaporation * dt;

        // Volume above the spill threshold leaves through the outflow
        if let Some(max_volume) = self.max_volume {
            if new_volume > max_volume {
                outflow += (new_volume - max_volume) / dt;
                new_volume = max_volume;
            }
        }

        self.volume = new_volume;
        self.water_level = self.storage.level_from_volume(new_volume);
        self.inflow = total_inflow;
        self.outflow = outflow;
        self.evaporation = evaporation;

        // Zero the data-driven values so the next step never reuses them
        for value in self.topic_inflows.values_mut() {
            *value = 0.0;
        }
        for value in self.topic_outflows.values_mut() {
            *value = 0.0;
        }

        self.check_finite()?;
        Ok(self.state())
    }

    fn identify_parameters(&mut self, batch: &IdentificationBatch) -> Result<Parameters, ModelError> {
        let inflows = batch.series("inflows")?;
        let outflows = batch.series("outflows")?;
        let levels = batch.series("levels")?;
        let n = inflows.len().min(outflows.len()).min(levels.len());
        if n < 2 {
            return Err(ModelError::InsufficientData(format!(
                "need at least 2 aligned samples, got {}",
                n
            )));
        }

        // Reconstruct the volume trajectory from the flow balance
        let mut sim_volumes = vec![0.0; n];
        sim_volumes[0] = self.storage.volume_from_level(levels[0]);
        for i in 1..n {
            sim_volumes[i] =
                (sim_volumes[i - 1] + (inflows[i - 1] - outflows[i - 1]) * batch.dt).max(0.0);
        }

        let rmse_against = |storage: &Storage| -> f64 {
            let sq_sum: f64 = sim_volumes
                .iter()
                .zip(levels)
                .map(|(v, l)| {
                    let e = storage.level_from_volume(*v) - l;
                    e * e
                })
                .sum();
            (sq_sum / n as f64).sqrt()
        };
        let rmse_before = rmse_against(&self.storage);

        let candidate = match &self.storage {
            Storage::Linear { .. } => {
                // level_i = level_0 + c_i / A with c_i the cumulative flow
                // balance, so A fits in closed form independently of the
                // current (possibly wrong) surface area.
                let mut c = vec![0.0; n];
                for i in 1..n {
                    c[i] = c[i - 1] + (inflows[i - 1] - outflows[i - 1]) * batch.dt;
                }
                let num: f64 = c.iter().map(|v| v * v).sum();
                let den: f64 = c
                    .iter()
                    .zip(levels)
                    .map(|(ci, li)| ci * (li - levels[0]))
                    .sum();
                if den <= 0.0 || num <= 0.0 {
                    return Err(ModelError::InsufficientData(
                        "degenerate level data, cannot refit surface_area".to_string(),
                    ));
                }
                Storage::Linear {
                    surface_area: num / den,
                }
            }
            Storage::Curve { volumes, levels: old_levels } => {
                // Assign each sample to its nearest volume knot, average the
                // observed levels per knot, then restore monotonicity.
                let mut sums = vec![0.0; volumes.len()];
                let mut counts = vec![0usize; volumes.len()];
                for (v, l) in sim_volumes.iter().zip(levels) {
                    let knot = volumes
                        .iter()
                        .enumerate()
                        .min_by(|(_, a), (_, b)| (*a - v).abs().total_cmp(&(*b - v).abs()))
                        .map(|(i, _)| i)
                        .unwrap_or(0);
                    sums[knot] += l;
                    counts[knot] += 1;
                }
                let mut new_levels: Vec<f64> = old_levels
                    .iter()
                    .enumerate()
                    .map(|(i, old)| {
                        if counts[i] > 0 {
                            sums[i] / counts[i] as f64
                        } else {
                            *old
                        }
                    })
                    .collect();
                for i in 1..new_levels.len() {
                    if new_levels[i] < new_levels[i - 1] {
                        new_levels[i] = new_levels[i - 1];
                    }
                }
                Storage::Curve {
                    volumes: volumes.clone(),
                    levels: new_levels,
                }
            }
        };

        let rmse_after = rmse_against(&candidate);
        let mut summary = Parameters::new();
        summary.insert("samples".to_string(), n as f64);
        summary.insert("rmse_before".to_string(), rmse_before);

        if rmse_after <= rmse_before {
            info!(
                id = self.id.as_str(),
                rmse_before, rmse_after, "storage identification applied"
            );
            if let Storage::Linear { surface_area } = candidate {
                summary.insert("surface_area".to_string(), surface_area);
            }
            summary.insert("rmse".to_string(), rmse_after);
            self.storage = candidate;
            self.water_level = self.storage.level_from_volume(self.volume);
        } else {
            debug!(
                id = self.id.as_str(),
                rmse_before, rmse_after, "storage identification rejected, keeping parameters"
            );
            summary.insert("rmse".to_string(), rmse_before);
        }
        Ok(summary)
    }
}
