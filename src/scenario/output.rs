//! Result artifact sinks
//!
//! Writes the final [`SimulationResult`] either as one JSON document or as
//! one CSV file per component (rows are ticks, columns are state keys).

use std::path::{Path, PathBuf};

use tracing::info;

use crate::core::error::SimulationError;
use crate::orchestrator::SimulationResult;
use crate::scenario::config::{OutputConfig, OutputFormat};

/// Write the result using the configured sink; returns the artifact path
///
/// `override_path` (CLI flag) wins over the config path; with neither, the
/// artifact lands next to the scenario as `results.json` / `results/`.
pub fn write_result(
    result: &SimulationResult,
    output: &OutputConfig,
    base_dir: &Path,
    override_path: Option<&Path>,
) -> Result<PathBuf, SimulationError> {
    let configured = override_path
        .map(Path::to_path_buf)
        .or_else(|| output.path.clone());

    match output.format {
        OutputFormat::Json => {
            let path = configured.unwrap_or_else(|| base_dir.join("results.json"));
            std::fs::write(&path, result.to_json()?)?;
            info!(path = %path.display(), "result written");
            Ok(path)
        }
        OutputFormat::CsvPerComponent => {
            let dir = configured.unwrap_or_else(|| base_dir.join("results"));
            std::fs::create_dir_all(&dir)?;
            for component in &result.components {
                write_component_csv(result, component, &dir)?;
            }
            info!(path = %dir.display(), "result written");
            Ok(dir)
        }
    }
}

fn write_component_csv(
    result: &SimulationResult,
    component: &str,
    dir: &Path,
) -> Result<(), SimulationError> {
    let path = dir.join(format!("{}.csv", component));
    let mut writer = csv::Writer::from_path(&path)
        .map_err(|e| SimulationError::Serialization(format!("{}: {}", path.display(), e)))?;

    // Column set comes from the first snapshot; components emit a stable
    // key set every tick.
    let keys: Vec<String> = result
        .history
        .first()
        .and_then(|snap| snap.states.get(component))
        .map(|state| state.keys().cloned().collect())
        .unwrap_or_default();

    let mut header = vec!["time".to_string()];
    header.extend(keys.iter().cloned());
    writer
        .write_record(&header)
        .map_err(|e| SimulationError::Serialization(e.to_string()))?;

    for snap in &result.history {
        let Some(state) = snap.states.get(component) else {
            continue;
        };
        let mut row = vec![snap.time.to_string()];
        for key in &keys {
            row.push(state.get(key).copied().unwrap_or(f64::NAN).to_string());
        }
        writer
            .write_record(&row)
            .map_err(|e| SimulationError::Serialization(e.to_string()))?;
    }
    writer
        .flush()
        .map_err(|e| SimulationError::Serialization(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::State;
    use crate::orchestrator::TickSnapshot;
    use std::collections::BTreeMap;

    fn result() -> SimulationResult {
        let history = (0..3)
            .map(|tick| TickSnapshot {
                tick,
                time: tick as f64,
                states: BTreeMap::from([(
                    "res_1".to_string(),
                    State::from([
                        ("volume".to_string(), 100.0 - tick as f64),
                        ("water_level".to_string(), 10.0),
                    ]),
                )]),
            })
            .collect();
        SimulationResult {
            dt: 1.0,
            num_steps: 3,
            components: vec!["res_1".to_string()],
            history,
        }
    }

    #[test]
    fn test_json_sink_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_result(
            &result(),
            &OutputConfig {
                format: OutputFormat::Json,
                path: None,
            },
            dir.path(),
            None,
        )
        .unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"water_level\""));
    }

    #[test]
    fn test_csv_sink_writes_per_component_file() {
        let dir = tempfile::tempdir().unwrap();
        let out = write_result(
            &result(),
            &OutputConfig {
                format: OutputFormat::CsvPerComponent,
                path: None,
            },
            dir.path(),
            None,
        )
        .unwrap();
        let text = std::fs::read_to_string(out.join("res_1.csv")).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), "time,volume,water_level");
        assert!(lines.next().unwrap().starts_with("0,100"));
    }

    #[test]
    fn test_override_path_wins() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("custom.json");
        let path = write_result(
            &result(),
            &OutputConfig::default(),
            dir.path(),
            Some(&target),
        )
        .unwrap();
        assert_eq!(path, target);
        assert!(target.exists());
    }
}
