//! Training and serving settings loaded from TOML.
//!
//! ## Loading order
//!
//! 1. An explicit path (the CLI's `--config`)
//! 2. `SOC_RANGE_CONFIG` environment variable
//! 3. `soc_range.toml` in the current working directory
//! 4. Built-in defaults
//!
//! Fields left out of the file take their default value.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, SocError};
use crate::model::HyperparameterGrid;
use crate::range::WeatherPenalty;

pub const CONFIG_ENV: &str = "SOC_RANGE_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "soc_range.toml";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub folds: usize,
    pub seed: u64,
    /// Share of feature rows held out for the final report; 0 disables the holdout.
    pub test_fraction: f64,
    pub artifact_name: String,
    pub grid: HyperparameterGrid,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            folds: 5,
            seed: 42,
            test_fraction: 0.2,
            artifact_name: "ev_range_predictor_reduced".to_string(),
            grid: HyperparameterGrid::default(),
        }
    }
}

/// What to do with a regressor output outside `[0, 100]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputPolicy {
    #[default]
    Clamp,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServeConfig {
    pub battery_capacity_kwh: f64,
    pub weather_penalty: WeatherPenalty,
    pub output_policy: OutputPolicy,
    pub artifact_path: PathBuf,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            battery_capacity_kwh: 40.0,
            weather_penalty: WeatherPenalty::AllAdverse,
            output_policy: OutputPolicy::Clamp,
            artifact_path: PathBuf::from("models/ev_range_predictor_reduced.json"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub training: TrainingConfig,
    pub serve: ServeConfig,
}

impl Settings {
    /// Resolve the config file per the loading order and parse it.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let candidate = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .or_else(|| {
                let local = PathBuf::from(DEFAULT_CONFIG_FILE);
                local.exists().then_some(local)
            });

        match candidate {
            Some(path) => {
                tracing::info!(path = %path.display(), "loading settings");
                Self::from_file(&path)
            }
            None => {
                tracing::info!("no settings file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        let t = &self.training;
        if t.folds < 2 {
            return Err(SocError::Config(format!("training.folds must be at least 2, got {}", t.folds)));
        }
        if !(0.0..=0.5).contains(&t.test_fraction) {
            return Err(SocError::Config(format!(
                "training.test_fraction must be within [0, 0.5], got {}",
                t.test_fraction
            )));
        }
        if t.grid.is_empty() {
            return Err(SocError::Config("training.grid has an empty dimension".into()));
        }
        let capacity = self.serve.battery_capacity_kwh;
        if !(capacity.is_finite() && capacity > 0.0) {
            return Err(SocError::Config(format!(
                "serve.battery_capacity_kwh must be positive, got {capacity}"
            )));
        }
        Ok(())
    }
}
