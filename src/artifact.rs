//! The persisted, versioned prediction artifact and its inference contract.
//!
//! An artifact is written once per training run and never modified; a new
//! run produces a new file. Its identity is the pair of format version and
//! BLAKE3 fingerprint over the canonical JSON of schema plus pipeline.

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::OutputPolicy;
use crate::error::{Result, SocError};
use crate::features::{FeatureInput, FeatureSchema};
use crate::forest::ForestParams;
use crate::model::FittedPipeline;

pub const ARTIFACT_FORMAT_VERSION: u32 = 1;

pub const SOC_MIN: f64 = 0.0;
pub const SOC_MAX: f64 = 100.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoldoutMetrics {
    pub rows: usize,
    pub mae: f64,
    pub rmse: f64,
    /// Held-out MAE of an ordinary least-squares fit on the same features.
    pub baseline_mae: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub name: String,
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    pub seed: u64,
    pub folds: usize,
    pub params: ForestParams,
    pub cv_mae: f64,
    pub cv_mae_std: f64,
    pub training_rows: usize,
    pub holdout: Option<HoldoutMetrics>,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionArtifact {
    pub metadata: ArtifactMetadata,
    pub schema: FeatureSchema,
    pub pipeline: FittedPipeline,
}

pub fn fingerprint(schema: &FeatureSchema, pipeline: &FittedPipeline) -> Result<String> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&serde_json::to_vec(schema)?);
    hasher.update(&serde_json::to_vec(pipeline)?);
    Ok(hex::encode(hasher.finalize().as_bytes()))
}

impl PredictionArtifact {
    /// Seal a fitted pipeline. `metadata.fingerprint` and `format_version` are overwritten.
    pub fn seal(mut metadata: ArtifactMetadata, schema: FeatureSchema, pipeline: FittedPipeline) -> Result<Self> {
        metadata.format_version = ARTIFACT_FORMAT_VERSION;
        metadata.fingerprint = fingerprint(&schema, &pipeline)?;
        Ok(Self {
            metadata,
            schema,
            pipeline,
        })
    }

    /// Short identity used in logs: `name@<first 12 hex digits of fingerprint>`.
    pub fn version(&self) -> String {
        let fp = &self.metadata.fingerprint;
        format!("{}@{}", self.metadata.name, &fp[..fp.len().min(12)])
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        tracing::info!(path = %path.display(), version = %self.version(), "artifact saved");
        Ok(())
    }

    /// Load and verify format version, schema support and fingerprint.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let artifact: PredictionArtifact = serde_json::from_str(&text)?;

        if artifact.metadata.format_version != ARTIFACT_FORMAT_VERSION {
            return Err(SocError::ArtifactVersion {
                found: artifact.metadata.format_version,
                expected: ARTIFACT_FORMAT_VERSION,
            });
        }
        artifact.schema.check_supported()?;

        let computed = fingerprint(&artifact.schema, &artifact.pipeline)?;
        if computed != artifact.metadata.fingerprint {
            return Err(SocError::Integrity {
                stored: artifact.metadata.fingerprint.clone(),
                computed,
            });
        }

        tracing::info!(path = %path.display(), version = %artifact.version(), "artifact loaded");
        Ok(artifact)
    }

    /// Regressor output for a typed input, without any range policy.
    pub fn predict_raw(&self, input: &FeatureInput) -> Result<f64> {
        for field in &self.schema.numeric {
            let value = input.numeric(&field.name).unwrap_or(f64::NAN);
            if !value.is_finite() {
                return Err(SocError::InvalidFeature {
                    field: field.name.clone(),
                    reason: "expected a finite number".into(),
                });
            }
        }
        Ok(self.pipeline.predict_one(input))
    }

    /// Predicted SoC with the out-of-range policy applied.
    pub fn predict(&self, input: &FeatureInput, policy: OutputPolicy) -> Result<f64> {
        let raw = self.predict_raw(input)?;
        apply_output_policy(raw, policy)
    }

    /// Schema-checked prediction from a loosely-typed record.
    pub fn predict_json(&self, record: &Map<String, Value>, policy: OutputPolicy) -> Result<f64> {
        let input = self.schema.parse_record(record)?;
        self.predict(&input, policy)
    }
}

pub fn apply_output_policy(raw: f64, policy: OutputPolicy) -> Result<f64> {
    if (SOC_MIN..=SOC_MAX).contains(&raw) {
        return Ok(raw);
    }
    match policy {
        OutputPolicy::Clamp => {
            tracing::warn!(raw, "predicted SoC outside [0, 100], clamping");
            Ok(raw.clamp(SOC_MIN, SOC_MAX))
        }
        OutputPolicy::Reject => Err(SocError::OutOfRange(raw)),
    }
}

static SHARED: OnceCell<(PathBuf, Arc<PredictionArtifact>)> = OnceCell::new();

/// Process-wide artifact, loaded from `path` on first use and reused afterwards.
///
/// Initialization runs at most once even under concurrent first calls. Later
/// calls return the cached instance whatever path they pass; a different path
/// is logged and ignored. A failed load leaves the cell empty so a later call
/// may retry.
pub fn shared(path: &Path) -> Result<Arc<PredictionArtifact>> {
    let (loaded_from, artifact) = SHARED.get_or_try_init(|| {
        PredictionArtifact::load(path).map(|a| (path.to_path_buf(), Arc::new(a)))
    })?;
    if loaded_from != path {
        tracing::warn!(
            requested = %path.display(),
            cached = %loaded_from.display(),
            "shared artifact already initialized from another path"
        );
    }
    Ok(Arc::clone(artifact))
}
