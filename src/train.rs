use chrono::Utc;
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::Path;

use crate::artifact::{ArtifactMetadata, HoldoutMetrics, PredictionArtifact};
use crate::config::TrainingConfig;
use crate::data::{LoadReport, TelemetryLoader, TelemetryRecord};
use crate::error::{Result, SocError};
use crate::features::{build_feature_rows, FeatureInput, FeatureSchema};
use crate::model::{
    mean_absolute_error, rank_scores, root_mean_squared_error, CancelToken, CvScore, FittedPipeline, LinearBaseline,
    ModelSelector,
};

pub struct TrainingOutcome {
    pub artifact: PredictionArtifact,
    pub load_report: LoadReport,
    pub feature_rows: usize,
    /// Every grid candidate, in grid order.
    pub scores: Vec<CvScore>,
}

impl TrainingOutcome {
    /// Candidates ordered by mean fold MAE, best first.
    pub fn ranking(&self) -> Vec<&CvScore> {
        rank_scores(&self.scores)
    }
}

/// Seeded train/test split; the test part holds `ceil(n * test_fraction)` rows.
pub fn holdout_split(n: usize, test_fraction: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut order: Vec<usize> = (0..n).collect();
    if test_fraction <= 0.0 {
        return (order, Vec::new());
    }
    order.shuffle(&mut StdRng::seed_from_u64(seed));
    let n_test = ((n as f64) * test_fraction).ceil() as usize;
    let n_test = n_test.min(n.saturating_sub(1));
    let train = order.split_off(n_test);
    (train, order)
}

pub fn train_from_csv(path: &Path, config: &TrainingConfig, cancel: CancelToken) -> Result<TrainingOutcome> {
    tracing::info!(path = %path.display(), "loading training telemetry");
    let loader = TelemetryLoader::from_path(path)?;
    train_from_records(&loader.records, loader.report, config, cancel)
}

pub fn train_from_records(
    records: &[TelemetryRecord],
    load_report: LoadReport,
    config: &TrainingConfig,
    cancel: CancelToken,
) -> Result<TrainingOutcome> {
    let rows = build_feature_rows(records);
    if rows.is_empty() {
        return Err(SocError::DegenerateData(
            "no vehicle has two or more usable records".into(),
        ));
    }
    tracing::info!(records = records.len(), feature_rows = rows.len(), "lag features built");

    let schema = FeatureSchema::current();
    let (train_idx, test_idx) = holdout_split(rows.len(), config.test_fraction, config.seed);
    let split = |idx: &[usize]| -> (Vec<FeatureInput>, Vec<f64>) {
        (
            idx.iter().map(|&i| rows[i].input()).collect(),
            idx.iter().map(|&i| rows[i].soc).collect(),
        )
    };
    let (train_rows, train_labels) = split(&train_idx);

    let selector = ModelSelector::new(config.folds, config.seed, config.grid.clone()).with_cancel(cancel);
    let outcome = selector.select(&schema, &train_rows, &train_labels)?;

    let holdout = if test_idx.is_empty() {
        None
    } else {
        let (test_rows, test_labels) = split(&test_idx);
        Some(evaluate_holdout(&outcome.pipeline, &train_rows, &train_labels, &test_rows, &test_labels))
    };
    if let Some(h) = &holdout {
        tracing::info!(rows = h.rows, mae = h.mae, rmse = h.rmse, baseline_mae = ?h.baseline_mae, "holdout evaluation");
    }

    let metadata = ArtifactMetadata {
        name: config.artifact_name.clone(),
        format_version: 0,
        created_at: Utc::now(),
        seed: config.seed,
        folds: config.folds,
        params: outcome.best.params.clone(),
        cv_mae: outcome.best.mean_mae,
        cv_mae_std: outcome.best.std_mae,
        training_rows: train_rows.len(),
        holdout,
        fingerprint: String::new(),
    };
    let artifact = PredictionArtifact::seal(metadata, schema, outcome.pipeline)?;
    tracing::info!(version = %artifact.version(), "training complete");

    Ok(TrainingOutcome {
        artifact,
        load_report,
        feature_rows: rows.len(),
        scores: outcome.scores,
    })
}

fn evaluate_holdout(
    pipeline: &FittedPipeline,
    train_rows: &[FeatureInput],
    train_labels: &[f64],
    test_rows: &[FeatureInput],
    test_labels: &[f64],
) -> HoldoutMetrics {
    let actual = Array1::from_vec(test_labels.to_vec());
    let predicted = pipeline.predict(test_rows);

    let baseline = LinearBaseline::fit(&pipeline.transform, train_rows, &Array1::from_vec(train_labels.to_vec()));
    let baseline_mae = baseline
        .predict(&pipeline.transform, test_rows)
        .map(|p| mean_absolute_error(&p, &actual));

    HoldoutMetrics {
        rows: test_rows.len(),
        mae: mean_absolute_error(&predicted, &actual),
        rmse: root_mean_squared_error(&predicted, &actual),
        baseline_mae,
    }
}
