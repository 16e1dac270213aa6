use linfa::prelude::*;
use linfa_linear::LinearRegression;
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Result, SocError};
use crate::features::{FeatureInput, FeatureSchema};
use crate::forest::{ForestParams, MaxFeatures, RandomForest};
use crate::preprocess::FittedTransform;

pub type FittedLinearRegression = linfa_linear::FittedLinearRegression<f64>;

/// Preprocessing and regressor bundled as the single deployable unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedPipeline {
    pub transform: FittedTransform,
    pub forest: RandomForest,
}

impl FittedPipeline {
    pub fn fit(schema: &FeatureSchema, rows: &[FeatureInput], labels: &Array1<f64>, params: &ForestParams, seed: u64) -> Result<Self> {
        let transform = FittedTransform::fit(schema, rows)?;
        let x = transform.transform(rows);
        let forest = RandomForest::fit(&x, labels, params, seed)?;
        Ok(FittedPipeline { transform, forest })
    }

    /// Raw regressor output; not clamped.
    pub fn predict_one(&self, row: &FeatureInput) -> f64 {
        self.forest.predict_row(self.transform.transform_row(row).view())
    }

    pub fn predict(&self, rows: &[FeatureInput]) -> Array1<f64> {
        self.forest.predict(&self.transform.transform(rows))
    }
}

pub fn mean_absolute_error(predicted: &Array1<f64>, actual: &Array1<f64>) -> f64 {
    (predicted - actual).mapv(f64::abs).mean().unwrap_or(f64::NAN)
}

pub fn root_mean_squared_error(predicted: &Array1<f64>, actual: &Array1<f64>) -> f64 {
    (predicted - actual).mapv(|d| d * d).mean().unwrap_or(f64::NAN).sqrt()
}

fn depth_list<'de, D>(deserializer: D) -> std::result::Result<Vec<Option<usize>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DepthEntry {
        Limit(usize),
        Keyword(String),
    }

    Vec::<DepthEntry>::deserialize(deserializer)?
        .into_iter()
        .map(|entry| match entry {
            DepthEntry::Limit(d) => Ok(Some(d)),
            DepthEntry::Keyword(k) if k.eq_ignore_ascii_case("none") => Ok(None),
            DepthEntry::Keyword(k) => Err(serde::de::Error::custom(format!(
                "max_depth entries must be integers or \"none\", got {k:?}"
            ))),
        })
        .collect()
}

/// Cartesian hyperparameter grid. Candidate order is the nesting order of the fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HyperparameterGrid {
    pub n_estimators: Vec<usize>,
    #[serde(deserialize_with = "depth_list")]
    pub max_depth: Vec<Option<usize>>,
    pub min_samples_split: Vec<usize>,
    pub min_samples_leaf: Vec<usize>,
    pub max_features: Vec<MaxFeatures>,
}

impl Default for HyperparameterGrid {
    fn default() -> Self {
        Self {
            n_estimators: vec![100, 200, 300],
            max_depth: vec![Some(5), Some(10), Some(15), None],
            min_samples_split: vec![2, 5, 10],
            min_samples_leaf: vec![1, 2, 4],
            max_features: vec![MaxFeatures::All, MaxFeatures::Sqrt, MaxFeatures::Log2],
        }
    }
}

impl HyperparameterGrid {
    pub fn is_empty(&self) -> bool {
        self.n_estimators.is_empty()
            || self.max_depth.is_empty()
            || self.min_samples_split.is_empty()
            || self.min_samples_leaf.is_empty()
            || self.max_features.is_empty()
    }

    pub fn candidates(&self) -> Vec<ForestParams> {
        let mut out = Vec::new();
        for &n_estimators in &self.n_estimators {
            for &max_depth in &self.max_depth {
                for &min_samples_split in &self.min_samples_split {
                    for &min_samples_leaf in &self.min_samples_leaf {
                        for &max_features in &self.max_features {
                            out.push(ForestParams {
                                n_estimators,
                                max_depth,
                                min_samples_split,
                                min_samples_leaf,
                                max_features,
                            });
                        }
                    }
                }
            }
        }
        out
    }
}

/// Cooperative cancellation flag, checked before each fold of each candidate.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Cross-validated score of one grid candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CvScore {
    pub params: ForestParams,
    pub fold_mae: Vec<f64>,
    pub mean_mae: f64,
    pub std_mae: f64,
}

impl CvScore {
    /// Negative mean absolute error; higher is better.
    pub fn score(&self) -> f64 {
        -self.mean_mae
    }
}

#[derive(Debug, Clone)]
pub struct SelectionOutcome {
    pub pipeline: FittedPipeline,
    pub best: CvScore,
    /// All candidates in grid order.
    pub scores: Vec<CvScore>,
}

impl SelectionOutcome {
    pub fn ranking(&self) -> Vec<&CvScore> {
        rank_scores(&self.scores)
    }
}

/// Candidates ordered best first; equal scores keep grid order.
pub fn rank_scores(scores: &[CvScore]) -> Vec<&CvScore> {
    let mut ranked: Vec<&CvScore> = scores.iter().collect();
    ranked.sort_by(|a, b| a.mean_mae.total_cmp(&b.mean_mae));
    ranked
}

struct FoldData {
    x_train: Array2<f64>,
    y_train: Array1<f64>,
    x_val: Array2<f64>,
    y_val: Array1<f64>,
}

/// Seeded shuffle into `k` folds whose sizes differ by at most one.
pub fn kfold_indices(n: usize, k: usize, seed: u64) -> Vec<Vec<usize>> {
    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(&mut StdRng::seed_from_u64(seed));
    let (base, extra) = (n / k, n % k);
    let mut folds = Vec::with_capacity(k);
    let mut start = 0;
    for fold in 0..k {
        let len = base + usize::from(fold < extra);
        folds.push(order[start..start + len].to_vec());
        start += len;
    }
    folds
}

/// K-fold grid search over forest hyperparameters, scored by negative MAE.
pub struct ModelSelector {
    pub folds: usize,
    pub seed: u64,
    pub grid: HyperparameterGrid,
    pub cancel: CancelToken,
}

impl ModelSelector {
    pub fn new(folds: usize, seed: u64, grid: HyperparameterGrid) -> Self {
        Self {
            folds,
            seed,
            grid,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn check_inputs(&self, schema: &FeatureSchema, rows: &[FeatureInput], labels: &[f64]) -> Result<()> {
        if self.folds < 2 {
            return Err(SocError::Config(format!("need at least 2 folds, got {}", self.folds)));
        }
        if self.grid.is_empty() {
            return Err(SocError::DegenerateData("hyperparameter grid has an empty dimension".into()));
        }
        if rows.len() != labels.len() {
            return Err(SocError::DegenerateData(format!(
                "{} feature rows but {} labels",
                rows.len(),
                labels.len()
            )));
        }
        if rows.len() < self.folds {
            return Err(SocError::DegenerateData(format!(
                "{} training rows is fewer than {} folds",
                rows.len(),
                self.folds
            )));
        }
        if FittedTransform::fit(schema, rows)?.is_categorically_degenerate() {
            return Err(SocError::DegenerateData(
                "every categorical feature has a single value".into(),
            ));
        }
        Ok(())
    }

    fn prepare_folds(&self, schema: &FeatureSchema, rows: &[FeatureInput], labels: &[f64]) -> Result<Vec<FoldData>> {
        let folds = kfold_indices(rows.len(), self.folds, self.seed);
        folds
            .iter()
            .enumerate()
            .map(|(held_out, val_idx)| {
                let train_idx: Vec<usize> = folds
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != held_out)
                    .flat_map(|(_, f)| f.iter().copied())
                    .collect();
                let pick = |idx: &[usize]| -> (Vec<FeatureInput>, Array1<f64>) {
                    (
                        idx.iter().map(|&i| rows[i].clone()).collect(),
                        idx.iter().map(|&i| labels[i]).collect(),
                    )
                };
                let (train_rows, y_train) = pick(&train_idx);
                let (val_rows, y_val) = pick(val_idx);
                // statistics come from the training part of the fold only
                let transform = FittedTransform::fit(schema, &train_rows)?;
                Ok(FoldData {
                    x_train: transform.transform(&train_rows),
                    y_train,
                    x_val: transform.transform(&val_rows),
                    y_val,
                })
            })
            .collect()
    }

    /// Search the grid, then refit the best candidate on all of `rows`.
    ///
    /// Ties in mean MAE go to the candidate that comes first in grid order.
    pub fn select(&self, schema: &FeatureSchema, rows: &[FeatureInput], labels: &[f64]) -> Result<SelectionOutcome> {
        self.check_inputs(schema, rows, labels)?;

        let candidates = self.grid.candidates();
        let folds = self.prepare_folds(schema, rows, labels)?;
        tracing::info!(
            candidates = candidates.len(),
            folds = self.folds,
            rows = rows.len(),
            "starting grid search"
        );

        let jobs: Vec<(usize, usize)> = (0..candidates.len())
            .flat_map(|c| (0..folds.len()).map(move |f| (c, f)))
            .collect();
        let maes: Vec<f64> = jobs
            .par_iter()
            .map(|&(c, f)| {
                if self.cancel.is_cancelled() {
                    return Err(SocError::Cancelled);
                }
                let fold = &folds[f];
                let forest = RandomForest::fit(&fold.x_train, &fold.y_train, &candidates[c], self.seed)?;
                Ok(mean_absolute_error(&forest.predict(&fold.x_val), &fold.y_val))
            })
            .collect::<Result<Vec<f64>>>()?;

        let scores: Vec<CvScore> = candidates
            .into_iter()
            .zip(maes.chunks(folds.len()))
            .map(|(params, fold_mae)| {
                let fold_mae = fold_mae.to_vec();
                let n = fold_mae.len() as f64;
                let mean_mae = fold_mae.iter().sum::<f64>() / n;
                let std_mae = (fold_mae.iter().map(|m| (m - mean_mae).powi(2)).sum::<f64>() / n).sqrt();
                tracing::debug!(%params, mean_mae, std_mae, "candidate scored");
                CvScore {
                    params,
                    fold_mae,
                    mean_mae,
                    std_mae,
                }
            })
            .collect();

        let mut best = &scores[0];
        for candidate in &scores[1..] {
            if candidate.score() > best.score() {
                best = candidate;
            }
        }
        let best = best.clone();
        tracing::info!(params = %best.params, mean_mae = best.mean_mae, "best candidate");

        if self.cancel.is_cancelled() {
            return Err(SocError::Cancelled);
        }
        let labels = Array1::from_vec(labels.to_vec());
        let pipeline = FittedPipeline::fit(schema, rows, &labels, &best.params, self.seed)?;

        Ok(SelectionOutcome {
            pipeline,
            best,
            scores,
        })
    }
}

/// Ordinary least squares on the preprocessed matrix, used as a reference
/// point for the forest's held-out error.
///
/// The intercept already spans each full one-hot block, so the first label of
/// every block is dropped (reference coding) to keep the normal equations regular.
pub struct LinearBaseline {
    pub columns: Vec<usize>,
    pub model: Option<FittedLinearRegression>,
}

impl LinearBaseline {
    pub fn fit(transform: &FittedTransform, rows: &[FeatureInput], y: &Array1<f64>) -> Self {
        let columns = transform.reference_columns();
        let x = transform.transform(rows).select(Axis(1), &columns);
        let ds = Dataset::new(x, y.clone());
        let model = match LinearRegression::new().fit(&ds) {
            Ok(model) => Some(model),
            Err(err) => {
                tracing::warn!(%err, "linear baseline could not be fitted");
                None
            }
        };
        Self { columns, model }
    }

    pub fn predict(&self, transform: &FittedTransform, rows: &[FeatureInput]) -> Option<Array1<f64>> {
        let x = transform.transform(rows).select(Axis(1), &self.columns);
        self.model.as_ref().map(|m| m.predict(&x))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic(n: usize) -> (Vec<FeatureInput>, Vec<f64>) {
        let terrains = ["Flat", "Hilly"];
        let weathers = ["Normal", "Hot", "Cold", "Rainy"];
        let rows: Vec<FeatureInput> = (0..n)
            .map(|i| FeatureInput {
                speed: 20.0 + (i * 7 % 100) as f64,
                acceleration: (i % 5) as f64,
                braking: (i % 4) as f64 * 0.8,
                terrain: terrains[i % 2].into(),
                weather: weathers[i % 4].into(),
                prev_soc: 100.0 - (i % 50) as f64,
            })
            .collect();
        let labels = rows
            .iter()
            .map(|r| r.prev_soc - 0.01 * r.speed - if r.terrain == "Hilly" { 0.5 } else { 0.0 })
            .collect();
        (rows, labels)
    }

    fn small_grid() -> HyperparameterGrid {
        HyperparameterGrid {
            n_estimators: vec![5],
            max_depth: vec![Some(2), None],
            min_samples_split: vec![2],
            min_samples_leaf: vec![1, 3],
            max_features: vec![MaxFeatures::All],
        }
    }

    #[test]
    fn folds_partition_all_rows() {
        let folds = kfold_indices(23, 5, 42);
        let sizes: Vec<usize> = folds.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![5, 5, 5, 4, 4]);
        let mut all: Vec<usize> = folds.concat();
        all.sort_unstable();
        assert_eq!(all, (0..23).collect::<Vec<_>>());
        assert_eq!(folds, kfold_indices(23, 5, 42));
    }

    #[test]
    fn grid_candidates_follow_nesting_order() {
        let grid = small_grid();
        let c = grid.candidates();
        assert_eq!(c.len(), 4);
        assert_eq!((c[0].max_depth, c[0].min_samples_leaf), (Some(2), 1));
        assert_eq!((c[1].max_depth, c[1].min_samples_leaf), (Some(2), 3));
        assert_eq!((c[2].max_depth, c[2].min_samples_leaf), (None, 1));
        assert_eq!(HyperparameterGrid::default().candidates().len(), 324);
    }

    #[test]
    fn selection_is_reproducible() {
        let schema = FeatureSchema::current();
        let (rows, labels) = synthetic(60);
        let selector = ModelSelector::new(5, 42, small_grid());
        let a = selector.select(&schema, &rows, &labels).unwrap();
        let b = selector.select(&schema, &rows, &labels).unwrap();

        assert_eq!(a.best, b.best);
        assert_eq!(a.scores, b.scores);
        let sample_input = rows[7].clone();
        assert_eq!(a.pipeline.predict_one(&sample_input).to_bits(), b.pipeline.predict_one(&sample_input).to_bits());
        assert_eq!(a.scores.len(), 4);
        assert!(a.scores.iter().all(|s| s.fold_mae.len() == 5));
    }

    #[test]
    fn best_candidate_has_lowest_mae_first_in_grid_on_ties() {
        let schema = FeatureSchema::current();
        let (rows, labels) = synthetic(40);
        let mut grid = small_grid();
        // identical candidates: the first one must win
        grid.min_samples_leaf = vec![2, 2];
        let outcome = ModelSelector::new(4, 1, grid).select(&schema, &rows, &labels).unwrap();
        let min = outcome.scores.iter().map(|s| s.mean_mae).fold(f64::INFINITY, f64::min);
        assert_eq!(outcome.best.mean_mae, min);
        let first_min = outcome.scores.iter().find(|s| s.mean_mae == min).unwrap();
        assert_eq!(&outcome.best, first_min);
        assert_eq!(outcome.ranking()[0].mean_mae, min);
    }

    #[test]
    fn degenerate_inputs_fail_before_search() {
        let schema = FeatureSchema::current();
        let (rows, labels) = synthetic(4);
        let err = ModelSelector::new(5, 42, small_grid())
            .select(&schema, &rows, &labels)
            .unwrap_err();
        assert!(matches!(err, SocError::DegenerateData(_)));

        let (mut rows, labels) = synthetic(20);
        for row in &mut rows {
            row.terrain = "Flat".into();
            row.weather = "Normal".into();
        }
        let err = ModelSelector::new(5, 42, small_grid())
            .select(&schema, &rows, &labels)
            .unwrap_err();
        assert!(matches!(err, SocError::DegenerateData(_)));

        let (rows, labels) = synthetic(20);
        let mut grid = small_grid();
        grid.max_features.clear();
        let err = ModelSelector::new(5, 42, grid).select(&schema, &rows, &labels).unwrap_err();
        assert!(matches!(err, SocError::DegenerateData(_)));
    }

    #[test]
    fn cancelled_search_stops() {
        let schema = FeatureSchema::current();
        let (rows, labels) = synthetic(30);
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = ModelSelector::new(3, 42, small_grid())
            .with_cancel(cancel)
            .select(&schema, &rows, &labels)
            .unwrap_err();
        assert!(matches!(err, SocError::Cancelled));
    }

    #[test]
    fn grid_reads_none_depth_from_toml() {
        let grid: HyperparameterGrid = toml::from_str(
            r#"
            n_estimators = [10]
            max_depth = [4, "none"]
            "#,
        )
        .unwrap();
        assert_eq!(grid.max_depth, vec![Some(4), None]);
        assert_eq!(grid.min_samples_leaf, vec![1, 2, 4]);
    }

    #[test]
    fn linear_baseline_recovers_linear_target() {
        use rand::Rng;
        let terrains = ["Flat", "Hilly"];
        let weathers = ["Normal", "Hot", "Cold", "Rainy"];
        let mut rng = StdRng::seed_from_u64(9);
        let rows: Vec<FeatureInput> = (0..80)
            .map(|_| FeatureInput {
                speed: rng.gen_range(10.0..130.0),
                acceleration: rng.gen_range(0.0..5.0),
                braking: rng.gen_range(0.0..5.0),
                terrain: terrains[rng.gen_range(0..2)].into(),
                weather: weathers[rng.gen_range(0..4)].into(),
                prev_soc: rng.gen_range(20.0..100.0),
            })
            .collect();
        // no weather effect at all
        let y: Array1<f64> = rows
            .iter()
            .map(|r| r.prev_soc - 0.01 * r.speed - if r.terrain == "Hilly" { 0.5 } else { 0.0 })
            .collect();

        let transform = FittedTransform::fit(&FeatureSchema::current(), &rows).unwrap();
        assert_eq!(transform.reference_columns().len(), transform.width() - 2);
        let baseline = LinearBaseline::fit(&transform, &rows, &y);
        assert!(baseline.model.is_some());
        let predicted = baseline.predict(&transform, &rows).unwrap();
        assert!(mean_absolute_error(&predicted, &y) < 1e-6);
    }

    #[test]
    fn metrics() {
        let p = Array1::from_vec(vec![1.0, 2.0, 3.0]);
        let a = Array1::from_vec(vec![2.0, 2.0, 5.0]);
        assert!((mean_absolute_error(&p, &a) - 1.0).abs() < 1e-12);
        assert!((root_mean_squared_error(&p, &a) - (5.0f64 / 3.0).sqrt()).abs() < 1e-12);
    }
}
