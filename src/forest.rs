//! Seeded random-forest regressor.
//!
//! Each tree is an exact-greedy CART regression tree grown on a bootstrap
//! sample, choosing splits by squared-error reduction over a random subset
//! of features. Every source of randomness derives from one `u64` seed, so
//! equal data, parameters and seed give bit-identical forests.

use ndarray::{Array1, Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::error::{Result, SocError};

// minimum squared-error reduction for a split to be kept
const MIN_GAIN: f64 = 1e-12;

/// How many features each split may consider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaxFeatures {
    All,
    Sqrt,
    Log2,
}

impl MaxFeatures {
    pub fn resolve(self, n_features: usize) -> usize {
        let k = match self {
            MaxFeatures::All => n_features,
            MaxFeatures::Sqrt => (n_features as f64).sqrt().floor() as usize,
            MaxFeatures::Log2 => (n_features as f64).log2().floor() as usize,
        };
        k.clamp(1, n_features.max(1))
    }
}

impl fmt::Display for MaxFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaxFeatures::All => write!(f, "all"),
            MaxFeatures::Sqrt => write!(f, "sqrt"),
            MaxFeatures::Log2 => write!(f, "log2"),
        }
    }
}

/// One point of the hyperparameter grid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForestParams {
    pub n_estimators: usize,
    /// `None` grows until leaves are pure or too small to split.
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    pub max_features: MaxFeatures,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_depth: None,
            min_samples_split: 2,
            min_samples_leaf: 1,
            max_features: MaxFeatures::All,
        }
    }
}

impl fmt::Display for ForestParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let depth = self
            .max_depth
            .map_or_else(|| "none".to_string(), |d| d.to_string());
        write!(
            f,
            "trees={} depth={} split={} leaf={} features={}",
            self.n_estimators, depth, self.min_samples_split, self.min_samples_leaf, self.max_features
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: u32,
        right: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    pub nodes: Vec<Node>,
}

impl Tree {
    pub fn predict(&self, x: ArrayView1<f64>) -> f64 {
        let mut idx = 0usize;
        loop {
            match &self.nodes[idx] {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    idx = if x[*feature] <= *threshold {
                        *left as usize
                    } else {
                        *right as usize
                    };
                }
            }
        }
    }

    pub fn leaf_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n, Node::Leaf { .. }))
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    pub params: ForestParams,
    pub seed: u64,
    pub n_features: usize,
    pub trees: Vec<Tree>,
}

fn tree_seed(seed: u64, tree_idx: usize) -> u64 {
    seed ^ (tree_idx as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

impl RandomForest {
    /// Fit `params.n_estimators` trees in parallel. Tree `i` only sees its own seeded RNG.
    pub fn fit(x: &Array2<f64>, y: &Array1<f64>, params: &ForestParams, seed: u64) -> Result<Self> {
        let (n_rows, n_features) = x.dim();
        if n_rows == 0 || n_rows != y.len() {
            return Err(SocError::Fit(format!(
                "feature matrix has {} rows, target has {}",
                n_rows,
                y.len()
            )));
        }
        if params.n_estimators == 0 || params.min_samples_leaf == 0 || params.min_samples_split < 2 {
            return Err(SocError::Config(format!("invalid forest parameters: {params}")));
        }

        let trees = (0..params.n_estimators)
            .into_par_iter()
            .map(|tree_idx| {
                let mut rng = StdRng::seed_from_u64(tree_seed(seed, tree_idx));
                let sample: Vec<usize> = (0..n_rows).map(|_| rng.gen_range(0..n_rows)).collect();
                TreeBuilder {
                    x,
                    y,
                    params,
                    max_features: params.max_features.resolve(n_features),
                    rng,
                }
                .build(sample)
            })
            .collect();

        Ok(RandomForest {
            params: params.clone(),
            seed,
            n_features,
            trees,
        })
    }

    pub fn predict_row(&self, x: ArrayView1<f64>) -> f64 {
        let total: f64 = self.trees.iter().map(|t| t.predict(x)).sum();
        total / self.trees.len() as f64
    }

    pub fn predict(&self, x: &Array2<f64>) -> Array1<f64> {
        x.outer_iter().map(|row| self.predict_row(row)).collect()
    }
}

struct SplitCandidate {
    feature: usize,
    threshold: f64,
    score: f64,
}

struct TreeBuilder<'a> {
    x: &'a Array2<f64>,
    y: &'a Array1<f64>,
    params: &'a ForestParams,
    max_features: usize,
    rng: StdRng,
}

impl TreeBuilder<'_> {
    fn build(mut self, sample: Vec<usize>) -> Tree {
        let mut nodes = Vec::new();
        self.build_node(sample, 0, &mut nodes);
        Tree { nodes }
    }

    fn build_node(&mut self, indices: Vec<usize>, depth: usize, nodes: &mut Vec<Node>) -> u32 {
        let current = nodes.len() as u32;
        let n = indices.len();
        let sum: f64 = indices.iter().map(|&i| self.y[i]).sum();
        let leaf = Node::Leaf { value: sum / n as f64 };

        let depth_reached = self.params.max_depth.is_some_and(|d| depth >= d);
        if depth_reached
            || n < self.params.min_samples_split
            || n < 2 * self.params.min_samples_leaf
            || self.is_pure(&indices)
        {
            nodes.push(leaf);
            return current;
        }

        let Some(split) = self.find_best_split(&indices, sum) else {
            nodes.push(leaf);
            return current;
        };

        let (left, right): (Vec<usize>, Vec<usize>) = indices
            .into_iter()
            .partition(|&i| self.x[[i, split.feature]] <= split.threshold);

        // reserve the slot, children are appended after it
        nodes.push(Node::Split {
            feature: split.feature,
            threshold: split.threshold,
            left: 0,
            right: 0,
        });
        let left_idx = self.build_node(left, depth + 1, nodes);
        let right_idx = self.build_node(right, depth + 1, nodes);
        if let Node::Split { left, right, .. } = &mut nodes[current as usize] {
            *left = left_idx;
            *right = right_idx;
        }
        current
    }

    fn is_pure(&self, indices: &[usize]) -> bool {
        let first = self.y[indices[0]];
        indices.iter().all(|&i| self.y[i] == first)
    }

    fn candidate_features(&mut self) -> Vec<usize> {
        let n_features = self.x.ncols();
        let mut features = if self.max_features >= n_features {
            (0..n_features).collect()
        } else {
            rand::seq::index::sample(&mut self.rng, n_features, self.max_features).into_vec()
        };
        // ties between equally good splits go to the lowest feature index
        features.sort_unstable();
        features
    }

    /// Exact-greedy search maximizing `S_l²/n_l + S_r²/n_r`, the squared-error reduction.
    fn find_best_split(&mut self, indices: &[usize], total: f64) -> Option<SplitCandidate> {
        let n = indices.len();
        let min_leaf = self.params.min_samples_leaf;
        let parent_score = total * total / n as f64;
        let mut best: Option<SplitCandidate> = None;

        for feature in self.candidate_features() {
            let mut column: Vec<(f64, f64)> = indices
                .iter()
                .map(|&i| (self.x[[i, feature]], self.y[i]))
                .collect();
            column.sort_by(|a, b| a.0.total_cmp(&b.0));

            let mut left_sum = 0.0;
            for pos in 0..n - 1 {
                left_sum += column[pos].1;
                let n_left = pos + 1;
                let n_right = n - n_left;
                if n_left < min_leaf || n_right < min_leaf {
                    continue;
                }
                if column[pos].0 == column[pos + 1].0 {
                    continue;
                }
                let right_sum = total - left_sum;
                let score = left_sum * left_sum / n_left as f64 + right_sum * right_sum / n_right as f64;
                if score - parent_score <= MIN_GAIN {
                    continue;
                }
                let better = match &best {
                    None => true,
                    Some(current) => score.partial_cmp(&current.score) == Some(Ordering::Greater),
                };
                if better {
                    best = Some(SplitCandidate {
                        feature,
                        threshold: (column[pos].0 + column[pos + 1].0) / 2.0,
                        score,
                    });
                }
            }
        }

        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn step_data() -> (Array2<f64>, Array1<f64>) {
        let n = 40;
        let x = Array2::from_shape_fn((n, 2), |(i, j)| if j == 0 { i as f64 } else { (i % 3) as f64 });
        let y = Array1::from_shape_fn(n, |i| if i < 20 { 10.0 } else { 50.0 });
        (x, y)
    }

    #[test]
    fn forest_learns_a_step() {
        let (x, y) = step_data();
        let params = ForestParams {
            n_estimators: 10,
            ..ForestParams::default()
        };
        let forest = RandomForest::fit(&x, &y, &params, 7).unwrap();
        let low = forest.predict_row(array![2.0, 2.0].view());
        let high = forest.predict_row(array![35.0, 2.0].view());
        assert!((low - 10.0).abs() < 5.0, "low side predicted {low}");
        assert!((high - 50.0).abs() < 5.0, "high side predicted {high}");
    }

    #[test]
    fn same_seed_same_forest() {
        let (x, y) = step_data();
        let params = ForestParams {
            n_estimators: 8,
            max_depth: Some(3),
            max_features: MaxFeatures::Sqrt,
            ..ForestParams::default()
        };
        let a = RandomForest::fit(&x, &y, &params, 42).unwrap();
        let b = RandomForest::fit(&x, &y, &params, 42).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.predict(&x), b.predict(&x));
    }

    #[test]
    fn depth_limit_bounds_leaves() {
        let (x, y) = step_data();
        let params = ForestParams {
            n_estimators: 3,
            max_depth: Some(1),
            ..ForestParams::default()
        };
        let forest = RandomForest::fit(&x, &y, &params, 1).unwrap();
        assert!(forest.trees.iter().all(|t| t.leaf_count() <= 2));
    }

    #[test]
    fn min_samples_leaf_larger_than_data_gives_stump() {
        let (x, y) = step_data();
        let params = ForestParams {
            n_estimators: 2,
            min_samples_leaf: 30,
            ..ForestParams::default()
        };
        let forest = RandomForest::fit(&x, &y, &params, 1).unwrap();
        assert!(forest.trees.iter().all(|t| t.nodes.len() == 1));
    }

    #[test]
    fn rejects_mismatched_shapes_and_bad_params() {
        let (x, _) = step_data();
        let y = Array1::zeros(3);
        assert!(RandomForest::fit(&x, &y, &ForestParams::default(), 0).is_err());

        let (x, y) = step_data();
        let params = ForestParams {
            n_estimators: 0,
            ..ForestParams::default()
        };
        assert!(matches!(RandomForest::fit(&x, &y, &params, 0), Err(SocError::Config(_))));
    }

    #[test]
    fn max_features_resolution() {
        assert_eq!(MaxFeatures::All.resolve(10), 10);
        assert_eq!(MaxFeatures::Sqrt.resolve(10), 3);
        assert_eq!(MaxFeatures::Log2.resolve(10), 3);
        assert_eq!(MaxFeatures::Log2.resolve(1), 1);
    }
}
