use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{Result, SocError};
use crate::features::{FeatureInput, FeatureSchema};

// columns with a smaller spread than this are treated as constant
const MIN_SCALE: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericStats {
    pub name: String,
    pub mean: f64,
    pub scale: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryVocabulary {
    pub name: String,
    /// Sorted labels seen at fit time; column order of the one-hot block.
    pub categories: Vec<String>,
}

/// Fitted column transformer: standardized numeric block followed by one-hot blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedTransform {
    pub numeric: Vec<NumericStats>,
    pub categorical: Vec<CategoryVocabulary>,
}

impl FittedTransform {
    /// Learn means, population standard deviations and vocabularies from `rows`.
    pub fn fit(schema: &FeatureSchema, rows: &[FeatureInput]) -> Result<Self> {
        if rows.is_empty() {
            return Err(SocError::DegenerateData("cannot fit preprocessing on zero rows".into()));
        }
        schema.check_supported()?;

        let n_num = schema.numeric.len();
        let mut values = Vec::with_capacity(rows.len() * n_num);
        for row in rows {
            for field in &schema.numeric {
                values.push(row.numeric(&field.name).unwrap_or(0.0));
            }
        }
        let matrix = Array2::from_shape_vec((rows.len(), n_num), values)
            .map_err(|e| SocError::Fit(e.to_string()))?;
        let means = matrix
            .mean_axis(Axis(0))
            .ok_or_else(|| SocError::DegenerateData("empty numeric block".into()))?;
        let stds = matrix.std_axis(Axis(0), 0.0);

        let numeric = schema
            .numeric
            .iter()
            .enumerate()
            .map(|(i, field)| NumericStats {
                name: field.name.clone(),
                mean: means[i],
                scale: if stds[i] > MIN_SCALE { stds[i] } else { 1.0 },
            })
            .collect();

        let categorical = schema
            .categorical
            .iter()
            .map(|field| {
                let seen: BTreeSet<&str> = rows
                    .iter()
                    .filter_map(|r| r.categorical(&field.name))
                    .collect();
                CategoryVocabulary {
                    name: field.name.clone(),
                    categories: seen.into_iter().map(str::to_string).collect(),
                }
            })
            .collect();

        Ok(FittedTransform { numeric, categorical })
    }

    /// Width of the encoded feature vector.
    pub fn width(&self) -> usize {
        self.numeric.len() + self.categorical.iter().map(|c| c.categories.len()).sum::<usize>()
    }

    /// Encode one row. Labels outside the fit-time vocabulary leave their block all zero.
    pub fn transform_row(&self, row: &FeatureInput) -> Array1<f64> {
        let mut out = Array1::zeros(self.width());
        for (i, stats) in self.numeric.iter().enumerate() {
            let raw = row.numeric(&stats.name).unwrap_or(stats.mean);
            out[i] = (raw - stats.mean) / stats.scale;
        }
        let mut offset = self.numeric.len();
        for vocab in &self.categorical {
            if let Some(label) = row.categorical(&vocab.name) {
                if let Ok(pos) = vocab.categories.binary_search_by(|c| c.as_str().cmp(label)) {
                    out[offset + pos] = 1.0;
                }
            }
            offset += vocab.categories.len();
        }
        out
    }

    /// Encode a batch. Each row is encoded independently of the others.
    pub fn transform(&self, rows: &[FeatureInput]) -> Array2<f64> {
        let mut out = Array2::zeros((rows.len(), self.width()));
        for (mut target, row) in out.axis_iter_mut(Axis(0)).zip(rows) {
            target.assign(&self.transform_row(row));
        }
        out
    }

    /// Encoded columns minus the first label of each one-hot block.
    pub fn reference_columns(&self) -> Vec<usize> {
        let mut columns: Vec<usize> = (0..self.numeric.len()).collect();
        let mut offset = self.numeric.len();
        for vocab in &self.categorical {
            columns.extend(offset + 1..offset + vocab.categories.len());
            offset += vocab.categories.len();
        }
        columns
    }

    /// True when every categorical feature saw exactly one label.
    pub fn is_categorically_degenerate(&self) -> bool {
        !self.categorical.is_empty() && self.categorical.iter().all(|c| c.categories.len() <= 1)
    }
}
