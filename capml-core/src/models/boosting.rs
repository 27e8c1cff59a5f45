//! Logistic-loss gradient boosting over [`RegressionTree`]s.
//!
//! The three boosted learners differ only in their parameters: `gbdt` is
//! shallow and unregularized, `xgb` adds L2 and row subsampling, `lgbm`
//! uses histogram-binned deeper trees.

use super::tree::{RegressionTree, TreeParams};
use super::{sigmoid, validate_training, ModelError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoostParams {
    pub n_trees: usize,
    pub learning_rate: f64,
    /// Fraction of rows drawn per tree.
    pub subsample: f64,
    pub seed: u64,
    pub tree: TreeParams,
}

impl BoostParams {
    pub fn gbdt(seed: u64) -> Self {
        Self {
            n_trees: 100,
            learning_rate: 0.1,
            subsample: 1.0,
            seed,
            tree: TreeParams::default(),
        }
    }

    pub fn xgb(seed: u64) -> Self {
        Self {
            n_trees: 100,
            learning_rate: 0.1,
            subsample: 0.8,
            seed,
            tree: TreeParams {
                max_depth: 4,
                min_child_weight: 1e-2,
                lambda: 1.0,
                gamma: 0.0,
                max_bins: None,
            },
        }
    }

    pub fn lgbm(seed: u64) -> Self {
        Self {
            n_trees: 100,
            learning_rate: 0.05,
            subsample: 1.0,
            seed,
            tree: TreeParams {
                max_depth: 6,
                min_child_weight: 1e-2,
                lambda: 1e-1,
                gamma: 0.0,
                max_bins: Some(32),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoostedTrees {
    /// Initial log-odds.
    base_margin: f64,
    learning_rate: f64,
    trees: Vec<RegressionTree>,
}

impl BoostedTrees {
    pub fn fit(
        rows: &[Vec<f64>],
        y: &[f64],
        w: &[f64],
        params: &BoostParams,
    ) -> Result<Self, ModelError> {
        validate_training(rows, y, w)?;
        if !(params.subsample > 0.0 && params.subsample <= 1.0) {
            return Err(ModelError::InvalidParameter(format!(
                "subsample {} outside (0, 1]",
                params.subsample
            )));
        }

        let n = rows.len();
        let w_sum: f64 = w.iter().sum();
        let pos = y.iter().zip(w).map(|(yi, wi)| yi * wi).sum::<f64>() / w_sum;
        let pos = pos.clamp(1e-6, 1.0 - 1e-6);
        let base_margin = (pos / (1.0 - pos)).ln();

        let mut rng = StdRng::seed_from_u64(params.seed);
        let mut margin = vec![base_margin; n];
        let mut grad = vec![0.0; n];
        let mut hess = vec![0.0; n];
        let mut trees = Vec::with_capacity(params.n_trees);
        let all: Vec<usize> = (0..n).collect();

        for _ in 0..params.n_trees {
            for k in 0..n {
                let p = sigmoid(margin[k]);
                grad[k] = w[k] * (p - y[k]);
                hess[k] = w[k] * (p * (1.0 - p)).max(1e-12);
            }
            let sample: Vec<usize> = if params.subsample < 1.0 {
                let drawn: Vec<usize> = (0..n).filter(|_| rng.gen::<f64>() < params.subsample).collect();
                if drawn.is_empty() {
                    all.clone()
                } else {
                    drawn
                }
            } else {
                all.clone()
            };
            let tree = RegressionTree::fit(rows, &grad, &hess, &sample, &params.tree);
            for (k, row) in rows.iter().enumerate() {
                margin[k] += params.learning_rate * tree.predict(row);
            }
            trees.push(tree);
        }

        Ok(Self {
            base_margin,
            learning_rate: params.learning_rate,
            trees,
        })
    }

    pub fn margin(&self, row: &[f64]) -> f64 {
        self.base_margin
            + self.learning_rate * self.trees.iter().map(|t| t.predict(row)).sum::<f64>()
    }

    /// P(y = 1).
    pub fn predict_one(&self, row: &[f64]) -> f64 {
        sigmoid(self.margin(row))
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    pub(crate) fn max_feature(&self) -> Option<usize> {
        self.trees.iter().filter_map(RegressionTree::max_feature).max()
    }
}
