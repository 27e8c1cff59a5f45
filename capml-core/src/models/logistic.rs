//! Standardized L2 logistic regression with class-balanced weights.

use super::{sigmoid, validate_training, ModelError};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogisticParams {
    pub learning_rate: f64,
    pub max_iter: usize,
    pub l2: f64,
    /// Stop when the loss improves by less than this.
    pub tolerance: f64,
}

impl Default for LogisticParams {
    fn default() -> Self {
        Self {
            learning_rate: 0.5,
            max_iter: 500,
            l2: 1e-2,
            tolerance: 1e-8,
        }
    }
}

/// Per-feature z-scoring fitted on training rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standardizer {
    mean: Vec<f64>,
    scale: Vec<f64>,
}

impl Standardizer {
    pub fn fit(rows: &[Vec<f64>]) -> Self {
        let n = rows.len() as f64;
        let width = rows.first().map_or(0, Vec::len);
        let mean: Vec<f64> = (0..width)
            .map(|j| rows.iter().map(|r| r[j]).sum::<f64>() / n)
            .collect();
        let scale = (0..width)
            .map(|j| {
                let var = rows.iter().map(|r| (r[j] - mean[j]).powi(2)).sum::<f64>() / n;
                let sd = var.sqrt();
                // constant columns pass through centered
                if sd > 1e-12 {
                    sd
                } else {
                    1.0
                }
            })
            .collect();
        Self { mean, scale }
    }

    pub fn transform(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .zip(self.mean.iter().zip(&self.scale))
            .map(|(x, (m, s))| (x - m) / s)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticModel {
    standardizer: Standardizer,
    coef: Vec<f64>,
    intercept: f64,
}

/// Weights `n / (2·n_c)` per class; an absent class gets no weight.
pub fn class_balanced_weights(y: &[f64]) -> Vec<f64> {
    let n = y.len() as f64;
    let n_pos = y.iter().filter(|v| **v > 0.5).count() as f64;
    let n_neg = n - n_pos;
    y.iter()
        .map(|v| {
            let n_c = if *v > 0.5 { n_pos } else { n_neg };
            if n_c > 0.0 {
                n / (2.0 * n_c)
            } else {
                0.0
            }
        })
        .collect()
}

impl LogisticModel {
    /// Batch gradient descent on the weighted, L2-penalized log loss.
    /// `w` is multiplied by the class-balanced weights before fitting.
    pub fn fit(
        rows: &[Vec<f64>],
        y: &[f64],
        w: &[f64],
        params: &LogisticParams,
    ) -> Result<Self, ModelError> {
        let width = validate_training(rows, y, w)?;
        let standardizer = Standardizer::fit(rows);
        let x: Vec<Vec<f64>> = rows.iter().map(|r| standardizer.transform(r)).collect();
        let sw: Vec<f64> = class_balanced_weights(y)
            .iter()
            .zip(w)
            .map(|(c, d)| c * d)
            .collect();
        let total: f64 = sw.iter().sum();
        if total <= 0.0 {
            return Err(ModelError::InvalidData("sample weights sum to zero".into()));
        }

        let mut coef = vec![0.0; width];
        let mut intercept = 0.0;
        let mut prev_loss = f64::INFINITY;
        for iter in 0..params.max_iter {
            let mut grad = vec![0.0; width];
            let mut grad_b = 0.0;
            let mut loss = 0.0;
            for ((xi, yi), wi) in x.iter().zip(y).zip(&sw) {
                let z = intercept + dot(&coef, xi);
                let p = sigmoid(z);
                let err = wi * (p - yi);
                for (g, v) in grad.iter_mut().zip(xi) {
                    *g += err * v;
                }
                grad_b += err;
                let pc = p.clamp(1e-15, 1.0 - 1e-15);
                loss -= wi * (yi * pc.ln() + (1.0 - yi) * (1.0 - pc).ln());
            }
            loss = loss / total + 0.5 * params.l2 * coef.iter().map(|c| c * c).sum::<f64>();

            for (c, g) in coef.iter_mut().zip(&grad) {
                *c -= params.learning_rate * (g / total + params.l2 * *c);
            }
            intercept -= params.learning_rate * grad_b / total;

            if (prev_loss - loss).abs() < params.tolerance {
                debug!(iter, loss, "logistic converged");
                break;
            }
            prev_loss = loss;
        }

        Ok(Self {
            standardizer,
            coef,
            intercept,
        })
    }

    /// P(y = 1).
    pub fn predict_one(&self, row: &[f64]) -> f64 {
        sigmoid(self.intercept + dot(&self.coef, &self.standardizer.transform(row)))
    }

    pub fn n_features(&self) -> usize {
        self.coef.len()
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
