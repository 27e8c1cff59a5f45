//! Base learners and their serialized artifacts.
//!
//! Every learner exposes the same contract through [`ModelArtifact`]:
//! `predict_proba(rows) → [[1−p, p]; n]`, rejecting rows whose width differs
//! from the training width.

pub mod boosting;
pub mod logistic;
pub mod tree;

pub use boosting::{BoostParams, BoostedTrees};
pub use logistic::{class_balanced_weights, LogisticModel, LogisticParams, Standardizer};
pub use tree::{Node, RegressionTree, TreeParams};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("invalid training data: {0}")]
    InvalidData(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("dimension mismatch: expected {expected} features, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("serialization failed: {0}")]
    Serialization(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LearnerKind {
    Gbdt,
    Logistic,
    Xgb,
    Lgbm,
}

impl LearnerKind {
    pub const ALL: [LearnerKind; 4] = [
        LearnerKind::Gbdt,
        LearnerKind::Logistic,
        LearnerKind::Xgb,
        LearnerKind::Lgbm,
    ];

    pub fn name(self) -> &'static str {
        match self {
            LearnerKind::Gbdt => "gbdt",
            LearnerKind::Logistic => "logistic",
            LearnerKind::Xgb => "xgb",
            LearnerKind::Lgbm => "lgbm",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.name().eq_ignore_ascii_case(name.trim()))
    }
}

impl fmt::Display for LearnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LearnerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| format!("unknown learner '{s}'"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Predictor {
    Boosted(BoostedTrees),
    Logistic(LogisticModel),
}

/// A fitted learner with its input width.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub learner: LearnerKind,
    pub n_features: usize,
    pub predictor: Predictor,
}

impl ModelArtifact {
    /// Fit `kind` on rows with labels in {0, 1} and non-negative sample weights.
    pub fn fit(
        kind: LearnerKind,
        rows: &[Vec<f64>],
        y: &[f64],
        w: &[f64],
        seed: u64,
    ) -> Result<Self, ModelError> {
        let n_features = validate_training(rows, y, w)?;
        let predictor = match kind {
            LearnerKind::Gbdt => Predictor::Boosted(BoostedTrees::fit(rows, y, w, &BoostParams::gbdt(seed))?),
            LearnerKind::Xgb => Predictor::Boosted(BoostedTrees::fit(rows, y, w, &BoostParams::xgb(seed))?),
            LearnerKind::Lgbm => Predictor::Boosted(BoostedTrees::fit(rows, y, w, &BoostParams::lgbm(seed))?),
            LearnerKind::Logistic => {
                Predictor::Logistic(LogisticModel::fit(rows, y, w, &LogisticParams::default())?)
            }
        };
        Ok(Self {
            learner: kind,
            n_features,
            predictor,
        })
    }

    /// Class probabilities `[1−p, p]` per row.
    pub fn predict_proba(&self, rows: &[Vec<f64>]) -> Result<Vec<[f64; 2]>, ModelError> {
        Ok(self
            .predict_positive(rows)?
            .into_iter()
            .map(|p| [1.0 - p, p])
            .collect())
    }

    /// P(y = 1) per row.
    pub fn predict_positive(&self, rows: &[Vec<f64>]) -> Result<Vec<f64>, ModelError> {
        if let Some(bad) = rows.iter().find(|r| r.len() != self.n_features) {
            return Err(ModelError::DimensionMismatch {
                expected: self.n_features,
                got: bad.len(),
            });
        }
        Ok(rows
            .iter()
            .map(|r| match &self.predictor {
                Predictor::Boosted(m) => m.predict_one(r),
                Predictor::Logistic(m) => m.predict_one(r),
            })
            .collect())
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ModelError> {
        serde_json::to_vec(self).map_err(|e| ModelError::Serialization(e.to_string()))
    }

    /// Decode and check that the stored width covers every split feature.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ModelError> {
        let artifact: Self =
            serde_json::from_slice(bytes).map_err(|e| ModelError::Serialization(e.to_string()))?;
        let width_ok = match &artifact.predictor {
            Predictor::Boosted(m) => m.max_feature().map_or(true, |f| f < artifact.n_features),
            Predictor::Logistic(m) => m.n_features() == artifact.n_features,
        };
        if !width_ok {
            return Err(ModelError::Serialization(format!(
                "{} artifact inconsistent with n_features={}",
                artifact.learner, artifact.n_features
            )));
        }
        Ok(artifact)
    }
}

pub(crate) fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

/// Shape and value checks shared by every learner. Returns the row width.
pub(crate) fn validate_training(rows: &[Vec<f64>], y: &[f64], w: &[f64]) -> Result<usize, ModelError> {
    let Some(first) = rows.first() else {
        return Err(ModelError::InvalidData("no rows".into()));
    };
    let width = first.len();
    if width == 0 {
        return Err(ModelError::InvalidData("rows have no features".into()));
    }
    if y.len() != rows.len() || w.len() != rows.len() {
        return Err(ModelError::InvalidData(format!(
            "length mismatch: {} rows, {} labels, {} weights",
            rows.len(),
            y.len(),
            w.len()
        )));
    }
    if let Some(bad) = rows.iter().find(|r| r.len() != width) {
        return Err(ModelError::DimensionMismatch {
            expected: width,
            got: bad.len(),
        });
    }
    if rows.iter().flatten().any(|v| !v.is_finite()) {
        return Err(ModelError::InvalidData("non-finite feature value".into()));
    }
    if y.iter().any(|v| *v != 0.0 && *v != 1.0) {
        return Err(ModelError::InvalidData("labels must be 0 or 1".into()));
    }
    if w.iter().any(|v| !v.is_finite() || *v < 0.0) || w.iter().sum::<f64>() <= 0.0 {
        return Err(ModelError::InvalidData("weights must be non-negative with positive sum".into()));
    }
    Ok(width)
}
