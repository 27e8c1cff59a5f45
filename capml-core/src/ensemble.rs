//! Ensemble Optimizer: convex weights over base learners plus a decision
//! threshold, chosen to maximize a purged profit-factor proxy on
//! out-of-fold predictions.
//!
//! `PF(θ, τ) = Σ TP / (Σ FP + 1)` where a sample counts when the blended
//! probability `Σ θ_m p_m ≥ τ`. Folds whose test labels are single-class
//! contribute no terms.

use crate::models::LearnerKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{debug, info};

pub const TAU_MIN: f64 = 0.50;
pub const TAU_MAX: f64 = 0.80;
pub const FALLBACK_TAU: f64 = 0.60;
const TAU_STEP: f64 = 0.01;

// ─── Inputs ──────────────────────────────────────────────────────────

/// Out-of-fold probabilities per learner, aligned with labels and fold ids.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OofSet {
    pub y: Vec<u8>,
    pub fold: Vec<usize>,
    pub probs: BTreeMap<LearnerKind, Vec<f64>>,
}

impl OofSet {
    pub fn len(&self) -> usize {
        self.y.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }

    pub fn learners(&self) -> Vec<LearnerKind> {
        self.probs.keys().copied().collect()
    }

    /// Per-sample mask: true when the sample's fold has both classes.
    pub fn scoring_mask(&self) -> Vec<bool> {
        let mut classes: BTreeMap<usize, (bool, bool)> = BTreeMap::new();
        for (&f, &y) in self.fold.iter().zip(&self.y) {
            let e = classes.entry(f).or_default();
            if y == 1 {
                e.1 = true;
            } else {
                e.0 = true;
            }
        }
        self.fold
            .iter()
            .map(|f| classes.get(f).is_some_and(|(neg, pos)| *neg && *pos))
            .collect()
    }

    /// Blended probabilities under `weights`.
    pub fn blend(&self, weights: &BTreeMap<LearnerKind, f64>) -> Vec<f64> {
        let mut out = vec![0.0; self.len()];
        for (kind, w) in weights {
            if let Some(p) = self.probs.get(kind) {
                for (o, v) in out.iter_mut().zip(p) {
                    *o += w * v;
                }
            }
        }
        out
    }

    fn validate(&self) -> Result<(), EnsembleError> {
        if self.probs.is_empty() {
            return Err(EnsembleError::NoLearners);
        }
        if self.is_empty() {
            return Err(EnsembleError::Empty);
        }
        if self.fold.len() != self.len() {
            return Err(EnsembleError::LengthMismatch {
                learner: "fold".into(),
                got: self.fold.len(),
                expected: self.len(),
            });
        }
        for (kind, p) in &self.probs {
            if p.len() != self.len() {
                return Err(EnsembleError::LengthMismatch {
                    learner: kind.to_string(),
                    got: p.len(),
                    expected: self.len(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnsembleParams {
    pub trials: usize,
    pub seed: u64,
}

impl Default for EnsembleParams {
    fn default() -> Self {
        Self { trials: 60, seed: 42 }
    }
}

// ─── Outputs ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PfComponents {
    pub tp: usize,
    pub fp: usize,
    pub pf: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMethod {
    Tpe,
    EqualWeights,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleResult {
    pub weights: BTreeMap<LearnerKind, f64>,
    pub threshold: f64,
    pub score: PfComponents,
    /// Each learner alone at the chosen threshold.
    pub per_model: BTreeMap<LearnerKind, PfComponents>,
    pub method: SearchMethod,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnsembleError {
    #[error("no learner predictions")]
    NoLearners,
    #[error("no out-of-fold samples")]
    Empty,
    #[error("{learner}: {got} values, expected {expected}")]
    LengthMismatch {
        learner: String,
        got: usize,
        expected: usize,
    },
}

// ─── Scoring ─────────────────────────────────────────────────────────

/// PF proxy for blended probabilities `p` at threshold `tau`.
pub fn pf_proxy(p: &[f64], y: &[u8], mask: &[bool], tau: f64) -> PfComponents {
    let mut tp = 0;
    let mut fp = 0;
    for ((&pi, &yi), &m) in p.iter().zip(y).zip(mask) {
        if m && pi >= tau {
            if yi == 1 {
                tp += 1;
            } else {
                fp += 1;
            }
        }
    }
    PfComponents {
        tp,
        fp,
        pf: tp as f64 / (fp as f64 + 1.0),
    }
}

/// Scale to unit sum; an all-zero (or non-finite) vector becomes uniform.
pub fn normalize_weights(raw: &BTreeMap<LearnerKind, f64>) -> BTreeMap<LearnerKind, f64> {
    let clean: BTreeMap<LearnerKind, f64> = raw
        .iter()
        .map(|(k, w)| (*k, if w.is_finite() { w.max(0.0) } else { 0.0 }))
        .collect();
    let total: f64 = clean.values().sum();
    if total > 0.0 {
        clean.into_iter().map(|(k, w)| (k, w / total)).collect()
    } else {
        equal_weights(raw.keys().copied())
    }
}

pub fn equal_weights(kinds: impl IntoIterator<Item = LearnerKind>) -> BTreeMap<LearnerKind, f64> {
    let kinds: BTreeSet<LearnerKind> = kinds.into_iter().collect();
    let w = 1.0 / kinds.len().max(1) as f64;
    kinds.into_iter().map(|k| (k, w)).collect()
}

/// Weighted blend over the learners present in `probs`, renormalizing the
/// weights over that subset. `None` when no weighted learner is present.
pub fn blend_available(
    weights: &BTreeMap<LearnerKind, f64>,
    probs: &BTreeMap<LearnerKind, f64>,
) -> Option<f64> {
    let present: Vec<(f64, f64)> = weights
        .iter()
        .filter_map(|(k, w)| probs.get(k).map(|p| (*w, *p)))
        .collect();
    if present.is_empty() {
        return None;
    }
    let total: f64 = present.iter().map(|(w, _)| w).sum();
    if total > 0.0 {
        Some(present.iter().map(|(w, p)| w * p).sum::<f64>() / total)
    } else {
        Some(present.iter().map(|(_, p)| p).sum::<f64>() / present.len() as f64)
    }
}

/// First threshold on the 0.01 grid over `[TAU_MIN, TAU_MAX]` with the highest PF.
pub fn best_threshold(p: &[f64], y: &[u8], mask: &[bool]) -> (f64, PfComponents) {
    let steps = ((TAU_MAX - TAU_MIN) / TAU_STEP).round() as usize;
    let mut best = (TAU_MIN, pf_proxy(p, y, mask, TAU_MIN));
    for s in 1..=steps {
        let tau = TAU_MIN + s as f64 * TAU_STEP;
        let c = pf_proxy(p, y, mask, tau);
        if c.pf > best.1.pf {
            best = (tau, c);
        }
    }
    best
}

// ─── Search ──────────────────────────────────────────────────────────

/// Choose weights and threshold. With the `bayes` feature a TPE search runs
/// `params.trials` trials (one axis per learner weight plus τ), after which τ
/// is refined on the grid; without it, equal weights at τ = 0.6.
pub fn optimize(oof: &OofSet, params: &EnsembleParams) -> Result<EnsembleResult, EnsembleError> {
    oof.validate()?;
    let mask = oof.scoring_mask();

    #[cfg(feature = "bayes")]
    let (weights, threshold, method) = {
        let (weights, tau, _) = tpe_search(oof, &mask, params);
        let blended = oof.blend(&weights);
        let at_tau = pf_proxy(&blended, &oof.y, &mask, tau);
        let (grid_tau, at_grid) = best_threshold(&blended, &oof.y, &mask);
        let threshold = if at_tau.pf > at_grid.pf { tau } else { grid_tau };
        (weights, threshold, SearchMethod::Tpe)
    };
    #[cfg(not(feature = "bayes"))]
    let (weights, threshold, method) = {
        let _ = params;
        (equal_weights(oof.learners()), FALLBACK_TAU, SearchMethod::EqualWeights)
    };

    let blended = oof.blend(&weights);
    let score = pf_proxy(&blended, &oof.y, &mask, threshold);
    let per_model = oof
        .probs
        .iter()
        .map(|(k, p)| (*k, pf_proxy(p, &oof.y, &mask, threshold)))
        .collect();
    info!(
        learners = oof.probs.len(),
        samples = oof.len(),
        threshold,
        pf = score.pf,
        tp = score.tp,
        fp = score.fp,
        "ensemble optimized"
    );
    Ok(EnsembleResult {
        weights,
        threshold,
        score,
        per_model,
        method,
    })
}

/// Trial bookkeeping for one TPE search.
#[cfg(feature = "bayes")]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct TpeTrace {
    scored: usize,
    /// Samples or observations the optimizer refused.
    rejected: usize,
}

#[cfg(feature = "bayes")]
fn tpe_search(
    oof: &OofSet,
    mask: &[bool],
    params: &EnsembleParams,
) -> (BTreeMap<LearnerKind, f64>, f64, TpeTrace) {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    let kinds = oof.learners();
    let mut best_weights = equal_weights(kinds.iter().copied());
    let mut best_tau = FALLBACK_TAU;
    let mut best_pf = pf_proxy(&oof.blend(&best_weights), &oof.y, mask, best_tau).pf;

    let axis = |lo: f64, hi: f64| {
        tpe::range(lo, hi)
            .ok()
            .map(|r| tpe::TpeOptimizer::new(tpe::parzen_estimator(), r))
    };
    let weight_axes: Option<Vec<tpe::TpeOptimizer>> = kinds.iter().map(|_| axis(0.0, 1.0)).collect();
    let mut trace = TpeTrace::default();
    let (Some(mut weight_axes), Some(mut tau_axis)) = (weight_axes, axis(TAU_MIN, TAU_MAX)) else {
        debug!("tpe axes unavailable, keeping equal weights");
        return (best_weights, best_tau, trace);
    };

    let mut rng = StdRng::seed_from_u64(params.seed);
    for trial in 0..params.trials {
        let raw: Option<Vec<f64>> = weight_axes.iter_mut().map(|a| a.ask(&mut rng).ok()).collect();
        let (Some(raw), Ok(tau)) = (raw, tau_axis.ask(&mut rng)) else {
            debug!(trial, "tpe ask failed");
            trace.rejected += 1;
            continue;
        };
        let weights = normalize_weights(&kinds.iter().copied().zip(raw.iter().copied()).collect());
        let pf = pf_proxy(&oof.blend(&weights), &oof.y, mask, tau).pf;

        // the optimizer minimizes
        trace.scored += 1;
        for (a, v) in weight_axes.iter_mut().zip(&raw) {
            if let Err(e) = a.tell(*v, -pf) {
                debug!(trial, value = *v, error = %e, "tpe weight observation rejected");
                trace.rejected += 1;
            }
        }
        if let Err(e) = tau_axis.tell(tau, -pf) {
            debug!(trial, tau, error = %e, "tpe threshold observation rejected");
            trace.rejected += 1;
        }

        if pf > best_pf {
            debug!(trial, pf, tau, "ensemble search improved");
            best_pf = pf;
            best_weights = weights;
            best_tau = tau;
        }
    }
    if trace.rejected > 0 {
        debug!(scored = trace.scored, rejected = trace.rejected, "tpe search degraded toward random sampling");
    }
    (best_weights, best_tau, trace)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oof_with(probs: Vec<(LearnerKind, Vec<f64>)>, y: Vec<u8>, fold: Vec<usize>) -> OofSet {
        OofSet {
            y,
            fold,
            probs: probs.into_iter().collect(),
        }
    }

    #[test]
    fn pf_counts_only_mixed_folds() {
        let p = [0.9, 0.9, 0.9, 0.9];
        let y = [1, 0, 1, 1];
        // fold 1 is all positive → excluded
        let oof = oof_with(vec![(LearnerKind::Gbdt, p.to_vec())], y.to_vec(), vec![0, 0, 1, 1]);
        let mask = oof.scoring_mask();
        assert_eq!(mask, vec![true, true, false, false]);
        let c = pf_proxy(&p, &y, &mask, 0.6);
        assert_eq!((c.tp, c.fp), (1, 1));
        assert_eq!(c.pf, 0.5);
    }

    #[test]
    fn normalization() {
        let raw: BTreeMap<_, _> = [(LearnerKind::Gbdt, 3.0), (LearnerKind::Xgb, 1.0)].into();
        let w = normalize_weights(&raw);
        assert_eq!(w[&LearnerKind::Gbdt], 0.75);
        let zero: BTreeMap<_, _> = [(LearnerKind::Gbdt, 0.0), (LearnerKind::Xgb, 0.0)].into();
        let w = normalize_weights(&zero);
        assert_eq!(w[&LearnerKind::Xgb], 0.5);
    }

    #[test]
    fn blend_available_renormalizes() {
        let weights: BTreeMap<_, _> = [(LearnerKind::Gbdt, 0.5), (LearnerKind::Logistic, 0.5)].into();
        let probs: BTreeMap<_, _> = [(LearnerKind::Gbdt, 0.8)].into();
        assert_eq!(blend_available(&weights, &probs), Some(0.8));
        assert_eq!(blend_available(&weights, &BTreeMap::new()), None);
    }

    #[test]
    fn grid_picks_first_best_threshold() {
        let p = [0.55, 0.65, 0.75, 0.72];
        let y = [0, 1, 1, 0];
        let mask = [true; 4];
        let (tau, c) = best_threshold(&p, &y, &mask);
        // τ in (0.55, 0.65] drops the 0.55 negative; 0.56 is the first such grid point
        assert!((tau - 0.56).abs() < 1e-9);
        assert_eq!((c.tp, c.fp), (2, 1));
    }

    #[test]
    fn identical_learners_match_single_model() {
        let p = vec![0.555, 0.623, 0.712, 0.583, 0.904, 0.301, 0.664, 0.521, 0.773, 0.617];
        let y = vec![0, 1, 1, 0, 1, 0, 1, 0, 1, 0];
        let fold = vec![0, 0, 0, 0, 0, 1, 1, 1, 1, 1];
        let oof = oof_with(
            vec![(LearnerKind::Gbdt, p.clone()), (LearnerKind::Xgb, p.clone())],
            y.clone(),
            fold.clone(),
        );
        let result = optimize(&oof, &EnsembleParams { trials: 20, seed: 1 }).unwrap();
        let single = oof_with(vec![(LearnerKind::Gbdt, p.clone())], y.clone(), fold);
        let mask = single.scoring_mask();
        let (_, best_single) = best_threshold(&p, &y, &mask);
        let sum: f64 = result.weights.values().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(result.weights.values().all(|w| *w >= 0.0));
        if cfg!(feature = "bayes") {
            assert!((result.score.pf - best_single.pf).abs() < 1e-9);
        }
        assert_eq!(result.per_model[&LearnerKind::Gbdt], result.per_model[&LearnerKind::Xgb]);
    }

    #[cfg(feature = "bayes")]
    #[test]
    fn tpe_search_accepts_every_observation() {
        let p = vec![0.41, 0.72, 0.66, 0.38, 0.91, 0.22, 0.68, 0.55, 0.81, 0.47];
        let q = vec![0.52, 0.61, 0.77, 0.49, 0.83, 0.35, 0.59, 0.44, 0.71, 0.58];
        let y = vec![0, 1, 1, 0, 1, 0, 1, 0, 1, 0];
        let oof = oof_with(
            vec![(LearnerKind::Gbdt, p), (LearnerKind::Logistic, q)],
            y,
            vec![0, 0, 0, 0, 0, 1, 1, 1, 1, 1],
        );
        let mask = oof.scoring_mask();
        let (weights, tau, trace) = tpe_search(&oof, &mask, &EnsembleParams { trials: 30, seed: 4 });
        assert_eq!(trace, TpeTrace { scored: 30, rejected: 0 });
        assert!((weights.values().sum::<f64>() - 1.0).abs() < 1e-6);
        assert!((TAU_MIN..=TAU_MAX).contains(&tau));
    }

    #[test]
    fn rejects_empty_and_ragged() {
        assert_eq!(optimize(&OofSet::default(), &EnsembleParams::default()), Err(EnsembleError::NoLearners));
        let oof = oof_with(vec![(LearnerKind::Gbdt, vec![0.5])], vec![1, 0], vec![0, 0]);
        assert!(matches!(
            optimize(&oof, &EnsembleParams::default()),
            Err(EnsembleError::LengthMismatch { .. })
        ));
    }
}
