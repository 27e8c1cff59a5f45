//! Offline training pipeline.
//!
//! One job per `(symbol, timeframe)`:
//!
//! ```text
//! FETCH -> FEATURES -> ENTRIES -> LABELS -> CV -> FIT_BASE -> ENSEMBLE -> PERSIST
//! ```
//!
//! Any stage can end the job with `Skip(reason)` or `Fail(message)`; nothing
//! is written to the registry unless PERSIST is reached. Jobs for different
//! pairs are independent and run on a bounded rayon pool.

use crate::config::BotConfig;
use capml_core::cv::{purge, purged_splits, Fold};
use capml_core::data::CandleStore;
use capml_core::domain::{pair_key, validate_candles, Candle, Timeframe};
use capml_core::ensemble::{normalize_weights, optimize, EnsembleParams, OofSet};
use capml_core::features::FeatureMatrix;
use capml_core::labeling::{label_entries, MetaLabel};
use capml_core::metrics::CvMetrics;
use capml_core::models::{LearnerKind, ModelArtifact, ModelError};
use capml_core::registry::{ModelRegistry, RegistryEntry};
use capml_core::{Outcome, SkipReason};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrainStage {
    Fetch,
    Features,
    Entries,
    Labels,
    Cv,
    FitBase,
    Ensemble,
    Persist,
}

impl fmt::Display for TrainStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrainStage::Fetch => "FETCH",
            TrainStage::Features => "FEATURES",
            TrainStage::Entries => "ENTRIES",
            TrainStage::Labels => "LABELS",
            TrainStage::Cv => "CV",
            TrainStage::FitBase => "FIT_BASE",
            TrainStage::Ensemble => "ENSEMBLE",
            TrainStage::Persist => "PERSIST",
        };
        f.write_str(s)
    }
}

/// Result of one training job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainReport {
    pub symbol: String,
    pub timeframe: Timeframe,
    /// Last stage entered; for a skip or failure, the stage that stopped the job.
    pub stage: TrainStage,
    pub outcome: Outcome<RegistryEntry>,
    pub elapsed_ms: u64,
}

/// `w_k = γ^(N−1−k)`: the newest sample weighs 1.
pub fn time_decay_weights(n: usize, gamma: f64) -> Vec<f64> {
    (0..n).map(|k| gamma.powi((n - 1 - k) as i32)).collect()
}

// ─── Dataset ─────────────────────────────────────────────────────────

/// Entry-bar training set: one row per labeled entry, oldest first.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub feature_names: Vec<String>,
    pub rows: Vec<Vec<f64>>,
    pub y: Vec<f64>,
    pub labels: Vec<MetaLabel>,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn entry_bars(&self) -> Vec<usize> {
        self.labels.iter().map(|l| l.entry).collect()
    }

    fn horizon_ends(&self) -> Vec<usize> {
        self.labels.iter().map(|l| l.horizon_end).collect()
    }

    fn has_both_classes(y: &[f64]) -> bool {
        y.iter().any(|v| *v > 0.5) && y.iter().any(|v| *v <= 0.5)
    }
}

type StageResult<T> = Result<T, (TrainStage, Outcome<RegistryEntry>)>;

fn skip<T>(stage: TrainStage, reason: SkipReason) -> StageResult<T> {
    Err((stage, Outcome::Skip(reason)))
}

fn fail<T>(stage: TrainStage, msg: impl Into<String>) -> StageResult<T> {
    Err((stage, Outcome::Fail(msg.into())))
}

// ─── Trainer ─────────────────────────────────────────────────────────

pub struct Trainer {
    config: BotConfig,
    store: Arc<CandleStore>,
    registry: Arc<ModelRegistry>,
}

impl Trainer {
    pub fn new(config: BotConfig, store: Arc<CandleStore>, registry: Arc<ModelRegistry>) -> Self {
        Self {
            config,
            store,
            registry,
        }
    }

    pub fn config(&self) -> &BotConfig {
        &self.config
    }

    /// Train every pair on a pool of `training.workers` threads.
    pub fn train_all(&self, pairs: &[(String, Timeframe)]) -> Vec<TrainReport> {
        let workers = self.config.training.workers.max(1);
        let run = || -> Vec<TrainReport> {
            pairs
                .par_iter()
                .map(|(symbol, tf)| self.train_pair(symbol, *tf))
                .collect()
        };
        match rayon::ThreadPoolBuilder::new().num_threads(workers).build() {
            Ok(pool) => pool.install(run),
            Err(e) => {
                warn!(error = %e, "worker pool unavailable; training sequentially");
                pairs.iter().map(|(s, tf)| self.train_pair(s, *tf)).collect()
            }
        }
    }

    pub fn train_pair(&self, symbol: &str, timeframe: Timeframe) -> TrainReport {
        let started = Instant::now();
        let (stage, outcome) = match self.fetch(symbol, timeframe) {
            Ok(candles) => self.train_candles(symbol, timeframe, &candles, Utc::now()),
            Err(stopped) => stopped,
        };
        let report = TrainReport {
            symbol: symbol.to_string(),
            timeframe,
            stage,
            outcome,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        match &report.outcome {
            Outcome::Ok(e) => info!(
                symbol,
                tf = %timeframe,
                threshold = e.threshold,
                cv_pf = e.cv_score,
                entries = e.entries,
                elapsed_ms = report.elapsed_ms,
                "training complete"
            ),
            Outcome::Skip(reason) => info!(symbol, tf = %timeframe, stage = %stage, reason = %reason, "training skipped"),
            Outcome::Fail(e) => warn!(symbol, tf = %timeframe, stage = %stage, error = %e, "training failed"),
        }
        report
    }

    fn fetch(&self, symbol: &str, tf: Timeframe) -> StageResult<Vec<Candle>> {
        debug!(symbol, tf = %tf, stage = %TrainStage::Fetch, "stage start");
        match self.store.candles(symbol, tf, self.config.data.max_total) {
            Ok(c) if c.is_empty() => skip(TrainStage::Fetch, SkipReason::NoData),
            Ok(c) => Ok(c),
            Err(e) if e.is_broker_unavailable() => {
                warn!(symbol, tf = %tf, error = %e, "broker unavailable");
                skip(TrainStage::Fetch, SkipReason::BrokerUnavailable)
            }
            Err(e) => fail(TrainStage::Fetch, e.to_string()),
        }
    }

    /// Run FEATURES through PERSIST on already-fetched candles.
    pub fn train_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        candles: &[Candle],
        now: DateTime<Utc>,
    ) -> (TrainStage, Outcome<RegistryEntry>) {
        match self.run_stages(symbol, timeframe, candles, now) {
            Ok(entry) => (TrainStage::Persist, Outcome::Ok(entry)),
            Err(stopped) => stopped,
        }
    }

    fn run_stages(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        candles: &[Candle],
        now: DateTime<Utc>,
    ) -> StageResult<RegistryEntry> {
        let data = self.build_dataset(candles)?;
        let folds = self.folds(&data)?;

        let kinds = self.config.learner_kinds();
        let weights = time_decay_weights(data.len(), self.config.training.time_decay_gamma);
        let seed = self.config.training.seed;

        // FIT_BASE: out-of-fold probabilities per learner
        debug!(symbol, tf = %timeframe, stage = %TrainStage::FitBase, learners = kinds.len(), "stage start");
        let mut oof_probs: BTreeMap<LearnerKind, Vec<f64>> = BTreeMap::new();
        for kind in kinds {
            match oof_predictions(kind, &data, &folds, &weights, seed) {
                Ok(p) => {
                    oof_probs.insert(kind, p);
                }
                Err(e) => warn!(symbol, tf = %timeframe, learner = %kind, error = %e, "learner skipped"),
            }
        }
        if oof_probs.is_empty() {
            return skip(TrainStage::FitBase, SkipReason::NoLearners);
        }

        // ENSEMBLE over samples that landed in some test range
        debug!(symbol, tf = %timeframe, stage = %TrainStage::Ensemble, "stage start");
        let mut fold_of = vec![None; data.len()];
        for f in &folds {
            for k in f.test.clone() {
                fold_of[k] = Some(f.index);
            }
        }
        let scored: Vec<usize> = (0..data.len()).filter(|k| fold_of[*k].is_some()).collect();
        let oof = OofSet {
            y: scored.iter().map(|k| u8::from(data.y[*k] > 0.5)).collect(),
            fold: scored.iter().filter_map(|k| fold_of[*k]).collect(),
            probs: oof_probs
                .iter()
                .map(|(kind, p)| (*kind, scored.iter().map(|k| p[*k]).collect()))
                .collect(),
        };
        let params = EnsembleParams {
            trials: self.config.training.ensemble_trials,
            seed,
        };
        let result = match optimize(&oof, &params) {
            Ok(r) => r,
            Err(e) => return fail(TrainStage::Ensemble, e.to_string()),
        };
        let blended = oof.blend(&result.weights);
        let trade_returns: Vec<f64> = scored
            .iter()
            .zip(&blended)
            .filter(|(_, p)| **p >= result.threshold)
            .map(|(k, _)| data.labels[*k].ret)
            .collect();
        let cv_metrics = CvMetrics::from_returns(&trade_returns);

        // PERSIST: final fit on every sample
        debug!(symbol, tf = %timeframe, stage = %TrainStage::Persist, "stage start");
        let key = pair_key(symbol, timeframe);
        let mut artifact_paths = BTreeMap::new();
        for kind in oof_probs.keys() {
            let model = match ModelArtifact::fit(*kind, &data.rows, &data.y, &weights, seed) {
                Ok(m) => m,
                Err(e) => {
                    warn!(symbol, tf = %timeframe, learner = %kind, error = %e, "final fit failed");
                    continue;
                }
            };
            match self.registry.save_artifact(&key, &model) {
                Ok(rel) => {
                    artifact_paths.insert(*kind, rel);
                }
                Err(e) => return fail(TrainStage::Persist, e.to_string()),
            }
        }
        if artifact_paths.is_empty() {
            return skip(TrainStage::Persist, SkipReason::NoLearners);
        }
        let kept: BTreeMap<LearnerKind, f64> = result
            .weights
            .iter()
            .filter(|(k, _)| artifact_paths.contains_key(*k))
            .map(|(k, w)| (*k, *w))
            .collect();

        let entry = RegistryEntry {
            key,
            symbol: symbol.to_string(),
            timeframe,
            strategy_tag: self.config.labeling.entry_rule.strategy_tag().to_string(),
            feature_names: data.feature_names.clone(),
            threshold: result.threshold,
            cv_score: result.score.pf,
            entries: data.len(),
            trained_at: now,
            artifact_paths,
            ensemble_weights: Some(normalize_weights(&kept)),
            triple_barrier_params: self.config.triple_barrier(),
            feature_set: self.config.training.feature_set,
            cv_metrics,
            per_model_pf: result.per_model,
        };
        if let Err(e) = self.registry.upsert(entry.clone()) {
            return fail(TrainStage::Persist, e.to_string());
        }
        Ok(entry)
    }

    /// FEATURES → ENTRIES → LABELS.
    pub fn build_dataset(&self, candles: &[Candle]) -> StageResult<Dataset> {
        if candles.is_empty() {
            return skip(TrainStage::Fetch, SkipReason::NoData);
        }
        if let Err(e) = validate_candles(candles) {
            return fail(TrainStage::Fetch, e.to_string());
        }

        let features = FeatureMatrix::build(candles, self.config.training.feature_set);
        let complete = (0..features.n_rows()).filter(|i| features.is_complete(*i)).count();
        if complete < self.config.training.min_rows {
            return skip(TrainStage::Features, SkipReason::InsufficientRows);
        }

        // warmup rows are dropped, never filled, for training
        let entries: Vec<_> = self
            .config
            .labeling
            .entry_rule
            .entries(candles)
            .into_iter()
            .filter(|e| features.is_complete(e.index))
            .collect();
        if entries.is_empty() {
            return skip(TrainStage::Entries, SkipReason::NoEntries);
        }

        let labels = label_entries(
            candles,
            &entries,
            &self.config.triple_barrier(),
            self.config.labeling.vol_span,
        );
        let y: Vec<f64> = labels.iter().map(|l| f64::from(l.y)).collect();
        if !Dataset::has_both_classes(&y) {
            return skip(TrainStage::Labels, SkipReason::DegenerateLabels);
        }
        let idx: Vec<usize> = labels.iter().map(|l| l.entry).collect();
        Ok(Dataset {
            feature_names: features.names().to_vec(),
            rows: features.select_rows(&idx),
            y,
            labels,
        })
    }

    /// CV: purged folds whose training range still holds both classes.
    pub fn folds(&self, data: &Dataset) -> StageResult<Vec<Fold>> {
        let raw = match purged_splits(data.len(), self.config.cv.cv_splits, self.config.embargo()) {
            Ok(f) => f,
            Err(e) => {
                debug!(error = %e, "no folds");
                return skip(TrainStage::Cv, SkipReason::NoFolds);
            }
        };
        let entry_bars = data.entry_bars();
        let horizon_ends = data.horizon_ends();
        let usable: Vec<Fold> = raw
            .iter()
            .filter_map(|f| purge(f, &entry_bars, &horizon_ends))
            .filter(|f| Dataset::has_both_classes(&data.y[f.train.clone()]))
            .collect();
        if usable.is_empty() {
            return skip(TrainStage::Cv, SkipReason::NoFolds);
        }
        Ok(usable)
    }
}

/// Fit `kind` on each fold's training range and predict its test range.
/// Samples outside every test range stay NaN.
fn oof_predictions(
    kind: LearnerKind,
    data: &Dataset,
    folds: &[Fold],
    weights: &[f64],
    seed: u64,
) -> Result<Vec<f64>, ModelError> {
    let mut out = vec![f64::NAN; data.len()];
    for f in folds {
        let train = f.train.clone();
        let model = ModelArtifact::fit(kind, &data.rows[train.clone()], &data.y[train.clone()], &weights[train], seed)?;
        let p = model.predict_positive(&data.rows[f.test.clone()])?;
        out[f.test.clone()].copy_from_slice(&p);
    }
    Ok(out)
}
