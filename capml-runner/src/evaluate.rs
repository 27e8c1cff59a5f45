//! Re-scoring the registry over a recent window and picking the active set.
//!
//! `evaluate` rebuilds entries and labels on the last N candles of every
//! authoritative entry, scores them with the stored ensemble and τ, and writes
//! `evaluation.json` (plus a flat `evaluation.csv`). `select_top` ranks pairs
//! by a composite score and writes `active.json`, which the live loop and
//! `show-active` treat as the universe.

use capml_core::data::CandleStore;
use capml_core::domain::{Candle, Timeframe};
use capml_core::ensemble::{blend_available, pf_proxy, PfComponents};
use capml_core::features::FeatureMatrix;
use capml_core::labeling::{label_entries, EntryRule};
use capml_core::metrics::CvMetrics;
use capml_core::models::{LearnerKind, ModelArtifact};
use capml_core::persist::{read_json, write_atomic, write_json_atomic};
use capml_core::registry::{ModelRegistry, RegistryEntry, RegistryError};
use capml_core::{Outcome, SkipReason};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use tracing::{info, warn};

pub const EVALUATION_FILE: &str = "evaluation.json";
pub const EVALUATION_CSV: &str = "evaluation.csv";
pub const ACTIVE_FILE: &str = "active.json";

/// `sharpe + 0.5·(min(pf, 5) − 1) + max_drawdown + 0.1·ln(1 + entries)`.
pub fn composite_score(metrics: &CvMetrics, entries: usize) -> f64 {
    metrics.sharpe + 0.5 * (metrics.pf.min(5.0) - 1.0) + metrics.max_drawdown + 0.1 * (entries as f64).ln_1p()
}

// ─── Evaluation ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairEvaluation {
    pub key: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub strategy_tag: String,
    pub bars: usize,
    pub entries: usize,
    /// Entries the ensemble would have taken (`p̂ ≥ τ`).
    pub trades: usize,
    pub hit_rate: f64,
    pub pf_proxy: PfComponents,
    pub metrics: CvMetrics,
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub generated_at: DateTime<Utc>,
    pub lookback: usize,
    pub pairs: Vec<PairEvaluation>,
    /// Key → status label for pairs that could not be scored.
    pub skipped: BTreeMap<String, String>,
}

impl EvaluationReport {
    pub fn get(&self, key: &str) -> Option<&PairEvaluation> {
        self.pairs.iter().find(|p| p.key == key)
    }

    pub fn load(state_dir: &Path) -> io::Result<Option<Self>> {
        read_json(&state_dir.join(EVALUATION_FILE))
    }

    /// Write `evaluation.json` and `evaluation.csv` into `state_dir`.
    pub fn save(&self, state_dir: &Path) -> io::Result<()> {
        write_json_atomic(&state_dir.join(EVALUATION_FILE), self)?;
        write_atomic(&state_dir.join(EVALUATION_CSV), &self.to_csv()?)
    }

    fn to_csv(&self) -> io::Result<Vec<u8>> {
        let to_io = |e: csv::Error| io::Error::new(io::ErrorKind::Other, e);
        let mut wtr = csv::Writer::from_writer(Vec::new());
        wtr.write_record([
            "key", "symbol", "timeframe", "bars", "entries", "trades", "hit_rate", "pf_proxy", "sharpe", "pf",
            "max_drawdown", "threshold",
        ])
        .map_err(to_io)?;
        for p in &self.pairs {
            wtr.write_record([
                p.key.clone(),
                p.symbol.clone(),
                p.timeframe.to_string(),
                p.bars.to_string(),
                p.entries.to_string(),
                p.trades.to_string(),
                format!("{:.4}", p.hit_rate),
                format!("{:.4}", p.pf_proxy.pf),
                format!("{:.4}", p.metrics.sharpe),
                format!("{:.4}", p.metrics.pf),
                format!("{:.4}", p.metrics.max_drawdown),
                format!("{:.2}", p.threshold),
            ])
            .map_err(to_io)?;
        }
        wtr.into_inner().map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }
}

/// Load every artifact the entry lists; missing or unreadable ones are skipped.
pub fn load_artifacts(registry: &ModelRegistry, entry: &RegistryEntry) -> BTreeMap<LearnerKind, ModelArtifact> {
    let mut out = BTreeMap::new();
    for (kind, rel) in &entry.artifact_paths {
        match registry.load_artifact(rel) {
            Ok(a) => {
                out.insert(*kind, a);
            }
            Err(e) => warn!(key = %entry.key, learner = %kind, error = %e, "artifact unavailable"),
        }
    }
    out
}

/// Score `entry` on `candles` with pre-loaded artifacts.
pub fn evaluate_entry(
    entry: &RegistryEntry,
    artifacts: &BTreeMap<LearnerKind, ModelArtifact>,
    candles: &[Candle],
    vol_span: usize,
) -> Outcome<PairEvaluation> {
    if candles.is_empty() {
        return Outcome::Skip(SkipReason::NoData);
    }
    if artifacts.is_empty() {
        return Outcome::Skip(SkipReason::NoLearners);
    }
    let rule: EntryRule = match entry.strategy_tag.parse() {
        Ok(r) => r,
        Err(e) => return Outcome::Fail(e),
    };

    let features = FeatureMatrix::build(candles, entry.feature_set);
    let events: Vec<_> = rule
        .entries(candles)
        .into_iter()
        .filter(|e| features.is_complete(e.index))
        .collect();
    if events.is_empty() {
        return Outcome::Skip(SkipReason::NoEntries);
    }
    let labels = label_entries(candles, &events, &entry.triple_barrier_params, vol_span);
    let rows: Vec<Vec<f64>> = labels
        .iter()
        .map(|l| features.reindexed_row(l.entry, &entry.feature_names))
        .collect();

    let mut per_learner: BTreeMap<LearnerKind, Vec<f64>> = BTreeMap::new();
    for (kind, artifact) in artifacts {
        match artifact.predict_positive(&rows) {
            Ok(p) => {
                per_learner.insert(*kind, p);
            }
            Err(e) => warn!(key = %entry.key, learner = %kind, error = %e, "artifact rejected rows"),
        }
    }
    if per_learner.is_empty() {
        return Outcome::Skip(SkipReason::NoLearners);
    }

    let weights = entry.weights();
    let p_hat: Vec<f64> = (0..rows.len())
        .map(|k| {
            let comps: BTreeMap<LearnerKind, f64> = per_learner.iter().map(|(m, p)| (*m, p[k])).collect();
            blend_available(&weights, &comps).unwrap_or(0.0)
        })
        .collect();
    let y: Vec<u8> = labels.iter().map(|l| l.y).collect();
    let mask = vec![true; y.len()];
    let taken: Vec<usize> = (0..p_hat.len()).filter(|k| p_hat[*k] >= entry.threshold).collect();
    let returns: Vec<f64> = taken.iter().map(|k| labels[*k].ret).collect();
    let hits = taken.iter().filter(|k| y[**k] == 1).count();

    Outcome::Ok(PairEvaluation {
        key: entry.key.clone(),
        symbol: entry.symbol.clone(),
        timeframe: entry.timeframe,
        strategy_tag: entry.strategy_tag.clone(),
        bars: candles.len(),
        entries: labels.len(),
        trades: taken.len(),
        hit_rate: if taken.is_empty() { 0.0 } else { hits as f64 / taken.len() as f64 },
        pf_proxy: pf_proxy(&p_hat, &y, &mask, entry.threshold),
        metrics: CvMetrics::from_returns(&returns),
        threshold: entry.threshold,
    })
}

/// Fetch the last `lookback` candles for every authoritative entry and score it.
/// `vol_span` must match the span used when the entry was trained.
pub fn evaluate_registry(
    registry: &ModelRegistry,
    store: &CandleStore,
    lookback: usize,
    vol_span: usize,
    now: DateTime<Utc>,
) -> Result<EvaluationReport, RegistryError> {
    let mut pairs = Vec::new();
    let mut skipped = BTreeMap::new();
    for entry in registry.authoritative()? {
        let candles = match store.candles(&entry.symbol, entry.timeframe, lookback) {
            Ok(c) => c,
            Err(e) => {
                let reason = if e.is_broker_unavailable() {
                    SkipReason::BrokerUnavailable.to_string()
                } else {
                    e.to_string()
                };
                warn!(key = %entry.key, error = %e, "evaluation fetch failed");
                skipped.insert(entry.key.clone(), reason);
                continue;
            }
        };
        let artifacts = load_artifacts(registry, &entry);
        match evaluate_entry(&entry, &artifacts, &candles, vol_span) {
            Outcome::Ok(p) => {
                info!(key = %p.key, trades = p.trades, hit_rate = p.hit_rate, pf = p.metrics.pf, "evaluated");
                pairs.push(p);
            }
            other => {
                skipped.insert(entry.key.clone(), other.label());
            }
        }
    }
    Ok(EvaluationReport {
        generated_at: now,
        lookback,
        pairs,
        skipped,
    })
}

// ─── Active set ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreSource {
    Evaluation,
    Cv,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivePair {
    pub key: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub score: f64,
    pub source: ScoreSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveSet {
    pub generated_at: DateTime<Utc>,
    pub pairs: Vec<ActivePair>,
}

impl ActiveSet {
    pub fn load(state_dir: &Path) -> io::Result<Option<Self>> {
        read_json(&state_dir.join(ACTIVE_FILE))
    }

    pub fn save(&self, state_dir: &Path) -> io::Result<()> {
        write_json_atomic(&state_dir.join(ACTIVE_FILE), self)
    }

    pub fn pairs(&self) -> Vec<(String, Timeframe)> {
        self.pairs.iter().map(|p| (p.symbol.clone(), p.timeframe)).collect()
    }
}

/// Rank entries by composite score, preferring evaluation metrics when
/// present, and keep the best `k`. Ties break by key.
pub fn select_top(
    entries: &[RegistryEntry],
    evaluation: Option<&EvaluationReport>,
    k: usize,
    now: DateTime<Utc>,
) -> ActiveSet {
    let mut scored: Vec<ActivePair> = entries
        .iter()
        .map(|e| {
            let (score, source) = match evaluation.and_then(|r| r.get(&e.key)) {
                Some(p) => (composite_score(&p.metrics, p.entries), ScoreSource::Evaluation),
                None => (composite_score(&e.cv_metrics, e.entries), ScoreSource::Cv),
            };
            ActivePair {
                key: e.key.clone(),
                symbol: e.symbol.clone(),
                timeframe: e.timeframe,
                score: if score.is_finite() { score } else { f64::NEG_INFINITY },
                source,
            }
        })
        .collect();
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.key.cmp(&b.key))
    });
    scored.truncate(k);
    ActiveSet {
        generated_at: now,
        pairs: scored,
    }
}

/// Pairs from `active.json` when present, else the configured universe.
pub fn active_universe(state_dir: &Path, configured: Vec<(String, Timeframe)>) -> Vec<(String, Timeframe)> {
    match ActiveSet::load(state_dir) {
        Ok(Some(set)) if !set.pairs.is_empty() => set.pairs(),
        Ok(_) => configured,
        Err(e) => {
            warn!(error = %e, "unreadable active set; using configured universe");
            configured
        }
    }
}
