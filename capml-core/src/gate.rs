//! Decision Gate: latest registry entry + recent candles → BUY / SELL / HOLD.
//!
//! The feature row is reindexed to the entry's stored feature names (missing
//! names become 0), each available artifact contributes `p_m`, and the
//! stored ensemble weights (renormalized over the available artifacts)
//! blend them into `p̂`. Any missing piece degrades to HOLD with a reason.

use crate::domain::{Candle, Timeframe};
use crate::ensemble::blend_available;
use crate::features::FeatureMatrix;
use crate::models::{LearnerKind, ModelArtifact};
use crate::registry::{ModelRegistry, RegistryEntry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

pub const MIN_BARS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Buy,
    Sell,
    Hold,
}

impl Action {
    pub fn is_actionable(self) -> bool {
        self != Action::Hold
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldReason {
    NoRegistryEntry,
    RegistryUnreadable,
    InsufficientBars,
    TooFewArtifacts,
    BelowThreshold,
    ShortDisabled,
}

impl HoldReason {
    pub fn code(self) -> &'static str {
        match self {
            HoldReason::NoRegistryEntry => "no_registry_entry",
            HoldReason::RegistryUnreadable => "registry_unreadable",
            HoldReason::InsufficientBars => "insufficient_bars",
            HoldReason::TooFewArtifacts => "too_few_artifacts",
            HoldReason::BelowThreshold => "below_threshold",
            HoldReason::ShortDisabled => "short_disabled",
        }
    }
}

impl fmt::Display for HoldReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateDecision {
    pub action: Action,
    /// `max(p̂, 1 − p̂)`; 0 when no probability was computed.
    pub confidence: f64,
    pub p_hat: Option<f64>,
    pub components: BTreeMap<LearnerKind, f64>,
    pub threshold: Option<f64>,
    pub reason: Option<HoldReason>,
}

impl GateDecision {
    fn hold(reason: HoldReason) -> Self {
        Self {
            action: Action::Hold,
            confidence: 0.0,
            p_hat: None,
            components: BTreeMap::new(),
            threshold: None,
            reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
    pub min_bars: usize,
    pub min_artifacts: usize,
    pub allow_short: bool,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            min_bars: MIN_BARS,
            min_artifacts: 1,
            allow_short: false,
        }
    }
}

/// Loaded artifacts for one registry key, valid for a single `trained_at`.
struct ArtifactSlot {
    trained_at: DateTime<Utc>,
    by_path: HashMap<String, Arc<ModelArtifact>>,
}

impl ArtifactSlot {
    fn new(trained_at: DateTime<Utc>) -> Self {
        Self {
            trained_at,
            by_path: HashMap::new(),
        }
    }
}

pub struct DecisionGate {
    registry: Arc<ModelRegistry>,
    config: GateConfig,
    artifacts: Mutex<HashMap<String, ArtifactSlot>>,
}

impl DecisionGate {
    pub fn new(registry: Arc<ModelRegistry>, config: GateConfig) -> Self {
        Self {
            registry,
            config,
            artifacts: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn decide(&self, symbol: &str, timeframe: Timeframe, candles: &[Candle]) -> GateDecision {
        let entry = match self.registry.latest(symbol, timeframe) {
            Ok(Some(e)) => e,
            Ok(None) => return GateDecision::hold(HoldReason::NoRegistryEntry),
            Err(e) => {
                warn!(symbol, tf = %timeframe, error = %e, "registry read failed");
                return GateDecision::hold(HoldReason::RegistryUnreadable);
            }
        };
        self.decide_with_entry(&entry, candles)
    }

    pub fn decide_with_entry(&self, entry: &RegistryEntry, candles: &[Candle]) -> GateDecision {
        if candles.len() < self.config.min_bars {
            return GateDecision::hold(HoldReason::InsufficientBars);
        }
        let mut features = FeatureMatrix::build(candles, entry.feature_set);
        features.fill_for_inference();
        self.decide_matrix(entry, &features)
    }

    /// Gate on the last row of an already-filled feature matrix.
    pub fn decide_matrix(&self, entry: &RegistryEntry, features: &FeatureMatrix) -> GateDecision {
        let Some(last) = features.n_rows().checked_sub(1) else {
            return GateDecision::hold(HoldReason::InsufficientBars);
        };
        let row = features.reindexed_row(last, &entry.feature_names);

        let mut components = BTreeMap::new();
        for (learner, rel) in &entry.artifact_paths {
            let Some(artifact) = self.artifact(entry, rel) else {
                continue;
            };
            match artifact.predict_positive(std::slice::from_ref(&row)) {
                Ok(p) => {
                    if let Some(p) = p.first().copied().filter(|p| p.is_finite()) {
                        components.insert(*learner, p);
                    }
                }
                Err(e) => warn!(key = %entry.key, learner = %learner, error = %e, "artifact rejected input"),
            }
        }

        let weights = entry.weights();
        let p_hat = if components.len() >= self.config.min_artifacts.max(1) {
            blend_available(&weights, &components)
        } else {
            None
        };
        let Some(p) = p_hat else {
            let mut d = GateDecision::hold(HoldReason::TooFewArtifacts);
            d.components = components;
            return d;
        };

        let tau = entry.threshold;
        let (action, reason) = if p >= tau {
            (Action::Buy, None)
        } else if p <= 1.0 - tau {
            if self.config.allow_short {
                (Action::Sell, None)
            } else {
                (Action::Hold, Some(HoldReason::ShortDisabled))
            }
        } else {
            (Action::Hold, Some(HoldReason::BelowThreshold))
        };
        debug!(key = %entry.key, p_hat = p, tau, ?action, "gate decision");
        GateDecision {
            action,
            confidence: p.max(1.0 - p),
            p_hat: Some(p),
            components,
            threshold: Some(tau),
            reason,
        }
    }

    /// Number of artifacts currently held in memory.
    pub fn cached_artifacts(&self) -> usize {
        self.artifacts.lock().unwrap().values().map(|s| s.by_path.len()).sum()
    }

    fn artifact(&self, entry: &RegistryEntry, rel: &str) -> Option<Arc<ModelArtifact>> {
        {
            let mut cache = self.artifacts.lock().unwrap();
            let slot = cache
                .entry(entry.key.clone())
                .or_insert_with(|| ArtifactSlot::new(entry.trained_at));
            if slot.trained_at != entry.trained_at {
                debug!(key = %entry.key, dropped = slot.by_path.len(), "retrained, artifact cache evicted");
                *slot = ArtifactSlot::new(entry.trained_at);
            }
            if let Some(a) = slot.by_path.get(rel) {
                return Some(Arc::clone(a));
            }
        }
        match self.registry.load_artifact(rel) {
            Ok(a) => {
                let a = Arc::new(a);
                let mut cache = self.artifacts.lock().unwrap();
                if let Some(slot) = cache.get_mut(&entry.key).filter(|s| s.trained_at == entry.trained_at) {
                    slot.by_path.insert(rel.to_string(), Arc::clone(&a));
                }
                Some(a)
            }
            Err(e) => {
                warn!(key = %entry.key, path = rel, error = %e, "artifact unavailable");
                None
            }
        }
    }
}
