//! Model Registry: a directory of serialized artifacts plus one JSON manifest.
//!
//! Layout under `root`:
//! - `<manifest>` (default `registry.json`): every [`RegistryEntry`]
//! - `<manifest>.lock`: advisory lock held across read-modify-write
//! - `<models_dir>/<key>__<learner>.bin`: fitted [`ModelArtifact`]s
//!
//! Upsert replaces the entry with the same key; readers take the greatest
//! `trained_at`. Writers in any process serialize on the lock file, and every
//! write goes through a unique temp file + rename, so readers never lock.

use crate::domain::{ModelKey, Timeframe};
use crate::ensemble::PfComponents;
use crate::features::FeatureSet;
use crate::labeling::TripleBarrierParams;
use crate::metrics::CvMetrics;
use crate::models::{LearnerKind, ModelArtifact, ModelError};
use crate::persist::{read_json, write_atomic, write_json_atomic};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_MANIFEST: &str = "registry.json";
pub const DEFAULT_MODELS_DIR: &str = "models";
pub const ARTIFACT_EXT: &str = "bin";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry I/O: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("no registry entry for key '{0}'")]
    UnknownKey(String),

    #[error("invalid entry '{key}': {reason}")]
    InvalidEntry { key: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub key: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub strategy_tag: String,
    pub feature_names: Vec<String>,
    pub threshold: f64,
    pub cv_score: f64,
    pub entries: usize,
    pub trained_at: DateTime<Utc>,
    /// Learner → artifact path relative to the registry root.
    pub artifact_paths: BTreeMap<LearnerKind, String>,
    #[serde(default)]
    pub ensemble_weights: Option<BTreeMap<LearnerKind, f64>>,
    pub triple_barrier_params: TripleBarrierParams,
    #[serde(default)]
    pub feature_set: FeatureSet,
    #[serde(default)]
    pub cv_metrics: CvMetrics,
    #[serde(default)]
    pub per_model_pf: BTreeMap<LearnerKind, PfComponents>,
}

impl RegistryEntry {
    pub fn model_key(&self) -> ModelKey {
        ModelKey::new(self.symbol.clone(), self.timeframe, self.strategy_tag.clone())
    }

    /// Stored ensemble weights, or equal weights over the stored artifacts.
    pub fn weights(&self) -> BTreeMap<LearnerKind, f64> {
        match &self.ensemble_weights {
            Some(w) => w.clone(),
            None => crate::ensemble::equal_weights(self.artifact_paths.keys().copied()),
        }
    }

    fn validate(&self) -> Result<(), RegistryError> {
        let invalid = |reason: String| RegistryError::InvalidEntry {
            key: self.key.clone(),
            reason,
        };
        if self.key != self.model_key().key() {
            return Err(invalid(format!("key does not match {}", self.model_key())));
        }
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(invalid(format!("threshold {} outside [0, 1]", self.threshold)));
        }
        if self.feature_names.is_empty() {
            return Err(invalid("empty feature list".into()));
        }
        if let Some(w) = &self.ensemble_weights {
            if w.values().any(|v| !v.is_finite() || *v < 0.0) {
                return Err(invalid("negative ensemble weight".into()));
            }
            let sum: f64 = w.values().sum();
            if (sum - 1.0).abs() >= 1e-6 {
                return Err(invalid(format!("ensemble weights sum to {sum}")));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub entries: Vec<RegistryEntry>,
}

impl Manifest {
    /// Entry with the greatest `trained_at` for `key`.
    pub fn latest(&self, key: &str) -> Option<&RegistryEntry> {
        self.entries
            .iter()
            .filter(|e| e.key == key)
            .max_by_key(|e| e.trained_at)
    }

    /// One authoritative entry per key, ordered by key.
    pub fn authoritative(&self) -> Vec<&RegistryEntry> {
        let mut by_key: BTreeMap<&str, &RegistryEntry> = BTreeMap::new();
        for e in &self.entries {
            let slot = by_key.entry(e.key.as_str()).or_insert(e);
            if e.trained_at > slot.trained_at {
                *slot = e;
            }
        }
        by_key.into_values().collect()
    }
}

pub struct ModelRegistry {
    root: PathBuf,
    manifest_path: PathBuf,
    models_dir: PathBuf,
    models_rel: String,
    lock_path: PathBuf,
}

/// Exclusive hold on the manifest lock file; released on drop.
struct ManifestLock(File);

impl Drop for ManifestLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.0);
    }
}

impl ModelRegistry {
    pub fn new(root: impl Into<PathBuf>, manifest: &str, models_dir: &str) -> Self {
        let root = root.into();
        Self {
            manifest_path: root.join(manifest),
            models_dir: root.join(models_dir),
            models_rel: models_dir.to_string(),
            lock_path: root.join(format!("{manifest}.lock")),
            root,
        }
    }

    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self::new(root, DEFAULT_MANIFEST, DEFAULT_MODELS_DIR)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    fn lock(&self) -> Result<ManifestLock, RegistryError> {
        fs::create_dir_all(&self.root)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.lock_path)?;
        FileExt::lock_exclusive(&file)?;
        Ok(ManifestLock(file))
    }

    /// Missing manifest reads as empty.
    pub fn load_manifest(&self) -> Result<Manifest, RegistryError> {
        Ok(read_json(&self.manifest_path)?.unwrap_or_default())
    }

    pub fn latest(&self, symbol: &str, timeframe: Timeframe) -> Result<Option<RegistryEntry>, RegistryError> {
        let key = crate::domain::pair_key(symbol, timeframe);
        Ok(self.load_manifest()?.latest(&key).cloned())
    }

    pub fn authoritative(&self) -> Result<Vec<RegistryEntry>, RegistryError> {
        Ok(self
            .load_manifest()?
            .authoritative()
            .into_iter()
            .cloned()
            .collect())
    }

    /// Replace any entry with the same key, then persist the manifest.
    pub fn upsert(&self, entry: RegistryEntry) -> Result<(), RegistryError> {
        entry.validate()?;
        let _lock = self.lock()?;
        let mut manifest = self.load_manifest()?;
        manifest.entries.retain(|e| e.key != entry.key);
        info!(key = %entry.key, tag = %entry.strategy_tag, threshold = entry.threshold, "registry upsert");
        manifest.entries.push(entry);
        manifest.entries.sort_by(|a, b| a.key.cmp(&b.key));
        write_json_atomic(&self.manifest_path, &manifest)?;
        Ok(())
    }

    /// Rewrite τ on the authoritative entry for `key`.
    pub fn update_threshold(&self, key: &str, threshold: f64) -> Result<(), RegistryError> {
        let _lock = self.lock()?;
        let mut manifest = self.load_manifest()?;
        let latest_at = manifest
            .latest(key)
            .map(|e| e.trained_at)
            .ok_or_else(|| RegistryError::UnknownKey(key.to_string()))?;
        for e in manifest
            .entries
            .iter_mut()
            .filter(|e| e.key == key && e.trained_at == latest_at)
        {
            e.threshold = threshold;
        }
        debug!(key, threshold, "registry threshold updated");
        write_json_atomic(&self.manifest_path, &manifest)?;
        Ok(())
    }

    /// Relative artifact path for `(key, learner)`.
    pub fn artifact_rel_path(&self, key: &str, learner: LearnerKind) -> String {
        format!("{}/{key}__{learner}.{ARTIFACT_EXT}", self.models_rel)
    }

    pub fn resolve(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    /// Write an artifact and return its path relative to the root.
    pub fn save_artifact(&self, key: &str, artifact: &ModelArtifact) -> Result<String, RegistryError> {
        let rel = self.artifact_rel_path(key, artifact.learner);
        fs::create_dir_all(&self.models_dir)?;
        write_atomic(&self.resolve(&rel), &artifact.to_json()?)?;
        Ok(rel)
    }

    pub fn load_artifact(&self, rel: &str) -> Result<ModelArtifact, RegistryError> {
        let bytes = fs::read(self.resolve(rel))?;
        Ok(ModelArtifact::from_json(&bytes)?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_root() -> PathBuf {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!("capml_registry_{}_{id}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    pub(crate) fn entry(symbol: &str, tf: Timeframe, hour: u32) -> RegistryEntry {
        RegistryEntry {
            key: crate::domain::pair_key(symbol, tf),
            symbol: symbol.into(),
            timeframe: tf,
            strategy_tag: "macd_cross".into(),
            feature_names: vec!["a".into(), "b".into()],
            threshold: 0.6,
            cv_score: 1.5,
            entries: 120,
            trained_at: Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap(),
            artifact_paths: BTreeMap::new(),
            ensemble_weights: Some([(LearnerKind::Gbdt, 0.25), (LearnerKind::Logistic, 0.75)].into()),
            triple_barrier_params: TripleBarrierParams::default(),
            feature_set: FeatureSet::Minimal,
            cv_metrics: CvMetrics::default(),
            per_model_pf: BTreeMap::new(),
        }
    }

    #[test]
    fn upsert_then_read_back_equal() {
        let reg = ModelRegistry::open(temp_root());
        let e = entry("EUR/USD", Timeframe::H1, 3);
        reg.upsert(e.clone()).unwrap();
        assert_eq!(reg.latest("EUR/USD", Timeframe::H1).unwrap(), Some(e));
        assert_eq!(reg.latest("EUR/USD", Timeframe::H4).unwrap(), None);
    }

    #[test]
    fn upsert_replaces_same_key() {
        let reg = ModelRegistry::open(temp_root());
        reg.upsert(entry("X", Timeframe::H1, 1)).unwrap();
        let mut newer = entry("X", Timeframe::H1, 2);
        newer.threshold = 0.7;
        reg.upsert(newer).unwrap();
        reg.upsert(entry("Y", Timeframe::H1, 1)).unwrap();
        let manifest = reg.load_manifest().unwrap();
        assert_eq!(manifest.entries.len(), 2);
        assert_eq!(reg.latest("X", Timeframe::H1).unwrap().unwrap().threshold, 0.7);
    }

    #[test]
    fn latest_prefers_greatest_trained_at() {
        let mut m = Manifest::default();
        let mut old = entry("X", Timeframe::H1, 1);
        old.threshold = 0.55;
        m.entries.push(entry("X", Timeframe::H1, 9));
        m.entries.push(old);
        assert_eq!(m.latest("X__1h").unwrap().threshold, 0.6);
        assert_eq!(m.authoritative().len(), 1);
    }

    #[test]
    fn rejects_bad_weights_and_key() {
        let reg = ModelRegistry::open(temp_root());
        let mut e = entry("X", Timeframe::H1, 1);
        e.ensemble_weights = Some([(LearnerKind::Gbdt, 0.5)].into());
        assert!(matches!(reg.upsert(e), Err(RegistryError::InvalidEntry { .. })));
        let mut e = entry("X", Timeframe::H1, 1);
        e.key = "X__4h".into();
        assert!(reg.upsert(e).is_err());
    }

    #[test]
    fn threshold_update_targets_latest() {
        let reg = ModelRegistry::open(temp_root());
        reg.upsert(entry("X", Timeframe::M15, 1)).unwrap();
        reg.update_threshold("X__15m", 0.72).unwrap();
        assert_eq!(reg.latest("X", Timeframe::M15).unwrap().unwrap().threshold, 0.72);
        assert!(matches!(
            reg.update_threshold("nope", 0.6),
            Err(RegistryError::UnknownKey(_))
        ));
    }

    #[test]
    fn artifact_round_trip() {
        let reg = ModelRegistry::open(temp_root());
        let rows: Vec<Vec<f64>> = (0..20).map(|i| vec![i as f64, 1.0]).collect();
        let y: Vec<f64> = (0..20).map(|i| if i >= 10 { 1.0 } else { 0.0 }).collect();
        let art = ModelArtifact::fit(LearnerKind::Logistic, &rows, &y, &[1.0; 20], 0).unwrap();
        let rel = reg.save_artifact("X__1h", &art).unwrap();
        assert_eq!(rel, "models/X__1h__logistic.bin");
        let back = reg.load_artifact(&rel).unwrap();
        assert_eq!(back.n_features, 2);
        assert!(reg.load_artifact("models/missing.bin").is_err());
    }

    #[test]
    fn two_handles_interleave_without_losing_entries() {
        let root = temp_root();
        let trainer = ModelRegistry::open(&root);
        let live = ModelRegistry::open(&root);
        live.upsert(entry("LIVE", Timeframe::H1, 0)).unwrap();

        std::thread::scope(|s| {
            s.spawn(|| {
                for i in 0..100 {
                    let tau = 0.5 + f64::from(i % 30) / 100.0;
                    live.update_threshold("LIVE__1h", tau).unwrap();
                }
            });
            s.spawn(|| {
                for i in 0..100 {
                    trainer.upsert(entry(&format!("S{i}"), Timeframe::H1, 1)).unwrap();
                }
            });
        });

        let manifest = trainer.load_manifest().unwrap();
        assert_eq!(manifest.entries.len(), 101);
        let tau = live.latest("LIVE", Timeframe::H1).unwrap().unwrap().threshold;
        assert!((tau - 0.59).abs() < 1e-12);
        // manifest and lock file only: no temp files left behind
        assert_eq!(fs::read_dir(&root).unwrap().count(), 2);
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn default_weights_are_equal_over_artifacts() {
        let mut e = entry("X", Timeframe::H1, 1);
        e.ensemble_weights = None;
        e.artifact_paths = [
            (LearnerKind::Gbdt, "a".to_string()),
            (LearnerKind::Xgb, "b".to_string()),
        ]
        .into();
        assert_eq!(e.weights()[&LearnerKind::Xgb], 0.5);
    }
}
