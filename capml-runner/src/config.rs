//! Bot configuration: one TOML file, every section defaulted.
//!
//! An empty file is a valid configuration. `validate()` rejects values the
//! pipeline or the live loop cannot run with; the CLI maps those failures to
//! exit code 2.

use capml_core::data::{CacheFormat, CapitalCredentials, CapitalSettings, PagingConfig};
use capml_core::domain::Timeframe;
use capml_core::features::FeatureSet;
use capml_core::gate::GateConfig;
use capml_core::labeling::{EntryRule, TripleBarrierParams};
use capml_core::models::LearnerKind;
use capml_core::sizing::RiskMode;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_CONFIG_FILE: &str = "capml.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("environment variable '{0}' is not set")]
    MissingEnv(String),
}

// ─── Sections ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UniverseConfig {
    pub symbols: Vec<String>,
    pub timeframes: Vec<Timeframe>,
}

impl Default for UniverseConfig {
    fn default() -> Self {
        Self {
            symbols: Vec::new(),
            timeframes: vec![Timeframe::M15, Timeframe::H1, Timeframe::H4],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub max_total: usize,
    pub page_size: usize,
    pub page_sleep_ms: u64,
    pub max_retries: u32,
    pub cache_dir: PathBuf,
    pub cache_format: CacheFormat,
    /// Defaults to one bar of the requested timeframe.
    pub cache_max_age_secs: Option<u64>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            max_total: 3000,
            page_size: 1000,
            page_sleep_ms: 250,
            max_retries: 3,
            cache_dir: PathBuf::from("data/cache"),
            cache_format: CacheFormat::Parquet,
            cache_max_age_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelingConfig {
    pub pt_mult: f64,
    pub sl_mult: f64,
    pub max_holding: usize,
    pub vol_span: usize,
    pub entry_rule: EntryRule,
}

impl Default for LabelingConfig {
    fn default() -> Self {
        let tb = TripleBarrierParams::default();
        Self {
            pt_mult: tb.pt_mult,
            sl_mult: tb.sl_mult,
            max_holding: tb.max_holding,
            vol_span: 50,
            entry_rule: EntryRule::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CvConfig {
    pub cv_splits: usize,
    /// Defaults to `labeling.max_holding`.
    pub embargo: Option<usize>,
}

impl Default for CvConfig {
    fn default() -> Self {
        Self {
            cv_splits: 5,
            embargo: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub time_decay_gamma: f64,
    /// Learner names; unknown names are dropped with a warning.
    pub learners: Vec<String>,
    pub ensemble_trials: usize,
    pub seed: u64,
    pub feature_set: FeatureSet,
    pub workers: usize,
    pub min_rows: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            time_decay_gamma: 0.995,
            learners: LearnerKind::ALL.iter().map(|k| k.name().to_string()).collect(),
            ensemble_trials: 60,
            seed: 42,
            feature_set: FeatureSet::Minimal,
            workers: 4,
            min_rows: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub root: PathBuf,
    pub manifest: String,
    pub models_dir: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("state"),
            manifest: capml_core::registry::DEFAULT_MANIFEST.to_string(),
            models_dir: capml_core::registry::DEFAULT_MODELS_DIR.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub risk_mode: RiskMode,
    pub risk_fallback_pct: f64,
    pub risk_max_pct: f64,
    pub stop_atr_mult: f64,
    pub fallback_equity: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_mode: RiskMode::Auto,
            risk_fallback_pct: 0.5,
            risk_max_pct: 1.0,
            stop_atr_mult: 2.0,
            fallback_equity: 10_000.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    pub dry_run: bool,
    pub allow_short: bool,
    pub loop_min_sleep_secs: u64,
    pub bar_align_fraction: f64,
    pub min_artifacts: usize,
    pub recent_bars: usize,
    pub state_dir: PathBuf,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            dry_run: true,
            allow_short: false,
            loop_min_sleep_secs: 15,
            bar_align_fraction: 0.2,
            min_artifacts: 1,
            recent_bars: 300,
            state_dir: PathBuf::from("state"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrequencyConfig {
    pub target_per_day: u32,
    pub k: f64,
    pub tau_min: f64,
    pub tau_max: f64,
    /// Hard daily cap; defaults to three times the target.
    pub max_per_day: Option<u32>,
}

impl Default for FrequencyConfig {
    fn default() -> Self {
        Self {
            target_per_day: 4,
            k: 0.05,
            tau_min: 0.5,
            tau_max: 0.8,
            max_per_day: None,
        }
    }
}

impl FrequencyConfig {
    pub fn daily_cap(&self) -> u32 {
        self.max_per_day.unwrap_or(self.target_per_day.saturating_mul(3))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub base_url: String,
    pub api_key_env: String,
    pub identifier_env: String,
    pub password_env: String,
    pub session_ttl_secs: u64,
    pub auth_cooldown_secs: u64,
    pub timeout_secs: u64,
    pub epic_overrides: BTreeMap<String, String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            base_url: capml_core::data::capital::DEMO_URL.to_string(),
            api_key_env: "CAPITAL_API_KEY".to_string(),
            identifier_env: "CAPITAL_IDENTIFIER".to_string(),
            password_env: "CAPITAL_PASSWORD".to_string(),
            session_ttl_secs: 540,
            auth_cooldown_secs: 600,
            timeout_secs: 30,
            epic_overrides: BTreeMap::new(),
        }
    }
}

// ─── BotConfig ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub universe: UniverseConfig,
    pub data: DataConfig,
    pub labeling: LabelingConfig,
    pub cv: CvConfig,
    pub training: TrainingConfig,
    pub registry: RegistryConfig,
    pub risk: RiskConfig,
    pub live: LiveConfig,
    pub frequency: FrequencyConfig,
    pub broker: BrokerConfig,
}

impl BotConfig {
    /// Load and validate a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: BotConfig = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.universe.symbols.is_empty() {
            return invalid("universe.symbols is empty".into());
        }
        if self.universe.timeframes.is_empty() {
            return invalid("universe.timeframes is empty".into());
        }
        if self.data.page_size == 0 || self.data.max_total == 0 {
            return invalid("data.page_size and data.max_total must be positive".into());
        }
        let gamma = self.training.time_decay_gamma;
        if !(gamma > 0.0 && gamma <= 1.0) {
            return invalid(format!("training.time_decay_gamma {gamma} outside (0, 1]"));
        }
        if self.cv.cv_splits < 2 {
            return invalid(format!("cv.cv_splits must be >= 2, got {}", self.cv.cv_splits));
        }
        if self.labeling.max_holding == 0 {
            return invalid("labeling.max_holding must be positive".into());
        }
        if !(self.labeling.pt_mult > 0.0 && self.labeling.sl_mult > 0.0) {
            return invalid("labeling.pt_mult and labeling.sl_mult must be positive".into());
        }
        if self.learner_kinds().is_empty() {
            return invalid("training.learners names no known learner".into());
        }
        let f = &self.frequency;
        if f.tau_min > f.tau_max {
            return invalid(format!("frequency.tau_min {} > tau_max {}", f.tau_min, f.tau_max));
        }
        if !(0.0..=1.0).contains(&f.tau_min) || !(0.0..=1.0).contains(&f.tau_max) {
            return invalid("frequency thresholds must lie in [0, 1]".into());
        }
        for (name, pct) in [
            ("risk.risk_fallback_pct", self.risk.risk_fallback_pct),
            ("risk.risk_max_pct", self.risk.risk_max_pct),
        ] {
            if !(pct > 0.0 && pct <= 100.0) {
                return invalid(format!("{name} {pct} outside (0, 100]"));
            }
        }
        if !(self.risk.stop_atr_mult > 0.0) {
            return invalid("risk.stop_atr_mult must be positive".into());
        }
        if !(self.live.bar_align_fraction > 0.0 && self.live.bar_align_fraction <= 1.0) {
            return invalid("live.bar_align_fraction outside (0, 1]".into());
        }
        Ok(())
    }

    /// Configured learners, deduplicated, unknown names dropped.
    pub fn learner_kinds(&self) -> Vec<LearnerKind> {
        let mut kinds = Vec::new();
        for name in &self.training.learners {
            match LearnerKind::from_name(name) {
                Some(k) if !kinds.contains(&k) => kinds.push(k),
                Some(_) => {}
                None => warn!(learner = %name, "unknown learner dropped"),
            }
        }
        kinds
    }

    pub fn embargo(&self) -> usize {
        self.cv.embargo.unwrap_or(self.labeling.max_holding)
    }

    pub fn triple_barrier(&self) -> TripleBarrierParams {
        TripleBarrierParams {
            pt_mult: self.labeling.pt_mult,
            sl_mult: self.labeling.sl_mult,
            max_holding: self.labeling.max_holding,
        }
    }

    pub fn paging(&self) -> PagingConfig {
        PagingConfig {
            page_size: self.data.page_size,
            max_total: self.data.max_total,
            page_sleep: Duration::from_millis(self.data.page_sleep_ms),
            max_retries: self.data.max_retries,
            ..PagingConfig::default()
        }
    }

    pub fn gate(&self) -> GateConfig {
        GateConfig {
            min_artifacts: self.live.min_artifacts,
            allow_short: self.live.allow_short,
            ..GateConfig::default()
        }
    }

    pub fn capital_settings(&self) -> CapitalSettings {
        CapitalSettings {
            base_url: self.broker.base_url.clone(),
            session_ttl: Duration::from_secs(self.broker.session_ttl_secs),
            timeout: Duration::from_secs(self.broker.timeout_secs),
            max_retries: self.data.max_retries,
            ..CapitalSettings::default()
        }
    }

    pub fn epic_overrides(&self) -> HashMap<String, String> {
        self.broker.epic_overrides.clone().into_iter().collect()
    }

    /// Read broker credentials from the configured environment variables.
    pub fn credentials_from_env(&self) -> Result<CapitalCredentials, ConfigError> {
        let var = |name: &str| std::env::var(name).map_err(|_| ConfigError::MissingEnv(name.to_string()));
        Ok(CapitalCredentials {
            api_key: var(&self.broker.api_key_env)?,
            identifier: var(&self.broker.identifier_env)?,
            password: var(&self.broker.password_env)?,
        })
    }

    /// Every configured `(symbol, timeframe)` pair, symbol-major.
    pub fn pairs(&self) -> Vec<(String, Timeframe)> {
        self.universe
            .symbols
            .iter()
            .flat_map(|s| self.universe.timeframes.iter().map(move |tf| (s.clone(), *tf)))
            .collect()
    }
}
