//! Frequency Controller: a slow outer loop on decision thresholds.
//!
//! Tracks trades per `(symbol, tf)` within the current UTC day, resets on
//! date change, throttles pairs at their daily cap, and once an hour nudges
//! each pair's τ toward its daily target:
//!
//! `τ' = clip(τ − k · (target − count) / max(target, 1), τ_min, τ_max)`
//!
//! Updated thresholds are written back to the registry, which the live loop
//! re-reads on every decision.

use crate::config::FrequencyConfig;
use capml_core::persist::{read_json, write_json_atomic};
use capml_core::registry::{ModelRegistry, RegistryError};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const FREQUENCY_FILE: &str = "frequency.json";

/// New threshold after one calibration step.
pub fn calibrated_threshold(tau: f64, target: u32, count: u32, k: f64, tau_min: f64, tau_max: f64) -> f64 {
    let gap = f64::from(target) - f64::from(count);
    (tau - k * gap / f64::from(target.max(1))).clamp(tau_min, tau_max)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PairTally {
    pub count: u32,
    pub target: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrequencyState {
    pub date: NaiveDate,
    pub last_calibration: Option<DateTime<Utc>>,
    pub pairs: BTreeMap<String, PairTally>,
}

impl FrequencyState {
    fn new(date: NaiveDate) -> Self {
        Self {
            date,
            last_calibration: None,
            pairs: BTreeMap::new(),
        }
    }
}

/// One threshold change made during calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdUpdate {
    pub key: String,
    pub old: f64,
    pub new: f64,
    pub count: u32,
    pub target: u32,
}

pub struct FrequencyController {
    path: PathBuf,
    config: FrequencyConfig,
    state: FrequencyState,
}

impl FrequencyController {
    /// Load `frequency.json` from `state_dir`, rolling to `now`'s date.
    pub fn open(state_dir: &Path, config: FrequencyConfig, now: DateTime<Utc>) -> io::Result<Self> {
        let path = state_dir.join(FREQUENCY_FILE);
        let state = read_json(&path)?.unwrap_or_else(|| FrequencyState::new(now.date_naive()));
        let mut controller = Self { path, config, state };
        controller.roll_day(now)?;
        Ok(controller)
    }

    pub fn state(&self) -> &FrequencyState {
        &self.state
    }

    /// Trades recorded today for `key`.
    pub fn count(&self, key: &str) -> u32 {
        self.state.pairs.get(key).map_or(0, |t| t.count)
    }

    pub fn is_throttled(&self, key: &str) -> bool {
        self.count(key) >= self.config.daily_cap()
    }

    /// Reset every tally when the UTC date changes. Returns whether it reset.
    pub fn roll_day(&mut self, now: DateTime<Utc>) -> io::Result<bool> {
        let today = now.date_naive();
        if self.state.date == today {
            return Ok(false);
        }
        info!(from = %self.state.date, to = %today, "daily trade tallies reset");
        self.state.date = today;
        for tally in self.state.pairs.values_mut() {
            tally.count = 0;
        }
        self.save()?;
        Ok(true)
    }

    pub fn record_trade(&mut self, key: &str, now: DateTime<Utc>) -> io::Result<u32> {
        self.roll_day(now)?;
        let target = self.config.target_per_day;
        let tally = self.state.pairs.entry(key.to_string()).or_insert(PairTally { count: 0, target });
        tally.count += 1;
        let count = tally.count;
        self.save()?;
        debug!(key, count, "trade tallied");
        Ok(count)
    }

    /// Whether an hour has passed since the last calibration.
    pub fn calibration_due(&self, now: DateTime<Utc>) -> bool {
        self.state
            .last_calibration
            .map_or(true, |t| now - t >= Duration::hours(1))
    }

    /// Run one calibration pass over `keys` when due. Keys without a registry
    /// entry are ignored.
    pub fn calibrate(
        &mut self,
        registry: &ModelRegistry,
        keys: &[String],
        now: DateTime<Utc>,
    ) -> Result<Vec<ThresholdUpdate>, RegistryError> {
        if !self.calibration_due(now) {
            return Ok(Vec::new());
        }
        self.roll_day(now)?;
        let manifest = registry.load_manifest()?;
        let mut updates = Vec::new();
        for key in keys {
            let Some(entry) = manifest.latest(key) else {
                continue;
            };
            let count = self.count(key);
            let target = self
                .state
                .pairs
                .get(key)
                .map_or(self.config.target_per_day, |t| t.target);
            let new = calibrated_threshold(
                entry.threshold,
                target,
                count,
                self.config.k,
                self.config.tau_min,
                self.config.tau_max,
            );
            if (new - entry.threshold).abs() > 1e-12 {
                registry.update_threshold(key, new)?;
                info!(key = %key, old = entry.threshold, new, count, target, "threshold calibrated");
                updates.push(ThresholdUpdate {
                    key: key.clone(),
                    old: entry.threshold,
                    new,
                    count,
                    target,
                });
            }
        }
        self.state.last_calibration = Some(now);
        self.save()?;
        Ok(updates)
    }

    fn save(&self) -> io::Result<()> {
        write_json_atomic(&self.path, &self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, day, hour, 0, 0).unwrap()
    }

    #[test]
    fn calibration_formula() {
        // no trades against a target of 4 lowers τ by k
        assert!((calibrated_threshold(0.7, 4, 0, 0.05, 0.5, 0.8) - 0.65).abs() < 1e-12);
        // overshooting raises it
        assert!((calibrated_threshold(0.6, 4, 8, 0.05, 0.5, 0.8) - 0.65).abs() < 1e-12);
        // on target: unchanged
        assert_eq!(calibrated_threshold(0.6, 4, 4, 0.05, 0.5, 0.8), 0.6);
        // clipped
        assert_eq!(calibrated_threshold(0.51, 4, 0, 0.05, 0.5, 0.8), 0.5);
        assert_eq!(calibrated_threshold(0.79, 1, 10, 0.05, 0.5, 0.8), 0.8);
        // zero target behaves as target 1
        assert!((calibrated_threshold(0.6, 0, 1, 0.05, 0.5, 0.8) - 0.65).abs() < 1e-12);
    }

    #[test]
    fn tallies_reset_on_new_day() {
        let dir = tempfile::tempdir().unwrap();
        let mut fc = FrequencyController::open(dir.path(), FrequencyConfig::default(), at(3, 9)).unwrap();
        fc.record_trade("X__1h", at(3, 10)).unwrap();
        fc.record_trade("X__1h", at(3, 11)).unwrap();
        assert_eq!(fc.count("X__1h"), 2);

        let reopened = FrequencyController::open(dir.path(), FrequencyConfig::default(), at(3, 12)).unwrap();
        assert_eq!(reopened.count("X__1h"), 2);

        fc.record_trade("X__1h", at(4, 0)).unwrap();
        assert_eq!(fc.count("X__1h"), 1);
        assert_eq!(fc.state().date, at(4, 0).date_naive());
    }

    #[test]
    fn throttles_at_daily_cap() {
        let dir = tempfile::tempdir().unwrap();
        let config = FrequencyConfig {
            max_per_day: Some(2),
            ..FrequencyConfig::default()
        };
        let mut fc = FrequencyController::open(dir.path(), config, at(3, 0)).unwrap();
        assert!(!fc.is_throttled("K"));
        fc.record_trade("K", at(3, 1)).unwrap();
        fc.record_trade("K", at(3, 2)).unwrap();
        assert!(fc.is_throttled("K"));
        assert!(!fc.is_throttled("other"));
    }

    #[test]
    fn calibration_is_hourly() {
        let dir = tempfile::tempdir().unwrap();
        let mut fc = FrequencyController::open(dir.path(), FrequencyConfig::default(), at(3, 0)).unwrap();
        assert!(fc.calibration_due(at(3, 0)));
        fc.state.last_calibration = Some(at(3, 0));
        assert!(!fc.calibration_due(at(3, 0) + Duration::minutes(59)));
        assert!(fc.calibration_due(at(3, 1)));
    }
}
