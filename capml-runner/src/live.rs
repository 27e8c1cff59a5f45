//! Live Loop: wall-clock scheduler driving store → gate → sizer → router.
//!
//! Single-threaded. Every pass first runs housekeeping (expiry,
//! reconciliation in live mode, hourly τ calibration), then visits each
//! `(symbol, tf)` whose interval has elapsed. Per-pair problems come back as
//! an [`IterationOutcome`]; nothing a single pair does stops the loop.

use crate::config::BotConfig;
use crate::frequency::FrequencyController;
use crate::positions::{OpenFill, PositionBook, PositionError};
use crate::router::{OrderRouter, RefusalReason};
use capml_core::data::{Broker, CandleStore, EpicResolver};
use capml_core::domain::{pair_key, Side, Timeframe};
use capml_core::gate::{Action, DecisionGate, HoldReason};
use capml_core::registry::{ModelRegistry, RegistryError};
use capml_core::sizing::{build_sizer, Sizer};
use capml_core::SkipReason;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Upper bound on a single sleep slice, so a stop request is seen promptly.
const SLEEP_SLICE: std::time::Duration = std::time::Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum LiveError {
    #[error(transparent)]
    Position(#[from] PositionError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("state I/O: {0}")]
    Io(#[from] io::Error),
}

/// What one `(symbol, tf)` visit did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IterationOutcome {
    NotDue,
    AlreadyOpen,
    Skipped { reason: SkipReason },
    Hold { reason: HoldReason },
    Refused { reason: RefusalReason },
    Routed {
        side: Side,
        qty: f64,
        broker_ref: Option<String>,
        p_hat: f64,
        threshold: f64,
        dry_run: bool,
    },
    RouterFailed { error: String },
    Failed { error: String },
}

impl IterationOutcome {
    pub fn label(&self) -> String {
        match self {
            IterationOutcome::NotDue => "not_due".into(),
            IterationOutcome::AlreadyOpen => "already_open".into(),
            IterationOutcome::Skipped { reason } => format!("skip({reason})"),
            IterationOutcome::Hold { reason } => format!("hold({reason})"),
            IterationOutcome::Refused { reason } => format!("refused({reason})"),
            IterationOutcome::Routed { side, qty, .. } => format!("routed({side} {qty})"),
            IterationOutcome::RouterFailed { error } => format!("router_failed({error})"),
            IterationOutcome::Failed { error } => format!("fail({error})"),
        }
    }
}

/// Totals across a `run`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopSummary {
    pub iterations: usize,
    pub visits: usize,
    pub routed: usize,
    pub failures: usize,
}

pub struct LiveLoop {
    config: BotConfig,
    broker: Arc<dyn Broker>,
    store: Arc<CandleStore>,
    registry: Arc<ModelRegistry>,
    gate: DecisionGate,
    sizer: Box<dyn Sizer>,
    router: OrderRouter,
    book: PositionBook,
    frequency: FrequencyController,
    pairs: Vec<(String, Timeframe)>,
    next_due: HashMap<String, DateTime<Utc>>,
    stop: Arc<AtomicBool>,
}

impl LiveLoop {
    /// Open the state files under `config.live.state_dir` and wire the
    /// components for `pairs`.
    pub fn new(
        config: BotConfig,
        broker: Arc<dyn Broker>,
        store: Arc<CandleStore>,
        registry: Arc<ModelRegistry>,
        epics: Arc<EpicResolver>,
        pairs: Vec<(String, Timeframe)>,
        now: DateTime<Utc>,
    ) -> Result<Self, LiveError> {
        let state_dir = config.live.state_dir.clone();
        std::fs::create_dir_all(&state_dir)?;
        let book = PositionBook::open(&state_dir)?;
        let frequency = FrequencyController::open(&state_dir, config.frequency.clone(), now)?;
        let gate = DecisionGate::new(registry.clone(), config.gate());
        let sizer = build_sizer(
            config.risk.risk_mode,
            config.risk.risk_fallback_pct,
            config.risk.risk_max_pct,
            config.risk.stop_atr_mult,
        );
        let router = OrderRouter::new(broker.clone(), epics, config.live.dry_run);
        Ok(Self {
            config,
            broker,
            store,
            registry,
            gate,
            sizer,
            router,
            book,
            frequency,
            pairs,
            next_due: HashMap::new(),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flag checked between pairs and between sleep slices.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn book(&self) -> &PositionBook {
        &self.book
    }

    pub fn frequency(&self) -> &FrequencyController {
        &self.frequency
    }

    pub fn pairs(&self) -> &[(String, Timeframe)] {
        &self.pairs
    }

    /// `max(bar_seconds · bar_align_fraction, loop_min_sleep)`.
    pub fn interval(&self, timeframe: Timeframe) -> Duration {
        let aligned = timeframe.bar_seconds() as f64 * self.config.live.bar_align_fraction;
        let floor = self.config.live.loop_min_sleep_secs as f64;
        Duration::milliseconds((aligned.max(floor) * 1000.0).round() as i64)
    }

    fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Run passes until stopped or `max_iterations` passes have completed.
    pub fn run(&mut self, max_iterations: Option<usize>) -> LoopSummary {
        let mut summary = LoopSummary::default();
        info!(
            pairs = self.pairs.len(),
            dry_run = self.router.is_dry_run(),
            "live loop started"
        );
        while !self.is_stopped() {
            let results = self.run_once(Utc::now());
            summary.iterations += 1;
            for (_, outcome) in &results {
                match outcome {
                    IterationOutcome::NotDue => continue,
                    IterationOutcome::Routed { .. } => summary.routed += 1,
                    IterationOutcome::Failed { .. } | IterationOutcome::RouterFailed { .. } => summary.failures += 1,
                    _ => {}
                }
                summary.visits += 1;
            }
            if max_iterations.is_some_and(|max| summary.iterations >= max) {
                break;
            }
            self.sleep_until_next_due();
        }
        info!(
            iterations = summary.iterations,
            routed = summary.routed,
            failures = summary.failures,
            "live loop stopped"
        );
        summary
    }

    fn sleep_until_next_due(&self) {
        let now = Utc::now();
        let wake = self
            .next_due
            .values()
            .min()
            .copied()
            .unwrap_or(now + Duration::seconds(self.config.live.loop_min_sleep_secs as i64));
        let mut remaining = (wake - now).to_std().unwrap_or_default();
        while !remaining.is_zero() && !self.is_stopped() {
            let slice = remaining.min(SLEEP_SLICE);
            std::thread::sleep(slice);
            remaining = remaining.saturating_sub(slice);
        }
    }

    /// One pass: housekeeping, then every pair in order.
    pub fn run_once(&mut self, now: DateTime<Utc>) -> Vec<(String, IterationOutcome)> {
        self.housekeeping(now);
        let pairs = self.pairs.clone();
        let mut results = Vec::with_capacity(pairs.len());
        for (symbol, tf) in pairs {
            if self.is_stopped() {
                break;
            }
            let outcome = self.step_pair(&symbol, tf, now);
            if outcome != IterationOutcome::NotDue {
                info!(key = %pair_key(&symbol, tf), outcome = %outcome.label(), "pair visited");
            }
            results.push((pair_key(&symbol, tf), outcome));
        }
        results
    }

    /// Expire held positions, reconcile with the broker (live mode only) and
    /// calibrate thresholds when due. Failures are logged, not raised.
    pub fn housekeeping(&mut self, now: DateTime<Utc>) {
        if let Err(e) = self.frequency.roll_day(now) {
            warn!(error = %e, "frequency state not saved");
        }
        match self.book.expire(self.config.labeling.max_holding, now) {
            Ok(closed) if !closed.is_empty() => info!(count = closed.len(), "positions expired"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "expiry failed"),
        }
        if !self.router.is_dry_run() && self.book.open_count() > 0 {
            match self.broker.open_epics() {
                Ok(open) => match self.book.reconcile(&open, now) {
                    Ok(closed) if !closed.is_empty() => info!(count = closed.len(), "positions reconciled"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "reconciliation failed"),
                },
                Err(e) => warn!(error = %e, "broker positions unavailable"),
            }
        }
        let keys: Vec<String> = self.pairs.iter().map(|(s, tf)| pair_key(s, *tf)).collect();
        if let Err(e) = self.frequency.calibrate(&self.registry, &keys, now) {
            warn!(error = %e, "threshold calibration failed");
        }
    }

    /// Visit `(symbol, tf)` if its interval has elapsed.
    pub fn step_pair(&mut self, symbol: &str, timeframe: Timeframe, now: DateTime<Utc>) -> IterationOutcome {
        let key = pair_key(symbol, timeframe);
        if self.next_due.get(&key).is_some_and(|due| now < *due) {
            return IterationOutcome::NotDue;
        }
        let interval = self.interval(timeframe);
        self.next_due.insert(key, now + interval);
        match self.visit(symbol, timeframe, now) {
            Ok(outcome) => outcome,
            Err(e) => IterationOutcome::Failed { error: e.to_string() },
        }
    }

    fn visit(&mut self, symbol: &str, timeframe: Timeframe, now: DateTime<Utc>) -> Result<IterationOutcome, LiveError> {
        if self.book.is_open(symbol, timeframe) {
            return Ok(IterationOutcome::AlreadyOpen);
        }

        let candles = match self.store.candles_at(symbol, timeframe, self.config.live.recent_bars, now) {
            Ok(c) if c.is_empty() => return Ok(IterationOutcome::Skipped { reason: SkipReason::NoData }),
            Ok(c) => c,
            Err(e) if e.is_broker_unavailable() => {
                return Ok(IterationOutcome::Skipped {
                    reason: SkipReason::BrokerUnavailable,
                })
            }
            Err(e) => return Ok(IterationOutcome::Failed { error: e.to_string() }),
        };

        let entry = match self.registry.latest(symbol, timeframe) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                return Ok(IterationOutcome::Hold {
                    reason: HoldReason::NoRegistryEntry,
                })
            }
            Err(e) => {
                warn!(symbol, tf = %timeframe, error = %e, "registry unreadable");
                return Ok(IterationOutcome::Hold {
                    reason: HoldReason::RegistryUnreadable,
                });
            }
        };
        let decision = self.gate.decide_with_entry(&entry, &candles);
        let side = match decision.action {
            Action::Buy => Side::Buy,
            Action::Sell => Side::Sell,
            Action::Hold => {
                return Ok(IterationOutcome::Hold {
                    reason: decision.reason.unwrap_or(HoldReason::BelowThreshold),
                })
            }
        };
        let p_hat = decision.p_hat.unwrap_or(decision.confidence);
        let threshold = decision.threshold.unwrap_or(entry.threshold);
        debug!(symbol, tf = %timeframe, side = %side, p_hat, threshold, "actionable decision");

        if self.frequency.is_throttled(&entry.key) {
            return self.refuse(symbol, timeframe, side, RefusalReason::Throttled, now);
        }

        let equity = self.equity();
        let size = self.sizer.size(equity, &candles, &entry.cv_metrics);
        if !(size.qty > 0.0) {
            return self.refuse(symbol, timeframe, side, RefusalReason::ZeroSize, now);
        }

        let routed = self.router.route(&self.book, symbol, side.as_str(), size.qty, timeframe);
        if routed.ok {
            let fill = OpenFill {
                direction: side,
                size: size.qty,
                epic: routed.epic.clone(),
                broker_ref: routed.broker_ref.clone(),
                dry_run: routed.dry_run,
            };
            self.book.record_open(symbol, timeframe, fill, now)?;
            self.frequency.record_trade(&entry.key, now)?;
            return Ok(IterationOutcome::Routed {
                side,
                qty: size.qty,
                broker_ref: routed.broker_ref,
                p_hat,
                threshold,
                dry_run: routed.dry_run,
            });
        }
        match (routed.reason, routed.error) {
            (Some(reason), _) => self.refuse(symbol, timeframe, side, reason, now),
            (None, error) => Ok(IterationOutcome::RouterFailed {
                error: error.unwrap_or_else(|| "unknown router error".into()),
            }),
        }
    }

    fn refuse(
        &mut self,
        symbol: &str,
        timeframe: Timeframe,
        side: Side,
        reason: RefusalReason,
        now: DateTime<Utc>,
    ) -> Result<IterationOutcome, LiveError> {
        if reason != RefusalReason::AlreadyOpen {
            self.book.record_reject(symbol, timeframe, side, reason.code(), now)?;
        }
        Ok(IterationOutcome::Refused { reason })
    }

    /// Broker equity, or the configured fallback when the broker can't say.
    fn equity(&self) -> f64 {
        match self.broker.account_equity() {
            Ok(e) if e.is_finite() && e > 0.0 => e,
            Ok(_) => self.config.risk.fallback_equity,
            Err(e) => {
                debug!(error = %e, "equity unavailable; using fallback");
                self.config.risk.fallback_equity
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capml_core::data::{synthetic_candles, MockBroker, PagingConfig};
    use chrono::TimeZone;

    fn test_loop(dir: &std::path::Path, broker: MockBroker, pairs: Vec<(String, Timeframe)>) -> LiveLoop {
        let mut config = BotConfig::default();
        config.live.state_dir = dir.join("state");
        config.registry.root = dir.join("state");
        let broker: Arc<dyn Broker> = Arc::new(broker);
        let epics = Arc::new(EpicResolver::new(HashMap::new()));
        let store = Arc::new(CandleStore::new(broker.clone(), epics.clone(), PagingConfig::default()));
        let registry = Arc::new(ModelRegistry::open(dir.join("state")));
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        LiveLoop::new(config, broker, store, registry, epics, pairs, now).unwrap()
    }

    #[test]
    fn interval_respects_floor_and_bar_fraction() {
        let dir = tempfile::tempdir().unwrap();
        let live = test_loop(dir.path(), MockBroker::new(), Vec::new());
        assert_eq!(live.interval(Timeframe::M1), Duration::seconds(15));
        assert_eq!(live.interval(Timeframe::H1), Duration::seconds(720));
    }

    #[test]
    fn pair_is_not_revisited_before_interval() {
        let dir = tempfile::tempdir().unwrap();
        let mut live = test_loop(dir.path(), MockBroker::new(), Vec::new());
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let first = live.step_pair("NOPE", Timeframe::H1, t0);
        assert_ne!(first, IterationOutcome::NotDue);
        assert_eq!(live.step_pair("NOPE", Timeframe::H1, t0 + Duration::seconds(60)), IterationOutcome::NotDue);
        assert_ne!(
            live.step_pair("NOPE", Timeframe::H1, t0 + Duration::seconds(720)),
            IterationOutcome::NotDue
        );
    }

    #[test]
    fn missing_model_holds() {
        let dir = tempfile::tempdir().unwrap();
        let candles = synthetic_candles(400, Timeframe::H1, 5);
        let broker = MockBroker::new()
            .with_epic("X", "X.EPIC")
            .with_series("X.EPIC", candles)
            .ignoring_paging();
        let mut live = test_loop(dir.path(), broker, vec![("X".into(), Timeframe::H1)]);
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let out = live.run_once(t);
        assert_eq!(
            out,
            vec![(
                "X__1h".to_string(),
                IterationOutcome::Hold {
                    reason: HoldReason::NoRegistryEntry
                }
            )]
        );
    }

    #[test]
    fn unavailable_broker_is_a_skip() {
        let dir = tempfile::tempdir().unwrap();
        let broker = MockBroker::new().with_epic("X", "X.EPIC");
        broker.set_available(false);
        let mut live = test_loop(dir.path(), broker, vec![("X".into(), Timeframe::H1)]);
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let (_, outcome) = live.run_once(t).remove(0);
        assert_eq!(
            outcome,
            IterationOutcome::Skipped {
                reason: SkipReason::BrokerUnavailable
            }
        );
    }

    #[test]
    fn stop_flag_ends_run_before_first_pass() {
        let dir = tempfile::tempdir().unwrap();
        let mut live = test_loop(dir.path(), MockBroker::new(), vec![("X".into(), Timeframe::H1)]);
        live.stop_handle().store(true, Ordering::SeqCst);
        assert_eq!(live.run(None).iterations, 0);
    }

    #[test]
    fn stop_from_another_thread_cuts_the_sleep_short() {
        let dir = tempfile::tempdir().unwrap();
        let mut live = test_loop(dir.path(), MockBroker::new(), vec![("X".into(), Timeframe::H1)]);
        let stop = live.stop_handle();
        let signal = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(300));
            stop.store(true, Ordering::SeqCst);
        });
        let started = std::time::Instant::now();
        // the next H1 visit is 12 minutes away
        let summary = live.run(None);
        signal.join().unwrap();
        assert_eq!(summary.iterations, 1);
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }

    #[test]
    fn bounded_run_stops_after_max_iterations() {
        let dir = tempfile::tempdir().unwrap();
        let mut live = test_loop(dir.path(), MockBroker::new(), vec![("X".into(), Timeframe::H1)]);
        let summary = live.run(Some(1));
        assert_eq!(summary.iterations, 1);
        assert_eq!(summary.visits, 1);
    }

    #[test]
    fn outcome_labels() {
        assert_eq!(IterationOutcome::NotDue.label(), "not_due");
        assert_eq!(
            IterationOutcome::Refused {
                reason: RefusalReason::Throttled
            }
            .label(),
            "refused(throttled)"
        );
    }
}
