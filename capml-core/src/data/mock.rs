//! In-memory broker and synthetic candles for tests, benches and offline runs.

use super::provider::{Broker, DataError, DealConfirmation, OpenPositionRequest, PageRequest};
use crate::domain::{Candle, Timeframe};
use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Deterministic random-walk candles with a slow cycle, starting 2024-01-01 UTC.
pub fn synthetic_candles(n: usize, tf: Timeframe, seed: u64) -> Vec<Candle> {
    let mut rng = StdRng::seed_from_u64(seed);
    let start: DateTime<Utc> = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_default();
    let step = Duration::seconds(tf.bar_seconds() as i64);
    let mut close = 100.0_f64;
    (0..n)
        .map(|i| {
            let open = close;
            let cycle = (i as f64 / 40.0).sin() * 0.004;
            let shock: f64 = rng.gen_range(-0.006..0.006);
            close = (open * (1.0 + cycle + shock)).max(1.0);
            let wick: f64 = rng.gen_range(0.0..0.003);
            Candle {
                time: start + step * i as i32,
                open,
                high: open.max(close) * (1.0 + wick),
                low: open.min(close) * (1.0 - wick),
                close,
                volume: rng.gen_range(100.0..1000.0),
            }
        })
        .collect()
}

#[derive(Default)]
pub struct MockBroker {
    series: HashMap<String, Vec<Candle>>,
    epics: HashMap<String, String>,
    ignore_paging: bool,
    equity: f64,
    reject_orders: Option<String>,
    unavailable: AtomicBool,
    transient_failures: AtomicU32,
    pages_served: AtomicUsize,
    searches: AtomicUsize,
    orders: Mutex<Vec<OpenPositionRequest>>,
    open: Mutex<Vec<String>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self {
            equity: 10_000.0,
            ..Self::default()
        }
    }

    pub fn with_epic(mut self, symbol: &str, epic: &str) -> Self {
        self.epics.insert(symbol.to_string(), epic.to_string());
        self
    }

    pub fn with_series(mut self, epic: &str, candles: Vec<Candle>) -> Self {
        self.series.insert(epic.to_string(), candles);
        self
    }

    /// Serve the newest page regardless of the requested page.
    pub fn ignoring_paging(mut self) -> Self {
        self.ignore_paging = true;
        self
    }

    pub fn with_equity(mut self, equity: f64) -> Self {
        self.equity = equity;
        self
    }

    pub fn rejecting_orders(mut self, reason: &str) -> Self {
        self.reject_orders = Some(reason.to_string());
        self
    }

    /// Fail the next `n` page fetches with a 503.
    pub fn with_transient_failures(self, n: u32) -> Self {
        self.transient_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Simulate the broker closing a position (stop hit, manual close).
    pub fn close_epic(&self, epic: &str) {
        self.open.lock().unwrap().retain(|e| e != epic);
    }

    pub fn pages_served(&self) -> usize {
        self.pages_served.load(Ordering::SeqCst)
    }

    pub fn search_count(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }

    pub fn orders(&self) -> Vec<OpenPositionRequest> {
        self.orders.lock().unwrap().clone()
    }
}

impl Broker for MockBroker {
    fn name(&self) -> &str {
        "mock"
    }

    fn fetch_page(&self, req: &PageRequest<'_>) -> Result<Vec<Candle>, DataError> {
        if !self.is_available() {
            return Err(DataError::CircuitBreakerTripped);
        }
        if self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(DataError::ServerError { status: 503 });
        }
        let series = self.series.get(req.epic).ok_or_else(|| DataError::SymbolNotFound {
            symbol: req.epic.to_string(),
        })?;
        self.pages_served.fetch_add(1, Ordering::SeqCst);

        let eligible: &[Candle] = match (self.ignore_paging, req.before) {
            (false, Some(before)) => {
                let end = series.partition_point(|c| c.time < before);
                &series[..end]
            }
            _ => series,
        };
        let start = eligible.len().saturating_sub(req.page_size);
        Ok(eligible[start..].to_vec())
    }

    fn search_epic(&self, symbol: &str) -> Result<Option<String>, DataError> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        Ok(self.epics.get(symbol).cloned())
    }

    fn open_position(&self, req: &OpenPositionRequest) -> Result<DealConfirmation, DataError> {
        if !self.is_available() {
            return Err(DataError::CircuitBreakerTripped);
        }
        if let Some(reason) = &self.reject_orders {
            return Err(DataError::Rejected(reason.clone()));
        }
        let mut orders = self.orders.lock().unwrap();
        orders.push(req.clone());
        self.open.lock().unwrap().push(req.epic.clone());
        Ok(DealConfirmation {
            deal_reference: format!("MOCK-{}", orders.len()),
        })
    }

    fn open_epics(&self) -> Result<Vec<String>, DataError> {
        Ok(self.open.lock().unwrap().clone())
    }

    fn account_equity(&self) -> Result<f64, DataError> {
        if !self.is_available() {
            return Err(DataError::CircuitBreakerTripped);
        }
        Ok(self.equity)
    }

    fn is_available(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }
}
