//! Candle Store: paged broker fetch behind an on-disk cache.

use super::cache::CandleCache;
use super::epic::EpicResolver;
use super::provider::{Broker, DataError, PageRequest};
use crate::domain::{normalize_candles, Candle, Timeframe};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Paging contract for history fetches.
#[derive(Debug, Clone)]
pub struct PagingConfig {
    pub page_size: usize,
    /// Upper bound on candles assembled per request.
    pub max_total: usize,
    pub page_sleep: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self {
            page_size: 1000,
            max_total: 3000,
            page_sleep: Duration::from_millis(250),
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
        }
    }
}

pub struct CandleStore {
    broker: Arc<dyn Broker>,
    epics: Arc<EpicResolver>,
    cache: Option<CandleCache>,
    paging: PagingConfig,
    max_age: Option<chrono::Duration>,
}

impl CandleStore {
    pub fn new(broker: Arc<dyn Broker>, epics: Arc<EpicResolver>, paging: PagingConfig) -> Self {
        Self {
            broker,
            epics,
            cache: None,
            paging,
            max_age: None,
        }
    }

    pub fn with_cache(mut self, cache: CandleCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Override the freshness window (default: one bar of the timeframe).
    pub fn with_max_age(mut self, max_age: chrono::Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn epics(&self) -> &Arc<EpicResolver> {
        &self.epics
    }

    /// The most recent `limit` candles for `(symbol, tf)`, oldest first.
    ///
    /// An empty vector means the broker had no history; callers skip.
    pub fn candles(&self, symbol: &str, tf: Timeframe, limit: usize) -> Result<Vec<Candle>, DataError> {
        self.candles_at(symbol, tf, limit, Utc::now())
    }

    pub fn candles_at(
        &self,
        symbol: &str,
        tf: Timeframe,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Candle>, DataError> {
        let max_age = self
            .max_age
            .unwrap_or_else(|| chrono::Duration::seconds(tf.bar_seconds() as i64));

        if let Some(cache) = &self.cache {
            if cache.is_fresh(symbol, tf, max_age, now) {
                match cache.load(symbol, tf) {
                    Ok(cached) if cached.len() >= limit.min(self.paging.max_total) => {
                        debug!(symbol, tf = %tf, bars = cached.len(), "serving fresh cache");
                        return Ok(tail(cached, limit));
                    }
                    Ok(_) => debug!(symbol, tf = %tf, "fresh cache too short; refetching"),
                    Err(e) => debug!(symbol, tf = %tf, error = %e, "cache miss"),
                }
            }
        }

        let epic = self
            .epics
            .resolve(self.broker.as_ref(), symbol)?
            .ok_or_else(|| DataError::SymbolNotFound {
                symbol: symbol.to_string(),
            })?;

        let fetched = match self.fetch_paged(&epic, tf, limit) {
            Ok(c) => c,
            Err(e @ DataError::NetworkUnreachable(_)) => {
                if let Some(stale) = self.cache.as_ref().and_then(|c| c.load(symbol, tf).ok()) {
                    warn!(symbol, tf = %tf, error = %e, "network down; serving stale cache");
                    return Ok(tail(stale, limit));
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        if fetched.is_empty() {
            return Ok(fetched);
        }
        if fetched.len() < limit.min(self.paging.max_total) {
            info!(symbol, tf = %tf, got = fetched.len(), wanted = limit, "partial history");
        }
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.write(symbol, tf, &fetched) {
                warn!(symbol, tf = %tf, error = %e, "cache write failed");
            }
        }
        Ok(tail(fetched, limit))
    }

    /// Walk pages newest to oldest until enough candles are assembled, the
    /// broker runs dry, or the broker is found to ignore paging.
    pub fn fetch_paged(&self, epic: &str, tf: Timeframe, limit: usize) -> Result<Vec<Candle>, DataError> {
        let target = limit.min(self.paging.max_total);
        let mut pages: Vec<Vec<Candle>> = Vec::new();
        let mut total = 0usize;
        let mut oldest_seen: Option<DateTime<Utc>> = None;

        for page_number in 1.. {
            if total >= target {
                break;
            }
            if page_number > 1 {
                std::thread::sleep(self.paging.page_sleep);
            }
            let req = PageRequest {
                epic,
                timeframe: tf,
                page_size: self.paging.page_size,
                page_number,
                before: oldest_seen,
            };
            let page = normalize_candles(self.fetch_page_with_retry(&req)?);
            let Some(first) = page.first().map(|c| c.time) else {
                break;
            };
            if let Some(prev_first) = oldest_seen {
                if first >= prev_first {
                    debug!(epic, page_number, "broker ignored paging; stopping");
                    break;
                }
            }
            oldest_seen = Some(first);
            total += page.len();
            let short = page.len() < self.paging.page_size;
            pages.push(page);
            if short {
                break;
            }
        }

        let assembled: Vec<Candle> = pages.into_iter().rev().flatten().collect();
        Ok(tail(normalize_candles(assembled), target))
    }

    fn fetch_page_with_retry(&self, req: &PageRequest<'_>) -> Result<Vec<Candle>, DataError> {
        let mut attempt = 0;
        loop {
            match self.broker.fetch_page(req) {
                Ok(page) => return Ok(page),
                Err(e) if e.is_transient() && attempt < self.paging.max_retries => {
                    attempt += 1;
                    warn!(epic = req.epic, attempt, error = %e, "transient fetch error; retrying");
                    std::thread::sleep(self.paging.retry_delay * attempt);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn tail(mut candles: Vec<Candle>, limit: usize) -> Vec<Candle> {
    if candles.len() > limit {
        candles.drain(..candles.len() - limit);
    }
    candles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::cache::CacheFormat;
    use crate::data::mock::{synthetic_candles, MockBroker};
    use std::collections::HashMap;

    fn fast_paging(page_size: usize) -> PagingConfig {
        PagingConfig {
            page_size,
            max_total: 10_000,
            page_sleep: Duration::ZERO,
            max_retries: 2,
            retry_delay: Duration::ZERO,
        }
    }

    fn store_with(broker: MockBroker, page_size: usize) -> (CandleStore, Arc<MockBroker>) {
        let broker = Arc::new(broker);
        let store = CandleStore::new(
            broker.clone(),
            Arc::new(EpicResolver::new(HashMap::new())),
            fast_paging(page_size),
        );
        (store, broker)
    }

    #[test]
    fn assembles_pages_newest_last() {
        let candles = synthetic_candles(250, Timeframe::H1, 3);
        let (store, broker) = store_with(
            MockBroker::new().with_epic("GOLD", "GOLD").with_series("GOLD", candles.clone()),
            100,
        );
        let got = store.candles("GOLD", Timeframe::H1, 220).unwrap();
        assert_eq!(got, candles[30..].to_vec());
        assert_eq!(broker.pages_served(), 3);
    }

    #[test]
    fn stops_when_history_runs_out() {
        let candles = synthetic_candles(150, Timeframe::H1, 3);
        let (store, broker) = store_with(
            MockBroker::new().with_epic("GOLD", "GOLD").with_series("GOLD", candles.clone()),
            100,
        );
        let got = store.candles("GOLD", Timeframe::H1, 1000).unwrap();
        assert_eq!(got, candles);
        assert_eq!(broker.pages_served(), 2);
    }

    #[test]
    fn detects_ignored_paging() {
        let candles = synthetic_candles(300, Timeframe::H1, 3);
        let (store, broker) = store_with(
            MockBroker::new()
                .with_epic("GOLD", "GOLD")
                .with_series("GOLD", candles.clone())
                .ignoring_paging(),
            100,
        );
        let got = store.candles("GOLD", Timeframe::H1, 300).unwrap();
        assert_eq!(got, candles[200..].to_vec());
        assert_eq!(broker.pages_served(), 2);
    }

    #[test]
    fn retries_transient_failures() {
        let candles = synthetic_candles(50, Timeframe::H1, 3);
        let (store, _) = store_with(
            MockBroker::new()
                .with_epic("GOLD", "GOLD")
                .with_series("GOLD", candles.clone())
                .with_transient_failures(2),
            100,
        );
        assert_eq!(store.candles("GOLD", Timeframe::H1, 50).unwrap(), candles);
    }

    #[test]
    fn gives_up_after_bounded_retries() {
        let (store, _) = store_with(
            MockBroker::new()
                .with_epic("GOLD", "GOLD")
                .with_series("GOLD", synthetic_candles(50, Timeframe::H1, 3))
                .with_transient_failures(5),
            100,
        );
        assert!(matches!(
            store.candles("GOLD", Timeframe::H1, 50),
            Err(DataError::ServerError { status: 503 })
        ));
    }

    #[test]
    fn empty_history_is_empty_sequence() {
        let (store, _) = store_with(
            MockBroker::new().with_epic("NEW", "NEW").with_series("NEW", Vec::new()),
            100,
        );
        assert!(store.candles("NEW", Timeframe::H1, 100).unwrap().is_empty());
    }

    #[test]
    fn unresolvable_symbol_is_not_found() {
        let (store, _) = store_with(MockBroker::new(), 100);
        assert!(matches!(
            store.candles("NOPE", Timeframe::H1, 100),
            Err(DataError::SymbolNotFound { .. })
        ));
    }

    #[test]
    fn cooldown_is_raised() {
        let (store, broker) = store_with(
            MockBroker::new()
                .with_epic("GOLD", "GOLD")
                .with_series("GOLD", synthetic_candles(50, Timeframe::H1, 3)),
            100,
        );
        broker.set_available(false);
        assert!(matches!(
            store.candles("GOLD", Timeframe::H1, 50),
            Err(DataError::CircuitBreakerTripped)
        ));
    }

    #[test]
    fn fresh_cache_short_circuits_broker() {
        let dir = std::env::temp_dir().join(format!("capml_store_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let candles = synthetic_candles(120, Timeframe::H1, 3);
        let broker = Arc::new(MockBroker::new().with_epic("GOLD", "GOLD").with_series("GOLD", candles.clone()));
        let store = CandleStore::new(
            broker.clone(),
            Arc::new(EpicResolver::new(HashMap::new())),
            fast_paging(500),
        )
        .with_cache(CandleCache::new(&dir, CacheFormat::Csv))
        .with_max_age(chrono::Duration::hours(1));

        assert_eq!(store.candles("GOLD", Timeframe::H1, 100).unwrap().len(), 100);
        assert_eq!(broker.pages_served(), 1);
        assert_eq!(store.candles("GOLD", Timeframe::H1, 100).unwrap(), candles[20..].to_vec());
        assert_eq!(broker.pages_served(), 1);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
