//! Broker trait and structured error types.
//!
//! The `Broker` trait abstracts the Capital.com REST surface so the Candle
//! Store, Order Router and live loop can be driven by a mock in tests.

use crate::domain::{Candle, Side, Timeframe};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured error types for broker and cache operations.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("server error: HTTP {status}")]
    ServerError { status: u16 },

    #[error("rate limited by broker (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),

    #[error("authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("symbol not found: {symbol}")]
    SymbolNotFound { symbol: String },

    #[error("broker cooldown active: requests blocked (circuit breaker tripped)")]
    CircuitBreakerTripped,

    #[error("broker rejected request: {0}")]
    Rejected(String),

    #[error("cache error: {0}")]
    CacheError(String),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("parquet I/O error: {0}")]
    ParquetError(String),

    #[error("no cached data for '{key}'")]
    NoCachedData { key: String },

    #[error("data error: {0}")]
    Other(String),
}

impl DataError {
    /// Errors worth a bounded local retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DataError::NetworkUnreachable(_) | DataError::ServerError { .. }
        )
    }

    /// Errors meaning the broker cannot be used right now.
    pub fn is_broker_unavailable(&self) -> bool {
        matches!(
            self,
            DataError::AuthenticationRequired(_)
                | DataError::CircuitBreakerTripped
                | DataError::RateLimited { .. }
                | DataError::NetworkUnreachable(_)
        )
    }
}

/// One page of candle history.
///
/// Page 1 is the most recent. `before` carries the exclusive upper time bound
/// for brokers that page by cursor instead of by number.
#[derive(Debug, Clone)]
pub struct PageRequest<'a> {
    pub epic: &'a str,
    pub timeframe: Timeframe,
    pub page_size: usize,
    pub page_number: usize,
    pub before: Option<DateTime<Utc>>,
}

/// Market order to open a position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenPositionRequest {
    pub epic: String,
    pub direction: Side,
    pub size: f64,
    pub currency: Option<String>,
}

/// Broker acknowledgement of an accepted order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealConfirmation {
    pub deal_reference: String,
}

/// The broker operations the core consumes.
pub trait Broker: Send + Sync {
    /// Human-readable name of this broker.
    fn name(&self) -> &str;

    /// Fetch one page of candles, sorted ascending within the page.
    fn fetch_page(&self, req: &PageRequest<'_>) -> Result<Vec<Candle>, DataError>;

    /// Search for the broker epic of a symbol.
    fn search_epic(&self, symbol: &str) -> Result<Option<String>, DataError>;

    /// Open a market position.
    fn open_position(&self, req: &OpenPositionRequest) -> Result<DealConfirmation, DataError>;

    /// Epics that currently have an open position at the broker.
    fn open_epics(&self) -> Result<Vec<String>, DataError>;

    /// Account equity used as the sizing baseline.
    fn account_equity(&self) -> Result<f64, DataError>;

    /// Check if the broker is currently usable (not cooling down).
    fn is_available(&self) -> bool;
}
