//! Order Router: idempotent, side-effecting wrapper around the broker.
//!
//! `route` validates the request, refuses a second open for a pair that
//! already has one, resolves the epic and either simulates (dry run) or
//! submits a market order. Transport errors come back as `ok: false` with an
//! error message; the router never retries.

use crate::positions::PositionBook;
use capml_core::data::{Broker, EpicResolver, OpenPositionRequest};
use capml_core::domain::{pair_key, Side, Timeframe};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefusalReason {
    AlreadyOpen,
    InvalidSide,
    InvalidQty,
    EpicUnresolved,
    Throttled,
    ZeroSize,
}

impl RefusalReason {
    pub fn code(self) -> &'static str {
        match self {
            RefusalReason::AlreadyOpen => "already_open",
            RefusalReason::InvalidSide => "invalid_side",
            RefusalReason::InvalidQty => "invalid_qty",
            RefusalReason::EpicUnresolved => "epic_unresolved",
            RefusalReason::Throttled => "throttled",
            RefusalReason::ZeroSize => "zero_size",
        }
    }
}

impl fmt::Display for RefusalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteResult {
    pub ok: bool,
    pub broker_ref: Option<String>,
    pub error: Option<String>,
    pub reason: Option<RefusalReason>,
    pub epic: Option<String>,
    pub dry_run: bool,
}

impl RouteResult {
    pub fn refused(reason: RefusalReason) -> Self {
        Self {
            ok: false,
            broker_ref: None,
            error: None,
            reason: Some(reason),
            epic: None,
            dry_run: false,
        }
    }

    fn failed(error: String, epic: Option<String>) -> Self {
        Self {
            ok: false,
            broker_ref: None,
            error: Some(error),
            reason: None,
            epic,
            dry_run: false,
        }
    }
}

pub struct OrderRouter {
    broker: Arc<dyn Broker>,
    epics: Arc<EpicResolver>,
    dry_run: bool,
    currency: Option<String>,
    dry_counter: AtomicU64,
}

impl OrderRouter {
    pub fn new(broker: Arc<dyn Broker>, epics: Arc<EpicResolver>, dry_run: bool) -> Self {
        Self {
            broker,
            epics,
            dry_run,
            currency: None,
            dry_counter: AtomicU64::new(0),
        }
    }

    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = Some(currency.into());
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Route one market order for `(symbol, timeframe)`.
    ///
    /// `side` must be `BUY` or `SELL` (any case) and `qty` finite and positive.
    pub fn route(&self, book: &PositionBook, symbol: &str, side: &str, qty: f64, timeframe: Timeframe) -> RouteResult {
        let Ok(side) = side.parse::<Side>() else {
            return RouteResult::refused(RefusalReason::InvalidSide);
        };
        if !(qty.is_finite() && qty > 0.0) {
            return RouteResult::refused(RefusalReason::InvalidQty);
        }
        let key = pair_key(symbol, timeframe);
        if book.is_open(symbol, timeframe) {
            info!(key = %key, "refusing second open");
            return RouteResult::refused(RefusalReason::AlreadyOpen);
        }

        if self.dry_run {
            // no broker search, no cache writes
            let n = self.dry_counter.fetch_add(1, Ordering::Relaxed) + 1;
            let epic = self.epics.lookup(symbol).unwrap_or_else(|| symbol.to_string());
            info!(key = %key, side = %side, qty, epic = %epic, "dry-run order");
            return RouteResult {
                ok: true,
                broker_ref: Some(format!("DRYRUN-{key}-{n}")),
                error: None,
                reason: None,
                epic: Some(epic),
                dry_run: true,
            };
        }

        let epic = match self.epics.resolve(self.broker.as_ref(), symbol) {
            Ok(Some(epic)) => epic,
            Ok(None) => return RouteResult::refused(RefusalReason::EpicUnresolved),
            Err(e) => {
                warn!(key = %key, error = %e, "epic resolution failed");
                return RouteResult::failed(e.to_string(), None);
            }
        };
        let request = OpenPositionRequest {
            epic: epic.clone(),
            direction: side,
            size: qty,
            currency: self.currency.clone(),
        };
        match self.broker.open_position(&request) {
            Ok(confirmation) => {
                info!(key = %key, side = %side, qty, epic = %epic, deal = %confirmation.deal_reference, "order accepted");
                RouteResult {
                    ok: true,
                    broker_ref: Some(confirmation.deal_reference),
                    error: None,
                    reason: None,
                    epic: Some(epic),
                    dry_run: false,
                }
            }
            Err(e) => {
                warn!(key = %key, side = %side, epic = %epic, error = %e, "order failed");
                RouteResult::failed(e.to_string(), Some(epic))
            }
        }
    }
}
