//! Technical indicators over candle series.
//!
//! Indicators are pure functions: candle history in, numeric series out, one
//! value per candle. Warmup positions are `f64::NAN`.
//!
//! # Look-ahead contamination guard
//! No value at bar t may depend on candles after t. Every indicator must give
//! identical output on a truncated series and the matching prefix of the full
//! series (see `tests/lookahead_test.rs`).

pub mod oscillators;
pub mod returns;
pub mod series;
pub mod trend;
pub mod volatility;
pub mod volume;

use crate::domain::Candle;

pub use oscillators::{Adx, Rsi, StochK};
pub use returns::{HighLowRange, Ret1, ReturnStd, ReturnZScore};
pub use trend::{Ema, EmaDiff, MacdHist, Sma, SmaDiff};
pub use volatility::{ewm_std, true_range, wilder_smooth, Atr};
pub use volume::Obv;

/// A named feature column computed from candles.
pub trait Indicator: Send + Sync {
    /// Feature name (e.g., "sma_20", "atr_14").
    fn name(&self) -> &str;

    /// Number of leading NaN values on a clean series.
    fn lookback(&self) -> usize;

    /// Compute the series. Output length equals `candles.len()`.
    fn compute(&self, candles: &[Candle]) -> Vec<f64>;
}

pub(crate) fn closes(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(|c| c.close).collect()
}

/// Candles from close prices: open = previous close, high/low ±1.
#[cfg(test)]
pub fn make_candles(closes: &[f64]) -> Vec<Candle> {
    use chrono::{Duration, TimeZone, Utc};
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| {
            let open = if i == 0 { close } else { closes[i - 1] };
            Candle {
                time: start + Duration::hours(i as i64),
                open,
                high: open.max(close) + 1.0,
                low: open.min(close) - 1.0,
                close,
                volume: 1000.0,
            }
        })
        .collect()
}

#[cfg(test)]
pub fn assert_approx(actual: f64, expected: f64, epsilon: f64) {
    assert!(
        (actual - expected).abs() < epsilon,
        "assert_approx failed: actual={actual}, expected={expected}, diff={}, epsilon={epsilon}",
        (actual - expected).abs()
    );
}

#[cfg(test)]
pub const DEFAULT_EPSILON: f64 = 1e-10;
