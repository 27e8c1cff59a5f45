//! Candle: one OHLCV bar.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// OHLCV candle for one timeframe interval.
///
/// Prices are broker mid-prices. `time` is the interval open in UTC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Returns true if any OHLC field is NaN.
    pub fn is_void(&self) -> bool {
        self.open.is_nan() || self.high.is_nan() || self.low.is_nan() || self.close.is_nan()
    }

    /// Basic sanity check: finite positive prices and high >= low.
    pub fn is_sane(&self) -> bool {
        if self.is_void() {
            return false;
        }
        self.high >= self.low && self.close > 0.0 && self.open > 0.0 && self.volume >= 0.0
    }
}

/// Violations of the candle sequence contract.
#[derive(Debug, Error, PartialEq)]
pub enum CandleError {
    #[error("candle {index} is not strictly after its predecessor ({time})")]
    NotIncreasing { index: usize, time: DateTime<Utc> },

    #[error("candle {index} failed sanity check")]
    Insane { index: usize },
}

/// Check that a sequence is strictly increasing in time and every candle is sane.
pub fn validate_candles(candles: &[Candle]) -> Result<(), CandleError> {
    for (i, c) in candles.iter().enumerate() {
        if !c.is_sane() {
            return Err(CandleError::Insane { index: i });
        }
        if i > 0 && c.time <= candles[i - 1].time {
            return Err(CandleError::NotIncreasing {
                index: i,
                time: c.time,
            });
        }
    }
    Ok(())
}

/// Sort by time and drop duplicate timestamps, keeping the last occurrence.
///
/// Later pages from the broker carry fresher values for the still-forming
/// bar, so the last write wins.
pub fn normalize_candles(mut candles: Vec<Candle>) -> Vec<Candle> {
    candles.sort_by_key(|c| c.time);
    let mut out: Vec<Candle> = Vec::with_capacity(candles.len());
    for c in candles {
        match out.last_mut() {
            Some(last) if last.time == c.time => *last = c,
            _ => out.push(c),
        }
    }
    out
}
