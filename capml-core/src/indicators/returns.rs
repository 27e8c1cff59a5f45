//! Return-based features.

use super::series::{pct_change, rolling_mean, rolling_std};
use super::{closes, Indicator};
use crate::domain::Candle;

#[derive(Debug, Clone, Default)]
pub struct Ret1;

impl Indicator for Ret1 {
    fn name(&self) -> &str {
        "ret_1"
    }

    fn lookback(&self) -> usize {
        1
    }

    fn compute(&self, candles: &[Candle]) -> Vec<f64> {
        pct_change(&closes(candles))
    }
}

/// Z-score of the 1-bar return against its trailing window.
#[derive(Debug, Clone)]
pub struct ReturnZScore {
    window: usize,
    name: String,
}

impl ReturnZScore {
    pub fn new(window: usize) -> Self {
        assert!(window >= 2, "z-score window must be >= 2");
        Self {
            window,
            name: format!("ret_z_{window}"),
        }
    }
}

impl Indicator for ReturnZScore {
    fn name(&self) -> &str {
        &self.name
    }

    fn lookback(&self) -> usize {
        self.window
    }

    fn compute(&self, candles: &[Candle]) -> Vec<f64> {
        let ret = pct_change(&closes(candles));
        let mean = rolling_mean(&ret, self.window);
        let std = rolling_std(&ret, self.window);
        ret.iter()
            .zip(mean.iter().zip(&std))
            .map(|(&r, (&m, &s))| {
                if s.is_nan() || m.is_nan() {
                    f64::NAN
                } else if s < 1e-12 {
                    0.0
                } else {
                    (r - m) / s
                }
            })
            .collect()
    }
}

/// Rolling standard deviation of 1-bar returns.
#[derive(Debug, Clone)]
pub struct ReturnStd {
    window: usize,
    name: String,
}

impl ReturnStd {
    pub fn new(window: usize) -> Self {
        assert!(window >= 2, "std window must be >= 2");
        Self {
            window,
            name: format!("std_{window}"),
        }
    }
}

impl Indicator for ReturnStd {
    fn name(&self) -> &str {
        &self.name
    }

    fn lookback(&self) -> usize {
        self.window
    }

    fn compute(&self, candles: &[Candle]) -> Vec<f64> {
        rolling_std(&pct_change(&closes(candles)), self.window)
    }
}

/// Trailing mean of (high − low) / close.
#[derive(Debug, Clone)]
pub struct HighLowRange {
    window: usize,
    name: String,
}

impl HighLowRange {
    pub fn new(window: usize) -> Self {
        assert!(window >= 1, "range window must be >= 1");
        Self {
            window,
            name: format!("hl_range_{window}"),
        }
    }
}

impl Indicator for HighLowRange {
    fn name(&self) -> &str {
        &self.name
    }

    fn lookback(&self) -> usize {
        self.window - 1
    }

    fn compute(&self, candles: &[Candle]) -> Vec<f64> {
        let ranges: Vec<f64> = candles
            .iter()
            .map(|c| if c.close != 0.0 { (c.high - c.low) / c.close } else { f64::NAN })
            .collect();
        rolling_mean(&ranges, self.window)
    }
}
