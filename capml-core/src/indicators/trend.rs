//! Trend indicators: moving averages, their spreads, and the MACD histogram.

use super::series::{ema_of_series, rolling_mean};
use super::{closes, Indicator};
use crate::domain::Candle;

#[derive(Debug, Clone)]
pub struct Sma {
    period: usize,
    name: String,
}

impl Sma {
    pub fn new(period: usize) -> Self {
        assert!(period >= 1, "SMA period must be >= 1");
        Self {
            period,
            name: format!("sma_{period}"),
        }
    }
}

impl Indicator for Sma {
    fn name(&self) -> &str {
        &self.name
    }

    fn lookback(&self) -> usize {
        self.period - 1
    }

    fn compute(&self, candles: &[Candle]) -> Vec<f64> {
        rolling_mean(&closes(candles), self.period)
    }
}

/// Recursive EMA seeded with the SMA of the first `period` closes.
#[derive(Debug, Clone)]
pub struct Ema {
    period: usize,
    name: String,
}

impl Ema {
    pub fn new(period: usize) -> Self {
        assert!(period >= 1, "EMA period must be >= 1");
        Self {
            period,
            name: format!("ema_{period}"),
        }
    }
}

impl Indicator for Ema {
    fn name(&self) -> &str {
        &self.name
    }

    fn lookback(&self) -> usize {
        self.period - 1
    }

    fn compute(&self, candles: &[Candle]) -> Vec<f64> {
        ema_of_series(&closes(candles), self.period)
    }
}

fn difference(a: Vec<f64>, b: Vec<f64>) -> Vec<f64> {
    a.into_iter().zip(b).map(|(x, y)| x - y).collect()
}

/// Fast SMA minus slow SMA.
#[derive(Debug, Clone)]
pub struct SmaDiff {
    fast: Sma,
    slow: Sma,
}

impl SmaDiff {
    pub fn new(fast: usize, slow: usize) -> Self {
        Self {
            fast: Sma::new(fast),
            slow: Sma::new(slow),
        }
    }
}

impl Indicator for SmaDiff {
    fn name(&self) -> &str {
        "sma_diff"
    }

    fn lookback(&self) -> usize {
        self.fast.lookback().max(self.slow.lookback())
    }

    fn compute(&self, candles: &[Candle]) -> Vec<f64> {
        difference(self.fast.compute(candles), self.slow.compute(candles))
    }
}

/// Fast EMA minus slow EMA.
#[derive(Debug, Clone)]
pub struct EmaDiff {
    fast: Ema,
    slow: Ema,
}

impl EmaDiff {
    pub fn new(fast: usize, slow: usize) -> Self {
        Self {
            fast: Ema::new(fast),
            slow: Ema::new(slow),
        }
    }
}

impl Indicator for EmaDiff {
    fn name(&self) -> &str {
        "ema_diff"
    }

    fn lookback(&self) -> usize {
        self.fast.lookback().max(self.slow.lookback())
    }

    fn compute(&self, candles: &[Candle]) -> Vec<f64> {
        difference(self.fast.compute(candles), self.slow.compute(candles))
    }
}

/// MACD histogram: (EMA_fast − EMA_slow) − EMA_signal of that line.
#[derive(Debug, Clone)]
pub struct MacdHist {
    fast: usize,
    slow: usize,
    signal: usize,
}

impl MacdHist {
    pub fn new(fast: usize, slow: usize, signal: usize) -> Self {
        assert!(fast >= 1 && slow > fast && signal >= 1, "invalid MACD periods");
        Self { fast, slow, signal }
    }

    pub fn standard() -> Self {
        Self::new(12, 26, 9)
    }
}

impl Indicator for MacdHist {
    fn name(&self) -> &str {
        "macd_hist"
    }

    fn lookback(&self) -> usize {
        self.slow + self.signal - 2
    }

    fn compute(&self, candles: &[Candle]) -> Vec<f64> {
        let c = closes(candles);
        let line = difference(ema_of_series(&c, self.fast), ema_of_series(&c, self.slow));
        let signal = ema_of_series(&line, self.signal);
        difference(line, signal)
    }
}
