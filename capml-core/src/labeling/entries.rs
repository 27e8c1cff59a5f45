//! Entry rules: zero-crossings of a signal series.

use crate::domain::{Candle, Side};
use crate::indicators::{EmaDiff, Indicator, MacdHist, SmaDiff};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryRule {
    #[default]
    MacdCross,
    EmaCross,
    SmaCross,
}

impl EntryRule {
    pub const ALL: [EntryRule; 3] = [EntryRule::MacdCross, EntryRule::EmaCross, EntryRule::SmaCross];

    pub fn strategy_tag(self) -> &'static str {
        match self {
            EntryRule::MacdCross => "macd_cross",
            EntryRule::EmaCross => "ema_cross",
            EntryRule::SmaCross => "sma_cross",
        }
    }

    /// Signal whose sign flips mark entries.
    pub fn signal(self, candles: &[Candle]) -> Vec<f64> {
        match self {
            EntryRule::MacdCross => MacdHist::standard().compute(candles),
            EntryRule::EmaCross => EmaDiff::new(21, 50).compute(candles),
            EntryRule::SmaCross => SmaDiff::new(20, 50).compute(candles),
        }
    }

    pub fn entries(self, candles: &[Candle]) -> Vec<EntryEvent> {
        detect_entries(&self.signal(candles))
    }
}

impl fmt::Display for EntryRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.strategy_tag())
    }
}

impl FromStr for EntryRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntryRule::ALL
            .into_iter()
            .find(|r| r.strategy_tag() == s)
            .ok_or_else(|| format!("unknown entry rule '{s}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryEvent {
    pub index: usize,
    pub direction: Side,
}

/// Bars where `signal` crosses from ≤0 to >0 (buy) or ≥0 to <0 (sell).
/// Pairs with a NaN on either side never produce an entry.
pub fn detect_entries(signal: &[f64]) -> Vec<EntryEvent> {
    signal
        .windows(2)
        .enumerate()
        .filter_map(|(k, w)| {
            let (prev, curr) = (w[0], w[1]);
            if !prev.is_finite() || !curr.is_finite() {
                return None;
            }
            let direction = if prev <= 0.0 && curr > 0.0 {
                Side::Buy
            } else if prev >= 0.0 && curr < 0.0 {
                Side::Sell
            } else {
                return None;
            };
            Some(EntryEvent {
                index: k + 1,
                direction,
            })
        })
        .collect()
}
