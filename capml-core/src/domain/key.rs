//! Model keys and the safe-name transform.

use super::Timeframe;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Replace any character outside `[A-Za-z0-9_.-]` with `_`.
pub fn safe_name(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Identity of one trained model family: what was traded, on which candles,
/// with which entry rule.
///
/// The string `key()` is a derived projection for file names and manifest
/// lookup. It is never parsed back into a `ModelKey`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelKey {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub strategy_tag: String,
}

impl ModelKey {
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe, strategy_tag: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
            strategy_tag: strategy_tag.into(),
        }
    }

    pub fn key(&self) -> String {
        pair_key(&self.symbol, self.timeframe)
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.symbol, self.timeframe, self.strategy_tag)
    }
}

/// `sanitize(symbol + "__" + tf)`.
pub fn pair_key(symbol: &str, timeframe: Timeframe) -> String {
    safe_name(&format!("{symbol}__{}", timeframe.label()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_name_replaces_disallowed() {
        assert_eq!(safe_name("EUR/USD"), "EUR_USD");
        assert_eq!(safe_name("US 500"), "US_500");
        assert_eq!(safe_name("BTC-USD.x_1"), "BTC-USD.x_1");
    }

    #[test]
    fn key_is_sanitized_pair() {
        let key = ModelKey::new("EUR/USD", Timeframe::H1, "macd_cross");
        assert_eq!(key.key(), "EUR_USD__1h");
    }
}
