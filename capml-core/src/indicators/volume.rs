//! Volume features.

use super::Indicator;
use crate::domain::Candle;

/// On-balance volume: cumulative volume signed by close-to-close direction.
#[derive(Debug, Clone, Default)]
pub struct Obv;

impl Indicator for Obv {
    fn name(&self) -> &str {
        "obv"
    }

    fn lookback(&self) -> usize {
        0
    }

    fn compute(&self, candles: &[Candle]) -> Vec<f64> {
        let mut out = Vec::with_capacity(candles.len());
        let mut acc = 0.0;
        for (i, c) in candles.iter().enumerate() {
            if i > 0 {
                let prev = candles[i - 1].close;
                if c.close > prev {
                    acc += c.volume;
                } else if c.close < prev {
                    acc -= c.volume;
                }
            }
            out.push(acc);
        }
        out
    }
}
