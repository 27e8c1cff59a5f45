//! Bounded oscillators: RSI, stochastic %K and ADX.

use super::series::{rolling_max, rolling_min};
use super::volatility::{true_range, wilder_smooth};
use super::Indicator;
use crate::domain::Candle;

/// Wilder RSI. avg_loss == 0 → 100; avg_gain == 0 → 0.
#[derive(Debug, Clone)]
pub struct Rsi {
    period: usize,
    name: String,
}

impl Rsi {
    pub fn new(period: usize) -> Self {
        assert!(period >= 1, "RSI period must be >= 1");
        Self {
            period,
            name: format!("rsi_{period}"),
        }
    }
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        if avg_gain == 0.0 {
            50.0
        } else {
            100.0
        }
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    }
}

impl Indicator for Rsi {
    fn name(&self) -> &str {
        &self.name
    }

    fn lookback(&self) -> usize {
        self.period
    }

    fn compute(&self, candles: &[Candle]) -> Vec<f64> {
        let n = candles.len();
        let mut gains = vec![f64::NAN; n];
        let mut losses = vec![f64::NAN; n];
        for i in 1..n {
            let ch = candles[i].close - candles[i - 1].close;
            if !ch.is_nan() {
                gains[i] = ch.max(0.0);
                losses[i] = (-ch).max(0.0);
            }
        }
        let avg_gain = wilder_smooth(&gains, self.period);
        let avg_loss = wilder_smooth(&losses, self.period);
        avg_gain
            .iter()
            .zip(&avg_loss)
            .map(|(&g, &l)| if g.is_nan() || l.is_nan() { f64::NAN } else { rsi_value(g, l) })
            .collect()
    }
}

/// Stochastic %K: position of the close within the trailing high/low range.
#[derive(Debug, Clone)]
pub struct StochK {
    period: usize,
    name: String,
}

impl StochK {
    pub fn new(period: usize) -> Self {
        assert!(period >= 1, "stochastic period must be >= 1");
        Self {
            period,
            name: format!("stoch_k_{period}"),
        }
    }
}

impl Indicator for StochK {
    fn name(&self) -> &str {
        &self.name
    }

    fn lookback(&self) -> usize {
        self.period - 1
    }

    fn compute(&self, candles: &[Candle]) -> Vec<f64> {
        let highs: Vec<f64> = candles.iter().map(|c| c.high).collect();
        let lows: Vec<f64> = candles.iter().map(|c| c.low).collect();
        let hh = rolling_max(&highs, self.period);
        let ll = rolling_min(&lows, self.period);
        candles
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let range = hh[i] - ll[i];
                if range.is_nan() {
                    f64::NAN
                } else if range == 0.0 {
                    50.0
                } else {
                    100.0 * (c.close - ll[i]) / range
                }
            })
            .collect()
    }
}

/// Average Directional Index (Wilder).
#[derive(Debug, Clone)]
pub struct Adx {
    period: usize,
    name: String,
}

impl Adx {
    pub fn new(period: usize) -> Self {
        assert!(period >= 1, "ADX period must be >= 1");
        Self {
            period,
            name: format!("adx_{period}"),
        }
    }
}

impl Indicator for Adx {
    fn name(&self) -> &str {
        &self.name
    }

    fn lookback(&self) -> usize {
        2 * self.period - 1
    }

    fn compute(&self, candles: &[Candle]) -> Vec<f64> {
        let n = candles.len();
        if n < 2 {
            return vec![f64::NAN; n];
        }

        let mut plus_dm = vec![f64::NAN; n];
        let mut minus_dm = vec![f64::NAN; n];
        for i in 1..n {
            let up = candles[i].high - candles[i - 1].high;
            let down = candles[i - 1].low - candles[i].low;
            if up.is_nan() || down.is_nan() {
                continue;
            }
            plus_dm[i] = if up > down && up > 0.0 { up } else { 0.0 };
            minus_dm[i] = if down > up && down > 0.0 { down } else { 0.0 };
        }

        let mut tr = true_range(candles);
        tr[0] = f64::NAN;
        let s_tr = wilder_smooth(&tr, self.period);
        let s_plus = wilder_smooth(&plus_dm, self.period);
        let s_minus = wilder_smooth(&minus_dm, self.period);

        let mut dx = vec![f64::NAN; n];
        for i in 0..n {
            if s_tr[i].is_nan() || s_plus[i].is_nan() || s_minus[i].is_nan() || s_tr[i] == 0.0 {
                continue;
            }
            let plus_di = 100.0 * s_plus[i] / s_tr[i];
            let minus_di = 100.0 * s_minus[i] / s_tr[i];
            let sum = plus_di + minus_di;
            dx[i] = if sum == 0.0 {
                0.0
            } else {
                100.0 * (plus_di - minus_di).abs() / sum
            };
        }
        wilder_smooth(&dx, self.period)
    }
}
