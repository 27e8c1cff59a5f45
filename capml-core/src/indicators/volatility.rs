//! Volatility measures: true range, ATR, Wilder smoothing, EWM deviation.

use super::series::rolling_mean;
use super::Indicator;
use crate::domain::Candle;

/// TR[0] = high − low; TR[t] = max(high−low, |high−prev_close|, |low−prev_close|).
pub fn true_range(candles: &[Candle]) -> Vec<f64> {
    let n = candles.len();
    let mut tr = vec![f64::NAN; n];
    if n == 0 {
        return tr;
    }
    tr[0] = candles[0].high - candles[0].low;
    for i in 1..n {
        let (h, l, pc) = (candles[i].high, candles[i].low, candles[i - 1].close);
        tr[i] = (h - l).max((h - pc).abs()).max((l - pc).abs());
    }
    tr
}

/// Wilder smoothing (alpha = 1/period), seeded with the mean of the first
/// run of `period` consecutive valid values. NaN after the seed taints the rest.
pub fn wilder_smooth(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut result = vec![f64::NAN; n];
    if period == 0 || n < period {
        return result;
    }

    let mut run = 0usize;
    let mut seed_end = None;
    for (i, v) in values.iter().enumerate() {
        if v.is_nan() {
            run = 0;
            continue;
        }
        run += 1;
        if run == period {
            seed_end = Some(i + 1);
            break;
        }
    }
    let Some(seed_end) = seed_end else {
        return result;
    };

    let seed = values[seed_end - period..seed_end].iter().sum::<f64>() / period as f64;
    result[seed_end - 1] = seed;

    let alpha = 1.0 / period as f64;
    let mut prev = seed;
    for i in seed_end..n {
        if values[i].is_nan() {
            return result;
        }
        prev = alpha * values[i] + (1.0 - alpha) * prev;
        result[i] = prev;
    }
    result
}

/// Average true range as the simple mean of the last `period` true ranges.
///
/// TR[0] has no previous close and is excluded, so the first value lands at
/// index `period`.
#[derive(Debug, Clone)]
pub struct Atr {
    period: usize,
    name: String,
}

impl Atr {
    pub fn new(period: usize) -> Self {
        assert!(period >= 1, "ATR period must be >= 1");
        Self {
            period,
            name: format!("atr_{period}"),
        }
    }

    /// ATR at the last candle, if computable and positive.
    pub fn latest(&self, candles: &[Candle]) -> Option<f64> {
        self.compute(candles)
            .last()
            .copied()
            .filter(|v| v.is_finite() && *v > 0.0)
    }
}

impl Indicator for Atr {
    fn name(&self) -> &str {
        &self.name
    }

    fn lookback(&self) -> usize {
        self.period
    }

    fn compute(&self, candles: &[Candle]) -> Vec<f64> {
        let mut tr = true_range(candles);
        if let Some(first) = tr.first_mut() {
            *first = f64::NAN;
        }
        rolling_mean(&tr, self.period)
    }
}

/// Exponentially weighted standard deviation, `alpha = 2 / (span + 1)`.
///
/// Recursive form: `var_t = (1 − α)(var_{t−1} + α (x_t − mean_{t−1})²)`.
/// Leading NaNs are skipped; the first valid value yields 0.
pub fn ewm_std(values: &[f64], span: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![f64::NAN; n];
    let alpha = 2.0 / (span.max(1) as f64 + 1.0);
    let mut state: Option<(f64, f64)> = None;
    for (i, &x) in values.iter().enumerate() {
        if x.is_nan() {
            if let Some((_, var)) = state {
                out[i] = var.sqrt();
            }
            continue;
        }
        let (mean, var) = match state {
            None => (x, 0.0),
            Some((m, v)) => {
                let d = x - m;
                (m + alpha * d, (1.0 - alpha) * (v + alpha * d * d))
            }
        };
        state = Some((mean, var));
        out[i] = var.sqrt();
    }
    out
}
