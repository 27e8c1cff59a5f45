//! Slice-level building blocks shared by the indicators.

/// Trailing mean over `window` values. NaN until the window is full or when
/// the window contains a NaN.
pub fn rolling_mean(values: &[f64], window: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![f64::NAN; n];
    if window == 0 || n < window {
        return out;
    }
    for i in (window - 1)..n {
        let w = &values[i + 1 - window..=i];
        if w.iter().any(|v| v.is_nan()) {
            continue;
        }
        out[i] = w.iter().sum::<f64>() / window as f64;
    }
    out
}

/// Trailing sample standard deviation (n − 1 denominator).
pub fn rolling_std(values: &[f64], window: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![f64::NAN; n];
    if window < 2 || n < window {
        return out;
    }
    for i in (window - 1)..n {
        let w = &values[i + 1 - window..=i];
        if w.iter().any(|v| v.is_nan()) {
            continue;
        }
        let mean = w.iter().sum::<f64>() / window as f64;
        let var = w.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (window - 1) as f64;
        out[i] = var.sqrt();
    }
    out
}

pub fn rolling_max(values: &[f64], window: usize) -> Vec<f64> {
    rolling_fold(values, window, f64::NEG_INFINITY, f64::max)
}

pub fn rolling_min(values: &[f64], window: usize) -> Vec<f64> {
    rolling_fold(values, window, f64::INFINITY, f64::min)
}

fn rolling_fold(values: &[f64], window: usize, init: f64, f: fn(f64, f64) -> f64) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![f64::NAN; n];
    if window == 0 || n < window {
        return out;
    }
    for i in (window - 1)..n {
        let w = &values[i + 1 - window..=i];
        if w.iter().any(|v| v.is_nan()) {
            continue;
        }
        out[i] = w.iter().copied().fold(init, f);
    }
    out
}

/// EMA seeded with the SMA of the first `period` values.
///
/// Leading NaNs are skipped: the seed window starts at the first valid value,
/// which lets EMAs be chained (MACD signal line over the MACD line).
pub fn ema_of_series(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut result = vec![f64::NAN; n];
    if period == 0 {
        return result;
    }
    let Some(start) = values.iter().position(|v| !v.is_nan()) else {
        return result;
    };
    if n - start < period {
        return result;
    }

    let seed_window = &values[start..start + period];
    if seed_window.iter().any(|v| v.is_nan()) {
        return result;
    }
    let seed = seed_window.iter().sum::<f64>() / period as f64;
    let seed_idx = start + period - 1;
    result[seed_idx] = seed;

    let alpha = 2.0 / (period as f64 + 1.0);
    let mut prev = seed;
    for i in (seed_idx + 1)..n {
        if values[i].is_nan() {
            // NaN taints everything after it
            return result;
        }
        prev = alpha * values[i] + (1.0 - alpha) * prev;
        result[i] = prev;
    }
    result
}

/// Simple 1-bar returns; index 0 is NaN.
pub fn pct_change(values: &[f64]) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    for i in 1..values.len() {
        let prev = values[i - 1];
        if prev != 0.0 && !prev.is_nan() && !values[i].is_nan() {
            out[i] = values[i] / prev - 1.0;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::{assert_approx, DEFAULT_EPSILON};

    #[test]
    fn rolling_mean_window_3() {
        let out = rolling_mean(&[1.0, 2.0, 3.0, 4.0], 3);
        assert!(out[0].is_nan() && out[1].is_nan());
        assert_approx(out[2], 2.0, DEFAULT_EPSILON);
        assert_approx(out[3], 3.0, DEFAULT_EPSILON);
    }

    #[test]
    fn rolling_std_is_sample_std() {
        let out = rolling_std(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0], 8);
        // sample variance of this classic set is 32/7
        assert_approx(out[7], (32.0_f64 / 7.0).sqrt(), 1e-12);
    }

    #[test]
    fn rolling_extremes() {
        let v = [3.0, 1.0, 4.0, 1.0, 5.0];
        assert_eq!(rolling_max(&v, 2)[2], 4.0);
        assert_eq!(rolling_min(&v, 3)[4], 1.0);
    }

    #[test]
    fn ema_skips_leading_nan() {
        let v = [f64::NAN, f64::NAN, 1.0, 2.0, 3.0, 4.0];
        let out = ema_of_series(&v, 3);
        assert!(out[3].is_nan());
        assert_approx(out[4], 2.0, DEFAULT_EPSILON);
        // alpha = 0.5 → 0.5*4 + 0.5*2
        assert_approx(out[5], 3.0, DEFAULT_EPSILON);
    }

    #[test]
    fn pct_change_basic() {
        let out = pct_change(&[100.0, 110.0, 99.0]);
        assert!(out[0].is_nan());
        assert_approx(out[1], 0.1, 1e-12);
        assert_approx(out[2], -0.1, 1e-12);
    }
}
