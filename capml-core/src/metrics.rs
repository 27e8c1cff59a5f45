//! Trade metrics over per-trade returns.
//!
//! Pure functions: a list of direction-adjusted trade returns in, scalar out.
//! The registry stores the result as [`CvMetrics`]; the Position Sizer reads it.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CvMetrics {
    /// Per-trade mean / std, not annualized.
    pub sharpe: f64,
    /// Gross profit / gross loss, capped at 100.
    pub pf: f64,
    /// Negative fraction of the compounded trade equity curve.
    pub max_drawdown: f64,
    pub hit_rate: f64,
    pub trades: usize,
}

impl CvMetrics {
    pub fn from_returns(returns: &[f64]) -> Self {
        Self {
            sharpe: sharpe_ratio(returns),
            pf: profit_factor(returns),
            max_drawdown: max_drawdown(&equity_curve(returns)),
            hit_rate: hit_rate(returns),
            trades: returns.len(),
        }
    }
}

// ─── Individual metric functions ────────────────────────────────────

/// Mean / sample std of trade returns. 0.0 with fewer than 2 trades or zero variance.
pub fn sharpe_ratio(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let std = std_dev(returns);
    if std < 1e-15 {
        return 0.0;
    }
    mean_f64(returns) / std
}

/// Gross profit / gross loss, capped at 100.0 when there are no losses.
pub fn profit_factor(returns: &[f64]) -> f64 {
    let gross_profit: f64 = returns.iter().filter(|r| **r > 0.0).sum();
    let gross_loss: f64 = returns.iter().filter(|r| **r < 0.0).map(|r| r.abs()).sum();
    if gross_loss < 1e-10 {
        return if gross_profit > 0.0 { 100.0 } else { 0.0 };
    }
    (gross_profit / gross_loss).min(100.0)
}

pub fn hit_rate(returns: &[f64]) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }
    returns.iter().filter(|r| **r > 0.0).count() as f64 / returns.len() as f64
}

/// Compounded equity starting at 1.0, one point per trade plus the start.
pub fn equity_curve(returns: &[f64]) -> Vec<f64> {
    let mut curve = Vec::with_capacity(returns.len() + 1);
    let mut eq = 1.0;
    curve.push(eq);
    for r in returns {
        eq *= 1.0 + r;
        curve.push(eq);
    }
    curve
}

/// Maximum drawdown as a negative fraction (e.g., -0.15 = 15% drawdown).
pub fn max_drawdown(equity_curve: &[f64]) -> f64 {
    let mut peak = f64::NEG_INFINITY;
    let mut max_dd = 0.0_f64;
    for &eq in equity_curve {
        peak = peak.max(eq);
        if peak > 0.0 {
            max_dd = max_dd.min((eq - peak) / peak);
        }
    }
    max_dd
}

// ─── Helpers ────────────────────────────────────────────────────────

pub(crate) fn mean_f64(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

pub(crate) fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = mean_f64(values);
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_returns_are_neutral() {
        let m = CvMetrics::from_returns(&[]);
        assert_eq!(m, CvMetrics::default());
    }

    #[test]
    fn profit_factor_cases() {
        assert_eq!(profit_factor(&[0.02, -0.01]), 2.0);
        assert_eq!(profit_factor(&[0.02, 0.01]), 100.0);
        assert_eq!(profit_factor(&[-0.02]), 0.0);
    }

    #[test]
    fn drawdown_of_compounded_curve() {
        let curve = equity_curve(&[0.10, -0.20, 0.05]);
        assert!((curve[1] - 1.1).abs() < 1e-12);
        assert!((curve[2] - 0.88).abs() < 1e-12);
        assert!((max_drawdown(&curve) + 0.2).abs() < 1e-12);
        assert_eq!(max_drawdown(&equity_curve(&[0.01, 0.02])), 0.0);
    }

    #[test]
    fn sharpe_and_hit_rate() {
        let r = [0.01, 0.03, -0.01, 0.01];
        // mean 0.01, sample std sqrt(0.0008/3)
        let expected = 0.01 / (0.0008_f64 / 3.0).sqrt();
        assert!((sharpe_ratio(&r) - expected).abs() < 1e-9);
        assert_eq!(hit_rate(&r), 0.75);
        assert_eq!(sharpe_ratio(&[0.01, 0.01]), 0.0);
    }
}
