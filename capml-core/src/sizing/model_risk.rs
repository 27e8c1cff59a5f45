//! Model-quality risk sizer
//!
//! Per-trade risk grows with the model's cross-validated quality.
//!
//! # Formula (percent units)
//! ```text
//! r% = clip(0.25 + 0.2·sharpe + 0.2·(pf − 1) + 0.5·min(0, max_drawdown), 0.1, 1.0)
//! r% = min(r%, risk_max_pct)
//! stop = k · ATR14  (or 1% of price)
//! qty  = equity · r / stop
//! ```

use super::Sizer;
use crate::metrics::CvMetrics;

pub const MIN_RISK_PCT: f64 = 0.1;
pub const MAX_RISK_PCT: f64 = 1.0;
const BASE_RISK_PCT: f64 = 0.25;

#[derive(Debug, Clone)]
pub struct ModelRiskSizer {
    max_pct: f64,
    atr_mult: f64,
}

impl ModelRiskSizer {
    pub fn new(max_pct: f64, atr_mult: f64) -> Self {
        Self { max_pct, atr_mult }
    }

    /// Uncapped-by-config budget in percent.
    pub fn budget_pct(metrics: &CvMetrics) -> f64 {
        let finite = |v: f64| if v.is_finite() { v } else { 0.0 };
        let raw = BASE_RISK_PCT
            + 0.2 * finite(metrics.sharpe)
            + 0.2 * (finite(metrics.pf) - 1.0)
            + 0.5 * finite(metrics.max_drawdown).min(0.0);
        raw.clamp(MIN_RISK_PCT, MAX_RISK_PCT)
    }
}

impl Sizer for ModelRiskSizer {
    fn risk_fraction(&self, metrics: &CvMetrics) -> f64 {
        Self::budget_pct(metrics).min(self.max_pct).max(0.0) / 100.0
    }

    fn stop_atr_mult(&self) -> f64 {
        self.atr_mult
    }

    fn name(&self) -> &str {
        "model_risk"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::make_candles;

    fn metrics(sharpe: f64, pf: f64, max_drawdown: f64) -> CvMetrics {
        CvMetrics {
            sharpe,
            pf,
            max_drawdown,
            hit_rate: 0.5,
            trades: 40,
        }
    }

    #[test]
    fn budget_formula() {
        // 0.25 + 0.2·0.5 + 0.2·0.5 + 0.5·(−0.1) = 0.40
        let pct = ModelRiskSizer::budget_pct(&metrics(0.5, 1.5, -0.1));
        assert!((pct - 0.40).abs() < 1e-12);
    }

    #[test]
    fn budget_is_clipped() {
        assert_eq!(ModelRiskSizer::budget_pct(&metrics(-3.0, 0.0, -0.5)), MIN_RISK_PCT);
        assert_eq!(ModelRiskSizer::budget_pct(&metrics(3.0, 5.0, 0.0)), MAX_RISK_PCT);
        assert_eq!(ModelRiskSizer::budget_pct(&metrics(f64::NAN, 1.0, 0.0)), 0.25);
    }

    #[test]
    fn config_cap_applies() {
        let sizer = ModelRiskSizer::new(0.3, 2.0);
        assert!((sizer.risk_fraction(&metrics(3.0, 5.0, 0.0)) - 0.003).abs() < 1e-15);
    }

    #[test]
    fn sizes_with_price_stop() {
        // 3 candles: no ATR, stop = 1% of 100 = 1.0
        let candles = make_candles(&[100.0, 100.0, 100.0]);
        let sizer = ModelRiskSizer::new(1.0, 2.0);
        let d = sizer.size(10_000.0, &candles, &metrics(0.5, 1.5, -0.1));
        // 10_000 · 0.004 / 1.0
        assert!((d.qty - 40.0).abs() < 1e-9);
        assert_eq!(sizer.size(0.0, &candles, &metrics(0.5, 1.5, -0.1)).qty, 0.0);
        assert_eq!(sizer.size(-5.0, &candles, &metrics(0.5, 1.5, -0.1)).qty, 0.0);
    }
}
