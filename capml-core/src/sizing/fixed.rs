//! Fixed risk sizer
//!
//! Constant risk percent per trade, independent of model quality.

use super::Sizer;
use crate::metrics::CvMetrics;

#[derive(Debug, Clone)]
pub struct FixedRiskSizer {
    risk_pct: f64,
    atr_mult: f64,
}

impl FixedRiskSizer {
    /// `risk_pct` is capped by `max_pct`; both in percent units.
    pub fn new(risk_pct: f64, max_pct: f64, atr_mult: f64) -> Self {
        Self {
            risk_pct: risk_pct.min(max_pct).max(0.0),
            atr_mult,
        }
    }
}

impl Sizer for FixedRiskSizer {
    fn risk_fraction(&self, _metrics: &CvMetrics) -> f64 {
        self.risk_pct / 100.0
    }

    fn stop_atr_mult(&self) -> f64 {
        self.atr_mult
    }

    fn name(&self) -> &str {
        "fixed_risk"
    }
}
