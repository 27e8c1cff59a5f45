//! Position Sizers: turn equity and a risk budget into a trade quantity.
//!
//! Sizers are model-aware (auto mode reads the registry's CV metrics) but
//! direction-agnostic; the short-selling policy lives in the Decision Gate.

pub mod fixed;
pub mod model_risk;

pub use fixed::FixedRiskSizer;
pub use model_risk::ModelRiskSizer;

use crate::domain::Candle;
use crate::indicators::Atr;
use crate::metrics::CvMetrics;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub const ATR_PERIOD: usize = 14;
/// Stop distance as a fraction of price when ATR is unavailable.
pub const PRICE_STOP_FRACTION: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskMode {
    #[default]
    Auto,
    Fixed,
}

impl FromStr for RiskMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(RiskMode::Auto),
            "fixed" => Ok(RiskMode::Fixed),
            _ => Err(format!("unknown risk mode '{s}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopSource {
    Atr,
    Price,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SizeDecision {
    pub qty: f64,
    /// Fraction of equity at risk (0.005 = 0.5%).
    pub risk_fraction: f64,
    pub stop_distance: f64,
    pub stop_source: StopSource,
}

impl SizeDecision {
    fn zero(risk_fraction: f64) -> Self {
        Self {
            qty: 0.0,
            risk_fraction,
            stop_distance: 0.0,
            stop_source: StopSource::Price,
        }
    }
}

/// `k · ATR14` when computable, else `0.01 · last close`.
pub fn stop_distance(candles: &[Candle], atr_mult: f64) -> Option<(f64, StopSource)> {
    if let Some(atr) = Atr::new(ATR_PERIOD).latest(candles) {
        let s = atr_mult * atr;
        if s.is_finite() && s > 0.0 {
            return Some((s, StopSource::Atr));
        }
    }
    let price = candles.last()?.close;
    (price.is_finite() && price > 0.0).then_some((PRICE_STOP_FRACTION * price, StopSource::Price))
}

/// Position sizing logic
///
/// # Responsibilities
/// - Derive the per-trade risk budget
/// - Convert equity + budget + stop distance into a quantity
///
/// # Non-Responsibilities
/// - Sizers do NOT decide direction or whether to trade
pub trait Sizer: Send + Sync {
    /// Risk budget as a fraction of equity, already capped.
    fn risk_fraction(&self, metrics: &CvMetrics) -> f64;

    /// Multiplier on ATR for the stop distance.
    fn stop_atr_mult(&self) -> f64;

    /// Sizer name for logging
    fn name(&self) -> &str;

    /// `qty = equity · r / s`, never negative. Zero for non-positive equity or
    /// when no stop distance can be derived.
    fn size(&self, equity: f64, candles: &[Candle], metrics: &CvMetrics) -> SizeDecision {
        let r = self.risk_fraction(metrics);
        if !(equity.is_finite() && equity > 0.0) {
            return SizeDecision::zero(r);
        }
        let Some((s, source)) = stop_distance(candles, self.stop_atr_mult()) else {
            return SizeDecision::zero(r);
        };
        SizeDecision {
            qty: (equity * r / s).max(0.0),
            risk_fraction: r,
            stop_distance: s,
            stop_source: source,
        }
    }
}

/// Sizer for the configured mode. Percentages are in percent units.
pub fn build_sizer(mode: RiskMode, fallback_pct: f64, max_pct: f64, stop_atr_mult: f64) -> Box<dyn Sizer> {
    match mode {
        RiskMode::Auto => Box::new(ModelRiskSizer::new(max_pct, stop_atr_mult)),
        RiskMode::Fixed => Box::new(FixedRiskSizer::new(fallback_pct, max_pct, stop_atr_mult)),
    }
}
