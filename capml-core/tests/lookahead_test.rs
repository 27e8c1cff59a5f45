//! Look-ahead contamination tests for every indicator and the feature builder.
//!
//! Method: compute on a truncated series (candles 0..150) and the full series
//! (candles 0..300). Values for 0..150 must be identical in both runs; any
//! difference means the indicator leaks future candles into past values.

use capml_core::data::synthetic_candles;
use capml_core::domain::{Candle, Timeframe};
use capml_core::features::{FeatureMatrix, FeatureSet};
use capml_core::indicators::*;

const FULL: usize = 300;
const TRUNCATED: usize = 150;

fn candles() -> Vec<Candle> {
    synthetic_candles(FULL, Timeframe::H1, 2024)
}

fn assert_prefix_equal(name: &str, truncated: &[f64], full: &[f64]) {
    assert_eq!(truncated.len(), TRUNCATED, "{name}: truncated length");
    assert_eq!(full.len(), FULL, "{name}: full length");
    for i in 0..TRUNCATED {
        let (t, f) = (truncated[i], full[i]);
        if t.is_nan() && f.is_nan() {
            continue;
        }
        assert!(
            !t.is_nan() && !f.is_nan(),
            "{name}: NaN mismatch at bar {i} (truncated={t}, full={f})"
        );
        assert!(
            (t - f).abs() < 1e-10,
            "{name}: look-ahead contamination at bar {i}: truncated={t}, full={f}"
        );
    }
}

fn assert_no_lookahead(indicator: &dyn Indicator) {
    let all = candles();
    assert_prefix_equal(
        indicator.name(),
        &indicator.compute(&all[..TRUNCATED]),
        &indicator.compute(&all),
    );
}

#[test]
fn lookahead_trend() {
    assert_no_lookahead(&Sma::new(20));
    assert_no_lookahead(&Sma::new(50));
    assert_no_lookahead(&Ema::new(21));
    assert_no_lookahead(&SmaDiff::new(20, 50));
    assert_no_lookahead(&EmaDiff::new(21, 50));
    assert_no_lookahead(&MacdHist::standard());
}

#[test]
fn lookahead_oscillators() {
    assert_no_lookahead(&Rsi::new(14));
    assert_no_lookahead(&StochK::new(14));
    assert_no_lookahead(&Adx::new(14));
}

#[test]
fn lookahead_returns() {
    assert_no_lookahead(&Ret1);
    assert_no_lookahead(&ReturnZScore::new(50));
    assert_no_lookahead(&ReturnStd::new(50));
    assert_no_lookahead(&HighLowRange::new(14));
}

#[test]
fn lookahead_volatility_and_volume() {
    assert_no_lookahead(&Atr::new(14));
    assert_no_lookahead(&Obv);
    let all = candles();
    let closes: Vec<f64> = all.iter().map(|c| c.close).collect();
    assert_prefix_equal(
        "ewm_std",
        &ewm_std(&series::pct_change(&closes[..TRUNCATED]), 50),
        &ewm_std(&series::pct_change(&closes), 50),
    );
}

#[test]
fn lookahead_feature_matrix() {
    let all = candles();
    let truncated = FeatureMatrix::build(&all[..TRUNCATED], FeatureSet::Extended);
    let full = FeatureMatrix::build(&all, FeatureSet::Extended);
    for name in truncated.names() {
        assert_prefix_equal(
            name,
            truncated.column(name).unwrap(),
            full.column(name).unwrap(),
        );
    }
}

#[test]
fn every_indicator_respects_its_lookback() {
    let all = candles();
    for ind in FeatureSet::Extended.indicators() {
        let values = ind.compute(&all);
        let lookback = ind.lookback();
        assert!(
            values[lookback..].iter().all(|v| v.is_finite()),
            "{}: NaN after lookback {lookback}",
            ind.name()
        );
    }
}
