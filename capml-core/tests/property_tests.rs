//! Property tests for the universal invariants.
//!
//! Uses proptest to verify:
//! 1. Fold embargo: `max(train) + 1 + embargo ≤ min(test)`, chronological order
//! 2. Ensemble weights: non-negative and summing to 1
//! 3. Label causality: y=1 only when take-profit is touched before any stop
//! 4. Sizer: non-negative and monotone in equity
//! 5. Feature builder determinism
//! 6. Candle normalization yields strictly increasing times

use std::collections::BTreeMap;

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;

use capml_core::cv::{purge, purged_splits};
use capml_core::data::synthetic_candles;
use capml_core::domain::{normalize_candles, validate_candles, Candle, Side, Timeframe};
use capml_core::ensemble::{normalize_weights, optimize, EnsembleParams, OofSet};
use capml_core::features::{FeatureMatrix, FeatureSet};
use capml_core::labeling::{label_entries_with_sigma, Barrier, EntryEvent, TripleBarrierParams};
use capml_core::metrics::CvMetrics;
use capml_core::models::LearnerKind;
use capml_core::sizing::{build_sizer, RiskMode};

// ── Strategies (proptest) ────────────────────────────────────────────

fn candles_from(closes: &[f64]) -> Vec<Candle> {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    closes
        .iter()
        .enumerate()
        .map(|(i, &c)| Candle {
            time: start + Duration::hours(i as i64),
            open: c,
            high: c * 1.001,
            low: c * 0.999,
            close: c,
            volume: 1.0,
        })
        .collect()
}

fn arb_closes() -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec(-0.03..0.03_f64, 5..80).prop_map(|steps| {
        let mut price = 100.0;
        let mut out = vec![price];
        for s in steps {
            price *= 1.0 + s;
            out.push(price);
        }
        out
    })
}

fn arb_metrics() -> impl Strategy<Value = CvMetrics> {
    (-3.0..3.0_f64, 0.0..10.0_f64, -0.9..0.0_f64).prop_map(|(sharpe, pf, max_drawdown)| CvMetrics {
        sharpe,
        pf,
        max_drawdown,
        hit_rate: 0.5,
        trades: 10,
    })
}

// ── 1. Fold embargo ──────────────────────────────────────────────────

proptest! {
    #[test]
    fn folds_respect_embargo(n in 0usize..500, n_splits in 2usize..8, embargo in 0usize..40) {
        if let Ok(folds) = purged_splits(n, n_splits, embargo) {
            let mut last_test_start = 0;
            for f in &folds {
                prop_assert!(!f.train.is_empty() && !f.test.is_empty());
                prop_assert_eq!(f.train.start, 0);
                prop_assert!(f.train.end + embargo <= f.test.start);
                prop_assert!(f.test.end <= n);
                prop_assert!(f.test.start >= last_test_start);
                last_test_start = f.test.start;
            }
        }
    }

    #[test]
    fn purging_keeps_embargo(n in 30usize..200, embargo in 0usize..10, hold in 1usize..20) {
        let entry_bars: Vec<usize> = (0..n).map(|k| k * 3).collect();
        let horizon_ends: Vec<usize> = entry_bars.iter().map(|b| b + hold).collect();
        for f in purged_splits(n, 3, embargo).unwrap() {
            if let Some(p) = purge(&f, &entry_bars, &horizon_ends) {
                prop_assert!(p.train.end <= f.train.end);
                prop_assert!(p.train.end + embargo <= p.test.start);
                let first_test_bar = entry_bars[p.test.start];
                prop_assert!(p.train.clone().all(|k| horizon_ends[k] < first_test_bar));
            }
        }
    }
}

// ── 2. Ensemble weights ──────────────────────────────────────────────

proptest! {
    #[test]
    fn normalized_weights_sum_to_one(raw in prop::collection::vec(0.0..5.0_f64, 1..4)) {
        let map: BTreeMap<LearnerKind, f64> = LearnerKind::ALL.iter().copied().zip(raw).collect();
        let w = normalize_weights(&map);
        prop_assert!(w.values().all(|v| *v >= 0.0));
        prop_assert!((w.values().sum::<f64>() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn optimized_weights_are_convex(
        p1 in prop::collection::vec(0.0..1.0_f64, 20),
        p2 in prop::collection::vec(0.0..1.0_f64, 20),
        y in prop::collection::vec(0u8..2, 20),
    ) {
        let oof = OofSet {
            y,
            fold: (0..20).map(|k| k / 10).collect(),
            probs: [(LearnerKind::Gbdt, p1), (LearnerKind::Logistic, p2)].into(),
        };
        let result = optimize(&oof, &EnsembleParams { trials: 8, seed: 3 }).unwrap();
        prop_assert!(result.weights.values().all(|v| *v >= 0.0));
        prop_assert!((result.weights.values().sum::<f64>() - 1.0).abs() < 1e-6);
        prop_assert!((0.5..=0.8).contains(&result.threshold));
    }
}

// ── 3. Label causality ───────────────────────────────────────────────

proptest! {
    #[test]
    fn positive_label_means_tp_first(
        closes in arb_closes(),
        sigma in 0.001..0.03_f64,
        max_holding in 1usize..30,
        long in any::<bool>(),
    ) {
        let candles = candles_from(&closes);
        let direction = if long { Side::Buy } else { Side::Sell };
        let entries: Vec<EntryEvent> = (0..candles.len()).step_by(3)
            .map(|index| EntryEvent { index, direction })
            .collect();
        let params = TripleBarrierParams { pt_mult: 2.0, sl_mult: 2.0, max_holding };
        let sig = vec![sigma; candles.len()];
        for l in label_entries_with_sigma(&candles, &entries, &sig, &params) {
            let d = direction.sign();
            let c0 = candles[l.entry].close;
            let tp = c0 * (1.0 + d * 2.0 * sigma);
            let sl = c0 * (1.0 - d * 2.0 * sigma);
            let hit_tp = |c: f64| if long { c >= tp } else { c <= tp };
            let hit_sl = |c: f64| if long { c <= sl } else { c >= sl };

            prop_assert!(l.horizon_end <= l.entry + max_holding);
            prop_assert!(l.horizon_end < candles.len());
            for c in candles.get(l.entry + 1..l.horizon_end).unwrap_or(&[]) {
                prop_assert!(!hit_tp(c.close) && !hit_sl(c.close));
            }
            if l.y == 1 {
                prop_assert_eq!(l.barrier, Barrier::TakeProfit);
                prop_assert!(hit_tp(candles[l.horizon_end].close));
            } else if l.barrier == Barrier::StopLoss {
                prop_assert!(hit_sl(candles[l.horizon_end].close));
            }
        }
    }
}

// ── 4. Sizer ─────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn size_non_negative_and_monotone_in_equity(
        metrics in arb_metrics(),
        e1 in -1_000.0..1_000_000.0_f64,
        extra in 0.0..1_000_000.0_f64,
        auto in any::<bool>(),
    ) {
        let mode = if auto { RiskMode::Auto } else { RiskMode::Fixed };
        let sizer = build_sizer(mode, 0.5, 1.0, 2.0);
        let candles = synthetic_candles(60, Timeframe::H1, 1);
        let a = sizer.size(e1, &candles, &metrics).qty;
        let b = sizer.size(e1 + extra, &candles, &metrics).qty;
        prop_assert!(a >= 0.0);
        prop_assert!(b >= a);
        let r = sizer.risk_fraction(&metrics);
        prop_assert!((0.001..=0.01).contains(&r));
    }
}

// ── 5–6. Features and candles ────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn feature_builder_is_deterministic(seed in any::<u64>(), n in 0usize..200) {
        let candles = synthetic_candles(n, Timeframe::M15, seed);
        let a = FeatureMatrix::build(&candles, FeatureSet::Extended);
        let b = FeatureMatrix::build(&candles, FeatureSet::Extended);
        for name in a.names() {
            let (x, y) = (a.column(name).unwrap(), b.column(name).unwrap());
            prop_assert!(x.iter().zip(y).all(|(p, q)| p.to_bits() == q.to_bits()));
        }
    }

    #[test]
    fn normalized_candles_strictly_increase(order in Just((0..40usize).collect::<Vec<_>>()).prop_shuffle(), dup in 0usize..40) {
        let base = synthetic_candles(40, Timeframe::H1, 5);
        let mut shuffled: Vec<Candle> = order.iter().map(|&i| base[i].clone()).collect();
        shuffled.push(base[dup].clone());
        let normalized = normalize_candles(shuffled);
        prop_assert_eq!(normalized.len(), 40);
        prop_assert!(validate_candles(&normalized).is_ok());
        prop_assert!(normalized.windows(2).all(|w| w[0].time < w[1].time));
    }
}
