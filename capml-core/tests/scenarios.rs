//! End-to-end scenarios through the public engine API.
//!
//! The tracer path: synthetic candles → features → entry events → meta-labels
//! → purged CV → per-learner OOF → ensemble → registry → gate.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};

use capml_core::cv::{purge, purged_splits};
use capml_core::data::synthetic_candles;
use capml_core::domain::{pair_key, Candle, Side, Timeframe};
use capml_core::ensemble::{optimize, EnsembleParams, OofSet};
use capml_core::features::{FeatureMatrix, FeatureSet};
use capml_core::gate::{Action, DecisionGate, GateConfig, HoldReason};
use capml_core::labeling::{label_entries, label_entries_with_sigma, Barrier, EntryEvent, EntryRule, TripleBarrierParams};
use capml_core::metrics::CvMetrics;
use capml_core::models::{LearnerKind, ModelArtifact};
use capml_core::registry::{ModelRegistry, RegistryEntry};

// ── Helpers ──────────────────────────────────────────────────────────

fn closes_to_candles(closes: &[f64]) -> Vec<Candle> {
    let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
    closes
        .iter()
        .enumerate()
        .map(|(i, &c)| Candle {
            time: start + Duration::hours(i as i64),
            open: c,
            high: c,
            low: c,
            close: c,
            volume: 10.0,
        })
        .collect()
}

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("capml_scenario_{name}_{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    dir
}

struct Dataset {
    rows: Vec<Vec<f64>>,
    y: Vec<f64>,
    entry_bars: Vec<usize>,
    horizon_ends: Vec<usize>,
    names: Vec<String>,
}

fn dataset(candles: &[Candle]) -> Dataset {
    let features = FeatureMatrix::build(candles, FeatureSet::Minimal);
    let entries = EntryRule::MacdCross.entries(candles);
    let labels = label_entries(candles, &entries, &TripleBarrierParams::default(), 50);
    let kept: Vec<_> = labels.into_iter().filter(|l| features.is_complete(l.entry)).collect();
    let idx: Vec<usize> = kept.iter().map(|l| l.entry).collect();
    Dataset {
        rows: features.select_rows(&idx),
        y: kept.iter().map(|l| f64::from(l.y)).collect(),
        entry_bars: idx,
        horizon_ends: kept.iter().map(|l| l.horizon_end).collect(),
        names: features.names().to_vec(),
    }
}

// ── Labeling scenarios ───────────────────────────────────────────────

#[test]
fn long_entry_takes_profit_on_second_bar() {
    let candles = closes_to_candles(&[100.0, 101.0, 102.2, 99.0]);
    let entries = [EntryEvent { index: 0, direction: Side::Buy }];
    let params = TripleBarrierParams { pt_mult: 2.0, sl_mult: 2.0, max_holding: 3 };
    let labels = label_entries_with_sigma(&candles, &entries, &[0.01; 4], &params);
    assert_eq!(labels.len(), 1);
    assert_eq!(labels[0].y, 1);
    assert_eq!(labels[0].barrier, Barrier::TakeProfit);
    assert_eq!(labels[0].horizon_end, 2);
    assert!((labels[0].ret - 0.022).abs() < 1e-9);
}

#[test]
fn long_entry_stopped_out_first() {
    let candles = closes_to_candles(&[100.0, 99.0, 97.9, 103.0]);
    let entries = [EntryEvent { index: 0, direction: Side::Buy }];
    let params = TripleBarrierParams { pt_mult: 2.0, sl_mult: 2.0, max_holding: 3 };
    let labels = label_entries_with_sigma(&candles, &entries, &[0.01; 4], &params);
    assert_eq!(labels[0].y, 0);
    assert_eq!(labels[0].barrier, Barrier::StopLoss);
    assert_eq!(labels[0].horizon_end, 2);
}

// ── CV scenario ──────────────────────────────────────────────────────

#[test]
fn two_splits_with_embargo_three() {
    let folds = purged_splits(24, 2, 3).unwrap();
    let ranges: Vec<_> = folds.iter().map(|f| (f.train.clone(), f.test.clone())).collect();
    assert_eq!(ranges, vec![(0..5, 8..16), (0..13, 16..24)]);
}

// ── Full pipeline ────────────────────────────────────────────────────

#[test]
fn synthetic_pipeline_registers_a_usable_model() {
    let candles = synthetic_candles(1500, Timeframe::H1, 11);
    let data = dataset(&candles);
    assert!(data.rows.len() >= 20, "expected enough entries, got {}", data.rows.len());
    assert!(data.rows.iter().all(|r| r.len() == data.names.len()));

    let n = data.rows.len();
    let learners = [LearnerKind::Gbdt, LearnerKind::Logistic];
    let mut probs: BTreeMap<LearnerKind, Vec<f64>> = learners.iter().map(|k| (*k, vec![f64::NAN; n])).collect();
    let mut fold_of = vec![usize::MAX; n];
    let weights = vec![1.0; n];

    for fold in purged_splits(n, 3, 2).unwrap() {
        let Some(fold) = purge(&fold, &data.entry_bars, &data.horizon_ends) else {
            continue;
        };
        let train_y = &data.y[fold.train.clone()];
        if train_y.iter().all(|v| *v == train_y[0]) {
            continue;
        }
        for kind in learners {
            let model = ModelArtifact::fit(kind, &data.rows[fold.train.clone()], train_y, &weights[fold.train.clone()], 7).unwrap();
            let p = model.predict_positive(&data.rows[fold.test.clone()]).unwrap();
            let slot = probs.get_mut(&kind).unwrap();
            slot[fold.test.clone()].copy_from_slice(&p);
        }
        for k in fold.test.clone() {
            fold_of[k] = fold.index;
        }
    }

    // keep samples that received an OOF prediction
    let scored: Vec<usize> = (0..n).filter(|k| fold_of[*k] != usize::MAX).collect();
    assert!(!scored.is_empty());
    let oof = OofSet {
        y: scored.iter().map(|k| data.y[*k] as u8).collect(),
        fold: scored.iter().map(|k| fold_of[*k]).collect(),
        probs: probs
            .iter()
            .map(|(kind, p)| (*kind, scored.iter().map(|k| p[*k]).collect()))
            .collect(),
    };
    assert!(oof.probs.values().flatten().all(|p| (0.0..=1.0).contains(p)));

    let result = optimize(&oof, &EnsembleParams { trials: 20, seed: 42 }).unwrap();
    assert!((result.weights.values().sum::<f64>() - 1.0).abs() < 1e-6);
    assert!((0.5..=0.8).contains(&result.threshold));

    // fit on everything, persist, and ask the gate
    let registry = Arc::new(ModelRegistry::open(scratch_dir("pipeline")));
    let key = pair_key("SYN", Timeframe::H1);
    let mut artifact_paths = BTreeMap::new();
    for kind in learners {
        let model = ModelArtifact::fit(kind, &data.rows, &data.y, &weights, 7).unwrap();
        artifact_paths.insert(kind, registry.save_artifact(&key, &model).unwrap());
    }
    let entry = RegistryEntry {
        key,
        symbol: "SYN".into(),
        timeframe: Timeframe::H1,
        strategy_tag: EntryRule::MacdCross.strategy_tag().into(),
        feature_names: data.names.clone(),
        threshold: result.threshold,
        cv_score: result.score.pf,
        entries: n,
        trained_at: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
        artifact_paths,
        ensemble_weights: Some(result.weights.clone()),
        triple_barrier_params: TripleBarrierParams::default(),
        feature_set: FeatureSet::Minimal,
        cv_metrics: CvMetrics::default(),
        per_model_pf: result.per_model.clone(),
    };
    registry.upsert(entry.clone()).unwrap();
    assert_eq!(registry.latest("SYN", Timeframe::H1).unwrap(), Some(entry));

    let gate = DecisionGate::new(Arc::clone(&registry), GateConfig::default());
    let d = gate.decide("SYN", Timeframe::H1, &candles);
    let p = d.p_hat.expect("gate should score the last bar");
    assert!((0.0..=1.0).contains(&p));
    assert_eq!(d.components.len(), 2);
    match d.action {
        Action::Buy => assert!(p >= result.threshold),
        Action::Sell => panic!("shorts are disabled by default"),
        Action::Hold => assert!(matches!(
            d.reason,
            Some(HoldReason::BelowThreshold) | Some(HoldReason::ShortDisabled)
        )),
    }

    let unknown = gate.decide("OTHER", Timeframe::H1, &candles);
    assert_eq!(unknown.reason, Some(HoldReason::NoRegistryEntry));
    let short = gate.decide("SYN", Timeframe::H1, &candles[..50]);
    assert_eq!(short.reason, Some(HoldReason::InsufficientBars));

    let _ = fs::remove_dir_all(registry.root());
}
