//! Purged walk-forward cross-validation.
//!
//! Expanding train windows followed by contiguous test windows, separated by
//! an embargo gap. Indices are sample positions (one per labeled entry).
//!
//! For `N` samples and `n_splits`: `fold = N / (n_splits + 1)`; split `i` has
//! `test = [(i+1)·fold, min((i+2)·fold, N))` and
//! `train = [0, max(0, (i+1)·fold − embargo))`.

use serde::{Deserialize, Serialize};
use std::ops::Range;
use thiserror::Error;

// ─── Types ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fold {
    pub index: usize,
    pub train: Range<usize>,
    pub test: Range<usize>,
}

impl Fold {
    /// Gap between the last train sample and the first test sample.
    pub fn gap(&self) -> usize {
        self.test.start - self.train.end
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CvError {
    #[error("n_splits must be >= 2, got {0}")]
    TooFewSplits(usize),
    #[error("cannot split {n} samples into {n_splits} folds")]
    TooFewSamples { n: usize, n_splits: usize },
}

// ─── Splitting ───────────────────────────────────────────────────────

/// Chronological purged splits. Folds with an empty train or test range are
/// omitted; an error is returned only when the sizes make every fold empty.
pub fn purged_splits(n: usize, n_splits: usize, embargo: usize) -> Result<Vec<Fold>, CvError> {
    if n_splits < 2 {
        return Err(CvError::TooFewSplits(n_splits));
    }
    let fold = n / (n_splits + 1);
    if fold == 0 {
        return Err(CvError::TooFewSamples { n, n_splits });
    }

    let folds = (0..n_splits)
        .filter_map(|i| {
            let train_end = (i + 1) * fold;
            let test = train_end..((i + 2) * fold).min(n);
            let train = 0..train_end.saturating_sub(embargo);
            (!train.is_empty() && !test.is_empty()).then_some(Fold { index: i, train, test })
        })
        .collect();
    Ok(folds)
}

/// Truncate a fold's train prefix so that no training label resolves at or
/// after the bar of the first test entry.
///
/// `entry_bars[k]` and `horizon_ends[k]` are the entry bar and label
/// resolution bar of sample `k`. Returns `None` when nothing survives.
pub fn purge(fold: &Fold, entry_bars: &[usize], horizon_ends: &[usize]) -> Option<Fold> {
    let first_test_bar = *entry_bars.get(fold.test.start)?;
    let cut = fold
        .train
        .clone()
        .find(|&k| horizon_ends.get(k).map_or(true, |&h| h >= first_test_bar))
        .unwrap_or(fold.train.end);
    (cut > 0).then(|| Fold {
        index: fold.index,
        train: 0..cut,
        test: fold.test.clone(),
    })
}
