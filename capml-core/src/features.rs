//! Feature Builder: candles → feature matrix aligned 1:1 with the candle index.
//!
//! Deterministic and causal (every window closes at the current bar). Warmup
//! NaNs are kept in the matrix; training drops incomplete rows, inference
//! fills them (forward, then backward, then zero).

use crate::domain::Candle;
use crate::indicators::{
    Adx, Atr, Ema, EmaDiff, HighLowRange, Indicator, MacdHist, Obv, Ret1, ReturnStd, ReturnZScore,
    Rsi, Sma, SmaDiff, StochK,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureSet {
    #[default]
    Minimal,
    Extended,
}

impl FromStr for FeatureSet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "minimal" => Ok(FeatureSet::Minimal),
            "extended" => Ok(FeatureSet::Extended),
            _ => Err(format!("unknown feature set '{s}'")),
        }
    }
}

impl FeatureSet {
    pub fn indicators(self) -> Vec<Box<dyn Indicator>> {
        let mut out: Vec<Box<dyn Indicator>> = vec![
            Box::new(Sma::new(20)),
            Box::new(Sma::new(50)),
            Box::new(SmaDiff::new(20, 50)),
            Box::new(Ema::new(21)),
            Box::new(Ema::new(50)),
            Box::new(EmaDiff::new(21, 50)),
            Box::new(Rsi::new(14)),
            Box::new(MacdHist::standard()),
            Box::new(Ret1),
            Box::new(ReturnZScore::new(50)),
            Box::new(ReturnStd::new(50)),
            Box::new(HighLowRange::new(14)),
        ];
        if self == FeatureSet::Extended {
            out.push(Box::new(Atr::new(14)));
            out.push(Box::new(Obv));
            out.push(Box::new(StochK::new(14)));
            out.push(Box::new(Adx::new(14)));
        }
        out
    }

    pub fn names(self) -> Vec<String> {
        self.indicators().iter().map(|i| i.name().to_string()).collect()
    }

    /// Bars consumed by warmup before every feature is defined.
    pub fn warmup(self) -> usize {
        self.indicators().iter().map(|i| i.lookback()).max().unwrap_or(0)
    }
}

/// Column-major feature matrix with named columns.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    names: Vec<String>,
    columns: Vec<Vec<f64>>,
    rows: usize,
}

impl FeatureMatrix {
    pub fn build(candles: &[Candle], set: FeatureSet) -> Self {
        let indicators = set.indicators();
        let names = indicators.iter().map(|i| i.name().to_string()).collect();
        let columns = indicators.iter().map(|i| i.compute(candles)).collect();
        Self {
            names,
            columns,
            rows: candles.len(),
        }
    }

    /// Assemble from explicit columns. Every column must have `rows` values.
    pub fn from_columns(names: Vec<String>, columns: Vec<Vec<f64>>) -> Option<Self> {
        if names.len() != columns.len() {
            return None;
        }
        let rows = columns.first().map_or(0, Vec::len);
        if columns.iter().any(|c| c.len() != rows) {
            return None;
        }
        Some(Self { names, columns, rows })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn n_rows(&self) -> usize {
        self.rows
    }

    pub fn n_cols(&self) -> usize {
        self.names.len()
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|j| self.columns[j].as_slice())
    }

    pub fn row(&self, i: usize) -> Vec<f64> {
        self.columns.iter().map(|c| c[i]).collect()
    }

    /// No NaN or infinite value in row `i`.
    pub fn is_complete(&self, i: usize) -> bool {
        self.columns.iter().all(|c| c[i].is_finite())
    }

    /// Rows for the given indices, in order.
    pub fn select_rows(&self, indices: &[usize]) -> Vec<Vec<f64>> {
        indices.iter().map(|&i| self.row(i)).collect()
    }

    /// Fill non-finite values per column: forward fill, then backward fill,
    /// then zero. Used only at inference.
    pub fn fill_for_inference(&mut self) {
        for col in &mut self.columns {
            let mut last = None;
            for v in col.iter_mut() {
                if v.is_finite() {
                    last = Some(*v);
                } else if let Some(l) = last {
                    *v = l;
                }
            }
            if let Some(first_valid) = col.iter().copied().find(|v| v.is_finite()) {
                for v in col.iter_mut() {
                    if v.is_finite() {
                        break;
                    }
                    *v = first_valid;
                }
            }
            for v in col.iter_mut() {
                if !v.is_finite() {
                    *v = 0.0;
                }
            }
        }
    }

    /// Row `i` reordered to `names`; features this matrix lacks become 0.
    pub fn reindexed_row(&self, i: usize, names: &[String]) -> Vec<f64> {
        let index: HashMap<&str, usize> = self
            .names
            .iter()
            .enumerate()
            .map(|(j, n)| (n.as_str(), j))
            .collect();
        names
            .iter()
            .map(|n| index.get(n.as_str()).map_or(0.0, |&j| self.columns[j][i]))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::synthetic_candles;
    use crate::domain::Timeframe;

    #[test]
    fn minimal_and_extended_names() {
        let minimal = FeatureSet::Minimal.names();
        assert_eq!(minimal.len(), 12);
        assert_eq!(minimal[0], "sma_20");
        assert!(minimal.contains(&"macd_hist".to_string()));
        let extended = FeatureSet::Extended.names();
        assert_eq!(extended.len(), 16);
        assert!(extended.ends_with(&["atr_14".into(), "obv".into(), "stoch_k_14".into(), "adx_14".into()]));
    }

    #[test]
    fn build_is_deterministic() {
        let candles = synthetic_candles(300, Timeframe::H1, 11);
        let a = FeatureMatrix::build(&candles, FeatureSet::Extended);
        let b = FeatureMatrix::build(&candles, FeatureSet::Extended);
        assert_eq!(a.n_rows(), 300);
        // NaN != NaN, so compare bit patterns
        for j in 0..a.n_cols() {
            let ca = a.column(&a.names()[j]).unwrap();
            let cb = b.column(&b.names()[j]).unwrap();
            assert!(ca.iter().zip(cb).all(|(x, y)| x.to_bits() == y.to_bits()));
        }
    }

    #[test]
    fn warmup_rows_incomplete_then_complete() {
        let candles = synthetic_candles(200, Timeframe::H1, 5);
        let fm = FeatureMatrix::build(&candles, FeatureSet::Minimal);
        let warmup = FeatureSet::Minimal.warmup();
        assert!(!fm.is_complete(warmup - 1));
        assert!((warmup..200).all(|i| fm.is_complete(i)));
    }

    #[test]
    fn inference_fill_leaves_no_nan() {
        let candles = synthetic_candles(30, Timeframe::H1, 5);
        let mut fm = FeatureMatrix::build(&candles, FeatureSet::Extended);
        fm.fill_for_inference();
        assert!((0..30).all(|i| fm.is_complete(i)));
        // sma_20 warmup back-filled from its first value
        let sma = fm.column("sma_20").unwrap();
        assert_eq!(sma[0], sma[19]);
        // sma_50 never defined on 30 bars → zero
        assert!(fm.column("sma_50").unwrap().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn reindex_fills_missing_with_zero() {
        let fm = FeatureMatrix::from_columns(
            vec!["a".into(), "b".into()],
            vec![vec![1.0, 2.0], vec![3.0, 4.0]],
        )
        .unwrap();
        let row = fm.reindexed_row(1, &["b".into(), "c".into(), "a".into()]);
        assert_eq!(row, vec![4.0, 0.0, 2.0]);
    }

    #[test]
    fn from_columns_rejects_ragged() {
        assert!(FeatureMatrix::from_columns(vec!["a".into()], vec![vec![1.0], vec![2.0]]).is_none());
        assert!(FeatureMatrix::from_columns(
            vec!["a".into(), "b".into()],
            vec![vec![1.0], vec![2.0, 3.0]]
        )
        .is_none());
    }
}
