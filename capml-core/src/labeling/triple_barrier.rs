//! Triple-barrier meta-labeling.
//!
//! For an entry at bar `i` with direction `d` and volatility `σ_i`:
//! `tp = close_i·(1 + d·pt_mult·σ_i)`, `sl = close_i·(1 − d·sl_mult·σ_i)`.
//! Bars `i+1 ..= min(i+max_holding, N−1)` are scanned in order; the first
//! take-profit touch gives y=1, the first stop touch gives y=0, and a
//! horizon timeout also gives y=0.

use super::EntryEvent;
use crate::domain::{Candle, Side};
use crate::indicators::ewm_std;
use crate::indicators::series::pct_change;
use serde::{Deserialize, Serialize};

pub const SIGMA_FLOOR: f64 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TripleBarrierParams {
    pub pt_mult: f64,
    pub sl_mult: f64,
    pub max_holding: usize,
}

impl Default for TripleBarrierParams {
    fn default() -> Self {
        Self {
            pt_mult: 2.0,
            sl_mult: 2.0,
            max_holding: 24,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Barrier {
    TakeProfit,
    StopLoss,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetaLabel {
    pub entry: usize,
    pub direction: Side,
    pub y: u8,
    /// Bar at which the label resolved (barrier touch or horizon end).
    pub horizon_end: usize,
    pub barrier: Barrier,
    /// Direction-adjusted close-to-close return from entry to `horizon_end`.
    pub ret: f64,
}

/// 1-bar return volatility: EWM std over `span`, floored, NaN → floor.
pub fn volatility_series(candles: &[Candle], span: usize) -> Vec<f64> {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    ewm_std(&pct_change(&closes), span)
        .into_iter()
        .map(|s| if s.is_finite() { s.max(SIGMA_FLOOR) } else { SIGMA_FLOOR })
        .collect()
}

/// Label entries using EWM volatility of span `vol_span`.
pub fn label_entries(
    candles: &[Candle],
    entries: &[EntryEvent],
    params: &TripleBarrierParams,
    vol_span: usize,
) -> Vec<MetaLabel> {
    let sigma = volatility_series(candles, vol_span);
    label_entries_with_sigma(candles, entries, &sigma, params)
}

/// Label entries against an explicit per-bar volatility series.
/// Entries outside the candle range are ignored.
pub fn label_entries_with_sigma(
    candles: &[Candle],
    entries: &[EntryEvent],
    sigma: &[f64],
    params: &TripleBarrierParams,
) -> Vec<MetaLabel> {
    let n = candles.len();
    entries
        .iter()
        .filter(|e| e.index < n)
        .map(|e| label_one(candles, e, sigma.get(e.index).copied(), params))
        .collect()
}

fn label_one(
    candles: &[Candle],
    entry: &EntryEvent,
    sigma: Option<f64>,
    params: &TripleBarrierParams,
) -> MetaLabel {
    let i = entry.index;
    let d = entry.direction.sign();
    let sigma = sigma
        .filter(|s| s.is_finite())
        .map_or(SIGMA_FLOOR, |s| s.max(SIGMA_FLOOR));
    let c0 = candles[i].close;
    let tp = c0 * (1.0 + d * params.pt_mult * sigma);
    let sl = c0 * (1.0 - d * params.sl_mult * sigma);

    let last = (i + params.max_holding).min(candles.len() - 1);
    let mut horizon_end = last;
    let mut barrier = Barrier::Timeout;
    for (j, candle) in candles.iter().enumerate().take(last + 1).skip(i + 1) {
        let c = candle.close;
        let (hit_tp, hit_sl) = match entry.direction {
            Side::Buy => (c >= tp, c <= sl),
            Side::Sell => (c <= tp, c >= sl),
        };
        if hit_tp {
            barrier = Barrier::TakeProfit;
        } else if hit_sl {
            barrier = Barrier::StopLoss;
        } else {
            continue;
        }
        horizon_end = j;
        break;
    }

    MetaLabel {
        entry: i,
        direction: entry.direction,
        y: u8::from(barrier == Barrier::TakeProfit),
        horizon_end,
        barrier,
        ret: d * (candles[horizon_end].close / c0 - 1.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::make_candles;

    fn params(max_holding: usize) -> TripleBarrierParams {
        TripleBarrierParams {
            pt_mult: 2.0,
            sl_mult: 2.0,
            max_holding,
        }
    }

    fn long_at(index: usize) -> EntryEvent {
        EntryEvent {
            index,
            direction: Side::Buy,
        }
    }

    #[test]
    fn take_profit_hit() {
        let candles = make_candles(&[100.0, 100.5, 102.2, 101.0, 99.5]);
        let sigma = vec![0.01; candles.len()];
        let labels = label_entries_with_sigma(&candles, &[long_at(0)], &sigma, &params(4));
        assert_eq!(labels.len(), 1);
        let l = labels[0];
        assert_eq!(l.y, 1);
        assert_eq!(l.barrier, Barrier::TakeProfit);
        assert_eq!(l.horizon_end, 2);
        assert!((l.ret - 0.022).abs() < 1e-9);
    }

    #[test]
    fn stop_loss_hit() {
        let candles = make_candles(&[100.0, 99.0, 97.5, 97.9]);
        let sigma = vec![0.01; candles.len()];
        let labels = label_entries_with_sigma(&candles, &[long_at(0)], &sigma, &params(4));
        let l = labels[0];
        assert_eq!(l.y, 0);
        assert_eq!(l.barrier, Barrier::StopLoss);
        assert_eq!(l.horizon_end, 2);
    }

    #[test]
    fn timeout_is_negative() {
        let candles = make_candles(&[100.0, 100.5, 101.0, 100.2, 103.0]);
        let sigma = vec![0.01; candles.len()];
        let labels = label_entries_with_sigma(&candles, &[long_at(0)], &sigma, &params(3));
        let l = labels[0];
        assert_eq!(l.y, 0);
        assert_eq!(l.barrier, Barrier::Timeout);
        assert_eq!(l.horizon_end, 3);
    }

    #[test]
    fn short_entry_mirrors_barriers() {
        let candles = make_candles(&[100.0, 99.5, 97.9, 99.0]);
        let sigma = vec![0.01; candles.len()];
        let short = EntryEvent {
            index: 0,
            direction: Side::Sell,
        };
        let labels = label_entries_with_sigma(&candles, &[short], &sigma, &params(4));
        assert_eq!(labels[0].y, 1);
        assert_eq!(labels[0].horizon_end, 2);
        assert!(labels[0].ret > 0.0);
    }

    #[test]
    fn last_bar_entry_times_out_in_place() {
        let candles = make_candles(&[100.0, 101.0]);
        let sigma = vec![0.01; 2];
        let labels = label_entries_with_sigma(&candles, &[long_at(1)], &sigma, &params(4));
        assert_eq!(labels[0].horizon_end, 1);
        assert_eq!(labels[0].barrier, Barrier::Timeout);
        assert_eq!(labels[0].ret, 0.0);
    }

    #[test]
    fn sigma_is_floored() {
        let candles = make_candles(&[100.0; 10]);
        let sigma = volatility_series(&candles, 50);
        assert!(sigma.iter().all(|s| *s == SIGMA_FLOOR));
    }

    #[test]
    fn out_of_range_entries_ignored() {
        let candles = make_candles(&[100.0, 101.0]);
        let labels = label_entries(&candles, &[long_at(5)], &params(4), 50);
        assert!(labels.is_empty());
    }
}
