//! capml core: the engine behind the trading bot.
//!
//! This crate has no process state of its own:
//! - Domain types (candles, timeframes, sides, model keys) and stage outcomes
//! - Broker access (Capital.com REST), epic resolution and the candle cache
//! - Indicators and the Feature Builder
//! - Entry rules and triple-barrier meta-labels
//! - Purged walk-forward CV
//! - Base learners, the Ensemble Optimizer and the Model Registry
//! - Decision Gate and Position Sizers

pub mod cv;
pub mod data;
pub mod domain;
pub mod ensemble;
pub mod features;
pub mod gate;
pub mod indicators;
pub mod labeling;
pub mod metrics;
pub mod models;
pub mod outcome;
pub mod persist;
pub mod registry;
pub mod sizing;

pub use outcome::{Outcome, SkipReason};
