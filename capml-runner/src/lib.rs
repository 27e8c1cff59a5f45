//! capml runner: the processes built on `capml-core`.
//!
//! This crate provides:
//! - TOML configuration with validation and broker credentials from the environment
//! - The offline training pipeline (per-pair stages, bounded worker pool)
//! - Registry re-evaluation and active-set selection
//! - Position book with a JSONL transition log
//! - Idempotent Order Router (dry run or live)
//! - Frequency Controller (daily tallies, hourly τ calibration)
//! - The Live Loop

pub mod config;
pub mod evaluate;
pub mod frequency;
pub mod live;
pub mod positions;
pub mod router;
pub mod training;

pub use config::{BotConfig, ConfigError, DEFAULT_CONFIG_FILE};
pub use evaluate::{
    active_universe, composite_score, evaluate_entry, evaluate_registry, select_top, ActivePair, ActiveSet,
    EvaluationReport, PairEvaluation, ScoreSource,
};
pub use frequency::{calibrated_threshold, FrequencyController, FrequencyState, ThresholdUpdate};
pub use live::{IterationOutcome, LiveError, LiveLoop, LoopSummary};
pub use positions::{OpenFill, PositionBook, PositionError, PositionEvent, PositionState, PositionStatus, Transition};
pub use router::{OrderRouter, RefusalReason, RouteResult};
pub use training::{time_decay_weights, Dataset, TrainReport, TrainStage, Trainer};

#[cfg(test)]
mod send_sync_checks {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn config_is_send_sync() {
        assert_send::<BotConfig>();
        assert_sync::<BotConfig>();
    }

    #[test]
    fn trainer_is_send_sync() {
        assert_send::<Trainer>();
        assert_sync::<Trainer>();
    }

    #[test]
    fn train_report_is_send_sync() {
        assert_send::<TrainReport>();
        assert_sync::<TrainReport>();
    }

    #[test]
    fn router_is_send_sync() {
        assert_send::<OrderRouter>();
        assert_sync::<OrderRouter>();
    }

    #[test]
    fn position_types_are_send_sync() {
        assert_send::<PositionBook>();
        assert_sync::<PositionBook>();
        assert_send::<PositionEvent>();
        assert_sync::<PositionEvent>();
    }

    #[test]
    fn iteration_outcome_is_send_sync() {
        assert_send::<IterationOutcome>();
        assert_sync::<IterationOutcome>();
    }

    #[test]
    fn live_loop_is_send() {
        assert_send::<LiveLoop>();
    }

    #[test]
    fn reports_are_send_sync() {
        assert_send::<EvaluationReport>();
        assert_sync::<EvaluationReport>();
        assert_send::<ActiveSet>();
        assert_sync::<ActiveSet>();
    }
}
