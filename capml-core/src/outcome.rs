//! Stage outcomes and stable reason codes.
//!
//! Every pipeline stage returns an `Outcome` instead of relying on errors for
//! normal control flow. Reason codes are stable snake_case strings suitable
//! for logs and JSON reports.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a stage declined to produce a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoData,
    InsufficientRows,
    NoEntries,
    DegenerateLabels,
    NoFolds,
    NoLearners,
    BrokerUnavailable,
}

impl SkipReason {
    pub fn code(self) -> &'static str {
        match self {
            SkipReason::NoData => "no_data",
            SkipReason::InsufficientRows => "insufficient_rows",
            SkipReason::NoEntries => "no_entries",
            SkipReason::DegenerateLabels => "degenerate_labels",
            SkipReason::NoFolds => "no_folds",
            SkipReason::NoLearners => "no_learners",
            SkipReason::BrokerUnavailable => "broker_unavailable",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// `Ok(value) | Skip(reason) | Fail(message)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum Outcome<T> {
    Ok(T),
    Skip(SkipReason),
    Fail(String),
}

impl<T> Outcome<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok(_))
    }

    pub fn ok(self) -> Option<T> {
        match self {
            Outcome::Ok(v) => Some(v),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Ok(v) => Outcome::Ok(f(v)),
            Outcome::Skip(r) => Outcome::Skip(r),
            Outcome::Fail(e) => Outcome::Fail(e),
        }
    }

    /// Short status label: the value-less form used in summaries.
    pub fn label(&self) -> String {
        match self {
            Outcome::Ok(_) => "ok".to_string(),
            Outcome::Skip(r) => format!("skip({r})"),
            Outcome::Fail(e) => format!("fail({e})"),
        }
    }
}
