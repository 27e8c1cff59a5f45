//! Position book: per-(symbol, tf) open/closed state owned by the live loop.
//!
//! At most one open position per pair. Every transition rewrites
//! `positions.json` atomically and appends one line to `position_log.jsonl`.
//!
//! ```text
//! CLOSED --open--> OPEN --close--> CLOSED
//! CLOSED --reject--> CLOSED
//! ```

use capml_core::domain::{pair_key, Side, Timeframe};
use capml_core::persist::{read_json, write_json_atomic};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

pub const POSITIONS_FILE: &str = "positions.json";
pub const POSITION_LOG_FILE: &str = "position_log.jsonl";

#[derive(Debug, Error)]
pub enum PositionError {
    #[error("position already open for '{key}'")]
    AlreadyOpen { key: String },

    #[error("position state I/O: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionState {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub status: PositionStatus,
    pub opened_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub direction: Option<Side>,
    pub size: f64,
    /// Side of the most recent actionable signal, routed or not.
    pub last_signal: Option<Side>,
    pub epic: Option<String>,
    pub broker_ref: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
}

impl PositionState {
    fn closed(symbol: &str, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.to_string(),
            timeframe,
            status: PositionStatus::Closed,
            opened_at: None,
            closed_at: None,
            direction: None,
            size: 0.0,
            last_signal: None,
            epic: None,
            broker_ref: None,
            dry_run: false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Open,
    Close,
    Reject,
}

/// One line of the transition log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionEvent {
    pub at: DateTime<Utc>,
    pub key: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub transition: Transition,
    pub direction: Option<Side>,
    pub size: f64,
    pub reason: Option<String>,
    pub broker_ref: Option<String>,
}

/// What the book needs to record a freshly routed order.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenFill {
    pub direction: Side,
    pub size: f64,
    pub epic: Option<String>,
    pub broker_ref: Option<String>,
    pub dry_run: bool,
}

pub struct PositionBook {
    path: PathBuf,
    log_path: PathBuf,
    positions: BTreeMap<String, PositionState>,
}

impl PositionBook {
    /// Load the book from `state_dir`, starting empty when no file exists.
    pub fn open(state_dir: &Path) -> Result<Self, PositionError> {
        let path = state_dir.join(POSITIONS_FILE);
        let positions = read_json(&path)?.unwrap_or_default();
        Ok(Self {
            path,
            log_path: state_dir.join(POSITION_LOG_FILE),
            positions,
        })
    }

    pub fn get(&self, symbol: &str, timeframe: Timeframe) -> Option<&PositionState> {
        self.positions.get(&pair_key(symbol, timeframe))
    }

    pub fn is_open(&self, symbol: &str, timeframe: Timeframe) -> bool {
        self.get(symbol, timeframe).is_some_and(PositionState::is_open)
    }

    pub fn open_positions(&self) -> impl Iterator<Item = &PositionState> {
        self.positions.values().filter(|p| p.is_open())
    }

    pub fn open_count(&self) -> usize {
        self.open_positions().count()
    }

    /// CLOSED → OPEN. Refuses a second open for the same pair.
    pub fn record_open(
        &mut self,
        symbol: &str,
        timeframe: Timeframe,
        fill: OpenFill,
        at: DateTime<Utc>,
    ) -> Result<(), PositionError> {
        let key = pair_key(symbol, timeframe);
        if self.positions.get(&key).is_some_and(PositionState::is_open) {
            return Err(PositionError::AlreadyOpen { key });
        }
        let state = PositionState {
            symbol: symbol.to_string(),
            timeframe,
            status: PositionStatus::Open,
            opened_at: Some(at),
            closed_at: None,
            direction: Some(fill.direction),
            size: fill.size,
            last_signal: Some(fill.direction),
            epic: fill.epic,
            broker_ref: fill.broker_ref.clone(),
            dry_run: fill.dry_run,
        };
        self.positions.insert(key.clone(), state);
        self.save()?;
        info!(key = %key, side = %fill.direction, size = fill.size, "position opened");
        self.append(&PositionEvent {
            at,
            key,
            symbol: symbol.to_string(),
            timeframe,
            transition: Transition::Open,
            direction: Some(fill.direction),
            size: fill.size,
            reason: None,
            broker_ref: fill.broker_ref,
        })
    }

    /// OPEN → CLOSED. Returns false when nothing was open.
    pub fn record_close(
        &mut self,
        symbol: &str,
        timeframe: Timeframe,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, PositionError> {
        let key = pair_key(symbol, timeframe);
        let Some(state) = self.positions.get_mut(&key).filter(|p| p.is_open()) else {
            return Ok(false);
        };
        state.status = PositionStatus::Closed;
        state.closed_at = Some(at);
        let event = PositionEvent {
            at,
            key: key.clone(),
            symbol: symbol.to_string(),
            timeframe,
            transition: Transition::Close,
            direction: state.direction,
            size: state.size,
            reason: Some(reason.to_string()),
            broker_ref: state.broker_ref.clone(),
        };
        self.save()?;
        info!(key = %key, reason, "position closed");
        self.append(&event)?;
        Ok(true)
    }

    /// CLOSED → CLOSED: remember the signal, log the refusal. An open
    /// position is left untouched.
    pub fn record_reject(
        &mut self,
        symbol: &str,
        timeframe: Timeframe,
        side: Side,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), PositionError> {
        let key = pair_key(symbol, timeframe);
        let state = self
            .positions
            .entry(key.clone())
            .or_insert_with(|| PositionState::closed(symbol, timeframe));
        if !state.is_open() {
            state.last_signal = Some(side);
            self.save()?;
        }
        self.append(&PositionEvent {
            at,
            key,
            symbol: symbol.to_string(),
            timeframe,
            transition: Transition::Reject,
            direction: Some(side),
            size: 0.0,
            reason: Some(reason.to_string()),
            broker_ref: None,
        })
    }

    /// Close positions held for at least `max_holding` bars of their timeframe.
    pub fn expire(&mut self, max_holding: usize, now: DateTime<Utc>) -> Result<Vec<String>, PositionError> {
        let due: Vec<(String, Timeframe)> = self
            .open_positions()
            .filter(|p| {
                let held = Duration::seconds((p.timeframe.bar_seconds() as usize * max_holding) as i64);
                p.opened_at.is_some_and(|t| now - t >= held)
            })
            .map(|p| (p.symbol.clone(), p.timeframe))
            .collect();
        let mut closed = Vec::new();
        for (symbol, tf) in due {
            if self.record_close(&symbol, tf, "max_holding", now)? {
                closed.push(pair_key(&symbol, tf));
            }
        }
        Ok(closed)
    }

    /// Close live positions whose epic the broker no longer reports as open.
    /// Dry-run positions are left to expiry.
    pub fn reconcile(&mut self, broker_open: &[String], now: DateTime<Utc>) -> Result<Vec<String>, PositionError> {
        let open: HashSet<&str> = broker_open.iter().map(String::as_str).collect();
        let gone: Vec<(String, Timeframe)> = self
            .open_positions()
            .filter(|p| !p.dry_run)
            .filter(|p| p.epic.as_deref().is_some_and(|e| !open.contains(e)))
            .map(|p| (p.symbol.clone(), p.timeframe))
            .collect();
        let mut closed = Vec::new();
        for (symbol, tf) in gone {
            if self.record_close(&symbol, tf, "broker_closed", now)? {
                closed.push(pair_key(&symbol, tf));
            }
        }
        Ok(closed)
    }

    /// Every logged transition, oldest first. Malformed lines are skipped.
    pub fn read_log(&self) -> io::Result<Vec<PositionEvent>> {
        let file = match fs::File::open(&self.log_path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut events = Vec::new();
        for line in io::BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(event) = serde_json::from_str(&line) {
                events.push(event);
            }
        }
        Ok(events)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self) -> io::Result<()> {
        write_json_atomic(&self.path, &self.positions)
    }

    fn append(&self, event: &PositionEvent) -> Result<(), PositionError> {
        let json = serde_json::to_string(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if let Some(parent) = self.log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.log_path)?;
        writeln!(file, "{json}")?;
        file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, hour, 0, 0).unwrap()
    }

    fn fill(side: Side) -> OpenFill {
        OpenFill {
            direction: side,
            size: 1.5,
            epic: Some("CS.D.EURUSD".into()),
            broker_ref: Some("REF-1".into()),
            dry_run: false,
        }
    }

    #[test]
    fn open_close_cycle_persists_and_logs() {
        let dir = tempfile::tempdir().unwrap();
        let mut book = PositionBook::open(dir.path()).unwrap();
        book.record_open("EURUSD", Timeframe::H1, fill(Side::Buy), t(1)).unwrap();
        assert!(book.is_open("EURUSD", Timeframe::H1));
        assert!(!book.is_open("EURUSD", Timeframe::H4));

        let reloaded = PositionBook::open(dir.path()).unwrap();
        assert_eq!(reloaded.get("EURUSD", Timeframe::H1), book.get("EURUSD", Timeframe::H1));

        assert!(book.record_close("EURUSD", Timeframe::H1, "manual", t(2)).unwrap());
        assert!(!book.record_close("EURUSD", Timeframe::H1, "manual", t(3)).unwrap());
        let log = book.read_log().unwrap();
        let transitions: Vec<_> = log.iter().map(|e| e.transition).collect();
        assert_eq!(transitions, vec![Transition::Open, Transition::Close]);
    }

    #[test]
    fn second_open_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut book = PositionBook::open(dir.path()).unwrap();
        book.record_open("X", Timeframe::H1, fill(Side::Buy), t(1)).unwrap();
        let err = book.record_open("X", Timeframe::H1, fill(Side::Sell), t(2)).unwrap_err();
        assert!(matches!(err, PositionError::AlreadyOpen { .. }));
        assert_eq!(book.get("X", Timeframe::H1).unwrap().direction, Some(Side::Buy));
        assert_eq!(book.open_count(), 1);
    }

    #[test]
    fn reject_keeps_state_closed() {
        let dir = tempfile::tempdir().unwrap();
        let mut book = PositionBook::open(dir.path()).unwrap();
        book.record_reject("X", Timeframe::M15, Side::Sell, "zero_size", t(1)).unwrap();
        let state = book.get("X", Timeframe::M15).unwrap();
        assert_eq!(state.status, PositionStatus::Closed);
        assert_eq!(state.last_signal, Some(Side::Sell));
        assert_eq!(book.read_log().unwrap()[0].reason.as_deref(), Some("zero_size"));
    }

    #[test]
    fn expiry_after_max_holding_bars() {
        let dir = tempfile::tempdir().unwrap();
        let mut book = PositionBook::open(dir.path()).unwrap();
        book.record_open("X", Timeframe::H1, fill(Side::Buy), t(0)).unwrap();
        assert!(book.expire(3, t(2)).unwrap().is_empty());
        assert_eq!(book.expire(3, t(3)).unwrap(), vec!["X__1h".to_string()]);
        assert!(!book.is_open("X", Timeframe::H1));
    }

    #[test]
    fn reconcile_closes_missing_epics_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut book = PositionBook::open(dir.path()).unwrap();
        book.record_open("A", Timeframe::H1, fill(Side::Buy), t(0)).unwrap();
        let mut other = fill(Side::Buy);
        other.epic = Some("B.EPIC".into());
        book.record_open("B", Timeframe::H1, other, t(0)).unwrap();
        let mut simulated = fill(Side::Buy);
        simulated.dry_run = true;
        simulated.epic = Some("C.EPIC".into());
        book.record_open("C", Timeframe::H1, simulated, t(0)).unwrap();

        let closed = book.reconcile(&["B.EPIC".to_string()], t(1)).unwrap();
        assert_eq!(closed, vec!["A__1h".to_string()]);
        assert!(book.is_open("B", Timeframe::H1));
        assert!(book.is_open("C", Timeframe::H1));
    }
}
