//! On-disk candle cache, one file per `(symbol, timeframe)`.
//!
//! Layout: `{cache_dir}/{safe_symbol}__{tf}.parquet` (or `.csv`) plus a
//! `{safe_symbol}__{tf}.meta.json` sidecar (hash, range, cached_at).
//!
//! - Atomic writes (unique temp file in the cache dir, renamed into place)
//! - Integrity validation on load (schema check, ordering, row count > 0)
//! - Quarantine for corrupt files ({filename}.quarantined)

use super::provider::DataError;
use crate::domain::{pair_key, validate_candles, Candle, Timeframe};
use crate::persist::{read_json, write_json_atomic};
use chrono::{DateTime, Duration, Utc};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheFormat {
    #[default]
    Parquet,
    Csv,
}

impl CacheFormat {
    fn extension(self) -> &'static str {
        match self {
            CacheFormat::Parquet => "parquet",
            CacheFormat::Csv => "csv",
        }
    }
}

impl FromStr for CacheFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "parquet" => Ok(CacheFormat::Parquet),
            "csv" => Ok(CacheFormat::Csv),
            _ => Err(format!("unknown cache format '{s}'")),
        }
    }
}

/// Metadata sidecar for a cached series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMeta {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub bar_count: usize,
    pub first: DateTime<Utc>,
    pub last: DateTime<Utc>,
    pub data_hash: String,
    pub cached_at: DateTime<Utc>,
}

pub struct CandleCache {
    cache_dir: PathBuf,
    format: CacheFormat,
}

impl CandleCache {
    pub fn new(cache_dir: impl Into<PathBuf>, format: CacheFormat) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            format,
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn data_path(&self, symbol: &str, tf: Timeframe) -> PathBuf {
        self.cache_dir
            .join(format!("{}.{}", pair_key(symbol, tf), self.format.extension()))
    }

    fn meta_path(&self, symbol: &str, tf: Timeframe) -> PathBuf {
        self.cache_dir.join(format!("{}.meta.json", pair_key(symbol, tf)))
    }

    /// Replace the cached series for `(symbol, tf)`.
    pub fn write(&self, symbol: &str, tf: Timeframe, candles: &[Candle]) -> Result<(), DataError> {
        let (first, last) = match (candles.first(), candles.last()) {
            (Some(f), Some(l)) => (f.time, l.time),
            _ => return Err(DataError::CacheError("no candles to cache".into())),
        };
        validate_candles(candles).map_err(|e| DataError::ValidationError(e.to_string()))?;

        fs::create_dir_all(&self.cache_dir)
            .map_err(|e| DataError::CacheError(format!("failed to create dir: {e}")))?;

        let path = self.data_path(symbol, tf);
        let tmp = tempfile::Builder::new()
            .prefix(&format!("{}.", pair_key(symbol, tf)))
            .suffix(".tmp")
            .tempfile_in(&self.cache_dir)
            .map_err(|e| DataError::CacheError(format!("temp file: {e}")))?;
        match self.format {
            CacheFormat::Parquet => write_parquet(&candles_to_dataframe(candles)?, tmp.path())?,
            CacheFormat::Csv => write_csv(candles, tmp.path())?,
        }
        tmp.persist(&path)
            .map_err(|e| DataError::CacheError(format!("atomic rename failed: {}", e.error)))?;

        let meta = CacheMeta {
            symbol: symbol.to_string(),
            timeframe: tf,
            bar_count: candles.len(),
            first,
            last,
            data_hash: hash_candles(candles)?,
            cached_at: Utc::now(),
        };
        write_json_atomic(&self.meta_path(symbol, tf), &meta)
            .map_err(|e| DataError::CacheError(format!("meta write: {e}")))
    }

    /// Load the cached series, sorted ascending.
    ///
    /// A corrupt file is quarantined and reported as a miss.
    pub fn load(&self, symbol: &str, tf: Timeframe) -> Result<Vec<Candle>, DataError> {
        let path = self.data_path(symbol, tf);
        if !path.exists() {
            return Err(DataError::NoCachedData {
                key: pair_key(symbol, tf),
            });
        }

        let loaded = match self.format {
            CacheFormat::Parquet => load_parquet(&path),
            CacheFormat::Csv => load_csv(&path),
        }
        .and_then(|candles| {
            validate_candles(&candles)
                .map(|_| candles)
                .map_err(|e| DataError::ValidationError(e.to_string()))
        });

        match loaded {
            Ok(candles) if !candles.is_empty() => Ok(candles),
            Ok(_) | Err(_) => {
                let quarantine = path.with_extension(format!("{}.quarantined", self.format.extension()));
                warn!(path = %path.display(), "quarantining corrupt cache file");
                let _ = fs::rename(&path, &quarantine);
                let _ = fs::remove_file(self.meta_path(symbol, tf));
                Err(DataError::NoCachedData {
                    key: pair_key(symbol, tf),
                })
            }
        }
    }

    pub fn meta(&self, symbol: &str, tf: Timeframe) -> Option<CacheMeta> {
        read_json(&self.meta_path(symbol, tf)).ok().flatten()
    }

    /// True when the series was written less than `max_age` before `now`.
    pub fn is_fresh(&self, symbol: &str, tf: Timeframe, max_age: Duration, now: DateTime<Utc>) -> bool {
        self.data_path(symbol, tf).exists()
            && self
                .meta(symbol, tf)
                .is_some_and(|m| now - m.cached_at < max_age)
    }
}

fn hash_candles(candles: &[Candle]) -> Result<String, DataError> {
    let bytes = serde_json::to_vec(candles)
        .map_err(|e| DataError::CacheError(format!("hash serialization: {e}")))?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

// ── Parquet I/O helpers ─────────────────────────────────────────────

const COLUMNS: [&str; 6] = ["time_ms", "open", "high", "low", "close", "volume"];

fn candles_to_dataframe(candles: &[Candle]) -> Result<DataFrame, DataError> {
    let times: Vec<i64> = candles.iter().map(|c| c.time.timestamp_millis()).collect();
    let opens: Vec<f64> = candles.iter().map(|c| c.open).collect();
    let highs: Vec<f64> = candles.iter().map(|c| c.high).collect();
    let lows: Vec<f64> = candles.iter().map(|c| c.low).collect();
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();

    DataFrame::new(vec![
        Column::new("time_ms".into(), times),
        Column::new("open".into(), opens),
        Column::new("high".into(), highs),
        Column::new("low".into(), lows),
        Column::new("close".into(), closes),
        Column::new("volume".into(), volumes),
    ])
    .map_err(|e| DataError::ParquetError(format!("dataframe creation: {e}")))
}

fn write_parquet(df: &DataFrame, path: &Path) -> Result<(), DataError> {
    let file = fs::File::create(path).map_err(|e| DataError::ParquetError(format!("create file: {e}")))?;
    ParquetWriter::new(file)
        .finish(&mut df.clone())
        .map_err(|e| DataError::ParquetError(format!("write parquet: {e}")))?;
    Ok(())
}

fn load_parquet(path: &Path) -> Result<Vec<Candle>, DataError> {
    let file = fs::File::open(path).map_err(|e| DataError::ParquetError(format!("open: {e}")))?;
    let df = ParquetReader::new(file)
        .finish()
        .map_err(|e| DataError::ParquetError(format!("read: {e}")))?;

    if df.height() == 0 {
        return Err(DataError::ValidationError("empty parquet file".into()));
    }
    for col_name in &COLUMNS {
        if df.column(col_name).is_err() {
            return Err(DataError::ValidationError(format!("missing column '{col_name}'")));
        }
    }
    dataframe_to_candles(&df)
}

fn dataframe_to_candles(df: &DataFrame) -> Result<Vec<Candle>, DataError> {
    let col = |name: &str| {
        df.column(name)
            .map_err(|e| DataError::ParquetError(format!("column read: {e}")))
    };
    let f64_col = |name: &str| -> Result<Vec<Option<f64>>, DataError> {
        let ca = col(name)?
            .f64()
            .map_err(|e| DataError::ParquetError(format!("{name} column type: {e}")))?;
        Ok(ca.into_iter().collect())
    };

    let times: Vec<Option<i64>> = col("time_ms")?
        .i64()
        .map_err(|e| DataError::ParquetError(format!("time_ms column type: {e}")))?
        .into_iter()
        .collect();
    let opens = f64_col("open")?;
    let highs = f64_col("high")?;
    let lows = f64_col("low")?;
    let closes = f64_col("close")?;
    let volumes = f64_col("volume")?;

    let mut candles = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        let ms = times[i].ok_or_else(|| DataError::ParquetError(format!("null time at row {i}")))?;
        let time = DateTime::<Utc>::from_timestamp_millis(ms)
            .ok_or_else(|| DataError::ParquetError(format!("invalid time at row {i}")))?;
        candles.push(Candle {
            time,
            open: opens[i].unwrap_or(f64::NAN),
            high: highs[i].unwrap_or(f64::NAN),
            low: lows[i].unwrap_or(f64::NAN),
            close: closes[i].unwrap_or(f64::NAN),
            volume: volumes[i].unwrap_or(0.0),
        });
    }
    Ok(candles)
}

// ── CSV I/O helpers ─────────────────────────────────────────────────

fn write_csv(candles: &[Candle], path: &Path) -> Result<(), DataError> {
    let mut wtr = csv::Writer::from_path(path).map_err(|e| DataError::CacheError(format!("csv create: {e}")))?;
    for c in candles {
        wtr.serialize(c)
            .map_err(|e| DataError::CacheError(format!("csv write: {e}")))?;
    }
    wtr.flush()
        .map_err(|e| DataError::CacheError(format!("csv flush: {e}")))
}

fn load_csv(path: &Path) -> Result<Vec<Candle>, DataError> {
    let mut rdr = csv::Reader::from_path(path).map_err(|e| DataError::CacheError(format!("csv open: {e}")))?;
    rdr.deserialize()
        .collect::<Result<Vec<Candle>, _>>()
        .map_err(|e| DataError::ValidationError(format!("csv row: {e}")))
}
