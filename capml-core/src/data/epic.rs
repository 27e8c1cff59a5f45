//! Symbol → broker epic resolution.
//!
//! Lookup order: explicit override map, then the resolution cache, then a
//! broker search. Successful searches are cached in memory and, when a cache
//! file is configured, persisted with an atomic write.

use super::provider::{Broker, DataError};
use crate::persist::write_json_atomic;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{info, warn};

pub struct EpicResolver {
    overrides: HashMap<String, String>,
    cache: Mutex<BTreeMap<String, String>>,
    cache_file: Option<PathBuf>,
}

impl EpicResolver {
    pub fn new(overrides: HashMap<String, String>) -> Self {
        Self {
            overrides,
            cache: Mutex::new(BTreeMap::new()),
            cache_file: None,
        }
    }

    /// Persist resolutions to `path`, seeding the cache from it if present.
    pub fn with_cache_file(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if let Ok(content) = fs::read_to_string(&path) {
            match serde_json::from_str::<BTreeMap<String, String>>(&content) {
                Ok(map) => *self.cache.lock().unwrap() = map,
                Err(e) => warn!(path = %path.display(), error = %e, "ignoring unreadable epic cache"),
            }
        }
        self.cache_file = Some(path);
        self
    }

    /// Resolve without touching the broker or the cache file.
    pub fn lookup(&self, symbol: &str) -> Option<String> {
        if let Some(epic) = self.overrides.get(symbol) {
            return Some(epic.clone());
        }
        self.cache.lock().unwrap().get(symbol).cloned()
    }

    /// Resolve, searching the broker on a miss and caching the answer.
    pub fn resolve(&self, broker: &dyn Broker, symbol: &str) -> Result<Option<String>, DataError> {
        if let Some(epic) = self.lookup(symbol) {
            return Ok(Some(epic));
        }
        let found = broker.search_epic(symbol)?;
        if let Some(epic) = &found {
            info!(symbol, epic = %epic, "resolved epic");
            let snapshot = {
                let mut cache = self.cache.lock().unwrap();
                cache.insert(symbol.to_string(), epic.clone());
                cache.clone()
            };
            if let Err(e) = self.persist(&snapshot) {
                warn!(error = %e, "failed to persist epic cache");
            }
        }
        Ok(found)
    }

    fn persist(&self, snapshot: &BTreeMap<String, String>) -> Result<(), DataError> {
        let Some(path) = &self.cache_file else {
            return Ok(());
        };
        write_json_atomic(path, snapshot).map_err(|e| DataError::CacheError(format!("epic cache write: {e}")))
    }
}
