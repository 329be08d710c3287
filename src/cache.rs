use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::client::GeocodeResult;
use crate::errors::{AppError, AppResult};

const CACHE_FORMAT_VERSION: u32 = 1;

/// Normalized query text: lower-cased with runs of whitespace collapsed to one space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(String);

impl QueryKey {
    pub fn normalize(text: &str) -> Self {
        let collapsed = text
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        Self(collapsed)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: QueryKey,
    pub result: GeocodeResult,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    entries: Vec<CacheEntry>,
}

/// Why the durable store could not be used at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadFailure {
    Unreadable(String),
    Corrupt(String),
}

/// Shared key to result map, persisted as JSON between runs.
///
/// All access to the map goes through one lock. Entries with status ERROR live in memory
/// only and are never written by [`ResultCache::flush`].
pub struct ResultCache {
    path: PathBuf,
    entries: Mutex<HashMap<QueryKey, CacheEntry>>,
    in_flight: Mutex<HashMap<QueryKey, Arc<AsyncMutex<()>>>>,
    dirty: AtomicBool,
    flush_lock: Mutex<()>,
    load_failure: Option<LoadFailure>,
}

impl ResultCache {
    pub fn in_memory(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            dirty: AtomicBool::new(false),
            flush_lock: Mutex::new(()),
            load_failure: None,
        }
    }

    /// Reads the store at `path`. An absent store yields an empty cache; an unreadable or
    /// corrupt one yields an empty cache and a warning.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let mut cache = Self::in_memory(path);
        match fs::read_to_string(&cache.path) {
            Ok(contents) => match serde_json::from_str::<CacheFile>(&contents) {
                Ok(file) if file.version == CACHE_FORMAT_VERSION => {
                    let entries = file
                        .entries
                        .into_iter()
                        .filter(|entry| entry.result.is_definitive())
                        .map(|entry| (entry.key.clone(), entry))
                        .collect::<HashMap<_, _>>();
                    info!(
                        target: "cache",
                        path = %cache.path.display(),
                        entries = entries.len(),
                        "loaded geocode cache"
                    );
                    cache.entries = Mutex::new(entries);
                }
                Ok(file) => {
                    warn!(
                        target: "cache",
                        path = %cache.path.display(),
                        version = file.version,
                        "unsupported cache format version; starting empty"
                    );
                    cache.load_failure = Some(LoadFailure::Corrupt(format!(
                        "unsupported version {}",
                        file.version
                    )));
                }
                Err(err) => {
                    warn!(
                        target: "cache",
                        path = %cache.path.display(),
                        error = %err,
                        "failed to parse geocode cache; starting empty"
                    );
                    cache.load_failure = Some(LoadFailure::Corrupt(err.to_string()));
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(
                    target: "cache",
                    path = %cache.path.display(),
                    "no geocode cache yet; starting empty"
                );
            }
            Err(err) => {
                warn!(
                    target: "cache",
                    path = %cache.path.display(),
                    error = %err,
                    "failed to read geocode cache; starting empty"
                );
                cache.load_failure = Some(LoadFailure::Unreadable(err.to_string()));
            }
        }
        cache
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load_failure(&self) -> Option<&LoadFailure> {
        self.load_failure.as_ref()
    }

    pub fn get(&self, key: &QueryKey) -> Option<CacheEntry> {
        self.entries.lock().get(key).cloned()
    }

    /// Cached result that may be served instead of calling the service.
    pub fn get_definitive(&self, key: &QueryKey) -> Option<GeocodeResult> {
        self.entries
            .lock()
            .get(key)
            .filter(|entry| entry.result.is_definitive())
            .map(|entry| entry.result.clone())
    }

    pub fn put(&self, key: QueryKey, result: GeocodeResult) {
        let persistable = result.is_definitive();
        let entry = CacheEntry {
            key: key.clone(),
            result,
            timestamp: Utc::now(),
        };
        self.entries.lock().insert(key, entry);
        if persistable {
            self.dirty.store(true, Ordering::SeqCst);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Serializes resolution of `key`: a second caller waits until the first one drops its
    /// claim, then sees whatever the first one stored.
    pub async fn claim(&self, key: &QueryKey) -> KeyClaim<'_> {
        let slot = {
            let mut table = self.in_flight.lock();
            table
                .entry(key.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let guard = slot.clone().lock_owned().await;
        KeyClaim {
            cache: self,
            key: key.clone(),
            slot,
            guard: Some(guard),
        }
    }

    /// Writes all OK/NOT_FOUND entries to a temporary file and renames it over the store.
    pub fn flush(&self) -> AppResult<usize> {
        let _flushing = self.flush_lock.lock();
        let mut entries: Vec<CacheEntry> = {
            let map = self.entries.lock();
            self.dirty.store(false, Ordering::SeqCst);
            map.values()
                .filter(|entry| entry.result.is_definitive())
                .cloned()
                .collect()
        };
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        let count = entries.len();

        if let Err(err) = self.write_atomically(&CacheFile {
            version: CACHE_FORMAT_VERSION,
            entries,
        }) {
            self.dirty.store(true, Ordering::SeqCst);
            return Err(err);
        }

        debug!(
            target: "cache",
            path = %self.path.display(),
            entries = count,
            "geocode cache flushed"
        );
        Ok(count)
    }

    /// Flushes only when something persistable changed since the last flush.
    pub fn flush_if_dirty(&self) -> AppResult<Option<usize>> {
        if !self.is_dirty() {
            return Ok(None);
        }
        self.flush().map(Some)
    }

    /// Checks that the store location accepts writes without touching the store itself.
    pub fn ensure_writable(&self) -> AppResult<()> {
        let probe = self.temp_path();
        self.ensure_parent()?;
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&probe)
            .map_err(|err| {
                AppError::CacheStore(format!("{} is not writable: {err}", probe.display()))
            })?;
        let _ = fs::remove_file(&probe);
        Ok(())
    }

    fn write_atomically(&self, file: &CacheFile) -> AppResult<()> {
        self.ensure_parent()?;
        let temp = self.temp_path();
        let result = (|| -> AppResult<()> {
            let handle = File::create(&temp)?;
            let mut writer = BufWriter::new(handle);
            serde_json::to_writer_pretty(&mut writer, file)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
            fs::rename(&temp, &self.path)?;
            Ok(())
        })();
        if result.is_err() {
            let _ = fs::remove_file(&temp);
        }
        result.map_err(|err| {
            AppError::CacheStore(format!("failed to write {}: {err}", self.path.display()))
        })
    }

    fn ensure_parent(&self) -> AppResult<()> {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                fs::create_dir_all(parent).map_err(|err| {
                    AppError::CacheStore(format!("cannot create {}: {err}", parent.display()))
                })
            }
            _ => Ok(()),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "geocode-cache".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

/// Exclusive right to resolve one key. Released on drop.
pub struct KeyClaim<'a> {
    cache: &'a ResultCache,
    key: QueryKey,
    slot: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyClaim<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut table = self.cache.in_flight.lock();
        // one reference in the table, one here: nobody else is waiting
        if Arc::strong_count(&self.slot) == 2 {
            table.remove(&self.key);
        }
    }
}
