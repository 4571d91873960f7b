//! Scenario cache: bounded mapping from scenario key to generated songs,
//! mirrored to durable storage as one version-tagged snapshot.
//! Capacity overflow is resolved by least-recently-used eviction, which also
//! releases the evicted entry's downloaded audio files.

pub mod persist;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{CACHE_STORAGE_KEY, CACHE_VERSION};
use crate::generate::Song;
use crate::storage::ArtifactStore;
use persist::{KeyValueStore, PersistError};

#[derive(Debug)]
pub enum CacheError {
    /// Caller handed an empty song list to insert.
    NoSongs,
    Persist(PersistError),
    Serialize(String),
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::NoSongs => write!(f, "insert requires at least one song"),
            CacheError::Persist(e) => write!(f, "persist failed: {e}"),
            CacheError::Serialize(msg) => write!(f, "serialize failed: {msg}"),
        }
    }
}

impl From<PersistError> for CacheError {
    fn from(e: PersistError) -> Self {
        CacheError::Persist(e)
    }
}

/// One cached scenario: a primary song, a variation (defaults to the primary
/// when only one was generated), recency and a daily request counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub scenario: String,
    pub primary: Song,
    pub variation: Song,
    /// Milliseconds since epoch; None sorts as oldest.
    pub last_used: Option<i64>,
    pub requests_today: u32,
}

/// The full durable snapshot. A version tag guards the layout: a mismatch on
/// load discards the whole snapshot rather than migrating entry by entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheData {
    version: String,
    entries: Vec<CacheEntry>,
    last_updated: i64,
}

impl CacheData {
    fn empty() -> Self {
        Self {
            version: CACHE_VERSION.to_string(),
            entries: Vec::new(),
            last_updated: now_ms(),
        }
    }
}

/// Read-only summary for display.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entry_count: usize,
    pub scenarios: Vec<String>,
    pub last_updated: i64,
}

/// Scenario cache service. All operations are serialized through one async
/// mutex; the cache is lazily initialized on first use, so calling
/// `initialize` up front is an optimization, not a requirement.
pub struct ScenarioCache {
    store: Arc<dyn KeyValueStore>,
    artifacts: Arc<dyn ArtifactStore>,
    capacity: usize,
    state: Mutex<Option<CacheData>>,
}

impl ScenarioCache {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        artifacts: Arc<dyn ArtifactStore>,
        capacity: usize,
    ) -> Self {
        Self {
            store,
            artifacts,
            capacity: capacity.max(1),
            state: Mutex::new(None),
        }
    }

    /// Load the snapshot from durable storage. Unreadable or version-skewed
    /// snapshots fall back to an empty cache; this never fails the caller.
    pub async fn initialize(&self) {
        let mut slot = self.state.lock().await;
        *slot = Some(self.load_snapshot().await);
    }

    /// Case-insensitive lookup. A hit refreshes the entry's recency and
    /// persists the snapshot; a miss mutates nothing. Never triggers
    /// generation or network I/O.
    pub async fn lookup(&self, scenario: &str) -> Option<Song> {
        let mut slot = self.state.lock().await;
        let data = self.ensure_loaded(&mut slot).await;

        let needle = scenario.to_lowercase();
        let entry = data
            .entries
            .iter_mut()
            .find(|e| e.scenario.to_lowercase() == needle)?;

        entry.last_used = Some(now_ms());
        let song = entry.primary.clone();
        debug!(scenario = %scenario, "cache hit");

        // A hit is still a hit if the recency bump fails to persist.
        if let Err(e) = self.persist(data).await {
            warn!(error = %e, "cache persist after hit failed");
        }

        Some(song)
    }

    /// Insert (or replace) the entry for `scenario`. `songs[0]` becomes the
    /// primary, `songs[1]` the variation when present. Replacing an existing
    /// entry releases the old entry's local files; inserting at capacity
    /// first evicts the least-recently-used entry (ties broken by earliest
    /// insertion order).
    pub async fn insert(&self, scenario: &str, songs: &[Song]) -> Result<(), CacheError> {
        let primary = songs.first().ok_or(CacheError::NoSongs)?;
        let variation = songs.get(1).unwrap_or(primary);

        let mut slot = self.state.lock().await;
        let data = self.ensure_loaded(&mut slot).await;

        let entry = CacheEntry {
            scenario: scenario.to_string(),
            primary: primary.clone(),
            variation: variation.clone(),
            last_used: Some(now_ms()),
            requests_today: 1,
        };

        let needle = scenario.to_lowercase();
        if let Some(index) = data
            .entries
            .iter()
            .position(|e| e.scenario.to_lowercase() == needle)
        {
            // Refresh of a known scenario: release the files the old entry
            // owned, then take its slot.
            let old = data.entries[index].clone();
            self.delete_entry_files(&old).await;
            data.entries[index] = entry;
        } else {
            // A snapshot written under a larger capacity can hold more
            // entries than the current bound allows; evict until it fits.
            while data.entries.len() >= self.capacity {
                let oldest = oldest_entry_index(&data.entries);
                self.evict(data, oldest).await;
            }
            data.entries.push(entry);
        }

        self.persist(data).await
    }

    /// Evict every entry (releasing their files), reset to an empty snapshot
    /// and remove the durable blob entirely so a fresh load starts clean.
    pub async fn clear(&self) -> Result<(), CacheError> {
        let mut slot = self.state.lock().await;
        let data = self.ensure_loaded(&mut slot).await;

        for entry in std::mem::take(&mut data.entries) {
            self.delete_entry_files(&entry).await;
        }
        *data = CacheData::empty();

        self.store.remove(CACHE_STORAGE_KEY).await?;
        info!("cache cleared");
        Ok(())
    }

    /// Snapshot summary. Read-only apart from lazy initialization.
    pub async fn stats(&self) -> CacheStats {
        let mut slot = self.state.lock().await;
        let data = self.ensure_loaded(&mut slot).await;

        CacheStats {
            entry_count: data.entries.len(),
            scenarios: data.entries.iter().map(|e| e.scenario.clone()).collect(),
            last_updated: data.last_updated,
        }
    }

    async fn ensure_loaded<'a>(&self, slot: &'a mut Option<CacheData>) -> &'a mut CacheData {
        if slot.is_none() {
            *slot = Some(self.load_snapshot().await);
        }
        slot.as_mut().expect("snapshot loaded above")
    }

    async fn load_snapshot(&self) -> CacheData {
        match self.store.get(CACHE_STORAGE_KEY).await {
            Ok(Some(raw)) => match serde_json::from_str::<CacheData>(&raw) {
                Ok(data) if data.version == CACHE_VERSION => {
                    info!(entries = data.entries.len(), "cache snapshot loaded");
                    data
                }
                Ok(data) => {
                    info!(
                        stored = %data.version,
                        expected = %CACHE_VERSION,
                        "cache version mismatch, discarding snapshot"
                    );
                    if let Err(e) = self.store.remove(CACHE_STORAGE_KEY).await {
                        warn!(error = %e, "stale snapshot removal failed");
                    }
                    CacheData::empty()
                }
                Err(e) => {
                    warn!(error = %e, "cache snapshot unreadable, starting empty");
                    CacheData::empty()
                }
            },
            Ok(None) => CacheData::empty(),
            Err(e) => {
                warn!(error = %e, "cache load failed, starting empty");
                CacheData::empty()
            }
        }
    }

    async fn persist(&self, data: &mut CacheData) -> Result<(), CacheError> {
        data.last_updated = now_ms();
        let raw = serde_json::to_string(data).map_err(|e| CacheError::Serialize(e.to_string()))?;
        self.store.set(CACHE_STORAGE_KEY, &raw).await?;
        Ok(())
    }

    /// Remove the entry at `index` and release its audio files. File
    /// deletion failures leave a stale file on disk but never fail the
    /// surrounding insert.
    async fn evict(&self, data: &mut CacheData, index: usize) {
        if index >= data.entries.len() {
            return;
        }
        let entry = data.entries.remove(index);
        debug!(scenario = %entry.scenario, "evicting cache entry");
        self.delete_entry_files(&entry).await;
    }

    async fn delete_entry_files(&self, entry: &CacheEntry) {
        for song in [&entry.primary, &entry.variation] {
            if let Some(path) = &song.local_path {
                if let Err(e) = self.artifacts.delete(path).await {
                    warn!(path = %path.display(), error = %e, "stale audio file left on disk");
                }
            }
        }
    }
}

/// Index of the least-recently-used entry; absent timestamps sort oldest and
/// ties go to the earliest-inserted entry.
fn oldest_entry_index(entries: &[CacheEntry]) -> usize {
    let mut oldest_index = 0;
    let mut oldest_time = i64::MAX;

    for (index, entry) in entries.iter().enumerate() {
        let time = entry.last_used.unwrap_or(0);
        if time < oldest_time {
            oldest_time = time;
            oldest_index = index;
        }
    }

    oldest_index
}

/// Current time in milliseconds since epoch.
fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
