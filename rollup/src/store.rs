//! Durable buffer of in-progress aggregates.
//!
//! The [`BufferStore`] maps encoded [`AggregationKey`]s to encoded
//! [`MetricValue`]s in a `sled` tree. Because keys sort by interval and then
//! window start, one window is a contiguous key range that can be scanned and
//! deleted as a unit.
//!
//! # Design
//!
//! - Merge-writes are a compare-and-swap loop on a single key: concurrent
//!   writers to the same key never lose an update, while writers to different
//!   keys never contend. The loop gives up after a bounded number of attempts.
//! - Durability is explicit. [`BufferStore::merge_write`] syncs before
//!   returning; batch callers merge several keys and then call
//!   [`BufferStore::sync`] once.
//! - The value format (histogram and sketch resolution) is recorded in
//!   `meta.json`; reopening with a different format is refused so that every
//!   value in the store can be merged with every other.
//! - Each interval's seal watermark lives in a separate `seals` tree, outside
//!   the aggregate key space, so windows reclaimed before a restart stay
//!   closed after it.
//!
//! # File Layout
//!
//! ```text
//! store_dir/
//! ├── meta.json    <- Format version and value-format hash
//! └── db/          <- sled engine files
//! ```
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use rollup::config::AggregatorConfig;
//! use rollup::event::{ApmEvent, Outcome};
//! use rollup::key::{AggregationKey, KeyPart, PartKind};
//! use rollup::store::BufferStore;
//! use rollup::value::MetricValue;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AggregatorConfig::default();
//! let store = BufferStore::open("./buffer", &config)?;
//!
//! let key = AggregationKey::global(60_000, 1_700_000_040_000_000_000)
//!     .child(KeyPart::named(PartKind::Service, "checkout-api"), 0)?;
//! let event = ApmEvent::transaction(1_700_000_041_000_000_000, "checkout-api",
//!     "request", "POST /pay", 1_250, Outcome::Success);
//! store.merge_write(&key, &MetricValue::from_event(&event, &config.histogram))?;
//!
//! for entry in store.scan_window(60_000, 1_700_000_040_000_000_000) {
//!     let (key, value) = entry?.decode()?;
//!     println!("{key}: {}", value.count());
//! }
//! # Ok(())
//! # }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use sled::IVec;
use tracing::{debug, warn};

use crate::config::{AggregatorConfig, HistogramConfig, SketchConfig};
use crate::error::{Result, StoreError};
use crate::key::{self, AggregationKey};
use crate::value::MetricValue;

/// Metadata file format version.
const METADATA_VERSION: u32 = 1;

/// Name of the metadata file in the store directory.
const METADATA_FILE: &str = "meta.json";

/// Name of the engine directory in the store directory.
const ENGINE_DIR: &str = "db";

/// Engine tree holding per-interval seal watermarks.
const SEALS_TREE: &str = "seals";

/// Compare-and-swap attempts before a merge-write reports contention.
const MAX_CAS_ATTEMPTS: u32 = 64;

/// Metadata stored in the store's meta.json file.
#[derive(Debug, Serialize, Deserialize)]
struct StoreMetadata {
    /// Metadata format version.
    version: u32,
    /// Hash of the value-format configuration the store was created with.
    value_format_hash: u64,
    /// Histogram parameters, recorded for operators.
    histogram: HistogramConfig,
    /// Sketch parameters, recorded for operators.
    sketch: SketchConfig,
}

/// Point-in-time storage statistics.
///
/// Sampled by [`crate::telemetry::StatsSampler`]. Counters are cumulative
/// since the store was opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Durable flushes performed.
    pub flushes: u64,
    /// Bytes made durable by those flushes.
    pub flushed_bytes: u64,
    /// Background compactions (not reported by the engine).
    pub compactions: u64,
    /// Bytes read by compactions (not reported by the engine).
    pub compacted_bytes_read: u64,
    /// Bytes written by compactions (not reported by the engine).
    pub compacted_bytes_written: u64,
    /// Key and value bytes written by merge-writes.
    pub ingested_bytes: u64,
    /// Bytes written but not yet flushed.
    pub memtable_size_bytes: u64,
    /// Size of the engine files on disk.
    pub disk_usage_bytes: u64,
    /// Engine reads per merge-write, in hundredths.
    pub read_amplification: u64,
    /// Number of engine trees.
    pub tables: u64,
    /// Space on disk not occupied by live entries.
    pub pending_compaction_bytes: u64,
    /// Keys deleted by window reclaims.
    pub tombstones: u64,
}

#[derive(Debug, Default)]
struct Counters {
    flushes: AtomicU64,
    flushed_bytes: AtomicU64,
    ingested_bytes: AtomicU64,
    unflushed_bytes: AtomicU64,
    live_bytes: AtomicU64,
    reads: AtomicU64,
    merges: AtomicU64,
    tombstones: AtomicU64,
}

/// Durable, concurrently writable buffer of windowed aggregates.
///
/// # Thread Safety
///
/// `BufferStore` is `Send + Sync`; share it behind an `Arc`. Merge-writes to
/// the same key are serialized by compare-and-swap, everything else runs in
/// parallel.
#[derive(Debug)]
pub struct BufferStore {
    /// Path to the store directory.
    path: PathBuf,
    /// The embedded ordered key-value engine.
    db: sled::Db,
    /// Seal watermark per interval, keyed by big-endian interval milliseconds.
    seals: sled::Tree,
    /// Value-format hash this store was opened with.
    value_format_hash: u64,
    counters: Counters,
}

/// One raw entry returned by a window scan.
///
/// Decoding is left to the caller so that a corrupt entry can be skipped
/// without aborting the scan.
#[derive(Debug, Clone)]
pub struct RawEntry {
    key: IVec,
    value: IVec,
}

impl RawEntry {
    /// Encoded key bytes.
    pub fn key_bytes(&self) -> &[u8] {
        &self.key
    }

    /// Encoded value bytes.
    pub fn value_bytes(&self) -> &[u8] {
        &self.value
    }

    /// Decodes the key and value.
    ///
    /// # Errors
    ///
    /// Returns a key or value corruption error.
    pub fn decode(&self) -> Result<(AggregationKey, MetricValue)> {
        let key = AggregationKey::decode(&self.key)?;
        let value = MetricValue::decode(&self.value)?;
        Ok((key, value))
    }
}

impl BufferStore {
    /// Creates a new store or opens an existing one at the given path.
    ///
    /// If the directory has no meta.json, it is created along with the
    /// engine files and the configuration's value-format hash is recorded.
    /// Otherwise meta.json is read and its hash must match.
    ///
    /// # Errors
    ///
    /// - [`StoreError::DirectoryAccess`] if the directory cannot be created/accessed
    /// - [`StoreError::CorruptedMetadata`] if meta.json is invalid
    /// - [`StoreError::ConfigMismatch`] if the value format differs from the existing store
    /// - [`StoreError::Engine`] if the engine fails to open
    pub fn open<P: AsRef<Path>>(path: P, config: &AggregatorConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        config.validate()?;

        if path.join(METADATA_FILE).exists() {
            Self::open_existing(path, config)
        } else {
            Self::create_new(path, config)
        }
    }

    /// Creates a new store directory.
    fn create_new(path: PathBuf, config: &AggregatorConfig) -> Result<Self> {
        fs::create_dir_all(&path).map_err(|e| StoreError::DirectoryAccess {
            path: path.display().to_string(),
            source: e,
        })?;

        let (db, seals) = Self::open_engine(&path)?;

        // Written after the engine so a failed open leaves no metadata behind
        let metadata = StoreMetadata {
            version: METADATA_VERSION,
            value_format_hash: config.value_format_hash(),
            histogram: config.histogram,
            sketch: config.sketch,
        };
        let metadata_path = path.join(METADATA_FILE);
        let metadata_json =
            serde_json::to_string_pretty(&metadata).map_err(StoreError::MetadataSerialize)?;
        fs::write(&metadata_path, metadata_json).map_err(|e| StoreError::DirectoryAccess {
            path: metadata_path.display().to_string(),
            source: e,
        })?;

        debug!(path = %path.display(), "created buffer store");
        Ok(Self {
            path,
            db,
            seals,
            value_format_hash: metadata.value_format_hash,
            counters: Counters::default(),
        })
    }

    /// Opens an existing store directory.
    fn open_existing(path: PathBuf, config: &AggregatorConfig) -> Result<Self> {
        let metadata_path = path.join(METADATA_FILE);
        let metadata_json =
            fs::read_to_string(&metadata_path).map_err(|e| StoreError::DirectoryAccess {
                path: metadata_path.display().to_string(),
                source: e,
            })?;

        let metadata: StoreMetadata = serde_json::from_str(&metadata_json).map_err(|e| {
            StoreError::CorruptedMetadata {
                reason: e.to_string(),
            }
        })?;

        if metadata.version != METADATA_VERSION {
            return Err(StoreError::CorruptedMetadata {
                reason: format!(
                    "unsupported metadata version: expected {}, found {}",
                    METADATA_VERSION, metadata.version
                ),
            }
            .into());
        }

        let expected = config.value_format_hash();
        if metadata.value_format_hash != expected {
            return Err(StoreError::ConfigMismatch {
                existing: metadata.value_format_hash,
                expected,
            }
            .into());
        }

        let (db, seals) = Self::open_engine(&path)?;
        let store = Self {
            path,
            db,
            seals,
            value_format_hash: expected,
            counters: Counters::default(),
        };
        store.counters.live_bytes.store(store.live_bytes()?, Ordering::Relaxed);

        debug!(path = %store.path.display(), entries = store.db.len(), "opened buffer store");
        Ok(store)
    }

    fn open_engine(path: &Path) -> Result<(sled::Db, sled::Tree)> {
        let db = sled::Config::new()
            .path(path.join(ENGINE_DIR))
            .mode(sled::Mode::HighThroughput)
            .open()
            .map_err(StoreError::from)?;
        let seals = db.open_tree(SEALS_TREE).map_err(StoreError::from)?;
        Ok((db, seals))
    }

    fn live_bytes(&self) -> Result<u64> {
        let mut total = 0u64;
        for entry in self.db.iter() {
            let (key, value) = entry.map_err(StoreError::from)?;
            total = total.saturating_add((key.len() + value.len()) as u64);
        }
        Ok(total)
    }

    /// Path to the store directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Value-format hash recorded for this store.
    pub fn value_format_hash(&self) -> u64 {
        self.value_format_hash
    }

    /// Number of buffered entries across all windows.
    pub fn len(&self) -> usize {
        self.db.len()
    }

    /// Returns `true` if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }

    /// Reads the current value of a key.
    ///
    /// # Errors
    ///
    /// Returns an engine error or a value corruption error.
    pub fn get(&self, key: &AggregationKey) -> Result<Option<MetricValue>> {
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        match self.db.get(key.encode()).map_err(StoreError::from)? {
            Some(bytes) => Ok(Some(MetricValue::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Merges `contribution` into the value stored under `key` and syncs.
    ///
    /// An absent key is treated as the identity element. The update is
    /// durable when this returns `Ok`.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Engine`] on engine failure
    /// - [`StoreError::Contention`] if the key stayed contended for every attempt
    /// - a value error if the stored value is corrupt or incompatible
    pub fn merge_write(&self, key: &AggregationKey, contribution: &MetricValue) -> Result<()> {
        self.merge_unsynced(&key.encode(), contribution)?;
        self.sync()?;
        Ok(())
    }

    /// Merges without syncing. Callers must [`sync`](Self::sync) before
    /// acknowledging the write.
    pub(crate) fn merge_unsynced(&self, key: &[u8], contribution: &MetricValue) -> Result<()> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            self.counters.reads.fetch_add(1, Ordering::Relaxed);
            let current = self.db.get(key).map_err(StoreError::from)?;

            let merged = match &current {
                Some(bytes) => {
                    let mut value = MetricValue::decode(bytes)?;
                    value.merge(contribution)?;
                    value.encode()
                }
                None => contribution.encode(),
            };
            let old_len = current.as_ref().map_or(0, |c| key.len() + c.len());
            let new_len = key.len() + merged.len();

            match self
                .db
                .compare_and_swap(key, current, Some(merged))
                .map_err(StoreError::from)?
            {
                Ok(()) => {
                    self.counters.merges.fetch_add(1, Ordering::Relaxed);
                    self.counters
                        .ingested_bytes
                        .fetch_add(new_len as u64, Ordering::Relaxed);
                    self.counters
                        .unflushed_bytes
                        .fetch_add(new_len as u64, Ordering::Relaxed);
                    self.adjust_live(old_len, new_len);
                    return Ok(());
                }
                Err(_) => {
                    if attempt % 16 == 0 {
                        debug!(attempt, "merge-write lost compare-and-swap race");
                    }
                }
            }
        }

        warn!(attempts = MAX_CAS_ATTEMPTS, "merge-write gave up on contended key");
        Err(StoreError::Contention {
            attempts: MAX_CAS_ATTEMPTS,
        }
        .into())
    }

    fn adjust_live(&self, old_len: usize, new_len: usize) {
        if new_len >= old_len {
            self.counters
                .live_bytes
                .fetch_add((new_len - old_len) as u64, Ordering::Relaxed);
        } else {
            let delta = (old_len - new_len) as u64;
            let _ = self
                .counters
                .live_bytes
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                    Some(v.saturating_sub(delta))
                });
        }
    }

    /// Durably commits every write made so far.
    ///
    /// Returns the number of bytes the engine flushed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Engine`] if the flush fails.
    pub fn sync(&self) -> Result<usize> {
        let flushed = self.db.flush().map_err(StoreError::from)?;
        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        self.counters
            .flushed_bytes
            .fetch_add(flushed as u64, Ordering::Relaxed);
        self.counters.unflushed_bytes.store(0, Ordering::Relaxed);
        Ok(flushed)
    }

    /// Returns every entry of one window in key order.
    ///
    /// The iterator is lazy and single-pass; entries written concurrently may
    /// or may not be observed.
    pub fn scan_window(
        &self,
        interval_ms: u32,
        window_start: u64,
    ) -> impl Iterator<Item = Result<RawEntry>> + '_ {
        self.db
            .scan_prefix(key::window_prefix(interval_ms, window_start))
            .map(|item| -> Result<RawEntry> {
                let (key, value) = item.map_err(StoreError::from)?;
                Ok(RawEntry { key, value })
            })
    }

    /// Atomically removes every entry of one window and syncs.
    ///
    /// Returns the number of removed entries.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Engine`] if the scan, batch, or flush fails.
    pub fn delete_window(&self, interval_ms: u32, window_start: u64) -> Result<usize> {
        let mut batch = sled::Batch::default();
        let mut removed = 0usize;
        let mut removed_bytes = 0usize;
        for item in self
            .db
            .scan_prefix(key::window_prefix(interval_ms, window_start))
        {
            let (key, value) = item.map_err(StoreError::from)?;
            removed_bytes += key.len() + value.len();
            batch.remove(key);
            removed += 1;
        }
        if removed == 0 {
            return Ok(0);
        }

        self.db.apply_batch(batch).map_err(StoreError::from)?;
        self.sync()?;
        self.counters
            .tombstones
            .fetch_add(removed as u64, Ordering::Relaxed);
        self.adjust_live(removed_bytes, 0);
        Ok(removed)
    }

    /// Returns the start of the oldest buffered window of an interval.
    ///
    /// This is the derived harvest checkpoint: everything older has been
    /// reclaimed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Engine`] if the scan fails.
    pub fn oldest_window(&self, interval_ms: u32) -> Result<Option<u64>> {
        for item in self.db.scan_prefix(key::interval_prefix(interval_ms)).keys() {
            let key = item.map_err(StoreError::from)?;
            match key::decode_window(&key) {
                Ok((_, window_start)) => return Ok(Some(window_start)),
                Err(e) => warn!(error = %e, "skipping key without a window prefix"),
            }
        }
        Ok(None)
    }

    /// Returns the start of every buffered window of an interval, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Engine`] if the scan fails.
    pub fn windows(&self, interval_ms: u32) -> Result<Vec<u64>> {
        let mut windows = Vec::new();
        let mut next = self.oldest_window(interval_ms)?;
        while let Some(window_start) = next {
            windows.push(window_start);
            next = match window_start.checked_add(1) {
                Some(after) => {
                    let from = key::window_prefix(interval_ms, after);
                    let upper = key::window_prefix(interval_ms, u64::MAX);
                    match self.db.range(from..=upper).keys().next() {
                        Some(item) => {
                            let key = item.map_err(StoreError::from)?;
                            key::decode_window(&key).ok().map(|(_, w)| w)
                        }
                        None => None,
                    }
                }
                None => None,
            };
        }
        Ok(windows)
    }

    /// Raises the persisted seal watermark of an interval to `sealed_before`.
    ///
    /// The watermark never moves backwards. It becomes durable with the next
    /// [`sync`](Self::sync), which the reclaim of the sealed window performs.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Engine`] if the update fails.
    pub fn record_seal(&self, interval_ms: u32, sealed_before: u64) -> Result<()> {
        self.seals
            .fetch_and_update(interval_ms.to_be_bytes(), |current| {
                let current = current.and_then(decode_watermark).unwrap_or(0);
                Some(current.max(sealed_before).to_be_bytes().to_vec())
            })
            .map_err(StoreError::from)?;
        Ok(())
    }

    /// Returns the persisted seal watermark of an interval.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Engine`] if the read fails
    /// - [`StoreError::CorruptedMetadata`] if the stored watermark is malformed
    pub fn sealed_before(&self, interval_ms: u32) -> Result<Option<u64>> {
        match self
            .seals
            .get(interval_ms.to_be_bytes())
            .map_err(StoreError::from)?
        {
            Some(bytes) => decode_watermark(&bytes).map(Some).ok_or_else(|| {
                StoreError::CorruptedMetadata {
                    reason: format!(
                        "seal watermark of interval {interval_ms}ms has {} bytes",
                        bytes.len()
                    ),
                }
                .into()
            }),
            None => Ok(None),
        }
    }

    /// Returns every buffered key, decoded, with corrupt keys skipped.
    ///
    /// Used to rebuild in-memory admission state after a restart.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Engine`] if the scan fails.
    pub fn keys(&self) -> Result<Vec<AggregationKey>> {
        let mut keys = Vec::new();
        for item in self.db.iter().keys() {
            let bytes = item.map_err(StoreError::from)?;
            match AggregationKey::decode(&bytes) {
                Ok(key) => keys.push(key),
                Err(e) => warn!(error = %e, "skipping corrupt key"),
            }
        }
        Ok(keys)
    }

    /// Snapshot of storage statistics.
    pub fn stats(&self) -> StoreStats {
        let c = &self.counters;
        let disk_usage_bytes = match self.db.size_on_disk() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to read store size on disk");
                0
            }
        };
        let reads = c.reads.load(Ordering::Relaxed);
        let merges = c.merges.load(Ordering::Relaxed);
        let read_amplification = if merges == 0 { 0 } else { reads * 100 / merges };

        StoreStats {
            flushes: c.flushes.load(Ordering::Relaxed),
            flushed_bytes: c.flushed_bytes.load(Ordering::Relaxed),
            compactions: 0,
            compacted_bytes_read: 0,
            compacted_bytes_written: 0,
            ingested_bytes: c.ingested_bytes.load(Ordering::Relaxed),
            memtable_size_bytes: c.unflushed_bytes.load(Ordering::Relaxed),
            disk_usage_bytes,
            read_amplification,
            tables: self.db.tree_names().len() as u64,
            pending_compaction_bytes: disk_usage_bytes
                .saturating_sub(c.live_bytes.load(Ordering::Relaxed)),
            tombstones: c.tombstones.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
impl BufferStore {
    /// Writes raw bytes, bypassing the merge path.
    pub(crate) fn insert_raw(&self, key: &[u8], value: &[u8]) {
        self.db.insert(key, value).unwrap();
    }
}

fn decode_watermark(bytes: &[u8]) -> Option<u64> {
    <[u8; 8]>::try_from(bytes).ok().map(u64::from_be_bytes)
}

impl Drop for BufferStore {
    fn drop(&mut self) {
        if let Err(e) = self.db.flush() {
            warn!(error = %e, path = %self.path.display(), "failed to flush buffer store on close");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ApmEvent, Outcome};
    use crate::key::{KeyPart, PartKind};
    use tempfile::TempDir;

    const MINUTE_MS: u32 = 60_000;
    const MINUTE_NS: u64 = 60_000_000_000;

    fn config() -> AggregatorConfig {
        AggregatorConfig::default()
    }

    fn service_key(window_start: u64, name: &str) -> AggregationKey {
        AggregationKey::global(MINUTE_MS, window_start)
            .child(KeyPart::named(PartKind::Service, name), 0)
            .unwrap()
    }

    fn one(duration_us: u64) -> MetricValue {
        let event = ApmEvent::transaction(0, "svc", "request", "GET /", duration_us, Outcome::Success);
        MetricValue::from_event(&event, &config().histogram)
    }

    #[test]
    fn test_create_writes_metadata() {
        let temp_dir = TempDir::new().unwrap();
        let store_path = temp_dir.path().join("store");

        let store = BufferStore::open(&store_path, &config()).unwrap();
        assert!(store.is_empty());
        assert!(store_path.join(METADATA_FILE).exists());
        assert!(store_path.join(ENGINE_DIR).exists());
        assert_eq!(store.value_format_hash(), config().value_format_hash());
    }

    #[test]
    fn test_merge_write_and_get() {
        let temp_dir = TempDir::new().unwrap();
        let store = BufferStore::open(temp_dir.path().join("store"), &config()).unwrap();
        let key = service_key(0, "a");

        assert!(store.get(&key).unwrap().is_none());
        store.merge_write(&key, &one(10)).unwrap();
        store.merge_write(&key, &one(30)).unwrap();

        let value = store.get(&key).unwrap().unwrap();
        assert_eq!(value.count(), 2);
        assert_eq!(value.histogram().sum_us(), 40);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_scan_and_delete_window() {
        let temp_dir = TempDir::new().unwrap();
        let store = BufferStore::open(temp_dir.path().join("store"), &config()).unwrap();

        for name in ["c", "a", "b"] {
            store.merge_write(&service_key(0, name), &one(1)).unwrap();
            store.merge_write(&service_key(MINUTE_NS, name), &one(1)).unwrap();
        }
        store
            .merge_write(&AggregationKey::global(MINUTE_MS, 0), &one(1))
            .unwrap();

        let names: Vec<String> = store
            .scan_window(MINUTE_MS, 0)
            .map(|e| e.unwrap().decode().unwrap().0.to_string())
            .collect();
        assert_eq!(names.len(), 4);
        assert!(names[0].ends_with("/global"));
        assert!(names[1].ends_with("service=a"));
        assert!(names[3].ends_with("service=c"));

        assert_eq!(store.windows(MINUTE_MS).unwrap(), vec![0, MINUTE_NS]);
        assert_eq!(store.oldest_window(MINUTE_MS).unwrap(), Some(0));

        assert_eq!(store.delete_window(MINUTE_MS, 0).unwrap(), 4);
        assert_eq!(store.scan_window(MINUTE_MS, 0).count(), 0);
        assert_eq!(store.scan_window(MINUTE_MS, MINUTE_NS).count(), 3);
        assert_eq!(store.oldest_window(MINUTE_MS).unwrap(), Some(MINUTE_NS));
        assert_eq!(store.oldest_window(10 * MINUTE_MS).unwrap(), None);

        // Deleting an empty window is a no-op
        assert_eq!(store.delete_window(MINUTE_MS, 0).unwrap(), 0);
        assert_eq!(store.stats().tombstones, 4);
    }

    #[test]
    fn test_reopen_mismatched_format_fails() {
        let temp_dir = TempDir::new().unwrap();
        let store_path = temp_dir.path().join("store");
        drop(BufferStore::open(&store_path, &config()).unwrap());

        let mut other = config();
        other.sketch.precision = 10;
        let err = BufferStore::open(&store_path, &other).unwrap_err();
        assert!(matches!(
            err,
            crate::error::RollupError::Store(StoreError::ConfigMismatch { .. })
        ));

        // Limits are not part of the format
        let mut limits = config();
        limits.limits.max_services = 3;
        assert!(BufferStore::open(&store_path, &limits).is_ok());
    }

    #[test]
    fn test_corrupted_metadata() {
        let temp_dir = TempDir::new().unwrap();
        let store_path = temp_dir.path().join("store");
        drop(BufferStore::open(&store_path, &config()).unwrap());

        fs::write(store_path.join(METADATA_FILE), "{not json").unwrap();
        let err = BufferStore::open(&store_path, &config()).unwrap_err();
        assert!(matches!(
            err,
            crate::error::RollupError::Store(StoreError::CorruptedMetadata { .. })
        ));
    }

    #[test]
    fn test_corrupt_value_surfaces_on_scan_decode() {
        let temp_dir = TempDir::new().unwrap();
        let store = BufferStore::open(temp_dir.path().join("store"), &config()).unwrap();
        let key = service_key(0, "a");
        store.db.insert(key.encode(), &[9u8, 9, 9][..]).unwrap();

        let entry = store.scan_window(MINUTE_MS, 0).next().unwrap().unwrap();
        assert!(entry.decode().unwrap_err().is_corruption());
        assert!(store.merge_write(&key, &one(1)).is_err());
    }

    #[test]
    fn test_seal_watermark_persists() {
        let temp_dir = TempDir::new().unwrap();
        let store_path = temp_dir.path().join("store");
        {
            let store = BufferStore::open(&store_path, &config()).unwrap();
            assert_eq!(store.sealed_before(MINUTE_MS).unwrap(), None);
            store.record_seal(MINUTE_MS, 2 * MINUTE_NS).unwrap();
            store.record_seal(MINUTE_MS, MINUTE_NS).unwrap();
            store.sync().unwrap();
        }

        let store = BufferStore::open(&store_path, &config()).unwrap();
        assert_eq!(store.sealed_before(MINUTE_MS).unwrap(), Some(2 * MINUTE_NS));
        assert_eq!(store.sealed_before(10 * MINUTE_MS).unwrap(), None);

        // Watermarks are not aggregates
        assert!(store.is_empty());
        assert_eq!(store.oldest_window(MINUTE_MS).unwrap(), None);
    }

    #[test]
    fn test_stats_track_writes() {
        let temp_dir = TempDir::new().unwrap();
        let store = BufferStore::open(temp_dir.path().join("store"), &config()).unwrap();
        store.merge_write(&service_key(0, "a"), &one(1)).unwrap();

        let stats = store.stats();
        assert!(stats.flushes >= 1);
        assert!(stats.ingested_bytes > 0);
        assert_eq!(stats.memtable_size_bytes, 0);
        assert!(stats.read_amplification >= 100);
        assert!(stats.tables >= 1);
    }
}
