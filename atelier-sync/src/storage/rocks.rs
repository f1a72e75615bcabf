//! RocksDB-backed element store.
//!
//! Column families:
//! - `elements`: one record per element id (LZ4-compressed bincode `{seq, json}`)
//! - `metadata`: store bookkeeping (next insertion sequence)
//!
//! Each id is assigned a sequence number on its first write and keeps it on
//! every later replacement, so `load()` returns elements in the order they
//! were first created, across restarts.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::element::Element;

const CF_ELEMENTS: &str = "elements";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_ELEMENTS, CF_METADATA];

const KEY_NEXT_SEQ: &[u8] = b"next_seq";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 32MB)
    pub block_cache_size: usize,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Open without write access, e.g. to inspect a backup (default: false)
    pub read_only: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("atelier_data/workspace"),
            block_cache_size: 32 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 256,
            read_only: false,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// Size summary of the durable store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub count: usize,
    pub byte_size: u64,
    pub path: PathBuf,
}

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rocksdb::Error),
    #[error("column family '{0}' not found")]
    MissingColumnFamily(&'static str),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("element body error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage task failed: {0}")]
    Task(String),
}

/// On-disk record. The element body stays JSON so opaque `style` values
/// survive unchanged.
#[derive(Debug, Serialize, Deserialize)]
struct StoredElement {
    seq: u64,
    json: Vec<u8>,
}

impl StoredElement {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        let raw = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        let (record, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(record)
    }
}

/// Per-id write generations since the last full batch.
///
/// Every single write bumps `generation` and stamps its id. A batch built
/// from a snapshot taken at generation `g` leaves alone every id stamped
/// after `g`, because disk already holds something newer for it.
#[derive(Debug, Default)]
struct WriteLog {
    generation: u64,
    stamped: HashMap<String, u64>,
}

impl WriteLog {
    fn stamp(&mut self, id: &str) {
        self.generation += 1;
        self.stamped.insert(id.to_string(), self.generation);
    }

    fn newer_than(&self, id: &str, as_of: u64) -> bool {
        self.stamped.get(id).is_some_and(|g| *g > as_of)
    }
}

/// Durable element store.
///
/// Single writes come from the engine task while a batch may be running on
/// the blocking pool. All writes hold `writes`, and a batch skips ids that
/// were written after its snapshot.
pub struct ElementStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    next_seq: AtomicU64,
    writes: Mutex<WriteLog>,
}

impl ElementStore {
    /// Open the store at the configured path, creating it if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() && !config.read_only {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = if config.read_only {
            DBWithThreadMode::<SingleThreaded>::open_cf_descriptors_read_only(
                &db_opts,
                &config.path,
                cf_descriptors,
                false,
            )?
        } else {
            DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
                &db_opts,
                &config.path,
                cf_descriptors,
            )?
        };

        let next_seq = Self::recover_sequence(&db)?;
        log::debug!(
            "opened element store at {} (next seq {next_seq}{})",
            config.path.display(),
            if config.read_only { ", read-only" } else { "" }
        );

        Ok(Self {
            db,
            config,
            next_seq: AtomicU64::new(next_seq),
            writes: Mutex::new(WriteLog::default()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);

        match name {
            // Values are already LZ4-compressed
            CF_ELEMENTS => opts.set_compression_type(DBCompressionType::None),
            CF_METADATA => opts.optimize_for_point_lookup(config.block_cache_size as u64),
            _ => {}
        }

        opts
    }

    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> Result<u64, StoreError> {
        let cf = db
            .cf_handle(CF_METADATA)
            .ok_or(StoreError::MissingColumnFamily(CF_METADATA))?;
        match db.get_cf(cf, KEY_NEXT_SEQ)? {
            Some(bytes) if bytes.len() == 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes);
                Ok(u64::from_be_bytes(buf))
            }
            _ => Ok(0),
        }
    }

    // ─── Reads ────────────────────────────────────────────────────────

    /// Load every element, ordered by first insertion.
    pub fn load(&self) -> Result<Vec<Element>, StoreError> {
        let cf = self.cf(CF_ELEMENTS)?;
        let mut records = Vec::new();

        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            let record = StoredElement::decode(&value)?;
            match serde_json::from_slice::<Element>(&record.json) {
                Ok(element) => records.push((record.seq, element)),
                Err(e) => {
                    log::warn!(
                        "skipping unreadable element {}: {e}",
                        String::from_utf8_lossy(&key)
                    );
                }
            }
        }

        records.sort_by_key(|(seq, _)| *seq);
        Ok(records.into_iter().map(|(_, element)| element).collect())
    }

    pub fn get(&self, id: &str) -> Result<Option<Element>, StoreError> {
        let cf = self.cf(CF_ELEMENTS)?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(bytes) => {
                let record = StoredElement::decode(&bytes)?;
                Ok(Some(serde_json::from_slice(&record.json)?))
            }
            None => Ok(None),
        }
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        let cf = self.cf(CF_ELEMENTS)?;
        let mut count = 0;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    // ─── Writes ───────────────────────────────────────────────────────

    /// Insert or replace one element.
    pub fn persist_one(&self, element: &Element) -> Result<(), StoreError> {
        let mut writes = self.lock();
        writes.stamp(&element.id);
        let mut batch = WriteBatch::default();
        self.stage_put(&mut batch, element)?;
        self.commit(batch)
    }

    /// Delete one element. Absent ids are not an error.
    pub fn remove(&self, id: &str) -> Result<(), StoreError> {
        let mut writes = self.lock();
        writes.stamp(id);
        let cf = self.cf(CF_ELEMENTS)?;
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.delete_cf_opt(cf, id.as_bytes(), &write_opts)?;
        Ok(())
    }

    /// Current write generation. Take it together with the snapshot that
    /// is later handed to [`persist_snapshot`](Self::persist_snapshot).
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Make the store match `elements` exactly, in one atomic write.
    ///
    /// Existing ids keep their sequence; new ids are appended in slice order.
    /// Stored ids missing from `elements` are deleted.
    pub fn persist_batch(&self, elements: &[Element]) -> Result<usize, StoreError> {
        self.persist_snapshot(elements, u64::MAX)
    }

    /// Like [`persist_batch`](Self::persist_batch) for a snapshot taken at
    /// write generation `as_of`. Ids written after `as_of` are neither
    /// overwritten nor deleted. Returns the number of elements written.
    pub fn persist_snapshot(&self, elements: &[Element], as_of: u64) -> Result<usize, StoreError> {
        let mut writes = self.lock();
        let cf = self.cf(CF_ELEMENTS)?;
        let mut batch = WriteBatch::default();

        let live: HashSet<&str> = elements.iter().map(|e| e.id.as_str()).collect();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let stale = match std::str::from_utf8(&key) {
                Ok(id) => !live.contains(id) && !writes.newer_than(id, as_of),
                Err(_) => true,
            };
            if stale {
                batch.delete_cf(cf, &key);
            }
        }

        let mut written = 0;
        for element in elements {
            if writes.newer_than(&element.id, as_of) {
                continue;
            }
            self.stage_put(&mut batch, element)?;
            written += 1;
        }
        self.commit(batch)?;

        // Disk now reflects everything up to `as_of`
        writes.stamped.retain(|_, g| *g > as_of);
        Ok(written)
    }

    fn stage_put(&self, batch: &mut WriteBatch, element: &Element) -> Result<(), StoreError> {
        let cf_elements = self.cf(CF_ELEMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let seq = match self.db.get_cf(cf_elements, element.id.as_bytes())? {
            Some(bytes) => StoredElement::decode(&bytes)?.seq,
            None => {
                let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
                batch.put_cf(cf_meta, KEY_NEXT_SEQ, (seq + 1).to_be_bytes());
                seq
            }
        };

        let record = StoredElement {
            seq,
            json: serde_json::to_vec(element)?,
        };
        batch.put_cf(cf_elements, element.id.as_bytes(), record.encode()?);
        Ok(())
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    // ─── Maintenance ──────────────────────────────────────────────────

    /// Element count, on-disk size and location.
    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        Ok(StoreStats {
            count: self.count()?,
            byte_size: dir_size(&self.config.path)?,
            path: self.config.path.clone(),
        })
    }

    /// Consistent point-in-time copy of the database.
    ///
    /// `None` writes to `<parent>/backups/workspace-<timestamp>`. The target
    /// directory must not exist yet.
    pub fn backup(&self, target: Option<&Path>) -> Result<PathBuf, StoreError> {
        let target = match target {
            Some(path) => path.to_path_buf(),
            None => self.default_backup_path(),
        };
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }

        self.db.flush()?;
        let checkpoint = rocksdb::checkpoint::Checkpoint::new(&self.db)?;
        checkpoint.create_checkpoint(&target)?;
        log::info!("backup written to {}", target.display());
        Ok(target)
    }

    fn default_backup_path(&self) -> PathBuf {
        let parent = self
            .config
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%S%.3fZ");
        parent.join("backups").join(format!("workspace-{stamp}"))
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &'static str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or(StoreError::MissingColumnFamily(name))
    }

    fn lock(&self) -> MutexGuard<'_, WriteLog> {
        self.writes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn dir_size(path: &Path) -> Result<u64, std::io::Error> {
    let mut total = 0;
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        // Compaction can delete files mid-walk
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if meta.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += meta.len();
        }
    }
    Ok(total)
}
