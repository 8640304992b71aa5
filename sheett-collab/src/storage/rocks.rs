//! RocksDB-backed persistent document store.
//!
//! Column families:
//! - `documents` — full store snapshots (JSON, LZ4 compressed)
//! - `deltas`    — per-patch log (bincode, LZ4 compressed, keyed by doc_id\0version)
//! - `metadata`  — document metadata (bincode: version, delta count, sizes, timestamps)
//!
//! A document's state is its snapshot with every remaining delta merged on
//! top. Merge is idempotent, so deltas already folded into the snapshot may
//! linger until compaction without affecting the result.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use sheett_core::{MergeableStore, Patch, Snapshot};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;

/// Column family names.
const CF_DOCUMENTS: &str = "documents";
const CF_DELTAS: &str = "deltas";
const CF_METADATA: &str = "metadata";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_DELTAS, CF_METADATA];

/// Separates the document id from the version in delta keys.
const KEY_SEPARATOR: u8 = 0;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("sheett_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Document metadata stored alongside snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub doc_id: String,
    /// Highest delta version written
    pub version: u64,
    /// Delta version folded into the current snapshot
    pub snapshot_version: u64,
    /// Deltas written since creation
    pub delta_count: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last modified timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(doc_id: &str) -> Self {
        let now = unix_secs();
        Self {
            doc_id: doc_id.to_string(),
            version: 0,
            snapshot_version: 0,
            delta_count: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

/// Storage errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Document not found: {0}")]
    NotFound(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Compression error: {0}")]
    CompressionError(String),
    #[error("Invalid document id: {0:?}")]
    InvalidDocumentId(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Persisted state of a document, rebuilt into a store.
#[derive(Debug)]
pub struct LoadedDocument {
    pub store: MergeableStore,
    /// Highest delta version seen on disk
    pub version: u64,
    /// Number of deltas merged on top of the snapshot
    pub replayed_deltas: usize,
}

/// RocksDB-backed document store.
pub struct DocumentStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl DocumentStore {
    /// Open the document store at the configured path.
    ///
    /// Creates the database and column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(64 * 1024 * 1024);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::debug!("Opened document store at {}", config.path.display());
        Ok(Self { db, config })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Values are LZ4-compressed before they reach RocksDB.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS | CF_METADATA => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_DELTAS => {
                // Many small writes, range-scanned per document
                opts.set_max_write_buffer_number(4);
            }
            _ => {}
        }

        opts
    }

    // ─── Document Snapshots ───────────────────────────────────────────

    /// Save a full document snapshot (LZ4 compressed).
    ///
    /// `covers_version` is the highest delta version already folded in.
    pub fn save_snapshot(
        &self,
        doc_id: &str,
        snapshot: &[u8],
        covers_version: u64,
    ) -> Result<DocumentMetadata, StoreError> {
        Self::check_id(doc_id)?;
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(snapshot);

        let mut meta = self.metadata_or_new(doc_id)?;
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.snapshot_version = meta.snapshot_version.max(covers_version);
        meta.version = meta.version.max(covers_version);
        meta.updated_at = unix_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_docs, doc_id.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, doc_id.as_bytes(), meta.encode()?);
        self.write(batch)?;

        Ok(meta)
    }

    /// Load a document snapshot (LZ4 decompressed).
    pub fn load_snapshot(&self, doc_id: &str) -> Result<Vec<u8>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(&cf, doc_id.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map_err(|e| StoreError::CompressionError(e.to_string())),
            None => Err(StoreError::NotFound(doc_id.to_string())),
        }
    }

    /// Check if a document exists.
    pub fn document_exists(&self, doc_id: &str) -> Result<bool, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        Ok(self.db.get_cf(&cf, doc_id.as_bytes())?.is_some())
    }

    // ─── Deltas ───────────────────────────────────────────────────────

    /// Store a compressed delta for a document.
    ///
    /// Key format: `<doc_id utf8><0x00><version:8 bytes big-endian>`
    pub fn store_delta(&self, doc_id: &str, version: u64, delta: &[u8]) -> Result<u64, StoreError> {
        Self::check_id(doc_id)?;
        let cf_deltas = self.cf(CF_DELTAS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(delta);
        let compressed_len = compressed.len() as u64;

        let mut meta = self.metadata_or_new(doc_id)?;
        meta.version = meta.version.max(version);
        meta.delta_count += 1;
        meta.updated_at = unix_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_deltas, Self::delta_key(doc_id, version), &compressed);
        batch.put_cf(&cf_meta, doc_id.as_bytes(), meta.encode()?);
        self.write(batch)?;

        Ok(compressed_len)
    }

    /// Load all deltas for a document since a given version (inclusive).
    ///
    /// Returns deltas in version order, LZ4 decompressed.
    pub fn load_deltas_since(
        &self,
        doc_id: &str,
        since_version: u64,
    ) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        let mut deltas = Vec::new();
        self.scan_deltas(doc_id, since_version, |version, value| {
            let decompressed = lz4_flex::decompress_size_prepended(value)
                .map_err(|e| StoreError::CompressionError(e.to_string()))?;
            deltas.push((version, decompressed));
            Ok(())
        })?;
        Ok(deltas)
    }

    /// Load all deltas for a document.
    pub fn load_all_deltas(&self, doc_id: &str) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        self.load_deltas_since(doc_id, 0)
    }

    /// Delete deltas up to and including a version (after a snapshot).
    pub fn compact_deltas(&self, doc_id: &str, up_to_version: u64) -> Result<u64, StoreError> {
        let cf = self.cf(CF_DELTAS)?;
        let mut batch = WriteBatch::default();
        let mut count = 0u64;
        self.scan_deltas(doc_id, 0, |version, _| {
            if version <= up_to_version {
                batch.delete_cf(&cf, Self::delta_key(doc_id, version));
                count += 1;
            }
            Ok(())
        })?;

        if count > 0 {
            self.db.write(batch)?;
            log::debug!("Compacted {count} deltas of {doc_id} up to v{up_to_version}");
        }
        Ok(count)
    }

    fn scan_deltas<F>(&self, doc_id: &str, since_version: u64, mut visit: F) -> Result<(), StoreError>
    where
        F: FnMut(u64, &[u8]) -> Result<(), StoreError>,
    {
        let cf = self.cf(CF_DELTAS)?;
        let prefix = Self::delta_prefix(doc_id);
        let start_key = Self::delta_key(doc_id, since_version);

        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) || key.len() != prefix.len() + 8 {
                break;
            }
            let mut ver_buf = [0u8; 8];
            ver_buf.copy_from_slice(&key[prefix.len()..]);
            visit(u64::from_be_bytes(ver_buf), &value)?;
        }
        Ok(())
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    /// Load document metadata.
    pub fn load_metadata(&self, doc_id: &str) -> Result<DocumentMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, doc_id.as_bytes())? {
            Some(bytes) => DocumentMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(doc_id.to_string())),
        }
    }

    fn metadata_or_new(&self, doc_id: &str) -> Result<DocumentMetadata, StoreError> {
        match self.load_metadata(doc_id) {
            Ok(meta) => Ok(meta),
            Err(StoreError::NotFound(_)) => Ok(DocumentMetadata::new(doc_id)),
            Err(e) => Err(e),
        }
    }

    /// List all document ids in the store.
    pub fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut doc_ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let id = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            doc_ids.push(id);
        }
        Ok(doc_ids)
    }

    /// Delete a document and all its deltas/metadata.
    pub fn delete_document(&self, doc_id: &str) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let cf_deltas = self.cf(CF_DELTAS)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_docs, doc_id.as_bytes());
        batch.delete_cf(&cf_meta, doc_id.as_bytes());
        self.scan_deltas(doc_id, 0, |version, _| {
            batch.delete_cf(&cf_deltas, Self::delta_key(doc_id, version));
            Ok(())
        })?;

        self.db.write(batch)?;
        log::info!("Deleted document {doc_id}");
        Ok(())
    }

    // ─── Store state ──────────────────────────────────────────────────

    /// Persist one patch as a delta.
    pub fn store_patch(&self, doc_id: &str, version: u64, patch: &Patch) -> Result<u64, StoreError> {
        let bytes = bincode::serde::encode_to_vec(patch, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        self.store_delta(doc_id, version, &bytes)
    }

    /// Persist a full snapshot and drop the deltas it covers.
    pub fn checkpoint(
        &self,
        doc_id: &str,
        snapshot: &Snapshot,
        covers_version: u64,
    ) -> Result<DocumentMetadata, StoreError> {
        let json = snapshot
            .to_json()
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let meta = self.save_snapshot(doc_id, &json, covers_version)?;
        self.compact_deltas(doc_id, covers_version)?;
        Ok(meta)
    }

    /// Rebuild a document from its snapshot and delta log.
    ///
    /// `Ok(None)` means the document was never persisted. A snapshot or
    /// delta that cannot be decoded is an error, never an empty document.
    pub fn load_document(
        &self,
        doc_id: &str,
        replica_id: &str,
    ) -> Result<Option<LoadedDocument>, StoreError> {
        let meta = match self.load_metadata(doc_id) {
            Ok(meta) => meta,
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut store = match self.load_snapshot(doc_id) {
            Ok(bytes) => {
                let snapshot = Snapshot::from_json(&bytes)
                    .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
                MergeableStore::from_snapshot(snapshot)
            }
            Err(StoreError::NotFound(_)) => MergeableStore::with_replica(doc_id, replica_id),
            Err(e) => return Err(e),
        };

        let deltas = self.load_all_deltas(doc_id)?;
        let mut version = meta.version;
        for (delta_version, bytes) in &deltas {
            let (patch, _): (Patch, usize) =
                bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                    .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            store.merge(&patch);
            version = version.max(*delta_version);
        }

        Ok(Some(LoadedDocument {
            store,
            version,
            replayed_deltas: deltas.len(),
        }))
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn check_id(doc_id: &str) -> Result<(), StoreError> {
        if doc_id.is_empty() || doc_id.as_bytes().contains(&KEY_SEPARATOR) {
            return Err(StoreError::InvalidDocumentId(doc_id.to_string()));
        }
        Ok(())
    }

    fn delta_prefix(doc_id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(doc_id.len() + 9);
        key.extend_from_slice(doc_id.as_bytes());
        key.push(KEY_SEPARATOR);
        key
    }

    fn delta_key(doc_id: &str, version: u64) -> Vec<u8> {
        let mut key = Self::delta_prefix(doc_id);
        key.extend_from_slice(&version.to_be_bytes());
        key
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
