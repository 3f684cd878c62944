//! RocksDB-backed persistent storage engine.
//!
//! Column families:
//! - `documents`: BSON documents (LZ4 compressed), keyed `<collection>\0<oid:12 bytes>`
//! - `collections`: per-collection metadata (bincode), keyed by collection name
//!
//! Keys sort by collection then by ObjectId, so a prefix scan yields a
//! collection's documents in insertion order.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bson::{oid::ObjectId, Bson, Document};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::engine::{
    apply_set, replacement_for, validate_collection_name, with_identity, Collection, EngineError,
    StorageEngine,
};
use super::filter::{apply_options, matches, FindOptions};

/// Column family names.
const CF_DOCUMENTS: &str = "documents";
const CF_COLLECTIONS: &str = "collections";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_COLLECTIONS];

/// Separates the collection name from the ObjectId in document keys.
const KEY_SEPARATOR: u8 = 0;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("docsync_data"),
            block_cache_size: 256 * 1024 * 1024, // 256MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024, // 64MB
        }
    }
}

impl StoreConfig {
    /// Default tuning rooted at `path`.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024, // 8MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024, // 4MB
        }
    }
}

/// Per-collection bookkeeping stored in the `collections` column family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionMetadata {
    pub name: String,
    /// Live documents in the collection
    pub document_count: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last write timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl CollectionMetadata {
    fn new(name: &str) -> Self {
        let now = unix_now();
        Self {
            name: name.to_string(),
            document_count: 0,
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

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Storage errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// RocksDB internal error
    #[error("Database error: {0}")]
    DatabaseError(String),
    /// Collection has never been written
    #[error("Collection not found: {0}")]
    CollectionNotFound(String),
    /// Document `_id` is not an ObjectId
    #[error("Persistent collections require ObjectId identities, got {0}")]
    UnsupportedId(String),
    /// Serialization failed
    #[error("Serialization error: {0}")]
    SerializationError(String),
    /// Deserialization failed
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    /// Compression error
    #[error("Compression error: {0}")]
    CompressionError(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::SerializationError(msg) | StoreError::DeserializationError(msg) => {
                EngineError::Serialization(msg)
            }
            other => EngineError::Storage(other.to_string()),
        }
    }
}

/// RocksDB-backed document store.
///
/// Clone-friendly via Arc; every clone shares the same database handle and
/// the same write lock.
#[derive(Clone)]
pub struct DocumentStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    /// RocksDB instance (single-threaded mode, concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes read-modify-write sequences across collections
    write_lock: Mutex<()>,
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
        db_opts.set_max_total_wal_size(128 * 1024 * 1024); // 128MB WAL limit
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

        log::info!("Opened document store at {}", config.path.display());

        Ok(Self {
            inner: Arc::new(StoreInner {
                db,
                config,
                write_lock: Mutex::new(()),
            }),
        })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024); // 16KB blocks
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS => {
                // Values are already LZ4 framed
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            CF_COLLECTIONS => {
                // Small values, frequent reads
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    // ─── Documents ────────────────────────────────────────────────────

    /// Write a document (LZ4-compressed BSON) and bump collection metadata
    /// in one atomic batch.
    pub fn put_document(
        &self,
        collection: &str,
        doc: &Document,
        is_new: bool,
    ) -> Result<ObjectId, StoreError> {
        let id = object_id_of(doc)?;
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_COLLECTIONS)?;

        let encoded = bson::to_vec(doc).map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);

        let mut meta = self
            .collection_metadata(collection)
            .unwrap_or_else(|_| CollectionMetadata::new(collection));
        if is_new {
            meta.document_count += 1;
        }
        meta.updated_at = unix_now();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_docs, Self::document_key(collection, &id), &compressed);
        batch.put_cf(&cf_meta, collection.as_bytes(), &meta.encode()?);
        self.write(batch)?;

        Ok(id)
    }

    /// Load a single document by identity.
    pub fn get_document(&self, collection: &str, id: &ObjectId) -> Result<Option<Document>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.inner.db.get_cf(&cf, Self::document_key(collection, id))? {
            Some(compressed) => Self::decode_document(&compressed).map(Some),
            None => Ok(None),
        }
    }

    /// Load every document in `collection`, in key (insertion) order.
    pub fn scan_collection(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let prefix = Self::collection_prefix(collection);

        let mut docs = Vec::new();
        let iter = self.inner.db.iterator_cf(
            &cf,
            IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            // Stop once we've passed this collection's key prefix
            if !key.starts_with(&prefix) {
                break;
            }
            docs.push(Self::decode_document(&value)?);
        }
        Ok(docs)
    }

    /// Delete a document. Returns false when it did not exist.
    pub fn delete_document(&self, collection: &str, id: &ObjectId) -> Result<bool, StoreError> {
        if self.get_document(collection, id)?.is_none() {
            return Ok(false);
        }
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_COLLECTIONS)?;

        let mut meta = self
            .collection_metadata(collection)
            .unwrap_or_else(|_| CollectionMetadata::new(collection));
        meta.document_count = meta.document_count.saturating_sub(1);
        meta.updated_at = unix_now();

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_docs, Self::document_key(collection, id));
        batch.put_cf(&cf_meta, collection.as_bytes(), &meta.encode()?);
        self.write(batch)?;
        Ok(true)
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn collection_metadata(&self, collection: &str) -> Result<CollectionMetadata, StoreError> {
        let cf = self.cf(CF_COLLECTIONS)?;
        match self.inner.db.get_cf(&cf, collection.as_bytes())? {
            Some(bytes) => CollectionMetadata::decode(&bytes),
            None => Err(StoreError::CollectionNotFound(collection.to_string())),
        }
    }

    /// List every collection that has ever been written.
    pub fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_COLLECTIONS)?;
        let mut names = Vec::new();
        for item in self.inner.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            names.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(names)
    }

    /// Force a memtable flush to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.inner
            .db
            .flush()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.inner.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.inner.config.sync_writes);
        self.inner.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.inner
            .db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn collection_prefix(collection: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(collection.len() + 1);
        prefix.extend_from_slice(collection.as_bytes());
        prefix.push(KEY_SEPARATOR);
        prefix
    }

    /// Build a document key: collection name, NUL, ObjectId (12 bytes).
    fn document_key(collection: &str, id: &ObjectId) -> Vec<u8> {
        let mut key = Self::collection_prefix(collection);
        key.extend_from_slice(&id.bytes());
        key
    }

    fn decode_document(compressed: &[u8]) -> Result<Document, StoreError> {
        let raw = lz4_flex::decompress_size_prepended(compressed)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        bson::from_slice(&raw).map_err(|e| StoreError::DeserializationError(e.to_string()))
    }
}

fn object_id_of(doc: &Document) -> Result<ObjectId, StoreError> {
    match doc.get("_id") {
        Some(Bson::ObjectId(id)) => Ok(*id),
        Some(other) => Err(StoreError::UnsupportedId(other.to_string())),
        None => Err(StoreError::UnsupportedId("nothing".into())),
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

impl StorageEngine for DocumentStore {
    fn collection(&self, name: &str) -> Arc<dyn Collection> {
        Arc::new(RocksCollection {
            name: name.to_string(),
            store: self.clone(),
        })
    }

    fn kind(&self) -> &'static str {
        "rocksdb"
    }
}

struct RocksCollection {
    name: String,
    store: DocumentStore,
}

impl RocksCollection {
    fn first_match(&self, filter: &Document) -> Result<Option<Document>, EngineError> {
        for doc in self.store.scan_collection(&self.name)? {
            if matches(&doc, filter)? {
                return Ok(Some(doc));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Collection for RocksCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn insert_one(&self, doc: Document) -> Result<Bson, EngineError> {
        validate_collection_name(&self.name)?;
        let (id, stored) = with_identity(doc);
        let _guard = self.store.inner.write_lock.lock().await;
        let oid = object_id_of(&stored)?;
        if self.store.get_document(&self.name, &oid)?.is_some() {
            return Err(EngineError::DuplicateKey {
                collection: self.name.clone(),
                id: id.to_string(),
            });
        }
        self.store.put_document(&self.name, &stored, true)?;
        Ok(id)
    }

    async fn find(
        &self,
        filter: &Document,
        options: &FindOptions,
    ) -> Result<Vec<Document>, EngineError> {
        validate_collection_name(&self.name)?;
        let mut found = Vec::new();
        for doc in self.store.scan_collection(&self.name)? {
            if matches(&doc, filter)? {
                found.push(doc);
            }
        }
        Ok(apply_options(found, options))
    }

    async fn find_one_and_update(
        &self,
        filter: &Document,
        set: &Document,
    ) -> Result<Option<Document>, EngineError> {
        validate_collection_name(&self.name)?;
        let _guard = self.store.inner.write_lock.lock().await;
        let Some(mut doc) = self.first_match(filter)? else {
            return Ok(None);
        };
        apply_set(&mut doc, set)?;
        self.store.put_document(&self.name, &doc, false)?;
        Ok(Some(doc))
    }

    async fn find_one_and_replace(
        &self,
        filter: &Document,
        replacement: Document,
    ) -> Result<Option<Document>, EngineError> {
        validate_collection_name(&self.name)?;
        let _guard = self.store.inner.write_lock.lock().await;
        let Some(existing) = self.first_match(filter)? else {
            return Ok(None);
        };
        let stored = replacement_for(&existing, replacement)?;
        self.store.put_document(&self.name, &stored, false)?;
        Ok(Some(stored))
    }

    async fn find_one_and_delete(&self, filter: &Document) -> Result<Option<Document>, EngineError> {
        validate_collection_name(&self.name)?;
        let _guard = self.store.inner.write_lock.lock().await;
        let Some(existing) = self.first_match(filter)? else {
            return Ok(None);
        };
        self.store.delete_document(&self.name, &object_id_of(&existing)?)?;
        Ok(Some(existing))
    }
}
