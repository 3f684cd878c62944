//! Storage layer: guarded CRUD over pluggable document engines.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐  Arc<dyn Collection>  ┌────────────────┐
//! │StorageAdapter│ ────────────────────► │ MemoryEngine   │
//! │ (timestamps, │  (cached per name)    │ DocumentStore  │
//! │  guarding)   │                       │  (RocksDB)     │
//! └──────────────┘                       └───────┬────────┘
//!                                                │ column families
//!                                                ▼
//!                              ┌──────────────────────────────────────┐
//!                              │ CF "documents"  : LZ4 BSON documents │
//!                              │ CF "collections": bincode metadata   │
//!                              └──────────────────────────────────────┘
//! ```

pub mod adapter;
pub mod engine;
pub mod filter;
pub mod memory;
pub mod rocks;

pub use adapter::{object_id, StorageAdapter, CREATED_AT, UPDATED_AT};
pub use engine::{Collection, EngineError, StorageEngine};
pub use filter::FindOptions;
pub use memory::MemoryEngine;
pub use rocks::{CollectionMetadata, DocumentStore, StoreConfig, StoreError};
