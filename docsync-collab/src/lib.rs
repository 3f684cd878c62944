//! # docsync-collab: change-notifying CRUD over documents
//!
//! Peers read and write documents through a shared mediator; every
//! successful mutation is pushed to all other connected peers.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐    WebSocket      ┌────────────────┐
//! │ RealtimeClient │ ◄───────────────► │ RealtimeServer │───► BroadcastGroup
//! │ (per peer)     │   JSON frames     └───────┬────────┘     (fan-out)
//! └────────────────┘                           │
//!                         HTTP (axum)          ▼
//!                  ─────────────────────► ┌──────────┐     ┌────────────────┐
//!                                         │ Mediator │ ──► │ StorageAdapter │
//!                                         └──────────┘     └───────┬────────┘
//!                                                                  ▼
//!                                                  MemoryEngine / DocumentStore
//! ```
//!
//! ## Modules
//!
//! - [`storage`]: adapter, engine trait, in-memory and RocksDB engines
//! - [`outcome`]: uniform `{data, error}` result envelope
//! - [`mediator`]: operation dispatch and change-event production
//! - [`protocol`]: JSON wire protocol and call decoding
//! - [`broadcast`]: fan-out to every peer but the originator
//! - [`server`]: WebSocket server
//! - [`client`]: WebSocket client with per-call acks
//! - [`query`]: query-string coercion
//! - [`http`]: HTTP binding

pub mod broadcast;
pub mod client;
pub mod http;
pub mod mediator;
pub mod outcome;
pub mod protocol;
pub mod query;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, PeerInfo};
pub use client::{Ack, ChangeNotice, ConnectionState, RealtimeClient};
pub use http::HttpConfig;
pub use mediator::{change_channel, Change, ChangeEvent, Mediated, Mediator, Operation};
pub use outcome::{ErrorStatus, Outcome, OutcomeData, OutcomeError, NOT_FOUND_MESSAGE};
pub use protocol::{CallError, ClientMessage, ProtocolError, ServerMessage};
pub use query::{coerce_object, coerce_pairs, QueryError};
pub use server::{RealtimeServer, ServerConfig, ServerStats};
pub use storage::{
    DocumentStore, EngineError, MemoryEngine, StorageAdapter, StorageEngine, StoreConfig, StoreError,
};
