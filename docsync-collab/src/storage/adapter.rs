//! Storage adapter: the single entry point for document operations.
//!
//! Responsibilities:
//! - caches one engine collection handle per name (get-or-create)
//! - stamps `createdAt` / `updatedAt` from a monotonic clock
//! - converts engine faults and panics into `STORAGE_ERROR` outcomes
//! - maps "nothing matched" to `NOT_FOUND`
//!
//! Every public operation returns an [`Outcome`]; none of them fail.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use bson::{doc, oid::ObjectId, Bson, DateTime, Document};
use futures_util::FutureExt;
use tokio::sync::RwLock;

use super::engine::{Collection, EngineError, StorageEngine};
use super::filter::FindOptions;
use super::memory::MemoryEngine;
use crate::outcome::Outcome;

pub const CREATED_AT: &str = "createdAt";
pub const UPDATED_AT: &str = "updatedAt";

/// Hands out strictly increasing millisecond timestamps, tracking the wall
/// clock when it moves forward.
#[derive(Debug, Default)]
struct MonotonicClock {
    last: AtomicI64,
}

impl MonotonicClock {
    fn now(&self) -> DateTime {
        let wall = DateTime::now().timestamp_millis();
        let mut prev = self.last.load(Ordering::Acquire);
        loop {
            let next = wall.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return DateTime::from_millis(next),
                Err(actual) => prev = actual,
            }
        }
    }
}

/// Guarded CRUD over a [`StorageEngine`].
pub struct StorageAdapter {
    engine: Arc<dyn StorageEngine>,
    handles: RwLock<HashMap<String, Arc<dyn Collection>>>,
    clock: MonotonicClock,
}

impl StorageAdapter {
    pub fn new(engine: Arc<dyn StorageEngine>) -> Self {
        log::info!("Storage adapter using {} engine", engine.kind());
        Self {
            engine,
            handles: RwLock::new(HashMap::new()),
            clock: MonotonicClock::default(),
        }
    }

    /// Adapter over a fresh [`MemoryEngine`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryEngine::new()))
    }

    pub fn engine_kind(&self) -> &'static str {
        self.engine.kind()
    }

    /// Get or create the handle for `name`.
    ///
    /// Uses a read lock for the fast path (handle exists) and upgrades to a
    /// write lock only on first use.
    async fn collection(&self, name: &str) -> Arc<dyn Collection> {
        // Fast path: read lock
        {
            let handles = self.handles.read().await;
            if let Some(handle) = handles.get(name) {
                return Arc::clone(handle);
            }
        }

        // Slow path: write lock, re-check after acquiring
        let mut handles = self.handles.write().await;
        if let Some(handle) = handles.get(name) {
            return Arc::clone(handle);
        }
        let handle = self.engine.collection(name);
        handles.insert(name.to_string(), Arc::clone(&handle));
        log::debug!("Resolved collection handle '{name}'");
        handle
    }

    /// Number of distinct collection handles resolved so far.
    pub async fn cached_handles(&self) -> usize {
        self.handles.read().await.len()
    }

    /// Insert a new document. Caller-supplied `_id`, `createdAt` and
    /// `updatedAt` are discarded.
    pub async fn insert_one(&self, collection: &str, mut document: Document) -> Outcome {
        let handle = self.collection(collection).await;
        let now = self.clock.now();
        document.remove("_id");
        document.insert(CREATED_AT, now);
        document.insert(UPDATED_AT, now);

        guarded("insertOne", async move {
            let id = handle.insert_one(document.clone()).await?;
            let mut inserted = doc! { "_id": id };
            for (key, value) in document {
                inserted.insert(key, value);
            }
            Ok(Outcome::one(inserted))
        })
        .await
    }

    /// All documents matching `filter`. An empty result is `NOT_FOUND`.
    pub async fn find(
        &self,
        collection: &str,
        filter: Option<Document>,
        options: Option<Document>,
    ) -> Outcome {
        let handle = self.collection(collection).await;
        guarded("find", async move {
            let options = parse_options(options.as_ref())?;
            let docs = handle.find(&filter.unwrap_or_default(), &options).await?;
            if docs.is_empty() {
                return Ok(Outcome::not_found());
            }
            Ok(Outcome::many(docs))
        })
        .await
    }

    pub async fn find_one(
        &self,
        collection: &str,
        filter: Document,
        options: Option<Document>,
    ) -> Outcome {
        let handle = self.collection(collection).await;
        guarded("findOne", async move {
            let options = parse_options(options.as_ref())?;
            Ok(found(handle.find_one(&filter, &options).await?))
        })
        .await
    }

    pub async fn find_one_with_id(&self, collection: &str, id: ObjectId) -> Outcome {
        self.find_one(collection, doc! { "_id": id }, None).await
    }

    /// `$set` the given fields on the first match and return the updated
    /// document. `createdAt` in the update is ignored.
    pub async fn update_one(&self, collection: &str, filter: Document, mut update: Document) -> Outcome {
        let handle = self.collection(collection).await;
        update.remove(CREATED_AT);
        update.insert(UPDATED_AT, self.clock.now());

        guarded("updateOne", async move {
            Ok(found(handle.find_one_and_update(&filter, &update).await?))
        })
        .await
    }

    pub async fn update_one_with_id(&self, collection: &str, id: ObjectId, update: Document) -> Outcome {
        self.update_one(collection, doc! { "_id": id }, update).await
    }

    /// Replace the body of the first match, stamping both timestamps.
    pub async fn replace_one(&self, collection: &str, filter: Document, mut replacement: Document) -> Outcome {
        let handle = self.collection(collection).await;
        let now = self.clock.now();
        replacement.insert(CREATED_AT, now);
        replacement.insert(UPDATED_AT, now);

        guarded("replaceOne", async move {
            Ok(found(handle.find_one_and_replace(&filter, replacement).await?))
        })
        .await
    }

    pub async fn replace_one_with_id(&self, collection: &str, id: ObjectId, replacement: Document) -> Outcome {
        self.replace_one(collection, doc! { "_id": id }, replacement).await
    }

    /// Remove the first match and return the removed document.
    pub async fn delete_one(&self, collection: &str, filter: Document) -> Outcome {
        let handle = self.collection(collection).await;
        guarded("deleteOne", async move {
            Ok(found(handle.find_one_and_delete(&filter).await?))
        })
        .await
    }

    pub async fn delete_one_with_id(&self, collection: &str, id: ObjectId) -> Outcome {
        self.delete_one(collection, doc! { "_id": id }).await
    }
}

fn parse_options(options: Option<&Document>) -> Result<FindOptions, EngineError> {
    options.map_or_else(|| Ok(FindOptions::default()), FindOptions::from_document)
}

fn found(doc: Option<Document>) -> Outcome {
    match doc {
        Some(doc) => Outcome::one(doc),
        None => Outcome::not_found(),
    }
}

/// Run an engine call, folding both `Err` and panics into `STORAGE_ERROR`.
async fn guarded<F>(operation: &'static str, fut: F) -> Outcome
where
    F: Future<Output = Result<Outcome, EngineError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            log::warn!("{operation} failed: {e}");
            Outcome::storage_error(e.to_string())
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            log::error!("{operation} panicked: {message}");
            Outcome::storage_error(message)
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "storage engine panicked".to_string()
    }
}

/// The identity stamped on a stored document, if it is an ObjectId.
pub fn object_id(doc: &Document) -> Option<ObjectId> {
    match doc.get("_id") {
        Some(Bson::ObjectId(id)) => Some(*id),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::{ErrorStatus, NOT_FOUND_MESSAGE};
    use async_trait::async_trait;

    /// Engine whose collections fail or panic on every call.
    struct BrokenEngine {
        panics: bool,
    }

    struct BrokenCollection {
        panics: bool,
    }

    impl StorageEngine for BrokenEngine {
        fn collection(&self, _name: &str) -> Arc<dyn Collection> {
            Arc::new(BrokenCollection { panics: self.panics })
        }

        fn kind(&self) -> &'static str {
            "broken"
        }
    }

    impl BrokenCollection {
        fn fail<T>(&self) -> Result<T, EngineError> {
            if self.panics {
                panic!("engine exploded");
            }
            Err(EngineError::Storage("connection reset".into()))
        }
    }

    #[async_trait]
    impl Collection for BrokenCollection {
        fn name(&self) -> &str {
            "broken"
        }
        async fn insert_one(&self, _doc: Document) -> Result<Bson, EngineError> {
            self.fail()
        }
        async fn find(&self, _f: &Document, _o: &FindOptions) -> Result<Vec<Document>, EngineError> {
            self.fail()
        }
        async fn find_one_and_update(&self, _f: &Document, _s: &Document) -> Result<Option<Document>, EngineError> {
            self.fail()
        }
        async fn find_one_and_replace(&self, _f: &Document, _r: Document) -> Result<Option<Document>, EngineError> {
            self.fail()
        }
        async fn find_one_and_delete(&self, _f: &Document) -> Result<Option<Document>, EngineError> {
            self.fail()
        }
    }

    #[tokio::test]
    async fn test_insert_stamps_and_strips() {
        let adapter = StorageAdapter::in_memory();
        let bogus_id = ObjectId::new();
        let outcome = adapter
            .insert_one(
                "users",
                doc! { "_id": bogus_id, "email": "a@b.com", "createdAt": "yesterday" },
            )
            .await;

        let doc = outcome.document().unwrap();
        assert_ne!(object_id(doc), Some(bogus_id));
        assert!(object_id(doc).is_some());
        assert_eq!(doc.get_str("email").unwrap(), "a@b.com");
        let created = doc.get_datetime(CREATED_AT).unwrap();
        assert_eq!(created, doc.get_datetime(UPDATED_AT).unwrap());
    }

    #[tokio::test]
    async fn test_insert_then_find_by_id() {
        let adapter = StorageAdapter::in_memory();
        let inserted = adapter.insert_one("users", doc! { "email": "a@b.com" }).await;
        let id = object_id(inserted.document().unwrap()).unwrap();

        let fetched = adapter.find_one_with_id("users", id).await;
        assert_eq!(fetched.document(), inserted.document());
    }

    #[tokio::test]
    async fn test_find_returns_sequence_or_not_found() {
        let adapter = StorageAdapter::in_memory();
        let empty = adapter.find("users", None, None).await;
        assert_eq!(empty.status(), Some(ErrorStatus::NotFound));

        adapter.insert_one("users", doc! { "n": 1 }).await;
        adapter.insert_one("users", doc! { "n": 2 }).await;
        let all = adapter.find("users", None, None).await;
        assert_eq!(all.documents().unwrap().len(), 2);

        let limited = adapter.find("users", Some(doc! {}), Some(doc! { "limit": 1 })).await;
        assert_eq!(limited.documents().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_find_one_not_found() {
        let adapter = StorageAdapter::in_memory();
        let outcome = adapter.find_one("users", doc! { "email": "nobody" }, None).await;
        assert!(outcome.data.is_none());
        let error = outcome.error.unwrap();
        assert_eq!(error.status, ErrorStatus::NotFound);
        assert_eq!(error.message, NOT_FOUND_MESSAGE);
    }

    #[tokio::test]
    async fn test_update_advances_updated_at_only() {
        let adapter = StorageAdapter::in_memory();
        let inserted = adapter.insert_one("users", doc! { "email": "a@b.com" }).await;
        let original = inserted.document().unwrap().clone();
        let id = object_id(&original).unwrap();

        let updated = adapter
            .update_one_with_id(
                "users",
                id,
                doc! { "email": "c@d.com", "createdAt": DateTime::from_millis(0) },
            )
            .await;
        let doc = updated.document().unwrap();
        assert_eq!(doc.get_str("email").unwrap(), "c@d.com");
        assert_eq!(
            doc.get_datetime(CREATED_AT).unwrap(),
            original.get_datetime(CREATED_AT).unwrap()
        );
        assert!(doc.get_datetime(UPDATED_AT).unwrap() > original.get_datetime(UPDATED_AT).unwrap());
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let adapter = StorageAdapter::in_memory();
        let outcome = adapter.update_one_with_id("users", ObjectId::new(), doc! { "x": 1 }).await;
        assert_eq!(outcome.status(), Some(ErrorStatus::NotFound));
    }

    #[tokio::test]
    async fn test_replace_resets_body_and_timestamps() {
        let adapter = StorageAdapter::in_memory();
        let inserted = adapter.insert_one("users", doc! { "email": "a@b.com", "age": 3 }).await;
        let original = inserted.document().unwrap().clone();
        let id = object_id(&original).unwrap();

        let replaced = adapter.replace_one_with_id("users", id, doc! { "email": "z@z.com" }).await;
        let doc = replaced.document().unwrap();
        assert_eq!(object_id(doc), Some(id));
        assert!(doc.get("age").is_none());
        assert!(doc.get_datetime(CREATED_AT).unwrap() > original.get_datetime(CREATED_AT).unwrap());
        assert_eq!(
            doc.get_datetime(CREATED_AT).unwrap(),
            doc.get_datetime(UPDATED_AT).unwrap()
        );
    }

    #[tokio::test]
    async fn test_delete_returns_removed_document() {
        let adapter = StorageAdapter::in_memory();
        let inserted = adapter.insert_one("users", doc! { "email": "a@b.com" }).await;
        let id = object_id(inserted.document().unwrap()).unwrap();

        let deleted = adapter.delete_one_with_id("users", id).await;
        assert_eq!(deleted.document(), inserted.document());

        let again = adapter.delete_one_with_id("users", id).await;
        assert_eq!(again.status(), Some(ErrorStatus::NotFound));
        let gone = adapter.find_one_with_id("users", id).await;
        assert_eq!(gone.status(), Some(ErrorStatus::NotFound));
    }

    #[tokio::test]
    async fn test_engine_fault_becomes_storage_error() {
        let adapter = StorageAdapter::in_memory();
        adapter.insert_one("users", doc! { "n": 1 }).await;
        let outcome = adapter.find_one("users", doc! { "n": { "$foo": 1 } }, None).await;
        let error = outcome.error.unwrap();
        assert_eq!(error.status, ErrorStatus::StorageError);
        assert_eq!(error.message, "Unknown operator: $foo");
    }

    #[tokio::test]
    async fn test_immutable_id_update_is_storage_error() {
        let adapter = StorageAdapter::in_memory();
        let inserted = adapter.insert_one("users", doc! { "n": 1 }).await;
        let id = object_id(inserted.document().unwrap()).unwrap();
        let outcome = adapter
            .update_one_with_id("users", id, doc! { "_id": ObjectId::new() })
            .await;
        assert_eq!(outcome.status(), Some(ErrorStatus::StorageError));
        assert!(outcome.error.unwrap().message.contains("immutable field '_id'"));
    }

    #[tokio::test]
    async fn test_engine_errors_never_escape() {
        let adapter = StorageAdapter::new(Arc::new(BrokenEngine { panics: false }));
        let outcome = adapter.insert_one("users", doc! {}).await;
        assert_eq!(outcome.status(), Some(ErrorStatus::StorageError));
        assert_eq!(outcome.error.unwrap().message, "Storage failure: connection reset");
    }

    #[tokio::test]
    async fn test_engine_panics_never_escape() {
        let adapter = StorageAdapter::new(Arc::new(BrokenEngine { panics: true }));
        let outcome = adapter.delete_one("users", doc! {}).await;
        assert_eq!(outcome.status(), Some(ErrorStatus::StorageError));
        assert_eq!(outcome.error.unwrap().message, "Engine exploded");
    }

    #[tokio::test]
    async fn test_invalid_collection_name_is_storage_error() {
        let adapter = StorageAdapter::in_memory();
        let outcome = adapter.insert_one("", doc! { "n": 1 }).await;
        assert_eq!(outcome.status(), Some(ErrorStatus::StorageError));
    }

    #[tokio::test]
    async fn test_handles_cached_per_name() {
        let adapter = StorageAdapter::in_memory();
        adapter.find("a", None, None).await;
        adapter.find("a", None, None).await;
        adapter.insert_one("b", doc! {}).await;
        assert_eq!(adapter.cached_handles().await, 2);
    }

    #[test]
    fn test_clock_strictly_increases() {
        let clock = MonotonicClock::default();
        let mut prev = clock.now();
        for _ in 0..1000 {
            let next = clock.now();
            assert!(next > prev);
            prev = next;
        }
    }
}
