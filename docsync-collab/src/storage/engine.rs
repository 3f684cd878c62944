//! Engine-facing traits shared by the in-memory and RocksDB backends.
//!
//! The adapter never talks to a backend directly; it resolves an
//! [`Arc<dyn Collection>`] through [`StorageEngine::collection`] once per
//! collection name and issues every subsequent operation through it.

use std::sync::Arc;

use async_trait::async_trait;
use bson::{oid::ObjectId, Bson, Document};

use super::filter::FindOptions;

/// Faults raised by a storage engine.
///
/// These never reach callers as errors; the adapter folds them into a
/// `STORAGE_ERROR` outcome carrying the display text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("unknown operator: {0}")]
    UnknownOperator(String),
    #[error("{0}")]
    InvalidQuery(String),
    #[error("Invalid collection name: '{0}'")]
    InvalidCollectionName(String),
    #[error("Performing an update on the path '_id' would modify the immutable field '_id'")]
    ImmutableId,
    #[error("E11000 duplicate key error collection: {collection} dup key: {{ _id: {id} }}")]
    DuplicateKey { collection: String, id: String },
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("serialization failure: {0}")]
    Serialization(String),
}

/// A backend that hands out collection handles by name.
pub trait StorageEngine: Send + Sync {
    /// Resolve a collection handle. Never fails; invalid names fault on
    /// first use instead.
    fn collection(&self, name: &str) -> Arc<dyn Collection>;

    /// Short backend label for logging.
    fn kind(&self) -> &'static str;
}

/// Document operations on a single named collection.
///
/// The `find_one_and_*` family locates the first document in natural
/// order that matches `filter`.
#[async_trait]
pub trait Collection: Send + Sync {
    fn name(&self) -> &str;

    /// Store `doc`, assigning a fresh `ObjectId` when `_id` is absent.
    async fn insert_one(&self, doc: Document) -> Result<Bson, EngineError>;

    async fn find(
        &self,
        filter: &Document,
        options: &FindOptions,
    ) -> Result<Vec<Document>, EngineError>;

    async fn find_one(
        &self,
        filter: &Document,
        options: &FindOptions,
    ) -> Result<Option<Document>, EngineError> {
        let mut options = options.clone();
        options.limit = Some(1);
        Ok(self.find(filter, &options).await?.into_iter().next())
    }

    /// Apply `set` as a field-level `$set` and return the post-update document.
    async fn find_one_and_update(
        &self,
        filter: &Document,
        set: &Document,
    ) -> Result<Option<Document>, EngineError>;

    /// Swap the whole body while preserving `_id`; returns the new document.
    async fn find_one_and_replace(
        &self,
        filter: &Document,
        replacement: Document,
    ) -> Result<Option<Document>, EngineError>;

    /// Remove the first match and return it as it was before deletion.
    async fn find_one_and_delete(&self, filter: &Document) -> Result<Option<Document>, EngineError>;
}

/// Reject names the backends cannot key on.
pub fn validate_collection_name(name: &str) -> Result<(), EngineError> {
    if name.is_empty() || name.contains('\0') || name.starts_with('$') {
        return Err(EngineError::InvalidCollectionName(name.to_string()));
    }
    Ok(())
}

/// Put `_id` first, generating an `ObjectId` when missing.
pub fn with_identity(mut doc: Document) -> (Bson, Document) {
    let id = doc
        .remove("_id")
        .unwrap_or_else(|| Bson::ObjectId(ObjectId::new()));
    let mut stored = Document::new();
    stored.insert("_id", id.clone());
    for (key, value) in doc {
        stored.insert(key, value);
    }
    (id, stored)
}

/// Apply a `$set` to `target`. Dotted keys create intermediate documents.
pub fn apply_set(target: &mut Document, set: &Document) -> Result<(), EngineError> {
    for (path, value) in set {
        if path == "_id" || path.starts_with("_id.") {
            if target.get("_id") != Some(value) {
                return Err(EngineError::ImmutableId);
            }
            continue;
        }
        if path.is_empty() || path.starts_with('$') {
            return Err(EngineError::InvalidQuery(format!(
                "the update path '{path}' is not valid for a field"
            )));
        }
        set_path(target, path, value.clone())?;
    }
    Ok(())
}

fn set_path(target: &mut Document, path: &str, value: Bson) -> Result<(), EngineError> {
    match path.split_once('.') {
        None => {
            target.insert(path, value);
            Ok(())
        }
        Some((head, rest)) => {
            if !target.contains_key(head) {
                target.insert(head, Document::new());
            }
            match target.get_mut(head) {
                Some(Bson::Document(child)) => set_path(child, rest, value),
                _ => Err(EngineError::InvalidQuery(format!(
                    "Cannot create field '{rest}' in element {{{head}: non-document}}"
                ))),
            }
        }
    }
}

/// Build the stored form of a replacement: existing `_id`, then the new body.
pub fn replacement_for(existing: &Document, mut replacement: Document) -> Result<Document, EngineError> {
    let id = existing.get("_id").cloned().unwrap_or(Bson::Null);
    if let Some(requested) = replacement.remove("_id") {
        if requested != id {
            return Err(EngineError::ImmutableId);
        }
    }
    let mut stored = Document::new();
    stored.insert("_id", id);
    for (key, value) in replacement {
        stored.insert(key, value);
    }
    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_with_identity_generates_and_orders() {
        let (id, stored) = with_identity(doc! { "a": 1 });
        assert!(matches!(id, Bson::ObjectId(_)));
        assert_eq!(stored.keys().next().map(String::as_str), Some("_id"));
        assert_eq!(stored.get_i32("a").unwrap(), 1);
    }

    #[test]
    fn test_apply_set_dotted() {
        let mut target = doc! { "_id": 1, "profile": { "name": "a" } };
        apply_set(&mut target, &doc! { "profile.age": 3, "flag": true }).unwrap();
        assert_eq!(target, doc! { "_id": 1, "profile": { "name": "a", "age": 3 }, "flag": true });
    }

    #[test]
    fn test_apply_set_rejects_id_change() {
        let mut target = doc! { "_id": 1 };
        assert_eq!(apply_set(&mut target, &doc! { "_id": 2 }), Err(EngineError::ImmutableId));
        // Same value is a no-op.
        apply_set(&mut target, &doc! { "_id": 1 }).unwrap();
    }

    #[test]
    fn test_apply_set_through_scalar_fails() {
        let mut target = doc! { "_id": 1, "name": "x" };
        assert!(apply_set(&mut target, &doc! { "name.first": "y" }).is_err());
    }

    #[test]
    fn test_replacement_keeps_id() {
        let existing = doc! { "_id": 7, "old": true };
        let stored = replacement_for(&existing, doc! { "new": true }).unwrap();
        assert_eq!(stored, doc! { "_id": 7, "new": true });
        assert!(replacement_for(&existing, doc! { "_id": 8 }).is_err());
    }

    #[test]
    fn test_collection_name_validation() {
        assert!(validate_collection_name("users").is_ok());
        assert!(validate_collection_name("").is_err());
        assert!(validate_collection_name("a\0b").is_err());
        assert_eq!(
            validate_collection_name("").unwrap_err().to_string(),
            "Invalid collection name: ''"
        );
    }
}
