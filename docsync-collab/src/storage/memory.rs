//! HashMap-backed engine for development, tests and ephemeral deployments.
//!
//! Each collection is a `Vec<Document>` in insertion order, which is the
//! natural order the `find_one_and_*` operations scan.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bson::{Bson, Document};
use tokio::sync::RwLock;

use super::engine::{
    apply_set, replacement_for, validate_collection_name, with_identity, Collection, EngineError,
    StorageEngine,
};
use super::filter::{apply_options, matches, FindOptions};

type Collections = Arc<RwLock<HashMap<String, Vec<Document>>>>;

/// In-memory storage engine. Clone-friendly via Arc.
#[derive(Clone, Default)]
pub struct MemoryEngine {
    collections: Collections,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents currently held in `collection`.
    pub async fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map_or(0, Vec::len)
    }
}

impl StorageEngine for MemoryEngine {
    fn collection(&self, name: &str) -> Arc<dyn Collection> {
        Arc::new(MemoryCollection {
            name: name.to_string(),
            collections: Arc::clone(&self.collections),
        })
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}

struct MemoryCollection {
    name: String,
    collections: Collections,
}

impl MemoryCollection {
    fn position(docs: &[Document], filter: &Document) -> Result<Option<usize>, EngineError> {
        for (index, doc) in docs.iter().enumerate() {
            if matches(doc, filter)? {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Collection for MemoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn insert_one(&self, doc: Document) -> Result<Bson, EngineError> {
        validate_collection_name(&self.name)?;
        let (id, stored) = with_identity(doc);
        let mut collections = self.collections.write().await;
        let docs = collections.entry(self.name.clone()).or_default();
        if docs.iter().any(|d| d.get("_id") == Some(&id)) {
            return Err(EngineError::DuplicateKey {
                collection: self.name.clone(),
                id: id.to_string(),
            });
        }
        docs.push(stored);
        Ok(id)
    }

    async fn find(
        &self,
        filter: &Document,
        options: &FindOptions,
    ) -> Result<Vec<Document>, EngineError> {
        validate_collection_name(&self.name)?;
        let collections = self.collections.read().await;
        let Some(docs) = collections.get(&self.name) else {
            return Ok(Vec::new());
        };
        let mut found = Vec::new();
        for doc in docs {
            if matches(doc, filter)? {
                found.push(doc.clone());
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
        let mut collections = self.collections.write().await;
        let Some(docs) = collections.get_mut(&self.name) else {
            return Ok(None);
        };
        let Some(index) = Self::position(docs, filter)? else {
            return Ok(None);
        };
        let mut updated = docs[index].clone();
        apply_set(&mut updated, set)?;
        docs[index] = updated.clone();
        Ok(Some(updated))
    }

    async fn find_one_and_replace(
        &self,
        filter: &Document,
        replacement: Document,
    ) -> Result<Option<Document>, EngineError> {
        validate_collection_name(&self.name)?;
        let mut collections = self.collections.write().await;
        let Some(docs) = collections.get_mut(&self.name) else {
            return Ok(None);
        };
        let Some(index) = Self::position(docs, filter)? else {
            return Ok(None);
        };
        let stored = replacement_for(&docs[index], replacement)?;
        docs[index] = stored.clone();
        Ok(Some(stored))
    }

    async fn find_one_and_delete(&self, filter: &Document) -> Result<Option<Document>, EngineError> {
        validate_collection_name(&self.name)?;
        let mut collections = self.collections.write().await;
        let Some(docs) = collections.get_mut(&self.name) else {
            return Ok(None);
        };
        match Self::position(docs, filter)? {
            Some(index) => Ok(Some(docs.remove(index))),
            None => Ok(None),
        }
    }
}
