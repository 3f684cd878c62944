//! Operation mediator: dispatches typed operations to the storage adapter
//! and decides which outcomes produce a change event.

use std::sync::Arc;

use bson::{oid::ObjectId, Document};
use serde_json::{json, Value};

use crate::outcome::Outcome;
use crate::protocol::{document_from_json, document_to_json, ProtocolError};
use crate::storage::StorageAdapter;

/// Suffix of every change channel: `<collection>:newChange`.
pub const CHANGE_SUFFIX: &str = "newChange";

/// One of the ten storage operations, with its arguments already typed.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    InsertOne {
        collection: String,
        document: Document,
    },
    Find {
        collection: String,
        filter: Option<Document>,
        options: Option<Document>,
    },
    FindOne {
        collection: String,
        filter: Document,
        options: Option<Document>,
    },
    FindOneWithId {
        collection: String,
        id: ObjectId,
    },
    UpdateOne {
        collection: String,
        filter: Document,
        update: Document,
    },
    UpdateOneWithId {
        collection: String,
        id: ObjectId,
        update: Document,
    },
    ReplaceOne {
        collection: String,
        filter: Document,
        replacement: Document,
    },
    ReplaceOneWithId {
        collection: String,
        id: ObjectId,
        replacement: Document,
    },
    DeleteOne {
        collection: String,
        filter: Document,
    },
    DeleteOneWithId {
        collection: String,
        id: ObjectId,
    },
}

impl Operation {
    /// Every call name, in declaration order.
    pub const METHODS: [&'static str; 10] = [
        "insertOne",
        "find",
        "findOne",
        "findOneWithId",
        "updateOne",
        "updateOneWithId",
        "replaceOne",
        "replaceOneWithId",
        "deleteOne",
        "deleteOneWithId",
    ];

    /// The call name this operation was invoked as.
    pub fn method(&self) -> &'static str {
        match self {
            Operation::InsertOne { .. } => "insertOne",
            Operation::Find { .. } => "find",
            Operation::FindOne { .. } => "findOne",
            Operation::FindOneWithId { .. } => "findOneWithId",
            Operation::UpdateOne { .. } => "updateOne",
            Operation::UpdateOneWithId { .. } => "updateOneWithId",
            Operation::ReplaceOne { .. } => "replaceOne",
            Operation::ReplaceOneWithId { .. } => "replaceOneWithId",
            Operation::DeleteOne { .. } => "deleteOne",
            Operation::DeleteOneWithId { .. } => "deleteOneWithId",
        }
    }

    /// Base mutating method reported in change events. Id-addressed
    /// variants report their base name; reads report `None`.
    pub fn change_method(&self) -> Option<&'static str> {
        match self {
            Operation::InsertOne { .. } => Some("insertOne"),
            Operation::UpdateOne { .. } | Operation::UpdateOneWithId { .. } => Some("updateOne"),
            Operation::ReplaceOne { .. } | Operation::ReplaceOneWithId { .. } => Some("replaceOne"),
            Operation::DeleteOne { .. } | Operation::DeleteOneWithId { .. } => Some("deleteOne"),
            Operation::Find { .. } | Operation::FindOne { .. } | Operation::FindOneWithId { .. } => None,
        }
    }

    pub fn is_mutation(&self) -> bool {
        self.change_method().is_some()
    }

    pub fn collection(&self) -> &str {
        match self {
            Operation::InsertOne { collection, .. }
            | Operation::Find { collection, .. }
            | Operation::FindOne { collection, .. }
            | Operation::FindOneWithId { collection, .. }
            | Operation::UpdateOne { collection, .. }
            | Operation::UpdateOneWithId { collection, .. }
            | Operation::ReplaceOne { collection, .. }
            | Operation::ReplaceOneWithId { collection, .. }
            | Operation::DeleteOne { collection, .. }
            | Operation::DeleteOneWithId { collection, .. } => collection,
        }
    }
}

/// Change channel for a collection.
pub fn change_channel(collection: &str) -> String {
    format!("{collection}:{CHANGE_SUFFIX}")
}

/// Payload pushed to peers after a successful mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub method: String,
    pub data: Document,
}

impl ChangeEvent {
    pub fn to_json(&self) -> Value {
        json!({ "method": self.method, "data": document_to_json(&self.data) })
    }

    pub fn from_json(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(mut map) = value else {
            return Err(ProtocolError::Decode("change event must be an object".into()));
        };
        let method = match map.remove("method") {
            Some(Value::String(method)) => method,
            _ => return Err(ProtocolError::Decode("change event without method".into())),
        };
        let data = document_from_json(map.remove("data").unwrap_or(Value::Null))?;
        Ok(Self { method, data })
    }
}

/// A change event together with the channel it belongs on.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub channel: String,
    pub event: ChangeEvent,
}

/// Result of mediating one operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Mediated {
    /// Returned to the caller unchanged.
    pub outcome: Outcome,
    /// Present only for successful mutations.
    pub change: Option<Change>,
}

/// Stateless dispatcher over a shared [`StorageAdapter`].
#[derive(Clone)]
pub struct Mediator {
    adapter: Arc<StorageAdapter>,
}

impl Mediator {
    pub fn new(adapter: Arc<StorageAdapter>) -> Self {
        Self { adapter }
    }

    pub fn adapter(&self) -> &Arc<StorageAdapter> {
        &self.adapter
    }

    pub async fn execute(&self, operation: Operation) -> Mediated {
        let channel = change_channel(operation.collection());
        let change_method = operation.change_method();
        let adapter = &self.adapter;

        let outcome = match operation {
            Operation::InsertOne { collection, document } => {
                adapter.insert_one(&collection, document).await
            }
            Operation::Find { collection, filter, options } => {
                adapter.find(&collection, filter, options).await
            }
            Operation::FindOne { collection, filter, options } => {
                adapter.find_one(&collection, filter, options).await
            }
            Operation::FindOneWithId { collection, id } => {
                adapter.find_one_with_id(&collection, id).await
            }
            Operation::UpdateOne { collection, filter, update } => {
                adapter.update_one(&collection, filter, update).await
            }
            Operation::UpdateOneWithId { collection, id, update } => {
                adapter.update_one_with_id(&collection, id, update).await
            }
            Operation::ReplaceOne { collection, filter, replacement } => {
                adapter.replace_one(&collection, filter, replacement).await
            }
            Operation::ReplaceOneWithId { collection, id, replacement } => {
                adapter.replace_one_with_id(&collection, id, replacement).await
            }
            Operation::DeleteOne { collection, filter } => {
                adapter.delete_one(&collection, filter).await
            }
            Operation::DeleteOneWithId { collection, id } => {
                adapter.delete_one_with_id(&collection, id).await
            }
        };

        let change = match (change_method, outcome.is_success(), outcome.document()) {
            (Some(method), true, Some(data)) => Some(Change {
                channel,
                event: ChangeEvent {
                    method: method.to_string(),
                    data: data.clone(),
                },
            }),
            _ => None,
        };

        Mediated { outcome, change }
    }
}
