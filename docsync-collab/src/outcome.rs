//! Uniform success/error envelope returned by every storage operation.
//!
//! Serialized shape (relaxed Extended JSON for document payloads):
//! ```text
//! success: { "data": { ... } }            or { "data": [ { ... }, ... ] }
//! failure: { "data": null, "error": { "status": "NOT_FOUND", "message": "Document not found!" } }
//! ```

use bson::Document;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::protocol::{document_from_json, document_to_json, ProtocolError};

/// Message carried by every `NOT_FOUND` error.
pub const NOT_FOUND_MESSAGE: &str = "Document not found!";

/// Error category reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorStatus {
    /// The predicate matched nothing (or a multi-document find came back empty).
    NotFound,
    /// The storage engine raised a fault.
    StorageError,
}

/// Error half of an [`Outcome`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeError {
    pub status: ErrorStatus,
    pub message: String,
}

impl OutcomeError {
    pub fn not_found() -> Self {
        Self {
            status: ErrorStatus::NotFound,
            message: NOT_FOUND_MESSAGE.to_string(),
        }
    }

    /// Wrap an engine fault message, upper-casing its first letter.
    pub fn storage(message: impl AsRef<str>) -> Self {
        Self {
            status: ErrorStatus::StorageError,
            message: capitalize(message.as_ref()),
        }
    }
}

fn capitalize(message: &str) -> String {
    let mut chars = message.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Payload half of an [`Outcome`].
#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeData {
    One(Document),
    Many(Vec<Document>),
}

impl OutcomeData {
    pub fn to_json(&self) -> Value {
        match self {
            OutcomeData::One(doc) => document_to_json(doc),
            OutcomeData::Many(docs) => Value::Array(docs.iter().map(document_to_json).collect()),
        }
    }

    fn from_json(value: Value) -> Result<Self, ProtocolError> {
        match value {
            Value::Array(items) => items
                .into_iter()
                .map(document_from_json)
                .collect::<Result<Vec<_>, _>>()
                .map(OutcomeData::Many),
            other => document_from_json(other).map(OutcomeData::One),
        }
    }
}

/// The `{ data, error }` envelope.
///
/// Exactly one half is meaningful: on failure `data` is `None` and `error`
/// is set; on success `error` is `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub data: Option<OutcomeData>,
    pub error: Option<OutcomeError>,
}

impl Outcome {
    pub fn one(doc: Document) -> Self {
        Self {
            data: Some(OutcomeData::One(doc)),
            error: None,
        }
    }

    pub fn many(docs: Vec<Document>) -> Self {
        Self {
            data: Some(OutcomeData::Many(docs)),
            error: None,
        }
    }

    pub fn failure(error: OutcomeError) -> Self {
        Self {
            data: None,
            error: Some(error),
        }
    }

    pub fn not_found() -> Self {
        Self::failure(OutcomeError::not_found())
    }

    pub fn storage_error(message: impl AsRef<str>) -> Self {
        Self::failure(OutcomeError::storage(message))
    }

    /// True when the error is absent and data is present. This is the
    /// broadcast-eligibility rule for mutating operations.
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.data.is_some()
    }

    pub fn status(&self) -> Option<ErrorStatus> {
        self.error.as_ref().map(|e| e.status)
    }

    /// The single document payload, if any.
    pub fn document(&self) -> Option<&Document> {
        match &self.data {
            Some(OutcomeData::One(doc)) => Some(doc),
            _ => None,
        }
    }

    /// The multi-document payload, if any.
    pub fn documents(&self) -> Option<&[Document]> {
        match &self.data {
            Some(OutcomeData::Many(docs)) => Some(docs),
            _ => None,
        }
    }

    /// Encode for the wire. `error` is omitted entirely on success.
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert(
            "data".to_string(),
            self.data.as_ref().map_or(Value::Null, OutcomeData::to_json),
        );
        if let Some(error) = &self.error {
            map.insert(
                "error".to_string(),
                serde_json::json!({ "status": error.status, "message": error.message }),
            );
        }
        Value::Object(map)
    }

    /// Decode an envelope previously produced by [`Outcome::to_json`].
    pub fn from_json(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(mut map) = value else {
            return Err(ProtocolError::Decode("outcome must be an object".into()));
        };
        let data = match map.remove("data") {
            None | Some(Value::Null) => None,
            Some(value) => Some(OutcomeData::from_json(value)?),
        };
        let error = match map.remove("error") {
            None | Some(Value::Null) => None,
            Some(value) => Some(
                serde_json::from_value(value).map_err(|e| ProtocolError::Decode(e.to_string()))?,
            ),
        };
        Ok(Self { data, error })
    }
}
