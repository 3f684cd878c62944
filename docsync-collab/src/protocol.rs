//! JSON text-frame protocol for the persistent-connection binding.
//!
//! Wire format (one JSON object per WebSocket text frame):
//! ```text
//! server → client  {"type":"welcome","peerId":"<uuid>"}
//! client → server  {"type":"call","id":7,"event":"collection:insertOne","args":["users",{...}]}
//! server → client  {"type":"ack","id":7,"outcome":{"data":{...}}}
//! server → client  {"type":"failure","id":7,"message":"..."}
//! server → client  {"type":"event","channel":"users:newChange","payload":{"method":"insertOne","data":{...}}}
//! ```
//!
//! Documents travel as relaxed Extended JSON, so `ObjectId` and `DateTime`
//! values survive the trip as `{"$oid":..}` / `{"$date":..}`.

use bson::{oid::ObjectId, Bson, Document};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::mediator::Operation;

/// Prefix of every call event name.
pub const CALL_PREFIX: &str = "collection:";

/// Messages sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    Call {
        id: u64,
        event: String,
        #[serde(default)]
        args: Vec<Value>,
    },
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// First frame on every connection.
    Welcome {
        #[serde(rename = "peerId")]
        peer_id: Uuid,
    },
    /// Exactly one per decoded call.
    Ack { id: u64, outcome: Value },
    /// The call (or frame) could not be decoded.
    Failure { id: Option<u64>, message: String },
    /// Change event fan-out.
    Event { channel: String, payload: Value },
}

impl ClientMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// Encode a document as relaxed Extended JSON.
pub fn document_to_json(doc: &Document) -> Value {
    Bson::Document(doc.clone()).into_relaxed_extjson()
}

/// Decode a JSON object (Extended JSON aware) into a document.
pub fn document_from_json(value: Value) -> Result<Document, ProtocolError> {
    match Bson::try_from(value).map_err(|e| ProtocolError::Decode(e.to_string()))? {
        Bson::Document(doc) => Ok(doc),
        other => Err(ProtocolError::Decode(format!(
            "expected a document, got {other}"
        ))),
    }
}

/// Wire-level and connection errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Encode(String),
    #[error("Deserialization error: {0}")]
    Decode(String),
    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),
    #[error("Call rejected: {0}")]
    Rejected(String),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Connection closed")]
    ConnectionClosed,
}

impl From<tokio_tungstenite::tungstenite::Error> for ProtocolError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ProtocolError::Connection(e.to_string())
    }
}

/// Reasons a call cannot be turned into an [`Operation`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("unknown event '{0}'")]
    UnknownEvent(String),
    #[error("{method}: missing argument '{name}'")]
    MissingArgument { method: String, name: &'static str },
    #[error("{method}: argument '{name}' {reason}")]
    InvalidArgument {
        method: String,
        name: &'static str,
        reason: String,
    },
    #[error("{method}: invalid document id {value}")]
    InvalidId { method: String, value: String },
}

/// Positional argument reader for one call.
struct CallArgs<'a> {
    method: &'a str,
    values: std::vec::IntoIter<Value>,
}

impl<'a> CallArgs<'a> {
    fn new(method: &'a str, values: Vec<Value>) -> Self {
        Self {
            method,
            values: values.into_iter(),
        }
    }

    fn missing(&self, name: &'static str) -> CallError {
        CallError::MissingArgument {
            method: self.method.to_string(),
            name,
        }
    }

    fn invalid(&self, name: &'static str, reason: impl Into<String>) -> CallError {
        CallError::InvalidArgument {
            method: self.method.to_string(),
            name,
            reason: reason.into(),
        }
    }

    /// Next argument, with JSON `null` treated as absent.
    fn next(&mut self) -> Option<Value> {
        self.values.next().filter(|v| !v.is_null())
    }

    fn collection(&mut self) -> Result<String, CallError> {
        match self.next() {
            Some(Value::String(name)) => Ok(name),
            Some(_) => Err(self.invalid("collectionName", "must be a string")),
            None => Err(self.missing("collectionName")),
        }
    }

    fn document(&mut self, name: &'static str) -> Result<Document, CallError> {
        match self.optional_document(name)? {
            Some(doc) => Ok(doc),
            None => Err(self.missing(name)),
        }
    }

    fn optional_document(&mut self, name: &'static str) -> Result<Option<Document>, CallError> {
        match self.next() {
            Some(value @ Value::Object(_)) => document_from_json(value)
                .map(Some)
                .map_err(|e| self.invalid(name, e.to_string())),
            Some(_) => Err(self.invalid(name, "must be an object")),
            None => Ok(None),
        }
    }

    fn object_id(&mut self) -> Result<ObjectId, CallError> {
        let value = self.next().ok_or_else(|| self.missing("id"))?;
        let parsed = match &value {
            Value::String(hex) => ObjectId::parse_str(hex).ok(),
            Value::Object(_) => match Bson::try_from(value.clone()) {
                Ok(Bson::ObjectId(id)) => Some(id),
                _ => None,
            },
            _ => None,
        };
        parsed.ok_or_else(|| CallError::InvalidId {
            method: self.method.to_string(),
            value: value.to_string(),
        })
    }
}

/// Decode `event` + positional `args` into a typed operation.
///
/// Argument shapes:
/// `insertOne(c, doc)`, `find(c, filter?, options?)`, `findOne(c, filter, options?)`,
/// `findOneWithId(c, id)`, `updateOne(c, filter, doc)`, `updateOneWithId(c, id, doc)`,
/// `replaceOne(c, filter, doc)`, `replaceOneWithId(c, id, doc)`,
/// `deleteOne(c, filter)`, `deleteOneWithId(c, id)`.
pub fn decode_call(event: &str, args: Vec<Value>) -> Result<Operation, CallError> {
    let method = event
        .strip_prefix(CALL_PREFIX)
        .filter(|m| Operation::METHODS.contains(m))
        .ok_or_else(|| CallError::UnknownEvent(event.to_string()))?;
    let mut args = CallArgs::new(method, args);
    let collection = args.collection()?;

    let operation = match method {
        "insertOne" => Operation::InsertOne {
            collection,
            document: args.document("document")?,
        },
        "find" => Operation::Find {
            collection,
            filter: args.optional_document("filter")?,
            options: args.optional_document("options")?,
        },
        "findOne" => Operation::FindOne {
            collection,
            filter: args.document("filter")?,
            options: args.optional_document("options")?,
        },
        "findOneWithId" => Operation::FindOneWithId {
            collection,
            id: args.object_id()?,
        },
        "updateOne" => Operation::UpdateOne {
            collection,
            filter: args.document("filter")?,
            update: args.document("document")?,
        },
        "updateOneWithId" => Operation::UpdateOneWithId {
            collection,
            id: args.object_id()?,
            update: args.document("document")?,
        },
        "replaceOne" => Operation::ReplaceOne {
            collection,
            filter: args.document("filter")?,
            replacement: args.document("document")?,
        },
        "replaceOneWithId" => Operation::ReplaceOneWithId {
            collection,
            id: args.object_id()?,
            replacement: args.document("document")?,
        },
        "deleteOne" => Operation::DeleteOne {
            collection,
            filter: args.document("filter")?,
        },
        "deleteOneWithId" => Operation::DeleteOneWithId {
            collection,
            id: args.object_id()?,
        },
        _ => return Err(CallError::UnknownEvent(event.to_string())),
    };
    Ok(operation)
}

/// Inverse of [`decode_call`]: the event name and positional arguments for
/// an operation.
pub fn encode_call(operation: &Operation) -> (String, Vec<Value>) {
    let event = format!("{CALL_PREFIX}{}", operation.method());
    let optional = |doc: &Option<Document>| doc.as_ref().map_or(Value::Null, document_to_json);
    let hex = |id: &ObjectId| Value::String(id.to_hex());

    let mut args = vec![Value::String(operation.collection().to_string())];
    match operation {
        Operation::InsertOne { document, .. } => args.push(document_to_json(document)),
        Operation::Find { filter, options, .. } => {
            args.push(optional(filter));
            args.push(optional(options));
        }
        Operation::FindOne { filter, options, .. } => {
            args.push(document_to_json(filter));
            args.push(optional(options));
        }
        Operation::FindOneWithId { id, .. } | Operation::DeleteOneWithId { id, .. } => args.push(hex(id)),
        Operation::UpdateOne { filter, update: doc, .. }
        | Operation::ReplaceOne { filter, replacement: doc, .. } => {
            args.push(document_to_json(filter));
            args.push(document_to_json(doc));
        }
        Operation::UpdateOneWithId { id, update: doc, .. }
        | Operation::ReplaceOneWithId { id, replacement: doc, .. } => {
            args.push(hex(id));
            args.push(document_to_json(doc));
        }
        Operation::DeleteOne { filter, .. } => args.push(document_to_json(filter)),
    }
    (event, args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use serde_json::json;

    #[test]
    fn test_welcome_wire_shape() {
        let peer_id = Uuid::new_v4();
        let encoded = ServerMessage::Welcome { peer_id }.encode().unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value, json!({ "type": "welcome", "peerId": peer_id.to_string() }));
    }

    #[test]
    fn test_ack_and_event_decode() {
        let ack = ServerMessage::decode(r#"{"type":"ack","id":3,"outcome":{"data":null}}"#).unwrap();
        assert_eq!(ack, ServerMessage::Ack { id: 3, outcome: json!({ "data": null }) });

        let event = ServerMessage::decode(
            r#"{"type":"event","channel":"users:newChange","payload":{"method":"insertOne","data":{}}}"#,
        )
        .unwrap();
        assert!(matches!(event, ServerMessage::Event { ref channel, .. } if channel == "users:newChange"));
    }

    #[test]
    fn test_call_args_default_to_empty() {
        let msg = ClientMessage::decode(r#"{"type":"call","id":1,"event":"collection:find"}"#).unwrap();
        let ClientMessage::Call { id, event, args } = msg;
        assert_eq!(id, 1);
        assert_eq!(event, "collection:find");
        assert!(args.is_empty());
    }

    #[test]
    fn test_unknown_frame_type_rejected() {
        assert!(ClientMessage::decode(r#"{"type":"subscribe"}"#).is_err());
        assert!(ClientMessage::decode("not json").is_err());
    }

    #[test]
    fn test_decode_insert_one() {
        let op = decode_call("collection:insertOne", vec![json!("users"), json!({ "email": "a@b.com" })]).unwrap();
        assert_eq!(
            op,
            Operation::InsertOne {
                collection: "users".into(),
                document: doc! { "email": "a@b.com" },
            }
        );
    }

    #[test]
    fn test_decode_find_optional_args() {
        let op = decode_call("collection:find", vec![json!("users")]).unwrap();
        assert_eq!(
            op,
            Operation::Find {
                collection: "users".into(),
                filter: None,
                options: None,
            }
        );

        let op = decode_call("collection:find", vec![json!("users"), json!(null), json!({ "limit": 2 })]).unwrap();
        let Operation::Find { filter, options, .. } = op else {
            panic!("expected find");
        };
        assert!(filter.is_none());
        assert_eq!(options, Some(doc! { "limit": 2 }));
    }

    #[test]
    fn test_decode_with_id_variants() {
        let id = ObjectId::new();
        let op = decode_call("collection:findOneWithId", vec![json!("users"), json!(id.to_hex())]).unwrap();
        assert_eq!(op, Operation::FindOneWithId { collection: "users".into(), id });

        let op = decode_call(
            "collection:updateOneWithId",
            vec![json!("users"), json!({ "$oid": id.to_hex() }), json!({ "x": 1 })],
        )
        .unwrap();
        assert_eq!(op.method(), "updateOneWithId");
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(
            decode_call("collection:dropDatabase", vec![json!("users")]),
            Err(CallError::UnknownEvent("collection:dropDatabase".into()))
        );
        assert!(matches!(
            decode_call("insertOne", vec![json!("users"), json!({})]),
            Err(CallError::UnknownEvent(_))
        ));
        assert!(matches!(
            decode_call("collection:insertOne", vec![json!("users")]),
            Err(CallError::MissingArgument { name: "document", .. })
        ));
        assert!(matches!(
            decode_call("collection:findOne", vec![json!(42), json!({})]),
            Err(CallError::InvalidArgument { name: "collectionName", .. })
        ));
        assert!(matches!(
            decode_call("collection:deleteOne", vec![json!("users"), json!([1])]),
            Err(CallError::InvalidArgument { name: "filter", .. })
        ));
        let err = decode_call("collection:deleteOneWithId", vec![json!("users"), json!("zzz")]).unwrap_err();
        assert!(matches!(err, CallError::InvalidId { .. }));
        assert!(err.to_string().contains("zzz"));
    }

    #[test]
    fn test_encode_call_decodes_back() {
        let id = ObjectId::new();
        let ops = vec![
            Operation::Find { collection: "c".into(), filter: Some(doc! { "a": 1 }), options: None },
            Operation::ReplaceOneWithId { collection: "c".into(), id, replacement: doc! { "b": "x" } },
            Operation::DeleteOne { collection: "c".into(), filter: doc! { "n": { "$gt": 1 } } },
        ];
        for op in ops {
            let (event, args) = encode_call(&op);
            assert_eq!(decode_call(&event, args).unwrap(), op);
        }
    }

    #[test]
    fn test_documents_as_extended_json() {
        let id = ObjectId::new();
        let value = document_to_json(&doc! { "_id": id, "n": 1 });
        assert_eq!(value, json!({ "_id": { "$oid": id.to_hex() }, "n": 1 }));
        assert_eq!(document_from_json(value).unwrap(), doc! { "_id": id, "n": 1 });
        assert!(document_from_json(json!("scalar")).is_err());
    }
}
