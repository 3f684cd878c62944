//! Query-string coercion for the request/response binding.
//!
//! Turns flat `key=value` pairs (bracket notation allowed) into a typed
//! [`Document`]:
//!
//! ```text
//! filter[email]=a@b.com&filter[age][$gt]=30&filter[tags][]=x&docId=65f0...
//!   → { filter: { email: "a@b.com", age: { $gt: 30 }, tags: ["x"] }, docId: ObjectId(..) }
//! ```

use bson::{oid::ObjectId, Bson, Document};
use serde_json::{Map, Value};

/// Keys whose string values are document ids.
pub const ID_KEYS: [&str; 3] = ["docId", "_id", "id"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error("malformed key '{0}'")]
    MalformedKey(String),
    #[error("key '{0}' is used both as a value and as an object")]
    Conflict(String),
    #[error("invalid document id for '{key}': {value}")]
    InvalidId { key: String, value: String },
    #[error("invalid JSON for '{key}': {reason}")]
    InvalidJson { key: String, reason: String },
}

/// One bracket segment of a key.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Push,
}

/// Uncoerced tree built from the raw pairs.
#[derive(Debug, Clone, PartialEq)]
enum RawValue {
    Leaf(String),
    List(Vec<RawValue>),
    Map(Vec<(String, RawValue)>),
}

impl RawValue {
    fn entry<'a>(map: &'a mut Vec<(String, RawValue)>, key: &str) -> Option<&'a mut RawValue> {
        map.iter_mut().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

/// Split `a[b][]` into `[Key(a), Key(b), Push]`.
fn parse_key(raw: &str) -> Result<Vec<Segment>, QueryError> {
    let malformed = || QueryError::MalformedKey(raw.to_string());
    let (head, mut rest) = match raw.find('[') {
        Some(pos) => raw.split_at(pos),
        None => (raw, ""),
    };
    if head.is_empty() {
        return Err(malformed());
    }

    let mut segments = vec![Segment::Key(head.to_string())];
    while !rest.is_empty() {
        let inner = rest.strip_prefix('[').ok_or_else(malformed)?;
        let close = inner.find(']').ok_or_else(malformed)?;
        let name = &inner[..close];
        segments.push(if name.is_empty() {
            Segment::Push
        } else {
            Segment::Key(name.to_string())
        });
        rest = &inner[close + 1..];
    }

    // `[]` may only close a key
    if segments[..segments.len() - 1].contains(&Segment::Push) {
        return Err(malformed());
    }
    Ok(segments)
}

fn insert(
    map: &mut Vec<(String, RawValue)>,
    raw_key: &str,
    segments: &[Segment],
    value: String,
) -> Result<(), QueryError> {
    let Some(Segment::Key(key)) = segments.first() else {
        return Err(QueryError::MalformedKey(raw_key.to_string()));
    };
    let rest = &segments[1..];

    match rest.first() {
        // `key=value`: repeated keys collect into an array
        None => match RawValue::entry(map, key) {
            None => map.push((key.clone(), RawValue::Leaf(value))),
            Some(RawValue::List(items)) => items.push(RawValue::Leaf(value)),
            Some(existing @ RawValue::Leaf(_)) => {
                let first = std::mem::replace(existing, RawValue::List(Vec::new()));
                *existing = RawValue::List(vec![first, RawValue::Leaf(value)]);
            }
            Some(RawValue::Map(_)) => return Err(QueryError::Conflict(key.clone())),
        },
        // `key[]=value`
        Some(Segment::Push) => match RawValue::entry(map, key) {
            None => map.push((key.clone(), RawValue::List(vec![RawValue::Leaf(value)]))),
            Some(RawValue::List(items)) => items.push(RawValue::Leaf(value)),
            Some(existing @ RawValue::Leaf(_)) => {
                let first = std::mem::replace(existing, RawValue::List(Vec::new()));
                *existing = RawValue::List(vec![first, RawValue::Leaf(value)]);
            }
            Some(RawValue::Map(_)) => return Err(QueryError::Conflict(key.clone())),
        },
        // `key[child]...=value`
        Some(Segment::Key(_)) => {
            if RawValue::entry(map, key).is_none() {
                map.push((key.clone(), RawValue::Map(Vec::new())));
            }
            match RawValue::entry(map, key) {
                Some(RawValue::Map(children)) => insert(children, raw_key, rest, value)?,
                _ => return Err(QueryError::Conflict(key.clone())),
            }
        }
    }
    Ok(())
}

/// Coerce raw query pairs into a typed document.
///
/// Empty values are dropped from objects and become `null` inside arrays.
pub fn coerce_pairs<K, V>(pairs: &[(K, V)]) -> Result<Document, QueryError>
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut root = Vec::new();
    for (key, value) in pairs {
        let segments = parse_key(key.as_ref())?;
        insert(&mut root, key.as_ref(), &segments, value.as_ref().to_string())?;
    }

    let mut doc = Document::new();
    for (key, raw) in root {
        if let Some(value) = coerce_member(&key, raw, true)? {
            doc.insert(key, value);
        }
    }
    Ok(doc)
}

/// Apply query coercion to a JSON object.
///
/// String values under [`ID_KEYS`] become `ObjectId`s and other strings go
/// through [`coerce_scalar`], the same as bracket notation. Non-string
/// values keep their JSON type (Extended JSON is honored).
pub fn coerce_object(object: &Map<String, Value>) -> Result<Document, QueryError> {
    let mut doc = Document::new();
    for (key, value) in object {
        doc.insert(key.clone(), coerce_json(key, value)?);
    }
    Ok(doc)
}

fn coerce_json(key: &str, value: &Value) -> Result<Bson, QueryError> {
    match value {
        Value::String(s) if ID_KEYS.contains(&key) => parse_id(key, s),
        Value::String(s) => Ok(coerce_scalar(s.clone())),
        Value::Object(object) if !is_extended_json(object) => coerce_object(object).map(Bson::Document),
        Value::Array(items) => items
            .iter()
            .map(|item| coerce_json("", item))
            .collect::<Result<Vec<_>, _>>()
            .map(Bson::Array),
        other => Bson::try_from(other.clone()).map_err(|e| QueryError::InvalidJson {
            key: key.to_string(),
            reason: e.to_string(),
        }),
    }
}

fn is_extended_json(object: &Map<String, Value>) -> bool {
    object.keys().next().is_some_and(|k| {
        matches!(
            k.as_str(),
            "$oid" | "$date" | "$numberLong" | "$numberInt" | "$numberDouble" | "$numberDecimal" | "$binary"
                | "$regularExpression" | "$timestamp" | "$symbol" | "$code" | "$minKey" | "$maxKey" | "$undefined"
        )
    })
}

fn parse_id(key: &str, value: &str) -> Result<Bson, QueryError> {
    ObjectId::parse_str(value)
        .map(Bson::ObjectId)
        .map_err(|_| QueryError::InvalidId {
            key: key.to_string(),
            value: value.to_string(),
        })
}

/// Coerce one object member; `None` drops it.
fn coerce_member(key: &str, raw: RawValue, top_level: bool) -> Result<Option<Bson>, QueryError> {
    match raw {
        RawValue::Leaf(s) if s.is_empty() => Ok(None),
        RawValue::Leaf(s) if ID_KEYS.contains(&key) => parse_id(key, &s).map(Some),
        RawValue::Leaf(s) if top_level && (s.starts_with('{') || s.starts_with('[')) => {
            let parsed: Value = serde_json::from_str(&s).map_err(|e| QueryError::InvalidJson {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
            coerce_json(key, &parsed).map(Some)
        }
        RawValue::Leaf(s) => Ok(Some(coerce_scalar(s))),
        RawValue::List(items) => items
            .into_iter()
            .map(|item| coerce_item(key, item))
            .collect::<Result<Vec<_>, _>>()
            .map(|items| Some(Bson::Array(items))),
        RawValue::Map(members) => {
            let mut doc = Document::new();
            for (child, raw) in members {
                if let Some(value) = coerce_member(&child, raw, false)? {
                    doc.insert(child, value);
                }
            }
            Ok(Some(Bson::Document(doc)))
        }
    }
}

/// Coerce one array item; empty items become `null`.
fn coerce_item(key: &str, raw: RawValue) -> Result<Bson, QueryError> {
    match raw {
        RawValue::Leaf(s) if s.is_empty() => Ok(Bson::Null),
        RawValue::Leaf(s) if ID_KEYS.contains(&key) => parse_id(key, &s),
        RawValue::Leaf(s) => Ok(coerce_scalar(s)),
        nested => Ok(coerce_member(key, nested, false)?.unwrap_or(Bson::Null)),
    }
}

/// `"true"`/`"false"` → bool, integral → Int64, other finite numbers →
/// Double, anything else stays a string.
pub fn coerce_scalar(s: String) -> Bson {
    match s.as_str() {
        "true" => return Bson::Boolean(true),
        "false" => return Bson::Boolean(false),
        _ => {}
    }
    if let Ok(n) = s.parse::<i64>() {
        return Bson::Int64(n);
    }
    match s.parse::<f64>() {
        Ok(f) if f.is_finite() && s.chars().any(|c| c.is_ascii_digit()) => Bson::Double(f),
        _ => Bson::String(s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn pairs(raw: &[(&str, &str)]) -> Result<Document, QueryError> {
        coerce_pairs(raw)
    }

    #[test]
    fn test_scalar_coercion() {
        let doc = pairs(&[
            ("email", "true"),
            ("off", "false"),
            ("n", "42"),
            ("ratio", "0.5"),
            ("name", "alice"),
            ("weird", "inf"),
        ])
        .unwrap();
        assert_eq!(
            doc,
            doc! { "email": true, "off": false, "n": 42_i64, "ratio": 0.5, "name": "alice", "weird": "inf" }
        );
    }

    #[test]
    fn test_id_keys_become_object_ids() {
        let id = ObjectId::new();
        let hex = id.to_hex();
        let doc = pairs(&[("_id", hex.as_str()), ("docId", hex.as_str())]).unwrap();
        assert_eq!(doc.get_object_id("_id").unwrap(), id);
        assert_eq!(doc.get_object_id("docId").unwrap(), id);

        let err = pairs(&[("docId", "not-an-id")]).unwrap_err();
        assert!(matches!(err, QueryError::InvalidId { ref key, .. } if key == "docId"));
    }

    #[test]
    fn test_bracket_notation() {
        let id = ObjectId::new();
        let hex = id.to_hex();
        let doc = pairs(&[
            ("collectionName", "users"),
            ("filter[email]", "a@b.com"),
            ("filter[age][$gt]", "30"),
            ("filter[_id]", hex.as_str()),
            ("options[limit]", "2"),
        ])
        .unwrap();
        assert_eq!(
            doc,
            doc! {
                "collectionName": "users",
                "filter": { "email": "a@b.com", "age": { "$gt": 30_i64 }, "_id": id },
                "options": { "limit": 2_i64 },
            }
        );
    }

    #[test]
    fn test_arrays() {
        let doc = pairs(&[
            ("filter[tags][]", "a"),
            ("filter[tags][]", ""),
            ("filter[tags][]", "3"),
            ("k", "1"),
            ("k", "2"),
        ])
        .unwrap();
        assert_eq!(
            doc,
            doc! { "filter": { "tags": ["a", Bson::Null, 3_i64] }, "k": [1_i64, 2_i64] }
        );
    }

    #[test]
    fn test_empty_values_dropped() {
        let doc = pairs(&[("filter", ""), ("options[limit]", ""), ("collectionName", "users")]).unwrap();
        assert_eq!(doc, doc! { "options": {}, "collectionName": "users" });
    }

    #[test]
    fn test_json_values_parsed() {
        let id = ObjectId::new();
        let filter = format!(r#"{{"_id":"{}","age":{{"$gte":18}},"when":{{"$date":"2024-01-01T00:00:00Z"}}}}"#, id.to_hex());
        let doc = pairs(&[("filter", filter.as_str())]).unwrap();
        let filter = doc.get_document("filter").unwrap();
        assert_eq!(filter.get_object_id("_id").unwrap(), id);
        assert_eq!(filter.get_document("age").unwrap(), &doc! { "$gte": 18 });
        assert!(matches!(filter.get("when"), Some(Bson::DateTime(_))));

        assert!(matches!(
            pairs(&[("filter", "{not json")]),
            Err(QueryError::InvalidJson { .. })
        ));
    }

    #[test]
    fn test_malformed_keys() {
        assert!(matches!(pairs(&[("[a]", "1")]), Err(QueryError::MalformedKey(_))));
        assert!(matches!(pairs(&[("a[b", "1")]), Err(QueryError::MalformedKey(_))));
        assert!(matches!(pairs(&[("a[][b]", "1")]), Err(QueryError::MalformedKey(_))));
        assert!(matches!(
            pairs(&[("a", "1"), ("a[b]", "2")]),
            Err(QueryError::Conflict(_))
        ));
    }

    #[test]
    fn test_coerce_object() {
        let id = ObjectId::new();
        let value = serde_json::json!({ "docId": id.to_hex(), "n": 1, "flag": "true", "name": "alice" });
        let doc = coerce_object(value.as_object().unwrap()).unwrap();
        assert_eq!(doc, doc! { "docId": id, "n": 1, "flag": true, "name": "alice" });
    }

    #[test]
    fn test_json_strings_match_bracket_notation() {
        let from_json = pairs(&[("filter", r#"{"email":"true","age":{"$gt":"30"},"tags":["x","2"]}"#)]).unwrap();
        let from_brackets = pairs(&[
            ("filter[email]", "true"),
            ("filter[age][$gt]", "30"),
            ("filter[tags][]", "x"),
            ("filter[tags][]", "2"),
        ])
        .unwrap();
        assert_eq!(
            from_json,
            doc! { "filter": { "email": true, "age": { "$gt": 30_i64 }, "tags": ["x", 2_i64] } }
        );
        assert_eq!(from_json, from_brackets);
    }
}
