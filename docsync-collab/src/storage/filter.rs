//! Query predicate evaluation and find options shared by the engines.
//!
//! Supported predicate forms:
//! - implicit equality `{ field: value }` (array fields match on any element)
//! - dotted paths `{ "profile.name": "x" }`, numeric segments index arrays
//! - field operators `$eq $ne $gt $gte $lt $lte $in $nin $exists`
//! - top-level combinators `$and $or $nor`
//!
//! Numbers compare across BSON numeric types. Ordering operators only match
//! values of the same type class, as in MongoDB.

use std::cmp::Ordering;

use bson::{Bson, Document};

use super::engine::EngineError;

/// Options accepted by `find` / `find_one`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub limit: Option<usize>,
    pub skip: Option<usize>,
    pub sort: Option<Document>,
    pub projection: Option<Document>,
}

impl FindOptions {
    /// Parse the engine-native options document (`limit`, `skip`, `sort`,
    /// `projection`). Unrecognized keys are ignored.
    pub fn from_document(options: &Document) -> Result<Self, EngineError> {
        let mut parsed = FindOptions::default();
        for (key, value) in options {
            match key.as_str() {
                "limit" => parsed.limit = count_option(key, value)?.filter(|n| *n > 0),
                "skip" => parsed.skip = count_option(key, value)?,
                "sort" => parsed.sort = Some(document_option(key, value)?),
                "projection" => parsed.projection = Some(document_option(key, value)?),
                _ => {}
            }
        }
        Ok(parsed)
    }

    pub fn is_empty(&self) -> bool {
        *self == FindOptions::default()
    }
}

fn count_option(key: &str, value: &Bson) -> Result<Option<usize>, EngineError> {
    match as_f64(value) {
        Some(n) if n.fract() == 0.0 && n.is_finite() => Ok(Some(n.abs() as usize)),
        _ if matches!(value, Bson::Null) => Ok(None),
        _ => Err(EngineError::InvalidQuery(format!(
            "option '{key}' must be an integer"
        ))),
    }
}

fn document_option(key: &str, value: &Bson) -> Result<Document, EngineError> {
    match value {
        Bson::Document(doc) => Ok(doc.clone()),
        _ => Err(EngineError::InvalidQuery(format!(
            "option '{key}' must be an object"
        ))),
    }
}

/// Evaluate `filter` against `doc`.
pub fn matches(doc: &Document, filter: &Document) -> Result<bool, EngineError> {
    for (key, condition) in filter {
        let matched = match key.as_str() {
            "$and" => {
                let mut all = true;
                for clause in clauses(key, condition)? {
                    if !matches(doc, clause)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" => any_clause(doc, key, condition)?,
            "$nor" => !any_clause(doc, key, condition)?,
            op if op.starts_with('$') => return Err(EngineError::UnknownOperator(op.to_string())),
            path => matches_field(lookup(doc, path), condition)?,
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn any_clause(doc: &Document, key: &str, condition: &Bson) -> Result<bool, EngineError> {
    for clause in clauses(key, condition)? {
        if matches(doc, clause)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn clauses<'a>(key: &str, condition: &'a Bson) -> Result<Vec<&'a Document>, EngineError> {
    let invalid = || EngineError::InvalidQuery(format!("{key} must be a nonempty array"));
    let Bson::Array(items) = condition else {
        return Err(invalid());
    };
    if items.is_empty() {
        return Err(invalid());
    }
    items
        .iter()
        .map(|item| match item {
            Bson::Document(clause) => Ok(clause),
            _ => Err(EngineError::InvalidQuery(format!(
                "{key} argument's entries must be objects"
            ))),
        })
        .collect()
}

fn matches_field(value: Option<&Bson>, condition: &Bson) -> Result<bool, EngineError> {
    match condition {
        Bson::Document(ops) if is_operator_document(ops) => {
            for (op, operand) in ops {
                if !apply_operator(value, op, operand)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        _ => Ok(equals(value, condition)),
    }
}

fn is_operator_document(doc: &Document) -> bool {
    doc.keys().next().is_some_and(|k| k.starts_with('$'))
}

fn apply_operator(value: Option<&Bson>, op: &str, operand: &Bson) -> Result<bool, EngineError> {
    let matched = match op {
        "$eq" => equals(value, operand),
        "$ne" => !equals(value, operand),
        "$gt" => ordered(value, operand, |o| o == Ordering::Greater),
        "$gte" => ordered(value, operand, |o| o != Ordering::Less),
        "$lt" => ordered(value, operand, |o| o == Ordering::Less),
        "$lte" => ordered(value, operand, |o| o != Ordering::Greater),
        "$in" => candidates(op, operand)?.iter().any(|c| equals(value, c)),
        "$nin" => !candidates(op, operand)?.iter().any(|c| equals(value, c)),
        "$exists" => value.is_some() == truthy(operand),
        other => return Err(EngineError::UnknownOperator(other.to_string())),
    };
    Ok(matched)
}

fn candidates<'a>(op: &str, operand: &'a Bson) -> Result<&'a [Bson], EngineError> {
    match operand {
        Bson::Array(items) => Ok(items),
        _ => Err(EngineError::InvalidQuery(format!("{op} needs an array"))),
    }
}

fn truthy(value: &Bson) -> bool {
    match value {
        Bson::Boolean(b) => *b,
        Bson::Null => false,
        other => as_f64(other).map_or(true, |n| n != 0.0),
    }
}

fn equals(value: Option<&Bson>, expected: &Bson) -> bool {
    match value {
        None => matches!(expected, Bson::Null),
        Some(actual) => {
            values_equal(actual, expected)
                || matches!(actual, Bson::Array(items) if items.iter().any(|i| values_equal(i, expected)))
        }
    }
}

fn ordered(value: Option<&Bson>, operand: &Bson, accept: impl Fn(Ordering) -> bool) -> bool {
    match value {
        None => false,
        Some(Bson::Array(items)) if !matches!(operand, Bson::Array(_)) => items
            .iter()
            .any(|item| compare(item, operand).is_some_and(&accept)),
        Some(actual) => compare(actual, operand).is_some_and(accept),
    }
}

/// Equality with numeric normalization (`1` == `1.0` == `1i64`).
pub fn values_equal(a: &Bson, b: &Bson) -> bool {
    match (as_f64(a), as_f64(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Same-type-class comparison; `None` when the classes differ.
pub fn compare(a: &Bson, b: &Bson) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (as_f64(a), as_f64(b)) {
        return x.partial_cmp(&y);
    }
    match (a, b) {
        (Bson::String(x), Bson::String(y)) => Some(x.cmp(y)),
        (Bson::Boolean(x), Bson::Boolean(y)) => Some(x.cmp(y)),
        (Bson::DateTime(x), Bson::DateTime(y)) => Some(x.timestamp_millis().cmp(&y.timestamp_millis())),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => Some(x.bytes().cmp(&y.bytes())),
        (Bson::Null, Bson::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(n) => Some(f64::from(*n)),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    }
}

/// Resolve a dotted path. Numeric segments index into arrays.
pub fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Bson::Document(inner) => inner.get(segment)?,
            Bson::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Apply sort, skip, limit and projection, in that order.
pub fn apply_options(mut docs: Vec<Document>, options: &FindOptions) -> Vec<Document> {
    if let Some(sort) = &options.sort {
        docs.sort_by(|a, b| sort_order(a, b, sort));
    }
    let skip = options.skip.unwrap_or(0);
    let limit = options.limit.unwrap_or(usize::MAX);
    let page = docs.into_iter().skip(skip).take(limit);
    match &options.projection {
        Some(projection) if !projection.is_empty() => page.map(|d| project(d, projection)).collect(),
        _ => page.collect(),
    }
}

fn sort_order(a: &Document, b: &Document, sort: &Document) -> Ordering {
    for (path, direction) in sort {
        let descending = as_f64(direction).is_some_and(|d| d < 0.0);
        let ord = total_order(lookup(a, path), lookup(b, path));
        let ord = if descending { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// BSON sort order: missing/null < numbers < strings < documents < arrays
/// < object ids < booleans < dates.
fn total_order(a: Option<&Bson>, b: Option<&Bson>) -> Ordering {
    fn rank(value: Option<&Bson>) -> u8 {
        match value {
            None | Some(Bson::Null) => 0,
            Some(Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_)) => 1,
            Some(Bson::String(_)) => 2,
            Some(Bson::Document(_)) => 3,
            Some(Bson::Array(_)) => 4,
            Some(Bson::ObjectId(_)) => 5,
            Some(Bson::Boolean(_)) => 6,
            Some(Bson::DateTime(_)) => 7,
            Some(_) => 8,
        }
    }
    rank(a).cmp(&rank(b)).then_with(|| match (a, b) {
        (Some(x), Some(y)) => compare(x, y).unwrap_or(Ordering::Equal),
        _ => Ordering::Equal,
    })
}

/// Inclusion projections keep the listed fields plus `_id` (unless
/// `_id: 0`); exclusion projections drop the listed fields.
fn project(doc: Document, projection: &Document) -> Document {
    let inclusive = projection
        .iter()
        .filter(|(k, _)| k.as_str() != "_id")
        .any(|(_, v)| truthy(v));
    let id_excluded = projection.get("_id").is_some_and(|v| !truthy(v));

    if inclusive {
        doc.into_iter()
            .filter(|(k, _)| {
                if k == "_id" {
                    !id_excluded
                } else {
                    projection.get(k).is_some_and(truthy)
                }
            })
            .collect()
    } else {
        doc.into_iter()
            .filter(|(k, _)| !projection.get(k).is_some_and(|v| !truthy(v)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{doc, oid::ObjectId};

    fn user() -> Document {
        doc! {
            "_id": ObjectId::new(),
            "email": "a@b.com",
            "age": 30_i64,
            "tags": ["admin", "ops"],
            "profile": { "city": "Oslo", "visits": [3, 5] },
        }
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(matches(&user(), &doc! {}).unwrap());
    }

    #[test]
    fn test_implicit_equality() {
        let doc = user();
        assert!(matches(&doc, &doc! { "email": "a@b.com" }).unwrap());
        assert!(!matches(&doc, &doc! { "email": "x@b.com" }).unwrap());
        assert!(matches(&doc, &doc! { "age": 30 }).unwrap());
        assert!(matches(&doc, &doc! { "age": 30.0 }).unwrap());
    }

    #[test]
    fn test_array_membership() {
        let doc = user();
        assert!(matches(&doc, &doc! { "tags": "ops" }).unwrap());
        assert!(matches(&doc, &doc! { "tags": ["admin", "ops"] }).unwrap());
        assert!(!matches(&doc, &doc! { "tags": "guest" }).unwrap());
    }

    #[test]
    fn test_dotted_paths() {
        let doc = user();
        assert!(matches(&doc, &doc! { "profile.city": "Oslo" }).unwrap());
        assert!(matches(&doc, &doc! { "profile.visits.1": 5 }).unwrap());
        assert!(!matches(&doc, &doc! { "profile.missing": "x" }).unwrap());
    }

    #[test]
    fn test_missing_field_equals_null() {
        let doc = user();
        assert!(matches(&doc, &doc! { "deleted": null }).unwrap());
        assert!(matches(&doc, &doc! { "deleted": { "$exists": false } }).unwrap());
        assert!(!matches(&doc, &doc! { "email": { "$exists": false } }).unwrap());
    }

    #[test]
    fn test_comparison_operators() {
        let doc = user();
        assert!(matches(&doc, &doc! { "age": { "$gt": 18, "$lte": 30 } }).unwrap());
        assert!(!matches(&doc, &doc! { "age": { "$lt": 30 } }).unwrap());
        assert!(matches(&doc, &doc! { "age": { "$ne": 31 } }).unwrap());
        // Cross-type comparisons never match.
        assert!(!matches(&doc, &doc! { "age": { "$gt": "10" } }).unwrap());
        assert!(matches(&doc, &doc! { "profile.visits": { "$gte": 5 } }).unwrap());
    }

    #[test]
    fn test_in_and_nin() {
        let doc = user();
        assert!(matches(&doc, &doc! { "email": { "$in": ["a@b.com", "c@d.com"] } }).unwrap());
        assert!(matches(&doc, &doc! { "tags": { "$nin": ["guest"] } }).unwrap());
        assert!(matches(&doc, &doc! { "email": { "$in": "a@b.com" } }).is_err());
    }

    #[test]
    fn test_logical_combinators() {
        let doc = user();
        let filter = doc! { "$or": [ { "email": "nope" }, { "age": 30 } ] };
        assert!(matches(&doc, &filter).unwrap());
        let filter = doc! { "$and": [ { "email": "a@b.com" }, { "age": { "$gt": 40 } } ] };
        assert!(!matches(&doc, &filter).unwrap());
        let filter = doc! { "$nor": [ { "email": "nope" } ] };
        assert!(matches(&doc, &filter).unwrap());
        assert!(matches(&doc, &doc! { "$or": [] }).is_err());
    }

    #[test]
    fn test_unknown_operator_is_a_fault() {
        let err = matches(&user(), &doc! { "age": { "$foo": 1 } }).unwrap_err();
        assert_eq!(err.to_string(), "unknown operator: $foo");
        let err = matches(&user(), &doc! { "$where": "1" }).unwrap_err();
        assert_eq!(err, EngineError::UnknownOperator("$where".into()));
    }

    #[test]
    fn test_embedded_document_equality() {
        let doc = doc! { "meta": { "a": 1 } };
        assert!(matches(&doc, &doc! { "meta": { "a": 1 } }).unwrap());
        assert!(!matches(&doc, &doc! { "meta": { "a": 2 } }).unwrap());
    }

    #[test]
    fn test_options_parse() {
        let opts = FindOptions::from_document(&doc! { "limit": 2, "skip": 1_i64, "sort": { "n": -1 } }).unwrap();
        assert_eq!(opts.limit, Some(2));
        assert_eq!(opts.skip, Some(1));
        assert!(opts.sort.is_some());
        assert!(FindOptions::from_document(&doc! { "limit": "ten" }).is_err());
        assert!(FindOptions::from_document(&doc! { "limit": 0 }).unwrap().limit.is_none());
    }

    #[test]
    fn test_apply_options_sort_skip_limit() {
        let docs: Vec<Document> = [3, 1, 2, 5, 4].iter().map(|n| doc! { "n": *n }).collect();
        let opts = FindOptions {
            sort: Some(doc! { "n": -1 }),
            skip: Some(1),
            limit: Some(2),
            ..Default::default()
        };
        let out = apply_options(docs, &opts);
        let ns: Vec<i32> = out.iter().map(|d| d.get_i32("n").unwrap()).collect();
        assert_eq!(ns, vec![4, 3]);
    }

    #[test]
    fn test_sort_puts_missing_first() {
        let docs = vec![doc! { "n": 1 }, doc! { "m": 1 }];
        let opts = FindOptions { sort: Some(doc! { "n": 1 }), ..Default::default() };
        let out = apply_options(docs, &opts);
        assert!(out[0].get("n").is_none());
    }

    #[test]
    fn test_projection() {
        let doc = user();
        let id = doc.get_object_id("_id").unwrap();

        let inc = FindOptions { projection: Some(doc! { "email": 1 }), ..Default::default() };
        let out = apply_options(vec![doc.clone()], &inc);
        assert_eq!(out[0], doc! { "_id": id, "email": "a@b.com" });

        let no_id = FindOptions { projection: Some(doc! { "email": 1, "_id": 0 }), ..Default::default() };
        assert_eq!(apply_options(vec![doc.clone()], &no_id)[0], doc! { "email": "a@b.com" });

        let exc = FindOptions { projection: Some(doc! { "profile": 0, "tags": 0 }), ..Default::default() };
        let out = apply_options(vec![doc], &exc);
        assert!(out[0].get("profile").is_none());
        assert!(out[0].get("email").is_some());
    }
}
