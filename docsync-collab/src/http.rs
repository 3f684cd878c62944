//! Request/response binding over HTTP.
//!
//! Reads are always served; writes are opt-in through
//! [`HttpConfig::enable_writes`]. Nothing served here is broadcast to
//! WebSocket peers.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bson::{Bson, Document};
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpListener;

use crate::mediator::{Mediator, Operation};
use crate::protocol::{decode_call, CALL_PREFIX};
use crate::query::coerce_pairs;

pub const STATUS_MESSAGE: &str = "The application is currently under active development!";

/// Write calls exposed as `POST /<method>` when enabled.
pub const WRITE_METHODS: [&str; 7] = [
    "insertOne",
    "updateOne",
    "updateOneWithId",
    "replaceOne",
    "replaceOneWithId",
    "deleteOne",
    "deleteOneWithId",
];

/// HTTP binding configuration.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub bind_addr: String,
    pub enable_writes: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            enable_writes: false,
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    ok: bool,
    message: String,
}

fn response_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(StatusResponse {
            ok: false,
            message: message.into(),
        }),
    )
        .into_response()
}

/// Build the router over a shared mediator.
pub fn router(mediator: Arc<Mediator>, config: &HttpConfig) -> Router {
    let mut app = Router::new()
        .route("/", get(status))
        .route("/find", get(find))
        .route("/findOne", get(find_one))
        .route("/findOneWithId", get(find_one_with_id));

    if config.enable_writes {
        for method in WRITE_METHODS {
            app = app.route(
                &format!("/{method}"),
                post(move |State(mediator): State<Arc<Mediator>>, Json(body): Json<Value>| {
                    write(mediator, method, body)
                }),
            );
        }
    }

    app.with_state(mediator)
}

/// Bind and serve until the listener fails.
pub async fn serve(mediator: Arc<Mediator>, config: HttpConfig) -> std::io::Result<()> {
    let listener = TcpListener::bind(&config.bind_addr).await?;
    log::info!(
        "HTTP binding listening on {} (writes {})",
        listener.local_addr()?,
        if config.enable_writes { "enabled" } else { "disabled" }
    );
    axum::serve(listener, router(mediator, &config)).await
}

async fn status() -> impl IntoResponse {
    Json(StatusResponse {
        ok: true,
        message: STATUS_MESSAGE.to_string(),
    })
}

/// Coerced query parameters of one read request.
struct ReadParams {
    collection: String,
    query: Document,
}

impl ReadParams {
    fn parse(pairs: &[(String, String)]) -> Result<Self, Response> {
        // Taken raw so a numeric-looking name stays a string
        let collection = pairs
            .iter()
            .rev()
            .find(|(k, v)| k == "collectionName" && !v.is_empty())
            .map(|(_, v)| v.clone())
            .ok_or_else(|| response_error(StatusCode::BAD_REQUEST, "missing query parameter 'collectionName'"))?;
        let query = coerce_pairs(pairs).map_err(|e| response_error(StatusCode::BAD_REQUEST, e.to_string()))?;
        Ok(Self { collection, query })
    }

    fn document(&self, name: &str) -> Result<Option<Document>, Response> {
        match self.query.get(name) {
            None => Ok(None),
            Some(Bson::Document(doc)) => Ok(Some(doc.clone())),
            Some(_) => Err(response_error(
                StatusCode::BAD_REQUEST,
                format!("query parameter '{name}' must be an object"),
            )),
        }
    }
}

async fn run(mediator: &Mediator, operation: Operation) -> Response {
    log::debug!("HTTP {} on '{}'", operation.method(), operation.collection());
    let mediated = mediator.execute(operation).await;
    (StatusCode::OK, Json(mediated.outcome.to_json())).into_response()
}

async fn find(State(mediator): State<Arc<Mediator>>, Query(pairs): Query<Vec<(String, String)>>) -> Response {
    let params = match ReadParams::parse(&pairs) {
        Ok(params) => params,
        Err(response) => return response,
    };
    let operation = match (params.document("filter"), params.document("options")) {
        (Ok(filter), Ok(options)) => Operation::Find {
            collection: params.collection,
            filter,
            options,
        },
        (Err(response), _) | (_, Err(response)) => return response,
    };
    run(&mediator, operation).await
}

async fn find_one(State(mediator): State<Arc<Mediator>>, Query(pairs): Query<Vec<(String, String)>>) -> Response {
    let params = match ReadParams::parse(&pairs) {
        Ok(params) => params,
        Err(response) => return response,
    };
    let operation = match (params.document("filter"), params.document("options")) {
        (Ok(filter), Ok(options)) => Operation::FindOne {
            collection: params.collection,
            filter: filter.unwrap_or_default(),
            options,
        },
        (Err(response), _) | (_, Err(response)) => return response,
    };
    run(&mediator, operation).await
}

async fn find_one_with_id(
    State(mediator): State<Arc<Mediator>>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Response {
    let params = match ReadParams::parse(&pairs) {
        Ok(params) => params,
        Err(response) => return response,
    };
    let id = match params.query.get("docId") {
        Some(Bson::ObjectId(id)) => *id,
        _ => return response_error(StatusCode::BAD_REQUEST, "missing query parameter 'docId'"),
    };
    let operation = Operation::FindOneWithId {
        collection: params.collection,
        id,
    };
    run(&mediator, operation).await
}

/// Positional call arguments for a write request body.
///
/// Body fields: `collectionName`, then `filter` or `docId` as the method
/// requires, then `document`.
pub fn write_args(method: &str, body: &Value) -> Vec<Value> {
    let field = |name: &str| body.get(name).cloned().unwrap_or(Value::Null);
    let target = if method.ends_with("WithId") { "docId" } else { "filter" };

    let mut args = vec![field("collectionName")];
    match method {
        "insertOne" => args.push(field("document")),
        "deleteOne" | "deleteOneWithId" => args.push(field(target)),
        _ => {
            args.push(field(target));
            args.push(field("document"));
        }
    }
    args
}

async fn write(mediator: Arc<Mediator>, method: &'static str, body: Value) -> Response {
    let event = format!("{CALL_PREFIX}{method}");
    match decode_call(&event, write_args(method, &body)) {
        Ok(operation) => run(&mediator, operation).await,
        Err(e) => response_error(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_http_config_default() {
        let config = HttpConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:3000");
        assert!(!config.enable_writes);
    }

    #[test]
    fn test_write_args_shapes() {
        let body = json!({
            "collectionName": "users",
            "filter": { "email": "a@b.com" },
            "docId": "65f0c0ffee0000000000beef",
            "document": { "n": 1 },
        });
        assert_eq!(write_args("insertOne", &body), vec![json!("users"), json!({ "n": 1 })]);
        assert_eq!(
            write_args("updateOne", &body),
            vec![json!("users"), json!({ "email": "a@b.com" }), json!({ "n": 1 })]
        );
        assert_eq!(
            write_args("replaceOneWithId", &body),
            vec![json!("users"), json!("65f0c0ffee0000000000beef"), json!({ "n": 1 })]
        );
        assert_eq!(
            write_args("deleteOneWithId", &body),
            vec![json!("users"), json!("65f0c0ffee0000000000beef")]
        );
    }

    #[test]
    fn test_write_args_decode() {
        let body = json!({ "collectionName": "users", "filter": { "n": 1 } });
        let op = decode_call("collection:deleteOne", write_args("deleteOne", &body)).unwrap();
        assert_eq!(op.method(), "deleteOne");

        let missing = json!({ "collectionName": "users" });
        assert!(decode_call("collection:insertOne", write_args("insertOne", &missing)).is_err());
    }

    #[test]
    fn test_read_params() {
        let pairs = vec![
            ("collectionName".to_string(), "123".to_string()),
            ("filter[n]".to_string(), "5".to_string()),
            ("options".to_string(), "7".to_string()),
        ];
        let params = ReadParams::parse(&pairs).ok().unwrap();
        assert_eq!(params.collection, "123");
        assert_eq!(params.document("filter").ok().unwrap(), Some(bson::doc! { "n": 5_i64 }));
        assert!(params.document("options").is_err());
        assert!(ReadParams::parse(&[]).is_err());
    }
}
