// REST control surface: out-of-band submission and read-only inspection of
// documents and their op logs.

use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Json, Path, Query, State,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tablesync_common::ot::{self, Operation};
use tracing::{info_span, Instrument};

use crate::collab::CollaborationService;
use crate::error::{ErrorCode, RelayError};
use crate::ws;

const USER_ID_HEADER: &str = "x-user-id";

#[derive(Debug, Serialize)]
struct Success<T> {
    status: &'static str,
    data: T,
}

fn success<T: Serialize>(data: T) -> Json<Success<T>> {
    Json(Success { status: "success", data })
}

pub fn router(service: Arc<CollaborationService>) -> Router {
    Router::new()
        .route("/submit", post(submit))
        .route("/snapshot/{collection}/{id}", get(snapshot))
        .route("/snapshots/{collection}", post(snapshots))
        .route("/query/{collection}", post(query))
        .route("/ops/{collection}/{id}", get(ops))
        .route("/stats", get(stats))
        .route("/ws", get(ws::ws_upgrade))
        .with_state(service)
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    collection: String,
    id: String,
    op: Operation,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    metadata: Option<Value>,
}

fn bad_request(rejection: impl std::fmt::Display) -> RelayError {
    RelayError::new(ErrorCode::ValidationFailed, rejection.to_string())
}

fn user_id(headers: &HeaderMap) -> Result<String, RelayError> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| RelayError::from_code(ErrorCode::AuthRequired))
}

async fn submit(
    State(service): State<Arc<CollaborationService>>,
    headers: HeaderMap,
    payload: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<impl IntoResponse, RelayError> {
    let user_id = user_id(&headers)?;
    let Json(request) = payload.map_err(bad_request)?;
    let SubmitRequest { agent_id, session_id, collection, id, op: mut operation, source, metadata } = request;

    operation.collection = collection;
    operation.document_id = id;
    // Explicit source, then the op's own `src`, then the agent id.
    match source.filter(|source| !source.is_empty()) {
        Some(source) => operation.source = source,
        None if operation.source.is_empty() => {
            operation.source = agent_id.clone().unwrap_or_default();
        }
        None => {}
    }

    let span = info_span!(
        "tablesync.api.submit",
        user_id = %user_id,
        agent_id = agent_id.as_deref().unwrap_or(""),
        session_id = session_id.as_deref().unwrap_or(""),
        has_metadata = metadata.is_some(),
    );
    async move {
        let outcome = service.pipeline().submit(&user_id, operation).await.map_err(RelayError::from)?;
        Ok::<_, RelayError>(success(outcome))
    }
    .instrument(span)
    .await
}

async fn snapshot(
    State(service): State<Arc<CollaborationService>>,
    Path((collection, id)): Path<(String, String)>,
) -> Result<impl IntoResponse, RelayError> {
    let snapshot = service.pipeline().snapshot(&collection, &id).await.map_err(RelayError::from)?;
    Ok(success(snapshot))
}

#[derive(Debug, Deserialize)]
struct BulkSnapshotRequest {
    ids: Vec<String>,
}

async fn snapshots(
    State(service): State<Arc<CollaborationService>>,
    Path(collection): Path<String>,
    payload: Result<Json<BulkSnapshotRequest>, JsonRejection>,
) -> Result<impl IntoResponse, RelayError> {
    let Json(request) = payload.map_err(bad_request)?;
    let snapshots = service.pipeline().snapshots(&collection, &request.ids).await.map_err(RelayError::from)?;
    Ok(success(snapshots))
}

async fn query(
    State(service): State<Arc<CollaborationService>>,
    Path(collection): Path<String>,
    payload: Result<Json<ot::Query>, JsonRejection>,
) -> Result<impl IntoResponse, RelayError> {
    let Json(query) = payload.map_err(bad_request)?;
    let result = service.pipeline().query(&collection, &query).await.map_err(RelayError::from)?;
    Ok(success(result))
}

#[derive(Debug, Default, Deserialize)]
struct OpsRange {
    #[serde(default)]
    from: u64,
    #[serde(default)]
    to: u64,
}

async fn ops(
    State(service): State<Arc<CollaborationService>>,
    Path((collection, id)): Path<(String, String)>,
    range: Result<Query<OpsRange>, QueryRejection>,
) -> Result<impl IntoResponse, RelayError> {
    let Query(range) = range.map_err(bad_request)?;
    let ops = service
        .pipeline()
        .ops(&collection, &id, range.from, range.to)
        .await
        .map_err(RelayError::from)?;
    Ok(success(ops))
}

async fn stats(State(service): State<Arc<CollaborationService>>) -> impl IntoResponse {
    success(service.stats().await)
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::{Method, Request, StatusCode},
    };
    use serde_json::json;
    use tower::ServiceExt;

    use std::time::Duration;

    use super::*;
    use crate::config::{RelayConfig, SubmitConfig};
    use crate::permissions::{Grant, PermissionChecker};
    use crate::store::OpLogStore;
    use tablesync_common::channel::ResourceType;

    fn test_service(permissions: PermissionChecker) -> Arc<CollaborationService> {
        CollaborationService::new(&RelayConfig::default(), OpLogStore::memory(), permissions, None)
    }

    async fn read_json(response: axum::response::Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("response body should read");
        serde_json::from_slice(&body).expect("response body should be valid json")
    }

    fn submit_request(user: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/submit")
            .header("content-type", "application/json");
        if let Some(user) = user {
            builder = builder.header(USER_ID_HEADER, user);
        }
        builder.body(Body::from(body.to_string())).expect("request should build")
    }

    fn set_body(version: u64, field: &str, value: Value) -> Value {
        json!({
            "agent_id": "agent-1",
            "session_id": "s1",
            "collection": "rec_t1",
            "id": "r1",
            "op": { "v": version, "op": [{ "p": [field], "oi": value }] },
        })
    }

    #[tokio::test]
    async fn submit_commits_and_snapshot_reads_it_back() {
        let app = router(test_service(PermissionChecker::AllowAll));

        let response = app
            .clone()
            .oneshot(submit_request(Some("u1"), set_body(0, "title", json!("hello"))))
            .await
            .expect("submit should respond");
        assert_eq!(response.status(), StatusCode::OK);
        let body = read_json(response).await;
        assert_eq!(body["status"], "success");
        assert_eq!(body["data"]["committed_version"], 1);

        let response = app
            .oneshot(Request::builder().uri("/snapshot/rec_t1/r1").body(Body::empty()).expect("request should build"))
            .await
            .expect("snapshot should respond");
        let body = read_json(response).await;
        assert_eq!(body["data"]["version"], 1);
        assert_eq!(body["data"]["data"]["title"], "hello");
    }

    #[tokio::test]
    async fn submit_without_user_is_unauthorized() {
        let app = router(test_service(PermissionChecker::AllowAll));
        let response = app
            .oneshot(submit_request(None, set_body(0, "a", json!(1))))
            .await
            .expect("submit should respond");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(read_json(response).await["error"]["code"], "AUTH_REQUIRED");
    }

    #[tokio::test]
    async fn submit_errors_use_registry_statuses() {
        let permissions = PermissionChecker::memory();
        if let PermissionChecker::Memory(grants) = &permissions {
            grants.write().await.grant(Grant::write("writer", ResourceType::Table, "t1"));
        }
        let app = router(test_service(permissions));

        let denied = app
            .clone()
            .oneshot(submit_request(Some("reader"), set_body(0, "a", json!(1))))
            .await
            .expect("submit should respond");
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);

        let ahead = app
            .clone()
            .oneshot(submit_request(Some("writer"), set_body(4, "a", json!(1))))
            .await
            .expect("submit should respond");
        assert_eq!(ahead.status(), StatusCode::BAD_REQUEST);
        let body = read_json(ahead).await;
        assert_eq!(body["error"]["code"], "INVALID_VERSION");
        assert_eq!(body["error"]["retryable"], false);

        let empty = json!({ "collection": "rec_t1", "id": "r1", "op": { "v": 0, "op": [] } });
        let rejected = app
            .clone()
            .oneshot(submit_request(Some("writer"), empty))
            .await
            .expect("submit should respond");
        assert_eq!(rejected.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let malformed = app
            .oneshot(submit_request(Some("writer"), json!({ "collection": "rec_t1" })))
            .await
            .expect("submit should respond");
        assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_as_conflict() {
        let config = RelayConfig {
            submit: SubmitConfig {
                max_attempts: 2,
                backoff_base: Duration::from_millis(1),
                backoff_max: Duration::from_millis(2),
                ..SubmitConfig::default()
            },
            ..RelayConfig::default()
        };
        let service = CollaborationService::new(
            &config,
            OpLogStore::memory_with_rival_writer(),
            PermissionChecker::AllowAll,
            None,
        );

        let response = router(service)
            .oneshot(submit_request(Some("u1"), set_body(0, "a", json!(1))))
            .await
            .expect("submit should respond");
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = read_json(response).await;
        assert_eq!(body["error"]["code"], "CONFLICT_EXHAUSTED");
        assert_eq!(body["error"]["retryable"], true);
    }

    #[tokio::test]
    async fn bulk_snapshot_read_is_keyed_by_id() {
        let app = router(test_service(PermissionChecker::AllowAll));
        app.clone()
            .oneshot(submit_request(Some("u1"), set_body(0, "title", json!("hello"))))
            .await
            .expect("submit should respond");

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/snapshots/rec_t1")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({ "ids": ["r1", "r2"] }).to_string()))
                    .expect("request should build"),
            )
            .await
            .expect("bulk read should respond");
        assert_eq!(response.status(), StatusCode::OK);
        let body = read_json(response).await;
        assert_eq!(body["data"]["r1"]["version"], 1);
        assert_eq!(body["data"]["r1"]["data"]["title"], "hello");
        assert_eq!(body["data"]["r2"]["version"], 0);

        let missing_ids = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/snapshots/rec_t1")
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .expect("request should build"),
            )
            .await
            .expect("bulk read should respond");
        assert_eq!(missing_ids.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_snapshot_is_version_zero() {
        let app = router(test_service(PermissionChecker::AllowAll));
        let response = app
            .oneshot(Request::builder().uri("/snapshot/rec_t1/nope").body(Body::empty()).expect("request should build"))
            .await
            .expect("snapshot should respond");
        assert_eq!(response.status(), StatusCode::OK);
        let body = read_json(response).await;
        assert_eq!(body["data"]["version"], 0);
        assert_eq!(body["data"]["data"], Value::Null);
    }

    #[tokio::test]
    async fn ops_range_and_bounds() {
        let app = router(test_service(PermissionChecker::AllowAll));
        for version in 0..4 {
            app.clone()
                .oneshot(submit_request(Some("u1"), set_body(version, "n", json!(version))))
                .await
                .expect("submit should respond");
        }

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/ops/rec_t1/r1?from=1&to=3").body(Body::empty()).expect("request should build"))
            .await
            .expect("ops should respond");
        let body = read_json(response).await;
        let versions: Vec<u64> = body["data"]
            .as_array()
            .expect("ops list")
            .iter()
            .filter_map(|op| op["committed_version"].as_u64())
            .collect();
        assert_eq!(versions, vec![2, 3]);

        let head = app
            .clone()
            .oneshot(Request::builder().uri("/ops/rec_t1/r1?from=2").body(Body::empty()).expect("request should build"))
            .await
            .expect("ops should respond");
        assert_eq!(read_json(head).await["data"].as_array().map(Vec::len), Some(2));

        let inverted = app
            .oneshot(Request::builder().uri("/ops/rec_t1/r1?from=3&to=1").body(Body::empty()).expect("request should build"))
            .await
            .expect("ops should respond");
        assert_eq!(inverted.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn query_filters_sorts_and_pages() {
        let app = router(test_service(PermissionChecker::AllowAll));
        for (id, status, rank) in [("r1", "open", 3), ("r2", "done", 1), ("r3", "open", 2), ("r4", "open", 1)] {
            let body = json!({
                "collection": "rec_t1",
                "id": id,
                "op": { "v": 0, "op": [{ "p": ["status"], "oi": status }, { "p": ["rank"], "oi": rank }] },
            });
            app.clone().oneshot(submit_request(Some("u1"), body)).await.expect("submit should respond");
        }

        let query = json!({ "fields": { "status": "open" }, "sort": [{ "field": "rank", "order": "desc" }], "limit": 2 });
        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/query/rec_t1")
                    .header("content-type", "application/json")
                    .body(Body::from(query.to_string()))
                    .expect("request should build"),
            )
            .await
            .expect("query should respond");
        let body = read_json(response).await;
        assert_eq!(body["data"]["total"], 3);
        let ids: Vec<&str> = body["data"]["snapshots"]
            .as_array()
            .expect("snapshots")
            .iter()
            .filter_map(|snapshot| snapshot["id"].as_str())
            .collect();
        assert_eq!(ids, vec!["r1", "r3"]);
    }

    #[tokio::test]
    async fn stats_reports_service_state() {
        let app = router(test_service(PermissionChecker::AllowAll));
        let response = app
            .oneshot(Request::builder().uri("/stats").body(Body::empty()).expect("request should build"))
            .await
            .expect("stats should respond");
        let body = read_json(response).await;
        assert_eq!(body["data"]["fan_out"], "local");
        assert_eq!(body["data"]["connections"], 0);
    }
}
