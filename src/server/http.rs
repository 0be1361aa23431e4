//! HTTP coordinator surface
//!
//! JSON API plus a Server-Sent-Events change feed. Every handler is a thin
//! shim over [`MemoryService`]; error bodies carry the taxonomy kind so
//! federated clients can reconstruct the original error.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::Stream;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::BroadcastStream;

use crate::error::{MnemoError, Result};
use crate::server::events::EventBroadcaster;
use crate::service::responses::{ErrorBody, ErrorDetail};
use crate::service::{
    DeleteByTagRequest, DeleteByTimeRangeRequest, ListMemoriesRequest, MemoryService,
    RetrieveMemoryRequest, SearchByTagRequest, SearchByTimeRequest, SearchSimilarRequest,
    StoreMemoryRequest, UpdateMemoryMetadataRequest,
};

/// Clients may announce their hostname for source tracking
const CLIENT_HOSTNAME_HEADER: &str = "x-client-hostname";

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<MemoryService>,
    pub events: EventBroadcaster,
    pub api_key: Option<String>,
    pub heartbeat: Duration,
    pub cors_origin: String,
}

/// Error wrapper translating the taxonomy into HTTP responses
struct ApiError(MnemoError);

impl From<MnemoError> for ApiError {
    fn from(err: MnemoError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorBody {
            error: ErrorDetail {
                kind: self.0.kind().to_string(),
                message: self.0.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/health/detailed", get(health_detailed))
        .route("/api/memories", post(store_memory).get(list_memories))
        .route(
            "/api/memories/:hash",
            get(get_memory).delete(delete_memory).patch(update_memory),
        )
        .route("/api/memories/delete-by-tag", post(delete_by_tag))
        .route("/api/memories/delete-by-time", post(delete_by_time))
        .route("/api/search", post(search))
        .route("/api/search/by-tag", post(search_by_tag))
        .route("/api/search/by-time", post(search_by_time))
        .route("/api/search/similar", post(search_similar))
        .route("/api/tags", get(list_tags))
        .route(
            "/api/maintenance/cleanup-duplicates",
            post(cleanup_duplicates),
        )
        .route("/api/events", get(events_stream))
        .layer(middleware::from_fn_with_state(state.clone(), guard))
        .with_state(state)
}

/// Serve the coordinator API on an already-bound listener.
pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "HTTP coordinator listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Bearer auth (liveness probe excepted) plus CORS response headers.
async fn guard(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let open_route = request.uri().path() == "/api/health";
    if !open_route {
        if let Some(key) = &state.api_key {
            let expected = format!("Bearer {key}");
            let authorized = request
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .map(|value| value == expected)
                .unwrap_or(false);
            if !authorized {
                return ApiError(MnemoError::Unauthorized(
                    "missing or invalid bearer token".into(),
                ))
                .into_response();
            }
        }
    }

    let mut response = next.run(request).await;
    if let Ok(origin) = HeaderValue::from_str(&state.cors_origin) {
        response
            .headers_mut()
            .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    }
    response
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "version": crate::VERSION }))
}

async fn health_detailed(State(state): State<AppState>) -> ApiResult<crate::types::StorageStats> {
    Ok(Json(state.service.check_database_health().await?))
}

async fn store_memory(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Json(request): Json<StoreMemoryRequest>,
) -> ApiResult<crate::service::StoreMemoryResponse> {
    let header_hostname = headers
        .get(CLIENT_HOSTNAME_HEADER)
        .and_then(|value| value.to_str().ok());
    Ok(Json(
        state.service.store_memory(request, header_hostname).await?,
    ))
}

/// Query parameters for the listing endpoint
#[derive(Debug, Deserialize)]
struct ListParams {
    page: Option<usize>,
    page_size: Option<usize>,
    tag: Option<String>,
    #[serde(rename = "type")]
    memory_type: Option<String>,
}

async fn list_memories(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<crate::service::ListMemoriesResponse> {
    let defaults = ListMemoriesRequest::default();
    let request = ListMemoriesRequest {
        page: params.page.unwrap_or(defaults.page),
        page_size: params.page_size.unwrap_or(defaults.page_size),
        tag: params.tag,
        memory_type: params.memory_type,
    };
    Ok(Json(state.service.list_memories(request).await?))
}

async fn get_memory(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> ApiResult<crate::types::Memory> {
    Ok(Json(state.service.get_memory(&hash).await?))
}

async fn delete_memory(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> ApiResult<crate::service::DeleteMemoryResponse> {
    Ok(Json(state.service.delete_memory(&hash).await?))
}

#[derive(Debug, Deserialize)]
struct UpdateBody {
    #[serde(default)]
    metadata: Option<std::collections::HashMap<String, serde_json::Value>>,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    memory_type: Option<String>,
}

async fn update_memory(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    Json(body): Json<UpdateBody>,
) -> ApiResult<crate::service::UpdateMemoryMetadataResponse> {
    let request = UpdateMemoryMetadataRequest {
        content_hash: hash,
        metadata: body.metadata,
        tags: body.tags,
        memory_type: body.memory_type,
    };
    Ok(Json(state.service.update_memory_metadata(request).await?))
}

async fn delete_by_tag(
    State(state): State<AppState>,
    Json(request): Json<DeleteByTagRequest>,
) -> ApiResult<crate::service::DeleteByTagResponse> {
    Ok(Json(state.service.delete_by_tag(request).await?))
}

async fn delete_by_time(
    State(state): State<AppState>,
    Json(request): Json<DeleteByTimeRangeRequest>,
) -> ApiResult<crate::service::DeleteByTimeRangeResponse> {
    Ok(Json(state.service.delete_by_time_range(request).await?))
}

async fn search(
    State(state): State<AppState>,
    Json(request): Json<RetrieveMemoryRequest>,
) -> ApiResult<crate::service::RetrieveMemoryResponse> {
    Ok(Json(state.service.retrieve_memory(request).await?))
}

async fn search_by_tag(
    State(state): State<AppState>,
    Json(request): Json<SearchByTagRequest>,
) -> ApiResult<crate::service::SearchByTagResponse> {
    Ok(Json(state.service.search_by_tag(request).await?))
}

async fn search_by_time(
    State(state): State<AppState>,
    Json(request): Json<SearchByTimeRequest>,
) -> ApiResult<crate::service::SearchByTimeResponse> {
    Ok(Json(state.service.search_by_time(request).await?))
}

async fn search_similar(
    State(state): State<AppState>,
    Json(request): Json<SearchSimilarRequest>,
) -> ApiResult<crate::service::SearchSimilarResponse> {
    Ok(Json(state.service.search_similar(request).await?))
}

async fn list_tags(State(state): State<AppState>) -> ApiResult<crate::service::ListTagsResponse> {
    Ok(Json(state.service.list_tags().await?))
}

async fn cleanup_duplicates(State(state): State<AppState>) -> ApiResult<serde_json::Value> {
    let count = state.service.cleanup_duplicates().await?;
    Ok(Json(json!({ "count": count })))
}

/// Change feed with heartbeats at the configured interval.
async fn events_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let receiver = state.events.subscribe();
    let stream = BroadcastStream::new(receiver).filter_map(|item| async move {
        match item {
            Ok(event) => Event::default()
                .event(event.event.clone())
                .json_data(&event)
                .ok()
                .map(Ok),
            // Lagged subscribers skip missed events rather than erroring
            Err(_) => None,
        }
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(state.heartbeat)
            .text("heartbeat"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingConfig;
    use crate::embedding::{EmbeddingHandle, HashedEmbedder};
    use crate::storage::SqliteVecStorage;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    async fn test_state(api_key: Option<String>) -> AppState {
        let provider = Arc::new(HashedEmbedder::new(64));
        let handle = EmbeddingHandle::new(provider, &EmbeddingConfig::default());
        let storage = Arc::new(SqliteVecStorage::open_in_memory(handle).unwrap());
        let events = EventBroadcaster::new();
        let service = Arc::new(
            MemoryService::new(storage, false).with_events(events.clone()),
        );
        service.initialize().await.unwrap();
        AppState {
            service,
            events,
            api_key,
            heartbeat: Duration::from_secs(30),
            cors_origin: "*".into(),
        }
    }

    #[tokio::test]
    async fn health_is_open() {
        let app = router(test_state(Some("secret".into())).await);
        let response = app
            .oneshot(
                HttpRequest::get("/api/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_token_is_unauthorized() {
        let app = router(test_state(Some("secret".into())).await);
        let response = app
            .oneshot(
                HttpRequest::get("/api/health/detailed")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn bearer_token_grants_access() {
        let app = router(test_state(Some("secret".into())).await);
        let response = app
            .oneshot(
                HttpRequest::get("/api/health/detailed")
                    .header(header::AUTHORIZATION, "Bearer secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn store_then_fetch_over_http() {
        let app = router(test_state(None).await);

        let response = app
            .clone()
            .oneshot(
                HttpRequest::post("/api/memories")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"content": "stored over http"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let stored: crate::service::StoreMemoryResponse =
            serde_json::from_slice(&bytes).unwrap();
        assert!(stored.stored);

        let response = app
            .oneshot(
                HttpRequest::get(format!("/api/memories/{}", stored.content_hash))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_hash_is_404_with_kind() {
        let app = router(test_state(None).await);
        let response = app
            .oneshot(
                HttpRequest::get("/api/memories/deadbeef")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: ErrorBody = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body.error.kind, "not_found");
    }

    #[tokio::test]
    async fn invalid_time_query_is_400() {
        let app = router(test_state(None).await);
        let response = app
            .oneshot(
                HttpRequest::post("/api/search/by-time")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"query": "whenever"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
