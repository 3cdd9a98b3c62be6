use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use index::{
    GraphStore, QueueStats, SearchError, SearchRequest, SearchResponse, SearchService, StoreError,
    TransitionRecord, VectorStore,
};
use ingest::{IntakeRequest, PipelineState};
use pipeline::{IntakeQueue, Metrics, MetricsSnapshot, PipelineError};

#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<IntakeQueue>,
    pub search: Arc<SearchService>,
    pub metrics: Arc<Metrics>,
    pub graph: Arc<dyn GraphStore>,
    pub vectors: Arc<dyn VectorStore>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/process", post(process_document))
        .route("/status/:document_id", get(document_status))
        .route("/status/:document_id/transitions", get(document_transitions))
        .route("/search", post(search_chunks))
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

#[derive(Serialize)]
struct ProcessResponse {
    document_id: String,
    status: PipelineState,
}

#[derive(Serialize)]
struct StatusResponse {
    document_id: String,
    current_state: PipelineState,
    retry_count: u32,
    last_error: Option<String>,
    document_type: Option<String>,
    failed_step: Option<String>,
    updated_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    relational: String,
    graph: String,
    vector: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    queue: Option<QueueStats>,
}

async fn process_document(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IntakeRequest>,
) -> Result<(StatusCode, Json<ProcessResponse>), ApiError> {
    let document = state.queue.enqueue(request).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ProcessResponse {
            document_id: document.document_id,
            status: document.current_state,
        }),
    ))
}

async fn document_status(
    State(state): State<Arc<AppState>>,
    Path(document_id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let document = state
        .queue
        .store()
        .get_document(&document_id)
        .await?
        .ok_or(ApiError::NotFound(document_id))?;

    Ok(Json(StatusResponse {
        document_id: document.document_id,
        current_state: document.current_state,
        retry_count: document.retry_count,
        last_error: document.last_error,
        document_type: document.document_type,
        failed_step: document.failed_step,
        updated_at: document.updated_at,
    }))
}

async fn document_transitions(
    State(state): State<Arc<AppState>>,
    Path(document_id): Path<String>,
) -> Result<Json<Vec<TransitionRecord>>, ApiError> {
    let store = state.queue.store();
    if store.get_document(&document_id).await?.is_none() {
        return Err(ApiError::NotFound(document_id));
    }
    Ok(Json(store.transitions(&document_id).await?))
}

async fn search_chunks(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, ApiError> {
    Ok(Json(state.search.search(&request).await?))
}

async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let (relational, graph, vector, queue) = tokio::join!(
        state.queue.store().ping(),
        state.graph.ping(),
        state.vectors.ping(),
        state.queue.stats(),
    );
    let healthy = relational.is_ok() && graph.is_ok() && vector.is_ok();

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(HealthResponse {
            status: if healthy { "ok" } else { "degraded" },
            relational: describe(relational),
            graph: describe(graph),
            vector: describe(vector),
            queue: queue.ok(),
        }),
    )
}

fn describe(result: Result<(), StoreError>) -> String {
    match result {
        Ok(()) => "ok".to_string(),
        Err(e) => format!("error: {e}"),
    }
}

async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

#[derive(Debug)]
pub enum ApiError {
    Pipeline(PipelineError),
    Search(SearchError),
    Store(StoreError),
    NotFound(String),
}

impl From<PipelineError> for ApiError {
    fn from(inner: PipelineError) -> Self {
        Self::Pipeline(inner)
    }
}

impl From<SearchError> for ApiError {
    fn from(inner: SearchError) -> Self {
        Self::Search(inner)
    }
}

impl From<StoreError> for ApiError {
    fn from(inner: StoreError) -> Self {
        Self::Store(inner)
    }
}

fn unavailable_or_internal(transient: bool) -> StatusCode {
    if transient {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(id) => (StatusCode::NOT_FOUND, format!("document {id} not found")),
            ApiError::Pipeline(e) => {
                let status = match &e {
                    PipelineError::Intake(_) => StatusCode::BAD_REQUEST,
                    PipelineError::Duplicate(_) => StatusCode::CONFLICT,
                    PipelineError::QueueFull { .. } => StatusCode::SERVICE_UNAVAILABLE,
                    PipelineError::Store(s) => unavailable_or_internal(s.is_transient()),
                    PipelineError::Transition(_) | PipelineError::LeaseLost(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, e.to_string())
            }
            ApiError::Search(e) => {
                let status = match &e {
                    SearchError::DeadlineExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
                    SearchError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                    SearchError::Embedding(inner) => unavailable_or_internal(inner.is_transient()),
                    SearchError::Store(inner) => unavailable_or_internal(inner.is_transient()),
                };
                (status, e.to_string())
            }
            ApiError::Store(e) => (unavailable_or_internal(e.is_transient()), e.to_string()),
        };

        if status.is_server_error() {
            error!(status = status.as_u16(), error = %message, "Request failed");
        } else {
            warn!(status = status.as_u16(), error = %message, "Request rejected");
        }
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::http::{Method, Request};
    use index::{Embedder, EmbeddingBackend, EmbeddingError, MemoryGraphStore, MemoryVectorStore};
    use index::SqliteMetadataStore;
    use std::time::Duration;
    use tower::ServiceExt;

    struct Unit;

    #[async_trait]
    impl EmbeddingBackend for Unit {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            Ok(vec![1.0, 0.0])
        }

        fn model_version(&self) -> &str {
            "unit"
        }
    }

    struct Fixture {
        state: AppState,
        graph: Arc<MemoryGraphStore>,
    }

    async fn fixture(depth: usize) -> Fixture {
        let store = Arc::new(SqliteMetadataStore::in_memory().await.unwrap());
        let graph = Arc::new(MemoryGraphStore::new());
        let vectors = Arc::new(MemoryVectorStore::new());
        let embedder = Arc::new(Embedder::new(Arc::new(Unit), None));
        let state = AppState {
            queue: Arc::new(IntakeQueue::new(store.clone(), depth, Duration::from_secs(60))),
            search: Arc::new(SearchService::new(store, vectors.clone(), embedder)),
            metrics: Metrics::new(),
            graph: graph.clone(),
            vectors,
        };
        Fixture { state, graph }
    }

    async fn call(
        state: &AppState,
        method: Method,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let request = match body {
            Some(body) => request.body(Body::from(body.to_string())).unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let response = router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn process_accepts_and_rejects() {
        let f = fixture(10).await;
        let body = json!({"document_id": "doc-1", "tenant_id": "t", "source_path": "/a.txt"});

        let (status, value) = call(&f.state, Method::POST, "/process", Some(body.clone())).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(value, json!({"document_id": "doc-1", "status": "QUEUED"}));

        let (status, _) = call(&f.state, Method::POST, "/process", Some(body)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let bad_priority = json!({"tenant_id": "t", "source_path": "/a.txt", "priority": 11});
        let (status, _) = call(&f.state, Method::POST, "/process", Some(bad_priority)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let no_tenant = json!({"tenant_id": "", "source_path": "/a.txt"});
        let (status, _) = call(&f.state, Method::POST, "/process", Some(no_tenant)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn full_queue_is_service_unavailable() {
        let f = fixture(1).await;
        let first = json!({"tenant_id": "t", "source_path": "/a.txt"});
        let (status, _) = call(&f.state, Method::POST, "/process", Some(first.clone())).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (status, value) = call(&f.state, Method::POST, "/process", Some(first)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(value["error"].as_str().unwrap().contains("full"));
    }

    #[tokio::test]
    async fn status_reports_queued_document() {
        let f = fixture(10).await;
        let (status, _) = call(&f.state, Method::GET, "/status/doc-missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let body = json!({"document_id": "doc-7", "tenant_id": "t", "source_path": "/a.txt"});
        call(&f.state, Method::POST, "/process", Some(body)).await;

        let (status, value) = call(&f.state, Method::GET, "/status/doc-7", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["current_state"], "QUEUED");
        assert_eq!(value["retry_count"], 0);
        assert!(value["last_error"].is_null());

        let (status, value) = call(&f.state, Method::GET, "/status/doc-7/transitions", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value, json!([]));
    }

    #[tokio::test]
    async fn search_validates_and_returns_committed_only() {
        let f = fixture(10).await;
        let (status, value) = call(
            &f.state,
            Method::POST,
            "/search",
            Some(json!({"query": "alice", "tenant_id": "t"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value, json!({"results": []}));

        let (status, _) = call(
            &f.state,
            Method::POST,
            "/search",
            Some(json!({"query": "  ", "tenant_id": "t"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_reflects_store_reachability() {
        let f = fixture(10).await;
        let (status, value) = call(&f.state, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["status"], "ok");
        assert_eq!(value["queue"]["active"], 0);

        f.graph.set_unavailable(true);
        let (status, value) = call(&f.state, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(value["status"], "degraded");
        assert!(value["graph"].as_str().unwrap().starts_with("error"));
        assert_eq!(value["relational"], "ok");
    }

    #[tokio::test]
    async fn metrics_lists_every_stage() {
        let f = fixture(10).await;
        let (status, value) = call(&f.state, Method::GET, "/metrics", None).await;
        assert_eq!(status, StatusCode::OK);
        for stage in ["classifying", "extracting", "chunking", "embedding", "storing"] {
            assert_eq!(value["stages"][stage]["attempts"], 0, "{stage}");
        }
    }
}
