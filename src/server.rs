//! HTTP shell over the pipeline.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/rag/reply` | `{query}` → `{embedding_status, answer}` |
//! | `POST` | `/send-message` | queue a user message |
//! | `POST` | `/ingest` | queue a document for chunking and embedding |
//! | `GET`  | `/health` | health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "user_id must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `completion_error` (502),
//! `broker_unavailable` (503), `internal` (500).
//!
//! # CORS
//!
//! With `[server].cors_origins` empty, all origins, methods, and headers are
//! permitted; otherwise only the listed origins.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{error, info, warn};

use crate::broker::amqp::AmqpConnector;
use crate::completion::create_completion;
use crate::config::Config;
use crate::embedding::create_embedder;
use crate::error::PipelineError;
use crate::models::{DocumentMessage, UserMessage};
use crate::publisher::Publisher;
use crate::rag::{RagReply, RagService};
use crate::store::open_store;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub rag: Arc<RagService>,
    pub publisher: Arc<Publisher>,
    pub document_queue: String,
    pub user_message_queue: String,
}

/// Build the router with CORS applied.
pub fn router(state: AppState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/rag/reply", post(handle_rag_reply))
        .route("/send-message", post(handle_send_message))
        .route("/ingest", post(handle_ingest))
        .route("/health", get(handle_health))
        .layer(cors_layer(cors_origins))
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        return layer.allow_origin(Any);
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(parsed))
}

/// Starts the HTTP server from configuration.
///
/// Connects the publisher and declares the broker topology before binding,
/// then serves until `shutdown` is cancelled.
pub async fn run_server(config: &Config, shutdown: CancellationToken) -> anyhow::Result<()> {
    let broker_url = config.require_broker()?;
    config.require_embeddings()?;

    let embedder = create_embedder(&config.embedding)?;
    let store = open_store(&config.store).await?;
    let completion = create_completion(&config.completion)?;
    let rag = RagService::from_config(config, embedder, store, completion).await?;

    let publisher = Publisher::new(Arc::new(AmqpConnector::new(broker_url)));
    publisher.bootstrap(&config.broker.topology()).await?;

    let state = AppState {
        rag: Arc::new(rag),
        publisher: Arc::new(publisher),
        document_queue: config.broker.document_queue.clone(),
        user_message_queue: config.broker.user_message_queue.clone(),
    };

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    println!("ragline server listening on http://{}", listener.local_addr()?);

    serve(listener, state, &config.server.cors_origins, shutdown).await
}

/// Serve on an already-bound listener until `shutdown` is cancelled, then
/// close the publisher's connection.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: AppState,
    cors_origins: &[String],
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let publisher = state.publisher.clone();
    let app = router(state, cors_origins);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    if let Err(e) = publisher.close().await {
        warn!(error = %e, "error closing publisher connection");
    }
    info!("server stopped");
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        let (status, code) = match &err {
            PipelineError::Completion(_) => (StatusCode::BAD_GATEWAY, "completion_error"),
            PipelineError::Broker(_) | PipelineError::Topology(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "broker_unavailable")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        error!(error = %err, code, "request failed");
        AppError {
            status,
            code: code.to_string(),
            message: err.to_string(),
        }
    }
}

// ============ POST /rag/reply ============

#[derive(Deserialize)]
struct RagRequest {
    #[serde(default)]
    query: String,
}

async fn handle_rag_reply(
    State(state): State<AppState>,
    Json(request): Json<RagRequest>,
) -> Result<Json<RagReply>, AppError> {
    let reply = state.rag.reply(&request.query).await?;
    Ok(Json(reply))
}

// ============ POST /send-message ============

#[derive(Deserialize)]
struct SendMessageRequest {
    text: String,
    user_id: String,
}

#[derive(Serialize)]
struct QueuedResponse {
    status: &'static str,
}

async fn handle_send_message(
    State(state): State<AppState>,
    Json(request): Json<SendMessageRequest>,
) -> Result<Json<QueuedResponse>, AppError> {
    if request.text.trim().is_empty() {
        return Err(bad_request("text must not be empty"));
    }
    if request.user_id.trim().is_empty() {
        return Err(bad_request("user_id must not be empty"));
    }
    let message = UserMessage::new(request.text, request.user_id);
    state
        .publisher
        .publish(&message, &state.user_message_queue)
        .await?;
    Ok(Json(QueuedResponse {
        status: "Message queued successfully",
    }))
}

// ============ POST /ingest ============

#[derive(Deserialize)]
struct IngestRequest {
    text: String,
    source: String,
}

async fn handle_ingest(
    State(state): State<AppState>,
    Json(request): Json<IngestRequest>,
) -> Result<Json<QueuedResponse>, AppError> {
    if request.text.trim().is_empty() {
        return Err(bad_request("text must not be empty"));
    }
    if request.source.trim().is_empty() {
        return Err(bad_request("source must not be empty"));
    }
    let message = DocumentMessage::new(request.text, request.source);
    state
        .publisher
        .publish(&message, &state.document_queue)
        .await?;
    Ok(Json(QueuedResponse {
        status: "Document queued successfully",
    }))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
