//! HTTP and WebSocket transport.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/upsert` | Ingest PDF files into a collection |
//! | `POST` | `/qna` | Answer a question, buffered into one JSON body |
//! | `POST` | `/query` | Similarity search without the language model |
//! | `DELETE` | `/collections/{name}` | Drop a collection |
//! | `GET` | `/health` | Health check (returns version) |
//! | `GET` | `/ws` | WebSocket session, see below |
//!
//! # Error Contract
//!
//! HTTP failures are a bare `500` with a short text body such as
//! `Error performing QnA`. Details go to the log, not the client. Bodies
//! that do not parse as the expected JSON are rejected by axum's `Json`
//! extractor before reaching a handler.
//!
//! # WebSocket protocol
//!
//! Each connection handles exactly one request:
//!
//! 1. Server sends [`GREETING`].
//! 2. Client sends one JSON text message.
//! 3. Server replies (fragments for `question`, one JSON message for
//!    `upsertContent` and `query`), then sends [`END_SENTINEL`] and closes.
//!
//! Invalid JSON is answered with `Bad request: invalid JSON format. Details: ...`
//! and the connection is closed without a sentinel.
//!
//! Clients identify themselves with `xai-api-key` / `xai-org` headers, or an
//! `apiKey` query parameter. The identity is logged and never enforced.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use anyhow::{bail, Context};
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use futures::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Component, PathBuf};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::collection::UpsertReport;
use crate::config::Config;
use crate::engine::Engine;
use crate::extract::{ExtractionFilter, ExtractionFormat};
use crate::loader::{DocumentLoader, PdfLoader};
use crate::models::{RawContentItem, RetrievedDocument};
use crate::qna::QnaRequest;

/// First message on every WebSocket connection.
pub const GREETING: &str = "WebSocket connection established";

/// Last message before the server closes a WebSocket session.
pub const END_SENTINEL: &str = "~~~END~~~";

#[derive(Clone)]
struct AppState {
    engine: Arc<Engine>,
}

/// Build the engine from `config` and serve until the process is stopped.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let engine = Arc::new(Engine::from_config(config)?);
    serve(engine).await
}

pub async fn serve(engine: Arc<Engine>) -> anyhow::Result<()> {
    let bind_addr = engine.config().server.bind.clone();
    let app = router(engine);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    tracing::info!(addr = %bind_addr, "server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(engine: Arc<Engine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/upsert", post(handle_upsert))
        .route("/qna", post(handle_qna))
        .route("/query", post(handle_query))
        .route("/collections/{name}", delete(handle_clear))
        .route("/health", get(handle_health))
        .route("/ws", get(handle_ws))
        .layer(cors)
        .with_state(AppState { engine })
}

// ============ Error response ============

/// A failed request: logged in full, answered with a bare 500.
struct AppError {
    message: &'static str,
    error: anyhow::Error,
}

impl AppError {
    fn new(message: &'static str, error: impl Into<anyhow::Error>) -> Self {
        Self {
            message,
            error: error.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::error!(error = %format!("{:#}", self.error), "{}", self.message);
        (StatusCode::INTERNAL_SERVER_ERROR, self.message).into_response()
    }
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

// ============ POST /upsert ============

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpsertRequest {
    collection_name: String,
    pdf_files: Vec<String>,
}

const UPSERT_FAILED: &str = "Error upserting vector";

/// Loads every listed PDF (relative to `server.document_root`) and upserts
/// the text under the configured default source.
async fn handle_upsert(
    State(state): State<AppState>,
    Json(req): Json<UpsertRequest>,
) -> Result<&'static str, AppError> {
    let config = state.engine.config();
    let collection = state
        .engine
        .collection(&req.collection_name)
        .map_err(|e| AppError::new(UPSERT_FAILED, e))?;

    let loads = req.pdf_files.iter().map(|file| {
        let root = &config.server.document_root;
        async move {
            let path = resolve_document(root, file)?;
            let mut items = PdfLoader::new(path).load().await?;
            for item in &mut items {
                item.metadata
                    .insert("url".to_string(), serde_json::Value::String(file.clone()));
            }
            anyhow::Ok(items)
        }
    });
    let items: Vec<RawContentItem> = futures::future::try_join_all(loads)
        .await
        .map_err(|e| AppError::new(UPSERT_FAILED, e))?
        .into_iter()
        .flatten()
        .collect();

    let filter = ExtractionFilter::new(
        ExtractionFormat::None,
        config.retrieval.default_source.clone(),
    );
    collection
        .upsert_content(&items, &filter)
        .await
        .map_err(|e| AppError::new(UPSERT_FAILED, e))?;

    Ok("Vector upserted successfully")
}

/// Join a client-supplied path onto `root`. Absolute paths and `..`
/// components are rejected so reads stay under the document root.
fn resolve_document(root: &std::path::Path, file: &str) -> anyhow::Result<PathBuf> {
    let relative = std::path::Path::new(file);
    let confined = relative
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !confined || file.trim().is_empty() {
        bail!("document path escapes the document root: {}", file);
    }
    Ok(root.join(relative))
}

// ============ POST /qna ============

#[derive(Debug, Deserialize)]
struct QnaBody {
    question: String,
    collection: String,
}

#[derive(Serialize)]
struct AnswerResponse {
    answer: String,
}

const QNA_FAILED: &str = "Error performing QnA";

/// Answers against the configured default source, buffering the whole
/// streamed reply.
async fn handle_qna(
    State(state): State<AppState>,
    Json(req): Json<QnaBody>,
) -> Result<Json<AnswerResponse>, AppError> {
    let collection = state
        .engine
        .collection(&req.collection)
        .map_err(|e| AppError::new(QNA_FAILED, e))?;
    let request = QnaRequest::new(req.question)
        .with_source(state.engine.config().retrieval.default_source.clone());

    let answer: String = collection
        .qna(&request)
        .await
        .map_err(|e| AppError::new(QNA_FAILED, e))?
        .collect::<Vec<_>>()
        .await
        .concat();

    Ok(Json(AnswerResponse { answer }))
}

// ============ POST /query ============

#[derive(Debug, Deserialize)]
struct QueryBody {
    query: String,
    collection: String,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    k: Option<usize>,
}

#[derive(Serialize)]
struct QueryResponse {
    results: Vec<RetrievedDocument>,
}

const QUERY_FAILED: &str = "Error performing query";

async fn handle_query(
    State(state): State<AppState>,
    Json(req): Json<QueryBody>,
) -> Result<Json<QueryResponse>, AppError> {
    let collection = state
        .engine
        .collection(&req.collection)
        .map_err(|e| AppError::new(QUERY_FAILED, e))?;
    let k = req.k.unwrap_or(state.engine.config().retrieval.default_k);

    let results = collection
        .query(&req.query, req.source.as_deref(), k)
        .await
        .map_err(|e| AppError::new(QUERY_FAILED, e))?;
    Ok(Json(QueryResponse { results }))
}

// ============ DELETE /collections/{name} ============

#[derive(Serialize)]
struct ClearResponse {
    deleted: bool,
}

const CLEAR_FAILED: &str = "Error clearing collection";

async fn handle_clear(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ClearResponse>, AppError> {
    let collection = state
        .engine
        .collection(&name)
        .map_err(|e| AppError::new(CLEAR_FAILED, e))?;
    let deleted = collection
        .clear()
        .await
        .map_err(|e| AppError::new(CLEAR_FAILED, e))?;
    Ok(Json(ClearResponse { deleted }))
}

// ============ GET /ws ============

/// Who is on the other end of a WebSocket. Informational only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub api_key: String,
    pub org: String,
}

impl ClientIdentity {
    /// Headers win over the `apiKey` query parameter.
    pub fn from_request(headers: &HeaderMap, query: &HashMap<String, String>) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        Self {
            api_key: header("xai-api-key")
                .or_else(|| query.get("apiKey").cloned())
                .unwrap_or_default(),
            org: header("xai-org").unwrap_or_else(|| "anonymous".to_string()),
        }
    }
}

async fn handle_ws(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let identity = ClientIdentity::from_request(&headers, &query);
    ws.on_upgrade(move |socket| handle_socket(socket, state.engine, identity))
}

async fn handle_socket(socket: WebSocket, engine: Arc<Engine>, identity: ClientIdentity) {
    tracing::info!(
        org = %identity.org,
        api_key_present = !identity.api_key.is_empty(),
        "websocket connected"
    );

    let (sink, mut stream) = socket.split();
    let mut out = sink.with(|text: String| {
        futures::future::ready(Ok::<_, axum::Error>(WsMessage::Text(text.into())))
    });

    if out.send(GREETING.to_string()).await.is_err() {
        return;
    }

    while let Some(Ok(message)) = stream.next().await {
        match message {
            WsMessage::Text(text) => {
                run_session(&engine, text.as_str(), &mut out).await;
                break;
            }
            WsMessage::Close(_) => break,
            _ => continue,
        }
    }

    let _ = out.close().await;
    tracing::info!(org = %identity.org, "websocket disconnected");
}

/// One WebSocket request. Every variant is optional on the wire; the first
/// of `question`, `upsertContent`, `query` that is present selects the
/// operation.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequest {
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub min_similarity: Option<f32>,
    #[serde(default, alias = "topKCount")]
    pub k: Option<usize>,
    #[serde(default)]
    pub collection_name: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub additional_instructions: Option<String>,
    #[serde(default)]
    pub upsert_content: Option<Vec<RawContentItem>>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub query: Option<String>,
}

/// Send one message, returning `false` if the client is gone.
async fn send<S>(out: &mut S, text: impl Into<String>) -> bool
where
    S: Sink<String> + Unpin,
{
    out.send(text.into()).await.is_ok()
}

/// Handle the single JSON message of a session, writing replies to `out`.
///
/// Does not send the greeting or close the connection.
pub async fn run_session<S>(engine: &Engine, raw: &str, out: &mut S)
where
    S: Sink<String> + Unpin,
{
    let request: SessionRequest = match serde_json::from_str(raw) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(error = %e, "websocket request is not valid JSON");
            send(out, format!("Bad request: invalid JSON format. Details: {}", e)).await;
            return;
        }
    };

    let has_question = request
        .question
        .as_deref()
        .is_some_and(|q| !q.trim().is_empty());

    if has_question {
        session_qna(engine, request, out).await;
    } else if request.upsert_content.is_some() {
        session_upsert(engine, request, out).await;
    } else if request.query.is_some() {
        session_query(engine, request, out).await;
    } else {
        send(
            out,
            "Bad request: expected one of question, upsertContent or query",
        )
        .await;
        return;
    }

    send(out, END_SENTINEL).await;
}

fn collection_name(request: &SessionRequest) -> anyhow::Result<&str> {
    match request.collection_name.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => Ok(name),
        _ => bail!("collectionName is required"),
    }
}

async fn session_qna<S>(engine: &Engine, request: SessionRequest, out: &mut S)
where
    S: Sink<String> + Unpin,
{
    tracing::info!("performing QnA");
    let answer = async {
        let collection = engine.collection(collection_name(&request)?)?;
        let qna = QnaRequest {
            question: request.question.clone().unwrap_or_default(),
            min_similarity: request.min_similarity,
            k: request.k.unwrap_or(engine.config().retrieval.default_k),
            source: request.source.clone(),
            additional_instructions: request.additional_instructions.clone(),
        };
        anyhow::Ok(collection.qna(&qna).await?)
    }
    .await;

    match answer {
        Ok(mut answer) => {
            while let Some(fragment) = answer.next().await {
                if !send(out, fragment).await {
                    tracing::debug!("client went away mid-answer");
                    return;
                }
            }
            tracing::info!(fragments = answer.fragments(), "QnA done");
        }
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "QnA failed");
            send(out, format!("Error performing QnA: {:#}", e)).await;
        }
    }
}

async fn session_upsert<S>(engine: &Engine, request: SessionRequest, out: &mut S)
where
    S: Sink<String> + Unpin,
{
    let report: anyhow::Result<UpsertReport> = async {
        let collection = engine.collection(collection_name(&request)?)?;
        let format = ExtractionFormat::from_descriptor(
            request.format.as_deref().unwrap_or_default(),
            request.selector.as_deref(),
        );
        let filter = ExtractionFilter::new(format, request.source.clone().unwrap_or_default());
        let items = request.upsert_content.as_deref().unwrap_or_default();
        anyhow::Ok(collection.upsert_content(items, &filter).await?)
    }
    .await;

    let reply = report.and_then(|r| Ok(serde_json::to_string(&r)?));
    match reply {
        Ok(json) => {
            send(out, json).await;
        }
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "upsert failed");
            send(out, format!("Error upserting content: {:#}", e)).await;
        }
    }
}

async fn session_query<S>(engine: &Engine, request: SessionRequest, out: &mut S)
where
    S: Sink<String> + Unpin,
{
    let results: anyhow::Result<Vec<RetrievedDocument>> = async {
        let collection = engine.collection(collection_name(&request)?)?;
        let k = request.k.unwrap_or(engine.config().retrieval.default_k);
        anyhow::Ok(collection
            .query(
                request.query.as_deref().unwrap_or_default(),
                request.source.as_deref(),
                k,
            )
            .await?)
    }
    .await;

    let reply = results.and_then(|results| Ok(serde_json::to_string(&QueryResponse { results })?));
    match reply {
        Ok(json) => {
            send(out, json).await;
        }
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "query failed");
            send(out, format!("Error performing query: {:#}", e)).await;
        }
    }
}
