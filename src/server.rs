//! HTTP API server.
//!
//! Exposes the engine over JSON HTTP: knowledge-base and document
//! management, task polling, conversations, and course generation.
//! Document ingestion is asynchronous; uploads return `202 Accepted`
//! with a task id to poll. Conversation turns and course runs stream
//! newline-delimited JSON events over the response body.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "document 7 not found" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `conflict` (409),
//! `internal` (500).

use axum::{
    body::Body,
    extract::{Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::chat::ChatAgent;
use crate::config::Config;
use crate::course::CourseGenerator;
use crate::embedding::create_embedder;
use crate::error::EngineError;
use crate::extract::ExtractorRegistry;
use crate::jobs::JobQueue;
use crate::llm::OpenAiChat;
use crate::models::{Conversation, Document, KnowledgeBase, Lesson, Message};
use crate::pipeline::{process_document, PipelineDeps};
use crate::retrieval::RetrievalTool;
use crate::store::Store;
use crate::transport::{ChannelTransport, TransportEvent};
use crate::vector_index::QdrantIndex;

/// Shared state for all route handlers.
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    store: Store,
    jobs: JobQueue,
    pipeline: PipelineDeps,
    chat: Arc<ChatAgent>,
    courses: Arc<CourseGenerator>,
}

/// Starts the API server on `[server].bind` and runs until the process
/// is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = crate::db::connect(&config.db.path).await?;
    crate::migrate::run_migrations(&pool).await?;
    let store = Store::new(pool);

    let embedder: Arc<dyn crate::embedding::Embedder> =
        Arc::from(create_embedder(&config.embedding)?);
    let index = Arc::new(QdrantIndex::connect(&config.vector_store.url)?);
    let registry = Arc::new(ExtractorRegistry::with_defaults(&config.media));
    let retrieval = Arc::new(RetrievalTool::new(
        embedder.clone(),
        index.clone(),
        config.retrieval.top_k as usize,
    ));
    let llm: Arc<dyn crate::llm::LlmClient> = Arc::new(OpenAiChat::new(&config.llm)?);

    let state = AppState {
        config: Arc::new(config.clone()),
        store: store.clone(),
        jobs: JobQueue::new(),
        pipeline: PipelineDeps {
            store: store.clone(),
            registry,
            embedder,
            index,
            chunking: config.chunking.clone(),
        },
        chat: Arc::new(ChatAgent::new(store.clone(), llm.clone(), retrieval.clone())),
        courses: Arc::new(CourseGenerator::new(
            store,
            llm,
            retrieval,
            config.course.clone(),
        )),
    };

    tokio::fs::create_dir_all(&config.storage.upload_dir).await?;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = router(state).layer(cors);

    let bind_addr = config.server.bind.clone();
    tracing::info!(%bind_addr, "API server listening");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/knowledge_bases", post(handle_create_knowledge_base))
        .route("/knowledge_bases/{id}", get(handle_get_knowledge_base))
        .route(
            "/knowledge_bases/{id}/documents",
            post(handle_upload_document),
        )
        .route("/knowledge_bases/{id}/lessons", get(handle_list_lessons))
        .route("/knowledge_bases/{id}/courses", post(handle_generate_course))
        .route("/documents/{id}/status", get(handle_document_status))
        .route("/tasks/{id}", get(handle_task_status))
        .route("/conversations", post(handle_create_conversation))
        .route(
            "/conversations/{id}/messages",
            get(handle_list_messages).post(handle_send_message),
        )
        .route("/health", get(handle_health))
        .with_state(state)
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

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        let (status, code) = match &err {
            EngineError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            EngineError::InvalidStateTransition(_) => (StatusCode::CONFLICT, "conflict"),
            EngineError::IndexNotInitialized(_) => (StatusCode::CONFLICT, "conflict"),
            EngineError::Config(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        AppError {
            status,
            code: code.to_string(),
            message: err.to_string(),
        }
    }
}

// ============ Knowledge bases ============

#[derive(Deserialize)]
struct CreateKnowledgeBaseRequest {
    name: String,
    #[serde(default)]
    description: Option<String>,
}

async fn handle_create_knowledge_base(
    State(state): State<AppState>,
    Json(request): Json<CreateKnowledgeBaseRequest>,
) -> Result<(StatusCode, Json<KnowledgeBase>), AppError> {
    if request.name.trim().is_empty() {
        return Err(bad_request("name must not be empty"));
    }
    let kb = state
        .store
        .create_knowledge_base(request.name.trim(), request.description.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(kb)))
}

async fn handle_get_knowledge_base(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<KnowledgeBase>, AppError> {
    Ok(Json(state.store.get_knowledge_base(id).await?))
}

// ============ Documents and ingestion ============

#[derive(Serialize)]
struct UploadResponse {
    document_id: i64,
    task_id: String,
}

async fn handle_upload_document(
    State(state): State<AppState>,
    Path(kb_id): Path<i64>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), AppError> {
    let mut saved: Option<(String, std::path::PathBuf)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("bad multipart body: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field
            .file_name()
            .map(sanitize_file_name)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| bad_request("file field needs a filename"))?;
        let bytes = field
            .bytes()
            .await
            .map_err(|e| bad_request(format!("failed to read upload: {e}")))?;

        let stored_path = state
            .config
            .storage
            .upload_dir
            .join(format!("{}_{}", Uuid::new_v4(), file_name));
        tokio::fs::write(&stored_path, &bytes)
            .await
            .map_err(EngineError::from)?;
        saved = Some((file_name, stored_path));
        break;
    }

    let (file_name, stored_path) =
        saved.ok_or_else(|| bad_request("multipart body needs a 'file' field"))?;

    let kind = crate::classify::classify(&stored_path);
    let document = state
        .store
        .create_document(kb_id, &file_name, kind, &stored_path.to_string_lossy())
        .await?;

    let task_id = submit_ingest(&state, document.id);
    state.store.set_document_task(document.id, &task_id).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(UploadResponse {
            document_id: document.id,
            task_id,
        }),
    ))
}

fn submit_ingest(state: &AppState, document_id: i64) -> String {
    let deps = state.pipeline.clone();
    let handle = state.jobs.submit(move |progress| async move {
        let summary = process_document(&deps, document_id, &progress).await?;
        serde_json::to_value(summary).map_err(|e| EngineError::Generation(e.to_string()))
    });
    handle.0
}

/// Strips any path components a client smuggles into the filename.
fn sanitize_file_name(name: &str) -> String {
    std::path::Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[derive(Serialize)]
struct DocumentStatusResponse {
    id: i64,
    knowledge_base_id: i64,
    file_name: String,
    kind: String,
    status: String,
    error: Option<String>,
    task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    progress: Option<crate::jobs::Progress>,
}

async fn handle_document_status(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<DocumentStatusResponse>, AppError> {
    let document: Document = state.store.get_document(id).await?;

    // While the ingest job is live its chunk counters ride along
    let progress = document
        .task_id
        .as_deref()
        .and_then(|task_id| state.jobs.poll_id(task_id))
        .and_then(|job| match job {
            crate::jobs::JobState::InProgress { progress } => progress,
            _ => None,
        });

    Ok(Json(DocumentStatusResponse {
        id: document.id,
        knowledge_base_id: document.knowledge_base_id,
        file_name: document.file_name,
        kind: document.kind,
        status: document.status,
        error: document.error,
        task_id: document.task_id,
        progress,
    }))
}

async fn handle_task_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<crate::jobs::JobState>, AppError> {
    state
        .jobs
        .poll_id(&id)
        .map(Json)
        .ok_or_else(|| EngineError::NotFound(format!("task {id} not found")).into())
}

// ============ Conversations ============

#[derive(Deserialize)]
struct CreateConversationRequest {
    knowledge_base_id: i64,
}

async fn handle_create_conversation(
    State(state): State<AppState>,
    Json(request): Json<CreateConversationRequest>,
) -> Result<(StatusCode, Json<Conversation>), AppError> {
    let conversation = state
        .store
        .create_conversation(request.knowledge_base_id)
        .await?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

async fn handle_list_messages(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<Message>>, AppError> {
    state.store.get_conversation(id).await?;
    Ok(Json(state.store.list_messages(id).await?))
}

#[derive(Deserialize)]
struct SendMessageRequest {
    content: String,
}

async fn handle_send_message(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<SendMessageRequest>,
) -> Result<Response, AppError> {
    if request.content.trim().is_empty() {
        return Err(bad_request("content must not be empty"));
    }
    // Surface a bad conversation id as a plain 404 before streaming starts
    state.store.get_conversation(id).await?;

    let (transport, rx) = ChannelTransport::pair(32);
    let chat = state.chat.clone();
    let content = request.content;
    tokio::spawn(async move {
        let _ = chat.run_turn(id, &content, &transport).await;
    });

    Ok(ndjson_response(rx))
}

// ============ Courses ============

#[derive(Deserialize)]
struct GenerateCourseRequest {
    topic: String,
}

async fn handle_generate_course(
    State(state): State<AppState>,
    Path(kb_id): Path<i64>,
    Json(request): Json<GenerateCourseRequest>,
) -> Result<Response, AppError> {
    if request.topic.trim().is_empty() {
        return Err(bad_request("topic must not be empty"));
    }
    state.store.get_knowledge_base(kb_id).await?;

    let (transport, rx) = ChannelTransport::pair(32);
    let courses = state.courses.clone();
    let topic = request.topic;
    tokio::spawn(async move {
        let _ = courses.generate(kb_id, &topic, &transport).await;
    });

    Ok(ndjson_response(rx))
}

async fn handle_list_lessons(
    State(state): State<AppState>,
    Path(kb_id): Path<i64>,
) -> Result<Json<Vec<Lesson>>, AppError> {
    state.store.get_knowledge_base(kb_id).await?;
    Ok(Json(state.store.list_lessons(kb_id).await?))
}

/// Bridge a transport receiver onto a newline-delimited JSON body.
fn ndjson_response(rx: tokio::sync::mpsc::Receiver<TransportEvent>) -> Response {
    let stream = ReceiverStream::new(rx).map(|event| {
        let mut line = serde_json::to_string(&event).unwrap_or_else(|_| {
            "{\"type\":\"error\",\"message\":\"unserializable event\"}".to_string()
        });
        line.push('\n');
        Ok::<_, std::convert::Infallible>(line)
    });

    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(stream),
    )
        .into_response()
}

// ============ Health ============

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
