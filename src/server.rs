use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::assembler::ConversationAssembler;
use crate::capture::{CaptureHandle, CapturePipeline, DirectoryGallery};
use crate::chat::{AttachmentPolicy, ChatService, ChatTurn};
use crate::config::AppConfig;
use crate::events::{parse_event_block, EventBlock};
use crate::runtime::{ModelGateway, ModelRuntime, RuntimeState};
use crate::session::{ChatSession, ScreenshotEntry};
use crate::storage::{ScreenshotRepository, SessionRepository, SqliteStore};
use crate::writer::SessionWriter;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SqliteStore>,
    pub writer: Arc<SessionWriter>,
    pub chat: Arc<ChatService>,
    pub gateway: Arc<ModelGateway>,
    pub capture: Arc<CapturePipeline>,
    pub capture_handle: CaptureHandle,
}

impl AppState {
    /// Wires the store, gateway, chat flow and screenshot pipeline together and
    /// starts the pipeline's signal loop.
    pub async fn build(cfg: &AppConfig, runtime: Arc<dyn ModelRuntime>) -> anyhow::Result<Self> {
        let store = Arc::new(SqliteStore::initialize(cfg.database_url.clone()).await?);
        let gateway = Arc::new(ModelGateway::new(runtime, cfg.model.clone()).with_defaults(cfg.generation));
        let writer = Arc::new(SessionWriter::new(store.clone()));
        let chat = ChatService::new(writer.clone(), ConversationAssembler::new(gateway.clone(), cfg.history_window))
            .with_attachments(AttachmentPolicy {
                out_dir: cfg.cache_dir.join("attachments"),
                max_width: cfg.image_max_width,
                quality: cfg.image_quality,
            })
            .with_params(cfg.generation);
        let gallery = cfg.gallery_dir.clone().unwrap_or_else(|| cfg.cache_dir.join("gallery"));
        let capture = Arc::new(
            CapturePipeline::new(
                Arc::new(DirectoryGallery::new(gallery)),
                gateway.clone(),
                store.clone(),
                cfg.cache_dir.join("screenshots"),
            )
            .with_delay(Duration::from_millis(cfg.capture_delay_ms)),
        );
        let (capture_handle, _task) = capture.clone().spawn();
        Ok(Self { store, writer, chat: Arc::new(chat), gateway, capture, capture_handle })
    }
}

#[derive(Debug, Serialize)]
struct ListSessionsResponse {
    sessions: Vec<ChatSession>,
}

#[derive(Debug, Default, Deserialize)]
struct ListSessionsQuery {
    q: Option<String>,
}

async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<ListSessionsQuery>,
) -> Json<ListSessionsResponse> {
    let sessions = match query.q.as_deref() {
        Some(q) => state.store.search_sessions(q).await,
        None => state.store.list_sessions().await,
    };
    Json(ListSessionsResponse { sessions })
}

async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<ChatSession>, StatusCode> {
    state.store.get_session(&id).await.map(Json).ok_or(StatusCode::NOT_FOUND)
}

#[derive(Debug, Deserialize)]
struct DeleteSessionsBody {
    ids: Vec<String>,
}

async fn delete_sessions(State(state): State<AppState>, Json(body): Json<DeleteSessionsBody>) -> StatusCode {
    let ids: HashSet<String> = body.ids.into_iter().collect();
    state.writer.delete(&ids).await;
    StatusCode::NO_CONTENT
}

async fn toggle_pin(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    state.writer.toggle_pin(&id).await;
    StatusCode::NO_CONTENT
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageBody {
    session_id: Option<String>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    images: Vec<String>,
}

async fn send_message(
    State(state): State<AppState>,
    Json(body): Json<SendMessageBody>,
) -> Result<Json<ChatTurn>, (StatusCode, String)> {
    state
        .chat
        .send(body.session_id.as_deref(), &body.message, body.images)
        .await
        .map(Json)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))
}

#[derive(Debug, Serialize)]
struct ListScreenshotsResponse {
    screenshots: Vec<ScreenshotEntry>,
}

async fn list_screenshots(State(state): State<AppState>) -> Json<ListScreenshotsResponse> {
    Json(ListScreenshotsResponse { screenshots: state.store.list_screenshots().await })
}

#[derive(Debug, Serialize)]
struct ScreenshotDetail {
    #[serde(flatten)]
    entry: ScreenshotEntry,
    event: Option<EventBlock>,
}

async fn get_screenshot(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ScreenshotDetail>, StatusCode> {
    let entry = state.store.get_screenshot(&id).await.ok_or(StatusCode::NOT_FOUND)?;
    let event = parse_event_block(&entry.summary);
    Ok(Json(ScreenshotDetail { entry, event }))
}

async fn summarize_screenshot(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ScreenshotEntry>, (StatusCode, String)> {
    match state.capture.summarize_by_id(&id).await {
        Ok(Some(entry)) => Ok(Json(entry)),
        Ok(None) => Err((StatusCode::NOT_FOUND, format!("no gallery asset {id}"))),
        Err(e) => {
            warn!(asset_id = %id, error = %e, "summarization failed");
            Err((StatusCode::INTERNAL_SERVER_ERROR, "Failed to summarize image.".into()))
        }
    }
}

async fn screenshot_signal(State(state): State<AppState>) -> StatusCode {
    if state.capture_handle.signal() { StatusCode::ACCEPTED } else { StatusCode::SERVICE_UNAVAILABLE }
}

#[derive(Debug, Serialize)]
struct RuntimeStatusResponse {
    model: String,
    state: RuntimeState,
}

async fn runtime_status(State(state): State<AppState>) -> Json<RuntimeStatusResponse> {
    Json(RuntimeStatusResponse { model: state.gateway.model().to_string(), state: state.gateway.state() })
}

async fn prepare_runtime(State(state): State<AppState>) -> StatusCode {
    let gateway = state.gateway.clone();
    tokio::spawn(async move {
        if let Err(e) = gateway.ensure_ready().await {
            warn!(error = %e, "model prefetch failed");
        }
    });
    StatusCode::ACCEPTED
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/sessions", get(list_sessions))
        .route("/v1/sessions/delete", post(delete_sessions))
        .route("/v1/sessions/:id", get(get_session))
        .route("/v1/sessions/:id/pin", post(toggle_pin))
        .route("/v1/chat", post(send_message))
        .route("/v1/screenshots", get(list_screenshots))
        .route("/v1/screenshots/signal", post(screenshot_signal))
        .route("/v1/screenshots/:id", get(get_screenshot))
        .route("/v1/screenshots/:id/summarize", post(summarize_screenshot))
        .route("/v1/runtime", get(runtime_status))
        .route("/v1/runtime/prepare", post(prepare_runtime))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
