use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::IntoResponse,
    routing::{delete, get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::task;
use tracing::{debug, error, info, warn};

use crate::artifact::{ArtifactStore, to_plain_text, to_srt};
use crate::events::EventHub;
use crate::orchestrator::{Orchestrator, SubmitOutcome};
use crate::store::{JobStatus, ListFilter, Store, normalize_tags};
use crate::summarizer::{SummarizeError, Summarizer, SummaryRequest};
use crate::tagconfig::{ConfigOverrides, TagConfig, TagConfigStore};

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub artifacts: Arc<ArtifactStore>,
    pub orchestrator: Arc<Orchestrator>,
    pub summarizer: Arc<Summarizer>,
    pub tag_configs: TagConfigStore,
    pub events: Arc<EventHub>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn bad_gateway(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(json!({ "detail": self.message }))).into_response()
    }
}

/// Build the full API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/transcribe", post(transcribe_handler))
        .route("/api/transcriptions", get(list_transcriptions_handler))
        .route(
            "/api/transcriptions/:id",
            get(get_transcription_handler)
                .patch(patch_transcription_handler)
                .delete(delete_transcription_handler),
        )
        .route(
            "/api/transcriptions/:id/export/:format",
            get(export_transcription_handler),
        )
        .route("/api/tags", get(tags_in_use_handler))
        .route("/api/tags/:name", get(tag_detail_handler))
        .route(
            "/api/summaries",
            post(create_summary_handler).get(list_summaries_handler),
        )
        .route(
            "/api/summaries/:id",
            get(get_summary_handler).delete(delete_summary_handler),
        )
        .route("/api/summaries/:id/export/:format", get(export_summary_handler))
        .route(
            "/api/config/tags",
            get(get_tag_configs_handler).put(put_tag_configs_handler),
        )
        .route(
            "/api/config/tags/:name",
            post(upsert_tag_config_handler)
                .put(upsert_tag_config_handler)
                .delete(delete_tag_config_handler),
        )
        .route(
            "/api/config/secrets",
            get(list_secrets_handler).post(set_secret_handler),
        )
        .route("/api/config/secrets/:name", delete(delete_secret_handler))
        .route("/api/episode-sources", post(create_episode_source_handler))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

/// Wait for ctrl-c; used by both binaries for graceful shutdown.
pub async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

#[derive(Debug, Deserialize)]
struct TranscribeRequest {
    url: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    source_context: Option<String>,
}

async fn transcribe_handler(
    State(state): State<AppState>,
    Json(payload): Json<TranscribeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state
        .orchestrator
        .submit(&payload.url, &payload.tags, payload.source_context)
        .await
        .map_err(|err| ApiError::bad_request(err.to_string()))?;

    match outcome {
        SubmitOutcome::Accepted(record) => Ok((StatusCode::ACCEPTED, Json(json!(record)))),
        SubmitOutcome::Duplicate(existing_id) => Ok((
            StatusCode::CONFLICT,
            Json(json!({
                "detail": "this URL has already been submitted",
                "existing_id": existing_id,
            })),
        )),
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    skip: i64,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    search: Option<String>,
    #[serde(default)]
    tag: Option<String>,
}

fn default_limit() -> i64 {
    50
}

async fn list_transcriptions_handler(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let status = match &query.status {
        Some(raw) => Some(
            JobStatus::parse(raw)
                .ok_or_else(|| ApiError::bad_request(format!("unknown status '{raw}'")))?,
        ),
        None => None,
    };
    let filter = ListFilter {
        skip: query.skip,
        limit: query.limit,
        status,
        tag: query.tag.clone(),
        search: query.search.clone(),
    };

    let store = Arc::clone(&state.store);
    let page = task::spawn_blocking(move || store.list(&filter))
        .await
        .map_err(internal_panic)?
        .map_err(internal_error)?;
    Ok(Json(json!(page)))
}

async fn get_transcription_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let store = Arc::clone(&state.store);
    let lookup_id = id.clone();
    let record = task::spawn_blocking(move || store.get(&lookup_id))
        .await
        .map_err(internal_panic)?
        .map_err(internal_error)?
        .ok_or_else(|| ApiError::not_found(format!("transcription '{id}' not found")))?;
    Ok(Json(json!(record)))
}

#[derive(Debug, Deserialize)]
struct PatchTagsRequest {
    tags: Vec<String>,
}

async fn patch_transcription_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<PatchTagsRequest>,
) -> Result<Json<Value>, ApiError> {
    let tags =
        normalize_tags(&payload.tags).map_err(|err| ApiError::bad_request(err.to_string()))?;
    let store = Arc::clone(&state.store);
    let lookup_id = id.clone();
    let record = task::spawn_blocking(move || store.replace_tags(&lookup_id, &tags))
        .await
        .map_err(internal_panic)?
        .map_err(internal_error)?
        .ok_or_else(|| ApiError::not_found(format!("transcription '{id}' not found")))?;
    Ok(Json(json!(record)))
}

async fn delete_transcription_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let store = Arc::clone(&state.store);
    let lookup_id = id.clone();
    let record = task::spawn_blocking(move || store.delete(&lookup_id))
        .await
        .map_err(internal_panic)?
        .map_err(internal_error)?
        .ok_or_else(|| ApiError::not_found(format!("transcription '{id}' not found")))?;

    if let Some(audio_path) = &record.audio_path {
        match std::fs::remove_file(audio_path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(id = %record.id, error = %err, "failed to remove cached audio"),
        }
    }
    let artifacts = Arc::clone(&state.artifacts);
    let artifact_id = record.id.clone();
    let removed = task::spawn_blocking(move || artifacts.delete(&artifact_id))
        .await
        .map_err(internal_panic)?;
    if let Err(err) = removed {
        warn!(id = %record.id, error = %err, "failed to remove artifact");
    }
    info!(id = %record.id, "deleted transcription");
    Ok(StatusCode::NO_CONTENT)
}

async fn export_transcription_handler(
    State(state): State<AppState>,
    Path((id, format)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    if !matches!(format.as_str(), "txt" | "srt" | "json") {
        return Err(ApiError::bad_request(format!(
            "unsupported export format '{format}'"
        )));
    }

    let store = Arc::clone(&state.store);
    let lookup_id = id.clone();
    let record = task::spawn_blocking(move || store.get(&lookup_id))
        .await
        .map_err(internal_panic)?
        .map_err(internal_error)?
        .ok_or_else(|| ApiError::not_found(format!("transcription '{id}' not found")))?;
    if record.status != JobStatus::Completed {
        return Err(ApiError::bad_request(format!(
            "transcription '{id}' is not completed"
        )));
    }

    let artifacts = Arc::clone(&state.artifacts);
    let artifact_id = id.clone();
    let (body, content_type) = match format.as_str() {
        "json" => {
            let raw = task::spawn_blocking(move || artifacts.load_raw(&artifact_id))
                .await
                .map_err(internal_panic)?
                .map_err(internal_error)?
                .ok_or_else(|| ApiError::not_found(format!("artifact for '{id}' not found")))?;
            (raw, "application/json")
        }
        other => {
            let artifact = task::spawn_blocking(move || artifacts.load(&artifact_id))
                .await
                .map_err(internal_panic)?
                .map_err(internal_error)?
                .ok_or_else(|| ApiError::not_found(format!("artifact for '{id}' not found")))?;
            let rendered = if other == "srt" {
                to_srt(&artifact.transcription.segments)
            } else {
                to_plain_text(&artifact.transcription.segments)
            };
            (rendered, "text/plain; charset=utf-8")
        }
    };

    Ok(attachment_response(
        &format!("{}.{format}", record.id),
        content_type,
        body,
    ))
}

async fn tags_in_use_handler(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let store = Arc::clone(&state.store);
    let tags = task::spawn_blocking(move || store.tags_in_use())
        .await
        .map_err(internal_panic)?
        .map_err(internal_error)?;
    Ok(Json(json!({ "tags": tags })))
}

async fn tag_detail_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let configs = state
        .tag_configs
        .load()
        .map_err(|err| ApiError::internal(err.to_string()))?;
    let config = configs
        .get(&name)
        .ok_or_else(|| ApiError::not_found(format!("tag '{name}' has no configuration")))?;
    Ok(Json(json!({
        "name": name,
        "api_endpoint": config.api_endpoint,
        "model": config.model,
        "api_key_ref": config.api_key_ref,
        "system_prompt": config.system_prompt,
        "destination_emails": config.destination_emails,
    })))
}

#[derive(Debug, Deserialize)]
struct CreateSummaryRequest {
    transcription_id: String,
    #[serde(default)]
    api_endpoint: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    system_prompt: Option<String>,
    #[serde(default)]
    system_prompt_suffix: Option<String>,
}

async fn create_summary_handler(
    State(state): State<AppState>,
    Json(payload): Json<CreateSummaryRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let request = SummaryRequest {
        overrides: ConfigOverrides {
            api_endpoint: payload.api_endpoint,
            model: payload.model,
            api_key: payload.api_key,
            system_prompt: payload.system_prompt,
        },
        system_prompt_suffix: payload.system_prompt_suffix,
    };

    let summary = state
        .summarizer
        .summarize(&payload.transcription_id, request)
        .await
        .map_err(|err| match err {
            SummarizeError::MissingTranscription(_) => ApiError::not_found(err.to_string()),
            SummarizeError::IncompleteTranscription(_) => ApiError::bad_request(err.to_string()),
            SummarizeError::Llm(_) => {
                error!(error = %err, "summary generation failed");
                ApiError::bad_gateway(err.to_string())
            }
            SummarizeError::Internal(_) => {
                error!(error = %err, "summary persistence failed");
                ApiError::internal(err.to_string())
            }
        })?;
    Ok((StatusCode::CREATED, Json(json!(summary))))
}

#[derive(Debug, Deserialize)]
struct SummaryListQuery {
    #[serde(default)]
    transcription_id: Option<String>,
}

async fn list_summaries_handler(
    State(state): State<AppState>,
    Query(query): Query<SummaryListQuery>,
) -> Result<Json<Value>, ApiError> {
    let store = Arc::clone(&state.store);
    let summaries =
        task::spawn_blocking(move || store.list_summaries(query.transcription_id.as_deref()))
            .await
            .map_err(internal_panic)?
            .map_err(internal_error)?;
    Ok(Json(json!({ "summaries": summaries })))
}

async fn get_summary_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let store = Arc::clone(&state.store);
    let lookup_id = id.clone();
    let summary = task::spawn_blocking(move || store.get_summary(&lookup_id))
        .await
        .map_err(internal_panic)?
        .map_err(internal_error)?
        .ok_or_else(|| ApiError::not_found(format!("summary '{id}' not found")))?;
    Ok(Json(json!(summary)))
}

async fn delete_summary_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let store = Arc::clone(&state.store);
    let lookup_id = id.clone();
    let removed = task::spawn_blocking(move || store.delete_summary(&lookup_id))
        .await
        .map_err(internal_panic)?
        .map_err(internal_error)?;
    if !removed {
        return Err(ApiError::not_found(format!("summary '{id}' not found")));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn export_summary_handler(
    State(state): State<AppState>,
    Path((id, format)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    if !matches!(format.as_str(), "txt" | "json") {
        return Err(ApiError::bad_request(format!(
            "unsupported export format '{format}'"
        )));
    }
    let store = Arc::clone(&state.store);
    let lookup_id = id.clone();
    let summary = task::spawn_blocking(move || store.get_summary(&lookup_id))
        .await
        .map_err(internal_panic)?
        .map_err(internal_error)?
        .ok_or_else(|| ApiError::not_found(format!("summary '{id}' not found")))?;

    let (body, content_type) = if format == "json" {
        (
            serde_json::to_string_pretty(&summary)
                .map_err(|err| ApiError::internal(err.to_string()))?,
            "application/json",
        )
    } else {
        (summary.summary_text.clone(), "text/plain; charset=utf-8")
    };
    Ok(attachment_response(
        &format!("{}.{format}", summary.id),
        content_type,
        body,
    ))
}

async fn get_tag_configs_handler(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let configs = state
        .tag_configs
        .load()
        .map_err(|err| ApiError::internal(err.to_string()))?;
    Ok(Json(json!(configs)))
}

async fn put_tag_configs_handler(
    State(state): State<AppState>,
    Json(payload): Json<BTreeMap<String, TagConfig>>,
) -> Result<Json<Value>, ApiError> {
    state
        .tag_configs
        .save(&payload)
        .map_err(|err| ApiError::bad_request(err.to_string()))?;
    Ok(Json(json!(payload)))
}

async fn upsert_tag_config_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(payload): Json<TagConfig>,
) -> Result<Json<Value>, ApiError> {
    state
        .tag_configs
        .upsert(&name, payload.clone())
        .map_err(|err| ApiError::bad_request(err.to_string()))?;
    Ok(Json(json!(payload)))
}

async fn delete_tag_config_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    let removed = state
        .tag_configs
        .remove(&name)
        .map_err(|err| ApiError::bad_request(err.to_string()))?;
    if !removed {
        return Err(ApiError::not_found(format!("tag config '{name}' not found")));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn list_secrets_handler(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let names = state
        .tag_configs
        .secret_names()
        .map_err(|err| ApiError::internal(err.to_string()))?;
    Ok(Json(json!({ "keys": names })))
}

#[derive(Debug, Deserialize)]
struct SetSecretRequest {
    name: String,
    value: String,
}

async fn set_secret_handler(
    State(state): State<AppState>,
    Json(payload): Json<SetSecretRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .tag_configs
        .set_secret(&payload.name, &payload.value)
        .map_err(|err| ApiError::bad_request(err.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_secret_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .tag_configs
        .delete_secret(&name)
        .map_err(|err| ApiError::internal(err.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct CreateEpisodeSourceRequest {
    transcription_id: String,
    source_text: String,
    matched_url: String,
    #[serde(default)]
    email_subject: Option<String>,
    #[serde(default)]
    email_from: Option<String>,
}

async fn create_episode_source_handler(
    State(state): State<AppState>,
    Json(payload): Json<CreateEpisodeSourceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let store = Arc::clone(&state.store);
    let record = task::spawn_blocking(move || {
        let existing = store.get(&payload.transcription_id)?;
        if existing.is_none() {
            return Ok(None);
        }
        store
            .insert_episode_source(
                &payload.transcription_id,
                &payload.source_text,
                &payload.matched_url,
                payload.email_subject.as_deref(),
                payload.email_from.as_deref(),
            )
            .map(Some)
    })
    .await
    .map_err(internal_panic)?
    .map_err(internal_error)?
    .ok_or_else(|| ApiError::not_found("transcription not found"))?;
    Ok((StatusCode::CREATED, Json(json!(record))))
}

async fn ws_handler(State(state): State<AppState>, upgrade: WebSocketUpgrade) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: AppState, mut socket: WebSocket) {
    let (subscriber_id, mut rx) = state.events.subscribe();

    let connected = json!({ "type": "connected" }).to_string();
    if socket.send(Message::Text(connected)).await.is_err() {
        state.events.unsubscribe(subscriber_id);
        return;
    }

    loop {
        tokio::select! {
            broadcast = rx.recv() => {
                match broadcast {
                    Some(message) => {
                        if socket.send(Message::Text(message.to_string())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = client_message_reply(&state, &text).await {
                            if socket.send(Message::Text(reply.to_string())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(error = %err, "websocket receive error");
                        break;
                    }
                }
            }
        }
    }

    state.events.unsubscribe(subscriber_id);
}

/// Handle one client frame: `ping` gets `pong`, `subscribe` gets the
/// current status of the named record.
async fn client_message_reply(state: &AppState, text: &str) -> Option<Value> {
    let message: Value = serde_json::from_str(text).ok()?;
    match message.get("type").and_then(Value::as_str) {
        Some("ping") => Some(json!({ "type": "pong" })),
        Some("subscribe") => {
            let id = message.get("id").and_then(Value::as_str)?.to_string();
            let store = Arc::clone(&state.store);
            let lookup_id = id.clone();
            let record = task::spawn_blocking(move || store.get(&lookup_id))
                .await
                .ok()?
                .ok()?;
            Some(match record {
                Some(record) => EventHub::status_snapshot(&record),
                None => json!({
                    "type": "error",
                    "id": id,
                    "error": "transcription not found",
                }),
            })
        }
        _ => None,
    }
}

fn attachment_response(
    filename: &str,
    content_type: &'static str,
    body: String,
) -> impl IntoResponse + use<> {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    let disposition = format!("attachment; filename=\"{}\"", sanitize_filename(filename));
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    (headers, body)
}

fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_') {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

fn internal_panic(err: tokio::task::JoinError) -> ApiError {
    error!(error = %err, "blocking task panicked");
    ApiError::internal("worker task failed")
}

fn internal_error(err: anyhow::Error) -> ApiError {
    error!(error = %err, "store operation failed");
    ApiError::internal(err.to_string())
}
