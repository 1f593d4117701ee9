use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::catalog;
use crate::engine::{ChatMessage, TokenCallback};
use crate::probe;
use crate::select::{self, ManualOutcome};
use crate::sse;
use crate::AppState;

const SYSTEM_PROMPT: &str =
    "You are a helpful assistant running entirely on the user's machine. Answer concisely.";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("no model is selected or downloaded; pick a model first")]
    NoModel,
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::NoModel => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

fn internal(e: impl ToString) -> ApiError {
    ApiError::Internal(e.to_string())
}

fn model_name(id: &str) -> String {
    catalog::display_name_for_id(id)
        .map(|n| n.to_string())
        .unwrap_or_else(|| id.to_string())
}

// ── model selection ──

pub async fn models_status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let ram_gb = probe::total_ram_gb();
    let available = catalog::available_models(ram_gb, &state.engine.list_models());
    let selected = state.store.get();
    let selected_name = selected.as_deref().map(model_name);
    Json(json!({
        "selectedModel": selected,
        "selectedModelName": selected_name,
        "available": available,
    }))
}

pub async fn models_available(
    State(state): State<Arc<AppState>>,
) -> Json<Vec<catalog::AvailableModel>> {
    let ram_gb = probe::total_ram_gb();
    Json(catalog::available_models(ram_gb, &state.engine.list_models()))
}

pub async fn models_auto_select(State(state): State<Arc<AppState>>) -> Response {
    let ram_gb = probe::total_ram_gb();
    let (tx, rx) = mpsc::unbounded_channel();
    let engine = state.engine.clone();
    let store = state.store.clone();
    tokio::spawn(async move {
        select::auto_select(engine, store, ram_gb, tx, CancellationToken::new()).await;
    });
    sse::event_stream(rx)
}

#[derive(Debug, Deserialize)]
pub struct SelectRequest {
    model: Option<String>,
}

pub async fn models_select(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SelectRequest>,
) -> Result<Response, ApiError> {
    let raw = request.model.as_deref().map(str::trim).unwrap_or("");
    if raw.is_empty() {
        return Err(ApiError::BadRequest("model is required".to_string()));
    }

    match select::begin_manual_select(state.engine.as_ref(), &state.store, raw)
        .map_err(ApiError::Internal)?
    {
        ManualOutcome::Selected { id, name } => Ok(Json(json!({
            "selectedModel": id,
            "selectedModelName": name,
        }))
        .into_response()),
        ManualOutcome::Download(tier) => {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(select::manual_download(
                state.engine.clone(),
                state.store.clone(),
                tier,
                tx,
            ));
            Ok(sse::event_stream(rx))
        }
        ManualOutcome::Unknown => Err(ApiError::NotFound(format!("unknown model: {raw}"))),
    }
}

pub async fn models_clear(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.store.clear().map_err(ApiError::Internal)?;
    Ok(Json(json!({ "success": true })))
}

// ── chats ──

#[derive(Debug, Deserialize)]
pub struct CreateChatRequest {
    title: Option<String>,
}

pub async fn chats_create(
    State(state): State<Arc<AppState>>,
    request: Option<Json<CreateChatRequest>>,
) -> Result<Json<crate::database::ChatData>, ApiError> {
    let title = request
        .as_ref()
        .and_then(|r| r.title.as_deref())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or("New chat");
    state.db.create_chat(title).map(Json).map_err(internal)
}

pub async fn chats_list(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<crate::database::ChatData>>, ApiError> {
    state.db.list_chats().map(Json).map_err(internal)
}

pub async fn chats_get(
    State(state): State<Arc<AppState>>,
    UrlPath(chat_id): UrlPath<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let chat = state
        .db
        .get_chat(&chat_id)
        .map_err(internal)?
        .ok_or_else(|| ApiError::NotFound(format!("unknown chat: {chat_id}")))?;
    let messages = state.db.get_messages(&chat_id).map_err(internal)?;
    Ok(Json(json!({ "chat": chat, "messages": messages })))
}

pub async fn chats_delete(
    State(state): State<Arc<AppState>>,
    UrlPath(chat_id): UrlPath<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if state.db.get_chat(&chat_id).map_err(internal)?.is_none() {
        return Err(ApiError::NotFound(format!("unknown chat: {chat_id}")));
    }
    state.db.delete_chat(&chat_id).map_err(internal)?;
    Ok(Json(json!({ "success": true })))
}

// ── chat streaming ──

/// In-stream records for a message send: token fragments while generating,
/// or a single error record if the engine gives out. The terminator frame is
/// appended by the transport either way.
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ChatEvent {
    Token { token: String },
    Error { error: String },
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    content: Option<String>,
}

pub async fn chat_send(
    State(state): State<Arc<AppState>>,
    UrlPath(chat_id): UrlPath<String>,
    Json(request): Json<SendMessageRequest>,
) -> Result<Response, ApiError> {
    let content = request.content.as_deref().map(str::trim).unwrap_or("");
    if content.is_empty() {
        return Err(ApiError::BadRequest("content is required".to_string()));
    }
    if state.db.get_chat(&chat_id).map_err(internal)?.is_none() {
        return Err(ApiError::NotFound(format!("unknown chat: {chat_id}")));
    }

    // The selected id is read once here and held for the whole send; a
    // concurrent re-selection affects the next request, not this one.
    let model_path = state
        .store
        .selected_path(state.engine.as_ref())
        .ok_or(ApiError::NoModel)?;

    state.db.add_message(&chat_id, "user", content).map_err(internal)?;
    let history = state.db.get_messages(&chat_id).map_err(internal)?;
    let mut messages = vec![ChatMessage::system(SYSTEM_PROMPT)];
    messages.extend(
        history
            .iter()
            .map(|m| ChatMessage { role: m.role.clone(), content: m.content.clone() }),
    );

    let (tx, rx) = mpsc::unbounded_channel();
    let task_state = state.clone();
    tokio::spawn(async move {
        run_chat_stream(task_state, chat_id, model_path, messages, tx).await;
    });
    Ok(sse::event_stream(rx))
}

async fn run_chat_stream(
    state: Arc<AppState>,
    chat_id: String,
    model_path: PathBuf,
    messages: Vec<ChatMessage>,
    tx: mpsc::UnboundedSender<ChatEvent>,
) {
    let cancel = CancellationToken::new();
    let token_tx = tx.clone();
    let token_cancel = cancel.clone();
    let on_token: TokenCallback = Box::new(move |fragment| {
        // A failed send means the client hung up; stop the engine too.
        if token_tx.send(ChatEvent::Token { token: fragment.to_string() }).is_err() {
            token_cancel.cancel();
        }
    });

    match state
        .engine
        .stream_chat(&model_path, &messages, on_token, cancel.clone())
        .await
    {
        Ok(text) => {
            if text.is_empty() {
                return;
            }
            if let Err(e) = state.db.add_message(&chat_id, "assistant", &text) {
                log::warn!("[chat] failed to persist assistant reply: {e}");
                return;
            }
            spawn_title_task(state, chat_id, model_path);
        }
        Err(e) => {
            log::warn!("[chat] completion failed: {e}");
            let _ = tx.send(ChatEvent::Error { error: e });
        }
    }
}

/// Best-effort title after the first exchange. Detached on purpose: the send
/// that triggered it never waits, and any failure is logged and dropped.
fn spawn_title_task(state: Arc<AppState>, chat_id: String, model_path: PathBuf) {
    tokio::spawn(async move {
        match state.db.count_messages(&chat_id) {
            Ok(2) => {}
            Ok(_) => return,
            Err(e) => {
                log::warn!("[chat] title check failed: {e}");
                return;
            }
        }
        let first_user = match state.db.get_messages(&chat_id) {
            Ok(messages) => messages.into_iter().find(|m| m.role == "user"),
            Err(_) => None,
        };
        let Some(first_user) = first_user else { return };

        let prompt = format!(
            "Write a title of at most five words for a conversation that begins:\n\n{}\n\nReply with the title only.",
            first_user.content
        );
        match state.engine.complete(&model_path, &[ChatMessage::user(prompt)]).await {
            Ok(raw) => {
                let title = clean_title(&raw);
                if title.is_empty() {
                    return;
                }
                if let Err(e) = state.db.update_chat_title(&chat_id, &title) {
                    log::warn!("[chat] failed to save title: {e}");
                }
            }
            Err(e) => log::warn!("[chat] title generation failed: {e}"),
        }
    });
}

/// Reasoning models wrap their scratch work in a think block; only what
/// follows it is usable as a title.
fn strip_think(raw: &str) -> &str {
    match raw.find("</think>") {
        Some(end) => &raw[end + "</think>".len()..],
        None => raw,
    }
}

fn clean_title(raw: &str) -> String {
    let raw = strip_think(raw);
    let line = raw.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    let line = line.trim_matches(|c| c == '"' || c == '\'' || c == '.');
    line.chars().take(60).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── error mapping ──

    #[test]
    fn test_api_error_status_codes() {
        let cases = [
            (ApiError::BadRequest("x".into()), StatusCode::BAD_REQUEST),
            (ApiError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (ApiError::NoModel, StatusCode::SERVICE_UNAVAILABLE),
            (ApiError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, expected) in cases {
            assert_eq!(error.into_response().status(), expected);
        }
    }

    // ── chat event wire shape ──

    #[test]
    fn test_chat_events_serialize_flat() {
        let token = serde_json::to_string(&ChatEvent::Token { token: "hi".into() }).unwrap();
        assert_eq!(token, "{\"token\":\"hi\"}");
        let error = serde_json::to_string(&ChatEvent::Error { error: "boom".into() }).unwrap();
        assert_eq!(error, "{\"error\":\"boom\"}");
    }

    // ── title cleanup ──

    #[test]
    fn test_clean_title_takes_first_line_unquoted() {
        assert_eq!(clean_title("\"Weather in Oslo\"\nextra"), "Weather in Oslo");
        assert_eq!(clean_title("\n\n  Rust questions.  \n"), "Rust questions");
    }

    #[test]
    fn test_clean_title_strips_think_block() {
        let raw = "<think>the user asked about borrowing\nso maybe...</think>\nBorrow checker basics";
        assert_eq!(clean_title(raw), "Borrow checker basics");
    }

    #[test]
    fn test_clean_title_empty_input() {
        assert_eq!(clean_title(""), "");
        assert_eq!(clean_title("<think>only thoughts</think>"), "");
    }

    #[test]
    fn test_clean_title_caps_length() {
        let long = "word ".repeat(40);
        assert!(clean_title(&long).chars().count() <= 60);
    }
}
