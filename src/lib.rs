pub mod catalog;
pub mod config;
pub mod database;
pub mod engine;
pub mod probe;
pub mod routes;
pub mod select;
pub mod sse;
pub mod store;

use axum::routing::{delete, get, post};
use axum::Router;
use std::sync::Arc;

use config::AppConfig;
use database::Database;
use engine::{LlamaServerEngine, LlmEngine};
use store::ModelStore;

pub struct AppState {
    pub db: Arc<Database>,
    pub store: ModelStore,
    pub engine: Arc<dyn LlmEngine>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/models", get(routes::models_status))
        .route("/api/models/available", get(routes::models_available))
        .route("/api/models/auto-select", post(routes::models_auto_select))
        .route("/api/models/select", post(routes::models_select))
        .route("/api/models/selected", delete(routes::models_clear))
        .route("/api/chats", get(routes::chats_list).post(routes::chats_create))
        .route("/api/chats/:id", get(routes::chats_get).delete(routes::chats_delete))
        .route("/api/chats/:id/messages", post(routes::chat_send))
        .with_state(state)
}

pub async fn run(config: AppConfig) -> Result<(), String> {
    std::fs::create_dir_all(&config.data_dir).map_err(|e| e.to_string())?;
    let db = Arc::new(Database::new(config.data_dir.clone()).map_err(|e| e.to_string())?);
    let engine: Arc<dyn LlmEngine> = Arc::new(LlamaServerEngine::new(
        config.models_dir.clone(),
        config.server_bin.clone(),
    )?);
    let state = Arc::new(AppState {
        db: db.clone(),
        store: ModelStore::new(db),
        engine,
    });

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .map_err(|e| format!("failed to bind {}: {e}", config.bind_addr))?;
    log::info!("[server] listening on http://{}", config.bind_addr);
    axum::serve(listener, router(state))
        .await
        .map_err(|e| e.to_string())
}
