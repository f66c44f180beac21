use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{FromRequest, State},
    routing::{get, post},
};
use serde::Serialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    config::AppConfig,
    error::ServiceError,
    generation::GenerationService,
    model::{DeviceKind, ModelManager},
};

mod chat;
mod models;

pub use chat::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse};
pub use models::{LoadModelRequest, ModelInfo, ModelListResponse};

// JSON body whose rejections answer with the service's `{"detail"}` shape.
#[derive(FromRequest)]
#[from_request(via(Json), rejection(ServiceError))]
pub struct ApiJson<T>(pub T);

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub manager: Arc<ModelManager>,
    pub generation: Arc<GenerationService>,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, manager: Arc<ModelManager>) -> Self {
        let generation = Arc::new(GenerationService::new(
            manager.clone(),
            config.max_new_tokens,
            config.stream_buffer,
        ));
        Self {
            config,
            manager,
            generation,
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    model_loaded: bool,
    current_model: Option<String>,
    device: DeviceKind,
}

#[derive(Serialize)]
struct BannerResponse {
    message: &'static str,
    docs: &'static str,
    health: &'static str,
}

#[derive(Serialize)]
struct Endpoint {
    method: &'static str,
    path: &'static str,
    summary: &'static str,
}

#[derive(Serialize)]
struct DocsResponse {
    endpoints: &'static [Endpoint],
}

const ENDPOINTS: &[Endpoint] = &[
    Endpoint {
        method: "POST",
        path: "/v1/chat/completions",
        summary: "Run a chat completion, optionally streamed as server-sent events",
    },
    Endpoint {
        method: "GET",
        path: "/v1/models",
        summary: "List the loaded model and models available locally",
    },
    Endpoint {
        method: "POST",
        path: "/v1/models/load",
        summary: "Load a model by id, unloading the current one",
    },
    Endpoint {
        method: "POST",
        path: "/v1/models/unload",
        summary: "Unload the current model",
    },
    Endpoint {
        method: "GET",
        path: "/v1/models/status",
        summary: "Current load state and device",
    },
    Endpoint {
        method: "GET",
        path: "/health",
        summary: "Liveness and load state",
    },
];

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/docs", get(docs))
        .route("/health", get(health))
        .route("/v1/chat/completions", post(chat::chat_completions))
        .route("/v1/models", get(models::list_models))
        .route("/v1/models/load", post(models::load_model))
        .route("/v1/models/unload", post(models::unload_model))
        .route("/v1/models/status", get(models::model_status))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = state.manager.status();
    Json(HealthResponse {
        status: "healthy",
        model_loaded: status.loaded,
        current_model: status.model_id,
        device: status.device,
    })
}

async fn root() -> Json<BannerResponse> {
    Json(BannerResponse {
        message: "Self-Hosted Inference API",
        docs: "/docs",
        health: "/health",
    })
}

async fn docs() -> Json<DocsResponse> {
    Json(DocsResponse {
        endpoints: ENDPOINTS,
    })
}
