use std::{fs, path::Path};

use axum::{Json, extract::State};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{ApiJson, AppState};
use crate::{
    error::ServiceError,
    model::{LoadOutcome, ModelStatus},
};

/// Directory entry kept in empty model directories under version control.
const PLACEHOLDER_ENTRY: &str = ".gitkeep";

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ModelInfo {
    pub id: String,
    pub object: String,
    pub owned_by: String,
}

impl ModelInfo {
    fn new(id: impl Into<String>, owned_by: &str) -> Self {
        Self {
            id: id.into(),
            object: "model".to_string(),
            owned_by: owned_by.to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ModelListResponse {
    pub object: String,
    pub data: Vec<ModelInfo>,
}

#[derive(Debug, Deserialize)]
pub struct LoadModelRequest {
    pub model_id: String,
}

#[derive(Debug, Serialize)]
pub struct UnloadResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    previous_model: Option<String>,
}

pub async fn list_models(State(state): State<AppState>) -> Json<ModelListResponse> {
    let current = state.manager.current_model_id();
    let mut data = Vec::new();

    if let Some(id) = &current {
        data.push(ModelInfo::new(id.clone(), "loaded"));
    }
    data.extend(
        local_model_names(state.manager.models_dir())
            .into_iter()
            .filter(|name| Some(name) != current.as_ref())
            .map(|name| ModelInfo::new(name, "local")),
    );

    Json(ModelListResponse {
        object: "list".to_string(),
        data,
    })
}

/// Sorted names of the model directories under `dir`.
fn local_model_names(dir: &Path) -> Vec<String> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            if dir.exists() {
                warn!(dir = %dir.display(), %err, "cannot read models directory");
            }
            return Vec::new();
        }
    };

    let mut names: Vec<String> = entries
        .flatten()
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name != PLACEHOLDER_ENTRY)
        .collect();
    names.sort();
    names
}

pub async fn load_model(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<LoadModelRequest>,
) -> Result<Json<LoadOutcome>, ServiceError> {
    let outcome = state.manager.load_model(&request.model_id).await?;
    Ok(Json(outcome))
}

pub async fn unload_model(
    State(state): State<AppState>,
) -> Result<Json<UnloadResponse>, ServiceError> {
    if !state.manager.is_loaded() {
        return Ok(Json(UnloadResponse {
            status: "no_model_loaded",
            previous_model: None,
        }));
    }

    let previous_model = state.manager.unload_model().await?;
    Ok(Json(UnloadResponse {
        status: "unloaded",
        previous_model,
    }))
}

pub async fn model_status(State(state): State<AppState>) -> Json<ModelStatus> {
    Json(state.manager.status())
}
