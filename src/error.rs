use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("No model loaded. Use /v1/models/load to load a model first.")]
    NoModelLoaded,
    #[error("Failed to load model {model_id}: {cause}")]
    Load { model_id: String, cause: String },
    #[error("a model load or unload is already in progress")]
    Busy,
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("model execution failed: {0}")]
    Inference(String),
    #[error("generation failed: {0}")]
    Generation(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServiceError {
    pub fn load(model_id: impl Into<String>, cause: impl ToString) -> Self {
        ServiceError::Load {
            model_id: model_id.into(),
            cause: cause.to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::NoModelLoaded => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Busy => StatusCode::CONFLICT,
            ServiceError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ServiceError::Load { .. }
            | ServiceError::Tokenizer(_)
            | ServiceError::Inference(_)
            | ServiceError::Generation(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<JsonRejection> for ServiceError {
    fn from(rejection: JsonRejection) -> Self {
        ServiceError::Validation(rejection.body_text())
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::json!({
            "detail": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}
