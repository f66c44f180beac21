//! OpenAI-compatible `/v1/chat/completions`.

use std::{
    convert::Infallible,
    time::{SystemTime, UNIX_EPOCH},
};

use axum::{
    Json,
    extract::State,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ApiJson, AppState};
use crate::{
    error::ServiceError,
    generation::{FragmentStream, GenerationRequest},
    model::{ChatMessage, ChatRole},
};

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default = "default_sampling_value")]
    pub temperature: f64,
    #[serde(default)]
    pub max_tokens: Option<usize>,
    #[serde(default = "default_sampling_value")]
    pub top_p: f64,
}

fn default_sampling_value() -> f64 {
    1.0
}

impl ChatCompletionRequest {
    fn validate(&self) -> Result<(), ServiceError> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ServiceError::Validation(format!(
                "temperature must be between 0 and 2, got {}",
                self.temperature
            )));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(ServiceError::Validation(format!(
                "top_p must be between 0 and 1, got {}",
                self.top_p
            )));
        }
        Ok(())
    }

    fn into_generation(self) -> GenerationRequest {
        GenerationRequest {
            messages: self.messages,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Choice {
    pub index: usize,
    pub message: ChatMessage,
    pub finish_reason: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: usize,
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

fn completion_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("chatcmpl-{}", &hex[..12])
}

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub async fn chat_completions(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<ChatCompletionRequest>,
) -> Result<Response, ServiceError> {
    request.validate()?;

    let Some(current_model) = state.manager.current_model_id() else {
        return Err(ServiceError::NoModelLoaded);
    };
    let model_id = request.model.clone().unwrap_or(current_model);
    debug!(
        %model_id,
        stream = request.stream,
        messages = request.messages.len(),
        "chat completion requested"
    );

    if request.stream {
        let fragments = state.generation.stream(request.into_generation())?;
        return Ok(stream_response(fragments, model_id).into_response());
    }

    let completion = state
        .generation
        .complete(request.into_generation())
        .await
        .map_err(|err| match err {
            ServiceError::NoModelLoaded => err,
            other => ServiceError::Generation(other.to_string()),
        })?;

    let response = ChatCompletionResponse {
        id: completion_id(),
        object: "chat.completion".to_string(),
        created: now_unix_secs(),
        model: model_id,
        choices: vec![Choice {
            index: 0,
            message: ChatMessage::new(ChatRole::Assistant, completion.text),
            finish_reason: "stop".to_string(),
        }],
        usage: Usage {
            prompt_tokens: completion.prompt_tokens,
            completion_tokens: completion.completion_tokens,
            total_tokens: completion.prompt_tokens + completion.completion_tokens,
        },
    };

    Ok(Json(response).into_response())
}

/// One chunk per fragment, a terminal `finish_reason: "stop"` chunk, then
/// `[DONE]`. A fault ends the stream with a single error event instead.
fn stream_response(
    mut fragments: FragmentStream,
    model_id: String,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let id = completion_id();
    let created = now_unix_secs();

    let chunk = move |delta: Delta, finish_reason: Option<&str>| ChatCompletionChunk {
        id: id.clone(),
        object: "chat.completion.chunk".to_string(),
        created,
        model: model_id.clone(),
        choices: vec![ChunkChoice {
            index: 0,
            delta,
            finish_reason: finish_reason.map(str::to_string),
        }],
    };

    let events = async_stream::stream! {
        while let Some(item) = fragments.next().await {
            match item {
                Ok(text) => {
                    let payload = chunk(Delta { content: Some(text) }, None);
                    yield Ok(Event::default().data(to_json(&payload)));
                }
                Err(err) => {
                    warn!(error = %err, "chat stream aborted");
                    let payload = serde_json::json!({ "error": err.to_string() });
                    yield Ok(Event::default().data(payload.to_string()));
                    return;
                }
            }
        }

        let last = chunk(Delta::default(), Some("stop"));
        yield Ok(Event::default().data(to_json(&last)));
        yield Ok(Event::default().data("[DONE]"));
    };

    Sse::new(events).keep_alive(KeepAlive::default())
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}
