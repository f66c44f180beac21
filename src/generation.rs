use std::{ops::ControlFlow, sync::Arc};

use futures::stream::{BoxStream, StreamExt};
use tokio::{sync::mpsc, task};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    error::ServiceError,
    model::{ChatMessage, LoadedModel, ModelManager, SamplingParams, template},
};

pub type FragmentStream = BoxStream<'static, Result<String, ServiceError>>;

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<usize>,
    pub temperature: f64,
    pub top_p: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

pub struct GenerationService {
    manager: Arc<ModelManager>,
    default_max_tokens: usize,
    stream_buffer: usize,
}

impl GenerationService {
    pub fn new(manager: Arc<ModelManager>, default_max_tokens: usize, stream_buffer: usize) -> Self {
        Self {
            manager,
            default_max_tokens,
            stream_buffer: stream_buffer.max(1),
        }
    }

    fn params(&self, request: &GenerationRequest) -> SamplingParams {
        SamplingParams {
            max_new_tokens: request
                .max_tokens
                .filter(|&n| n > 0)
                .unwrap_or(self.default_max_tokens),
            temperature: request.temperature,
            top_p: request.top_p,
        }
    }

    fn model(&self) -> Result<Arc<dyn LoadedModel>, ServiceError> {
        self.manager
            .active()
            .map(|active| active.model)
            .ok_or(ServiceError::NoModelLoaded)
    }

    pub async fn complete(&self, request: GenerationRequest) -> Result<Completion, ServiceError> {
        let model = self.model()?;
        let params = self.params(&request);

        task::spawn_blocking(move || {
            let prompt_ids = encode_prompt(model.as_ref(), &request.messages)?;
            let generated = model.generate(&prompt_ids, &params, &mut |_| ControlFlow::Continue(()))?;
            let text = model.decode(&generated, true)?;
            debug!(
                prompt_tokens = prompt_ids.len(),
                completion_tokens = generated.len(),
                "completion finished"
            );
            Ok::<_, ServiceError>(Completion {
                text: text.trim().to_string(),
                prompt_tokens: prompt_ids.len(),
                completion_tokens: generated.len(),
            })
        })
        .await
        .map_err(|err| ServiceError::Generation(format!("inference task failed: {err}")))?
    }

    /// Dropping the returned stream cancels the worker at the next token.
    pub fn stream(&self, request: GenerationRequest) -> Result<FragmentStream, ServiceError> {
        let model = self.model()?;
        let params = self.params(&request);
        let (tx, mut rx) = mpsc::channel::<String>(self.stream_buffer);
        let cancel = CancellationToken::new();
        let worker_cancel = cancel.clone();

        let worker = task::spawn_blocking(move || {
            let prompt_ids = encode_prompt(model.as_ref(), &request.messages)?;
            let mut decoder = IncrementalDecoder::default();
            let mut failure = None;

            let generated = model.generate(&prompt_ids, &params, &mut |id| {
                if worker_cancel.is_cancelled() {
                    return ControlFlow::Break(());
                }
                let fragment = match decoder.push(model.as_ref(), id) {
                    Ok(fragment) => fragment,
                    Err(err) => {
                        failure = Some(err);
                        return ControlFlow::Break(());
                    }
                };
                if !fragment.is_empty() && tx.blocking_send(fragment).is_err() {
                    return ControlFlow::Break(());
                }
                ControlFlow::Continue(())
            })?;
            if let Some(err) = failure {
                return Err(err);
            }

            let tail = decoder.finish(model.as_ref())?;
            if !tail.is_empty() {
                let _ = tx.blocking_send(tail);
            }
            debug!(
                prompt_tokens = prompt_ids.len(),
                completion_tokens = generated.len(),
                cancelled = worker_cancel.is_cancelled(),
                "streaming generation finished"
            );
            Ok::<usize, ServiceError>(generated.len())
        });

        let fragments = async_stream::stream! {
            let _cancel_on_drop = cancel.drop_guard();
            while let Some(fragment) = rx.recv().await {
                yield Ok(fragment);
            }
            match worker.await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    warn!(error = %err, "streaming generation failed");
                    yield Err(err);
                }
                Err(err) => {
                    yield Err(ServiceError::Generation(format!("inference task failed: {err}")));
                }
            }
        };

        Ok(fragments.boxed())
    }
}

fn encode_prompt(
    model: &dyn LoadedModel,
    messages: &[ChatMessage],
) -> Result<Vec<u32>, ServiceError> {
    let prompt = model.apply_chat_template(messages).unwrap_or_else(|err| {
        debug!(reason = %err, "using plain transcript prompt");
        template::fallback_transcript(messages)
    });
    model.encode(&prompt)
}

/// Re-decodes the completion on every id. Output ending in U+FFFD is held back.
#[derive(Debug, Default)]
pub struct IncrementalDecoder {
    ids: Vec<u32>,
    emitted: String,
}

impl IncrementalDecoder {
    pub fn push(&mut self, model: &dyn LoadedModel, id: u32) -> Result<String, ServiceError> {
        self.ids.push(id);
        let decoded = model.decode(&self.ids, true)?;
        if decoded.ends_with('\u{FFFD}') {
            return Ok(String::new());
        }
        Ok(self.advance(decoded))
    }

    pub fn finish(&mut self, model: &dyn LoadedModel) -> Result<String, ServiceError> {
        if self.ids.is_empty() {
            return Ok(String::new());
        }
        let decoded = model.decode(&self.ids, true)?;
        Ok(self.advance(decoded))
    }

    fn advance(&mut self, decoded: String) -> String {
        let delta = text_delta(&self.emitted, &decoded);
        self.emitted = decoded;
        delta
    }
}

fn text_delta(previous: &str, current: &str) -> String {
    if let Some(delta) = current.strip_prefix(previous) {
        return delta.to_string();
    }
    let common = previous
        .chars()
        .zip(current.chars())
        .take_while(|(a, b)| a == b)
        .count();
    current.chars().skip(common).collect()
}
