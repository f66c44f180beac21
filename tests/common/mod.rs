#![allow(dead_code)]

use std::{
    ops::ControlFlow,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use http_body_util::BodyExt;
use parking_lot::Mutex;
use tower::ServiceExt;

use local_inference_api::{
    AppConfig, AppState, LoadedModel, ModelBackend, ModelManager, ServiceError, build_router,
    config::DeviceSetting,
    model::{ChatMessage, DeviceKind, ModelSource, SamplingParams, template},
};

const FIRST_REPLY_ID: u32 = 1000;

/// Scripted stand-in for a real model: always answers with `reply`, one
/// piece per generated token.
pub struct ScriptedModel {
    pub reply: Vec<String>,
    pub chat_template: Option<String>,
    pub fail_after: Option<usize>,
    pub token_delay: Duration,
    pub produced: Arc<AtomicUsize>,
    pub last_prompt: Arc<Mutex<Option<String>>>,
}

impl ScriptedModel {
    pub fn new(reply: &[&str]) -> Self {
        Self {
            reply: reply.iter().map(|s| s.to_string()).collect(),
            chat_template: None,
            fail_after: None,
            token_delay: Duration::ZERO,
            produced: Arc::new(AtomicUsize::new(0)),
            last_prompt: Arc::new(Mutex::new(None)),
        }
    }
}

impl LoadedModel for ScriptedModel {
    fn apply_chat_template(&self, messages: &[ChatMessage]) -> Result<String, ServiceError> {
        template::apply_chat_template(self.chat_template.as_deref(), messages)
    }

    fn encode(&self, prompt: &str) -> Result<Vec<u32>, ServiceError> {
        *self.last_prompt.lock() = Some(prompt.to_string());
        Ok((0..prompt.split_whitespace().count() as u32).collect())
    }

    fn decode(&self, ids: &[u32], _skip_special_tokens: bool) -> Result<String, ServiceError> {
        Ok(ids
            .iter()
            .filter_map(|id| id.checked_sub(FIRST_REPLY_ID))
            .filter_map(|idx| self.reply.get(idx as usize))
            .cloned()
            .collect())
    }

    fn generate(
        &self,
        _prompt_ids: &[u32],
        params: &SamplingParams,
        on_token: &mut dyn FnMut(u32) -> ControlFlow<()>,
    ) -> Result<Vec<u32>, ServiceError> {
        let mut generated = Vec::new();
        for idx in 0..self.reply.len().min(params.max_new_tokens) {
            if self.fail_after == Some(idx) {
                return Err(ServiceError::Inference("device lost".into()));
            }
            if !self.token_delay.is_zero() {
                std::thread::sleep(self.token_delay);
            }
            let id = FIRST_REPLY_ID + idx as u32;
            generated.push(id);
            self.produced.fetch_add(1, Ordering::SeqCst);
            if on_token(id).is_break() {
                break;
            }
        }
        Ok(generated)
    }
}

type ModelFactory = dyn Fn() -> ScriptedModel + Send + Sync;

/// Loads `ScriptedModel`s. Local sources always load; remote ids load only
/// when listed in `remote_ids`.
pub struct ScriptedBackend {
    pub factory: Box<ModelFactory>,
    pub remote_ids: Vec<String>,
    pub load_delay: Duration,
    pub loads: AtomicUsize,
    pub reclaims: AtomicUsize,
    pub sources: Mutex<Vec<ModelSource>>,
}

impl ScriptedBackend {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> ScriptedModel + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            remote_ids: Vec::new(),
            load_delay: Duration::ZERO,
            loads: AtomicUsize::new(0),
            reclaims: AtomicUsize::new(0),
            sources: Mutex::new(Vec::new()),
        }
    }

    pub fn with_remote(mut self, id: &str) -> Self {
        self.remote_ids.push(id.to_string());
        self
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }
}

impl ModelBackend for ScriptedBackend {
    fn detect_device(&self) -> DeviceKind {
        DeviceKind::Cpu
    }

    fn load(
        &self,
        source: &ModelSource,
        _device: DeviceKind,
    ) -> Result<Arc<dyn LoadedModel>, ServiceError> {
        self.sources.lock().push(source.clone());
        if !self.load_delay.is_zero() {
            std::thread::sleep(self.load_delay);
        }
        if let ModelSource::Remote(id) = source {
            if !self.remote_ids.contains(id) {
                return Err(ServiceError::Inference(format!("repository {id} not found")));
            }
        }
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new((self.factory)()))
    }

    fn reclaim_memory(&self, _device: DeviceKind) {
        self.reclaims.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn test_config(models_dir: &std::path::Path) -> AppConfig {
    AppConfig {
        models_dir: models_dir.to_path_buf(),
        max_new_tokens: 16,
        device: DeviceSetting::Auto,
        stream_buffer: 1,
        ..AppConfig::default()
    }
}

pub struct TestApp {
    pub router: Router,
    pub manager: Arc<ModelManager>,
    pub backend: Arc<ScriptedBackend>,
    pub models_dir: tempfile::TempDir,
}

impl TestApp {
    pub fn new(backend: ScriptedBackend) -> Self {
        let models_dir = tempfile::tempdir().expect("tempdir");
        let config = Arc::new(test_config(models_dir.path()));
        let backend = Arc::new(backend);
        let manager = Arc::new(ModelManager::new(config.as_ref(), backend.clone()));
        let router = build_router(AppState::new(config, manager.clone()));
        Self {
            router,
            manager,
            backend,
            models_dir,
        }
    }

    pub fn add_local_model(&self, name: &str) {
        std::fs::create_dir_all(self.models_dir.path().join(name)).expect("model dir");
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, String) {
        let request = Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("request");
        self.send(request).await
    }

    pub async fn post_json(&self, uri: &str, body: serde_json::Value) -> (StatusCode, String) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request");
        self.send(request).await
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, String) {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        (status, String::from_utf8(bytes.to_vec()).expect("utf-8 body"))
    }
}

pub fn json(body: &str) -> serde_json::Value {
    serde_json::from_str(body).unwrap_or_else(|err| panic!("invalid JSON {body:?}: {err}"))
}

/// `data:` payloads of a server-sent event body, in order.
pub fn sse_data(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| data.trim_start().to_string())
        .collect()
}
