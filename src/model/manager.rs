use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::RwLock;
use tokio::{sync::Mutex, task};
use tracing::{info, warn};

use crate::{
    config::{AppConfig, DeviceSetting},
    error::ServiceError,
    model::{
        DeviceKind, LoadOutcome, LoadState, LoadedModel, ModelBackend, ModelSource, ModelStatus,
    },
};

#[derive(Clone)]
pub struct ActiveModel {
    pub id: String,
    pub model: Arc<dyn LoadedModel>,
}

pub struct ModelManager {
    backend: Arc<dyn ModelBackend>,
    models_dir: PathBuf,
    device: DeviceKind,
    slot: RwLock<Option<ActiveModel>>,
    // Held across load and unload; a concurrent caller gets `Busy`.
    lifecycle: Mutex<()>,
}

impl ModelManager {
    pub fn new(config: &AppConfig, backend: Arc<dyn ModelBackend>) -> Self {
        let device = match config.device {
            DeviceSetting::Fixed(device) => device,
            DeviceSetting::Auto => backend.detect_device(),
        };
        Self {
            backend,
            models_dir: config.models_dir.clone(),
            device,
            slot: RwLock::new(None),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn device(&self) -> DeviceKind {
        self.device
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn is_loaded(&self) -> bool {
        self.slot.read().is_some()
    }

    pub fn current_model_id(&self) -> Option<String> {
        self.slot.read().as_ref().map(|active| active.id.clone())
    }

    pub fn active(&self) -> Option<ActiveModel> {
        self.slot.read().clone()
    }

    pub fn status(&self) -> ModelStatus {
        ModelStatus {
            loaded: self.is_loaded(),
            model_id: self.current_model_id(),
            device: self.device,
        }
    }

    /// A path given directly wins, then `<models_dir>/<id>`; anything else is
    /// handed to the backend as a remote identifier.
    pub fn resolve_source(&self, model_id: &str) -> ModelSource {
        let direct = Path::new(model_id);
        if direct.exists() {
            return ModelSource::Local(direct.to_path_buf());
        }
        let local = self.models_dir.join(model_id);
        if local.exists() {
            return ModelSource::Local(local);
        }
        ModelSource::Remote(model_id.to_string())
    }

    pub async fn load_model(&self, model_id: &str) -> Result<LoadOutcome, ServiceError> {
        let _guard = self.lifecycle.try_lock().map_err(|_| ServiceError::Busy)?;

        if self.current_model_id().as_deref() == Some(model_id) {
            return Ok(LoadOutcome {
                status: LoadState::AlreadyLoaded,
                model_id: model_id.to_string(),
                device: self.device,
            });
        }

        self.release().await;

        let source = self.resolve_source(model_id);
        info!(%model_id, ?source, device = %self.device, "loading model");

        let backend = self.backend.clone();
        let device = self.device;
        let loaded = task::spawn_blocking(move || backend.load(&source, device))
            .await
            .map_err(|err| ServiceError::load(model_id, format!("load task failed: {err}")))
            .and_then(|result| result.map_err(|err| ServiceError::load(model_id, err)));

        match loaded {
            Ok(model) => {
                *self.slot.write() = Some(ActiveModel {
                    id: model_id.to_string(),
                    model,
                });
                info!(%model_id, "model loaded");
                Ok(LoadOutcome {
                    status: LoadState::Loaded,
                    model_id: model_id.to_string(),
                    device: self.device,
                })
            }
            Err(err) => {
                warn!(%model_id, error = %err, "model load failed");
                self.release().await;
                Err(err)
            }
        }
    }

    pub async fn unload_model(&self) -> Result<Option<String>, ServiceError> {
        let _guard = self.lifecycle.try_lock().map_err(|_| ServiceError::Busy)?;
        Ok(self.release().await)
    }

    pub async fn shutdown(&self) -> Option<String> {
        let _guard = self.lifecycle.lock().await;
        self.release().await
    }

    async fn release(&self) -> Option<String> {
        let previous = self.slot.write().take();
        let previous_id = previous.as_ref().map(|active| active.id.clone());
        drop(previous);

        let backend = self.backend.clone();
        let device = self.device;
        if let Err(err) = task::spawn_blocking(move || backend.reclaim_memory(device)).await {
            warn!(error = %err, "memory reclamation task failed");
        }

        if let Some(id) = &previous_id {
            info!(model_id = %id, "model unloaded");
        }
        previous_id
    }
}
