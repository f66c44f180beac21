use std::{ops::ControlFlow, sync::Arc};

use crate::{
    error::ServiceError,
    model::{ChatMessage, DeviceKind, ModelSource, SamplingParams},
};

pub trait ModelBackend: Send + Sync + 'static {
    fn detect_device(&self) -> DeviceKind;

    fn load(
        &self,
        source: &ModelSource,
        device: DeviceKind,
    ) -> Result<Arc<dyn LoadedModel>, ServiceError>;

    fn reclaim_memory(&self, device: DeviceKind);
}

pub trait LoadedModel: Send + Sync {
    fn apply_chat_template(&self, messages: &[ChatMessage]) -> Result<String, ServiceError>;

    fn encode(&self, prompt: &str) -> Result<Vec<u32>, ServiceError>;

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String, ServiceError>;

    /// Runs autoregressive generation after `prompt_ids` and returns the new
    /// ids only. `on_token` sees every id as it is produced and may stop the
    /// loop early by returning `ControlFlow::Break`.
    fn generate(
        &self,
        prompt_ids: &[u32],
        params: &SamplingParams,
        on_token: &mut dyn FnMut(u32) -> ControlFlow<()>,
    ) -> Result<Vec<u32>, ServiceError>;
}
