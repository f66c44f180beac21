mod backend;
mod manager;
pub mod template;
mod types;

#[cfg(feature = "tch-backend")]
mod loader;

pub use backend::{LoadedModel, ModelBackend};
#[cfg(feature = "tch-backend")]
pub use loader::{TorchBackend, TorchModel};
pub use manager::{ActiveModel, ModelManager};
pub use types::{
    ChatMessage, ChatRole, DeviceKind, LoadOutcome, LoadState, ModelSource, ModelStatus,
    SamplingParams,
};
