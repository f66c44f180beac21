pub mod config;
pub mod error;
pub mod generation;
pub mod model;
pub mod server;

pub use config::AppConfig;
pub use error::ServiceError;
pub use generation::{Completion, GenerationRequest, GenerationService};
pub use model::{LoadedModel, ModelBackend, ModelManager};
pub use server::{AppState, build_router};
