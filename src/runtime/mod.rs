use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RuntimeError;
use crate::session::Role;

pub mod gateway;
pub mod local_server;

#[cfg(test)]
pub(crate) mod fake;

pub use gateway::{ModelGateway, ProgressCallback, SummaryPrompt};
pub use local_server::LocalServerRuntime;

pub const DEFAULT_MODEL: &str = "lfm2-vl-450m";

/// A turn as the runtime consumes it. `images` are bare filesystem paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct GenerationParams {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<RuntimeMessage>,
    pub params: GenerationParams,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CompletionResponse {
    pub response: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeState {
    Uninitialized,
    Downloading,
    Initializing,
    Ready,
    Failed,
}

/// The on-device inference engine. Download and init are driven exactly once
/// per process by [`ModelGateway`].
#[async_trait]
pub trait ModelRuntime: Send + Sync {
    /// Fetches weights for `model`, reporting progress as a fraction in `0.0..=1.0`.
    async fn download(&self, model: &str, on_progress: &(dyn Fn(f32) + Send + Sync)) -> Result<(), RuntimeError>;
    async fn init(&self, model: &str) -> Result<(), RuntimeError>;
    async fn complete(&self, req: CompletionRequest) -> Result<CompletionResponse, RuntimeError>;
}
