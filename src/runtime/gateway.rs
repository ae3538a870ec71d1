use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

use super::{CompletionRequest, GenerationParams, ModelRuntime, RuntimeMessage, RuntimeState};
use crate::assembler::normalize_image_path;
use crate::config::resolve_generation_params;
use crate::error::RuntimeError;
use crate::session::Role;

pub const CHAT_FALLBACK: &str = "I'm having trouble processing that request on-device.";
pub const MEMORY_FALLBACK: &str = "I ran out of memory on this device. Try a shorter conversation or fewer images.";
pub const EMPTY_REPLY: &str = "No response from model.";
pub const SUMMARY_FALLBACK: &str = "Failed to generate summary.";
pub const EMPTY_SUMMARY: &str = "No summary generated.";

pub type ProgressCallback = Arc<dyn Fn(f32) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SummaryPrompt {
    #[default]
    Describe,
    /// Also asks for `Event Title:` / `Event Details:` lines when the image shows a dated event.
    DetectEvent,
}

impl SummaryPrompt {
    pub fn text(&self) -> &'static str {
        match self {
            SummaryPrompt::Describe => "Describe this image details.",
            SummaryPrompt::DetectEvent => {
                "Describe this image details. If it shows an event with a date or time, \
                 end your answer with two lines:\nEvent Title: <short title>\nEvent Details: <one sentence with date, time and place>"
            }
        }
    }
}

/// Owns the lazy download/init lifecycle of the bundled model.
///
/// Loading is single-flight: concurrent callers of [`ModelGateway::ensure_ready`]
/// await the same in-flight load. A failed load leaves the gateway unloaded so
/// the next call starts over.
pub struct ModelGateway {
    runtime: Arc<dyn ModelRuntime>,
    model: String,
    defaults: GenerationParams,
    ready: OnceCell<()>,
    state: Mutex<RuntimeState>,
    progress: Option<ProgressCallback>,
}

impl ModelGateway {
    pub fn new(runtime: Arc<dyn ModelRuntime>, model: impl Into<String>) -> Self {
        Self {
            runtime,
            model: model.into(),
            defaults: GenerationParams::default(),
            ready: OnceCell::new(),
            state: Mutex::new(RuntimeState::Uninitialized),
            progress: None,
        }
    }

    pub fn with_defaults(mut self, defaults: GenerationParams) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn state(&self) -> RuntimeState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: RuntimeState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = next;
    }

    pub async fn ensure_ready(&self) -> Result<(), RuntimeError> {
        if self.ready.initialized() {
            return Ok(());
        }
        self.ready.get_or_try_init(|| self.load()).await.map(|_| ())
    }

    async fn load(&self) -> Result<(), RuntimeError> {
        self.set_state(RuntimeState::Downloading);
        info!(model = %self.model, "checking/downloading model");
        let last_decile = AtomicU32::new(u32::MAX);
        let report = |fraction: f32| {
            let fraction = fraction.clamp(0.0, 1.0);
            let decile = (fraction * 10.0).floor() as u32;
            if last_decile.swap(decile, Ordering::Relaxed) != decile {
                info!(model = %self.model, percent = decile * 10, "downloading model");
            }
            if let Some(cb) = &self.progress {
                cb(fraction);
            }
        };
        if let Err(e) = self.runtime.download(&self.model, &report).await {
            error!(model = %self.model, error = %e, "model download failed");
            self.set_state(RuntimeState::Failed);
            return Err(e);
        }

        self.set_state(RuntimeState::Initializing);
        info!(model = %self.model, "initializing model");
        if let Err(e) = self.runtime.init(&self.model).await {
            error!(model = %self.model, error = %e, "model initialization failed");
            self.set_state(RuntimeState::Failed);
            return Err(e);
        }

        self.set_state(RuntimeState::Ready);
        info!(model = %self.model, "model ready");
        Ok(())
    }

    /// Runs a completion, surfacing runtime failures to the caller.
    pub async fn try_complete(
        &self,
        messages: Vec<RuntimeMessage>,
        overrides: &GenerationParams,
    ) -> Result<String, RuntimeError> {
        self.ensure_ready().await?;
        let req = CompletionRequest {
            model: self.model.clone(),
            params: resolve_generation_params(&self.defaults, overrides),
            messages,
        };
        debug!(model = %self.model, messages = req.messages.len(), "sending completion request");
        let res = self.runtime.complete(req).await?;
        Ok(res.response)
    }

    /// Like [`Self::try_complete`] but always yields displayable text.
    pub async fn complete(&self, messages: Vec<RuntimeMessage>, overrides: &GenerationParams) -> String {
        match self.try_complete(messages, overrides).await {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => EMPTY_REPLY.to_string(),
            Err(e) => {
                warn!(error = %e, "chat completion failed, using fallback reply");
                metrics::counter!("lens_model_fallbacks_total", "kind" => "chat").increment(1);
                match e {
                    RuntimeError::OutOfMemory(_) => MEMORY_FALLBACK.to_string(),
                    _ => CHAT_FALLBACK.to_string(),
                }
            }
        }
    }

    pub async fn summarize_image(&self, path: &str, prompt: SummaryPrompt) -> String {
        let messages = vec![RuntimeMessage {
            role: Role::User,
            content: prompt.text().to_string(),
            images: vec![normalize_image_path(path)],
        }];
        match self.try_complete(messages, &GenerationParams::default()).await {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => EMPTY_SUMMARY.to_string(),
            Err(e) => {
                warn!(error = %e, path, "image summary failed");
                metrics::counter!("lens_model_fallbacks_total", "kind" => "summary").increment(1);
                SUMMARY_FALLBACK.to_string()
            }
        }
    }
}
