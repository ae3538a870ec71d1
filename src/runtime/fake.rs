//! Scripted runtime for tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{CompletionRequest, CompletionResponse, ModelRuntime};
use crate::error::RuntimeError;

#[derive(Default)]
pub struct FakeRuntime {
    pub downloads: AtomicUsize,
    pub inits: AtomicUsize,
    pub completions: AtomicUsize,
    pub fail_next_init: AtomicBool,
    pub load_delay: Option<Duration>,
    pub reply: Mutex<Option<Result<String, String>>>,
    pub requests: Mutex<Vec<CompletionRequest>>,
}

impl FakeRuntime {
    pub fn replying(text: &str) -> Self {
        let rt = Self::default();
        *rt.reply.lock().unwrap() = Some(Ok(text.to_string()));
        rt
    }

    pub fn failing(message: &str) -> Self {
        let rt = Self::default();
        *rt.reply.lock().unwrap() = Some(Err(message.to_string()));
        rt
    }

    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl ModelRuntime for FakeRuntime {
    async fn download(&self, _model: &str, on_progress: &(dyn Fn(f32) + Send + Sync)) -> Result<(), RuntimeError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        if let Some(d) = self.load_delay {
            tokio::time::sleep(d).await;
        }
        for step in 0..=4 {
            on_progress(step as f32 / 4.0);
        }
        Ok(())
    }

    async fn init(&self, _model: &str) -> Result<(), RuntimeError> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        if let Some(d) = self.load_delay {
            tokio::time::sleep(d).await;
        }
        if self.fail_next_init.swap(false, Ordering::SeqCst) {
            return Err(RuntimeError::Init("weights corrupt".into()));
        }
        Ok(())
    }

    async fn complete(&self, req: CompletionRequest) -> Result<CompletionResponse, RuntimeError> {
        self.completions.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(req);
        match self.reply.lock().unwrap().clone() {
            Some(Ok(response)) => Ok(CompletionResponse { response }),
            Some(Err(message)) => Err(RuntimeError::from_inference_message(message)),
            None => Ok(CompletionResponse::default()),
        }
    }
}
