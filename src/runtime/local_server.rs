use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::Engine;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{CompletionRequest, CompletionResponse, ModelRuntime, RuntimeMessage};
use crate::config::AppConfig;
use crate::error::RuntimeError;

/// Runtime backed by a local OpenAI-compatible inference server hosting the
/// vision model. Weights are optionally fetched into `models_dir` first.
#[derive(Clone)]
pub struct LocalServerRuntime {
    pub base_url: String,
    pub api_key: Option<String>,
    pub weights_url: Option<String>,
    pub models_dir: PathBuf,
    client: reqwest::Client,
}

impl LocalServerRuntime {
    pub fn new(base_url: impl Into<String>, models_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            weights_url: None,
            models_dir: models_dir.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(cfg: &AppConfig) -> Self {
        let mut rt = Self::new(cfg.runtime_url.clone(), cfg.models_dir.clone());
        rt.weights_url = cfg.weights_url.clone();
        rt.api_key = cfg.runtime_api_key.clone();
        rt
    }

    pub fn with_weights_url(mut self, url: impl Into<String>) -> Self {
        self.weights_url = Some(url.into());
        self
    }

    pub fn weights_path(&self, model: &str) -> PathBuf {
        self.models_dir.join(format!("{model}.gguf"))
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn authorized(&self, rb: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => rb.bearer_auth(key),
            None => rb,
        }
    }
}

#[derive(Debug, Serialize)]
struct OaiChatRequest<'a> {
    model: &'a str,
    messages: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct OaiChatResponse {
    choices: Vec<OaiChoice>,
}

#[derive(Debug, Deserialize)]
struct OaiChoice {
    message: OaiMessage,
}

#[derive(Debug, Deserialize)]
struct OaiMessage {
    #[serde(default)]
    content: Option<String>,
}

fn image_mime(path: &str) -> &'static str {
    match Path::new(path).extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()).as_deref() {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => "image/jpeg",
    }
}

async fn encode_message(msg: &RuntimeMessage) -> Result<serde_json::Value, RuntimeError> {
    if msg.images.is_empty() {
        return Ok(serde_json::json!({ "role": msg.role.as_str(), "content": msg.content }));
    }
    let mut parts = vec![serde_json::json!({ "type": "text", "text": msg.content })];
    for path in &msg.images {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| RuntimeError::Image { path: path.clone(), source })?;
        let data = base64::engine::general_purpose::STANDARD.encode(bytes);
        parts.push(serde_json::json!({
            "type": "image_url",
            "image_url": { "url": format!("data:{};base64,{}", image_mime(path), data) }
        }));
    }
    Ok(serde_json::json!({ "role": msg.role.as_str(), "content": parts }))
}

#[async_trait]
impl ModelRuntime for LocalServerRuntime {
    async fn download(&self, model: &str, on_progress: &(dyn Fn(f32) + Send + Sync)) -> Result<(), RuntimeError> {
        let Some(url) = &self.weights_url else {
            on_progress(1.0);
            return Ok(());
        };
        let dest = self.weights_path(model);
        if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            debug!(path = %dest.display(), "weights already present");
            on_progress(1.0);
            return Ok(());
        }
        let url = url::Url::parse(url).map_err(|e| RuntimeError::Download(format!("invalid weights url: {e}")))?;
        let io = |e: std::io::Error| RuntimeError::Download(e.to_string());
        tokio::fs::create_dir_all(&self.models_dir).await.map_err(io)?;

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| RuntimeError::Download(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(RuntimeError::Download(format!("weights fetch failed: {}", resp.status())));
        }
        let total = resp.content_length().filter(|t| *t > 0);
        let part = dest.with_extension("gguf.part");
        let mut file = tokio::fs::File::create(&part).await.map_err(io)?;
        let mut stream = resp.bytes_stream();
        let mut received: u64 = 0;
        on_progress(0.0);
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| RuntimeError::Download(e.to_string()))?;
            file.write_all(&chunk).await.map_err(io)?;
            received += chunk.len() as u64;
            if let Some(total) = total {
                on_progress((received as f32 / total as f32).min(1.0));
            }
        }
        file.flush().await.map_err(io)?;
        drop(file);
        tokio::fs::rename(&part, &dest).await.map_err(io)?;
        on_progress(1.0);
        debug!(path = %dest.display(), bytes = received, "weights downloaded");
        Ok(())
    }

    async fn init(&self, model: &str) -> Result<(), RuntimeError> {
        let resp = self
            .authorized(self.client.get(self.endpoint("models")))
            .send()
            .await
            .map_err(|e| RuntimeError::Init(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(RuntimeError::Init(format!("runtime not available for {model}: {}", resp.status())));
        }
        Ok(())
    }

    async fn complete(&self, req: CompletionRequest) -> Result<CompletionResponse, RuntimeError> {
        let mut messages = Vec::with_capacity(req.messages.len());
        for msg in &req.messages {
            messages.push(encode_message(msg).await?);
        }
        let body = OaiChatRequest {
            model: &req.model,
            messages,
            temperature: req.params.temperature,
            max_tokens: req.params.max_tokens,
            top_p: req.params.top_p,
        };
        let resp = self
            .authorized(self.client.post(self.endpoint("chat/completions")).json(&body))
            .send()
            .await
            .map_err(|e| RuntimeError::Inference(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(RuntimeError::from_inference_message(format!("model call failed: {status}: {detail}")));
        }
        let v: OaiChatResponse = resp.json().await.map_err(|e| RuntimeError::Inference(e.to_string()))?;
        let response = v.choices.into_iter().next().and_then(|c| c.message.content).unwrap_or_default();
        Ok(CompletionResponse { response })
    }
}
