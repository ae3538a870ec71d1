use thiserror::Error;

/// Failures at the model runtime boundary.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("model download failed: {0}")]
    Download(String),

    #[error("model initialization failed: {0}")]
    Init(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("runtime ran out of memory: {0}")]
    OutOfMemory(String),

    #[error("image not readable at {path}: {source}")]
    Image {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl RuntimeError {
    /// Classifies a raw runtime failure message.
    pub fn from_inference_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_ascii_lowercase();
        if lower.contains("out of memory") || lower.contains("failed to allocate") {
            RuntimeError::OutOfMemory(message)
        } else {
            RuntimeError::Inference(message)
        }
    }
}
