use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::runtime::{GenerationParams, DEFAULT_MODEL};

pub const DEFAULT_RUNTIME_URL: &str = "http://127.0.0.1:8080/v1";
pub const DEFAULT_HISTORY_WINDOW: usize = 6;
pub const DEFAULT_CAPTURE_DELAY_MS: u64 = 1500;
pub const DEFAULT_IMAGE_WIDTH: u32 = 384;
pub const DEFAULT_IMAGE_QUALITY: u8 = 60;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub database_url: Option<String>,
    pub model: String,
    pub runtime_url: String,
    pub weights_url: Option<String>,
    pub runtime_api_key: Option<String>,
    pub models_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub gallery_dir: Option<PathBuf>,
    pub history_window: usize,
    pub capture_delay_ms: u64,
    pub image_max_width: u32,
    pub image_quality: u8,
    pub generation: GenerationParams,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let data_dir = get("XDG_DATA_HOME").map(PathBuf::from).unwrap_or_else(|| {
            let home = get("HOME").unwrap_or_else(|| ".".into());
            PathBuf::from(home).join(".local").join("share")
        });
        let app_dir = data_dir.join("lens_companion");

        let history_window = parse_or(get("LENS_HISTORY_WINDOW"), "LENS_HISTORY_WINDOW", DEFAULT_HISTORY_WINDOW);
        Self {
            database_url: get("LENS_DATABASE_URL"),
            model: get("LENS_MODEL").unwrap_or_else(|| DEFAULT_MODEL.into()),
            runtime_url: get("LENS_RUNTIME_URL").unwrap_or_else(|| DEFAULT_RUNTIME_URL.into()),
            weights_url: get("LENS_WEIGHTS_URL"),
            runtime_api_key: get("LENS_RUNTIME_API_KEY"),
            models_dir: get("LENS_MODELS_DIR").map(PathBuf::from).unwrap_or_else(|| app_dir.join("models")),
            cache_dir: get("LENS_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| std::env::temp_dir().join("lens_companion")),
            gallery_dir: get("LENS_GALLERY_DIR").map(PathBuf::from),
            // a zero window would send nothing to the model
            history_window: history_window.max(1),
            capture_delay_ms: parse_or(get("LENS_CAPTURE_DELAY_MS"), "LENS_CAPTURE_DELAY_MS", DEFAULT_CAPTURE_DELAY_MS),
            image_max_width: DEFAULT_IMAGE_WIDTH,
            image_quality: DEFAULT_IMAGE_QUALITY,
            generation: GenerationParams {
                temperature: parse_opt(get("LENS_TEMPERATURE"), "LENS_TEMPERATURE"),
                max_tokens: parse_opt(get("LENS_MAX_TOKENS"), "LENS_MAX_TOKENS"),
                top_p: parse_opt(get("LENS_TOP_P"), "LENS_TOP_P"),
            },
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

fn parse_opt<T: FromStr>(raw: Option<String>, key: &str) -> Option<T> {
    let raw = raw?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable setting");
            None
        }
    }
}

fn parse_or<T: FromStr>(raw: Option<String>, key: &str, default: T) -> T {
    parse_opt(raw, key).unwrap_or(default)
}

/// Per-request values win over configured defaults, field by field.
pub fn resolve_generation_params(defaults: &GenerationParams, request: &GenerationParams) -> GenerationParams {
    GenerationParams {
        temperature: request.temperature.or(defaults.temperature),
        max_tokens: request.max_tokens.or(defaults.max_tokens),
        top_p: request.top_p.or(defaults.top_p),
    }
}
