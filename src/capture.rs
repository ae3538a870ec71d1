use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::runtime::{ModelGateway, SummaryPrompt};
use crate::session::ScreenshotEntry;
use crate::storage::ScreenshotRepository;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "heic", "gif"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaAsset {
    pub id: String,
    /// Readable location of the asset. May stop being readable later.
    pub uri: String,
    pub filename: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Photo gallery of the device.
#[async_trait]
pub trait MediaLibrary: Send + Sync {
    async fn latest_photo(&self) -> anyhow::Result<Option<MediaAsset>>;
    async fn asset(&self, id: &str) -> anyhow::Result<Option<MediaAsset>>;
}

/// A folder of image files treated as a gallery. Asset ids are file names and
/// recency is the file modification time.
pub struct DirectoryGallery {
    root: PathBuf,
}

impl DirectoryGallery {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn scan(&self) -> anyhow::Result<Vec<MediaAsset>> {
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !is_image(&path) {
                continue;
            }
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else { continue };
            let created_at = meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now());
            out.push(MediaAsset {
                id: name.clone(),
                uri: path.to_string_lossy().to_string(),
                filename: Some(name),
                created_at,
            });
        }
        Ok(out)
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[async_trait]
impl MediaLibrary for DirectoryGallery {
    async fn latest_photo(&self) -> anyhow::Result<Option<MediaAsset>> {
        Ok(self.scan().await?.into_iter().max_by_key(|a| a.created_at))
    }

    async fn asset(&self, id: &str) -> anyhow::Result<Option<MediaAsset>> {
        Ok(self.scan().await?.into_iter().find(|a| a.id == id))
    }
}

async fn same_file(a: &Path, b: &Path) -> bool {
    match (tokio::fs::canonicalize(a).await, tokio::fs::canonicalize(b).await) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Sends "screenshot taken" signals to a running pipeline.
#[derive(Clone)]
pub struct CaptureHandle {
    tx: mpsc::Sender<()>,
}

impl CaptureHandle {
    /// Returns false if the pipeline is gone or already has a backlog.
    pub fn signal(&self) -> bool {
        self.tx.try_send(()).is_ok()
    }
}

pub struct CapturePipeline {
    library: Arc<dyn MediaLibrary>,
    gateway: Arc<ModelGateway>,
    store: Arc<dyn ScreenshotRepository>,
    cache_dir: PathBuf,
    delay: Duration,
    prompt: SummaryPrompt,
}

impl CapturePipeline {
    pub fn new(
        library: Arc<dyn MediaLibrary>,
        gateway: Arc<ModelGateway>,
        store: Arc<dyn ScreenshotRepository>,
        cache_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            library,
            gateway,
            store,
            cache_dir: cache_dir.into(),
            delay: Duration::from_millis(crate::config::DEFAULT_CAPTURE_DELAY_MS),
            prompt: SummaryPrompt::DetectEvent,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_prompt(mut self, prompt: SummaryPrompt) -> Self {
        self.prompt = prompt;
        self
    }

    /// Starts the signal loop on the runtime.
    pub fn spawn(self: Arc<Self>) -> (CaptureHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(async move { self.run(rx).await });
        (CaptureHandle { tx }, task)
    }

    pub async fn run(&self, mut signals: mpsc::Receiver<()>) {
        while signals.recv().await.is_some() {
            info!("screenshot detected");
            // the gallery index lags behind the screenshot event
            tokio::time::sleep(self.delay).await;
            self.process_latest().await;
        }
        debug!("capture signal channel closed");
    }

    /// Summarizes whatever photo is newest in the gallery. No check is made
    /// that it is the screenshot that triggered the call.
    pub async fn process_latest(&self) -> Option<ScreenshotEntry> {
        let asset = match self.library.latest_photo().await {
            Ok(Some(a)) => a,
            Ok(None) => {
                info!("no photos in gallery");
                return None;
            }
            Err(e) => {
                error!(error = %e, "failed to query gallery");
                return None;
            }
        };
        match self.summarize_asset(&asset).await {
            Ok(entry) => Some(entry),
            Err(e) => {
                error!(asset_id = %asset.id, error = %e, "error processing screenshot");
                None
            }
        }
    }

    /// Re-summarizes a specific gallery asset, replacing any stored summary.
    pub async fn summarize_by_id(&self, id: &str) -> anyhow::Result<Option<ScreenshotEntry>> {
        let Some(asset) = self.library.asset(id).await? else { return Ok(None) };
        self.summarize_asset(&asset).await.map(Some)
    }

    pub async fn summarize_asset(&self, asset: &MediaAsset) -> anyhow::Result<ScreenshotEntry> {
        debug!(asset_id = %asset.id, uri = %asset.uri, "processing screenshot");
        let staged = self.stage(asset).await?;
        let local_uri = staged.to_string_lossy().to_string();
        let summary = self.gateway.summarize_image(&local_uri, self.prompt).await;
        let entry = ScreenshotEntry {
            id: asset.id.clone(),
            local_uri,
            summary,
            timestamp: asset.created_at,
        };
        self.store.upsert_screenshot(&entry).await;
        metrics::counter!("lens_screenshots_summarized_total").increment(1);
        info!(asset_id = %entry.id, "screenshot summarized and saved");
        Ok(entry)
    }

    async fn stage(&self, asset: &MediaAsset) -> anyhow::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.cache_dir).await?;
        let name = asset
            .filename
            .clone()
            .unwrap_or_else(|| format!("screenshot_{}.jpg", Utc::now().timestamp_millis()));
        let dest = self.cache_dir.join(name);
        let source = PathBuf::from(crate::assembler::normalize_image_path(&asset.uri));
        if same_file(&source, &dest).await {
            debug!(path = %dest.display(), "asset already in staging directory");
            return Ok(dest);
        }
        if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            tokio::fs::remove_file(&dest).await?;
        }
        tokio::fs::copy(&source, &dest).await?;
        Ok(dest)
    }
}
