//! Downscaling of chat attachments before they reach the vision model.

use std::io::BufWriter;
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use tracing::{debug, warn};
use uuid::Uuid;

fn try_optimize(src: &Path, out_dir: &Path, max_width: u32, quality: u8) -> anyhow::Result<PathBuf> {
    let img = image::open(src)?;
    let img = if img.width() > max_width { img.resize(max_width, u32::MAX, FilterType::Triangle) } else { img };
    std::fs::create_dir_all(out_dir)?;
    let stem = src.file_stem().and_then(|s| s.to_str()).unwrap_or("image");
    let dest = out_dir.join(format!("{}_{}.jpg", stem, &Uuid::new_v4().simple().to_string()[..8]));
    let mut out = BufWriter::new(std::fs::File::create(&dest)?);
    let encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
    DynamicImage::ImageRgb8(img.to_rgb8()).write_with_encoder(encoder)?;
    debug!(src = %src.display(), dest = %dest.display(), width = img.width(), "image optimized");
    Ok(dest)
}

/// Resizes `src` to at most `max_width` pixels wide and re-encodes it as JPEG
/// into `out_dir`. Returns `src` unchanged if anything goes wrong.
pub fn optimize_for_vlm(src: &Path, out_dir: &Path, max_width: u32, quality: u8) -> PathBuf {
    try_optimize(src, out_dir, max_width, quality).unwrap_or_else(|e| {
        warn!(src = %src.display(), error = %e, "failed to resize image, using original");
        src.to_path_buf()
    })
}

pub async fn optimize_batch(paths: &[String], out_dir: &Path, max_width: u32, quality: u8) -> Vec<String> {
    debug!(count = paths.len(), "optimizing images");
    let jobs = paths.iter().map(|p| {
        let src = PathBuf::from(crate::assembler::normalize_image_path(p));
        let out_dir = out_dir.to_path_buf();
        let original = p.clone();
        async move {
            match tokio::task::spawn_blocking(move || optimize_for_vlm(&src, &out_dir, max_width, quality)).await {
                Ok(path) => path.to_string_lossy().to_string(),
                Err(e) => {
                    warn!(error = %e, "image optimization task failed");
                    original
                }
            }
        }
    });
    futures::future::join_all(jobs).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};
    use tempfile::tempdir;

    fn write_png(dir: &Path, name: &str, w: u32, h: u32) -> PathBuf {
        let path = dir.join(name);
        RgbaImage::from_pixel(w, h, Rgba([200, 40, 40, 255])).save(&path).unwrap();
        path
    }

    #[test]
    fn wide_images_are_scaled_to_width() {
        let dir = tempdir().unwrap();
        let src = write_png(dir.path(), "wide.png", 800, 400);
        let out = optimize_for_vlm(&src, &dir.path().join("out"), 384, 60);
        assert_ne!(out, src);
        assert_eq!(out.extension().unwrap(), "jpg");
        let img = image::open(&out).unwrap();
        assert_eq!((img.width(), img.height()), (384, 192));
    }

    #[test]
    fn small_images_are_not_upscaled() {
        let dir = tempdir().unwrap();
        let src = write_png(dir.path(), "small.png", 100, 50);
        let out = optimize_for_vlm(&src, dir.path(), 384, 60);
        assert_eq!(image::open(&out).unwrap().width(), 100);
    }

    #[test]
    fn unreadable_input_falls_back_to_original() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("notes.txt");
        std::fs::write(&src, b"not an image").unwrap();
        assert_eq!(optimize_for_vlm(&src, dir.path(), 384, 60), src);
    }

    #[tokio::test]
    async fn batch_keeps_input_order() {
        let dir = tempdir().unwrap();
        let a = write_png(dir.path(), "a.png", 500, 500);
        let missing = dir.path().join("missing.png").to_string_lossy().to_string();
        let inputs = vec![format!("file://{}", a.display()), missing.clone()];
        let out = optimize_batch(&inputs, &dir.path().join("out"), 384, 60).await;
        assert_eq!(out.len(), 2);
        assert!(out[0].contains("a_") && out[0].ends_with(".jpg"));
        assert_eq!(out[1], missing);
    }
}
