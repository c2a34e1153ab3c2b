use crate::error::PipelineError;
use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use std::path::Path;
use webp::{Encoder, WebPConfig};

pub struct ResizeOptions {
    pub quality: u8,
    pub max_width: u32,
    pub max_height: u32,
}

pub struct ResizeResult {
    pub original_bytes: u64,
    pub output_bytes: u64,
    pub width: u32,
    pub height: u32,
}

/// Resizes `input` to fit within `max_width`x`max_height` without enlarging
/// it, then WebP-encodes the result to `output`. `quality` drives both the
/// WebP quality factor and (derived) alpha quality.
pub fn resize_to_webp(input: &Path, output: &Path, opts: &ResizeOptions) -> Result<ResizeResult> {
    if !input.exists() {
        return Err(PipelineError::FileNotFound(input.display().to_string()).into());
    }

    let original_bytes = std::fs::metadata(input)?.len();
    if original_bytes < 100 {
        return Err(PipelineError::VideoCorrupted(
            "thumbnail source smaller than minimum accepted size".to_string(),
        )
        .into());
    }

    let img = image::open(input).context("failed to decode thumbnail source")?;

    let (orig_w, orig_h) = (img.width(), img.height());
    let (target_w, target_h) = fit_within(orig_w, orig_h, opts.max_width, opts.max_height);

    let resized = if target_w < orig_w || target_h < orig_h {
        img.resize(target_w, target_h, FilterType::Lanczos3)
    } else {
        img
    };

    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let rgba = resized.to_rgba8();
    let mut config = WebPConfig::new().map_err(|_| anyhow!("failed to initialize webp encoder config"))?;
    config.quality = opts.quality as f32;
    config.method = 6; // highest-effort compression search
    config.alpha_quality = opts.quality.saturating_sub(10).max(10) as i32;
    config.image_hint = webp::WebPImageHint::WEBP_HINT_PHOTO; // smart chroma subsampling for photographic frames

    let encoder = Encoder::from_rgba(rgba.as_raw(), resized.width(), resized.height());
    let encoded = encoder
        .encode_advanced(&config)
        .map_err(|e| anyhow!("failed to encode webp thumbnail: {:?}", e))?;

    std::fs::write(output, &*encoded)?;

    Ok(ResizeResult {
        original_bytes,
        output_bytes: encoded.len() as u64,
        width: resized.width(),
        height: resized.height(),
    })
}

fn fit_within(w: u32, h: u32, max_w: u32, max_h: u32) -> (u32, u32) {
    if w <= max_w && h <= max_h {
        return (w, h);
    }
    let scale = (max_w as f64 / w as f64).min(max_h as f64 / h as f64);
    let new_w = ((w as f64) * scale).round().max(1.0) as u32;
    let new_h = ((h as f64) * scale).round().max(1.0) as u32;
    (new_w, new_h)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fit_within_does_not_enlarge() {
        assert_eq!(fit_within(100, 50, 640, 640), (100, 50));
    }

    #[test]
    fn fit_within_shrinks_preserving_aspect() {
        let (w, h) = fit_within(2000, 1000, 640, 640);
        assert!(w <= 640 && h <= 640);
        // aspect ratio preserved within rounding
        let orig_ratio = 2000.0 / 1000.0;
        let new_ratio = w as f64 / h as f64;
        assert!((orig_ratio - new_ratio).abs() < 0.05);
    }

    #[test]
    fn resize_rejects_missing_file() {
        let result = resize_to_webp(
            Path::new("/tmp/compressd-does-not-exist.jpg"),
            Path::new("/tmp/compressd-thumb-out.webp"),
            &ResizeOptions { quality: 60, max_width: 640, max_height: 640 },
        );
        assert!(result.is_err());
    }
}
