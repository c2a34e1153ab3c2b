use crate::broker::Broker;
use crate::config::Config;
use crate::download::{build_client, guarded_fetch, DownloadPolicy, FetchKind};
use crate::error::PipelineError;
use crate::job::{Job, QualityStats, ResultRecord, Stage};
use crate::layout::MediaLayout;
use crate::playlist::{build_master_playlist, Variant};
use crate::presets::Quality;
use crate::probe::probe;
use crate::thumbnail::{resize_to_webp, ResizeOptions};
use crate::transcode::{segment, transcode};
use crate::webhook::{Event, EventPayload, WebhookDispatcher};
use anyhow::Result;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Everything a running job needs that isn't itself job state: the broker to
/// persist progress against, the webhook dispatcher, and the download/layout
/// policy derived from config. Shared across concurrent job attempts.
pub struct PipelineContext {
    pub broker: Broker,
    pub webhook: WebhookDispatcher,
    pub http_client: reqwest::Client,
    pub download_policy: DownloadPolicy,
    pub uploads_root: std::path::PathBuf,
    pub content_root: std::path::PathBuf,
    pub base_url: String,
    pub hls_time_secs: u32,
    pub thumbnail: ResizeOptions,
    pub max_duration_secs: f64,
    pub max_file_size_bytes: u64,
}

/// Codec/container names as `ffprobe` reports them. Containers double up
/// because `format_name` can't distinguish mp4 from mov, or webm from mkv,
/// at the demuxer level — both pairs share the same `format_name` token.
const ALLOWED_CODECS: &[&str] = &["h264", "hevc", "vp8", "vp9", "prores", "mpeg4", "av1"];
const ALLOWED_CONTAINERS: &[&str] = &["mov", "mp4", "matroska", "webm", "mkv"];

impl PipelineContext {
    pub fn new(config: &Config, broker: Broker) -> Result<Self> {
        let download_policy = DownloadPolicy {
            allowed_domains: config.allowed_download_domains.clone(),
            verify_ssl: config.verify_ssl_downloads,
        };
        let http_client = build_client(&download_policy)?;
        let webhook = WebhookDispatcher::new(config.webhook_url.clone(), config.api_key.clone());

        Ok(Self {
            broker,
            webhook,
            http_client,
            download_policy,
            uploads_root: config.media_uploads_dir.clone(),
            content_root: config.media_content_dir.clone(),
            base_url: config.base_url.clone(),
            hls_time_secs: config.hls_time_secs,
            thumbnail: ResizeOptions {
                quality: config.thumbnail_quality,
                max_width: config.thumbnail_max_width,
                max_height: config.thumbnail_max_height,
            },
            max_duration_secs: config.max_duration_secs,
            max_file_size_bytes: config.max_file_size_bytes,
        })
    }

    async fn emit(&self, job: &Job, payload: EventPayload) {
        let event = Event {
            job_id: job.id.clone(),
            post_id: job.submission.post_id,
            progress: job.progress,
            stage: job.stage.tag(),
            timestamp: chrono::Utc::now(),
            payload,
        };
        if let Err(e) = self.webhook.send(event).await {
            warn!(job_id = %job.id, error = %e, "webhook send failed after retries");
        }
    }
}

/// Drives one job through every milestone from `queued` to `complete`,
/// persisting state and emitting a throttled webhook at each advance. A
/// failure downloading or validating is fatal to the job; a failed
/// compression rung is absorbed as long as at least one rung succeeds (see
/// `qualities.is_empty()` below). HLS packaging and thumbnail generation are
/// best-effort and never fail the job outright.
pub async fn process_job(job: &mut Job, ctx: Arc<PipelineContext>) -> Result<()> {
    let started = Instant::now();
    let layout = MediaLayout::new(
        &ctx.content_root,
        &ctx.base_url,
        job.submission.year,
        job.submission.month,
        job.submission.post_id,
    );

    // Pre-flight cleanup runs synchronously before any download begins, so a
    // retried job never mixes a prior attempt's partial outputs with a fresh one.
    layout.clean()?;
    layout.ensure_dirs()?;

    if let Err(e) = run_stages(job, &ctx, &layout, started).await {
        let pipeline_err = e.downcast_ref::<PipelineError>();
        let code = pipeline_err.map(|p| p.code()).unwrap_or("internal_error");
        job.mark_failed(e.to_string(), code);
        ctx.broker.finalize(job).await?;
        ctx.emit(job, EventPayload::Failed { error: e.to_string() }).await;
        return Err(e);
    }

    Ok(())
}

async fn run_stages(
    job: &mut Job,
    ctx: &PipelineContext,
    layout: &MediaLayout,
    started: Instant,
) -> Result<()> {
    job.advance(Stage::Queued, 0.0);
    persist_and_notify(job, ctx).await?;

    download_source(job, ctx, layout).await?;

    job.advance(Stage::Validating, 25.0);
    persist_and_notify(job, ctx).await?;
    let source_path = layout.original_path(&source_ext(job));
    let info = probe(&source_path).await?;
    validate_source(&info, ctx)?;

    let mut qualities = Vec::new();
    let mut variants = Vec::new();
    let compress_stages = [
        (Quality::P480, Stage::CompressingP480),
        (Quality::P360, Stage::CompressingP360),
        (Quality::P240, Stage::CompressingP240),
        (Quality::P144, Stage::CompressingP144),
    ];

    for (idx, (quality, stage)) in compress_stages.iter().enumerate() {
        let base_progress = 25.0 + (idx as f64) * 12.0;
        job.advance(*stage, base_progress);
        persist_and_notify(job, ctx).await?;

        let output = layout.compressed_path(*quality);
        let result = transcode(
            &source_path,
            &output,
            *quality,
            ctx.hls_time_secs,
            info.duration,
            |_frac| {},
        )
        .await;

        match result {
            Ok(()) => {
                let encoded_info = probe(&output).await.ok();
                let bytes = std::fs::metadata(&output).map(|m| m.len()).unwrap_or(0);
                let preset = quality.preset();
                let (width, height) = encoded_info
                    .as_ref()
                    .map(|i| (i.width, i.height))
                    .unwrap_or_else(|| {
                        (
                            crate::presets::scaled_width(info.width, info.height, preset.target_height),
                            preset.target_height,
                        )
                    });
                qualities.push(QualityStats {
                    quality: quality.tag().to_string(),
                    width,
                    height,
                    bytes,
                });
            }
            Err(e) => {
                // Every rung is absorbed the same way: the attempt only
                // fails outright if none of them succeed (checked below).
                warn!(job_id = %job.id, quality = quality.tag(), error = %e, "quality rung failed, continuing");
            }
        }

        job.advance(*stage, base_progress + 12.0);
        persist_and_notify(job, ctx).await?;
    }

    if qualities.is_empty() {
        return Err(PipelineError::TranscodeFailed("no quality rungs succeeded".to_string()).into());
    }

    job.advance(Stage::HlsConversion, 75.0);
    persist_and_notify(job, ctx).await?;
    run_hls_stage(job, ctx, layout, &qualities, &mut variants).await;

    job.advance(Stage::ThumbnailCompression, 80.0);
    persist_and_notify(job, ctx).await?;
    let thumbnail_url = run_thumbnail_stage(job, ctx, layout).await;

    let result = build_result_record(job, layout, &info, &qualities, &variants, thumbnail_url, started);
    job.mark_completed(result.clone());
    ctx.broker.finalize(job).await?;
    ctx.emit(
        job,
        EventPayload::Completed { result },
    )
    .await;

    Ok(())
}

/// Extension used for the on-disk `original.<ext>` name, derived from the
/// submission's media path so it stays the same whether the source comes
/// from the uploads root or gets fetched remotely.
fn source_ext(job: &Job) -> String {
    job.submission
        .wp_media_path
        .rsplit('.')
        .next()
        .filter(|s| s.len() <= 4 && !s.is_empty())
        .unwrap_or("mp4")
        .to_string()
}

/// Joins the uploads root with the submitted media path, stripping any
/// leading slash so `Path::join` doesn't treat it as absolute and discard
/// the root.
fn local_candidate_path(uploads_root: &std::path::Path, wp_media_path: &str) -> std::path::PathBuf {
    uploads_root.join(wp_media_path.trim_start_matches('/'))
}

/// Uses the already-uploaded local copy under the uploads root if present;
/// otherwise fetches the remote URL under the SSRF guard. Per §4.4's download
/// policy, a local copy always wins so a reprocess doesn't re-fetch.
async fn download_source(job: &mut Job, ctx: &PipelineContext, layout: &MediaLayout) -> Result<()> {
    job.advance(Stage::Downloading, 0.0);
    persist_and_notify(job, ctx).await?;

    let ext = source_ext(job);
    let dest = layout.original_path(&ext);

    let local_candidate = local_candidate_path(&ctx.uploads_root, &job.submission.wp_media_path);

    if local_candidate.is_file() {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&local_candidate, &dest)
            .map_err(|e| PipelineError::FileNotFound(format!("{}: {}", local_candidate.display(), e)))?;
        return Ok(());
    }

    let url = job
        .submission
        .wp_video_url
        .clone()
        .ok_or_else(|| PipelineError::ValidationError("wp_video_url missing".to_string()))?;

    guarded_fetch(
        &ctx.http_client,
        &url,
        &dest,
        FetchKind::Video,
        &ctx.download_policy,
    )
    .await?;

    Ok(())
}

fn validate_source(info: &crate::probe::VideoInfo, ctx: &PipelineContext) -> Result<()> {
    validate_limits(info, ctx.max_file_size_bytes, ctx.max_duration_secs)
}

/// Enforces §4.4's validation limits: size, duration, and the closed
/// codec/container allowlists. Pulled out of `validate_source` so it can be
/// exercised without a full `PipelineContext`.
fn validate_limits(info: &crate::probe::VideoInfo, max_file_size_bytes: u64, max_duration_secs: f64) -> Result<()> {
    if info.file_size > max_file_size_bytes {
        return Err(PipelineError::FileTooLarge {
            size: info.file_size,
            limit: max_file_size_bytes,
        }
        .into());
    }
    if info.duration > max_duration_secs {
        return Err(PipelineError::DurationTooLong {
            duration: info.duration,
            limit: max_duration_secs,
        }
        .into());
    }
    let codec = info.video_codec.to_ascii_lowercase();
    if !ALLOWED_CODECS.contains(&codec.as_str()) {
        return Err(PipelineError::InvalidCodec(info.video_codec.clone()).into());
    }
    let container = info.container.to_ascii_lowercase();
    if !ALLOWED_CONTAINERS.contains(&container.as_str()) {
        return Err(PipelineError::InvalidContainer(info.container.clone()).into());
    }
    Ok(())
}

async fn run_hls_stage(
    job: &Job,
    ctx: &PipelineContext,
    layout: &MediaLayout,
    qualities: &[QualityStats],
    variants: &mut Vec<Variant>,
) {
    for stat in qualities {
        let quality = match stat.quality.as_str() {
            "480p" => Quality::P480,
            "360p" => Quality::P360,
            "240p" => Quality::P240,
            "144p" => Quality::P144,
            _ => continue,
        };
        let source = layout.compressed_path(quality);
        match segment(&source, &layout.hls_dir(), quality, ctx.hls_time_secs).await {
            Ok(_) => variants.push(Variant {
                quality,
                width: stat.width,
                height: stat.height,
            }),
            Err(e) => {
                warn!(job_id = %job.id, quality = quality.tag(), error = %e, "hls segmentation failed, continuing without this variant");
            }
        }
    }

    if !variants.is_empty() {
        let playlist = build_master_playlist(variants.clone());
        if let Err(e) = std::fs::write(layout.master_playlist_path(), playlist) {
            warn!(job_id = %job.id, error = %e, "failed to write master playlist");
        }
    }
}

async fn run_thumbnail_stage(
    job: &Job,
    ctx: &PipelineContext,
    layout: &MediaLayout,
) -> Option<String> {
    let source = if let Some(path) = &job.submission.wp_thumbnail_path {
        std::path::PathBuf::from(path)
    } else if let Some(url) = &job.submission.wp_thumbnail_url {
        let tmp = layout.dir().join("thumbnail_source.tmp");
        if let Err(e) = guarded_fetch(&ctx.http_client, url, &tmp, FetchKind::Image, &ctx.download_policy).await {
            warn!(job_id = %job.id, error = %e, "thumbnail download failed, skipping thumbnail");
            return None;
        }
        tmp
    } else {
        return None;
    };

    match resize_to_webp(&source, &layout.thumbnail_path(), &ctx.thumbnail) {
        Ok(_) => Some(layout.thumbnail_url()),
        Err(e) => {
            warn!(job_id = %job.id, error = %e, "thumbnail encode failed, continuing without it");
            None
        }
    }
}

fn build_result_record(
    job: &Job,
    layout: &MediaLayout,
    info: &crate::probe::VideoInfo,
    qualities: &[QualityStats],
    variants: &[Variant],
    thumbnail_url: Option<String>,
    started: Instant,
) -> ResultRecord {
    let has = |tag: &str| qualities.iter().any(|q| q.quality == tag);
    let compressed_size: u64 = qualities.iter().map(|q| q.bytes).sum();

    let has_hls = |q: Quality| variants.iter().any(|v| v.quality == q);

    ResultRecord {
        compressed_480p_url: has("480p").then(|| layout.compressed_url(Quality::P480)),
        compressed_360p_url: has("360p").then(|| layout.compressed_url(Quality::P360)),
        compressed_240p_url: has("240p").then(|| layout.compressed_url(Quality::P240)),
        compressed_144p_url: has("144p").then(|| layout.compressed_url(Quality::P144)),
        compressed_thumbnail_webp: thumbnail_url,
        hls_master_url: (!variants.is_empty()).then(|| layout.master_playlist_url()),
        hls_480p: has_hls(Quality::P480).then(|| layout.variant_playlist_url(Quality::P480)),
        hls_360p: has_hls(Quality::P360).then(|| layout.variant_playlist_url(Quality::P360)),
        hls_240p: has_hls(Quality::P240).then(|| layout.variant_playlist_url(Quality::P240)),
        hls_144p: has_hls(Quality::P144).then(|| layout.variant_playlist_url(Quality::P144)),
        original_size: info.file_size,
        compressed_size,
        compression_ratio: if compressed_size > 0 {
            info.file_size as f64 / compressed_size as f64
        } else {
            0.0
        },
        duration: info.duration,
        processing_time: started.elapsed().as_secs_f64(),
        qualities: qualities.to_vec(),
    }
}

async fn persist_and_notify(job: &mut Job, ctx: &PipelineContext) -> Result<()> {
    ctx.broker.update_progress(job).await?;
    ctx.emit(job, EventPayload::Progress).await;
    info!(job_id = %job.id, stage = job.stage.tag(), progress = job.progress, "advanced");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::new_job;
    use crate::job::Submission;

    fn sample_job() -> Job {
        new_job(
            Submission {
                post_id: 1,
                wp_media_path: "/uploads/clip.mp4".to_string(),
                wp_video_url: Some("https://example.com/clip.mp4".to_string()),
                wp_thumbnail_path: None,
                wp_thumbnail_url: None,
                wp_post_url: None,
                year: 2025,
                month: 1,
            },
            0,
        )
    }

    fn sample_info(codec: &str, container: &str, file_size: u64, duration: f64) -> crate::probe::VideoInfo {
        crate::probe::VideoInfo {
            duration,
            video_codec: codec.to_string(),
            audio_codec: None,
            container: container.to_string(),
            width: 640,
            height: 480,
            bitrate: None,
            frame_rate: None,
            file_size,
        }
    }

    #[test]
    fn validate_source_rejects_oversized_file() {
        let info = sample_info("h264", "mov", 200, 1.0);
        let err = validate_limits(&info, 100, 3600.0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::FileTooLarge { .. })
        ));
    }

    #[test]
    fn validate_source_rejects_overlong_duration() {
        let info = sample_info("h264", "mov", 100, 9000.0);
        let err = validate_limits(&info, 1_000_000, 3600.0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::DurationTooLong { .. })
        ));
    }

    #[test]
    fn validate_source_rejects_disallowed_codec() {
        let info = sample_info("wmv3", "mov", 100, 1.0);
        let err = validate_limits(&info, 1_000_000, 3600.0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::InvalidCodec(_))
        ));
    }

    #[test]
    fn validate_source_rejects_disallowed_container() {
        let info = sample_info("h264", "avi", 100, 1.0);
        let err = validate_limits(&info, 1_000_000, 3600.0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::InvalidContainer(_))
        ));
    }

    #[test]
    fn validate_source_accepts_mov_and_matroska_quirks() {
        assert!(validate_limits(&sample_info("h264", "mov", 100, 1.0), 1_000_000, 3600.0).is_ok());
        assert!(validate_limits(&sample_info("vp9", "matroska", 100, 1.0), 1_000_000, 3600.0).is_ok());
        assert!(validate_limits(&sample_info("av1", "webm", 100, 1.0), 1_000_000, 3600.0).is_ok());
    }

    #[test]
    fn source_ext_derives_from_media_path() {
        let job = sample_job();
        assert_eq!(source_ext(&job), "mp4");
    }

    #[test]
    fn source_ext_falls_back_when_no_plausible_extension() {
        let mut job = sample_job();
        job.submission.wp_media_path = "/uploads/clip_no_extension".to_string();
        assert_eq!(source_ext(&job), "mp4");
    }

    #[test]
    fn local_candidate_path_strips_leading_slash() {
        let root = std::path::Path::new("/var/uploads");
        let p = local_candidate_path(root, "/clip.mp4");
        assert_eq!(p, std::path::Path::new("/var/uploads/clip.mp4"));
    }

    #[test]
    fn result_record_omits_missing_quality_urls() {
        let job = sample_job();
        let layout = MediaLayout::new(std::path::Path::new("/content"), "https://example.com", 2025, 1, 1);
        let info = crate::probe::VideoInfo {
            duration: 10.0,
            video_codec: "h264".to_string(),
            audio_codec: Some("aac".to_string()),
            container: "mov".to_string(),
            width: 1920,
            height: 1080,
            bitrate: None,
            frame_rate: None,
            file_size: 1000,
        };
        let qualities = vec![QualityStats {
            quality: "480p".to_string(),
            width: 854,
            height: 480,
            bytes: 500,
        }];
        let result = build_result_record(&job, &layout, &info, &qualities, &[], None, Instant::now());
        assert!(result.compressed_480p_url.is_some());
        assert!(result.compressed_360p_url.is_none());
        assert_eq!(result.compression_ratio, 2.0);
    }
}
