use crate::error::PipelineError;
use crate::presets::Quality;
use anyhow::Result;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

/// Reports fractional (0.0..=1.0) progress within a single ffmpeg invocation.
/// The pipeline folds this into the milestone buckets per stage; it never
/// reaches the caller as a raw percent.
pub type ProgressFn<'a> = dyn FnMut(f64) + Send + 'a;

/// Builds the libx264 transcode command for one quality rung.
///
/// Mirrors the teacher's push-pair `Vec<String>` construction style: every
/// flag and its value are pushed as separate elements, never combined with
/// `format!`.
pub fn build_transcode_command(
    input: &Path,
    output: &Path,
    quality: Quality,
    segment_secs: u32,
) -> Vec<String> {
    let preset = quality.preset();

    let mut cmd: Vec<String> = vec!["-y".to_string(), "-i".to_string(), path_str(input)];

    // Let ffmpeg derive an even width from the decoded frame rather than
    // precomputing one from probed dimensions: `-2` always rounds to an
    // even value, matching libx264's 4:2:0 requirement without risking
    // drift from the source's actual sample aspect ratio.
    cmd.push("-vf".to_string());
    cmd.push(format!("scale=-2:{}", preset.target_height));

    cmd.push("-c:v".to_string());
    cmd.push("libx264".to_string());
    cmd.push("-preset".to_string());
    cmd.push("slow".to_string());
    cmd.push("-crf".to_string());
    cmd.push(preset.crf.to_string());
    cmd.push("-b:v".to_string());
    cmd.push(format!("{}k", preset.video_bitrate_kbps));
    cmd.push("-profile:v".to_string());
    cmd.push("main".to_string());
    cmd.push("-level".to_string());
    cmd.push("3.1".to_string());
    cmd.push("-pix_fmt".to_string());
    cmd.push("yuv420p".to_string());
    cmd.push("-maxrate".to_string());
    cmd.push(format!("{}k", preset.max_bitrate_kbps));
    cmd.push("-bufsize".to_string());
    cmd.push(format!("{}k", preset.max_bitrate_kbps * 2));

    cmd.push("-g".to_string());
    cmd.push(format!("{}", segment_secs.max(1) * 30));
    cmd.push("-keyint_min".to_string());
    cmd.push(format!("{}", segment_secs.max(1) * 30));
    cmd.push("-sc_threshold".to_string());
    cmd.push("0".to_string());

    cmd.push("-map".to_string());
    cmd.push("0:v:0".to_string());
    cmd.push("-map".to_string());
    cmd.push("0:a:0?".to_string());
    cmd.push("-c:a".to_string());
    cmd.push("aac".to_string());
    cmd.push("-b:a".to_string());
    cmd.push("64k".to_string());
    cmd.push("-ar".to_string());
    cmd.push("44100".to_string());
    cmd.push("-ac".to_string());
    cmd.push("2".to_string());

    cmd.push("-movflags".to_string());
    cmd.push("+faststart".to_string());

    cmd.push(path_str(output));
    cmd
}

/// Builds the stream-copy segmentation command that turns an already-encoded
/// MP4 into a VOD HLS playlist plus numbered `.ts` segments.
pub fn build_segment_command(
    input: &Path,
    playlist: &Path,
    segment_pattern: &Path,
    segment_secs: u32,
) -> Vec<String> {
    vec![
        "-y".to_string(),
        "-i".to_string(),
        path_str(input),
        "-c".to_string(),
        "copy".to_string(),
        "-start_number".to_string(),
        "0".to_string(),
        "-hls_time".to_string(),
        segment_secs.to_string(),
        "-hls_list_size".to_string(),
        "0".to_string(),
        "-hls_playlist_type".to_string(),
        "vod".to_string(),
        "-hls_flags".to_string(),
        "independent_segments+append_list".to_string(),
        "-hls_segment_type".to_string(),
        "mpegts".to_string(),
        "-hls_segment_filename".to_string(),
        path_str(segment_pattern),
        path_str(playlist),
    ]
}

fn path_str(p: &Path) -> String {
    p.to_string_lossy().into_owned()
}

/// Drives an ffmpeg invocation to completion, parsing `-progress pipe:1`
/// key=value lines the same way the teacher's `execute_encode` does, folding
/// elapsed-time-over-duration into a fractional progress callback.
pub async fn run_ffmpeg(
    mut args: Vec<String>,
    total_duration_secs: f64,
    mut on_progress: impl FnMut(f64) + Send,
) -> Result<()> {
    let mut full_args = vec!["-progress".to_string(), "pipe:1".to_string(), "-nostats".to_string()];
    full_args.append(&mut args);

    let mut cmd = Command::new("ffmpeg");
    cmd.args(&full_args);
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| PipelineError::TranscodeFailed(format!("failed to spawn ffmpeg: {}", e)))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| PipelineError::TranscodeFailed("failed to capture stdout".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| PipelineError::TranscodeFailed("failed to capture stderr".to_string()))?;

    let stderr_task = tokio::spawn(async move {
        let reader = BufReader::new(stderr);
        let mut lines = reader.lines();
        let mut collected = Vec::new();
        while let Ok(Some(line)) = lines.next_line().await {
            collected.push(line);
        }
        collected
    });

    let mut reader = BufReader::new(stdout).lines();
    let mut out_time_secs: Option<f64> = None;
    let mut last_report = Instant::now()
        .checked_sub(Duration::from_millis(750))
        .unwrap_or_else(Instant::now);

    while let Ok(Some(line)) = reader.next_line().await {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some((k, v)) = trimmed.split_once('=') {
            match k {
                "out_time_ms" => {
                    if let Ok(ms) = v.parse::<u64>() {
                        out_time_secs = Some(ms as f64 / 1_000_000.0);
                    }
                }
                "out_time" => {
                    if out_time_secs.is_none() {
                        out_time_secs = parse_out_time(v);
                    }
                }
                "progress" if v == "end" => break,
                _ => {}
            }
        }

        if last_report.elapsed() >= Duration::from_millis(750) {
            if let Some(ots) = out_time_secs {
                if total_duration_secs > 0.0 {
                    on_progress((ots / total_duration_secs).clamp(0.0, 1.0));
                }
            }
            last_report = Instant::now();
        }
    }

    on_progress(1.0);

    let status = child
        .wait()
        .await
        .map_err(|e| PipelineError::TranscodeFailed(format!("failed to wait for ffmpeg: {}", e)))?;

    let stderr_lines = stderr_task.await.unwrap_or_default();

    if !status.success() {
        return Err(PipelineError::TranscodeFailed(format!(
            "ffmpeg exited with {:?}: {}",
            status.code(),
            stderr_lines.join("\n")
        ))
        .into());
    }

    Ok(())
}

fn parse_out_time(val: &str) -> Option<f64> {
    let parts: Vec<&str> = val.split(':').collect();
    if parts.len() != 3 {
        return None;
    }
    let h = parts.first()?.parse::<f64>().ok()?;
    let m = parts.get(1)?.parse::<f64>().ok()?;
    let s = parts.get(2)?.parse::<f64>().ok()?;
    Some(h * 3600.0 + m * 60.0 + s)
}

/// Produces `compressed_<quality>.mp4` from a validated source.
pub async fn transcode(
    input: &Path,
    output: &Path,
    quality: Quality,
    segment_secs: u32,
    duration_secs: f64,
    on_progress: impl FnMut(f64) + Send,
) -> Result<()> {
    let args = build_transcode_command(input, output, quality, segment_secs);
    run_ffmpeg(args, duration_secs, on_progress).await
}

/// Segments an already-transcoded MP4 into an HLS variant playlist.
pub async fn segment(
    input: &Path,
    hls_dir: &Path,
    quality: Quality,
    segment_secs: u32,
) -> Result<(PathBuf, usize)> {
    std::fs::create_dir_all(hls_dir)?;
    let playlist = hls_dir.join(format!("{}.m3u8", quality.tag()));
    let pattern = hls_dir.join(format!("{}_%03d.ts", quality.tag()));
    let args = build_segment_command(input, &playlist, &pattern, segment_secs);
    run_ffmpeg(args, 0.0, |_| {}).await?;

    let segment_count = std::fs::read_dir(hls_dir)?
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name()
                .to_string_lossy()
                .starts_with(&format!("{}_", quality.tag()))
        })
        .count();

    Ok((playlist, segment_count))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcode_command_uses_libx264_and_expected_crf() {
        let cmd = build_transcode_command(
            Path::new("/tmp/in.mp4"),
            Path::new("/tmp/out.mp4"),
            Quality::P480,
            3,
        );
        assert!(cmd.iter().any(|a| a == "libx264"));
        assert!(cmd.windows(2).any(|w| w[0] == "-crf" && w[1] == "23"));
        assert!(cmd.windows(2).any(|w| w[0] == "-pix_fmt" && w[1] == "yuv420p"));
    }

    #[test]
    fn segment_command_uses_stream_copy_and_vod_playlist() {
        let cmd = build_segment_command(
            Path::new("/tmp/in.mp4"),
            Path::new("/tmp/hls/480p.m3u8"),
            Path::new("/tmp/hls/480p_%03d.ts"),
            3,
        );
        assert!(cmd.windows(2).any(|w| w[0] == "-c" && w[1] == "copy"));
        assert!(cmd
            .windows(2)
            .any(|w| w[0] == "-hls_playlist_type" && w[1] == "vod"));
    }

    #[test]
    fn out_time_parses_hh_mm_ss() {
        assert_eq!(parse_out_time("00:00:10.500000"), Some(10.5));
        assert_eq!(parse_out_time("01:02:03.000000"), Some(3723.0));
        assert_eq!(parse_out_time("garbage"), None);
    }
}
