use crate::error::PipelineError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::process::Command;

/// Metadata extracted from a source or output file by `ffprobe`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoInfo {
    pub duration: f64,
    pub video_codec: String,
    pub audio_codec: Option<String>,
    pub container: String,
    pub width: u32,
    pub height: u32,
    pub bitrate: Option<u64>,
    pub frame_rate: Option<String>,
    pub file_size: u64,
}

// Internal FFprobe JSON structures, mirroring the real shape ffprobe emits.
#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
    streams: Option<Vec<FfprobeStream>>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
    size: Option<String>,
    bit_rate: Option<String>,
    format_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: String,
    codec_name: String,
    width: Option<u32>,
    height: Option<u32>,
    bit_rate: Option<String>,
    r_frame_rate: Option<String>,
}

/// Run ffprobe against `path` and build a `VideoInfo`, applying this
/// system's corruption rule: no video stream, zero duration, or zero
/// dimensions all count as `VideoCorrupted`.
pub async fn probe(path: &Path) -> Result<VideoInfo> {
    if !path.exists() {
        return Err(PipelineError::FileNotFound(path.display().to_string()).into());
    }

    let output = Command::new("ffprobe")
        .arg("-v")
        .arg("quiet")
        .arg("-print_format")
        .arg("json")
        .arg("-show_format")
        .arg("-show_streams")
        .arg(path)
        .output()
        .await
        .context("Failed to execute ffprobe")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PipelineError::VideoCorrupted(stderr.trim().to_string()).into());
    }

    let stdout = String::from_utf8(output.stdout).context("ffprobe output is not valid UTF-8")?;
    let parsed: FfprobeOutput =
        serde_json::from_str(&stdout).context("Failed to parse ffprobe JSON output")?;

    build_video_info(parsed)
}

fn build_video_info(output: FfprobeOutput) -> Result<VideoInfo> {
    let format = output
        .format
        .ok_or_else(|| PipelineError::VideoCorrupted("missing format block".to_string()))?;

    let duration: f64 = format
        .duration
        .as_deref()
        .and_then(|d| d.parse().ok())
        .unwrap_or(0.0);

    let file_size: u64 = format.size.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0);
    let bitrate = format.bit_rate.as_deref().and_then(|b| b.parse().ok());
    let container = format
        .format_name
        .unwrap_or_default()
        .split(',')
        .next()
        .unwrap_or("")
        .to_string();

    let streams = output.streams.unwrap_or_default();
    let video = streams.iter().find(|s| s.codec_type == "video");
    let audio = streams.iter().find(|s| s.codec_type == "audio");

    let video = match video {
        Some(v) => v,
        None => {
            return Err(PipelineError::VideoCorrupted("no video stream".to_string()).into())
        }
    };

    let (width, height) = match (video.width, video.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => {
            return Err(
                PipelineError::VideoCorrupted("missing or zero dimensions".to_string()).into(),
            )
        }
    };

    if duration <= 0.0 {
        return Err(PipelineError::VideoCorrupted("zero duration".to_string()).into());
    }

    Ok(VideoInfo {
        duration,
        video_codec: video.codec_name.clone(),
        audio_codec: audio.map(|a| a.codec_name.clone()),
        container,
        width,
        height,
        bitrate: video.bit_rate.as_deref().and_then(|b| b.parse().ok()).or(bitrate),
        frame_rate: video.r_frame_rate.clone(),
        file_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_output_with_no_video_stream() {
        let parsed: FfprobeOutput = serde_json::from_str(
            r#"{"format":{"duration":"10.0","size":"1000"},"streams":[{"codec_type":"audio","codec_name":"aac"}]}"#,
        )
        .unwrap();
        let result = build_video_info(parsed);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_zero_duration() {
        let parsed: FfprobeOutput = serde_json::from_str(
            r#"{"format":{"duration":"0","size":"1000"},"streams":[{"codec_type":"video","codec_name":"h264","width":640,"height":480}]}"#,
        )
        .unwrap();
        let result = build_video_info(parsed);
        assert!(result.is_err());
    }

    #[test]
    fn accepts_well_formed_output() {
        let parsed: FfprobeOutput = serde_json::from_str(
            r#"{"format":{"duration":"12.5","size":"204800","bit_rate":"131072","format_name":"mov,mp4,m4a"},"streams":[{"codec_type":"video","codec_name":"h264","width":1920,"height":1080,"r_frame_rate":"30/1"},{"codec_type":"audio","codec_name":"aac"}]}"#,
        )
        .unwrap();
        let info = build_video_info(parsed).unwrap();
        assert_eq!(info.width, 1920);
        assert_eq!(info.height, 1080);
        assert_eq!(info.video_codec, "h264");
        assert_eq!(info.audio_codec.as_deref(), Some("aac"));
        assert_eq!(info.container, "mov");
        assert!((info.duration - 12.5).abs() < f64::EPSILON);
    }
}
