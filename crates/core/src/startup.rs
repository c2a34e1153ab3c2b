use crate::broker::Broker;
use anyhow::{anyhow, Context, Result};
use regex::Regex;
use std::path::Path;
use std::process::Command;
use std::time::Duration;
use tracing::{error, info};

/// Oldest ffmpeg major version this system will run against.
const MIN_FFMPEG_MAJOR: u32 = 4;

/// Checks `ffmpeg -version` is runnable and parses the major.minor.patch
/// triple, the same regex-over-stdout approach the teacher's startup check
/// uses for its own ffmpeg gate.
pub fn check_ffmpeg_version() -> Result<(u32, u32, u32)> {
    let output = Command::new("ffmpeg")
        .arg("-version")
        .output()
        .context("Failed to execute ffmpeg -version. Is ffmpeg installed and in PATH?")?;

    if !output.status.success() {
        return Err(anyhow!("ffmpeg -version command failed"));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let re = Regex::new(r"ffmpeg version[^\d]*(\d+)\.(\d+)\.(\d+)").unwrap();

    if let Some(caps) = re.captures(&stdout) {
        let major: u32 = caps[1].parse().context("Failed to parse major version")?;
        let minor: u32 = caps[2].parse().context("Failed to parse minor version")?;
        let patch: u32 = caps[3].parse().context("Failed to parse patch version")?;
        Ok((major, minor, patch))
    } else {
        Err(anyhow!(
            "Failed to parse ffmpeg version from output: {}",
            stdout
        ))
    }
}

/// Confirms `ffmpeg -encoders` lists `libx264`, required by every transcode
/// job this system runs.
pub fn check_libx264_available() -> Result<()> {
    let output = Command::new("ffmpeg")
        .arg("-hide_banner")
        .arg("-encoders")
        .output()
        .context("Failed to execute ffmpeg -encoders")?;

    if !output.status.success() {
        return Err(anyhow!("ffmpeg -encoders command failed"));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !stdout.contains("libx264") {
        return Err(anyhow!(
            "libx264 encoder not found. Please install an ffmpeg build with libx264 support."
        ));
    }

    Ok(())
}

/// Confirms ffprobe is runnable; it's invoked as a separate binary from
/// ffmpeg and its absence would otherwise surface as a confusing failure
/// deep inside the first job.
pub fn check_ffprobe_available() -> Result<()> {
    let output = Command::new("ffprobe")
        .arg("-version")
        .output()
        .context("Failed to execute ffprobe -version. Is ffprobe installed and in PATH?")?;

    if !output.status.success() {
        return Err(anyhow!("ffprobe -version command failed"));
    }
    Ok(())
}

/// Fails fast if Redis isn't reachable, rather than letting the first
/// `claim_next` call surface the connection error mid-loop.
pub async fn check_redis_connectivity(redis_url: &str) -> Result<()> {
    let client = redis::Client::open(redis_url).context("invalid redis URL")?;
    let mut conn = tokio::time::timeout(Duration::from_secs(5), client.get_connection_manager())
        .await
        .context("timed out connecting to redis")?
        .context("failed to connect to redis")?;

    let _: String = redis::cmd("PING")
        .query_async(&mut conn)
        .await
        .context("redis PING failed")?;

    Ok(())
}

/// Creates `dir` if missing and confirms it's writable by touching and
/// removing a probe file. Used for both the uploads and content roots at
/// startup so a permissions problem surfaces before the first job, not
/// halfway through a transcode.
pub fn check_dir_writable(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create directory {}", dir.display()))?;

    let probe = dir.join(".compressd-write-check");
    std::fs::write(&probe, b"ok")
        .with_context(|| format!("directory not writable: {}", dir.display()))?;
    let _ = std::fs::remove_file(&probe);
    Ok(())
}

/// Runs every startup gate in sequence, logging each as it passes. Any
/// failure here should terminate the process before it claims a single job.
pub async fn run_startup_checks(redis_url: &str, uploads_dir: &Path, content_dir: &Path) -> Result<()> {
    let (major, minor, patch) = check_ffmpeg_version()?;
    info!("ffmpeg {}.{}.{} detected", major, minor, patch);
    if major < MIN_FFMPEG_MAJOR {
        error!(
            "ffmpeg version {}.{}.{} is too old, {}.0 or higher is required",
            major, minor, patch, MIN_FFMPEG_MAJOR
        );
        return Err(anyhow!(
            "ffmpeg version {}.{}.{} is below the minimum supported major version {}",
            major,
            minor,
            patch,
            MIN_FFMPEG_MAJOR
        ));
    }

    check_libx264_available()?;
    info!("libx264 encoder available");

    check_ffprobe_available()?;
    info!("ffprobe available");

    check_redis_connectivity(redis_url).await?;
    info!("redis reachable at startup");

    check_dir_writable(uploads_dir)?;
    info!("uploads directory writable: {}", uploads_dir.display());

    check_dir_writable(content_dir)?;
    info!("content directory writable: {}", content_dir.display());

    Ok(())
}

/// Builds a connected broker, exiting the process on failure per this
/// system's fail-fast startup contract.
pub async fn connect_broker_or_exit(
    redis_url: &str,
    stall_window: Duration,
    max_attempts: u32,
) -> Broker {
    match Broker::connect(redis_url, stall_window, max_attempts).await {
        Ok(broker) => broker,
        Err(e) => {
            eprintln!("failed to connect to broker: {}", e);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    #[test]
    fn ffmpeg_version_regex_parses_standard_output() {
        let re = Regex::new(r"ffmpeg version[^\d]*(\d+)\.(\d+)\.(\d+)").unwrap();
        let caps = re.captures("ffmpeg version 6.1.1 Copyright (c) 2000-2023").unwrap();
        assert_eq!(&caps[1], "6");
        assert_eq!(&caps[2], "1");
        assert_eq!(&caps[3], "1");
    }

    #[test]
    fn ffmpeg_version_regex_handles_nightly_prefix() {
        let re = Regex::new(r"ffmpeg version[^\d]*(\d+)\.(\d+)\.(\d+)").unwrap();
        let caps = re.captures("ffmpeg version n6.0.100").unwrap();
        assert_eq!(&caps[1], "6");
    }

    #[test]
    fn min_ffmpeg_major_rejects_ancient_versions() {
        assert!(3 < MIN_FFMPEG_MAJOR);
        assert!(MIN_FFMPEG_MAJOR <= 6);
    }

    #[test]
    fn check_dir_writable_creates_missing_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("uploads").join("nested");
        assert!(!nested.exists());
        check_dir_writable(&nested).unwrap();
        assert!(nested.is_dir());
    }

    #[test]
    fn check_dir_writable_rejects_read_only_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let ro = tmp.path().join("ro");
        std::fs::create_dir_all(&ro).unwrap();
        let mut perms = std::fs::metadata(&ro).unwrap().permissions();
        perms.set_readonly(true);
        std::fs::set_permissions(&ro, perms).unwrap();

        let result = check_dir_writable(&ro);

        let mut perms = std::fs::metadata(&ro).unwrap().permissions();
        #[allow(clippy::permissions_set_readonly_false)]
        perms.set_readonly(false);
        std::fs::set_permissions(&ro, perms).unwrap();

        assert!(result.is_err());
    }
}
