use crate::presets::Quality;
use std::path::{Path, PathBuf};

/// Deterministic on-disk layout for a job's outputs:
/// `<contentRoot>/<YYYY>/<MM>/<postId>/`.
#[derive(Debug, Clone)]
pub struct MediaLayout {
    pub root_dir: PathBuf,
    pub base_url: String,
    pub year: u32,
    pub month: u32,
    pub post_id: u64,
}

impl MediaLayout {
    pub fn new(content_root: &Path, base_url: &str, year: u32, month: u32, post_id: u64) -> Self {
        let root_dir = content_root
            .join(format!("{:04}", year))
            .join(format!("{:02}", month))
            .join(post_id.to_string());
        Self {
            root_dir,
            base_url: base_url.trim_end_matches('/').to_string(),
            year,
            month,
            post_id,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn hls_dir(&self) -> PathBuf {
        self.root_dir.join("hls")
    }

    pub fn original_path(&self, ext: &str) -> PathBuf {
        self.root_dir.join(format!("original.{}", ext))
    }

    pub fn compressed_path(&self, quality: Quality) -> PathBuf {
        self.root_dir
            .join(format!("compressed_{}.mp4", quality.tag()))
    }

    pub fn thumbnail_path(&self) -> PathBuf {
        self.root_dir.join("thumbnail.webp")
    }

    pub fn variant_playlist_path(&self, quality: Quality) -> PathBuf {
        self.hls_dir().join(format!("{}.m3u8", quality.tag()))
    }

    pub fn master_playlist_path(&self) -> PathBuf {
        self.hls_dir().join("master.m3u8")
    }

    fn url_prefix(&self) -> String {
        format!(
            "{}/content/{:04}/{:02}/{}",
            self.base_url, self.year, self.month, self.post_id
        )
    }

    pub fn compressed_url(&self, quality: Quality) -> String {
        format!(
            "{}/compressed_{}.mp4",
            self.url_prefix(),
            quality.tag()
        )
    }

    pub fn thumbnail_url(&self) -> String {
        format!("{}/thumbnail.webp", self.url_prefix())
    }

    pub fn variant_playlist_url(&self, quality: Quality) -> String {
        format!("{}/hls/{}.m3u8", self.url_prefix(), quality.tag())
    }

    pub fn master_playlist_url(&self) -> String {
        format!("{}/hls/master.m3u8", self.url_prefix())
    }

    /// Deletes any prior outputs under this layout's directory so a reprocess
    /// attempt starts from a clean slate. Never fails on missing paths.
    pub fn clean(&self) -> std::io::Result<()> {
        if !self.root_dir.exists() {
            return Ok(());
        }
        for entry in std::fs::read_dir(&self.root_dir)? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("original.")
                || name.starts_with("compressed_")
                || name == "hls"
                || name.starts_with("thumbnail.")
            {
                if path.is_dir() {
                    std::fs::remove_dir_all(&path)?;
                } else {
                    std::fs::remove_file(&path)?;
                }
            }
        }
        Ok(())
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root_dir)?;
        std::fs::create_dir_all(self.hls_dir())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths_match_spec_convention() {
        let layout = MediaLayout::new(Path::new("/content"), "https://example.com", 2025, 1, 42);
        assert_eq!(
            layout.dir(),
            Path::new("/content/2025/01/42")
        );
        assert_eq!(
            layout.compressed_path(Quality::P480),
            Path::new("/content/2025/01/42/compressed_480p.mp4")
        );
        assert_eq!(
            layout.compressed_url(Quality::P480),
            "https://example.com/content/2025/01/42/compressed_480p.mp4"
        );
        assert_eq!(
            layout.master_playlist_url(),
            "https://example.com/content/2025/01/42/hls/master.m3u8"
        );
    }

    #[test]
    fn clean_is_a_noop_on_missing_directory() {
        let layout = MediaLayout::new(
            Path::new("/tmp/compressd-test-layout-missing"),
            "https://example.com",
            2025,
            1,
            999999,
        );
        assert!(layout.clean().is_ok());
    }

    #[test]
    fn clean_removes_prior_outputs_but_nothing_else() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = MediaLayout::new(tmp.path(), "https://example.com", 2025, 1, 1);
        layout.ensure_dirs().unwrap();
        std::fs::write(layout.original_path("mp4"), b"x").unwrap();
        std::fs::write(layout.compressed_path(Quality::P480), b"x").unwrap();
        std::fs::write(layout.dir().join("unrelated.txt"), b"keep me").unwrap();

        layout.clean().unwrap();

        assert!(!layout.original_path("mp4").exists());
        assert!(!layout.compressed_path(Quality::P480).exists());
        assert!(layout.dir().join("unrelated.txt").exists());
    }
}
