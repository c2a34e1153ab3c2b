use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_key: String,
    pub admin_password: String,
    pub base_url: String,

    pub redis_host: String,
    pub redis_port: u16,
    pub redis_password: Option<String>,
    pub redis_database: u8,

    pub media_uploads_dir: PathBuf,
    pub media_content_dir: PathBuf,

    pub log_file: Option<PathBuf>,

    pub hls_time_secs: u32,
    pub thumbnail_quality: u8,
    pub thumbnail_max_width: u32,
    pub thumbnail_max_height: u32,

    pub webhook_url: Option<String>,

    pub allowed_download_domains: Vec<String>,
    pub verify_ssl_downloads: bool,

    pub parallel_limit: usize,
    pub allowed_origins: Vec<String>,

    pub max_duration_secs: f64,
    pub max_file_size_bytes: u64,

    pub stall_window_secs: u64,
    pub max_attempts: u32,
    pub retry_backoff_base_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            admin_password: String::new(),
            base_url: "http://localhost:8080".to_string(),

            redis_host: "127.0.0.1".to_string(),
            redis_port: 6379,
            redis_password: None,
            redis_database: 0,

            media_uploads_dir: PathBuf::from("/var/lib/compressd/uploads"),
            media_content_dir: PathBuf::from("/var/lib/compressd/content"),

            log_file: None,

            hls_time_secs: 3,
            thumbnail_quality: 60,
            thumbnail_max_width: 640,
            thumbnail_max_height: 640,

            webhook_url: None,

            allowed_download_domains: vec!["*".to_string()],
            verify_ssl_downloads: true,

            parallel_limit: 1,
            allowed_origins: vec![],

            max_duration_secs: 300.0,
            max_file_size_bytes: 100 * 1024 * 1024,

            stall_window_secs: 120,
            max_attempts: 3,
            retry_backoff_base_secs: 5,
        }
    }
}

impl Config {
    /// Builds the `redis://` connection URL this config describes.
    pub fn redis_url(&self) -> String {
        match &self.redis_password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.redis_host, self.redis_port, self.redis_database
            ),
            None => format!(
                "redis://{}:{}/{}",
                self.redis_host, self.redis_port, self.redis_database
            ),
        }
    }
}

pub fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    let mut config = if let Some(config_path) = path {
        if config_path.exists() {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| anyhow::anyhow!("Failed to read config file: {}", e))?;

            toml::from_str::<Config>(&contents)
                .map_err(|e| anyhow::anyhow!("Failed to parse TOML config: {}", e))?
        } else {
            #[cfg(not(test))]
            tracing::warn!("Config file not found at {:?}, using defaults", config_path);
            Config::default()
        }
    } else {
        #[cfg(not(test))]
        tracing::info!("No config path provided, using defaults");
        Config::default()
    };

    apply_env_overrides(&mut config);
    validate_config(&config)?;
    Ok(config)
}

/// Environment variables override whatever the TOML file (or the defaults)
/// set, matching the precedence every config loader in the corpus uses.
fn apply_env_overrides(config: &mut Config) {
    use std::env::var;

    if let Ok(v) = var("API_KEY") {
        config.api_key = v;
    }
    if let Ok(v) = var("ADMIN_PASSWORD") {
        config.admin_password = v;
    }
    if let Ok(v) = var("BASE_URL") {
        config.base_url = v;
    }
    if let Ok(v) = var("REDIS_HOST") {
        config.redis_host = v;
    }
    if let Ok(v) = var("REDIS_PORT") {
        if let Ok(p) = v.parse() {
            config.redis_port = p;
        }
    }
    if let Ok(v) = var("REDIS_PASSWORD") {
        config.redis_password = Some(v);
    }
    if let Ok(v) = var("REDIS_DATABASE") {
        if let Ok(d) = v.parse() {
            config.redis_database = d;
        }
    }
    if let Ok(v) = var("MEDIA_UPLOADS_DIR") {
        config.media_uploads_dir = PathBuf::from(v);
    }
    if let Ok(v) = var("MEDIA_CONTENT_DIR") {
        config.media_content_dir = PathBuf::from(v);
    }
    if let Ok(v) = var("LOG_FILE") {
        config.log_file = Some(PathBuf::from(v));
    }
    if let Ok(v) = var("HLS_TIME") {
        if let Ok(t) = v.parse() {
            config.hls_time_secs = t;
        }
    }
    if let Ok(v) = var("THUMBNAIL_QUALITY") {
        if let Ok(q) = v.parse() {
            config.thumbnail_quality = q;
        }
    }
    if let Ok(v) = var("THUMBNAIL_MAX_WIDTH") {
        if let Ok(w) = v.parse() {
            config.thumbnail_max_width = w;
        }
    }
    if let Ok(v) = var("THUMBNAIL_MAX_HEIGHT") {
        if let Ok(h) = v.parse() {
            config.thumbnail_max_height = h;
        }
    }
    if let Ok(v) = var("WORDPRESS_WEBHOOK_URL") {
        config.webhook_url = Some(v);
    }
    if let Ok(v) = var("ALLOWED_DOWNLOAD_DOMAINS") {
        config.allowed_download_domains = v.split(',').map(|s| s.trim().to_string()).collect();
    }
    if let Ok(v) = var("VERIFY_SSL_DOWNLOADS") {
        config.verify_ssl_downloads = v == "true" || v == "1";
    }
    if let Ok(v) = var("PARALLEL_LIMIT") {
        if let Ok(p) = v.parse() {
            config.parallel_limit = p;
        }
    }
    if let Ok(v) = var("ALLOWED_ORIGINS") {
        config.allowed_origins = v.split(',').map(|s| s.trim().to_string()).collect();
    }

    config.hls_time_secs = config.hls_time_secs.clamp(2, 3);
}

pub fn validate_config(config: &Config) -> Result<()> {
    if config.parallel_limit == 0 {
        anyhow::bail!("parallel_limit must be at least 1");
    }

    if config.hls_time_secs < 2 || config.hls_time_secs > 3 {
        anyhow::bail!("hls_time_secs must be between 2 and 3");
    }

    if config.thumbnail_quality > 100 {
        anyhow::bail!("thumbnail_quality must be between 0 and 100");
    }

    if config.max_attempts == 0 {
        anyhow::bail!("max_attempts must be at least 1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn arb_config() -> impl Strategy<Value = Config> {
        (
            1_usize..32_usize,
            2_u32..=3_u32,
            0_u8..=100_u8,
            1_u32..10_u32,
            1_000_000_u64..100_000_000_000_u64,
        )
            .prop_map(
                |(parallel_limit, hls_time_secs, thumbnail_quality, max_attempts, max_file_size_bytes)| {
                    Config {
                        parallel_limit,
                        hls_time_secs,
                        thumbnail_quality,
                        max_attempts,
                        max_file_size_bytes,
                        ..Default::default()
                    }
                },
            )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// For any valid Config, serializing to TOML and then deserializing
        /// should produce an equivalent configuration.
        #[test]
        fn prop_config_round_trip(config in arb_config()) {
            let toml_string = toml::to_string(&config)
                .expect("Failed to serialize config to TOML");

            let mut temp_file = NamedTempFile::new()
                .expect("Failed to create temp file");
            temp_file.write_all(toml_string.as_bytes())
                .expect("Failed to write to temp file");
            temp_file.flush()
                .expect("Failed to flush temp file");

            let loaded_config = load_config(Some(temp_file.path()))
                .expect("Failed to load config from file");

            prop_assert_eq!(config, loaded_config);
        }
    }

    #[test]
    fn test_missing_config_file_uses_defaults() {
        let non_existent_path = PathBuf::from("/tmp/non_existent_compressd_config_12345.toml");
        let config = load_config(Some(&non_existent_path)).expect("Should load defaults");
        assert_eq!(config.thumbnail_quality, 60);
        assert_eq!(config.parallel_limit, 1);
    }

    #[test]
    fn test_invalid_toml_syntax() {
        let mut temp_file = NamedTempFile::new().expect("Failed to create temp file");
        temp_file
            .write_all(b"this is not valid TOML {{{")
            .expect("Failed to write");
        temp_file.flush().expect("Failed to flush");

        let result = load_config(Some(temp_file.path()));
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("parse TOML"));
    }

    #[test]
    fn test_partial_config_with_defaults() {
        let mut temp_file = NamedTempFile::new().expect("Failed to create temp file");
        let partial_toml = r#"
base_url = "https://example.com"
parallel_limit = 4
"#;
        temp_file
            .write_all(partial_toml.as_bytes())
            .expect("Failed to write");
        temp_file.flush().expect("Failed to flush");

        let config = load_config(Some(temp_file.path())).expect("Should load partial config");

        assert_eq!(config.base_url, "https://example.com");
        assert_eq!(config.parallel_limit, 4);
        assert_eq!(config.thumbnail_quality, Config::default().thumbnail_quality);
    }

    #[test]
    fn test_validation_zero_parallel_limit() {
        let config = Config {
            parallel_limit: 0,
            ..Default::default()
        };
        let result = validate_config(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("parallel_limit"));
    }

    #[test]
    fn test_hls_time_clamped_by_env_override() {
        let mut config = Config {
            hls_time_secs: 10,
            ..Default::default()
        };
        apply_env_overrides(&mut config);
        assert!(config.hls_time_secs <= 3);
    }
}
