use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub source_base_url: String,
    pub source_base_id: String,
    pub source_token: Option<String>,
    pub videos_table: String,
    pub series_table: String,
    pub target_base_url: String,
    /// Library path prefix, e.g. `users/123456` or `groups/98765`.
    pub target_library: String,
    pub target_api_key: Option<String>,
    pub webhook_url: Option<String>,
    pub cache_enabled: bool,
    pub cache_dir: PathBuf,
    pub failure_artifact: PathBuf,
    pub collections_file: PathBuf,
    pub source_min_interval: Duration,
    pub target_min_interval: Duration,
    pub chunk_delay: Duration,
    pub notify_threshold: usize,
    pub notify_pause: Duration,
    pub transform_concurrency: usize,
    pub default_page_size: usize,
    pub utc_offset_hours: i32,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub web_port: u16,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            source_base_url: "https://api.airtable.com/v0".to_string(),
            source_base_id: String::new(),
            source_token: None,
            videos_table: "Videos".to_string(),
            series_table: "Series".to_string(),
            target_base_url: "https://api.zotero.org".to_string(),
            target_library: String::new(),
            target_api_key: None,
            webhook_url: None,
            cache_enabled: true,
            cache_dir: PathBuf::from("./cache"),
            failure_artifact: PathBuf::from("./failed-writes.json"),
            collections_file: PathBuf::from("./collections.yaml"),
            source_min_interval: Duration::from_millis(200),
            target_min_interval: Duration::from_millis(1000),
            chunk_delay: Duration::from_secs(1),
            notify_threshold: 30,
            notify_pause: Duration::from_secs(1),
            transform_concurrency: 4,
            default_page_size: 100,
            utc_offset_hours: -5,
            user_agent: "vsync-bot/0.1".to_string(),
            http_timeout_secs: 30,
            web_port: 8000,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            source_base_url: env_string("VSYNC_SOURCE_BASE_URL").unwrap_or(defaults.source_base_url),
            source_base_id: env_string("VSYNC_SOURCE_BASE_ID").unwrap_or(defaults.source_base_id),
            source_token: env_string("VSYNC_SOURCE_TOKEN"),
            videos_table: env_string("VSYNC_VIDEOS_TABLE").unwrap_or(defaults.videos_table),
            series_table: env_string("VSYNC_SERIES_TABLE").unwrap_or(defaults.series_table),
            target_base_url: env_string("VSYNC_TARGET_BASE_URL").unwrap_or(defaults.target_base_url),
            target_library: env_string("VSYNC_TARGET_LIBRARY").unwrap_or(defaults.target_library),
            target_api_key: env_string("VSYNC_TARGET_API_KEY"),
            webhook_url: env_string("VSYNC_WEBHOOK_URL"),
            cache_enabled: std::env::var("VSYNC_CACHE_ENABLED")
                .map(|v| !matches!(v.as_str(), "0" | "false" | "FALSE" | "False"))
                .unwrap_or(defaults.cache_enabled),
            cache_dir: env_string("VSYNC_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_dir),
            failure_artifact: env_string("VSYNC_FAILURE_ARTIFACT")
                .map(PathBuf::from)
                .unwrap_or(defaults.failure_artifact),
            collections_file: env_string("VSYNC_COLLECTIONS_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.collections_file),
            source_min_interval: env_parse("VSYNC_SOURCE_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.source_min_interval),
            target_min_interval: env_parse("VSYNC_TARGET_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.target_min_interval),
            chunk_delay: env_parse("VSYNC_CHUNK_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.chunk_delay),
            notify_threshold: env_parse("VSYNC_NOTIFY_THRESHOLD").unwrap_or(defaults.notify_threshold),
            notify_pause: env_parse("VSYNC_NOTIFY_PAUSE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.notify_pause),
            transform_concurrency: env_parse("VSYNC_TRANSFORM_CONCURRENCY")
                .unwrap_or(defaults.transform_concurrency),
            default_page_size: env_parse("VSYNC_PAGE_SIZE").unwrap_or(defaults.default_page_size),
            utc_offset_hours: env_parse("VSYNC_UTC_OFFSET_HOURS").unwrap_or(defaults.utc_offset_hours),
            user_agent: env_string("VSYNC_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("VSYNC_HTTP_TIMEOUT_SECS").unwrap_or(defaults.http_timeout_secs),
            web_port: env_parse("VSYNC_WEB_PORT").unwrap_or(defaults.web_port),
        }
    }

    /// Offset used for human-readable timestamps; out-of-range hours fall back to UTC.
    pub fn display_offset(&self) -> FixedOffset {
        self.utc_offset_hours
            .checked_mul(3600)
            .and_then(FixedOffset::east_opt)
            .unwrap_or_else(|| Utc.fix())
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}
