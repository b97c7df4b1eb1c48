use chrono::TimeDelta;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::platform;
use crate::logger::{LoggerSettings, DEFAULT_IDLE_EVICT_SECS, DEFAULT_SUPPRESS_WINDOW_SECS};
use crate::playback::{
    RetryPolicy, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_MAX_RECONNECT_ATTEMPTS,
    DEFAULT_RECONNECT_DELAY_MS,
};
use crate::poller::DEFAULT_POLL_INTERVAL_SECS;
use crate::snapshot::DEFAULT_DURABLE_TTL_SECS;
use crate::timezone;
use crate::track::NormalizerOptions;

/// Environment override for `[http] cron_token`.
pub const CRON_TOKEN_ENV: &str = "ONAIR_CRON_TOKEN";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub logger: LoggerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Durable now-playing cache written by the poller.
    #[serde(default = "default_snapshot_cache_file")]
    pub snapshot_cache_file: PathBuf,
    /// Optional snapshot injected at startup (same JSON envelope).
    #[serde(default)]
    pub boot_snapshot_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bearer token for the scheduled log job. Unset disables the endpoint.
    #[serde(default)]
    pub cron_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default)]
    pub api_url: String,
    /// Cached copy of the feed, preferred for the first fetch.
    #[serde(default)]
    pub edge_url: Option<String>,
    #[serde(default)]
    pub station_id: String,
    #[serde(default = "default_station_name")]
    pub station_name: String,
    #[serde(default)]
    pub artwork_base: String,
    #[serde(default)]
    pub generic_artwork_url: String,
    /// IANA zone the feed's wall-clock timestamps are in.
    #[serde(default = "default_source_timezone")]
    pub source_timezone: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_recent")]
    pub max_recent: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggerConfig {
    #[serde(default = "default_suppress_window_secs")]
    pub suppress_window_secs: u64,
    #[serde(default = "default_idle_evict_secs")]
    pub idle_evict_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_durable_ttl_secs")]
    pub durable_ttl_secs: u64,
    #[serde(default = "default_server_ttl_secs")]
    pub server_ttl_secs: u64,
    #[serde(default = "default_boot_ttl_secs")]
    pub boot_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    #[serde(default)]
    pub stream_url: String,
    #[serde(default = "default_volume")]
    pub default_volume: f32,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// 0 disables the connect watchdog.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            snapshot_cache_file: default_snapshot_cache_file(),
            boot_snapshot_file: None,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_port(),
            cron_token: None,
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            edge_url: None,
            station_id: String::new(),
            station_name: default_station_name(),
            artwork_base: String::new(),
            generic_artwork_url: String::new(),
            source_timezone: default_source_timezone(),
            poll_interval_secs: default_poll_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            max_recent: default_max_recent(),
        }
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            suppress_window_secs: default_suppress_window_secs(),
            idle_evict_secs: default_idle_evict_secs(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            durable_ttl_secs: default_durable_ttl_secs(),
            server_ttl_secs: default_server_ttl_secs(),
            boot_ttl_secs: default_boot_ttl_secs(),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            stream_url: String::new(),
            default_volume: default_volume(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

fn default_snapshot_cache_file() -> PathBuf {
    platform::data_dir().join("now_playing.json")
}

fn default_http_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8990
}

fn default_station_name() -> String {
    "onair".to_string()
}

fn default_source_timezone() -> String {
    "America/Chicago".to_string()
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_max_recent() -> usize {
    10
}

fn default_suppress_window_secs() -> u64 {
    DEFAULT_SUPPRESS_WINDOW_SECS
}

fn default_idle_evict_secs() -> u64 {
    DEFAULT_IDLE_EVICT_SECS
}

fn default_db_path() -> PathBuf {
    platform::data_dir().join("plays.sqlite3")
}

fn default_durable_ttl_secs() -> u64 {
    DEFAULT_DURABLE_TTL_SECS
}

fn default_server_ttl_secs() -> u64 {
    60
}

fn default_boot_ttl_secs() -> u64 {
    DEFAULT_DURABLE_TTL_SECS
}

fn default_volume() -> f32 {
    0.8
}

fn default_max_reconnect_attempts() -> u32 {
    DEFAULT_MAX_RECONNECT_ATTEMPTS
}

fn default_reconnect_delay_ms() -> u64 {
    DEFAULT_RECONNECT_DELAY_MS
}

fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

fn secs(s: u64) -> TimeDelta {
    TimeDelta::seconds(s.min(i64::MAX as u64) as i64)
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Read `path`, writing defaults there first if it does not exist.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            let config = Self::default();
            config.save_to(path)?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }

    pub fn source_zone(&self) -> crate::Result<Tz> {
        timezone::parse_zone(&self.upstream.source_timezone)
    }

    /// Environment wins over the file. Empty values count as unset.
    pub fn cron_token(&self) -> Option<String> {
        std::env::var(CRON_TOKEN_ENV)
            .ok()
            .or_else(|| self.http.cron_token.clone())
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.upstream.poll_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.request_timeout_secs.max(1))
    }

    pub fn normalizer_options(&self) -> NormalizerOptions {
        NormalizerOptions {
            artwork_base: self.upstream.artwork_base.clone(),
            station_id: self.upstream.station_id.clone(),
            generic_artwork_url: self.upstream.generic_artwork_url.clone(),
            max_recent: self.upstream.max_recent,
        }
    }

    pub fn logger_settings(&self) -> crate::Result<LoggerSettings> {
        Ok(LoggerSettings {
            source_zone: self.source_zone()?,
            suppress_window: secs(self.logger.suppress_window_secs),
            idle_evict: secs(self.logger.idle_evict_secs),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let timeout = self.playback.connect_timeout_secs;
        RetryPolicy {
            max_attempts: self.playback.max_reconnect_attempts,
            delay: Duration::from_millis(self.playback.reconnect_delay_ms),
            connect_timeout: (timeout > 0).then(|| Duration::from_secs(timeout)),
        }
    }

    pub fn durable_ttl(&self) -> TimeDelta {
        secs(self.cache.durable_ttl_secs)
    }

    pub fn server_ttl(&self) -> TimeDelta {
        secs(self.cache.server_ttl_secs)
    }

    pub fn boot_ttl(&self) -> TimeDelta {
        secs(self.cache.boot_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.http.enabled);
        assert_eq!(config.http.port, 8990);
        assert_eq!(config.http.bind_address, "127.0.0.1");
        assert_eq!(config.upstream.source_timezone, "America/Chicago");
        assert_eq!(config.upstream.poll_interval_secs, 30);
        assert_eq!(config.logger.suppress_window_secs, 180);
        assert_eq!(config.logger.idle_evict_secs, 900);
        assert_eq!(config.cache.durable_ttl_secs, 300);
        assert!(config.daemon.snapshot_cache_file.ends_with("onair/now_playing.json"));
        assert_eq!(config.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [upstream]
            api_url = "https://feed.example.net/nowplaying"
            source_timezone = "America/New_York"

            [playback]
            connect_timeout_secs = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.upstream.max_recent, 10);
        assert_eq!(config.http.port, 8990);
        assert!(config.source_zone().is_ok());
        assert_eq!(config.retry_policy().connect_timeout, None);
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("onair").join("config.toml");
        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.http.port, 8990);
        let again = Config::load_from(&path).unwrap();
        assert_eq!(again.upstream.station_name, config.upstream.station_name);
    }

    #[test]
    fn test_bad_zone_is_reported() {
        let mut config = Config::default();
        config.upstream.source_timezone = "Nowhere/Atlantis".into();
        assert!(config.logger_settings().is_err());
    }
}
