use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub crawler: CrawlerConfig,

    #[serde(default)]
    pub download: DownloadConfig,

    #[serde(default)]
    pub labeling: LabelingConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub boards: Vec<BoardSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub sqlite_path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Longest edge of generated thumbnails, in pixels.
    #[serde(default = "default_thumbnail_size")]
    pub thumbnail_size: u32,

    /// Images smaller than this on either side are rejected.
    #[serde(default = "default_min_dimension")]
    pub min_dimension: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            thumbnail_size: default_thumbnail_size(),
            min_dimension: default_min_dimension(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerConfig {
    #[serde(default = "default_max_pins")]
    pub max_pins: usize,

    /// Randomized pause before each scroll, as `[min, max]` milliseconds.
    #[serde(default = "default_scroll_delay_ms")]
    pub scroll_delay_ms: [u64; 2],

    /// Consecutive scrolls without new pins before the board is considered done.
    #[serde(default = "default_stall_limit")]
    pub stall_limit: u32,

    /// In-place retries for one scroll step before the crawl gives up.
    #[serde(default = "default_max_scroll_retries")]
    pub max_scroll_retries: u32,

    #[serde(default = "default_headless")]
    pub headless: bool,

    #[serde(default = "default_webdriver_url")]
    pub webdriver_url: String,

    /// Concurrent browser sessions, i.e. boards crawled at once.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Randomized pause between boards on one session, `[min, max]` ms.
    #[serde(default = "default_board_delay_ms")]
    pub board_delay_ms: [u64; 2],

    #[serde(default)]
    pub credentials: Option<Credentials>,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            max_pins: default_max_pins(),
            scroll_delay_ms: default_scroll_delay_ms(),
            stall_limit: default_stall_limit(),
            max_scroll_retries: default_max_scroll_retries(),
            headless: default_headless(),
            webdriver_url: default_webdriver_url(),
            max_sessions: default_max_sessions(),
            board_delay_ms: default_board_delay_ms(),
            credentials: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VisionProviderType {
    #[default]
    Gemini,
    OpenAI,
    LmStudio,
    Anthropic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelingConfig {
    #[serde(default = "default_labeling_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub provider: VisionProviderType,

    #[serde(default = "default_vision_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_vision_model")]
    pub model: String,

    #[serde(default)]
    pub api_key: Option<String>,

    /// Requests allowed per quota window.
    #[serde(default = "default_quota_per_window")]
    pub quota_per_window: u32,

    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    #[serde(default = "default_max_transient_retries")]
    pub max_transient_retries: u32,

    /// Extra context prepended to the analysis prompt.
    #[serde(default)]
    pub custom_prompt: Option<String>,
}

impl Default for LabelingConfig {
    fn default() -> Self {
        Self {
            enabled: default_labeling_enabled(),
            provider: VisionProviderType::default(),
            endpoint: default_vision_endpoint(),
            model: default_vision_model(),
            api_key: None,
            quota_per_window: default_quota_per_window(),
            window_secs: default_window_secs(),
            max_transient_retries: default_max_transient_retries(),
            custom_prompt: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Worker threads shared by the download and label stages.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

/// A configured board to crawl.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BoardSource {
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl BoardSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: None,
        }
    }

    /// Display name, falling back to the last path segment of the URL.
    pub fn display_name(&self) -> String {
        if let Some(ref name) = self.name {
            return name.clone();
        }
        self.url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.url)
            .to_string()
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pinharvest")
        .join("pinharvest.db")
}

fn default_download_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pinharvest")
        .join("images")
}

fn default_thumbnail_size() -> u32 {
    300
}

fn default_min_dimension() -> u32 {
    50
}

fn default_max_pins() -> usize {
    100
}

fn default_scroll_delay_ms() -> [u64; 2] {
    [2000, 4000]
}

fn default_stall_limit() -> u32 {
    3
}

fn default_max_scroll_retries() -> u32 {
    3
}

fn default_headless() -> bool {
    true
}

fn default_webdriver_url() -> String {
    "http://127.0.0.1:9515".to_string()
}

fn default_max_sessions() -> usize {
    1
}

fn default_board_delay_ms() -> [u64; 2] {
    [10_000, 20_000]
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
        .to_string()
}

fn default_labeling_enabled() -> bool {
    true
}

fn default_vision_endpoint() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

fn default_vision_model() -> String {
    "gemini-1.5-flash".to_string()
}

fn default_quota_per_window() -> u32 {
    15
}

fn default_window_secs() -> u64 {
    60
}

fn default_max_transient_retries() -> u32 {
    2
}

fn default_workers() -> usize {
    3
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            storage: StorageConfig::default(),
            crawler: CrawlerConfig::default(),
            download: DownloadConfig::default(),
            labeling: LabelingConfig::default(),
            pipeline: PipelineConfig::default(),
            boards: Vec::new(),
        }
    }
}

/// Validated runtime knobs derived from [`Config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    pub max_pins: usize,
    pub scroll_delay_range: RangeInclusive<Duration>,
    pub max_retries: u32,
    pub quota_per_window: u32,
    pub headless: bool,
    pub quota_window: Duration,
    pub stall_limit: u32,
    pub max_scroll_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub max_transient_label_retries: u32,
    pub workers: usize,
    pub max_sessions: usize,
    pub board_delay_range: RangeInclusive<Duration>,
    pub thumbnail_size: u32,
    pub min_dimension: u32,
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load from `path`, writing defaults there if it does not exist yet.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?
        } else {
            let config = Config::default();
            config.save_to(path)?;
            config
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Secrets from the environment take precedence over the file.
    fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("PINHARVEST_API_KEY") {
            if !key.is_empty() {
                self.labeling.api_key = Some(key);
            }
        }
        let email = std::env::var("PINHARVEST_EMAIL").ok().filter(|s| !s.is_empty());
        let password = std::env::var("PINHARVEST_PASSWORD").ok().filter(|s| !s.is_empty());
        if let (Some(email), Some(password)) = (email, password) {
            self.crawler.credentials = Some(Credentials { email, password });
        }
    }

    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("PINHARVEST_CONFIG") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pinharvest")
    }

    /// Check every numeric option and project them into [`Limits`].
    pub fn validate(&self) -> Result<Limits> {
        let c = &self.crawler;
        let d = &self.download;
        let l = &self.labeling;

        if c.max_pins == 0 {
            bail!("crawler.max_pins must be at least 1");
        }
        if c.scroll_delay_ms[0] > c.scroll_delay_ms[1] {
            bail!("crawler.scroll_delay_ms minimum exceeds maximum");
        }
        if c.board_delay_ms[0] > c.board_delay_ms[1] {
            bail!("crawler.board_delay_ms minimum exceeds maximum");
        }
        if c.stall_limit == 0 {
            bail!("crawler.stall_limit must be at least 1");
        }
        if c.max_sessions == 0 {
            bail!("crawler.max_sessions must be at least 1");
        }
        if d.max_retries == 0 {
            bail!("download.max_retries must be at least 1");
        }
        if d.backoff_cap_ms < d.backoff_base_ms {
            bail!("download.backoff_cap_ms must not be below backoff_base_ms");
        }
        if l.quota_per_window == 0 {
            bail!("labeling.quota_per_window must be at least 1");
        }
        if l.window_secs == 0 {
            bail!("labeling.window_secs must be at least 1");
        }
        if self.pipeline.workers == 0 {
            bail!("pipeline.workers must be at least 1");
        }
        if self.storage.thumbnail_size == 0 {
            bail!("storage.thumbnail_size must be at least 1");
        }

        Ok(Limits {
            max_pins: c.max_pins,
            scroll_delay_range: Duration::from_millis(c.scroll_delay_ms[0])
                ..=Duration::from_millis(c.scroll_delay_ms[1]),
            max_retries: d.max_retries,
            quota_per_window: l.quota_per_window,
            headless: c.headless,
            quota_window: Duration::from_secs(l.window_secs),
            stall_limit: c.stall_limit,
            max_scroll_retries: c.max_scroll_retries,
            backoff_base: Duration::from_millis(d.backoff_base_ms),
            backoff_cap: Duration::from_millis(d.backoff_cap_ms),
            max_transient_label_retries: l.max_transient_retries,
            workers: self.pipeline.workers,
            max_sessions: c.max_sessions,
            board_delay_range: Duration::from_millis(c.board_delay_ms[0])
                ..=Duration::from_millis(c.board_delay_ms[1]),
            thumbnail_size: self.storage.thumbnail_size,
            min_dimension: self.storage.min_dimension,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let limits = Config::default().validate().unwrap();
        assert_eq!(limits.max_pins, 100);
        assert_eq!(limits.max_retries, 3);
        assert_eq!(
            limits.scroll_delay_range,
            Duration::from_millis(2000)..=Duration::from_millis(4000)
        );
    }

    #[test]
    fn test_rejects_inverted_delay_range() {
        let mut config = Config::default();
        config.crawler.scroll_delay_ms = [5000, 1000];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_quota() {
        let mut config = Config::default();
        config.labeling.quota_per_window = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [crawler]
            max_pins = 25

            [[boards]]
            url = "https://www.pinterest.com/someone/summer-looks/"
            "#,
        )
        .unwrap();
        assert_eq!(config.crawler.max_pins, 25);
        assert_eq!(config.crawler.stall_limit, 3);
        assert_eq!(config.boards.len(), 1);
        assert_eq!(config.boards[0].display_name(), "summer-looks");
    }

    #[test]
    fn test_load_from_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.pipeline.workers, 3);
    }

    #[test]
    fn test_board_display_name_prefers_explicit() {
        let board = BoardSource {
            url: "https://www.pinterest.com/a/b/".into(),
            name: Some("Spring".into()),
        };
        assert_eq!(board.display_name(), "Spring");
    }
}
