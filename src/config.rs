use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use url::Url;

use crate::error::{AppError, Result};
use crate::models::{Source, WriteMode};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Tasks executed concurrently by one process.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Owner tasks run concurrently inside one fan-out.
    #[serde(default = "default_owner_concurrency")]
    pub owner_concurrency: usize,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_soft_time_limit")]
    pub soft_time_limit_secs: u64,

    #[serde(default = "default_hard_time_limit")]
    pub hard_time_limit_secs: u64,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub relevance: RelevanceConfig,

    #[serde(default)]
    pub perplexity: PerplexityConfig,

    #[serde(default)]
    pub reddit: RedditConfig,

    #[serde(default)]
    pub newsapi: NewsApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl_hours")]
    pub ttl_hours: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_retention_interval_hours")]
    pub interval_hours: u64,
    #[serde(default = "default_retention_max_age_hours")]
    pub max_age_hours: u64,
    /// How long finished task records stay queryable.
    #[serde(default = "default_task_result_hours")]
    pub task_result_hours: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelevanceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_perplexity_url")]
    pub base_url: String,
    #[serde(default = "default_perplexity_model")]
    pub model: String,
    pub api_key: Option<String>,
    #[serde(default = "default_perplexity_key_env")]
    pub api_key_env: Option<String>,
}

/// Settings every source shares. Each source section reads these over that
/// source's own defaults, so a section only needs the keys it changes.
#[derive(Debug, Clone, Serialize)]
pub struct SourceSettings {
    pub enabled: bool,
    pub base_url: String,
    pub api_key: Option<String>,
    /// Name of an environment variable holding the credential.
    pub api_key_env: Option<String>,
    pub rate_limit_per_minute: u32,
    /// Periodic refresh of every owner; `None` disables scheduling.
    pub schedule_hours: Option<u64>,
    pub write_mode: WriteMode,
}

/// Keys of a source section that override [`SourceSettings`].
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SettingsOverrides {
    enabled: Option<bool>,
    base_url: Option<String>,
    api_key: Option<String>,
    api_key_env: Option<String>,
    rate_limit_per_minute: Option<u32>,
    schedule_hours: Option<u64>,
    write_mode: Option<WriteMode>,
}

impl SettingsOverrides {
    fn apply(self, mut settings: SourceSettings) -> SourceSettings {
        if let Some(enabled) = self.enabled {
            settings.enabled = enabled;
        }
        if let Some(base_url) = self.base_url {
            settings.base_url = base_url;
        }
        if self.api_key.is_some() {
            settings.api_key = self.api_key;
        }
        if self.api_key_env.is_some() {
            settings.api_key_env = self.api_key_env;
        }
        if let Some(rate) = self.rate_limit_per_minute {
            settings.rate_limit_per_minute = rate;
        }
        if self.schedule_hours.is_some() {
            settings.schedule_hours = self.schedule_hours;
        }
        if let Some(write_mode) = self.write_mode {
            settings.write_mode = write_mode;
        }
        settings
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerplexityConfig {
    #[serde(flatten, deserialize_with = "perplexity_settings")]
    pub settings: SourceSettings,
    pub model: String,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedditConfig {
    #[serde(flatten, deserialize_with = "reddit_settings")]
    pub settings: SourceSettings,
    pub user_agent: String,
    pub posts_per_subreddit: u32,
    pub time_filter: String,
    pub fetch_top_comment: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NewsApiConfig {
    #[serde(flatten, deserialize_with = "newsapi_settings")]
    pub settings: SourceSettings,
    pub page_size: u32,
    pub language: String,
    pub sort_by: String,
}

fn perplexity_settings<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<SourceSettings, D::Error> {
    Ok(SettingsOverrides::deserialize(d)?.apply(PerplexityConfig::default().settings))
}

fn reddit_settings<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<SourceSettings, D::Error> {
    Ok(SettingsOverrides::deserialize(d)?.apply(RedditConfig::default().settings))
}

fn newsapi_settings<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<SourceSettings, D::Error> {
    Ok(SettingsOverrides::deserialize(d)?.apply(NewsApiConfig::default().settings))
}

fn default_db_path() -> String {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("feed-ingest");
    std::fs::create_dir_all(&data_dir).ok();
    data_dir.join("ingest.db").to_string_lossy().to_string()
}

fn default_workers() -> usize {
    4
}

fn default_owner_concurrency() -> usize {
    8
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_soft_time_limit() -> u64 {
    300
}

fn default_hard_time_limit() -> u64 {
    600
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_secs() -> u64 {
    60
}

fn default_cache_ttl_hours() -> u64 {
    24
}

fn default_retention_interval_hours() -> u64 {
    3
}

fn default_retention_max_age_hours() -> u64 {
    24
}

fn default_task_result_hours() -> u64 {
    24
}

fn default_true() -> bool {
    true
}

fn default_perplexity_url() -> String {
    "https://api.perplexity.ai".to_string()
}

fn default_perplexity_model() -> String {
    "sonar".to_string()
}

fn default_perplexity_key_env() -> Option<String> {
    Some("PERPLEXITY_API_KEY".to_string())
}

fn default_perplexity_max_tokens() -> u32 {
    1000
}

fn default_reddit_user_agent() -> String {
    concat!("feed-ingest/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_posts_per_subreddit() -> u32 {
    3
}

fn default_time_filter() -> String {
    "day".to_string()
}

fn default_page_size() -> u32 {
    10
}

fn default_language() -> String {
    "en".to_string()
}

fn default_sort_by() -> String {
    "publishedAt".to_string()
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_secs: default_backoff_secs(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_hours: default_cache_ttl_hours(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            interval_hours: default_retention_interval_hours(),
            max_age_hours: default_retention_max_age_hours(),
            task_result_hours: default_task_result_hours(),
        }
    }
}

impl Default for RelevanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: default_perplexity_url(),
            model: default_perplexity_model(),
            api_key: None,
            api_key_env: default_perplexity_key_env(),
        }
    }
}

impl Default for PerplexityConfig {
    fn default() -> Self {
        Self {
            settings: SourceSettings {
                enabled: true,
                base_url: default_perplexity_url(),
                api_key: None,
                api_key_env: default_perplexity_key_env(),
                rate_limit_per_minute: 60,
                schedule_hours: Some(6),
                write_mode: WriteMode::Replace,
            },
            model: default_perplexity_model(),
            max_tokens: default_perplexity_max_tokens(),
        }
    }
}

impl Default for RedditConfig {
    fn default() -> Self {
        Self {
            settings: SourceSettings {
                enabled: true,
                base_url: "https://www.reddit.com".to_string(),
                api_key: None,
                api_key_env: None,
                rate_limit_per_minute: 60,
                schedule_hours: None,
                write_mode: WriteMode::SourceScoped,
            },
            user_agent: default_reddit_user_agent(),
            posts_per_subreddit: default_posts_per_subreddit(),
            time_filter: default_time_filter(),
            fetch_top_comment: true,
        }
    }
}

impl Default for NewsApiConfig {
    fn default() -> Self {
        Self {
            settings: SourceSettings {
                enabled: true,
                base_url: "https://newsapi.org/v2".to_string(),
                api_key: None,
                api_key_env: Some("NEWS_API_KEY".to_string()),
                rate_limit_per_minute: 60,
                schedule_hours: None,
                write_mode: WriteMode::SourceScoped,
            },
            page_size: default_page_size(),
            language: default_language(),
            sort_by: default_sort_by(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            workers: default_workers(),
            owner_concurrency: default_owner_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            soft_time_limit_secs: default_soft_time_limit(),
            hard_time_limit_secs: default_hard_time_limit(),
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            retention: RetentionConfig::default(),
            relevance: RelevanceConfig::default(),
            perplexity: PerplexityConfig::default(),
            reddit: RedditConfig::default(),
            newsapi: NewsApiConfig::default(),
        }
    }
}

impl SourceSettings {
    /// Minimum spacing between two outbound calls to this source.
    pub fn request_interval(&self) -> Duration {
        if self.rate_limit_per_minute == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(60_000 / u64::from(self.rate_limit_per_minute))
    }

    pub fn credential(&self) -> Option<String> {
        resolve_credential(self.api_key.as_deref(), self.api_key_env.as_deref())
    }
}

impl RelevanceConfig {
    pub fn credential(&self) -> Option<String> {
        resolve_credential(self.api_key.as_deref(), self.api_key_env.as_deref())
    }
}

fn resolve_credential(inline: Option<&str>, env_var: Option<&str>) -> Option<String> {
    inline
        .filter(|k| !k.trim().is_empty())
        .map(str::to_string)
        .or_else(|| {
            env_var
                .and_then(|var| std::env::var(var).ok())
                .filter(|k| !k.trim().is_empty())
        })
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            let content = std::fs::read_to_string(config_path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(config_path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| AppError::Config(e.to_string()))?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("feed-ingest")
            .join("config.toml")
    }

    pub fn settings(&self, source: Source) -> &SourceSettings {
        match source {
            Source::Perplexity => &self.perplexity.settings,
            Source::Reddit => &self.reddit.settings,
            Source::NewsApi => &self.newsapi.settings,
        }
    }

    pub fn requires_credential(source: Source) -> bool {
        !matches!(source, Source::Reddit)
    }

    /// Fails when `source` cannot run at all: disabled, or missing its credential.
    pub fn check_source(&self, source: Source) -> Result<()> {
        let settings = self.settings(source);
        if !settings.enabled {
            return Err(AppError::Config(format!("source '{}' is not active", source)));
        }
        if Self::requires_credential(source) && settings.credential().is_none() {
            return Err(AppError::Config(format!(
                "no credential configured for '{}'",
                source
            )));
        }
        Ok(())
    }

    pub fn soft_time_limit(&self) -> Duration {
        Duration::from_secs(self.soft_time_limit_secs)
    }

    pub fn hard_time_limit(&self) -> Duration {
        Duration::from_secs(self.hard_time_limit_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(AppError::Config("workers must be at least 1".into()));
        }
        if self.owner_concurrency == 0 {
            return Err(AppError::Config("owner_concurrency must be at least 1".into()));
        }
        if self.soft_time_limit_secs >= self.hard_time_limit_secs {
            return Err(AppError::Config(
                "soft_time_limit_secs must be below hard_time_limit_secs".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(AppError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.cache.ttl_hours == 0 || self.retention.interval_hours == 0 {
            return Err(AppError::Config(
                "cache.ttl_hours and retention.interval_hours must be positive".into(),
            ));
        }

        for source in Source::ALL {
            let settings = self.settings(source);
            Url::parse(&settings.base_url).map_err(|e| {
                AppError::Config(format!("invalid base_url for '{}': {}", source, e))
            })?;
            if settings.schedule_hours == Some(0) {
                return Err(AppError::Config(format!(
                    "schedule_hours for '{}' must be positive",
                    source
                )));
            }
        }

        if self.relevance.enabled {
            Url::parse(&self.relevance.base_url)
                .map_err(|e| AppError::Config(format!("invalid relevance base_url: {}", e)))?;
        }
        Ok(())
    }

    /// Every enabled source must be runnable. Checked before serving.
    pub fn validate_sources(&self) -> Result<()> {
        for source in Source::ALL {
            if self.settings(source).enabled {
                self.check_source(source)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_keys() -> Config {
        let mut config = Config::default();
        config.db_path = ":memory:".to_string();
        config.perplexity.settings.api_key = Some("pplx-test".into());
        config.newsapi.settings.api_key = Some("news-test".into());
        config
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = with_keys();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.cache.ttl_hours, 24);
        assert_eq!(config.retention.interval_hours, 3);
        assert_eq!(config.retention.max_age_hours, 24);
        assert_eq!(config.soft_time_limit(), Duration::from_secs(300));
        assert_eq!(config.hard_time_limit(), Duration::from_secs(600));
        assert_eq!(config.perplexity.settings.write_mode, WriteMode::Replace);
        assert_eq!(config.reddit.settings.write_mode, WriteMode::SourceScoped);
        assert!(config.validate().is_ok());
        assert!(config.validate_sources().is_ok());
    }

    #[test]
    fn missing_credential_is_a_config_error() {
        let mut config = with_keys();
        config.newsapi.settings.api_key = None;
        config.newsapi.settings.api_key_env = Some("FEED_INGEST_TEST_UNSET_VAR".into());
        assert!(config.validate().is_ok());
        let err = config.validate_sources().unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
        assert!(err.to_string().contains("newsapi"));

        // disabling the source makes the config valid again
        config.newsapi.settings.enabled = false;
        assert!(config.validate_sources().is_ok());
        assert!(config.check_source(Source::NewsApi).is_err());
    }

    #[test]
    fn reddit_needs_no_credential() {
        let config = with_keys();
        assert!(config.check_source(Source::Reddit).is_ok());
    }

    #[test]
    fn soft_limit_must_be_below_hard_limit() {
        let mut config = with_keys();
        config.soft_time_limit_secs = 600;
        assert!(config.validate().is_err());
    }

    #[test]
    fn request_interval_from_rate_limit() {
        let mut settings = with_keys().reddit.settings;
        settings.rate_limit_per_minute = 60;
        assert_eq!(settings.request_interval(), Duration::from_secs(1));
        settings.rate_limit_per_minute = 0;
        assert_eq!(settings.request_interval(), Duration::ZERO);
    }

    #[test]
    fn load_creates_default_file_and_reads_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let created = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(created.workers, 4);

        std::fs::write(
            &path,
            r#"
workers = 2
db_path = "/tmp/x.db"

[retention]
max_age_hours = 48

[reddit]
enabled = true
base_url = "https://old.reddit.com"
rate_limit_per_minute = 30
write_mode = "replace"
posts_per_subreddit = 5
"#,
        )
        .unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.workers, 2);
        assert_eq!(loaded.retention.max_age_hours, 48);
        assert_eq!(loaded.retention.interval_hours, 3);
        assert_eq!(loaded.reddit.posts_per_subreddit, 5);
        assert_eq!(loaded.reddit.settings.write_mode, WriteMode::Replace);
        assert_eq!(loaded.reddit.time_filter, "day");
    }

    #[test]
    fn partial_source_sections_keep_that_sources_defaults() {
        let config: Config = toml::from_str("[newsapi]\napi_key = \"k\"\n").unwrap();
        let newsapi = &config.newsapi.settings;
        assert!(newsapi.enabled);
        assert_eq!(newsapi.api_key.as_deref(), Some("k"));
        assert_eq!(newsapi.api_key_env.as_deref(), Some("NEWS_API_KEY"));
        assert_eq!(newsapi.base_url, "https://newsapi.org/v2");
        assert_eq!(newsapi.write_mode, WriteMode::SourceScoped);
        assert_eq!(config.newsapi.page_size, 10);

        let config: Config = toml::from_str(
            "[perplexity]\nmodel = \"sonar-pro\"\n\n[reddit]\nschedule_hours = 12\n",
        )
        .unwrap();
        assert_eq!(config.perplexity.model, "sonar-pro");
        assert_eq!(config.perplexity.settings.base_url, "https://api.perplexity.ai");
        assert_eq!(config.perplexity.settings.schedule_hours, Some(6));
        assert_eq!(config.perplexity.settings.write_mode, WriteMode::Replace);
        assert_eq!(config.reddit.settings.schedule_hours, Some(12));
        assert_eq!(config.reddit.settings.base_url, "https://www.reddit.com");
        assert!(config.reddit.fetch_top_comment);
    }
}
