//! Configuration file handling.
//!
//! This module handles loading, validating and merging configuration from
//! `.paperwatch.toml` files.

use crate::error::ConfigError;
use crate::retry::RetryPolicy;
use anyhow::{Context, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = ".paperwatch.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Upstream feed settings.
    #[serde(default)]
    pub feed: FeedConfig,

    /// LLM backend settings.
    #[serde(default)]
    pub llm: LlmConfig,

    /// Scheduler settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Directory holding the keyword store and the per-keyword shards.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,

    /// Keywords created when the keyword store is empty.
    #[serde(default = "default_seed_keywords")]
    pub seed_keywords: Vec<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            verbose: false,
            seed_keywords: default_seed_keywords(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_seed_keywords() -> Vec<String> {
    vec!["materials science".to_string()]
}

/// Upstream paper feed settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// arXiv API query endpoint.
    #[serde(default = "default_feed_url")]
    pub base_url: String,

    /// Results requested per page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Maximum pages fetched per keyword per run.
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,

    /// Days to look back on a keyword's first run.
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,

    /// Request timeout in seconds.
    #[serde(default = "default_feed_timeout")]
    pub timeout_seconds: u64,

    /// Attempts per page before it is reported as failed.
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// First backoff delay between attempts, doubled each retry.
    #[serde(default = "default_feed_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            base_url: default_feed_url(),
            page_size: default_page_size(),
            max_pages: default_max_pages(),
            lookback_days: default_lookback_days(),
            timeout_seconds: default_feed_timeout(),
            retries: default_retries(),
            initial_backoff_ms: default_feed_backoff(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_feed_url() -> String {
    "http://export.arxiv.org/api/query".to_string()
}

fn default_page_size() -> usize {
    50
}

fn default_max_pages() -> usize {
    10
}

fn default_lookback_days() -> u32 {
    7
}

fn default_feed_timeout() -> u64 {
    30
}

fn default_retries() -> u32 {
    3
}

fn default_feed_backoff() -> u64 {
    3000 // arXiv asks clients to wait ~3s between calls
}

fn default_user_agent() -> String {
    format!("paperwatch/{}", env!("CARGO_PKG_VERSION"))
}

/// LLM backend settings (OpenAI-compatible chat completions).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// API base URL; `/chat/completions` is appended.
    #[serde(default = "default_llm_url")]
    pub base_url: String,

    /// Model name.
    #[serde(default = "default_model")]
    pub model: String,

    /// Bearer credential. Prefer `api_key_env` over storing it in the file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Environment variable consulted when `api_key` is unset.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Temperature for generation.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens in response.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Request timeout in seconds.
    #[serde(default = "default_llm_timeout")]
    pub timeout_seconds: u64,

    /// Attempts per analysis before it is reported unavailable.
    #[serde(default = "default_retries")]
    pub retries: u32,

    #[serde(default = "default_llm_backoff")]
    pub initial_backoff_ms: u64,

    /// Minimum spacing between outbound LLM calls.
    #[serde(default = "default_request_interval")]
    pub request_interval_ms: u64,

    /// Most recent papers included in an insight prompt.
    #[serde(default = "default_max_insight_papers")]
    pub max_insight_papers: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_url(),
            model: default_model(),
            api_key: None,
            api_key_env: default_api_key_env(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_seconds: default_llm_timeout(),
            retries: default_retries(),
            initial_backoff_ms: default_llm_backoff(),
            request_interval_ms: default_request_interval(),
            max_insight_papers: default_max_insight_papers(),
        }
    }
}

fn default_llm_url() -> String {
    "https://api.deepseek.com/v1".to_string()
}

fn default_model() -> String {
    "deepseek-chat".to_string()
}

fn default_api_key_env() -> String {
    "DEEPSEEK_API_KEY".to_string()
}

fn default_temperature() -> f32 {
    0.3
}

fn default_max_tokens() -> u32 {
    800
}

fn default_llm_timeout() -> u64 {
    120
}

fn default_llm_backoff() -> u64 {
    2000
}

fn default_request_interval() -> u64 {
    1000
}

fn default_max_insight_papers() -> usize {
    10
}

/// Recurring execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Daily trigger time, `HH:MM` in UTC.
    #[serde(default = "default_run_at")]
    pub run_at: String,

    /// A keyword whose last run is older than this is considered missed.
    #[serde(default = "default_period_hours")]
    pub period_hours: u32,

    /// Insight windows (in days) refreshed after every cycle.
    #[serde(default = "default_insight_windows")]
    pub insight_windows: Vec<u32>,

    /// Run a catch-up cycle on startup for keywords that never ran.
    #[serde(default = "default_true")]
    pub catch_up_on_start: bool,

    /// Number of keyword cycles allowed to run at the same time.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            run_at: default_run_at(),
            period_hours: default_period_hours(),
            insight_windows: default_insight_windows(),
            catch_up_on_start: true,
            concurrency: default_concurrency(),
        }
    }
}

fn default_run_at() -> String {
    "09:00".to_string()
}

fn default_period_hours() -> u32 {
    24
}

fn default_insight_windows() -> Vec<u32> {
    vec![1, 7, 30]
}

fn default_true() -> bool {
    true
}

fn default_concurrency() -> usize {
    1
}

impl FeedConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retries, Duration::from_millis(self.initial_backoff_ms))
    }
}

impl LlmConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retries, Duration::from_millis(self.initial_backoff_ms))
    }

    /// Resolve the bearer credential from the file or the environment.
    pub fn api_key(&self) -> Result<String, ConfigError> {
        if let Some(ref key) = self.api_key {
            if !key.trim().is_empty() {
                return Ok(key.trim().to_string());
            }
        }

        match std::env::var(&self.api_key_env) {
            Ok(key) if !key.trim().is_empty() => Ok(key.trim().to_string()),
            _ => Err(ConfigError::MissingCredential(self.api_key_env.clone())),
        }
    }
}

impl SchedulerConfig {
    /// Parsed `run_at`.
    pub fn trigger_time(&self) -> Result<NaiveTime, ConfigError> {
        NaiveTime::parse_from_str(self.run_at.trim(), "%H:%M").map_err(|e| {
            ConfigError::Invalid {
                field: "scheduler.run_at",
                reason: format!("expected HH:MM, got {:?} ({})", self.run_at, e),
            }
        })
    }

    pub fn period(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.period_hours))
    }
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(DEFAULT_CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings, but only
    /// when they were explicitly provided.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref data_dir) = args.data_dir {
            self.general.data_dir = data_dir.clone();
        }
        if let Some(ref model) = args.model {
            self.llm.model = model.clone();
        }
        if let Some(ref url) = args.llm_url {
            self.llm.base_url = url.clone();
        }
        if args.verbose {
            self.general.verbose = true;
        }
    }

    /// Check structural constraints. Does not touch the network.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.feed.page_size == 0 {
            return Err(ConfigError::Invalid {
                field: "feed.page_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.feed.max_pages == 0 {
            return Err(ConfigError::Invalid {
                field: "feed.max_pages",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.feed.lookback_days == 0 {
            return Err(ConfigError::Invalid {
                field: "feed.lookback_days",
                reason: "must be at least 1".to_string(),
            });
        }
        check_url("feed.base_url", &self.feed.base_url)?;
        check_url("llm.base_url", &self.llm.base_url)?;

        if self.llm.model.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "llm.model",
                reason: "must not be empty".to_string(),
            });
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(ConfigError::Invalid {
                field: "llm.temperature",
                reason: "must be between 0.0 and 2.0".to_string(),
            });
        }
        if self.feed.timeout_seconds == 0 || self.llm.timeout_seconds == 0 {
            return Err(ConfigError::Invalid {
                field: "timeout_seconds",
                reason: "must be at least 1 second".to_string(),
            });
        }

        self.scheduler.trigger_time()?;
        if self.scheduler.period_hours == 0 {
            return Err(ConfigError::Invalid {
                field: "scheduler.period_hours",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.scheduler.insight_windows.iter().any(|d| *d == 0) {
            return Err(ConfigError::Invalid {
                field: "scheduler.insight_windows",
                reason: "windows must be at least 1 day".to_string(),
            });
        }
        if self.scheduler.concurrency == 0 {
            return Err(ConfigError::Invalid {
                field: "scheduler.concurrency",
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(())
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

fn check_url(field: &'static str, url: &str) -> Result<(), ConfigError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            field,
            reason: format!("URL must start with 'http://' or 'https://', got {:?}", url),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.llm.model, "deepseek-chat");
        assert_eq!(config.feed.lookback_days, 7);
        assert_eq!(config.scheduler.insight_windows, vec![1, 7, 30]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml_content = r#"
[general]
data_dir = "/var/lib/paperwatch"
seed_keywords = ["graph neural networks", "perovskite"]

[feed]
page_size = 25
lookback_days = 14

[llm]
model = "gpt-4o-mini"
base_url = "https://api.openai.com/v1"
api_key_env = "OPENAI_API_KEY"

[scheduler]
run_at = "06:30"
insight_windows = [7]
"#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.general.data_dir, PathBuf::from("/var/lib/paperwatch"));
        assert_eq!(config.general.seed_keywords.len(), 2);
        assert_eq!(config.feed.page_size, 25);
        assert_eq!(config.feed.max_pages, 10);
        assert_eq!(config.feed.lookback_days, 14);
        assert_eq!(config.llm.model, "gpt-4o-mini");
        assert_eq!(config.llm.api_key_env, "OPENAI_API_KEY");
        assert_eq!(
            config.scheduler.trigger_time().unwrap(),
            NaiveTime::from_hms_opt(6, 30, 0).unwrap()
        );
        assert_eq!(config.scheduler.insight_windows, vec![7]);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.scheduler.run_at = "9am".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "scheduler.run_at",
                ..
            })
        ));

        let mut config = Config::default();
        config.feed.page_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.llm.base_url = "ftp://example.com".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.scheduler.insight_windows = vec![7, 0];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_api_key_resolution() {
        let mut llm = LlmConfig {
            api_key: Some("  sk-inline  ".to_string()),
            ..LlmConfig::default()
        };
        assert_eq!(llm.api_key().unwrap(), "sk-inline");

        llm.api_key = None;
        llm.api_key_env = "PAPERWATCH_TEST_KEY_THAT_IS_NEVER_SET".to_string();
        assert!(matches!(
            llm.api_key(),
            Err(ConfigError::MissingCredential(_))
        ));
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml();
        assert!(!toml_str.is_empty());
        assert!(toml_str.contains("[general]"));
        assert!(toml_str.contains("[feed]"));
        assert!(toml_str.contains("[llm]"));
        assert!(toml_str.contains("[scheduler]"));
        assert!(!toml_str.contains("api_key ="));
    }
}
