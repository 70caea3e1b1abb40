use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::DestinationKind;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// Root directory for stored digest markdown files
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
    /// How often the scheduler ticks, in seconds
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub users: Vec<UserConfig>,
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
}

fn default_database_url() -> String {
    "sqlite:rss_digest.db?mode=rwc".to_string()
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("./data/digests")
}

fn default_tick_interval() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetchConfig {
    #[serde(default = "default_fetch_timeout")]
    pub timeout_secs: u64,
    /// Feed sources fetched in parallel within one group run
    #[serde(default = "default_fetch_concurrency")]
    pub concurrency: usize,
    /// Consecutive failures after which a feed source is marked dead
    #[serde(default = "default_dead_after_failures")]
    pub dead_after_failures: i64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_fetch_timeout() -> u64 {
    15
}

fn default_fetch_concurrency() -> usize {
    4
}

fn default_dead_after_failures() -> i64 {
    5
}

fn default_user_agent() -> String {
    "RssDigest/0.1 (Feed Digest)".to_string()
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_fetch_timeout(),
            concurrency: default_fetch_concurrency(),
            dead_after_failures: default_dead_after_failures(),
            user_agent: default_user_agent(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Window covered by a group's first run
    #[serde(default = "default_lookback_hours")]
    pub lookback_hours: i64,
}

fn default_lookback_hours() -> i64 {
    24
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            lookback_hours: default_lookback_hours(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EvaluationConfig {
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default = "default_include_score")]
    pub include_score: f64,
    #[serde(default = "default_exclude_score")]
    pub exclude_score: f64,
}

fn default_include_score() -> f64 {
    0.9
}

fn default_exclude_score() -> f64 {
    0.1
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            keywords: Vec::new(),
            include_score: default_include_score(),
            exclude_score: default_exclude_score(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeliveryConfig {
    /// Upper bound for a single destination send
    #[serde(default = "default_delivery_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub smtp: SmtpConfig,
}

fn default_delivery_timeout() -> u64 {
    20
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_delivery_timeout(),
            smtp: SmtpConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SmtpConfig {
    #[serde(default = "default_smtp_host")]
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_smtp_from")]
    pub from: String,
}

fn default_smtp_host() -> String {
    "localhost".to_string()
}

fn default_smtp_port() -> u16 {
    1025
}

fn default_smtp_from() -> String {
    "rss-digest@example.com".to_string()
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: default_smtp_host(),
            port: default_smtp_port(),
            username: None,
            password: None,
            from: default_smtp_from(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct UserConfig {
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct GroupConfig {
    pub name: String,
    /// Email of the owning user
    pub owner: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub feeds: Vec<String>,
    /// Local delivery times as `HH:MM`
    #[serde(default)]
    pub schedules: Vec<String>,
    #[serde(default)]
    pub destinations: Vec<DestinationConfig>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct DestinationConfig {
    #[serde(rename = "type")]
    pub kind: DestinationKind,
    pub target: String,
    pub token: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Parse config from a TOML string (useful for testing)
    pub fn from_str(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }
}
