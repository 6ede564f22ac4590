//! Configuration loading for scicurate.
//! Reads scicurate.toml from the current directory or the path in SCICURATE_CONFIG.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use scicurate_common::RateLimitPolicy;
use scicurate_ingestion::fulltext::FulltextConfig;
use scicurate_ingestion::harvester::{HarvesterConfig, TopicQuery};
use scicurate_ingestion::scoring::ScoringConfig;
use scicurate_selector::SelectionConfig;
use secrecy::SecretString;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

pub const CONFIG_ENV: &str = "SCICURATE_CONFIG";
pub const API_KEY_ENV: &str = "SCICURATE_NCBI_API_KEY";
pub const DEFAULT_CONFIG_PATH: &str = "scicurate.toml";

/// Full-text sources the resolver knows how to build.
pub const KNOWN_SOURCES: &[&str] = &["pmc", "europepmc", "unpaywall"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}\nCopy scicurate.example.toml to scicurate.toml and edit it.")]
    NotFound(PathBuf),

    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub topics: Vec<TopicQuery>,
    #[serde(default)]
    pub harvest: HarvesterConfig,
    #[serde(default)]
    pub ncbi: NcbiConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub selection: SelectionConfig,
    #[serde(default)]
    pub fulltext: FulltextConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Shared full-text store root; `<data_dir>/fulltext` when unset.
    pub fulltext_store: Option<PathBuf>,
    #[serde(default = "default_bootstrap_min_date")]
    pub bootstrap_min_date: NaiveDate,
    /// Days the watermark trails the newest observed publication.
    #[serde(default = "default_overlap_days")]
    pub overlap_days: i64,
    #[serde(default = "default_threshold_percentile")]
    pub threshold_percentile: f64,
    /// Newest records per topic admitted unconditionally by monthly runs.
    #[serde(default = "default_recent_per_topic")]
    pub recent_per_topic: usize,
    /// Records resolved between manifest saves.
    #[serde(default = "default_resolve_batch_size")]
    pub resolve_batch_size: usize,
}

fn default_data_dir()             -> PathBuf   { PathBuf::from("./data") }
fn default_overlap_days()         -> i64       { 1 }
fn default_threshold_percentile() -> f64       { 25.0 }
fn default_recent_per_topic()     -> usize     { 5 }
fn default_resolve_batch_size()   -> usize     { 50 }
fn default_bootstrap_min_date()   -> NaiveDate {
    NaiveDate::from_ymd_opt(1990, 1, 1).unwrap_or_default()
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            fulltext_store: None,
            bootstrap_min_date: default_bootstrap_min_date(),
            overlap_days: default_overlap_days(),
            threshold_percentile: default_threshold_percentile(),
            recent_per_topic: default_recent_per_topic(),
            resolve_batch_size: default_resolve_batch_size(),
        }
    }
}

impl RunConfig {
    pub fn fulltext_store_dir(&self) -> PathBuf {
        self.fulltext_store.clone().unwrap_or_else(|| self.data_dir.join("fulltext"))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct NcbiConfig {
    /// E-utilities API key; raises the rate limit from 3 to 10 req/s.
    pub api_key: Option<SecretString>,
    /// Contact address sent with every E-utilities request.
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: Vec<u64>,
    /// Per-second ceiling for Europe PMC, Unpaywall and OA downloads.
    #[serde(default = "default_other_rps")]
    pub other_requests_per_second: u32,
}

fn default_max_concurrent()        -> usize    { 4 }
fn default_timeout_secs()          -> u64      { 30 }
fn default_download_timeout_secs() -> u64      { 60 }
fn default_backoff_secs()          -> Vec<u64> { vec![1, 5, 15] }
fn default_other_rps()             -> u32      { 5 }

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            timeout_secs: default_timeout_secs(),
            download_timeout_secs: default_download_timeout_secs(),
            backoff_secs: default_backoff_secs(),
            other_requests_per_second: default_other_rps(),
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    /// Applies the concurrency, timeout and backoff settings to `base`.
    pub fn policy(&self, mut base: RateLimitPolicy) -> RateLimitPolicy {
        base.max_concurrent = self.max_concurrent;
        base.timeout = self.timeout();
        base.backoff = self.backoff_secs.iter().map(|s| Duration::from_secs(*s)).collect();
        base
    }
}


impl Config {
    /// Load configuration from scicurate.toml.
    /// `path` wins, then SCICURATE_CONFIG, then the current directory.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        if !path.exists() {
            return Err(ConfigError::NotFound(path));
        }

        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read { path: path.clone(), source })?;
        let mut config = Self::from_toml(&content)?;
        config.apply_env();
        Ok(config)
    }

    /// Data directory for read-only commands. Falls back to the default when
    /// no config loads; nothing else in the file is required.
    pub fn data_dir_for(path: Option<&Path>) -> PathBuf {
        match Self::load(path) {
            Ok(config) => config.run.data_dir,
            Err(e) => {
                warn!(error = %e, "No usable config, reading the default data directory");
                default_data_dir()
            }
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// The API key may come from the environment instead of the file.
    pub fn apply_env(&mut self) {
        if self.ncbi.api_key.is_none() {
            if let Ok(key) = std::env::var(API_KEY_ENV) {
                if !key.trim().is_empty() {
                    self.ncbi.api_key = Some(SecretString::from(key));
                }
            }
        }
    }

    pub fn topic_order(&self) -> Vec<String> {
        self.topics.iter().map(|t| t.name.clone()).collect()
    }

    /// Configuration-fatal checks, run before any network activity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topics.is_empty() {
            return Err(ConfigError::Invalid("at least one [[topics]] entry is required".into()));
        }
        let mut names = BTreeSet::new();
        for t in &self.topics {
            if t.name.trim().is_empty() || t.query.trim().is_empty() {
                return Err(ConfigError::Invalid("every topic needs a name and a query".into()));
            }
            if !names.insert(t.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate topic name '{}'", t.name)));
            }
        }

        if self.selection.target == 0 {
            return Err(ConfigError::Invalid("selection.target must be positive".into()));
        }
        if self.harvest.window_limit == 0 || self.harvest.page_size == 0 {
            return Err(ConfigError::Invalid("harvest.window_limit and harvest.page_size must be positive".into()));
        }
        if self.harvest.page_size > self.harvest.window_limit {
            return Err(ConfigError::Invalid("harvest.page_size cannot exceed harvest.window_limit".into()));
        }
        if !(0.0..=100.0).contains(&self.run.threshold_percentile) {
            return Err(ConfigError::Invalid("run.threshold_percentile must be within 0..=100".into()));
        }
        if self.run.overlap_days < 0 {
            return Err(ConfigError::Invalid("run.overlap_days cannot be negative".into()));
        }
        if self.http.max_concurrent == 0 {
            return Err(ConfigError::Invalid("http.max_concurrent must be positive".into()));
        }

        for source in &self.fulltext.sources {
            if !KNOWN_SOURCES.contains(&source.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "unknown full-text source '{source}' (known: {})",
                    KNOWN_SOURCES.join(", ")
                )));
            }
        }
        let unpaywall = self.fulltext.sources.iter().any(|s| s == "unpaywall");
        let email_missing = self.fulltext.unpaywall_email.as_deref().map(str::trim).unwrap_or("").is_empty();
        if unpaywall && email_missing {
            return Err(ConfigError::Invalid(
                "fulltext.unpaywall_email is required when the unpaywall source is enabled".into(),
            ));
        }
        Ok(())
    }
}
