//! Tracker configuration: YAML document plus environment overrides.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use mrt_adapters::SourceConfig;
use mrt_core::{Priority, SourceType};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("parsing tracker config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("duplicate company name {0:?}")]
    DuplicateCompany(String),
    #[error("company #{0} has an empty name")]
    EmptyCompanyName(usize),
    #[error("classifier.{0} must not be empty")]
    EmptyKeywords(&'static str),
    #[error("classifier.divisor must be positive, got {0}")]
    InvalidDivisor(f64),
    #[error("classifier.threshold must be within [0, 1], got {0}")]
    InvalidThreshold(f64),
    #[error("pipeline.concurrency must be at least 1")]
    ZeroConcurrency,
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
    #[error("notifications.email needs an smtp_host, a from address and at least one recipient")]
    IncompleteEmail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    #[serde(default)]
    pub companies: Vec<CompanyConfig>,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_signal_keywords", alias = "keywords")]
    pub signal_keywords: Vec<String>,
    #[serde(default = "default_subject_keywords", alias = "models")]
    pub subject_keywords: Vec<String>,
    /// Distinct matches needed for full lexical confidence.
    #[serde(default = "default_divisor")]
    pub divisor: f64,
    #[serde(default)]
    pub semantic_weight: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            signal_keywords: default_signal_keywords(),
            subject_keywords: default_subject_keywords(),
            divisor: default_divisor(),
            semantic_weight: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_global_interval")]
    pub global_interval_secs: u64,
    #[serde(default)]
    pub huggingface_interval_secs: Option<u64>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            global_interval_secs: default_global_interval(),
            huggingface_interval_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_run_timeout")]
    pub run_timeout_secs: u64,
    /// Upper bound on handing one batch to every notification channel.
    #[serde(default = "default_dispatch_timeout")]
    pub dispatch_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            run_timeout_secs: default_run_timeout(),
            dispatch_timeout_secs: default_dispatch_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default = "default_true")]
    pub log: bool,
    #[serde(default)]
    pub slack_webhook_url: Option<String>,
    #[serde(default)]
    pub discord_webhook_url: Option<String>,
    #[serde(default)]
    pub email: Option<EmailConfig>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            log: true,
            slack_webhook_url: None,
            discord_webhook_url: None,
            email: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmtpTls {
    /// Plain connection upgraded with STARTTLS.
    #[default]
    Starttls,
    /// TLS from the first byte (usually port 465).
    Wrapper,
    None,
}

/// SMTP delivery of a batch digest. Credentials never live in the file:
/// `username_env` / `password_env` name the variables that hold them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailConfig {
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub tls: SmtpTls,
    pub from: String,
    pub to: Vec<String>,
    #[serde(default = "default_smtp_username_env")]
    pub username_env: String,
    #[serde(default = "default_smtp_password_env")]
    pub password_env: String,
}

fn default_smtp_port() -> u16 {
    587
}

fn default_smtp_username_env() -> String {
    "SMTP_USERNAME".to_string()
}

fn default_smtp_password_env() -> String {
    "SMTP_PASSWORD".to_string()
}

fn default_true() -> bool {
    true
}

fn default_threshold() -> f64 {
    0.75
}

fn default_divisor() -> f64 {
    2.0
}

fn default_global_interval() -> u64 {
    3600
}

fn default_concurrency() -> usize {
    8
}

fn default_run_timeout() -> u64 {
    300
}

fn default_dispatch_timeout() -> u64 {
    60
}

fn default_signal_keywords() -> Vec<String> {
    ["introducing", "announcing", "new release", "launching", "now available", "released"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_subject_keywords() -> Vec<String> {
    [
        "language model",
        "large language model",
        "llm",
        "multimodal",
        "billion parameters",
        "foundation model",
        "text-generation",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl TrackerConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: TrackerConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for (idx, company) in self.companies.iter().enumerate() {
            let name = company.name.trim();
            if name.is_empty() {
                return Err(ConfigError::EmptyCompanyName(idx));
            }
            if !names.insert(name.to_lowercase()) {
                return Err(ConfigError::DuplicateCompany(company.name.clone()));
            }
        }

        let classifier = &self.classifier;
        if classifier.signal_keywords.iter().all(|k| k.trim().is_empty()) {
            return Err(ConfigError::EmptyKeywords("signal_keywords"));
        }
        if classifier.subject_keywords.iter().all(|k| k.trim().is_empty()) {
            return Err(ConfigError::EmptyKeywords("subject_keywords"));
        }
        if classifier.divisor.is_nan() || classifier.divisor <= 0.0 {
            return Err(ConfigError::InvalidDivisor(classifier.divisor));
        }
        if !(0.0..=1.0).contains(&classifier.threshold) {
            return Err(ConfigError::InvalidThreshold(classifier.threshold));
        }

        if self.pipeline.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.pipeline.run_timeout_secs == 0 {
            return Err(ConfigError::ZeroInterval("pipeline.run_timeout_secs"));
        }
        if self.pipeline.dispatch_timeout_secs == 0 {
            return Err(ConfigError::ZeroInterval("pipeline.dispatch_timeout_secs"));
        }
        if self.schedule.global_interval_secs == 0 {
            return Err(ConfigError::ZeroInterval("schedule.global_interval_secs"));
        }
        if self.schedule.huggingface_interval_secs == Some(0) {
            return Err(ConfigError::ZeroInterval("schedule.huggingface_interval_secs"));
        }
        if let Some(email) = &self.notifications.email {
            if email.smtp_host.trim().is_empty()
                || email.from.trim().is_empty()
                || email.to.iter().all(|to| to.trim().is_empty())
            {
                return Err(ConfigError::IncompleteEmail);
            }
        }
        Ok(())
    }

    /// Fold environment overrides into the document. Webhooks from the
    /// environment replace the file's values; the threshold is clamped.
    pub fn apply_overrides(&mut self, settings: &RuntimeSettings) {
        if let Some(threshold) = settings.threshold_override {
            self.classifier.threshold = threshold;
        }
        if settings.slack_webhook_url.is_some() {
            self.notifications.slack_webhook_url = settings.slack_webhook_url.clone();
        }
        if settings.discord_webhook_url.is_some() {
            self.notifications.discord_webhook_url = settings.discord_webhook_url.clone();
        }
        self.classifier.semantic_weight = self.classifier.semantic_weight.clamp(0.0, 1.0);
    }

    pub fn enabled_companies(&self) -> impl Iterator<Item = &CompanyConfig> {
        self.companies.iter().filter(|c| c.enabled)
    }

    /// Source types referenced by at least one enabled company.
    pub fn configured_source_types(&self) -> HashSet<SourceType> {
        self.enabled_companies()
            .flat_map(|c| c.sources.iter().map(SourceConfig::source_type))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    File,
    Postgres,
}

/// Process settings read from the environment.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub config_path: PathBuf,
    pub store_backend: StoreBackend,
    pub state_path: PathBuf,
    pub database_url: Option<String>,
    pub reports_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub github_token: Option<String>,
    pub slack_webhook_url: Option<String>,
    pub discord_webhook_url: Option<String>,
    pub threshold_override: Option<f64>,
    pub retention_floor_days: i64,
}

impl RuntimeSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let database_url = non_empty("DATABASE_URL");
        let store_backend = match non_empty("MRT_STORE").as_deref() {
            Some(v) if v.eq_ignore_ascii_case("postgres") && database_url.is_some() => {
                StoreBackend::Postgres
            }
            _ => StoreBackend::File,
        };

        Self {
            config_path: non_empty("MRT_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("tracker.yaml")),
            store_backend,
            state_path: non_empty("MRT_STATE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./state/seen.jsonl")),
            database_url,
            reports_dir: non_empty("MRT_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./reports")),
            user_agent: non_empty("MRT_USER_AGENT")
                .unwrap_or_else(|| "mrt-bot/0.1".to_string()),
            http_timeout_secs: non_empty("MRT_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(20),
            github_token: non_empty("GITHUB_TOKEN"),
            slack_webhook_url: non_empty("SLACK_WEBHOOK_URL"),
            discord_webhook_url: non_empty("DISCORD_WEBHOOK_URL"),
            threshold_override: non_empty("MRT_CLASSIFIER_THRESHOLD")
                .and_then(|v| v.trim().parse::<f64>().ok())
                .filter(|v| v.is_finite())
                .map(|v| v.clamp(0.0, 1.0)),
            retention_floor_days: non_empty("MRT_RETENTION_FLOOR_DAYS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(30),
        }
    }
}

/// Read the configured YAML document and fold in environment overrides.
pub fn load_tracker_config(settings: &RuntimeSettings) -> Result<TrackerConfig> {
    let mut config = TrackerConfig::load(&settings.config_path)?;
    config.apply_overrides(settings);
    Ok(config)
}
