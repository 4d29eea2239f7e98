//! Configuration types.
//!
//! Everything the classifier and pipelines need is passed in explicitly at
//! construction time; nothing below reads process state after startup.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Triage configuration.
#[derive(Debug, Clone)]
pub struct TriageConfig {
    /// Confidence below which a non-delegating decision is turned into a delegation.
    pub delegation_threshold: f32,
    /// Locale used when rendering model instructions.
    pub locale: String,
    /// Instruction template version.
    pub template_version: String,
    /// Deployment environment stamped onto ingested contexts.
    pub deployment_env: String,
    /// Per-call timeout for extraction, validation and scheduling.
    pub tool_timeout: Duration,
    /// Maximum attempts per tool call (first call included).
    pub max_attempts: u32,
    /// Base delay for exponential retry backoff.
    pub retry_base_delay: Duration,
    /// Maximum items of one email processed concurrently.
    pub max_concurrent_items: usize,
    /// How long before an event its reminder fires.
    pub reminder_lead: Duration,
    /// How long after a recruiter email its follow-up reminder fires.
    pub recruiter_follow_up: Duration,
    /// libSQL database file.
    pub db_path: PathBuf,
    /// Directory receiving calendar invites.
    pub ics_dir: PathBuf,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            delegation_threshold: 0.6,
            locale: "en".to_string(),
            template_version: "v1".to_string(),
            deployment_env: "development".to_string(),
            tool_timeout: Duration::from_secs(30),
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(200),
            max_concurrent_items: 4,
            reminder_lead: Duration::from_secs(24 * 3600),
            recruiter_follow_up: Duration::from_secs(48 * 3600),
            db_path: PathBuf::from("./data/mail-maestro.db"),
            ics_dir: PathBuf::from("./data/reminders"),
        }
    }
}

impl TriageConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let delegation_threshold = match std::env::var("MAILMAESTRO_DELEGATION_THRESHOLD") {
            Ok(raw) => parse_threshold(&raw)?,
            Err(_) => defaults.delegation_threshold,
        };

        let config = Self {
            delegation_threshold,
            locale: env_or("MAILMAESTRO_LOCALE", defaults.locale),
            template_version: env_or("TEMPLATE_VERSION", defaults.template_version),
            deployment_env: env_or("ENVIRONMENT", defaults.deployment_env),
            tool_timeout: env_parse("MAILMAESTRO_TOOL_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.tool_timeout),
            max_attempts: env_parse("MAILMAESTRO_MAX_ATTEMPTS")
                .filter(|n: &u32| *n > 0)
                .unwrap_or(defaults.max_attempts),
            retry_base_delay: env_parse("MAILMAESTRO_RETRY_BASE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_base_delay),
            max_concurrent_items: env_parse("MAILMAESTRO_MAX_CONCURRENT_ITEMS")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.max_concurrent_items),
            reminder_lead: env_parse("MAILMAESTRO_REMINDER_LEAD_HOURS")
                .map(|h: u64| Duration::from_secs(h * 3600))
                .unwrap_or(defaults.reminder_lead),
            recruiter_follow_up: env_parse("MAILMAESTRO_RECRUITER_FOLLOW_UP_HOURS")
                .map(|h: u64| Duration::from_secs(h * 3600))
                .unwrap_or(defaults.recruiter_follow_up),
            db_path: std::env::var("MAILMAESTRO_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            ics_dir: std::env::var("MAILMAESTRO_ICS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.ics_dir),
        };

        Ok(config)
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

/// Parse a delegation threshold, which must lie in `[0, 1]`.
pub fn parse_threshold(raw: &str) -> Result<f32, ConfigError> {
    let value: f32 = raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
        key: "MAILMAESTRO_DELEGATION_THRESHOLD".into(),
        message: format!("{e}"),
    })?;
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::InvalidValue {
            key: "MAILMAESTRO_DELEGATION_THRESHOLD".into(),
            message: format!("{value} is outside [0, 1]"),
        });
    }
    Ok(value)
}
