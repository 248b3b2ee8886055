//! Sync engine configuration.
//!
//! Loaded from YAML. Scalar values may reference environment variables as
//! `${NAME}` or `${NAME:-fallback}`; references are expanded before parsing.

use std::path::Path;
use std::time::Duration;

use contactsync_directory::resilience::RetryPolicy;
use contactsync_directory::types::DirectoryKind;
use serde::{Deserialize, Serialize};

use crate::contact::FieldName;
use crate::error::{SyncError, SyncResult};

/// Root engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub directories: DirectoriesConfig,
    #[serde(default)]
    pub retry: RetrySettings,
    /// Minimum name similarity (0.0..=1.0) for a fuzzy match.
    #[serde(default = "default_match_confidence_threshold")]
    pub match_confidence_threshold: f64,
    /// Canonical fields written back to directories. Empty means all.
    #[serde(default)]
    pub sync_fields: Vec<FieldName>,
    #[serde(default = "default_notes_separator")]
    pub notes_separator: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_match_confidence_threshold() -> f64 {
    0.85
}

fn default_notes_separator() -> String {
    "\n---\n".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_poll_interval() -> u64 {
    300
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            directories: DirectoriesConfig::default(),
            retry: RetrySettings::default(),
            match_confidence_threshold: default_match_confidence_threshold(),
            sync_fields: Vec::new(),
            notes_separator: default_notes_separator(),
            request_timeout_secs: default_request_timeout(),
            poll_interval_secs: default_poll_interval(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Per-directory settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoriesConfig {
    #[serde(default)]
    pub messaging: DirectoryConfig,
    #[serde(default)]
    pub cloud: DirectoryConfig,
}

/// Limits applied to one directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// Maximum records written per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Maximum batches in flight at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Records requested per change page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Optional client-side write budget.
    #[serde(default)]
    pub rate_limit_per_minute: Option<u32>,
}

fn default_batch_size() -> usize {
    50
}

fn default_max_concurrency() -> usize {
    4
}

fn default_page_size() -> usize {
    200
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_concurrency: default_max_concurrency(),
            page_size: default_page_size(),
            rate_limit_per_minute: None,
        }
    }
}

/// Retry settings for transient directory failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    4
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

/// Logging configuration consumed by binaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `json` or `pretty`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl SyncConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> SyncResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            SyncError::configuration(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(content: &str) -> SyncResult<Self> {
        let expanded = expand_env(content)?;
        let config: SyncConfig = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> SyncResult<()> {
        for kind in DirectoryKind::ALL {
            let dir = self.directory(kind);
            if dir.batch_size == 0 {
                return Err(SyncError::configuration(format!(
                    "directories.{kind}.batch_size must be at least 1"
                )));
            }
            if dir.max_concurrency == 0 {
                return Err(SyncError::configuration(format!(
                    "directories.{kind}.max_concurrency must be at least 1"
                )));
            }
            if dir.page_size == 0 {
                return Err(SyncError::configuration(format!(
                    "directories.{kind}.page_size must be at least 1"
                )));
            }
            if dir.rate_limit_per_minute == Some(0) {
                return Err(SyncError::configuration(format!(
                    "directories.{kind}.rate_limit_per_minute must be positive when set"
                )));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(SyncError::configuration("retry.max_attempts must be at least 1"));
        }
        if self.retry.multiplier < 1.0 {
            return Err(SyncError::configuration("retry.multiplier must be >= 1.0"));
        }
        if !(0.0..=1.0).contains(&self.match_confidence_threshold) {
            return Err(SyncError::configuration(
                "match_confidence_threshold must be between 0.0 and 1.0",
            ));
        }
        if self.notes_separator.trim().is_empty() {
            return Err(SyncError::configuration("notes_separator must not be blank"));
        }
        if self.request_timeout_secs == 0 {
            return Err(SyncError::configuration("request_timeout_secs must be positive"));
        }
        Ok(())
    }

    /// Settings for one directory.
    #[must_use]
    pub fn directory(&self, kind: DirectoryKind) -> &DirectoryConfig {
        match kind {
            DirectoryKind::Messaging => &self.directories.messaging,
            DirectoryKind::Cloud => &self.directories.cloud,
        }
    }

    /// Retry policy built from the retry settings.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.base_delay_ms),
        )
        .with_max_delay(Duration::from_millis(self.retry.max_delay_ms))
        .with_multiplier(self.retry.multiplier)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Whether `field` is written back to directories.
    #[must_use]
    pub fn syncs_field(&self, field: FieldName) -> bool {
        self.sync_fields.is_empty() || self.sync_fields.contains(&field)
    }
}

/// Expand `${NAME}` and `${NAME:-fallback}` references.
///
/// An unset variable without a fallback is a configuration error.
fn expand_env(content: &str) -> SyncResult<String> {
    let mut out = String::with_capacity(content.len());
    let mut rest = content;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| {
            SyncError::configuration("Unterminated ${...} reference in configuration")
        })?;
        let reference = &after[..end];
        let (name, fallback) = match reference.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (reference, None),
        };
        match (std::env::var(name), fallback) {
            (Ok(value), _) => out.push_str(&value),
            (Err(_), Some(fallback)) => out.push_str(fallback),
            (Err(_), None) => {
                return Err(SyncError::configuration(format!(
                    "Environment variable {name} is not set"
                )))
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::from_yaml("{}").unwrap();
        assert_eq!(config.directory(DirectoryKind::Cloud).batch_size, 50);
        assert_eq!(config.directory(DirectoryKind::Messaging).max_concurrency, 4);
        assert_eq!(config.retry.max_attempts, 4);
        assert!((config.match_confidence_threshold - 0.85).abs() < f64::EPSILON);
        assert!(config.syncs_field(FieldName::Notes));
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
directories:
  messaging:
    batch_size: 10
    max_concurrency: 2
  cloud:
    batch_size: 25
    rate_limit_per_minute: 90
retry:
  max_attempts: 6
  base_delay_ms: 50
match_confidence_threshold: 0.9
sync_fields: [name, phones, emails]
poll_interval_secs: 60
"#;
        let config = SyncConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.directory(DirectoryKind::Messaging).batch_size, 10);
        assert_eq!(
            config.directory(DirectoryKind::Cloud).rate_limit_per_minute,
            Some(90)
        );
        assert_eq!(config.retry_policy().max_attempts, 6);
        assert!(config.syncs_field(FieldName::Phones));
        assert!(!config.syncs_field(FieldName::Notes));
        assert_eq!(config.poll_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_validation_rejects_zero_batch() {
        let err = SyncConfig::from_yaml("directories:\n  cloud:\n    batch_size: 0\n").unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn test_validation_rejects_threshold_out_of_range() {
        assert!(SyncConfig::from_yaml("match_confidence_threshold: 1.5").is_err());
    }

    #[test]
    fn test_env_expansion() {
        std::env::set_var("CONTACTSYNC_TEST_BATCH", "7");
        let yaml = "directories:\n  cloud:\n    batch_size: ${CONTACTSYNC_TEST_BATCH}\n";
        let config = SyncConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.directory(DirectoryKind::Cloud).batch_size, 7);
    }

    #[test]
    fn test_env_fallback_and_missing() {
        let yaml = "request_timeout_secs: ${CONTACTSYNC_TEST_UNSET_TIMEOUT:-12}\n";
        let config = SyncConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.request_timeout_secs, 12);

        let err = SyncConfig::from_yaml("request_timeout_secs: ${CONTACTSYNC_TEST_UNSET_X}\n")
            .unwrap_err();
        assert!(err.to_string().contains("CONTACTSYNC_TEST_UNSET_X"));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.yaml");
        std::fs::write(&path, "poll_interval_secs: 30\n").unwrap();
        let config = SyncConfig::from_file(&path).unwrap();
        assert_eq!(config.poll_interval_secs, 30);

        assert!(SyncConfig::from_file(dir.path().join("missing.yaml")).is_err());
    }
}
