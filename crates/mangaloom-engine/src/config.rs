//! Engine configuration.
//!
//! Sources, lowest to highest: built-in defaults, an optional JSON file, then
//! `MANGALOOM_*` environment variables. Every numeric value is clamped to a
//! safe range after loading.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config {} is not valid JSON: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid configuration value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Whether a batch on a session that already has pages seeds page one from that history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinuationPolicy {
    #[default]
    Always,
    WhenAutoContinue,
}

impl ContinuationPolicy {
    pub fn should_continue(self, has_history: bool, auto_continue: bool) -> bool {
        if !has_history {
            return false;
        }
        match self {
            Self::Always => true,
            Self::WhenAutoContinue => auto_continue,
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "always" => Some(Self::Always),
            "when_auto_continue" | "auto" => Some(Self::WhenAutoContinue),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_transient_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
    pub max_policy_attempts: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_transient_attempts: 4,
            base_delay_ms: 1000,
            max_delay_ms: 16_000,
            jitter: true,
            max_policy_attempts: 5,
        }
    }
}

impl RetrySettings {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilaritySettings {
    pub threshold: f64,
    pub max_retries: u32,
}

impl Default for SimilaritySettings {
    fn default() -> Self {
        Self {
            threshold: crate::similarity::DEFAULT_SIMILARITY_THRESHOLD,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceSettings {
    pub continuation_window: usize,
    pub render_window: usize,
    pub max_uploaded: usize,
    pub fetch_timeout_s: u64,
}

impl Default for ReferenceSettings {
    fn default() -> Self {
        Self {
            continuation_window: 2,
            render_window: 3,
            max_uploaded: 4,
            fetch_timeout_s: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub request_timeout_s: u64,
    pub text_model: String,
    pub image_model: String,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            request_timeout_s: 90,
            text_model: "gemini-2.5-flash".to_string(),
            image_model: "gemini-2.5-flash-image".to_string(),
        }
    }
}

impl ProviderSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub retry: RetrySettings,
    pub similarity: SimilaritySettings,
    pub references: ReferenceSettings,
    pub providers: ProviderSettings,
    pub continuation_policy: ContinuationPolicy,
    pub smart_policy_rewrite: bool,
}

impl EngineConfig {
    /// Defaults, then `path` when given, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config.clamped())
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let parsed: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(parsed.clamped())
    }

    /// Applies `MANGALOOM_*` overrides read through `lookup`.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(raw) = read("MANGALOOM_MAX_TRANSIENT_ATTEMPTS") {
            self.retry.max_transient_attempts = parse_field("MANGALOOM_MAX_TRANSIENT_ATTEMPTS", &raw)?;
        }
        if let Some(raw) = read("MANGALOOM_RETRY_BASE_DELAY_MS") {
            self.retry.base_delay_ms = parse_field("MANGALOOM_RETRY_BASE_DELAY_MS", &raw)?;
        }
        if let Some(raw) = read("MANGALOOM_RETRY_MAX_DELAY_MS") {
            self.retry.max_delay_ms = parse_field("MANGALOOM_RETRY_MAX_DELAY_MS", &raw)?;
        }
        if let Some(raw) = read("MANGALOOM_RETRY_JITTER") {
            self.retry.jitter = parse_bool("MANGALOOM_RETRY_JITTER", &raw)?;
        }
        if let Some(raw) = read("MANGALOOM_MAX_POLICY_ATTEMPTS") {
            self.retry.max_policy_attempts = parse_field("MANGALOOM_MAX_POLICY_ATTEMPTS", &raw)?;
        }
        if let Some(raw) = read("MANGALOOM_SIMILARITY_THRESHOLD") {
            self.similarity.threshold = parse_field("MANGALOOM_SIMILARITY_THRESHOLD", &raw)?;
        }
        if let Some(raw) = read("MANGALOOM_SIMILARITY_RETRIES") {
            self.similarity.max_retries = parse_field("MANGALOOM_SIMILARITY_RETRIES", &raw)?;
        }
        if let Some(raw) = read("MANGALOOM_REQUEST_TIMEOUT_S") {
            self.providers.request_timeout_s = parse_field("MANGALOOM_REQUEST_TIMEOUT_S", &raw)?;
        }
        if let Some(raw) = read("MANGALOOM_TEXT_MODEL") {
            self.providers.text_model = raw;
        }
        if let Some(raw) = read("MANGALOOM_IMAGE_MODEL") {
            self.providers.image_model = raw;
        }
        if let Some(raw) = read("MANGALOOM_CONTINUATION_POLICY") {
            self.continuation_policy =
                ContinuationPolicy::parse(&raw).ok_or_else(|| ConfigError::InvalidValue {
                    field: "MANGALOOM_CONTINUATION_POLICY".to_string(),
                    reason: format!("expected 'always' or 'when_auto_continue', got '{raw}'"),
                })?;
        }
        if let Some(raw) = read("MANGALOOM_SMART_POLICY_REWRITE") {
            self.smart_policy_rewrite = parse_bool("MANGALOOM_SMART_POLICY_REWRITE", &raw)?;
        }
        Ok(())
    }

    pub fn clamped(mut self) -> Self {
        let retry = &mut self.retry;
        retry.max_transient_attempts = retry.max_transient_attempts.clamp(1, 8);
        retry.base_delay_ms = retry.base_delay_ms.clamp(10, 30_000);
        retry.max_delay_ms = retry.max_delay_ms.max(retry.base_delay_ms);
        retry.max_policy_attempts = retry.max_policy_attempts.clamp(1, 8);

        let similarity = &mut self.similarity;
        if !similarity.threshold.is_finite() {
            similarity.threshold = crate::similarity::DEFAULT_SIMILARITY_THRESHOLD;
        }
        similarity.threshold = similarity.threshold.clamp(0.0, 1.0);
        similarity.max_retries = similarity.max_retries.min(6);

        let references = &mut self.references;
        references.continuation_window = references.continuation_window.min(3);
        references.render_window = references.render_window.min(3);
        references.max_uploaded = references.max_uploaded.min(8);
        references.fetch_timeout_s = references.fetch_timeout_s.clamp(1, 120);

        self.providers.request_timeout_s = self.providers.request_timeout_s.clamp(15, 300);
        self
    }
}

fn parse_field<T: std::str::FromStr>(field: &str, raw: &str) -> Result<T, ConfigError> {
    raw.parse::<T>().map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        reason: format!("could not parse '{raw}'"),
    })
}

fn parse_bool(field: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            field: field.to_string(),
            reason: format!("expected a boolean, got '{raw}'"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{ConfigError, ContinuationPolicy, EngineConfig};

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.retry.max_transient_attempts, 4);
        assert_eq!(config.retry.max_policy_attempts, 5);
        assert_eq!(config.similarity.threshold, 0.7);
        assert_eq!(config.similarity.max_retries, 3);
        assert_eq!(config.references.continuation_window, 2);
        assert_eq!(config.continuation_policy, ContinuationPolicy::Always);
        assert!(!config.smart_policy_rewrite);
    }

    #[test]
    fn env_overrides_are_applied_and_clamped() -> anyhow::Result<()> {
        let mut config = EngineConfig::default();
        config.apply_env(env(&[
            ("MANGALOOM_MAX_TRANSIENT_ATTEMPTS", "40"),
            ("MANGALOOM_RETRY_BASE_DELAY_MS", " 250 "),
            ("MANGALOOM_SIMILARITY_THRESHOLD", "1.5"),
            ("MANGALOOM_CONTINUATION_POLICY", "when_auto_continue"),
            ("MANGALOOM_RETRY_JITTER", "off"),
        ]))?;
        let config = config.clamped();
        assert_eq!(config.retry.max_transient_attempts, 8);
        assert_eq!(config.retry.base_delay_ms, 250);
        assert_eq!(config.similarity.threshold, 1.0);
        assert!(!config.retry.jitter);
        assert_eq!(
            config.continuation_policy,
            ContinuationPolicy::WhenAutoContinue
        );
        Ok(())
    }

    #[test]
    fn invalid_env_value_is_reported_with_field_name() {
        let mut config = EngineConfig::default();
        let err = config
            .apply_env(env(&[("MANGALOOM_MAX_POLICY_ATTEMPTS", "many")]))
            .err();
        match err {
            Some(ConfigError::InvalidValue { field, .. }) => {
                assert_eq!(field, "MANGALOOM_MAX_POLICY_ATTEMPTS")
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn file_values_merge_over_defaults() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("mangaloom.json");
        std::fs::write(
            &path,
            r#"{"retry": {"max_policy_attempts": 3}, "smart_policy_rewrite": true}"#,
        )?;
        let config = EngineConfig::from_file(&path)?;
        assert_eq!(config.retry.max_policy_attempts, 3);
        assert_eq!(config.retry.max_transient_attempts, 4);
        assert!(config.smart_policy_rewrite);
        Ok(())
    }

    #[test]
    fn continuation_policy_only_applies_with_history() {
        assert!(!ContinuationPolicy::Always.should_continue(false, true));
        assert!(ContinuationPolicy::Always.should_continue(true, false));
        assert!(!ContinuationPolicy::WhenAutoContinue.should_continue(true, false));
        assert!(ContinuationPolicy::WhenAutoContinue.should_continue(true, true));
    }
}
