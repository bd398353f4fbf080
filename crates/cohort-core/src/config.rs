//! Configuration
//!
//! Loads cohort evaluation settings from YAML. Every section has defaults,
//! so a file only needs to name what differs.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CohortConfig {
    pub rule_service: EndpointConfig,
    pub store: EndpointConfig,
    pub remote: RemotePolicy,
    pub evaluation: EvaluationSettings,
    pub pseudonymization: PseudonymConfig,
}

/// Remote HTTP endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub base_url: String,
    pub request_timeout_ms: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/fhir".to_string(),
            request_timeout_ms: 30_000,
        }
    }
}

impl EndpointConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Failure policy for rule-service calls.
///
/// Each call is bounded by `call_timeout_ms`. A transient failure (transport,
/// timeout, 5xx or 429) is retried up to `max_attempts` in total, sleeping
/// `backoff_ms * attempt` between tries. Other failures, and a transient one
/// with no attempts left, abort the cohort run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemotePolicy {
    pub call_timeout_ms: u64,
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RemotePolicy {
    fn default() -> Self {
        Self {
            call_timeout_ms: 30_000,
            max_attempts: 3,
            backoff_ms: 500,
        }
    }
}

impl RemotePolicy {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Delay before retry number `attempt` (1-based count of failures so far).
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(attempt as u64))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationSettings {
    /// Library used when neither the leaf nor its definition names one
    pub fallback_library_id: String,
    /// Subjects evaluated concurrently; 1 is strictly sequential
    pub max_concurrent_subjects: usize,
    /// Abort the run when one subject takes longer than this
    pub subject_timeout_ms: Option<u64>,
    /// Cache reference resolutions for the lifetime of the resolver
    pub cache_resolutions: bool,
}

impl Default for EvaluationSettings {
    fn default() -> Self {
        Self {
            fallback_library_id: "Eligibility".to_string(),
            max_concurrent_subjects: 1,
            subject_timeout_ms: None,
            cache_resolutions: true,
        }
    }
}

impl EvaluationSettings {
    pub fn subject_timeout(&self) -> Option<Duration> {
        self.subject_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PseudonymConfig {
    /// Environment variable holding the pseudonymization key
    pub key_env: String,
}

impl Default for PseudonymConfig {
    fn default() -> Self {
        Self {
            key_env: "COHORT_PSEUDONYM_KEY".to_string(),
        }
    }
}

impl CohortConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Load configuration from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: CohortConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.remote.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "remote.max_attempts must be at least 1".into(),
            ));
        }
        if self.evaluation.max_concurrent_subjects == 0 {
            return Err(ConfigError::Invalid(
                "evaluation.max_concurrent_subjects must be at least 1".into(),
            ));
        }
        if self.evaluation.fallback_library_id.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "evaluation.fallback_library_id must not be empty".into(),
            ));
        }
        Ok(())
    }
}
