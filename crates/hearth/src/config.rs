//! Runtime configuration.
//!
//! Values are layered: built-in defaults, then an optional JSON file, then
//! environment variables. The CLI applies its own flags last.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicy;

/// Errors loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The config file is not valid JSON for [`HearthConfig`].
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// File path.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },
    /// An environment variable held a value of the wrong type.
    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv {
        /// Variable name.
        var: &'static str,
        /// The offending value.
        value: String,
    },
}

/// Configuration for the sidecar, the project store and the model.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HearthConfig {
    /// Base URL of the sandbox sidecar.
    pub sidecar_url: String,
    /// Base URL of the project store API.
    pub store_url: String,
    /// Anthropic model id.
    pub model: String,
    /// Anthropic API base URL.
    pub anthropic_base_url: String,
    /// Anthropic API key. Never written back out.
    #[serde(skip_serializing)]
    pub anthropic_api_key: Option<String>,
    /// Output token cap per model step.
    pub max_tokens: u32,
    /// Model steps per turn.
    pub max_steps: usize,
    /// Tunnel lookups before a preview is reported not ready.
    pub preview_attempts: u32,
    /// Delay between tunnel lookups.
    #[serde(rename = "preview_delay_ms", with = "duration_ms")]
    pub preview_delay: Duration,
    /// Per-request timeout for sidecar, store and model calls, in seconds.
    pub request_timeout_secs: u64,
}

impl std::fmt::Debug for HearthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HearthConfig")
            .field("sidecar_url", &self.sidecar_url)
            .field("store_url", &self.store_url)
            .field("model", &self.model)
            .field("anthropic_base_url", &self.anthropic_base_url)
            .field(
                "anthropic_api_key",
                &self.anthropic_api_key.as_ref().map(|_| "<redacted>"),
            )
            .field("max_tokens", &self.max_tokens)
            .field("max_steps", &self.max_steps)
            .field("preview_attempts", &self.preview_attempts)
            .field("preview_delay", &self.preview_delay)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

impl Default for HearthConfig {
    fn default() -> Self {
        Self {
            sidecar_url: "http://localhost:4000".to_string(),
            store_url: "http://localhost:4000/api".to_string(),
            model: "claude-sonnet-4-5".to_string(),
            anthropic_base_url: "https://api.anthropic.com".to_string(),
            anthropic_api_key: None,
            max_tokens: 8192,
            max_steps: 10,
            preview_attempts: 5,
            preview_delay: Duration::from_secs(2),
            request_timeout_secs: 300,
        }
    }
}

impl HearthConfig {
    /// Load from an optional JSON file, then apply the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let base = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        base.with_env(|var| std::env::var(var).ok())
    }

    /// Read a JSON config file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply environment overrides read through `lookup`.
    pub fn with_env<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("HEARTH_SIDECAR_URL") {
            self.sidecar_url = v;
        }
        if let Some(v) = lookup("HEARTH_STORE_URL") {
            self.store_url = v;
        }
        if let Some(v) = lookup("HEARTH_MODEL") {
            self.model = v;
        }
        if let Some(v) = lookup("HEARTH_ANTHROPIC_BASE_URL") {
            self.anthropic_base_url = v;
        }
        if let Some(v) = lookup("ANTHROPIC_API_KEY").filter(|v| !v.is_empty()) {
            self.anthropic_api_key = Some(v);
        }
        if let Some(v) = lookup("HEARTH_MAX_STEPS") {
            self.max_steps = parse_env("HEARTH_MAX_STEPS", v)?;
        }
        if let Some(v) = lookup("HEARTH_REQUEST_TIMEOUT_SECS") {
            self.request_timeout_secs = parse_env("HEARTH_REQUEST_TIMEOUT_SECS", v)?;
        }
        Ok(self)
    }

    /// Polling policy for preview URL lookups.
    pub fn preview_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.preview_attempts, self.preview_delay)
    }

    /// Per-request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { var, value })
}

/// Helper for serializing Duration as milliseconds
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = HearthConfig::default();
        assert_eq!(config.max_steps, 10);
        assert_eq!(config.preview_policy(), RetryPolicy::default());
        assert_eq!(config.request_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_file_layer_keeps_defaults_for_missing_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"sidecar_url": "http://sidecar:4000", "preview_delay_ms": 500}}"#
        )
        .unwrap();

        let config = HearthConfig::from_file(file.path()).unwrap();
        assert_eq!(config.sidecar_url, "http://sidecar:4000");
        assert_eq!(config.preview_delay, Duration::from_millis(500));
        assert_eq!(config.model, "claude-sonnet-4-5");
    }

    #[test]
    fn test_env_overrides_file() {
        let config = HearthConfig::default()
            .with_env(env(&[
                ("HEARTH_MODEL", "claude-opus-4-1"),
                ("HEARTH_MAX_STEPS", "4"),
                ("ANTHROPIC_API_KEY", "sk-test"),
            ]))
            .unwrap();
        assert_eq!(config.model, "claude-opus-4-1");
        assert_eq!(config.max_steps, 4);
        assert_eq!(config.anthropic_api_key.as_deref(), Some("sk-test"));
        assert!(!format!("{config:?}").contains("sk-test"));
    }

    #[test]
    fn test_invalid_env_value() {
        let err = HearthConfig::default()
            .with_env(env(&[("HEARTH_MAX_STEPS", "many")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { var: "HEARTH_MAX_STEPS", .. }));
    }

    #[test]
    fn test_missing_file() {
        let err = HearthConfig::from_file(Path::new("/nonexistent/hearth.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_api_key_not_serialized() {
        let config = HearthConfig {
            anthropic_api_key: Some("sk-secret".into()),
            ..HearthConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("sk-secret"));
        assert!(json.contains("\"preview_delay_ms\":2000"));
    }
}
