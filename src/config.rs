//! Configuration types, built from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default wall-clock budget for a step that does not set its own timeout.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(120);

/// Pipeline runtime configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Path to the libSQL database file.
    pub db_path: PathBuf,
    /// Timeout applied to steps without an explicit one.
    pub default_step_timeout: Duration,
    /// How often the background worker looks for unprocessed messages.
    pub worker_interval: Duration,
    /// Maximum messages handled per worker tick.
    pub worker_batch_size: usize,
    /// LLM settings; `None` disables the summarize step.
    pub llm: Option<LlmSettings>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/mailflow.db"),
            default_step_timeout: DEFAULT_STEP_TIMEOUT,
            worker_interval: Duration::from_secs(60),
            worker_batch_size: 25,
            llm: None,
        }
    }
}

impl PipelineConfig {
    /// Build from `MAILFLOW_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let db_path = std::env::var("MAILFLOW_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let default_step_timeout = env_secs("MAILFLOW_STEP_TIMEOUT_SECS")?
            .unwrap_or(defaults.default_step_timeout);

        let worker_interval =
            env_secs("MAILFLOW_WORKER_INTERVAL_SECS")?.unwrap_or(defaults.worker_interval);

        let worker_batch_size = match std::env::var("MAILFLOW_WORKER_BATCH_SIZE") {
            Ok(s) => parse_batch_size(&s)?,
            Err(_) => defaults.worker_batch_size,
        };

        Ok(Self {
            db_path,
            default_step_timeout,
            worker_interval,
            worker_batch_size,
            llm: LlmSettings::from_env()?,
        })
    }
}

/// LLM client settings.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub api_key: SecretString,
    pub model: String,
}

impl LlmSettings {
    /// Returns `None` when `ANTHROPIC_API_KEY` is unset.
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        let Ok(api_key) = std::env::var("ANTHROPIC_API_KEY") else {
            return Ok(None);
        };
        if api_key.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "ANTHROPIC_API_KEY".to_string(),
                message: "must not be empty".to_string(),
            });
        }

        let model = std::env::var("MAILFLOW_LLM_MODEL")
            .unwrap_or_else(|_| "claude-3-5-haiku-latest".to_string());

        Ok(Some(Self {
            api_key: SecretString::from(api_key),
            model,
        }))
    }
}

fn parse_batch_size(s: &str) -> Result<usize, ConfigError> {
    match s.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::InvalidValue {
            key: "MAILFLOW_WORKER_BATCH_SIZE".to_string(),
            message: format!("expected a positive integer, got {s:?}"),
        }),
    }
}

fn env_secs(key: &str) -> Result<Option<Duration>, ConfigError> {
    match std::env::var(key) {
        Ok(s) => s
            .parse::<u64>()
            .map(|secs| Some(Duration::from_secs(secs)))
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected whole seconds, got {s:?}"),
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.default_step_timeout, Duration::from_secs(120));
        assert_eq!(config.worker_batch_size, 25);
        assert!(config.llm.is_none());
    }

    #[test]
    fn batch_size_must_be_positive() {
        assert_eq!(parse_batch_size("10").unwrap(), 10);
        assert!(matches!(
            parse_batch_size("0"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(parse_batch_size("-3").is_err());
        assert!(parse_batch_size("lots").is_err());
    }

    #[test]
    fn env_secs_parses_and_rejects() {
        // SAFETY: the variable name is unique to this test; nothing else reads it.
        unsafe { std::env::set_var("MAILFLOW_TEST_SECS_OK", "7") };
        assert_eq!(
            env_secs("MAILFLOW_TEST_SECS_OK").unwrap(),
            Some(Duration::from_secs(7))
        );

        // SAFETY: as above.
        unsafe { std::env::set_var("MAILFLOW_TEST_SECS_BAD", "soon") };
        assert!(env_secs("MAILFLOW_TEST_SECS_BAD").is_err());

        assert_eq!(env_secs("MAILFLOW_TEST_SECS_UNSET").unwrap(), None);
    }
}
