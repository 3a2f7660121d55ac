//! TOML-based orchestrator configuration.
//!
//! # Example TOML
//!
//! ```toml
//! task_timeout_ms = 600000
//! worker_count = 4
//! requeue_timeout_ms = 1800000
//! retry_delay_ms = 1000
//! supervision_timeout_ms = 900000
//! ```
//!
//! Every field is optional; missing fields fall back to the defaults below.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default per-task confirmation timeout: 10 minutes.
fn default_task_timeout_ms() -> u64 {
    600_000
}

fn default_worker_count() -> usize {
    4
}

/// Default validity window for jobs dispatched without one: 30 minutes.
fn default_requeue_timeout_ms() -> u64 {
    30 * 60 * 1000
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

/// Orchestrator settings consumed by the transaction manager and the
/// local job engine.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct OrchestratorConfig {
    /// Default task/confirmation timeout handed to work units (ms).
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,

    /// Size of the job engine's worker pool.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Validity window for jobs dispatched without an explicit one (ms).
    #[serde(default = "default_requeue_timeout_ms")]
    pub requeue_timeout_ms: u64,

    /// Delay before a retryable task is put back on the queue (ms).
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Upper bound on a transaction work unit (ms). When it elapses the
    /// transaction is marked failed and the work unit's token is cancelled.
    #[serde(default)]
    pub supervision_timeout_ms: Option<u64>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            task_timeout_ms: default_task_timeout_ms(),
            worker_count: default_worker_count(),
            requeue_timeout_ms: default_requeue_timeout_ms(),
            retry_delay_ms: default_retry_delay_ms(),
            supervision_timeout_ms: None,
        }
    }
}

impl OrchestratorConfig {
    /// Parses and validates a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ConfigIo {
            source: e,
            path: path.display().to_string(),
        })?;
        Self::from_toml_str(&content)
    }

    /// Checks semantic constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::ConfigValidation {
                message: "worker_count must be at least 1".to_string(),
            });
        }
        if self.task_timeout_ms == 0 {
            return Err(ConfigError::ConfigValidation {
                message: "task_timeout_ms must be greater than 0".to_string(),
            });
        }
        if self.requeue_timeout_ms == 0 {
            return Err(ConfigError::ConfigValidation {
                message: "requeue_timeout_ms must be greater than 0".to_string(),
            });
        }
        if self.supervision_timeout_ms == Some(0) {
            return Err(ConfigError::ConfigValidation {
                message: "supervision_timeout_ms must be greater than 0 when set".to_string(),
            });
        }
        Ok(())
    }

    /// Default task timeout as a [`Duration`].
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    /// Job validity window as a [`Duration`].
    pub fn requeue_timeout(&self) -> Duration {
        Duration::from_millis(self.requeue_timeout_ms)
    }

    /// Retry delay as a [`Duration`].
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Supervision bound, if configured.
    pub fn supervision_timeout(&self) -> Option<Duration> {
        self.supervision_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn empty_toml_uses_defaults() {
        let config = OrchestratorConfig::from_toml_str("").unwrap();
        assert_eq!(config, OrchestratorConfig::default());
        assert_eq!(config.requeue_timeout(), Duration::from_secs(30 * 60));
        assert_eq!(config.supervision_timeout(), None);
    }

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
task_timeout_ms = 5000
worker_count = 8
requeue_timeout_ms = 60000
retry_delay_ms = 250
supervision_timeout_ms = 9000
"#;
        let config = OrchestratorConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.task_timeout(), Duration::from_millis(5000));
        assert_eq!(config.worker_count, 8);
        assert_eq!(config.retry_delay(), Duration::from_millis(250));
        assert_eq!(config.supervision_timeout(), Some(Duration::from_millis(9000)));
    }

    #[test]
    fn zero_workers_rejected() {
        let err = OrchestratorConfig::from_toml_str("worker_count = 0").unwrap_err();
        assert!(
            matches!(err, ConfigError::ConfigValidation { .. }),
            "expected ConfigValidation, got: {err}"
        );
        assert!(err.to_string().contains("worker_count"));
    }

    #[test]
    fn zero_supervision_timeout_rejected() {
        let err = OrchestratorConfig::from_toml_str("supervision_timeout_ms = 0").unwrap_err();
        assert!(err.to_string().contains("supervision_timeout_ms"));
    }

    #[test]
    fn invalid_toml_is_parse_error() {
        let err = OrchestratorConfig::from_toml_str("worker_count = \"many\"").unwrap_err();
        assert!(matches!(err, ConfigError::ConfigParse { .. }));
    }

    #[test]
    fn from_file_reads_and_validates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "worker_count = 2").unwrap();
        let config = OrchestratorConfig::from_file(file.path()).unwrap();
        assert_eq!(config.worker_count, 2);
    }

    #[test]
    fn from_file_missing_is_io_error() {
        let err = OrchestratorConfig::from_file(Path::new("/nonexistent/orchestrator.toml"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::ConfigIo { .. }));
    }
}
