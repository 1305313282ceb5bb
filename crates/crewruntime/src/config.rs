use crate::RuntimeError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Configuration for the execution runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of worker threads; executions beyond this queue.
    pub max_workers: usize,
    /// Terminal records kept for inspection before the oldest are evicted.
    pub retention_limit: usize,
    pub event_buffer_size: usize,
    /// Timeout applied to submissions that do not set their own.
    pub default_timeout_secs: Option<f64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            retention_limit: 100,
            event_buffer_size: 1000,
            default_timeout_secs: None,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `CREW_*` environment variables.
    pub fn from_env() -> Result<Self, RuntimeError> {
        Self::default().merge_env()
    }

    /// Load a JSON config file; missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RuntimeError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: RuntimeConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `CREW_MAX_WORKERS`, `CREW_RETENTION_LIMIT`, `CREW_EVENT_BUFFER`
    /// and `CREW_DEFAULT_TIMEOUT_SECS` on top of this config.
    pub fn merge_env(mut self) -> Result<Self, RuntimeError> {
        if let Some(workers) = env_var("CREW_MAX_WORKERS")? {
            self.max_workers = workers;
        }
        if let Some(limit) = env_var("CREW_RETENTION_LIMIT")? {
            self.retention_limit = limit;
        }
        if let Some(size) = env_var("CREW_EVENT_BUFFER")? {
            self.event_buffer_size = size;
        }
        if let Some(secs) = env_var("CREW_DEFAULT_TIMEOUT_SECS")? {
            self.default_timeout_secs = Some(secs);
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.max_workers == 0 {
            return Err(RuntimeError::InvalidConfig(
                "max_workers must be at least 1".to_string(),
            ));
        }
        if self.retention_limit == 0 {
            return Err(RuntimeError::InvalidConfig(
                "retention_limit must be at least 1".to_string(),
            ));
        }
        if let Some(secs) = self.default_timeout_secs {
            if secs <= 0.0 || Duration::try_from_secs_f64(secs).is_err() {
                return Err(RuntimeError::InvalidConfig(format!(
                    "default_timeout_secs must be a positive duration, got {}",
                    secs
                )));
            }
        }
        Ok(())
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_secs.map(Duration::from_secs_f64)
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_retention_limit(mut self, retention_limit: usize) -> Self {
        self.retention_limit = retention_limit;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_secs = Some(timeout.as_secs_f64());
        self
    }
}

fn env_var<T: FromStr>(var: &str) -> Result<Option<T>, RuntimeError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| RuntimeError::InvalidEnv {
                var: var.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}
