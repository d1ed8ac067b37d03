//! Collator configuration.

use crate::error::{CollatorResult, ConfigError};

/// Environment variable overriding the buffer budget.
pub const MAX_BUFFER_SIZE_ENV: &str = "COLLATOR_MAX_BUFFER_SIZE";

/// Budget used when nothing else is configured (1 GB).
pub const DEFAULT_MAX_BUFFER_SIZE: u64 = 1_000_000_000;

/// Largest accepted budget (1 TiB).
pub const MAX_BUFFER_SIZE_LIMIT: u64 = 1 << 40;

/// Configuration for a [`crate::Collator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollatorConfig {
    /// Bytes that may be queued but not yet written. `0` makes every write
    /// synchronous and never starts the worker.
    pub max_buffer_size: u64,
    /// Name of the background writer thread.
    pub worker_name: String,
    /// Abort the process when a background write fails, after logging it.
    pub fatal_background_errors: bool,
}

impl Default for CollatorConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            worker_name: "collator-writer".to_string(),
            fatal_background_errors: false,
        }
    }
}

impl CollatorConfig {
    /// Default configuration with the given budget.
    #[must_use]
    pub fn with_max_buffer_size(max_buffer_size: u64) -> Self {
        Self {
            max_buffer_size,
            ..Self::default()
        }
    }

    /// Default configuration, with the budget taken from
    /// `COLLATOR_MAX_BUFFER_SIZE` when it is set.
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidBufferSize` if the variable is not a
    /// non-negative integer byte count.
    pub fn from_env() -> CollatorResult<Self> {
        Self::from_env_value(std::env::var(MAX_BUFFER_SIZE_ENV).ok().as_deref())
    }

    fn from_env_value(value: Option<&str>) -> CollatorResult<Self> {
        let Some(raw) = value else {
            return Self::default().validate();
        };
        let max_buffer_size = raw.trim().parse::<u64>().map_err(|e| ConfigError::InvalidBufferSize {
            reason: format!("{MAX_BUFFER_SIZE_ENV}={raw:?}: {e}"),
        })?;
        Self::with_max_buffer_size(max_buffer_size).validate()
    }

    /// Checks the configuration.
    pub fn validate(self) -> CollatorResult<Self> {
        if self.max_buffer_size > MAX_BUFFER_SIZE_LIMIT {
            return Err(ConfigError::InvalidBufferSize {
                reason: format!(
                    "max_buffer_size must be at most {MAX_BUFFER_SIZE_LIMIT} bytes (got {})",
                    self.max_buffer_size
                ),
            }
            .into());
        }

        if self.worker_name.trim().is_empty() {
            return Err(ConfigError::InvalidWorkerName {
                reason: "worker name cannot be empty".to_string(),
            }
            .into());
        }

        // Thread names are passed to the OS as C strings.
        if self.worker_name.contains('\0') {
            return Err(ConfigError::InvalidWorkerName {
                reason: "worker name cannot contain NUL".to_string(),
            }
            .into());
        }

        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let cfg = CollatorConfig::default().validate().unwrap();
        assert_eq!(cfg.max_buffer_size, DEFAULT_MAX_BUFFER_SIZE);
        assert!(!cfg.fatal_background_errors);
    }

    #[test]
    fn zero_budget_is_valid() {
        assert!(CollatorConfig::with_max_buffer_size(0).validate().is_ok());
    }

    #[test]
    fn oversized_budget_is_rejected() {
        let err = CollatorConfig::with_max_buffer_size(MAX_BUFFER_SIZE_LIMIT + 1)
            .validate()
            .unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("at most"));
    }

    #[test]
    fn empty_worker_name_is_rejected() {
        let cfg = CollatorConfig {
            worker_name: " ".to_string(),
            ..CollatorConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn env_value_parsing() {
        assert_eq!(
            CollatorConfig::from_env_value(None).unwrap().max_buffer_size,
            DEFAULT_MAX_BUFFER_SIZE
        );
        assert_eq!(CollatorConfig::from_env_value(Some(" 4096 ")).unwrap().max_buffer_size, 4096);
        assert_eq!(CollatorConfig::from_env_value(Some("0")).unwrap().max_buffer_size, 0);

        let err = CollatorConfig::from_env_value(Some("1e9")).unwrap_err();
        assert!(err.to_string().contains(MAX_BUFFER_SIZE_ENV));
        assert!(CollatorConfig::from_env_value(Some("-5")).is_err());
    }
}
