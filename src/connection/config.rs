use super::IsolationLevel;
use crate::core::{DbError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-statement execution settings
///
/// Built once and passed by value into a template; the fluent setters are
/// sugar over filling in the struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementConfig {
    /// Driver-enforced statement timeout
    pub timeout: Option<Duration>,

    /// Rows fetched per round-trip for queries
    pub fetch_size: usize,

    /// Statements per `execute_batch` call
    pub batch_size: usize,

    /// Record a failing batch and keep going instead of aborting
    pub continue_on_error: bool,

    /// Free-form label reported to telemetry
    pub label: Option<String>,
}

impl StatementConfig {
    pub fn new() -> Self {
        Self {
            timeout: None,
            fetch_size: 100,
            batch_size: 100,
            continue_on_error: false,
            label: None,
        }
    }

    /// Set statement timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set fetch size
    pub fn fetch_size(mut self, rows: usize) -> Self {
        self.fetch_size = rows;
        self
    }

    /// Set batch size
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Rows of a failed batch are dropped, not retried one by one; only the
    /// error is recorded.
    pub fn continue_on_error(mut self, enabled: bool) -> Self {
        self.continue_on_error = enabled;
        self
    }

    /// Set telemetry label
    pub fn label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(DbError::ConfigError("batch_size must be > 0".into()));
        }

        if self.fetch_size == 0 {
            return Err(DbError::ConfigError("fetch_size must be > 0".into()));
        }

        if self.timeout == Some(Duration::ZERO) {
            return Err(DbError::ConfigError("timeout must be > 0".into()));
        }

        Ok(())
    }
}

impl Default for StatementConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Settings applied to every transaction started with them
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TransactionOptions {
    pub isolation: IsolationLevel,
    pub label: Option<String>,
}

impl TransactionOptions {
    pub fn new(isolation: IsolationLevel) -> Self {
        Self {
            isolation,
            label: None,
        }
    }

    pub fn label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }
}
