// ============================================================================
// Connection Layer
// ============================================================================
//
// Driver-facing traits (Connection, StatementHandle, Cursor) and the provider
// that hands out connections. Everything above this layer talks to a driver
// only through a `Session`, which owns the single connection of one unit of
// work and serializes access to it.
//
// ============================================================================

pub mod config;
pub mod memory;
pub mod session;

use crate::core::{DbError, Result, Row, Value};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub use config::{StatementConfig, TransactionOptions};
pub use session::{PreparedStatement, Session};

/// Transaction isolation level, set once before any statement runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::ReadUncommitted => write!(f, "READ UNCOMMITTED"),
            IsolationLevel::ReadCommitted => write!(f, "READ COMMITTED"),
            IsolationLevel::RepeatableRead => write!(f, "REPEATABLE READ"),
            IsolationLevel::Serializable => write!(f, "SERIALIZABLE"),
        }
    }
}

impl FromStr for IsolationLevel {
    type Err = DbError;

    /// Accepts `read committed`, `READ_COMMITTED` and `read-committed` alike.
    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .trim()
            .chars()
            .map(|c| if c == '_' || c == '-' { ' ' } else { c.to_ascii_lowercase() })
            .collect();
        let words: Vec<&str> = normalized.split_whitespace().collect();

        match words.as_slice() {
            ["read", "uncommitted"] => Ok(IsolationLevel::ReadUncommitted),
            ["read", "committed"] => Ok(IsolationLevel::ReadCommitted),
            ["repeatable", "read"] => Ok(IsolationLevel::RepeatableRead),
            ["serializable"] => Ok(IsolationLevel::Serializable),
            _ => Err(DbError::ConfigError(format!("Unknown isolation level '{}'", s))),
        }
    }
}

/// A driver connection.
///
/// Implementations wrap one physical database session. The engine never
/// shares a connection between two units of work and calls `close` exactly
/// once per acquisition.
#[async_trait]
pub trait Connection: Send {
    /// Prepare a statement handle for `sql`.
    async fn prepare(&mut self, sql: &str) -> Result<Box<dyn StatementHandle>>;

    async fn set_auto_commit(&mut self, enabled: bool) -> Result<()>;

    async fn set_isolation_level(&mut self, level: IsolationLevel) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    async fn set_savepoint(&mut self, name: &str) -> Result<()>;

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()>;

    async fn release_savepoint(&mut self, name: &str) -> Result<()>;

    /// Release the connection back to whoever provided it.
    ///
    /// Synchronous so it can run from `Drop` on cancellation paths.
    fn close(&mut self) -> Result<()>;
}

/// A prepared statement bound to one SQL string.
///
/// Binding and batch bookkeeping are local to the handle; the `execute_*`
/// calls are the only ones that reach the database.
#[async_trait]
pub trait StatementHandle: Send {
    fn sql(&self) -> &str;

    /// Bind `value` at the 1-based `position`.
    fn bind(&mut self, position: usize, value: Value) -> Result<()>;

    fn clear_parameters(&mut self);

    /// Driver-enforced execution timeout; `None` disables it.
    fn set_timeout(&mut self, timeout: Option<Duration>);

    fn set_fetch_size(&mut self, rows: usize);

    /// Queue the currently bound parameters as one batch entry.
    fn add_batch(&mut self) -> Result<()>;

    fn clear_batch(&mut self);

    /// Execute the queued batch, returning one update count per entry.
    ///
    /// Negative counts are driver status codes, not row counts.
    async fn execute_batch(&mut self) -> Result<Vec<i64>>;

    async fn execute_update(&mut self) -> Result<i64>;

    async fn execute_query(&mut self) -> Result<Box<dyn Cursor>>;

    /// Key generated by the last `execute_update`, if the driver produced one.
    async fn generated_key(&mut self) -> Result<Option<Value>>;

    fn close(&mut self) -> Result<()>;
}

/// Forward-only result cursor.
#[async_trait]
pub trait Cursor: Send {
    async fn next(&mut self) -> Result<Option<Row>>;

    fn close(&mut self) -> Result<()>;
}

/// Source of connections, created once at startup and shared by reference.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn Connection>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolation_level_parsing() {
        assert_eq!(
            "read committed".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::ReadCommitted
        );
        assert_eq!(
            "REPEATABLE_READ".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::RepeatableRead
        );
        assert_eq!(
            "read-uncommitted".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::ReadUncommitted
        );
        assert_eq!(
            " Serializable ".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::Serializable
        );
        assert!("snapshot".parse::<IsolationLevel>().is_err());
    }

    #[test]
    fn test_isolation_level_display_round_trips() {
        for level in [
            IsolationLevel::ReadUncommitted,
            IsolationLevel::ReadCommitted,
            IsolationLevel::RepeatableRead,
            IsolationLevel::Serializable,
        ] {
            assert_eq!(level.to_string().parse::<IsolationLevel>().unwrap(), level);
        }
    }

    #[test]
    fn test_default_isolation_level() {
        assert_eq!(IsolationLevel::default(), IsolationLevel::ReadCommitted);
    }
}
