use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DbError {
    #[error("Binding error at parameter {position}: {message}")]
    BindError { position: usize, message: String },

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Statement timed out after {0:?}")]
    Timeout(Duration),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("No generated key returned by: {0}")]
    MissingGeneratedKey(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Mapping error: {0}")]
    MappingError(String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),
}

impl DbError {
    pub fn bind(position: usize, message: impl Into<String>) -> Self {
        Self::BindError {
            position,
            message: message.into(),
        }
    }

    /// True for errors raised before any database call is made.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::ConfigError(_))
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::ConnectionError(err.to_string())
    }
}

impl From<tokio::task::JoinError> for DbError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::ExecutionError(format!("statement task aborted: {}", err))
    }
}
