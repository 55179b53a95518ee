use crate::core::DbError;
use std::any::Any;
use std::fmt;
use thiserror::Error;

/// Type-erased output a unit of work produced before asking for a savepoint
/// rollback.
pub type PartialOutput = Box<dyn Any + Send>;

/// Request to undo only back to a named savepoint and commit the rest
///
/// Raised deliberately by application logic ("this optional sub-step failed,
/// keep what came before"). The coordinator answers it with
/// `rollback_to_savepoint` followed by `commit`, never with a full rollback.
pub struct SavepointRollback {
    savepoint: String,
    partial: PartialOutput,
    cause: Option<DbError>,
}

impl SavepointRollback {
    pub fn new(
        savepoint: impl Into<String>,
        partial: impl Any + Send,
        cause: Option<DbError>,
    ) -> Self {
        Self {
            savepoint: savepoint.into(),
            partial: Box::new(partial),
            cause,
        }
    }

    pub fn savepoint(&self) -> &str {
        &self.savepoint
    }

    pub fn partial(&self) -> &(dyn Any + Send) {
        self.partial.as_ref()
    }

    pub fn cause(&self) -> Option<&DbError> {
        self.cause.as_ref()
    }

    pub fn into_parts(self) -> (String, PartialOutput, Option<DbError>) {
        (self.savepoint, self.partial, self.cause)
    }
}

impl fmt::Debug for SavepointRollback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SavepointRollback")
            .field("savepoint", &self.savepoint)
            .field("cause", &self.cause)
            .finish_non_exhaustive()
    }
}

/// Failure value of a closable statement
///
/// Ordinary failures and savepoint requests travel through the same
/// composition, and the coordinator tells them apart by variant.
#[derive(Error, Debug)]
pub enum StatementError {
    #[error(transparent)]
    Failed(#[from] DbError),

    #[error("rollback to savepoint '{}' requested", .0.savepoint())]
    RollbackToSavepoint(SavepointRollback),
}

impl StatementError {
    /// Shorthand for raising a savepoint rollback.
    pub fn rollback_to(
        savepoint: impl Into<String>,
        partial: impl Any + Send,
        cause: Option<DbError>,
    ) -> Self {
        Self::RollbackToSavepoint(SavepointRollback::new(savepoint, partial, cause))
    }

    pub fn is_savepoint_rollback(&self) -> bool {
        matches!(self, Self::RollbackToSavepoint(_))
    }

    /// The database error behind this failure, if any.
    pub fn db_error(&self) -> Option<&DbError> {
        match self {
            Self::Failed(err) => Some(err),
            Self::RollbackToSavepoint(signal) => signal.cause(),
        }
    }

    /// Collapse into a `DbError` where no transaction can honor a savepoint
    /// request; the request's cause wins when it has one.
    pub fn into_db_error(self) -> DbError {
        match self {
            Self::Failed(err) => err,
            Self::RollbackToSavepoint(signal) => {
                let (savepoint, _, cause) = signal.into_parts();
                cause.unwrap_or_else(|| {
                    DbError::ExecutionError(format!(
                        "rollback to savepoint '{}' requested outside a transaction",
                        savepoint
                    ))
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_parts() {
        let cause = DbError::ExecutionError("audit insert failed".into());
        let signal = SavepointRollback::new("sp1", 42i64, Some(cause.clone()));

        assert_eq!(signal.savepoint(), "sp1");
        assert_eq!(signal.partial().downcast_ref::<i64>(), Some(&42));
        assert_eq!(signal.cause(), Some(&cause));

        let (name, partial, kept) = signal.into_parts();
        assert_eq!(name, "sp1");
        assert_eq!(*partial.downcast::<i64>().unwrap(), 42);
        assert_eq!(kept, Some(cause));
    }

    #[test]
    fn test_statement_error_variants() {
        let failed: StatementError = DbError::ExecutionError("boom".into()).into();
        assert!(!failed.is_savepoint_rollback());
        assert_eq!(failed.to_string(), "Execution error: boom");

        let signal = StatementError::rollback_to("sp2", (), None);
        assert!(signal.is_savepoint_rollback());
        assert!(signal.db_error().is_none());
        assert_eq!(signal.to_string(), "rollback to savepoint 'sp2' requested");
        assert!(matches!(signal.into_db_error(), DbError::ExecutionError(_)));
    }
}
