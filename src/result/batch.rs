use crate::core::DbError;
use std::fmt;

/// Outcome of a batch run
///
/// `rows_affected` only ever sums non-negative update counts; driver status
/// codes such as `-2` ("success, count unknown") are ignored.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchResult {
    /// Every batch executed.
    Success { rows_affected: u64 },

    /// Continue-on-error was enabled and at least one batch failed. Rows of a
    /// failed batch are dropped, not retried individually.
    PartialSuccess {
        total_stms: usize,
        batch_size: usize,
        executed_batches: usize,
        rows_affected: u64,
        errors: Vec<DbError>,
    },

    /// Continue-on-error was disabled and a batch failed. Counts cover only
    /// the batches executed before the failing one.
    Failure {
        total_stms: usize,
        batch_size: usize,
        executed_batches: usize,
        rows_affected: u64,
        error: DbError,
    },
}

impl BatchResult {
    pub fn rows_affected(&self) -> u64 {
        match self {
            BatchResult::Success { rows_affected }
            | BatchResult::PartialSuccess { rows_affected, .. }
            | BatchResult::Failure { rows_affected, .. } => *rows_affected,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, BatchResult::Success { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, BatchResult::Failure { .. })
    }

    /// Errors recorded during the run, in the order they happened.
    pub fn errors(&self) -> Vec<&DbError> {
        match self {
            BatchResult::Success { .. } => Vec::new(),
            BatchResult::PartialSuccess { errors, .. } => errors.iter().collect(),
            BatchResult::Failure { error, .. } => vec![error],
        }
    }

    /// Turn an aborted run into its error, keeping partial runs as values.
    ///
    /// Useful inside a transaction, where a `Failure` should roll everything
    /// back rather than commit the batches that did run.
    pub fn into_result(self) -> Result<BatchResult, DbError> {
        match self {
            BatchResult::Failure { error, .. } => Err(error),
            other => Ok(other),
        }
    }
}

impl fmt::Display for BatchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchResult::Success { rows_affected } => {
                write!(f, "batch succeeded: {} row(s) affected", rows_affected)
            }
            BatchResult::PartialSuccess {
                total_stms,
                executed_batches,
                rows_affected,
                errors,
                ..
            } => write!(
                f,
                "batch partially succeeded: {} batch(es) executed for {} statement(s), {} row(s) affected, {} error(s)",
                executed_batches,
                total_stms,
                rows_affected,
                errors.len()
            ),
            BatchResult::Failure {
                executed_batches,
                rows_affected,
                error,
                ..
            } => write!(
                f,
                "batch failed after {} batch(es), {} row(s) affected: {}",
                executed_batches, rows_affected, error
            ),
        }
    }
}
