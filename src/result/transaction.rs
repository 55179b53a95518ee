use crate::core::DbError;
use crate::transaction::{PartialOutput, SavepointRollback};
use std::any::Any;
use std::fmt;

/// Outcome of a transaction that did not fail outright
pub enum TxResult<O> {
    /// The transaction committed normally.
    Success { output: O },

    /// The unit of work asked to roll back to `savepoint`; the coordinator did
    /// so and committed what remained. `cause` is the error that triggered
    /// the request, if the unit reported one.
    ///
    /// The fields are the parts of the [`SavepointRollback`] request, so
    /// nothing it carried is lost; `TxResult::from_signal` unpacks it.
    PartialSuccess {
        savepoint: String,
        partial: PartialOutput,
        cause: Option<DbError>,
    },
}

impl<O> TxResult<O> {
    pub(crate) fn from_signal(signal: SavepointRollback) -> Self {
        let (savepoint, partial, cause) = signal.into_parts();
        TxResult::PartialSuccess {
            savepoint,
            partial,
            cause,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TxResult::Success { .. })
    }

    pub fn is_partial(&self) -> bool {
        matches!(self, TxResult::PartialSuccess { .. })
    }

    /// The committed output, if the whole unit of work succeeded.
    pub fn output(self) -> Option<O> {
        match self {
            TxResult::Success { output } => Some(output),
            TxResult::PartialSuccess { .. } => None,
        }
    }

    /// Savepoint the transaction was rolled back to, if any.
    pub fn savepoint(&self) -> Option<&str> {
        match self {
            TxResult::Success { .. } => None,
            TxResult::PartialSuccess { savepoint, .. } => Some(savepoint),
        }
    }

    /// Downcast the partial output of a savepoint rollback.
    pub fn partial_as<T: Any>(&self) -> Option<&T> {
        match self {
            TxResult::Success { .. } => None,
            TxResult::PartialSuccess { partial, .. } => partial.downcast_ref::<T>(),
        }
    }

    pub fn cause(&self) -> Option<&DbError> {
        match self {
            TxResult::Success { .. } => None,
            TxResult::PartialSuccess { cause, .. } => cause.as_ref(),
        }
    }
}

impl<O: fmt::Debug> fmt::Debug for TxResult<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxResult::Success { output } => {
                f.debug_struct("Success").field("output", output).finish()
            }
            TxResult::PartialSuccess {
                savepoint, cause, ..
            } => f
                .debug_struct("PartialSuccess")
                .field("savepoint", savepoint)
                .field("cause", cause)
                .finish_non_exhaustive(),
        }
    }
}
