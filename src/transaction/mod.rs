// ============================================================================
// Transaction Coordination
// ============================================================================
//
// One connection per transaction. Statements run against a shared Session;
// the coordinator commits on success, rolls back on failure, and answers a
// SavepointRollback with rollback-to-savepoint + commit.
//
// Design Patterns Used:
// - State Pattern: TxState tracks the lifecycle, always ending in Released
// - Sum type for compensation: StatementError::RollbackToSavepoint is matched,
//   never inferred from the kind of error
// - RAII: ConnectionLease releases the connection on every exit path
//
// ============================================================================

pub mod coordinator;
pub mod signal;
pub mod state;

pub use coordinator::TransactionCoordinator;
pub use signal::{PartialOutput, SavepointRollback, StatementError};
pub use state::TxState;
