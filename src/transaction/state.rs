// ============================================================================
// Transaction State
// ============================================================================
//
// Lifecycle of one coordinated transaction. Every path ends in `Released`;
// there is no retry state, callers retry around the whole transaction call.
//
// ============================================================================

use std::time::{Duration, Instant};
use tracing::{Level, event};
use uuid::Uuid;

/// Transaction state
///
/// State transitions:
/// ```text
/// Idle ──> Acquired ──> StatementsRunning ──┬──> Committing ──> Committed ────────────┐
///             │                             ├──> RollingBack ──> RolledBack ──────────┤
///             │                             └──> RollingBackToSavepoint               │
///             │                                    └──> PartiallyCommitted ───────────┤
///             └─────────────(setup failed)──────────────────────────────────> Released
/// ```
///
/// A failed commit moves `Committing` to `RollingBack`; a failed savepoint
/// rollback moves `RollingBackToSavepoint` to `RollingBack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxState {
    Idle,
    Acquired,
    StatementsRunning,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
    RollingBackToSavepoint,
    PartiallyCommitted,
    Released,
}

impl TxState {
    /// Check if the connection has been given back
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxState::Released)
    }

    /// Check if the transaction outcome is settled
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            TxState::Committed | TxState::RolledBack | TxState::PartiallyCommitted
        )
    }

    pub fn can_transition_to(&self, next: TxState) -> bool {
        use TxState::*;
        matches!(
            (self, next),
            (Idle, Acquired)
                | (Acquired, StatementsRunning)
                | (Acquired, Released)
                | (StatementsRunning, Committing)
                | (StatementsRunning, RollingBack)
                | (StatementsRunning, RollingBackToSavepoint)
                | (Committing, Committed)
                | (Committing, RollingBack)
                | (RollingBack, RolledBack)
                | (RollingBackToSavepoint, PartiallyCommitted)
                | (RollingBackToSavepoint, RollingBack)
                | (Committed, Released)
                | (RolledBack, Released)
                | (PartiallyCommitted, Released)
        )
    }
}

impl std::fmt::Display for TxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TxState::Idle => write!(f, "IDLE"),
            TxState::Acquired => write!(f, "ACQUIRED"),
            TxState::StatementsRunning => write!(f, "STATEMENTS_RUNNING"),
            TxState::Committing => write!(f, "COMMITTING"),
            TxState::Committed => write!(f, "COMMITTED"),
            TxState::RollingBack => write!(f, "ROLLING_BACK"),
            TxState::RolledBack => write!(f, "ROLLED_BACK"),
            TxState::RollingBackToSavepoint => write!(f, "ROLLING_BACK_TO_SAVEPOINT"),
            TxState::PartiallyCommitted => write!(f, "PARTIALLY_COMMITTED"),
            TxState::Released => write!(f, "RELEASED"),
        }
    }
}

/// Per-call bookkeeping of the coordinator
#[derive(Debug)]
pub(crate) struct Transaction {
    id: Uuid,
    state: TxState,
    history: Vec<TxState>,
    start_time: Instant,
}

impl Transaction {
    pub(crate) fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: TxState::Idle,
            history: vec![TxState::Idle],
            start_time: Instant::now(),
        }
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn state(&self) -> TxState {
        self.state
    }

    pub(crate) fn history(&self) -> &[TxState] {
        &self.history
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub(crate) fn advance(&mut self, next: TxState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid transaction transition {} -> {}",
            self.state,
            next
        );
        event!(Level::DEBUG, tx = %self.id, from = %self.state, to = %next, "transaction state");
        self.state = next;
        self.history.push(next);
    }
}
