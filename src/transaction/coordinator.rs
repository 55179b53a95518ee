use super::signal::{SavepointRollback, StatementError};
use super::state::{Transaction, TxState};
use crate::connection::session::ConnectionLease;
use crate::connection::{ConnectionProvider, Session, TransactionOptions};
use crate::core::{DbError, Result};
use crate::result::TxResult;
use crate::statement::{ClosableStatement, StatementResult};
use crate::telemetry::{self, OperationEvent, OperationKind, Outcome, TelemetryHook};
use std::sync::Arc;
use tracing::{Instrument, Level, event, info_span};

/// Runs closable statements inside one transaction on one connection
///
/// ```text
/// acquire -> auto-commit off -> isolation -> statements
///     Ok                  -> commit                          -> Success
///     Failed(e)           -> rollback                        -> Err(e)
///     RollbackToSavepoint -> rollback_to(savepoint) + commit -> PartialSuccess
/// release (always, exactly once)
/// ```
///
/// A failing rollback never replaces the failure that caused it; it is
/// logged and the original error is returned.
#[derive(Clone)]
pub struct TransactionCoordinator {
    provider: Arc<dyn ConnectionProvider>,
    telemetry: Option<Arc<dyn TelemetryHook>>,
}

impl TransactionCoordinator {
    pub fn new(
        provider: Arc<dyn ConnectionProvider>,
        telemetry: Option<Arc<dyn TelemetryHook>>,
    ) -> Self {
        Self {
            provider,
            telemetry,
        }
    }

    /// Run `statement` with `params` as one transaction.
    pub async fn execute<P, O>(
        &self,
        options: &TransactionOptions,
        statement: &ClosableStatement<P, O>,
        params: P,
    ) -> Result<TxResult<O>>
    where
        P: Send + 'static,
        O: Send + 'static,
    {
        let mut tx = Transaction::new();
        let span = info_span!(
            "sqlweave.transaction",
            tx = %tx.id(),
            isolation = %options.isolation,
            label = options.label.as_deref().unwrap_or("")
        );

        let result = self
            .run(&mut tx, options, statement, params)
            .instrument(span)
            .await;

        let mut summary = match &result {
            Ok(TxResult::Success { .. }) => {
                OperationEvent::new(OperationKind::Transaction, Outcome::Success, tx.elapsed())
            }
            Ok(TxResult::PartialSuccess { cause, .. }) => {
                let event =
                    OperationEvent::new(OperationKind::Transaction, Outcome::Partial, tx.elapsed());
                match cause {
                    Some(err) => event.error(err),
                    None => event,
                }
            }
            Err(err) => {
                OperationEvent::new(OperationKind::Transaction, Outcome::Failure, tx.elapsed())
                    .error(err)
            }
        };
        summary = summary.label(options.label.as_deref());
        telemetry::emit(self.telemetry.as_ref(), summary);

        result
    }

    async fn run<P, O>(
        &self,
        tx: &mut Transaction,
        options: &TransactionOptions,
        statement: &ClosableStatement<P, O>,
        params: P,
    ) -> Result<TxResult<O>>
    where
        P: Send + 'static,
        O: Send + 'static,
    {
        let connection = match self.provider.acquire().await {
            Ok(connection) => connection,
            Err(err) => {
                event!(Level::ERROR, error = %err, "transaction acquire failed");
                return Err(err);
            }
        };
        tx.advance(TxState::Acquired);

        let lease = ConnectionLease::new(connection, self.telemetry.clone());
        let session = lease.session().clone();

        if let Err(err) = setup(&session, options).await {
            event!(Level::ERROR, error = %err, "transaction setup failed");
            lease.release().await;
            tx.advance(TxState::Released);
            return Err(err);
        }

        tx.advance(TxState::StatementsRunning);
        let result = match statement.apply(params, session.clone()).await {
            Ok(output) => commit(tx, &session, output).await,
            Err(StatementError::Failed(err)) => {
                event!(Level::WARN, error = %err, "transaction statement failed");
                rollback(tx, &session, &err).await;
                Err(err)
            }
            Err(StatementError::RollbackToSavepoint(signal)) => {
                compensate(tx, &session, signal).await
            }
        };

        lease.release().await;
        tx.advance(TxState::Released);
        event!(Level::DEBUG, state = %tx.state(), path = ?tx.history(), "transaction released");
        result
    }

    /// Run `statement` on its own connection in auto-commit mode.
    ///
    /// A savepoint request cannot be honored here and comes back unchanged
    /// as the statement's failure.
    pub async fn run_standalone<P, O>(
        &self,
        statement: &ClosableStatement<P, O>,
        params: P,
    ) -> StatementResult<O>
    where
        P: Send + 'static,
        O: Send + 'static,
    {
        let lease = ConnectionLease::new(self.provider.acquire().await?, self.telemetry.clone());
        let session = lease.session().clone();

        let result = match session.set_auto_commit(true).await {
            Ok(()) => statement.apply(params, session).await,
            Err(err) => Err(err.into()),
        };

        lease.release().await;
        result
    }
}

async fn setup(session: &Session, options: &TransactionOptions) -> Result<()> {
    session.set_auto_commit(false).await?;
    session.set_isolation_level(options.isolation).await
}

async fn commit<O>(tx: &mut Transaction, session: &Session, output: O) -> Result<TxResult<O>> {
    tx.advance(TxState::Committing);
    match session.commit().await {
        Ok(()) => {
            tx.advance(TxState::Committed);
            event!(Level::DEBUG, "transaction committed");
            Ok(TxResult::Success { output })
        }
        Err(err) => {
            event!(Level::ERROR, error = %err, "transaction commit failed");
            rollback(tx, session, &err).await;
            Err(err)
        }
    }
}

async fn rollback(tx: &mut Transaction, session: &Session, cause: &DbError) {
    tx.advance(TxState::RollingBack);
    if let Err(err) = session.rollback().await {
        event!(
            Level::ERROR,
            error = %err,
            cause = %cause,
            "transaction rollback failed"
        );
    }
    tx.advance(TxState::RolledBack);
}

async fn compensate<O>(
    tx: &mut Transaction,
    session: &Session,
    signal: SavepointRollback,
) -> Result<TxResult<O>> {
    tx.advance(TxState::RollingBackToSavepoint);

    let savepoint = signal.savepoint().to_string();
    let attempt = async {
        session.rollback_to_savepoint(&savepoint).await?;
        session.commit().await
    }
    .await;

    match attempt {
        Ok(()) => {
            tx.advance(TxState::PartiallyCommitted);
            event!(
                Level::INFO,
                savepoint = %savepoint,
                "transaction committed after rollback to savepoint"
            );
            Ok(TxResult::from_signal(signal))
        }
        Err(err) => {
            event!(
                Level::ERROR,
                error = %err,
                savepoint = %savepoint,
                "rollback to savepoint failed"
            );
            let (_, _, cause) = signal.into_parts();
            let surfaced = cause.unwrap_or(err);
            rollback(tx, session, &surfaced).await;
            Err(surfaced)
        }
    }
}
