// ============================================================================
// sqlweave Library
// ============================================================================

pub mod core;
pub mod connection;
pub mod statement;
pub mod batch;
pub mod result;
pub mod transaction;
pub mod telemetry;
pub mod prelude;

// Re-export main types for convenience
pub use core::{DbError, Result, Row, Value};
pub use result::{BatchResult, TxResult};

pub use connection::{
    Connection, ConnectionProvider, Cursor, IsolationLevel, PreparedStatement, Session,
    StatementConfig, StatementHandle, TransactionOptions,
};
pub use statement::{
    BatchTemplate, ClosableStatement, InsertTemplate, ParamsSetter, QueryTemplate,
    ResultSetMapper, StatementResult, StatementSetter, UpdateTemplate,
};
pub use telemetry::{LogTelemetry, OperationEvent, TelemetryHook};
pub use transaction::{SavepointRollback, StatementError, TransactionCoordinator, TxState};

use std::sync::Arc;

// ============================================================================
// High-level Database API
// ============================================================================

/// Entry point holding the connection provider
///
/// Create one at startup and share it; cloning is cheap and every clone
/// uses the same provider. Each call acquires its own connection and
/// releases it before returning.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use sqlweave::connection::memory::MemoryDriver;
/// use sqlweave::statement::{StatementSetter, UpdateTemplate, params_setter};
/// use sqlweave::{ClosableStatement, Database};
///
/// # tokio_test::block_on(async {
/// let db = Database::new(Arc::new(MemoryDriver::new()));
///
/// let rename = UpdateTemplate::new(
///     "UPDATE users SET name = ? WHERE id = ?",
///     params_setter(|(name, id): &(String, i64)| {
///         StatementSetter::value(name.clone()).then(StatementSetter::value(*id))
///     }),
/// )
/// .unwrap();
/// let rename = ClosableStatement::update(rename);
///
/// let result = db.transaction(&rename, ("alice".to_string(), 1)).await.unwrap();
/// assert_eq!(result.output(), Some(1));
/// # });
/// ```
#[derive(Clone)]
pub struct Database {
    provider: Arc<dyn ConnectionProvider>,
    telemetry: Option<Arc<dyn TelemetryHook>>,
    options: TransactionOptions,
}

impl Database {
    pub fn new(provider: Arc<dyn ConnectionProvider>) -> Self {
        Self {
            provider,
            telemetry: None,
            options: TransactionOptions::default(),
        }
    }

    /// Report every unit of work to `hook`
    pub fn with_telemetry(mut self, hook: Arc<dyn TelemetryHook>) -> Self {
        self.telemetry = Some(hook);
        self
    }

    /// Options used by [`transaction`](Self::transaction) and friends
    pub fn with_options(mut self, options: TransactionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &TransactionOptions {
        &self.options
    }

    fn coordinator(&self) -> TransactionCoordinator {
        TransactionCoordinator::new(Arc::clone(&self.provider), self.telemetry.clone())
    }

    /// Run one statement outside a transaction (auto-commit).
    pub async fn run<P, O>(&self, statement: &ClosableStatement<P, O>, params: P) -> StatementResult<O>
    where
        P: Send + 'static,
        O: Send + 'static,
    {
        self.coordinator().run_standalone(statement, params).await
    }

    /// Run `statement` as one transaction with the default options.
    pub async fn transaction<P, O>(
        &self,
        statement: &ClosableStatement<P, O>,
        params: P,
    ) -> Result<TxResult<O>>
    where
        P: Send + 'static,
        O: Send + 'static,
    {
        self.coordinator().execute(&self.options, statement, params).await
    }

    pub async fn transaction_with<P, O>(
        &self,
        options: &TransactionOptions,
        statement: &ClosableStatement<P, O>,
        params: P,
    ) -> Result<TxResult<O>>
    where
        P: Send + 'static,
        O: Send + 'static,
    {
        self.coordinator().execute(options, statement, params).await
    }

    /// Run the statements one after another in one transaction.
    pub async fn transaction_sequence<O>(
        &self,
        statements: Vec<ClosableStatement<(), O>>,
    ) -> Result<TxResult<Vec<O>>>
    where
        O: Send + 'static,
    {
        let unit = ClosableStatement::sequence(statements);
        self.transaction(&unit, ()).await
    }

    /// Submit the statements concurrently in one transaction.
    ///
    /// Driver calls are still serialized on the transaction's connection;
    /// outputs come back in submission order.
    pub async fn transaction_parallel<O>(
        &self,
        statements: Vec<ClosableStatement<(), O>>,
    ) -> Result<TxResult<Vec<O>>>
    where
        O: Send + 'static,
    {
        let unit = ClosableStatement::parallel(statements);
        self.transaction(&unit, ()).await
    }

    /// Run `template` over `params` in auto-commit mode.
    ///
    /// Only a failure to acquire the connection is an `Err`; everything that
    /// happens during the run is reported in the `BatchResult`.
    pub async fn batch<P>(&self, template: BatchTemplate<P>, params: Vec<P>) -> Result<BatchResult>
    where
        P: Send + Sync + 'static,
    {
        let statement = ClosableStatement::batch(template);
        self.run(&statement, params)
            .await
            .map_err(StatementError::into_db_error)
    }
}
