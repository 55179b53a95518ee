use super::{Connection, IsolationLevel, StatementHandle};
use crate::core::{DbError, Result, Value};
use crate::statement::ResultSetMapper;
use crate::telemetry::{self, OperationEvent, TelemetryHook};
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// The connection slot shared by every clone of a session
struct Slot {
    connection: Box<dyn Connection>,
    released: bool,
}

impl Slot {
    fn close(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.connection.close()
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.close() {
            warn!("failed to close abandoned connection: {}", err);
        }
    }
}

/// Shared handle to the one connection of a unit of work
///
/// Cloning is cheap; every clone reaches the same connection. Each driver
/// call takes the session lock first, so statements submitted concurrently
/// are dispatched one at a time in FIFO order. Once the owner releases the
/// connection every further call fails with `ConnectionError`.
#[derive(Clone)]
pub struct Session {
    id: Uuid,
    slot: Arc<Mutex<Slot>>,
    telemetry: Option<Arc<dyn TelemetryHook>>,
}

impl Session {
    pub(crate) fn new(
        connection: Box<dyn Connection>,
        telemetry: Option<Arc<dyn TelemetryHook>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            slot: Arc::new(Mutex::new(Slot {
                connection,
                released: false,
            })),
            telemetry,
        }
    }

    /// Unique id of this unit of work, used in logs
    pub fn id(&self) -> Uuid {
        self.id
    }

    async fn lock(&self) -> Result<MutexGuard<'_, Slot>> {
        let slot = self.slot.lock().await;
        if slot.released {
            return Err(DbError::ConnectionError(format!(
                "connection of session {} already released",
                self.id
            )));
        }
        Ok(slot)
    }

    /// Prepare a statement on the session's connection
    pub async fn prepare(&self, sql: &str) -> Result<PreparedStatement> {
        let handle = self.lock().await?.connection.prepare(sql).await?;
        debug!("session {}: prepared '{}'", self.id, sql);
        Ok(PreparedStatement {
            handle,
            session: self.clone(),
            closed: false,
        })
    }

    /// Create a named savepoint that a later rollback can target
    pub async fn set_savepoint(&self, name: &str) -> Result<()> {
        self.lock().await?.connection.set_savepoint(name).await
    }

    pub async fn release_savepoint(&self, name: &str) -> Result<()> {
        self.lock().await?.connection.release_savepoint(name).await
    }

    pub(crate) async fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        self.lock().await?.connection.rollback_to_savepoint(name).await
    }

    pub(crate) async fn set_auto_commit(&self, enabled: bool) -> Result<()> {
        self.lock().await?.connection.set_auto_commit(enabled).await
    }

    pub(crate) async fn set_isolation_level(&self, level: IsolationLevel) -> Result<()> {
        self.lock().await?.connection.set_isolation_level(level).await
    }

    pub(crate) async fn commit(&self) -> Result<()> {
        self.lock().await?.connection.commit().await
    }

    pub(crate) async fn rollback(&self) -> Result<()> {
        self.lock().await?.connection.rollback().await
    }

    /// Close the connection; later calls on any clone fail.
    pub(crate) async fn release(&self) -> Result<()> {
        self.slot.lock().await.close()
    }

    pub(crate) fn observe(&self, event: OperationEvent) {
        telemetry::emit(self.telemetry.as_ref(), event);
    }
}

/// Owner-side guard for an acquired connection
///
/// `release` closes the connection exactly once. If the owning future is
/// dropped first, `Drop` closes it instead.
pub(crate) struct ConnectionLease {
    session: Session,
    released: bool,
}

impl ConnectionLease {
    pub(crate) fn new(
        connection: Box<dyn Connection>,
        telemetry: Option<Arc<dyn TelemetryHook>>,
    ) -> Self {
        Self {
            session: Session::new(connection, telemetry),
            released: false,
        }
    }

    pub(crate) fn session(&self) -> &Session {
        &self.session
    }

    pub(crate) async fn release(mut self) {
        self.released = true;
        if let Err(err) = self.session.release().await {
            warn!("session {}: failed to release connection: {}", self.session.id, err);
        }
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        match self.session.slot.try_lock() {
            Ok(mut slot) => {
                if let Err(err) = slot.close() {
                    warn!("session {}: failed to release connection: {}", self.session.id, err);
                }
            }
            Err(_) => {
                // the last clone of the session closes it instead
                debug!(
                    "session {}: dropped while a statement held the connection; release deferred",
                    self.session.id
                );
            }
        }
    }
}

/// A prepared statement tied to a session
///
/// Parameter binding and batch bookkeeping stay local; execution takes the
/// session lock. The driver handle is closed by `close` or, failing that,
/// on drop.
pub struct PreparedStatement {
    handle: Box<dyn StatementHandle>,
    session: Session,
    closed: bool,
}

impl PreparedStatement {
    pub fn sql(&self) -> &str {
        self.handle.sql()
    }

    /// Direct access to the driver handle, for statement setters
    pub fn handle_mut(&mut self) -> &mut dyn StatementHandle {
        self.handle.as_mut()
    }

    pub fn bind(&mut self, position: usize, value: Value) -> Result<()> {
        self.handle.bind(position, value)
    }

    pub fn clear_parameters(&mut self) {
        self.handle.clear_parameters();
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.handle.set_timeout(timeout);
    }

    pub fn set_fetch_size(&mut self, rows: usize) {
        self.handle.set_fetch_size(rows);
    }

    pub fn add_batch(&mut self) -> Result<()> {
        self.handle.add_batch()
    }

    pub fn clear_batch(&mut self) {
        self.handle.clear_batch();
    }

    pub async fn execute_batch(&mut self) -> Result<Vec<i64>> {
        let _slot = self.session.lock().await?;
        self.handle.execute_batch().await
    }

    pub async fn execute_update(&mut self) -> Result<i64> {
        let _slot = self.session.lock().await?;
        self.handle.execute_update().await
    }

    pub async fn generated_key(&mut self) -> Result<Option<Value>> {
        let _slot = self.session.lock().await?;
        self.handle.generated_key().await
    }

    /// Run the statement as a query and map the cursor with `mapper`.
    ///
    /// The cursor is read and closed while the session lock is held.
    pub async fn query<O>(&mut self, mapper: &ResultSetMapper<O>) -> Result<O> {
        let _slot = self.session.lock().await?;
        let mut cursor = self.handle.execute_query().await?;
        let mapped = mapper.read(cursor.as_mut()).await;
        if let Err(err) = cursor.close() {
            warn!("session {}: failed to close cursor: {}", self.session.id, err);
        }
        mapped
    }

    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.handle.close()
    }

    /// Close, logging a failure instead of returning it.
    pub(crate) fn close_quietly(self) {
        let session = self.session.id;
        let sql = self.sql().to_string();
        if let Err(err) = self.close() {
            warn!("session {}: failed to close statement '{}': {}", session, sql, err);
        }
    }
}

impl Drop for PreparedStatement {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(err) = self.handle.close() {
            warn!("session {}: failed to close statement: {}", self.session.id, err);
        }
    }
}
