// ============================================================================
// In-Memory Driver
// ============================================================================
//
// A recording driver that implements the connection traits without a real
// database. Writes are kept as (sql, params) entries: pending while a
// transaction is open, moved to the committed log on commit, truncated on
// rollback or rollback-to-savepoint. Every driver call is journaled so tests
// can assert exactly what the engine asked for.
//
// Failures are scripted up front with the builder methods:
// - `reject_bind(v)`     bind of value `v` fails
// - `reject_execute(v)`  any execute whose rows contain `v` fails
// - `fail_on(op)`        a connection-level operation fails
//
// ============================================================================

use super::{Connection, ConnectionProvider, Cursor, IsolationLevel, StatementHandle};
use crate::core::{DbError, Result, Row, Value};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One journaled driver call
#[derive(Debug, Clone, PartialEq)]
pub enum DriverCall {
    Acquire { connection: u64 },
    SetAutoCommit { connection: u64, enabled: bool },
    SetIsolation { connection: u64, level: IsolationLevel },
    Prepare { sql: String },
    ExecuteBatch { sql: String, entries: usize },
    ExecuteUpdate { sql: String },
    ExecuteQuery { sql: String },
    Commit { connection: u64 },
    Rollback { connection: u64 },
    SetSavepoint { name: String },
    RollbackToSavepoint { name: String },
    ReleaseSavepoint { name: String },
    CloseStatement { sql: String },
    Close { connection: u64 },
}

/// Connection-level operations that can be scripted to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    Acquire,
    SetAutoCommit,
    SetIsolation,
    Prepare,
    Commit,
    Rollback,
    RollbackToSavepoint,
    Close,
}

/// A write recorded by the driver
#[derive(Debug, Clone, PartialEq)]
pub struct Write {
    pub sql: String,
    pub params: Vec<Value>,
}

#[derive(Clone, Default)]
struct Script {
    fail_points: Vec<FailPoint>,
    rejected_binds: Vec<Value>,
    rejected_executes: Vec<Value>,
    update_count: Option<i64>,
    rows: Vec<(String, Vec<Row>)>,
    no_generated_keys: bool,
    execute_delay: Option<Duration>,
}

impl Script {
    fn fails(&self, point: FailPoint) -> bool {
        self.fail_points.contains(&point)
    }
}

#[derive(Default)]
struct DriverState {
    calls: Vec<DriverCall>,
    committed: Vec<Write>,
    next_connection: u64,
    open_connections: i64,
    closed_connections: u64,
    open_statements: i64,
    in_flight: bool,
    overlaps: u64,
    next_key: i64,
}

/// Scriptable in-memory driver; cloning shares the same state
#[derive(Clone, Default)]
pub struct MemoryDriver {
    script: Arc<Script>,
    state: Arc<Mutex<DriverState>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn script_mut(&mut self) -> &mut Script {
        Arc::make_mut(&mut self.script)
    }

    /// Make `point` fail with an error
    pub fn fail_on(mut self, point: FailPoint) -> Self {
        self.script_mut().fail_points.push(point);
        self
    }

    /// Binding `value` fails
    pub fn reject_bind(mut self, value: impl Into<Value>) -> Self {
        self.script_mut().rejected_binds.push(value.into());
        self
    }

    /// Executing any entry that carries `value` fails
    pub fn reject_execute(mut self, value: impl Into<Value>) -> Self {
        self.script_mut().rejected_executes.push(value.into());
        self
    }

    /// Update count reported per statement (default 1; negative values mimic
    /// driver status codes)
    pub fn update_count(mut self, count: i64) -> Self {
        self.script_mut().update_count = Some(count);
        self
    }

    /// Rows returned by queries whose SQL contains `sql_fragment`
    pub fn with_rows(mut self, sql_fragment: &str, rows: Vec<Row>) -> Self {
        self.script_mut().rows.push((sql_fragment.to_string(), rows));
        self
    }

    /// Inserts produce no generated key
    pub fn without_generated_keys(mut self) -> Self {
        self.script_mut().no_generated_keys = true;
        self
    }

    /// Simulated execution latency; a shorter statement timeout turns it
    /// into `DbError::Timeout`
    pub fn execute_delay(mut self, delay: Duration) -> Self {
        self.script_mut().execute_delay = Some(delay);
        self
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut DriverState) -> T) -> Result<T> {
        let mut state = self.state.lock()?;
        Ok(f(&mut state))
    }

    fn record(&self, call: DriverCall) -> Result<()> {
        self.with_state(|state| state.calls.push(call))
    }

    fn check(&self, point: FailPoint) -> Result<()> {
        if !self.script.fails(point) {
            return Ok(());
        }
        let message = format!("scripted failure: {:?}", point);
        match point {
            FailPoint::Acquire | FailPoint::Close => Err(DbError::ConnectionError(message)),
            _ => Err(DbError::ExecutionError(message)),
        }
    }

    /// Marks a driver round-trip in progress and yields so that an
    /// overlapping caller would be observed.
    async fn round_trip(&self, timeout: Option<Duration>) -> Result<()> {
        self.with_state(|state| {
            if state.in_flight {
                state.overlaps += 1;
            }
            state.in_flight = true;
        })?;

        let outcome = match (self.script.execute_delay, timeout) {
            (Some(delay), Some(limit)) if delay > limit => {
                tokio::time::sleep(limit).await;
                Err(DbError::Timeout(limit))
            }
            (Some(delay), _) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            (None, _) => {
                tokio::task::yield_now().await;
                Ok(())
            }
        };

        self.with_state(|state| state.in_flight = false)?;
        outcome
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.with_state(|state| state.calls.clone()).unwrap_or_default()
    }

    pub fn count(&self, pred: impl Fn(&DriverCall) -> bool) -> usize {
        self.calls().iter().filter(|call| pred(call)).count()
    }

    /// Writes made durable by commit or auto-commit
    pub fn committed(&self) -> Vec<Write> {
        self.with_state(|state| state.committed.clone()).unwrap_or_default()
    }

    pub fn acquired_connections(&self) -> u64 {
        self.with_state(|state| state.next_connection).unwrap_or_default()
    }

    pub fn closed_connections(&self) -> u64 {
        self.with_state(|state| state.closed_connections).unwrap_or_default()
    }

    pub fn open_connections(&self) -> i64 {
        self.with_state(|state| state.open_connections).unwrap_or_default()
    }

    pub fn open_statements(&self) -> i64 {
        self.with_state(|state| state.open_statements).unwrap_or_default()
    }

    /// Number of driver calls that started while another was in flight
    pub fn overlaps(&self) -> u64 {
        self.with_state(|state| state.overlaps).unwrap_or_default()
    }
}

#[async_trait]
impl ConnectionProvider for MemoryDriver {
    async fn acquire(&self) -> Result<Box<dyn Connection>> {
        self.check(FailPoint::Acquire)?;
        let id = self.with_state(|state| {
            state.next_connection += 1;
            state.open_connections += 1;
            state.next_connection
        })?;
        self.record(DriverCall::Acquire { connection: id })?;

        Ok(Box::new(MemoryConnection {
            id,
            driver: self.clone(),
            tx: Arc::new(Mutex::new(TxLog::default())),
            closed: false,
        }))
    }
}

/// Uncommitted writes and savepoint marks of one connection
struct TxLog {
    auto_commit: bool,
    pending: Vec<Write>,
    savepoints: Vec<(String, usize)>,
}

impl Default for TxLog {
    fn default() -> Self {
        Self {
            auto_commit: true,
            pending: Vec::new(),
            savepoints: Vec::new(),
        }
    }
}

pub struct MemoryConnection {
    id: u64,
    driver: MemoryDriver,
    tx: Arc<Mutex<TxLog>>,
    closed: bool,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(DbError::ConnectionError("Connection is closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn prepare(&mut self, sql: &str) -> Result<Box<dyn StatementHandle>> {
        self.ensure_open()?;
        self.driver.record(DriverCall::Prepare { sql: sql.to_string() })?;
        self.driver.check(FailPoint::Prepare)?;
        self.driver.with_state(|state| state.open_statements += 1)?;

        Ok(Box::new(MemoryStatement {
            sql: sql.to_string(),
            driver: self.driver.clone(),
            tx: Arc::clone(&self.tx),
            params: Vec::new(),
            batch: Vec::new(),
            timeout: None,
            fetch_size: 0,
            last_key: None,
            closed: false,
        }))
    }

    async fn set_auto_commit(&mut self, enabled: bool) -> Result<()> {
        self.ensure_open()?;
        self.driver.record(DriverCall::SetAutoCommit {
            connection: self.id,
            enabled,
        })?;
        self.driver.check(FailPoint::SetAutoCommit)?;
        self.tx.lock()?.auto_commit = enabled;
        Ok(())
    }

    async fn set_isolation_level(&mut self, level: IsolationLevel) -> Result<()> {
        self.ensure_open()?;
        self.driver.record(DriverCall::SetIsolation {
            connection: self.id,
            level,
        })?;
        self.driver.check(FailPoint::SetIsolation)
    }

    async fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.driver.record(DriverCall::Commit { connection: self.id })?;
        self.driver.check(FailPoint::Commit)?;
        let pending = {
            let mut tx = self.tx.lock()?;
            tx.savepoints.clear();
            std::mem::take(&mut tx.pending)
        };
        self.driver.with_state(|state| state.committed.extend(pending))
    }

    async fn rollback(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.driver.record(DriverCall::Rollback { connection: self.id })?;
        self.driver.check(FailPoint::Rollback)?;
        let mut tx = self.tx.lock()?;
        tx.pending.clear();
        tx.savepoints.clear();
        Ok(())
    }

    async fn set_savepoint(&mut self, name: &str) -> Result<()> {
        self.ensure_open()?;
        self.driver.record(DriverCall::SetSavepoint { name: name.to_string() })?;
        let mut tx = self.tx.lock()?;
        if tx.auto_commit {
            return Err(DbError::ExecutionError(
                "Savepoints require manual-commit mode".into(),
            ));
        }
        let mark = tx.pending.len();
        tx.savepoints.push((name.to_string(), mark));
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        self.ensure_open()?;
        self.driver.record(DriverCall::RollbackToSavepoint { name: name.to_string() })?;
        self.driver.check(FailPoint::RollbackToSavepoint)?;
        let mut tx = self.tx.lock()?;
        let index = tx
            .savepoints
            .iter()
            .rposition(|(sp, _)| sp == name)
            .ok_or_else(|| DbError::ExecutionError(format!("Savepoint '{}' not found", name)))?;
        let mark = tx.savepoints[index].1;
        tx.pending.truncate(mark);
        // the savepoint itself survives, later ones do not
        tx.savepoints.truncate(index + 1);
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<()> {
        self.ensure_open()?;
        self.driver.record(DriverCall::ReleaseSavepoint { name: name.to_string() })?;
        let mut tx = self.tx.lock()?;
        let index = tx
            .savepoints
            .iter()
            .rposition(|(sp, _)| sp == name)
            .ok_or_else(|| DbError::ExecutionError(format!("Savepoint '{}' not found", name)))?;
        tx.savepoints.truncate(index);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(DbError::ConnectionError("Connection already closed".into()));
        }
        self.closed = true;
        self.driver.record(DriverCall::Close { connection: self.id })?;
        self.driver.with_state(|state| {
            state.open_connections -= 1;
            state.closed_connections += 1;
        })?;
        self.driver.check(FailPoint::Close)
    }
}

struct MemoryStatement {
    sql: String,
    driver: MemoryDriver,
    tx: Arc<Mutex<TxLog>>,
    params: Vec<Value>,
    batch: Vec<Vec<Value>>,
    timeout: Option<Duration>,
    fetch_size: usize,
    last_key: Option<Value>,
    closed: bool,
}

impl MemoryStatement {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(DbError::ExecutionError("Statement is closed".into()));
        }
        Ok(())
    }

    fn check_rows(&self, rows: &[Vec<Value>]) -> Result<()> {
        for row in rows {
            if let Some(bad) = row
                .iter()
                .find(|value| self.driver.script.rejected_executes.contains(value))
            {
                return Err(DbError::ExecutionError(format!(
                    "'{}' rejected value {}",
                    self.sql, bad
                )));
            }
        }
        Ok(())
    }

    fn apply_writes(&self, rows: Vec<Vec<Value>>) -> Result<()> {
        let writes = rows.into_iter().map(|params| Write {
            sql: self.sql.clone(),
            params,
        });
        let mut tx = self.tx.lock()?;
        if tx.auto_commit {
            drop(tx);
            let writes: Vec<Write> = writes.collect();
            return self.driver.with_state(|state| state.committed.extend(writes));
        }
        tx.pending.extend(writes);
        Ok(())
    }

    fn update_count(&self) -> i64 {
        self.driver.script.update_count.unwrap_or(1)
    }
}

#[async_trait]
impl StatementHandle for MemoryStatement {
    fn sql(&self) -> &str {
        &self.sql
    }

    fn bind(&mut self, position: usize, value: Value) -> Result<()> {
        self.ensure_open()?;
        if position == 0 {
            return Err(DbError::bind(position, "positions start at 1"));
        }
        if self.driver.script.rejected_binds.contains(&value) {
            return Err(DbError::bind(position, format!("cannot bind {}", value)));
        }
        if self.params.len() < position {
            self.params.resize(position, Value::Null);
        }
        self.params[position - 1] = value;
        Ok(())
    }

    fn clear_parameters(&mut self) {
        self.params.clear();
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    fn set_fetch_size(&mut self, rows: usize) {
        self.fetch_size = rows;
    }

    fn add_batch(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.batch.push(std::mem::take(&mut self.params));
        Ok(())
    }

    fn clear_batch(&mut self) {
        self.batch.clear();
    }

    async fn execute_batch(&mut self) -> Result<Vec<i64>> {
        self.ensure_open()?;
        let rows = std::mem::take(&mut self.batch);
        self.driver.record(DriverCall::ExecuteBatch {
            sql: self.sql.clone(),
            entries: rows.len(),
        })?;
        self.driver.round_trip(self.timeout).await?;
        self.check_rows(&rows)?;

        let counts = vec![self.update_count(); rows.len()];
        self.apply_writes(rows)?;
        Ok(counts)
    }

    async fn execute_update(&mut self) -> Result<i64> {
        self.ensure_open()?;
        self.driver.record(DriverCall::ExecuteUpdate { sql: self.sql.clone() })?;
        self.driver.round_trip(self.timeout).await?;
        let params = std::mem::take(&mut self.params);
        self.check_rows(std::slice::from_ref(&params))?;

        self.last_key = if self.driver.script.no_generated_keys {
            None
        } else {
            let key = self.driver.with_state(|state| {
                state.next_key += 1;
                state.next_key
            })?;
            Some(Value::Integer(key))
        };
        self.apply_writes(vec![params])?;
        Ok(self.update_count())
    }

    async fn execute_query(&mut self) -> Result<Box<dyn Cursor>> {
        self.ensure_open()?;
        self.driver.record(DriverCall::ExecuteQuery { sql: self.sql.clone() })?;
        self.driver.round_trip(self.timeout).await?;
        let params = std::mem::take(&mut self.params);
        self.check_rows(std::slice::from_ref(&params))?;

        let rows = self
            .driver
            .script
            .rows
            .iter()
            .find(|(fragment, _)| self.sql.contains(fragment.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default();

        Ok(Box::new(MemoryCursor {
            rows: rows.into(),
            closed: false,
        }))
    }

    async fn generated_key(&mut self) -> Result<Option<Value>> {
        self.ensure_open()?;
        Ok(self.last_key.take())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.driver.record(DriverCall::CloseStatement { sql: self.sql.clone() })?;
        self.driver.with_state(|state| state.open_statements -= 1)
    }
}

struct MemoryCursor {
    rows: VecDeque<Row>,
    closed: bool,
}

#[async_trait]
impl Cursor for MemoryCursor {
    async fn next(&mut self) -> Result<Option<Row>> {
        if self.closed {
            return Err(DbError::ExecutionError("Cursor is closed".into()));
        }
        Ok(self.rows.pop_front())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_commit_moves_pending_writes() {
        let driver = MemoryDriver::new();
        let mut conn = driver.acquire().await.unwrap();
        conn.set_auto_commit(false).await.unwrap();

        let mut stmt = conn.prepare("INSERT INTO t VALUES (?)").await.unwrap();
        stmt.bind(1, Value::Integer(1)).unwrap();
        stmt.execute_update().await.unwrap();
        assert!(driver.committed().is_empty());

        conn.commit().await.unwrap();
        assert_eq!(driver.committed().len(), 1);
        assert_eq!(driver.committed()[0].params, vec![Value::Integer(1)]);
    }

    #[tokio::test]
    async fn test_rollback_to_savepoint_truncates() {
        let driver = MemoryDriver::new();
        let mut conn = driver.acquire().await.unwrap();
        conn.set_auto_commit(false).await.unwrap();
        let mut stmt = conn.prepare("INSERT INTO t VALUES (?)").await.unwrap();

        stmt.bind(1, Value::Integer(1)).unwrap();
        stmt.execute_update().await.unwrap();
        conn.set_savepoint("sp1").await.unwrap();
        stmt.bind(1, Value::Integer(2)).unwrap();
        stmt.execute_update().await.unwrap();

        conn.rollback_to_savepoint("sp1").await.unwrap();
        conn.commit().await.unwrap();

        let committed = driver.committed();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].params, vec![Value::Integer(1)]);
    }

    #[tokio::test]
    async fn test_auto_commit_writes_are_durable() {
        let driver = MemoryDriver::new();
        let mut conn = driver.acquire().await.unwrap();
        let mut stmt = conn.prepare("DELETE FROM t").await.unwrap();
        stmt.execute_update().await.unwrap();
        assert_eq!(driver.committed().len(), 1);
    }

    #[tokio::test]
    async fn test_scripted_bind_rejection() {
        let driver = MemoryDriver::new().reject_bind("poison");
        let mut conn = driver.acquire().await.unwrap();
        let mut stmt = conn.prepare("INSERT INTO t VALUES (?)").await.unwrap();

        let err = stmt.bind(1, Value::from("poison")).unwrap_err();
        assert_eq!(err, DbError::bind(1, "cannot bind poison"));
    }

    #[tokio::test]
    async fn test_timeout_shorter_than_delay() {
        let driver = MemoryDriver::new().execute_delay(Duration::from_millis(50));
        let mut conn = driver.acquire().await.unwrap();
        let mut stmt = conn.prepare("UPDATE t SET a = 1").await.unwrap();
        stmt.set_timeout(Some(Duration::from_millis(5)));

        let err = stmt.execute_update().await.unwrap_err();
        assert_eq!(err, DbError::Timeout(Duration::from_millis(5)));
    }

    #[tokio::test]
    async fn test_double_close_is_an_error() {
        let driver = MemoryDriver::new();
        let mut conn = driver.acquire().await.unwrap();
        conn.close().unwrap();
        assert!(conn.close().is_err());
        assert_eq!(driver.closed_connections(), 1);
        assert_eq!(driver.open_connections(), 0);
    }
}
