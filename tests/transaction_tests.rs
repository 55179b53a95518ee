/// Transaction tests
///
/// Tests for the coordinator: commit, full rollback, rollback to savepoint,
/// connection release and parallel dispatch
/// Run with: cargo test --test transaction_tests

use sqlweave::connection::memory::{DriverCall, FailPoint, MemoryDriver};
use sqlweave::prelude::*;
use sqlweave::telemetry::{OperationEvent, OperationKind, Outcome, TelemetryHook};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn insert() -> ClosableStatement<i64, u64> {
    let template = UpdateTemplate::new(
        "INSERT INTO accounts (id) VALUES (?)",
        params_setter(|id: &i64| StatementSetter::value(*id)),
    )
    .unwrap();
    ClosableStatement::update(template)
}

fn commits(driver: &MemoryDriver) -> usize {
    driver.count(|c| matches!(c, DriverCall::Commit { .. }))
}

fn rollbacks(driver: &MemoryDriver) -> usize {
    driver.count(|c| matches!(c, DriverCall::Rollback { .. }))
}

fn committed_ids(driver: &MemoryDriver) -> Vec<Value> {
    driver
        .committed()
        .into_iter()
        .flat_map(|write| write.params)
        .collect()
}

#[tokio::test]
async fn test_commit_on_success() {
    let driver = MemoryDriver::new();
    let db = Database::new(Arc::new(driver.clone()));

    let unit = insert().map(|_| 2i64).then(insert());
    let result = db.transaction(&unit, 1).await.unwrap();

    assert!(result.is_success());
    assert_eq!(commits(&driver), 1);
    assert_eq!(rollbacks(&driver), 0);
    assert_eq!(committed_ids(&driver), vec![Value::Integer(1), Value::Integer(2)]);
    // one connection for the whole chain
    assert_eq!(driver.acquired_connections(), 1);
    assert_eq!(driver.closed_connections(), 1);
}

#[tokio::test]
async fn test_last_statement_failure_rolls_back_everything() {
    let driver = MemoryDriver::new().reject_execute(3i64);
    let db = Database::new(Arc::new(driver.clone()));

    let unit = ClosableStatement::sequence(vec![
        insert().bind(1),
        insert().bind(2),
        insert().bind(3),
    ]);
    let err = db.transaction(&unit, ()).await.unwrap_err();

    assert!(matches!(err, DbError::ExecutionError(_)));
    assert_eq!(rollbacks(&driver), 1);
    assert_eq!(commits(&driver), 0);
    assert!(driver.committed().is_empty());
    assert_eq!(driver.closed_connections(), 1);
}

#[tokio::test]
async fn test_rollback_failure_keeps_original_error() {
    let driver = MemoryDriver::new()
        .reject_execute(1i64)
        .fail_on(FailPoint::Rollback);
    let db = Database::new(Arc::new(driver.clone()));

    let err = db.transaction(&insert(), 1).await.unwrap_err();

    assert!(err.to_string().contains("rejected value 1"));
    assert_eq!(rollbacks(&driver), 1);
    assert_eq!(driver.closed_connections(), 1);
}

#[tokio::test]
async fn test_savepoint_compensation() {
    let driver = MemoryDriver::new().reject_execute(3i64);
    let db = Database::new(Arc::new(driver.clone()));

    let unit = insert()
        .bind(1)
        .then(ClosableStatement::savepoint("sp1"))
        .map(|_| 2i64)
        .then(insert())
        .map(|_| 3i64)
        .then(insert().or_rollback_to("sp1"));

    let result = db.transaction(&unit, ()).await.unwrap();

    assert!(result.is_partial());
    assert_eq!(result.savepoint(), Some("sp1"));
    assert!(result.partial_as::<()>().is_some());
    assert!(matches!(result.cause(), Some(DbError::ExecutionError(_))));

    let calls = driver.calls();
    let rollback_to = calls
        .iter()
        .position(|c| *c == DriverCall::RollbackToSavepoint { name: "sp1".into() })
        .unwrap();
    let commit = calls
        .iter()
        .position(|c| matches!(c, DriverCall::Commit { .. }))
        .unwrap();
    assert!(rollback_to < commit);
    assert_eq!(rollbacks(&driver), 0);

    // only the work before the savepoint survives
    assert_eq!(committed_ids(&driver), vec![Value::Integer(1)]);
    assert_eq!(driver.closed_connections(), 1);
}

#[tokio::test]
async fn test_signal_carries_partial_output() {
    let driver = MemoryDriver::new();
    let db = Database::new(Arc::new(driver.clone()));

    let unit = insert()
        .bind(1)
        .then(ClosableStatement::savepoint("sp1"))
        .and_then(|rows| async move {
            Err::<u64, _>(StatementError::rollback_to("sp1", rows, None))
        });

    let result = db.transaction(&unit, ()).await.unwrap();

    assert_eq!(result.partial_as::<u64>(), Some(&1));
    assert!(result.cause().is_none());
    assert_eq!(commits(&driver), 1);
}

#[tokio::test]
async fn test_failed_savepoint_rollback_falls_back_to_full_rollback() {
    let driver = MemoryDriver::new()
        .reject_execute(2i64)
        .fail_on(FailPoint::RollbackToSavepoint);
    let db = Database::new(Arc::new(driver.clone()));

    let unit = insert()
        .bind(1)
        .then(ClosableStatement::savepoint("sp1"))
        .map(|_| 2i64)
        .then(insert().or_rollback_to("sp1"));

    let err = db.transaction(&unit, ()).await.unwrap_err();

    // the cause of the request is surfaced, not the savepoint failure
    assert!(err.to_string().contains("rejected value 2"));
    assert_eq!(rollbacks(&driver), 1);
    assert_eq!(commits(&driver), 0);
    assert!(driver.committed().is_empty());
    assert_eq!(driver.closed_connections(), 1);
}

#[tokio::test]
async fn test_release_exactly_once_on_every_path() {
    // commit
    let driver = MemoryDriver::new();
    Database::new(Arc::new(driver.clone()))
        .transaction(&insert(), 1)
        .await
        .unwrap();
    assert_eq!(driver.closed_connections(), 1);

    // rollback
    let driver = MemoryDriver::new().reject_execute(1i64);
    let _ = Database::new(Arc::new(driver.clone()))
        .transaction(&insert(), 1)
        .await;
    assert_eq!(driver.closed_connections(), 1);

    // setup failure
    let driver = MemoryDriver::new().fail_on(FailPoint::SetAutoCommit);
    let err = Database::new(Arc::new(driver.clone()))
        .transaction(&insert(), 1)
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::ExecutionError(_)));
    assert_eq!(driver.closed_connections(), 1);
    assert_eq!(driver.open_connections(), 0);

    // release failure is logged, the committed outcome stands
    let driver = MemoryDriver::new().fail_on(FailPoint::Close);
    let result = Database::new(Arc::new(driver.clone()))
        .transaction(&insert(), 1)
        .await
        .unwrap();
    assert!(result.is_success());
    assert_eq!(driver.closed_connections(), 1);
}

#[tokio::test]
async fn test_provider_failure_surfaces() {
    let driver = MemoryDriver::new().fail_on(FailPoint::Acquire);
    let db = Database::new(Arc::new(driver.clone()));

    let err = db.transaction(&insert(), 1).await.unwrap_err();

    assert!(matches!(err, DbError::ConnectionError(_)));
    assert_eq!(driver.open_connections(), 0);
    assert!(driver.calls().is_empty());
}

#[tokio::test]
async fn test_parallel_dispatch_is_serialized() {
    let driver = MemoryDriver::new().execute_delay(Duration::from_millis(2));
    let db = Database::new(Arc::new(driver.clone()));

    let statements: Vec<_> = (0..8i64)
        .map(|i| insert().map(move |_| i).bind(i))
        .collect();
    let result = db.transaction_parallel(statements).await.unwrap();

    assert_eq!(result.output(), Some((0..8).collect::<Vec<i64>>()));
    assert_eq!(driver.overlaps(), 0);
    assert_eq!(driver.committed().len(), 8);
    assert_eq!(driver.acquired_connections(), 1);
}

#[tokio::test]
async fn test_parallel_failure_rolls_back_all() {
    let driver = MemoryDriver::new().reject_execute(5i64);
    let db = Database::new(Arc::new(driver.clone()));

    let statements: Vec<_> = (0..8i64).map(|i| insert().bind(i)).collect();
    let err = db.transaction_parallel(statements).await.unwrap_err();

    assert!(err.to_string().contains("rejected value 5"));
    assert_eq!(rollbacks(&driver), 1);
    assert!(driver.committed().is_empty());
}

fn is_work(call: &DriverCall) -> bool {
    matches!(
        call,
        DriverCall::Prepare { .. } | DriverCall::ExecuteUpdate { .. } | DriverCall::Commit { .. }
    )
}

#[tokio::test]
async fn test_cancelled_parallel_transaction_releases_connection() {
    let driver = MemoryDriver::new().execute_delay(Duration::from_millis(100));
    let db = Database::new(Arc::new(driver.clone()));

    let statements: Vec<_> = (0..3i64).map(|i| insert().bind(i)).collect();
    let cancelled =
        tokio::time::timeout(Duration::from_millis(20), db.transaction_parallel(statements)).await;
    assert!(cancelled.is_err());
    let work_at_cancel = driver.count(is_work);

    tokio::time::sleep(Duration::from_millis(300)).await;

    // abandoned statements never reach the driver
    assert_eq!(driver.count(is_work), work_at_cancel);
    assert_eq!(driver.open_statements(), 0);
    assert_eq!(driver.closed_connections(), 1);
    assert!(driver.committed().is_empty());
}

#[tokio::test]
async fn test_cancelled_sequence_transaction_releases_connection() {
    let driver = MemoryDriver::new().execute_delay(Duration::from_millis(100));
    let db = Database::new(Arc::new(driver.clone()));

    let statements: Vec<_> = (0..3i64).map(|i| insert().bind(i)).collect();
    let cancelled =
        tokio::time::timeout(Duration::from_millis(20), db.transaction_sequence(statements)).await;
    assert!(cancelled.is_err());

    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(driver.open_statements(), 0);
    assert_eq!(driver.closed_connections(), 1);
    assert!(driver.committed().is_empty());
}

#[tokio::test]
async fn test_sequence_collects_in_order() {
    let driver = MemoryDriver::new();
    let db = Database::new(Arc::new(driver.clone()));

    let statements = (1..=3i64).map(|i| insert().map(move |_| i * 10).bind(i)).collect();
    let result = db.transaction_sequence(statements).await.unwrap();

    assert_eq!(result.output(), Some(vec![10, 20, 30]));
}

#[tokio::test]
async fn test_statement_timeout_triggers_rollback() {
    let driver = MemoryDriver::new().execute_delay(Duration::from_millis(50));
    let db = Database::new(Arc::new(driver.clone()));

    let template = UpdateTemplate::new(
        "UPDATE accounts SET balance = 0",
        params_setter(|_: &()| StatementSetter::noop()),
    )
    .unwrap()
    .with_config(StatementConfig::new().timeout(Duration::from_millis(5)))
    .unwrap();

    let err = db
        .transaction(&ClosableStatement::update(template), ())
        .await
        .unwrap_err();

    assert_eq!(err, DbError::Timeout(Duration::from_millis(5)));
    assert_eq!(rollbacks(&driver), 1);
}

#[tokio::test]
async fn test_isolation_level_from_options() {
    let driver = MemoryDriver::new();
    let db = Database::new(Arc::new(driver.clone()));
    let options = TransactionOptions::new("repeatable_read".parse().unwrap()).label("audit");

    db.transaction_with(&options, &insert(), 1).await.unwrap();

    let calls = driver.calls();
    assert!(calls.contains(&DriverCall::SetAutoCommit {
        connection: 1,
        enabled: false
    }));
    assert!(calls.contains(&DriverCall::SetIsolation {
        connection: 1,
        level: IsolationLevel::RepeatableRead
    }));
}

#[derive(Default)]
struct Recorder(Mutex<Vec<OperationEvent>>);

impl TelemetryHook for Recorder {
    fn record(&self, event: &OperationEvent) -> anyhow::Result<()> {
        self.0.lock().unwrap().push(event.clone());
        anyhow::bail!("telemetry sink is down")
    }
}

#[tokio::test]
async fn test_telemetry_failure_does_not_change_outcome() {
    let driver = MemoryDriver::new();
    let recorder = Arc::new(Recorder::default());
    let db = Database::new(Arc::new(driver.clone())).with_telemetry(recorder.clone());

    let result = db.transaction(&insert(), 1).await.unwrap();
    assert!(result.is_success());

    let events = recorder.0.lock().unwrap();
    let kinds: Vec<_> = events.iter().map(|e| (e.kind, e.outcome)).collect();
    assert_eq!(
        kinds,
        vec![
            (OperationKind::Update, Outcome::Success),
            (OperationKind::Transaction, Outcome::Success)
        ]
    );
    assert_eq!(events[0].rows, Some(1));
}
