// ============================================================================
// Telemetry
// ============================================================================
//
// One `OperationEvent` is emitted after every unit of work (query, update,
// insert, batch, transaction). Hooks are user code: whatever they return or
// however they panic, the outcome of the unit of work stays the same.
//
// ============================================================================

use crate::core::DbError;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Query,
    Update,
    Insert,
    Batch,
    Transaction,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Query => "query",
            OperationKind::Update => "update",
            OperationKind::Insert => "insert",
            OperationKind::Batch => "batch",
            OperationKind::Transaction => "transaction",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    /// Batch with recorded errors, or a transaction committed after a
    /// savepoint rollback
    Partial,
    Failure,
}

/// What happened during one unit of work
#[derive(Debug, Clone, Serialize)]
pub struct OperationEvent {
    pub kind: OperationKind,
    pub sql: Option<String>,
    pub label: Option<String>,
    pub outcome: Outcome,
    pub rows: Option<u64>,
    pub batches: Option<usize>,
    #[serde(rename = "duration_ms")]
    #[serde(serialize_with = "as_millis")]
    pub duration: Duration,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

fn as_millis<S: serde::Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u128(duration.as_millis())
}

impl OperationEvent {
    pub fn new(kind: OperationKind, outcome: Outcome, duration: Duration) -> Self {
        Self {
            kind,
            sql: None,
            label: None,
            outcome,
            rows: None,
            batches: None,
            duration,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn sql(mut self, sql: &str) -> Self {
        self.sql = Some(sql.to_string());
        self
    }

    pub fn label(mut self, label: Option<&str>) -> Self {
        self.label = label.map(str::to_string);
        self
    }

    pub fn rows(mut self, rows: u64) -> Self {
        self.rows = Some(rows);
        self
    }

    pub fn batches(mut self, batches: usize) -> Self {
        self.batches = Some(batches);
        self
    }

    pub fn error(mut self, error: &DbError) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// Receives an event after each unit of work
pub trait TelemetryHook: Send + Sync {
    fn record(&self, event: &OperationEvent) -> anyhow::Result<()>;
}

/// Writes every event as one JSON line at `info` level under the
/// `sqlweave::telemetry` target
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTelemetry;

impl TelemetryHook for LogTelemetry {
    fn record(&self, event: &OperationEvent) -> anyhow::Result<()> {
        let line = serde_json::to_string(event)?;
        info!(target: "sqlweave::telemetry", "{}", line);
        Ok(())
    }
}

/// Hand `event` to `hook`, swallowing its errors and panics.
pub(crate) fn emit(hook: Option<&Arc<dyn TelemetryHook>>, event: OperationEvent) {
    let Some(hook) = hook else {
        return;
    };

    match catch_unwind(AssertUnwindSafe(|| hook.record(&event))) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!("telemetry hook failed for {} event: {:#}", event.kind, err),
        Err(_) => warn!("telemetry hook panicked on {} event", event.kind),
    }
}
