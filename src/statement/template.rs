use super::closable::ClosableStatement;
use super::mapper::ResultSetMapper;
use super::setter::ParamsSetter;
use crate::batch::BatchExecutor;
use crate::connection::{Session, StatementConfig};
use crate::core::{DbError, Result, Value};
use crate::result::BatchResult;
use crate::telemetry::{OperationEvent, OperationKind, Outcome};
use crate::transaction::StatementError;
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;
use std::time::Instant;

lazy_static! {
    static ref QUERY_SQL: Regex = Regex::new(r"(?is)^\s*(SELECT|WITH)\s").unwrap();
    static ref INSERT_SQL: Regex = Regex::new(r"(?is)^\s*INSERT\s+INTO\s").unwrap();
    static ref UPDATE_SQL: Regex =
        Regex::new(r"(?is)^\s*(INSERT|UPDATE|DELETE|MERGE)\s").unwrap();
}

fn check_sql(kind: &str, pattern: &Regex, expected: &str, sql: &str) -> Result<String> {
    if !pattern.is_match(sql) {
        return Err(DbError::ConfigError(format!(
            "{} template must be {}, got '{}'",
            kind, expected, sql
        )));
    }
    Ok(sql.trim().to_string())
}

fn event(
    kind: OperationKind,
    sql: &str,
    config: &StatementConfig,
    started: Instant,
    error: Option<&DbError>,
) -> OperationEvent {
    let outcome = if error.is_some() {
        Outcome::Failure
    } else {
        Outcome::Success
    };
    let event = OperationEvent::new(kind, outcome, started.elapsed())
        .sql(sql)
        .label(config.label.as_deref());
    match error {
        Some(err) => event.error(err),
        None => event,
    }
}

/// A validated `SELECT` template with its parameter setter and row mapper
pub struct QueryTemplate<P, O> {
    sql: String,
    setter: ParamsSetter<P>,
    mapper: ResultSetMapper<O>,
    config: StatementConfig,
}

impl<P, O> QueryTemplate<P, O> {
    /// Fails with `ConfigError` unless `sql` starts with `SELECT` or `WITH`.
    pub fn new(sql: &str, setter: ParamsSetter<P>, mapper: ResultSetMapper<O>) -> Result<Self> {
        Ok(Self {
            sql: check_sql("query", &QUERY_SQL, "a SELECT statement", sql)?,
            setter,
            mapper,
            config: StatementConfig::default(),
        })
    }

    pub fn with_config(mut self, config: StatementConfig) -> Result<Self> {
        config.validate()?;
        self.config = config;
        Ok(self)
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    async fn run(&self, session: &Session, params: &P) -> Result<O> {
        let mut stmt = session.prepare(&self.sql).await?;
        stmt.set_timeout(self.config.timeout);
        stmt.set_fetch_size(self.config.fetch_size);
        (self.setter)(params).apply_from_start(stmt.handle_mut())?;

        let output = stmt.query(&self.mapper).await?;
        stmt.close_quietly();
        Ok(output)
    }
}

/// A validated `INSERT`/`UPDATE`/`DELETE`/`MERGE` template
pub struct UpdateTemplate<P> {
    sql: String,
    setter: ParamsSetter<P>,
    config: StatementConfig,
}

impl<P> UpdateTemplate<P> {
    pub fn new(sql: &str, setter: ParamsSetter<P>) -> Result<Self> {
        Ok(Self {
            sql: check_sql("update", &UPDATE_SQL, "a data-modifying statement", sql)?,
            setter,
            config: StatementConfig::default(),
        })
    }

    pub fn with_config(mut self, config: StatementConfig) -> Result<Self> {
        config.validate()?;
        self.config = config;
        Ok(self)
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    async fn run(&self, session: &Session, params: &P) -> Result<u64> {
        let mut stmt = session.prepare(&self.sql).await?;
        stmt.set_timeout(self.config.timeout);
        (self.setter)(params).apply_from_start(stmt.handle_mut())?;

        let count = stmt.execute_update().await?;
        stmt.close_quietly();
        Ok(count.max(0) as u64)
    }
}

/// A validated `INSERT INTO` template whose statement must produce a key
pub struct InsertTemplate<P> {
    sql: String,
    setter: ParamsSetter<P>,
    config: StatementConfig,
}

impl<P> InsertTemplate<P> {
    pub fn new(sql: &str, setter: ParamsSetter<P>) -> Result<Self> {
        Ok(Self {
            sql: check_sql("insert", &INSERT_SQL, "an INSERT INTO statement", sql)?,
            setter,
            config: StatementConfig::default(),
        })
    }

    pub fn with_config(mut self, config: StatementConfig) -> Result<Self> {
        config.validate()?;
        self.config = config;
        Ok(self)
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    async fn run(&self, session: &Session, params: &P) -> Result<Value> {
        let mut stmt = session.prepare(&self.sql).await?;
        stmt.set_timeout(self.config.timeout);
        (self.setter)(params).apply_from_start(stmt.handle_mut())?;

        stmt.execute_update().await?;
        let key = stmt.generated_key().await?;
        stmt.close_quietly();
        key.ok_or_else(|| DbError::MissingGeneratedKey(self.sql.clone()))
    }
}

/// A validated data-modifying template executed over many parameter sets
pub struct BatchTemplate<P> {
    sql: String,
    setter: ParamsSetter<P>,
    config: StatementConfig,
}

impl<P> BatchTemplate<P> {
    pub fn new(sql: &str, setter: ParamsSetter<P>) -> Result<Self> {
        Ok(Self {
            sql: check_sql("batch", &UPDATE_SQL, "a data-modifying statement", sql)?,
            setter,
            config: StatementConfig::default(),
        })
    }

    /// Batch size, continue-on-error policy and timeout come from `config`.
    pub fn with_config(mut self, config: StatementConfig) -> Result<Self> {
        config.validate()?;
        self.config = config;
        Ok(self)
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn config(&self) -> &StatementConfig {
        &self.config
    }

    async fn run(&self, session: &Session, params: &[P]) -> BatchResult {
        BatchExecutor::new(&self.sql, &self.setter, &self.config)
            .execute(session, params)
            .await
    }
}

impl<P, O> ClosableStatement<P, O>
where
    P: Send + Sync + 'static,
    O: Send + 'static,
{
    /// Run `template` as a query and map its rows.
    pub fn query(template: QueryTemplate<P, O>) -> Self {
        let template = Arc::new(template);
        ClosableStatement::new(move |params: P, session: Session| {
            let template = Arc::clone(&template);
            async move {
                let started = Instant::now();
                let result = template.run(&session, &params).await;
                session.observe(event(
                    OperationKind::Query,
                    &template.sql,
                    &template.config,
                    started,
                    result.as_ref().err(),
                ));
                result.map_err(StatementError::from)
            }
        })
    }
}

impl<P> ClosableStatement<P, u64>
where
    P: Send + Sync + 'static,
{
    /// Run `template` once, yielding the update count.
    pub fn update(template: UpdateTemplate<P>) -> Self {
        let template = Arc::new(template);
        ClosableStatement::new(move |params: P, session: Session| {
            let template = Arc::clone(&template);
            async move {
                let started = Instant::now();
                let result = template.run(&session, &params).await;
                let mut event = event(
                    OperationKind::Update,
                    &template.sql,
                    &template.config,
                    started,
                    result.as_ref().err(),
                );
                if let Ok(rows) = &result {
                    event = event.rows(*rows);
                }
                session.observe(event);
                result.map_err(StatementError::from)
            }
        })
    }
}

impl<P> ClosableStatement<P, Value>
where
    P: Send + Sync + 'static,
{
    /// Run `template` and return the generated key.
    ///
    /// Fails with `MissingGeneratedKey` when the driver produced none.
    pub fn insert_returning_key(template: InsertTemplate<P>) -> Self {
        let template = Arc::new(template);
        ClosableStatement::new(move |params: P, session: Session| {
            let template = Arc::clone(&template);
            async move {
                let started = Instant::now();
                let result = template.run(&session, &params).await;
                session.observe(event(
                    OperationKind::Insert,
                    &template.sql,
                    &template.config,
                    started,
                    result.as_ref().err(),
                ));
                result.map_err(StatementError::from)
            }
        })
    }
}

impl<P> ClosableStatement<Vec<P>, BatchResult>
where
    P: Send + Sync + 'static,
{
    /// Run `template` over every parameter set.
    ///
    /// The outcome, including an aborted run, is the `BatchResult` value;
    /// use [`BatchResult::into_result`] to fail a transaction on `Failure`.
    pub fn batch(template: BatchTemplate<P>) -> Self {
        let template = Arc::new(template);
        ClosableStatement::new(move |params: Vec<P>, session: Session| {
            let template = Arc::clone(&template);
            async move {
                let started = Instant::now();
                let result = template.run(&session, &params).await;

                let (outcome, batches) = match &result {
                    BatchResult::Success { .. } => (
                        Outcome::Success,
                        params.len().div_ceil(template.config.batch_size),
                    ),
                    BatchResult::PartialSuccess {
                        executed_batches, ..
                    } => (Outcome::Partial, *executed_batches),
                    BatchResult::Failure {
                        executed_batches, ..
                    } => (Outcome::Failure, *executed_batches),
                };
                let mut event = OperationEvent::new(OperationKind::Batch, outcome, started.elapsed())
                    .sql(&template.sql)
                    .label(template.config.label.as_deref())
                    .rows(result.rows_affected())
                    .batches(batches);
                if let Some(err) = result.errors().last() {
                    event = event.error(err);
                }
                session.observe(event);

                Ok(result)
            }
        })
    }
}
