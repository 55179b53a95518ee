use crate::connection::{PreparedStatement, Session, StatementConfig};
use crate::core::{DbError, Result};
use crate::result::BatchResult;
use crate::statement::ParamsSetter;
use log::debug;

/// Runs one SQL template over many parameter sets in fixed-size batches
///
/// Batches execute strictly in index order on the session's connection.
/// With `continue_on_error` a failing batch is recorded and skipped; the
/// rows it carried are dropped, not retried one by one.
pub struct BatchExecutor<'a, P> {
    sql: &'a str,
    setter: &'a ParamsSetter<P>,
    config: &'a StatementConfig,
}

/// Running totals of one batch run
#[derive(Debug, Default)]
struct Progress {
    pending: usize,
    executed_batches: usize,
    rows_affected: u64,
    errors: Vec<DbError>,
}

impl Progress {
    fn record_counts(&mut self, counts: &[i64]) {
        // negative counts are driver status codes (e.g. -2 "count unknown")
        let rows: u64 = counts.iter().filter(|c| **c >= 0).map(|c| *c as u64).sum();
        self.rows_affected += rows;
        self.executed_batches += 1;
        self.pending = 0;
    }
}

impl<'a, P> BatchExecutor<'a, P> {
    pub fn new(sql: &'a str, setter: &'a ParamsSetter<P>, config: &'a StatementConfig) -> Self {
        Self {
            sql,
            setter,
            config,
        }
    }

    pub async fn execute(&self, session: &Session, params: &[P]) -> BatchResult {
        let total = params.len();
        let batch_size = self.config.batch_size.max(1);

        if total == 0 {
            return BatchResult::Success { rows_affected: 0 };
        }

        let mut stmt = match session.prepare(self.sql).await {
            Ok(stmt) => stmt,
            Err(error) => {
                debug!("batch '{}': prepare failed: {}", self.sql, error);
                return BatchResult::Failure {
                    total_stms: total,
                    batch_size,
                    executed_batches: 0,
                    rows_affected: 0,
                    error,
                };
            }
        };
        stmt.set_timeout(self.config.timeout);

        let mut progress = Progress::default();
        for (index, item) in params.iter().enumerate() {
            let last = index + 1 == total;
            if let Err(error) = self.step(&mut stmt, item, &mut progress, batch_size, last).await {
                debug!(
                    "batch '{}': row {} failed after {} batch(es): {}",
                    self.sql, index, progress.executed_batches, error
                );

                if !self.config.continue_on_error {
                    stmt.close_quietly();
                    return BatchResult::Failure {
                        total_stms: total,
                        batch_size,
                        executed_batches: progress.executed_batches,
                        rows_affected: progress.rows_affected,
                        error,
                    };
                }

                progress.errors.push(error);
                stmt.clear_batch();
                stmt.clear_parameters();
                progress.pending = 0;
            }
        }
        stmt.close_quietly();

        debug!(
            "batch '{}': {} statement(s) in {} batch(es), {} row(s), {} error(s)",
            self.sql,
            total,
            progress.executed_batches,
            progress.rows_affected,
            progress.errors.len()
        );

        if progress.errors.is_empty() {
            BatchResult::Success {
                rows_affected: progress.rows_affected,
            }
        } else {
            BatchResult::PartialSuccess {
                total_stms: total,
                batch_size,
                executed_batches: progress.executed_batches,
                rows_affected: progress.rows_affected,
                errors: progress.errors,
            }
        }
    }

    /// Bind and queue one row, flushing when the batch is full or `last`.
    async fn step(
        &self,
        stmt: &mut PreparedStatement,
        item: &P,
        progress: &mut Progress,
        batch_size: usize,
        last: bool,
    ) -> Result<()> {
        (self.setter)(item).apply_from_start(stmt.handle_mut())?;
        stmt.add_batch()?;
        progress.pending += 1;

        if progress.pending == batch_size || last {
            let counts = stmt.execute_batch().await?;
            progress.record_counts(&counts);
        }
        Ok(())
    }
}
