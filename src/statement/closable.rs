use crate::connection::Session;
use crate::core::DbError;
use crate::transaction::StatementError;
use futures::future::{BoxFuture, FutureExt, join_all};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::task::{JoinError, JoinHandle};

pub type StatementResult<O> = std::result::Result<O, StatementError>;

/// Deferred effect of a closable statement; nothing runs until it is awaited.
pub type StatementFuture<O> = BoxFuture<'static, StatementResult<O>>;

type RunFn<P, O> = dyn Fn(P, Session) -> StatementFuture<O> + Send + Sync;

/// One composable unit of database work
///
/// A closable statement receives its parameters and the session of whoever
/// runs it; it never opens or closes a connection. The same statement can
/// therefore run standalone or as one step of a larger transaction.
///
/// # Examples
///
/// ```ignore
/// let debit = ClosableStatement::update(debit_template);
/// let credit = ClosableStatement::update(credit_template);
///
/// // Both updates share the transaction's connection.
/// let transfer = debit
///     .map(move |_| credit_params.clone())
///     .then(credit);
/// ```
pub struct ClosableStatement<P, O> {
    run: Arc<RunFn<P, O>>,
}

impl<P, O> Clone for ClosableStatement<P, O> {
    fn clone(&self) -> Self {
        Self {
            run: Arc::clone(&self.run),
        }
    }
}

impl<P, O> ClosableStatement<P, O>
where
    P: Send + 'static,
    O: Send + 'static,
{
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(P, Session) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StatementResult<O>> + Send + 'static,
    {
        Self {
            run: Arc::new(move |params, session| f(params, session).boxed()),
        }
    }

    pub fn apply(&self, params: P, session: Session) -> StatementFuture<O> {
        (self.run)(params, session)
    }

    /// Run `self`, then feed its output and the same session into `next`.
    ///
    /// A failure of `self` short-circuits; `next` never runs.
    pub fn then<B>(self, next: ClosableStatement<O, B>) -> ClosableStatement<P, B>
    where
        B: Send + 'static,
    {
        ClosableStatement::new(move |params, session: Session| {
            let first = self.apply(params, session.clone());
            let next = next.clone();
            async move {
                let output = first.await?;
                next.apply(output, session).await
            }
        })
    }

    /// Continue with an effect that does not need the connection.
    pub fn and_then<B, F, Fut>(self, f: F) -> ClosableStatement<P, B>
    where
        B: Send + 'static,
        F: Fn(O) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StatementResult<B>> + Send + 'static,
    {
        let f = Arc::new(f);
        ClosableStatement::new(move |params, session| {
            let first = self.apply(params, session);
            let f = Arc::clone(&f);
            async move {
                let output = first.await?;
                (*f)(output).await
            }
        })
    }

    pub fn map<B, F>(self, f: F) -> ClosableStatement<P, B>
    where
        B: Send + 'static,
        F: Fn(O) -> B + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        ClosableStatement::new(move |params, session| {
            let first = self.apply(params, session);
            let f = Arc::clone(&f);
            async move { first.await.map(|output| (*f)(output)) }
        })
    }

    /// Transform an ordinary failure. Savepoint requests pass through as-is.
    pub fn map_failure<F>(self, f: F) -> Self
    where
        F: Fn(DbError) -> DbError + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        ClosableStatement::new(move |params, session| {
            let first = self.apply(params, session);
            let f = Arc::clone(&f);
            async move {
                first.await.map_err(|err| match err {
                    StatementError::Failed(db) => StatementError::Failed((*f)(db)),
                    signal => signal,
                })
            }
        })
    }

    /// Turn an ordinary failure into a request to roll back to `savepoint`,
    /// keeping the transaction alive. The failure becomes the request's cause.
    pub fn or_rollback_to(self, savepoint: &str) -> Self {
        let savepoint = savepoint.to_string();
        ClosableStatement::new(move |params, session| {
            let first = self.apply(params, session);
            let savepoint = savepoint.clone();
            async move {
                first.await.map_err(|err| match err {
                    StatementError::Failed(cause) => {
                        StatementError::rollback_to(savepoint, (), Some(cause))
                    }
                    signal => signal,
                })
            }
        })
    }

    /// Fix the parameters, leaving a statement that takes none.
    pub fn bind(self, params: P) -> ClosableStatement<(), O>
    where
        P: Clone + Sync,
    {
        ClosableStatement::new(move |(), session| self.apply(params.clone(), session))
    }
}

impl<P> ClosableStatement<P, P>
where
    P: Send + 'static,
{
    /// Set a savepoint named `name`, then pass the parameters through.
    pub fn savepoint(name: &str) -> Self {
        let name = name.to_string();
        ClosableStatement::new(move |params, session: Session| {
            let name = name.clone();
            async move {
                session.set_savepoint(&name).await?;
                Ok(params)
            }
        })
    }

    /// Release the savepoint named `name`, then pass the parameters through.
    pub fn release_savepoint(name: &str) -> Self {
        let name = name.to_string();
        ClosableStatement::new(move |params, session: Session| {
            let name = name.clone();
            async move {
                session.release_savepoint(&name).await?;
                Ok(params)
            }
        })
    }
}

impl<O> ClosableStatement<(), Vec<O>>
where
    O: Send + 'static,
{
    /// Run each statement after the previous one resolved, collecting the
    /// outputs in order. The first failure stops the sequence.
    pub fn sequence(statements: Vec<ClosableStatement<(), O>>) -> Self {
        let statements = Arc::new(statements);
        ClosableStatement::new(move |(), session: Session| {
            let statements = Arc::clone(&statements);
            async move {
                let mut outputs = Vec::with_capacity(statements.len());
                for statement in statements.iter() {
                    outputs.push(statement.apply((), session.clone()).await?);
                }
                Ok(outputs)
            }
        })
    }

    /// Submit every statement at once, one runtime task each, against the
    /// same session.
    ///
    /// Driver calls still reach the connection one at a time through the
    /// session lock. All statements are awaited; outputs come back in
    /// submission order and the first failure in submission order wins.
    /// Dropping the returned future aborts the tasks still running.
    pub fn parallel(statements: Vec<ClosableStatement<(), O>>) -> Self {
        let statements = Arc::new(statements);
        ClosableStatement::new(move |(), session: Session| {
            let statements = Arc::clone(&statements);
            async move {
                let tasks: Vec<_> = statements
                    .iter()
                    .map(|statement| Spawned(tokio::spawn(statement.apply((), session.clone()))))
                    .collect();

                let mut outputs = Vec::with_capacity(tasks.len());
                let mut failure = None;
                for joined in join_all(tasks).await {
                    let result = joined
                        .map_err(|err| StatementError::Failed(err.into()))
                        .and_then(|result| result);
                    match result {
                        Ok(output) => outputs.push(output),
                        Err(err) => {
                            if failure.is_none() {
                                failure = Some(err);
                            }
                        }
                    }
                }

                match failure {
                    Some(err) => Err(err),
                    None => Ok(outputs),
                }
            }
        })
    }
}

/// Task handle that aborts its task when dropped
struct Spawned<T>(JoinHandle<T>);

impl<T> Future for Spawned<T> {
    type Output = std::result::Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

impl<T> Drop for Spawned<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionProvider;
    use crate::connection::memory::MemoryDriver;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn session() -> Session {
        let driver = MemoryDriver::new();
        Session::new(driver.acquire().await.unwrap(), None)
    }

    fn add(n: i64) -> ClosableStatement<i64, i64> {
        ClosableStatement::new(move |x: i64, _session| async move { Ok(x + n) })
    }

    fn fail<P: Send + 'static>(message: &'static str) -> ClosableStatement<P, i64> {
        ClosableStatement::new(move |_params: P, _session| async move {
            Err(DbError::ExecutionError(message.into()).into())
        })
    }

    #[tokio::test]
    async fn test_then_feeds_output_forward() {
        let chain = add(1).then(add(10)).map(|x| x * 2);
        assert_eq!(chain.apply(1, session().await).await.unwrap(), 24);
    }

    #[tokio::test]
    async fn test_then_short_circuits() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let tail = ClosableStatement::new(move |x: i64, _session| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(x) }
        });

        let err = fail::<i64>("first").then(tail).apply(0, session().await).await.unwrap_err();
        assert_eq!(err.db_error(), Some(&DbError::ExecutionError("first".into())));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_composition_is_lazy() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let stmt = ClosableStatement::new(move |x: i64, _session| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(x)
            }
        });

        let fut = stmt.clone().then(add(1)).apply(1, session().await);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(fut.await.unwrap(), 2);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_and_then_continuation() {
        let stmt = add(2).and_then(|x| async move { Ok(format!("value={}", x)) });
        assert_eq!(stmt.apply(1, session().await).await.unwrap(), "value=3");
    }

    #[tokio::test]
    async fn test_map_failure_leaves_signals_alone() {
        let relabel = |err: DbError| DbError::ExecutionError(format!("step 2: {}", err));

        let failed = fail::<i64>("boom").map_failure(relabel);
        let err = failed.apply(0, session().await).await.unwrap_err();
        assert_eq!(
            err.db_error(),
            Some(&DbError::ExecutionError("step 2: Execution error: boom".into()))
        );

        let signal = fail::<i64>("boom").or_rollback_to("sp1").map_failure(relabel);
        match signal.apply(0, session().await).await.unwrap_err() {
            StatementError::RollbackToSavepoint(sp) => {
                assert_eq!(sp.savepoint(), "sp1");
                assert_eq!(sp.cause(), Some(&DbError::ExecutionError("boom".into())));
            }
            other => panic!("expected savepoint rollback, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sequence_and_parallel_keep_order() {
        let bound: Vec<_> = (0..5).map(|i| add(i).bind(100)).collect();

        let seq = ClosableStatement::sequence(bound.clone());
        assert_eq!(seq.apply((), session().await).await.unwrap(), vec![100, 101, 102, 103, 104]);

        let par = ClosableStatement::parallel(bound);
        assert_eq!(par.apply((), session().await).await.unwrap(), vec![100, 101, 102, 103, 104]);
    }

    #[tokio::test]
    async fn test_parallel_first_failure_in_submission_order() {
        let statements = vec![
            add(1).bind(0),
            fail::<i64>("second").bind(0),
            fail::<i64>("third").bind(0),
        ];
        let err = ClosableStatement::parallel(statements)
            .apply((), session().await)
            .await
            .unwrap_err();
        assert_eq!(err.db_error(), Some(&DbError::ExecutionError("second".into())));
    }

    #[tokio::test]
    async fn test_dropping_parallel_aborts_tasks() {
        let finished = Arc::new(AtomicUsize::new(0));
        let statements: Vec<ClosableStatement<(), ()>> = (0..3)
            .map(|_| {
                let finished = Arc::clone(&finished);
                ClosableStatement::new(move |(), _session| {
                    let finished = Arc::clone(&finished);
                    async move {
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        finished.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
            })
            .collect();

        let run = ClosableStatement::parallel(statements).apply((), session().await);
        let timed = tokio::time::timeout(std::time::Duration::from_millis(10), run).await;
        assert!(timed.is_err());

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }
}
