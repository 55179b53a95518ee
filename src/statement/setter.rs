use crate::connection::StatementHandle;
use crate::core::{Result, Value};
use std::sync::Arc;

type SetterFn = dyn Fn(usize, &mut dyn StatementHandle) -> Result<usize> + Send + Sync;

/// Binds one logical parameter into a statement handle
///
/// A setter receives the 1-based position to start at and returns the next
/// free position, so setters compose left to right with [`then`](Self::then).
/// Binding mutates only the supplied handle.
#[derive(Clone)]
pub struct StatementSetter {
    apply: Arc<SetterFn>,
}

/// Produces the setter for one parameter set; supplied per SQL template.
pub type ParamsSetter<P> = Arc<dyn Fn(&P) -> StatementSetter + Send + Sync>;

/// Wrap a closure as a [`ParamsSetter`].
pub fn params_setter<P, F>(f: F) -> ParamsSetter<P>
where
    F: Fn(&P) -> StatementSetter + Send + Sync + 'static,
{
    Arc::new(f)
}

impl StatementSetter {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(usize, &mut dyn StatementHandle) -> Result<usize> + Send + Sync + 'static,
    {
        Self { apply: Arc::new(f) }
    }

    /// Binds nothing and leaves the position unchanged.
    pub fn noop() -> Self {
        Self::new(|position, _| Ok(position))
    }

    /// Binds one value at the current position.
    pub fn value(value: impl Into<Value>) -> Self {
        let value = value.into();
        Self::new(move |position, handle| {
            handle.bind(position, value.clone())?;
            Ok(position + 1)
        })
    }

    /// Binds `NULL` for `None`.
    pub fn optional<T: Into<Value>>(value: Option<T>) -> Self {
        Self::value(Value::from(value))
    }

    /// Binds each value at consecutive positions.
    pub fn values<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();
        Self::new(move |position, handle| {
            let mut next = position;
            for value in &values {
                handle.bind(next, value.clone())?;
                next += 1;
            }
            Ok(next)
        })
    }

    /// Applies `self`, then `other` starting where `self` stopped.
    pub fn then(self, other: StatementSetter) -> Self {
        Self::new(move |position, handle| {
            let next = (self.apply)(position, handle)?;
            (other.apply)(next, handle)
        })
    }

    pub fn apply(&self, position: usize, handle: &mut dyn StatementHandle) -> Result<usize> {
        (self.apply)(position, handle)
    }

    /// Binds starting at position 1.
    pub fn apply_from_start(&self, handle: &mut dyn StatementHandle) -> Result<usize> {
        self.apply(1, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::memory::MemoryDriver;
    use crate::connection::ConnectionProvider;
    use crate::core::DbError;

    #[tokio::test]
    async fn test_then_threads_positions() {
        let driver = MemoryDriver::new();
        let mut conn = driver.acquire().await.unwrap();
        let mut stmt = conn.prepare("INSERT INTO t VALUES (?, ?, ?, ?)").await.unwrap();

        let setter = StatementSetter::value(1i64)
            .then(StatementSetter::noop())
            .then(StatementSetter::values(["a", "b"]))
            .then(StatementSetter::optional::<bool>(None));

        let next = setter.apply_from_start(stmt.as_mut()).unwrap();
        assert_eq!(next, 5);

        stmt.execute_update().await.unwrap();
        let written = driver.committed();
        assert_eq!(
            written[0].params,
            vec![
                Value::Integer(1),
                Value::from("a"),
                Value::from("b"),
                Value::Null
            ]
        );
    }

    #[tokio::test]
    async fn test_bind_failure_stops_composition() {
        let driver = MemoryDriver::new().reject_bind("bad");
        let mut conn = driver.acquire().await.unwrap();
        let mut stmt = conn.prepare("INSERT INTO t VALUES (?, ?)").await.unwrap();

        let setter = StatementSetter::value("bad").then(StatementSetter::value(2i64));
        let err = setter.apply(1, stmt.as_mut()).unwrap_err();
        assert!(matches!(err, DbError::BindError { position: 1, .. }));
    }

    #[test]
    fn test_params_setter_wraps_closure() {
        let setter: ParamsSetter<(i64, String)> =
            params_setter(|(id, name): &(i64, String)| {
                StatementSetter::value(*id).then(StatementSetter::value(name.clone()))
            });
        let _ = setter(&(1, "alice".to_string()));
    }
}
