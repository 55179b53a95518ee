use crate::connection::Cursor;
use crate::core::{DbError, Result, Row, Value};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchShape {
    /// Advance the cursor once.
    AtMostOne,
    /// Drain the cursor.
    All,
}

/// Maps a result cursor into a typed value
///
/// Two standard shapes: [`single`](ResultSetMapper::single) reads at most one
/// row, [`list`](ResultSetMapper::list) produces one entity per row.
pub struct ResultSetMapper<O> {
    shape: FetchShape,
    finish: Arc<dyn Fn(Vec<Row>) -> Result<O> + Send + Sync>,
}

impl<O> Clone for ResultSetMapper<O> {
    fn clone(&self) -> Self {
        Self {
            shape: self.shape,
            finish: Arc::clone(&self.finish),
        }
    }
}

impl<T: 'static> ResultSetMapper<Option<T>> {
    /// At most one row; `None` when the cursor is empty.
    pub fn single<F>(row_mapper: F) -> Self
    where
        F: Fn(&Row) -> Result<T> + Send + Sync + 'static,
    {
        Self {
            shape: FetchShape::AtMostOne,
            finish: Arc::new(move |rows: Vec<Row>| rows.first().map(&row_mapper).transpose()),
        }
    }
}

impl<T: 'static> ResultSetMapper<Vec<T>> {
    /// One entity per row, in cursor order.
    pub fn list<F>(row_mapper: F) -> Self
    where
        F: Fn(&Row) -> Result<T> + Send + Sync + 'static,
    {
        Self {
            shape: FetchShape::All,
            finish: Arc::new(move |rows: Vec<Row>| rows.iter().map(&row_mapper).collect()),
        }
    }
}

impl<T> ResultSetMapper<T>
where
    T: TryFrom<Value, Error = DbError> + 'static,
{
    /// First column of the first row; an empty result is a mapping error.
    pub fn scalar() -> Self {
        Self {
            shape: FetchShape::AtMostOne,
            finish: Arc::new(|rows: Vec<Row>| {
                let value = rows
                    .into_iter()
                    .next()
                    .and_then(|row| row.into_iter().next())
                    .ok_or_else(|| DbError::MappingError("query returned no value".into()))?;
                T::try_from(value)
            }),
        }
    }
}

impl<O> ResultSetMapper<O> {
    pub(crate) async fn read(&self, cursor: &mut dyn Cursor) -> Result<O> {
        let mut rows = Vec::new();
        match self.shape {
            FetchShape::AtMostOne => {
                if let Some(row) = cursor.next().await? {
                    rows.push(row);
                }
            }
            FetchShape::All => {
                while let Some(row) = cursor.next().await? {
                    rows.push(row);
                }
            }
        }
        (self.finish)(rows)
    }
}

/// Read column `index` of `row` as `T`.
pub fn column<T>(row: &Row, index: usize) -> Result<T>
where
    T: TryFrom<Value, Error = DbError>,
{
    let value = row
        .get(index)
        .cloned()
        .ok_or_else(|| DbError::MappingError(format!("row has no column {}", index)))?;
    T::try_from(value)
}
