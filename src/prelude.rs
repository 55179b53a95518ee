//! Everything needed to describe and run units of work.
//!
//! ```
//! use sqlweave::prelude::*;
//! ```

pub use crate::connection::{
    ConnectionProvider, IsolationLevel, Session, StatementConfig, TransactionOptions,
};
pub use crate::core::{DbError, Result, Row, Value};
pub use crate::result::{BatchResult, TxResult};
pub use crate::statement::{
    BatchTemplate, ClosableStatement, InsertTemplate, ParamsSetter, QueryTemplate,
    ResultSetMapper, StatementResult, StatementSetter, UpdateTemplate, column, params_setter,
};
pub use crate::transaction::{SavepointRollback, StatementError};
pub use crate::Database;
