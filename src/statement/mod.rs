// ============================================================================
// Statement Layer
// ============================================================================
//
// Building blocks callers compose into units of work:
//
//   StatementSetter    binds one parameter set into a handle
//   ResultSetMapper    turns a cursor into a typed value
//   *Template          validated SQL + setter (+ mapper) + StatementConfig
//   ClosableStatement  (params, session) -> deferred effect; combinators
//
// Nothing here opens or releases connections.
//
// ============================================================================

pub mod closable;
pub mod mapper;
pub mod setter;
pub mod template;

pub use closable::{ClosableStatement, StatementFuture, StatementResult};
pub use mapper::{ResultSetMapper, column};
pub use setter::{ParamsSetter, StatementSetter, params_setter};
pub use template::{BatchTemplate, InsertTemplate, QueryTemplate, UpdateTemplate};
