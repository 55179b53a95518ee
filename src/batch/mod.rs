// ============================================================================
// Batch Execution
// ============================================================================
//
// Loop for one template over n parameter sets:
//
//   prepare -> set timeout
//   for each row: bind -> add_batch -> (full or last?) execute_batch
//   close
//
// Outcome is a three-way BatchResult. Rows of a failed batch are dropped,
// never retried individually.
//
// ============================================================================

pub mod executor;

pub use executor::BatchExecutor;
