pub mod batch;
pub mod transaction;

pub use batch::BatchResult;
pub use transaction::TxResult;
