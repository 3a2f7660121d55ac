//! Tracked asynchronous work: the transaction manager and its helpers.

pub mod manager;
pub mod work;

pub use manager::TxManager;
pub use work::{track_task, TxDone, TxOutcome, WorkUnit};
