//! Persisted domain records.

pub mod job;
pub mod ownership;
pub mod transaction;

pub use job::{AttemptOutcome, Job, JobState, Overrides, TaskAttempt};
pub use ownership::OwnershipRecord;
pub use transaction::{TaskLog, Transaction, TxValue};
