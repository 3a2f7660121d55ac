//! Transaction tracking and ownership-scoped job orchestration for an
//! anchoring node.
//!
//! Long-running chain work (submitting a transaction, waiting for its
//! inclusion, decoding the emitted events) is started through two entry
//! points:
//!
//! - [`TxManager::execute_within_tx`] runs one asynchronous work unit and
//!   records its outcome in a durable, per-account [`Transaction`] ledger.
//! - [`JobDispatcher::dispatch`] hands a [`Job`] to the queue engine after
//!   atomically recording which account owns it. Jobs are driven by
//!   [`Runner`]s, usually chained state machines such as the identity
//!   creation flow in [`identity`].
//!
//! # Module Organization
//!
//! - [`types`] - identifiers and status values
//! - [`domain`] - persisted records (transactions, ownership, jobs)
//! - [`store`] - KV backend trait, in-memory backend, typed record store
//! - [`transactions`] - the transaction manager and the task-status wrapper
//! - [`watch`] - per-id status change notifications
//! - [`jobs`] - runners, the local queue engine, the ownership dispatcher
//! - [`identity`] - identity creation as a two-step chain
//! - [`api`] - status query boundary
//! - [`config`] / [`error`] / [`constants`]

pub mod api;
pub mod config;
pub mod constants;
pub mod domain;
pub mod error;
pub mod identity;
pub mod jobs;
#[cfg(feature = "logging")]
pub mod logging;
pub mod store;
pub mod transactions;
pub mod types;
pub mod watch;

pub use config::OrchestratorConfig;
pub use domain::{Job, JobState, OwnershipRecord, Overrides, TaskLog, Transaction};
pub use error::{ErrorKind, JobError, RecordError, TaskError, TxError};
pub use jobs::{JobDispatcher, JobEngine, LocalJobEngine, Runner};
pub use store::{InMemoryBackend, RecordStore, StorageBackend};
pub use transactions::{TxDone, TxManager, WorkUnit};
pub use types::{JobId, OwnerId, Status, StatusResponse, TxId};
