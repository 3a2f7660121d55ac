//! Storage layers.
//!
//! - [`backend`] - the ordered KV contract ([`StorageBackend`]) and key helpers
//! - [`memory`] - [`InMemoryBackend`], the bundled backend
//! - [`envelope`] - the `{type, data}` [`Record`] envelope
//! - [`records`] - [`RecordStore`], typed access for the layers above

pub mod backend;
pub mod envelope;
pub mod memory;
pub mod records;

pub use backend::{StorageBackend, StorageError, VersionedRecord};
pub use envelope::Record;
pub use memory::InMemoryBackend;
pub use records::{RecordStore, TransactionRepository};
