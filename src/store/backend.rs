//! Low-level ordered key-value backend trait and supporting types.
//!
//! The [`StorageBackend`] trait is the only contract the record store needs
//! from durable storage: point reads, unconditional writes, two conditional
//! writes ([`put_if_absent`](StorageBackend::put_if_absent) and
//! [`put_if_version`](StorageBackend::put_if_version)), deletes, and ordered
//! prefix scans.
//!
//! Backends are dumb byte stores. Envelope encoding, owner scoping and
//! record-kind checks live in [`RecordStore`](crate::store::RecordStore).
//!
//! # Key Structure
//!
//! Keys are raw byte strings built by concatenation, e.g. `owner || tx_id`
//! for transactions and `jobs_v2_ || owner || job_id` for ownership markers.
//! Fixed-width components make the concatenation unambiguous.
//!
//! # Versioning
//!
//! Each stored record carries a monotonic `u64` version starting at 1 and
//! incremented on every successful write, giving compare-and-swap updates
//! without multi-key transactions.

use std::fmt;

use async_trait::async_trait;

/// A stored value paired with its version number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedRecord {
    /// Serialized envelope bytes.
    pub data: Vec<u8>,
    /// Monotonic version, starting at 1.
    pub version: u64,
}

/// Errors from raw storage operations.
///
/// Keys are rendered as hex so binary owner ids stay printable.
///
/// ```
/// use anchor_jobs::store::backend::StorageError;
///
/// let err = StorageError::AlreadyExists { key: "6a6f6273".to_string() };
/// assert_eq!(err.to_string(), "key already exists: 6a6f6273");
/// ```
#[derive(Debug)]
pub enum StorageError {
    /// The requested key was not found.
    NotFound {
        /// Hex-rendered key.
        key: String,
    },

    /// A [`put_if_absent`](StorageBackend::put_if_absent) found the key
    /// already present.
    AlreadyExists {
        /// Hex-rendered key.
        key: String,
    },

    /// A [`put_if_version`](StorageBackend::put_if_version) found a
    /// different version than expected.
    VersionConflict {
        /// Hex-rendered key.
        key: String,
        /// The version the caller expected.
        expected: u64,
        /// The version found in storage.
        actual: u64,
    },

    /// I/O or engine-specific failure.
    Backend {
        /// Human-readable description.
        message: String,
        /// Underlying error, if any.
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { key } => write!(f, "key not found: {key}"),
            Self::AlreadyExists { key } => write!(f, "key already exists: {key}"),
            Self::VersionConflict {
                key,
                expected,
                actual,
            } => write!(
                f,
                "version conflict on key {key}: expected {expected}, found {actual}"
            ),
            Self::Backend { message, .. } => write!(f, "backend error: {message}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Backend {
                source: Some(src), ..
            } => Some(src.as_ref()),
            _ => None,
        }
    }
}

/// Ordered key-value storage backend.
///
/// Writes are atomic per key; there are no multi-key transactions. The two
/// conditional writes are the only concurrency primitives the layers above
/// rely on.
///
/// Implementations must be `Send + Sync`; the same backend is shared by the
/// transaction manager, the dispatcher and every engine worker.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Reads the value and version stored under `key`.
    ///
    /// # Errors
    ///
    /// - [`StorageError::NotFound`] if the key is absent.
    async fn get(&self, key: &[u8]) -> Result<VersionedRecord, StorageError>;

    /// Writes unconditionally (create or overwrite) and returns the new
    /// version.
    async fn put(&self, key: &[u8], data: &[u8]) -> Result<u64, StorageError>;

    /// Writes only if `key` is absent; the new record gets version 1.
    ///
    /// This is the create-if-absent primitive: of several concurrent
    /// callers exactly one succeeds.
    ///
    /// # Errors
    ///
    /// - [`StorageError::AlreadyExists`] if the key is present.
    async fn put_if_absent(&self, key: &[u8], data: &[u8]) -> Result<u64, StorageError>;

    /// Writes only if the stored version equals `expected_version`.
    ///
    /// # Errors
    ///
    /// - [`StorageError::NotFound`] if the key is absent.
    /// - [`StorageError::VersionConflict`] on version mismatch.
    async fn put_if_version(
        &self,
        key: &[u8],
        data: &[u8],
        expected_version: u64,
    ) -> Result<u64, StorageError>;

    /// Removes `key`. Returns `true` if it existed.
    async fn delete(&self, key: &[u8]) -> Result<bool, StorageError>;

    /// Returns `true` if `key` is present.
    async fn exists(&self, key: &[u8]) -> Result<bool, StorageError> {
        match self.get(key).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Lists every record whose key starts with `prefix`, in key order.
    async fn list_by_prefix(
        &self,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, VersionedRecord)>, StorageError>;
}

/// Concatenates key components.
///
/// ```
/// use anchor_jobs::store::backend::make_key;
///
/// assert_eq!(make_key(&[b"jobs_v2_", b"ab", b"\x01"]), b"jobs_v2_ab\x01".to_vec());
/// ```
pub fn make_key(parts: &[&[u8]]) -> Vec<u8> {
    let len = parts.iter().map(|p| p.len()).sum();
    let mut key = Vec::with_capacity(len);
    for part in parts {
        key.extend_from_slice(part);
    }
    key
}

/// Renders a key for logs and error messages.
///
/// ```
/// use anchor_jobs::store::backend::display_key;
///
/// assert_eq!(display_key(&[0xde, 0xad]), "dead");
/// ```
pub fn display_key(key: &[u8]) -> String {
    hex::encode(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_error_display_version_conflict() {
        let err = StorageError::VersionConflict {
            key: "0102".to_string(),
            expected: 3,
            actual: 5,
        };
        let msg = err.to_string();
        assert!(msg.contains("0102"));
        assert!(msg.contains("expected 3"));
        assert!(msg.contains("found 5"));
    }

    #[test]
    fn storage_error_source_backend_with_source() {
        let inner = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        let err = StorageError::Backend {
            message: "db failed".to_string(),
            source: Some(Box::new(inner)),
        };
        let source = std::error::Error::source(&err);
        assert!(source.is_some_and(|s| s.to_string().contains("timed out")));
    }

    #[test]
    fn storage_error_source_not_found_returns_none() {
        let err = StorageError::NotFound {
            key: "00".to_string(),
        };
        assert!(std::error::Error::source(&err).is_none());
    }

    #[test]
    fn make_key_handles_empty_parts() {
        assert_eq!(make_key(&[]), Vec::<u8>::new());
        assert_eq!(make_key(&[b"", b"a"]), b"a".to_vec());
    }
}
