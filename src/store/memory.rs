//! In-memory ordered storage backend.
//!
//! [`InMemoryBackend`] keeps records in a `BTreeMap` behind a
//! `parking_lot::RwLock`, so prefix scans come back in key order like they
//! would from an LSM store. Conditional writes check and write under the
//! same write lock, which makes them atomic.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use anchor_jobs::store::{InMemoryBackend, RecordStore};
//!
//! let backend = Arc::new(InMemoryBackend::new());
//! let store = RecordStore::new(backend.clone());
//! assert!(backend.is_empty());
//! ```

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::store::backend::{display_key, StorageBackend, StorageError, VersionedRecord};

/// Thread-safe in-memory backend with no domain logic.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    data: RwLock<BTreeMap<Vec<u8>, (Vec<u8>, u64)>>,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Returns `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    async fn get(&self, key: &[u8]) -> Result<VersionedRecord, StorageError> {
        let data = self.data.read();
        let (bytes, version) = data.get(key).ok_or_else(|| StorageError::NotFound {
            key: display_key(key),
        })?;
        Ok(VersionedRecord {
            data: bytes.clone(),
            version: *version,
        })
    }

    async fn put(&self, key: &[u8], data: &[u8]) -> Result<u64, StorageError> {
        let mut map = self.data.write();
        let version = map.get(key).map_or(1, |(_, v)| v + 1);
        map.insert(key.to_vec(), (data.to_vec(), version));
        Ok(version)
    }

    async fn put_if_absent(&self, key: &[u8], data: &[u8]) -> Result<u64, StorageError> {
        let mut map = self.data.write();
        if map.contains_key(key) {
            return Err(StorageError::AlreadyExists {
                key: display_key(key),
            });
        }
        map.insert(key.to_vec(), (data.to_vec(), 1));
        Ok(1)
    }

    async fn put_if_version(
        &self,
        key: &[u8],
        data: &[u8],
        expected_version: u64,
    ) -> Result<u64, StorageError> {
        let mut map = self.data.write();
        let entry = map.get_mut(key).ok_or_else(|| StorageError::NotFound {
            key: display_key(key),
        })?;
        if entry.1 != expected_version {
            return Err(StorageError::VersionConflict {
                key: display_key(key),
                expected: expected_version,
                actual: entry.1,
            });
        }
        let new_version = entry.1 + 1;
        *entry = (data.to_vec(), new_version);
        Ok(new_version)
    }

    async fn delete(&self, key: &[u8]) -> Result<bool, StorageError> {
        Ok(self.data.write().remove(key).is_some())
    }

    async fn exists(&self, key: &[u8]) -> Result<bool, StorageError> {
        Ok(self.data.read().contains_key(key))
    }

    async fn list_by_prefix(
        &self,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, VersionedRecord)>, StorageError> {
        let data = self.data.read();
        let results = data
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, (bytes, version))| {
                (
                    key.clone(),
                    VersionedRecord {
                        data: bytes.clone(),
                        version: *version,
                    },
                )
            })
            .collect();
        Ok(results)
    }
}
