//! Typed record store over a [`StorageBackend`].
//!
//! [`RecordStore`] owns key construction, envelope (de)serialization, owner
//! scoping and the conditional-write loops. Three record kinds share the
//! backend:
//!
//! | Kind | Key |
//! |---|---|
//! | transaction | `owner (32) || tx_id (16)` |
//! | ownership | `jobs_v2_ || owner (32) || job_id` |
//! | ownership index | `job_owner_ || job_id` |
//! | job | `job_record_ || job_id` |
//!
//! # Owner Isolation
//!
//! A transaction read under the wrong owner reports
//! [`RecordError::TransactionMissing`], exactly like a missing one.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::constants::{JOB_OWNER_PREFIX, JOB_PREFIX, OWNERSHIP_PREFIX};
use crate::domain::{Job, OwnershipRecord, Transaction};
use crate::error::RecordError;
use crate::store::backend::{display_key, make_key, StorageBackend, StorageError};
use crate::store::envelope::Record;
use crate::types::{JobId, OwnerId, TxId, OWNER_ID_LEN};

/// Upper bound on compare-and-swap retries for one logical write.
const MAX_CAS_ATTEMPTS: u32 = 16;

/// Transaction persistence as seen by the transaction manager.
///
/// [`RecordStore`] is the production implementation; tests wrap it to
/// inject failures.
#[async_trait]
pub trait TransactionRepository: Send + Sync {
    /// Reads one transaction scoped to `owner`.
    async fn get_transaction(&self, owner: &OwnerId, id: &TxId) -> Result<Transaction, RecordError>;

    /// Upserts a transaction: create if absent, update otherwise.
    async fn save_transaction(&self, tx: &Transaction) -> Result<(), RecordError>;

    /// Read-modify-write under compare-and-swap; `apply` may run more than
    /// once if another writer interleaves.
    async fn update_transaction(
        &self,
        owner: &OwnerId,
        id: &TxId,
        apply: &(dyn for<'a> Fn(&'a mut Transaction) + Send + Sync),
    ) -> Result<Transaction, RecordError>;

    /// All transactions of one owner, in id order.
    async fn list_transactions(&self, owner: &OwnerId) -> Result<Vec<Transaction>, RecordError>;
}

/// Typed persistence for transactions, ownership markers and jobs.
#[derive(Clone)]
pub struct RecordStore {
    backend: Arc<dyn StorageBackend>,
}

impl fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordStore").finish_non_exhaustive()
    }
}

impl RecordStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// The shared backend.
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Builds `owner || tx_id`.
    ///
    /// # Errors
    ///
    /// [`RecordError::KeyConstructionFailed`] for the Nil id.
    pub fn transaction_key(owner: &OwnerId, id: &TxId) -> Result<Vec<u8>, RecordError> {
        if id.is_nil() {
            return Err(RecordError::KeyConstructionFailed {
                reason: "nil transaction id".to_string(),
            });
        }
        Ok(make_key(&[owner.as_bytes(), id.as_bytes()]))
    }

    fn ownership_key(owner: &OwnerId, job_id: &JobId) -> Vec<u8> {
        make_key(&[OWNERSHIP_PREFIX, owner.as_bytes(), job_id.as_bytes()])
    }

    fn job_owner_key(job_id: &JobId) -> Vec<u8> {
        make_key(&[JOB_OWNER_PREFIX, job_id.as_bytes()])
    }

    fn job_key(job_id: &JobId) -> Vec<u8> {
        make_key(&[JOB_PREFIX, job_id.as_bytes()])
    }

    async fn read_transaction(
        &self,
        owner: &OwnerId,
        id: &TxId,
    ) -> Result<(Transaction, u64), RecordError> {
        let key = Self::transaction_key(owner, id)?;
        let versioned = match self.backend.get(&key).await {
            Ok(v) => v,
            Err(StorageError::NotFound { .. }) => {
                return Err(RecordError::TransactionMissing {
                    owner: *owner,
                    tx_id: *id,
                })
            },
            Err(e) => return Err(e.into()),
        };
        let tx = Record::decode(&versioned.data)?.into_transaction()?;

        // Key is owner-scoped already; check the payload too.
        if tx.owner != *owner || tx.id != *id {
            tracing::warn!(
                tx_id = %id,
                expected_owner = %owner,
                actual_owner = %tx.owner,
                "owner mismatch on transaction read (returning TransactionMissing)"
            );
            return Err(RecordError::TransactionMissing {
                owner: *owner,
                tx_id: *id,
            });
        }
        Ok((tx, versioned.version))
    }

    // ---- Ownership ----

    /// Atomically records that `owner` dispatched `job_id`.
    ///
    /// Returns `Ok(false)` when the job id is already claimed, by this owner
    /// or any other. Claims go through create-if-absent writes only, so two
    /// concurrent claims cannot both succeed.
    pub async fn claim_ownership(
        &self,
        owner: &OwnerId,
        job_id: &JobId,
    ) -> Result<bool, RecordError> {
        let bytes = Record::Ownership(OwnershipRecord::new(*owner, job_id.clone())).encode()?;

        match self
            .backend
            .put_if_absent(&Self::job_owner_key(job_id), &bytes)
            .await
        {
            Ok(_) => {},
            Err(StorageError::AlreadyExists { .. }) => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        match self
            .backend
            .put_if_absent(&Self::ownership_key(owner, job_id), &bytes)
            .await
        {
            Ok(_) => Ok(true),
            Err(StorageError::AlreadyExists { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes both ownership keys written by [`claim_ownership`].
    ///
    /// Only for claims whose job never reached the engine.
    ///
    /// [`claim_ownership`]: Self::claim_ownership
    pub async fn release_ownership(
        &self,
        owner: &OwnerId,
        job_id: &JobId,
    ) -> Result<(), RecordError> {
        self.backend
            .delete(&Self::ownership_key(owner, job_id))
            .await?;
        self.backend.delete(&Self::job_owner_key(job_id)).await?;
        Ok(())
    }

    /// Returns `true` if `(owner, job_id)` has an ownership record.
    pub async fn has_ownership(&self, owner: &OwnerId, job_id: &JobId) -> Result<bool, RecordError> {
        Ok(self
            .backend
            .exists(&Self::ownership_key(owner, job_id))
            .await?)
    }

    /// Resolves the account that dispatched `job_id`, if any.
    pub async fn job_owner(&self, job_id: &JobId) -> Result<Option<OwnerId>, RecordError> {
        match self.backend.get(&Self::job_owner_key(job_id)).await {
            Ok(versioned) => {
                let record = Record::decode(&versioned.data)?.into_ownership()?;
                Ok(Some(record.owner))
            },
            Err(StorageError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // ---- Jobs ----

    /// Persists a new job. Fails with a storage `AlreadyExists` if the id is
    /// taken.
    pub async fn create_job(&self, job: &Job) -> Result<(), RecordError> {
        let bytes = Record::Job(job.clone()).encode()?;
        self.backend
            .put_if_absent(&Self::job_key(&job.id), &bytes)
            .await?;
        Ok(())
    }

    /// Overwrites a job record. Only the worker holding the job writes it.
    pub async fn save_job(&self, job: &Job) -> Result<(), RecordError> {
        let bytes = Record::Job(job.clone()).encode()?;
        self.backend.put(&Self::job_key(&job.id), &bytes).await?;
        Ok(())
    }

    /// Deletes a job record. Returns `false` if there was none.
    pub async fn delete_job(&self, job_id: &JobId) -> Result<bool, RecordError> {
        Ok(self.backend.delete(&Self::job_key(job_id)).await?)
    }

    pub async fn get_job(&self, job_id: &JobId) -> Result<Job, RecordError> {
        match self.backend.get(&Self::job_key(job_id)).await {
            Ok(versioned) => Record::decode(&versioned.data)?.into_job(),
            Err(StorageError::NotFound { .. }) => Err(RecordError::JobMissing {
                job_id: job_id.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Every persisted job, in id order. Undecodable entries are skipped.
    pub async fn list_jobs(&self) -> Result<Vec<Job>, RecordError> {
        let entries = self.backend.list_by_prefix(JOB_PREFIX).await?;
        let mut jobs = Vec::with_capacity(entries.len());
        for (key, versioned) in entries {
            match Record::decode(&versioned.data).and_then(Record::into_job) {
                Ok(job) => jobs.push(job),
                Err(e) => tracing::warn!(
                    key = %display_key(&key),
                    error = %e,
                    "skipping undecodable job record"
                ),
            }
        }
        Ok(jobs)
    }
}

#[async_trait]
impl TransactionRepository for RecordStore {
    async fn get_transaction(&self, owner: &OwnerId, id: &TxId) -> Result<Transaction, RecordError> {
        self.read_transaction(owner, id).await.map(|(tx, _)| tx)
    }

    async fn save_transaction(&self, tx: &Transaction) -> Result<(), RecordError> {
        let key = Self::transaction_key(&tx.owner, &tx.id)?;
        let bytes = Record::Transaction(tx.clone()).encode()?;

        for _ in 0..MAX_CAS_ATTEMPTS {
            match self.backend.get(&key).await {
                Ok(existing) => {
                    match self
                        .backend
                        .put_if_version(&key, &bytes, existing.version)
                        .await
                    {
                        Ok(_) => return Ok(()),
                        Err(StorageError::VersionConflict { .. }) => continue,
                        Err(e) => return Err(e.into()),
                    }
                },
                Err(StorageError::NotFound { .. }) => {
                    match self.backend.put_if_absent(&key, &bytes).await {
                        Ok(_) => return Ok(()),
                        Err(StorageError::AlreadyExists { .. }) => continue,
                        Err(e) => return Err(e.into()),
                    }
                },
                Err(e) => return Err(e.into()),
            }
        }
        Err(RecordError::Contended {
            key: display_key(&key),
            attempts: MAX_CAS_ATTEMPTS,
        })
    }

    async fn update_transaction(
        &self,
        owner: &OwnerId,
        id: &TxId,
        apply: &(dyn for<'a> Fn(&'a mut Transaction) + Send + Sync),
    ) -> Result<Transaction, RecordError> {
        let key = Self::transaction_key(owner, id)?;
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let (mut tx, version) = self.read_transaction(owner, id).await?;
            apply(&mut tx);
            let bytes = Record::Transaction(tx.clone()).encode()?;
            match self.backend.put_if_version(&key, &bytes, version).await {
                Ok(_) => return Ok(tx),
                Err(StorageError::VersionConflict { .. }) => {
                    tracing::debug!(tx_id = %id, attempt, "transaction update raced, retrying");
                },
                Err(e) => return Err(e.into()),
            }
        }
        Err(RecordError::Contended {
            key: display_key(&key),
            attempts: MAX_CAS_ATTEMPTS,
        })
    }

    async fn list_transactions(&self, owner: &OwnerId) -> Result<Vec<Transaction>, RecordError> {
        let entries = self.backend.list_by_prefix(owner.as_bytes()).await?;
        let mut txs = Vec::new();
        for (key, versioned) in entries {
            if key.len() != OWNER_ID_LEN + 16 {
                continue;
            }
            match Record::decode(&versioned.data).and_then(Record::into_transaction) {
                Ok(tx) if tx.owner == *owner => txs.push(tx),
                Ok(_) => {},
                Err(e) => tracing::warn!(
                    key = %display_key(&key),
                    error = %e,
                    "skipping undecodable transaction record"
                ),
            }
        }
        Ok(txs)
    }
}
