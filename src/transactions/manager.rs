//! The transaction manager.
//!
//! [`TxManager::execute_within_tx`] is the entry point for tracked
//! asynchronous work. It creates (or resumes) a [`Transaction`], spawns the
//! work unit and a coordinator on the manager's [`TaskTracker`], and returns
//! immediately with the transaction id and a [`TxDone`] future.
//!
//! The coordinator races three things:
//!
//! 1. the work unit's result,
//! 2. the caller's [`CancellationToken`],
//! 3. the optional supervision bound from [`OrchestratorConfig`].
//!
//! | Winner | Status | Log |
//! |---|---|---|
//! | `Ok(())`, fresh transaction | `Success` | none |
//! | `Ok(())`, resumed transaction | unchanged | none |
//! | `Err(Failed)` | `Failed` | `manager[<desc>]`: error text |
//! | `Err(Retryable)` | unchanged | `manager[<desc>]`: retry requested |
//! | context closed | unchanged | `context closed` |
//! | supervision bound | `Failed` | `supervision timeout` |
//!
//! A cancelled context never aborts the work unit. Its token (a child of
//! the caller's) is cancelled, and it is up to the work unit to notice.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::OrchestratorConfig;
use crate::constants::{manager_task_name, CONTEXT_CLOSED, RETRY_REQUESTED, SUPERVISION_TIMEOUT};
use crate::domain::Transaction;
use crate::error::{ErrorKind, TaskError, TxError};
use crate::store::TransactionRepository;
use crate::transactions::work::{TxDone, TxOutcome, WorkUnit};
use crate::types::{OwnerId, Status, StatusResponse, TxId};
use crate::watch::StatusWatcher;

struct Inner {
    repo: Arc<dyn TransactionRepository>,
    watcher: StatusWatcher,
    config: OrchestratorConfig,
    tracker: TaskTracker,
}

/// Tracks asynchronous work as persisted, per-account transactions.
///
/// Cheap to clone; clones share the repository, watcher and task tracker.
#[derive(Clone)]
pub struct TxManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for TxManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxManager")
            .field("config", &self.inner.config)
            .field("watched", &self.inner.watcher.watched())
            .finish_non_exhaustive()
    }
}

impl TxManager {
    pub fn new(repo: Arc<dyn TransactionRepository>, config: OrchestratorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                repo,
                watcher: StatusWatcher::new(),
                config,
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Default task/confirmation timeout from configuration.
    pub fn default_task_timeout(&self) -> Duration {
        self.inner.config.task_timeout()
    }

    /// Creates and persists a fresh pending transaction.
    pub async fn create_transaction(
        &self,
        owner: OwnerId,
        description: impl Into<String>,
    ) -> Result<Transaction, TxError> {
        let tx = Transaction::new(owner, description);
        self.inner.repo.save_transaction(&tx).await?;
        tracing::debug!(tx_id = %tx.id, owner = %owner, "transaction created");
        Ok(tx)
    }

    /// Runs `work` under a tracked transaction.
    ///
    /// With a Nil `existing` id a fresh transaction is created. Otherwise
    /// the existing one is resumed, or a fresh one is created if it cannot
    /// be found. Only a transaction created by this call is moved to
    /// `Success` automatically.
    ///
    /// # Errors
    ///
    /// Only setup failures (the initial read or create) are returned here.
    /// Everything after the spawn is persisted on the transaction.
    pub async fn execute_within_tx<F, Fut>(
        &self,
        ctx: &CancellationToken,
        owner: OwnerId,
        existing: TxId,
        description: impl Into<String>,
        work: F,
    ) -> Result<(TxId, TxDone), TxError>
    where
        F: FnOnce(WorkUnit) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        let description = description.into();
        let (tx, fresh) = if existing.is_nil() {
            (self.create_transaction(owner, description.clone()).await?, true)
        } else {
            match self.inner.repo.get_transaction(&owner, &existing).await {
                Ok(tx) => (tx, false),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    tracing::warn!(
                        tx_id = %existing,
                        owner = %owner,
                        "existing transaction not found, starting a new one"
                    );
                    (self.create_transaction(owner, description.clone()).await?, true)
                },
                Err(e) => return Err(e.into()),
            }
        };

        let work_token = ctx.child_token();
        let unit = WorkUnit::new(owner, tx.id, self.clone(), work_token.clone());
        let handle = self.inner.tracker.spawn(work(unit));

        let (done_tx, done_rx) = oneshot::channel();
        let coordinator = Coordinator {
            manager: self.clone(),
            owner,
            tx_id: tx.id,
            description: tx.description,
            fresh,
            ctx: ctx.clone(),
            work_token,
            supervision: self.inner.config.supervision_timeout(),
        };
        self.inner.tracker.spawn(coordinator.run(handle, done_tx));

        Ok((tx.id, TxDone::new(done_rx)))
    }

    /// Overwrites `task_status[task_name]` and appends one log entry.
    ///
    /// The write is a compare-and-swap loop, so concurrent callers on the
    /// same transaction do not lose each other's entries.
    pub async fn update_task_status(
        &self,
        owner: &OwnerId,
        tx_id: &TxId,
        status: Status,
        task_name: &str,
        message: impl Into<String>,
    ) -> Result<(), TxError> {
        let message = message.into();
        self.inner
            .repo
            .update_transaction(owner, tx_id, &|tx: &mut Transaction| {
                tx.record_task(task_name, status, message.clone());
            })
            .await?;
        tracing::debug!(tx_id = %tx_id, task = task_name, status = %status, "task status updated");
        Ok(())
    }

    /// Stores a value captured from chain events on the transaction.
    pub async fn update_transaction_with_value(
        &self,
        owner: &OwnerId,
        tx_id: &TxId,
        key: &str,
        key_idx: u64,
        value: Vec<u8>,
    ) -> Result<(), TxError> {
        self.inner
            .repo
            .update_transaction(owner, tx_id, &|tx: &mut Transaction| {
                tx.set_value(key, key_idx, value.clone());
            })
            .await?;
        Ok(())
    }

    pub async fn get_transaction(
        &self,
        owner: &OwnerId,
        tx_id: &TxId,
    ) -> Result<Transaction, TxError> {
        Ok(self.inner.repo.get_transaction(owner, tx_id).await?)
    }

    pub async fn get_transaction_status(
        &self,
        owner: &OwnerId,
        tx_id: &TxId,
    ) -> Result<StatusResponse, TxError> {
        Ok(self.get_transaction(owner, tx_id).await?.status_response())
    }

    /// All transactions recorded for `owner`.
    pub async fn list_transactions(&self, owner: &OwnerId) -> Result<Vec<Transaction>, TxError> {
        Ok(self.inner.repo.list_transactions(owner).await?)
    }

    /// Waits until the transaction leaves `Pending`.
    ///
    /// Reads the persisted status first, so a transaction settled before a
    /// restart returns at once; otherwise sleeps until the coordinator
    /// publishes a change.
    ///
    /// # Errors
    ///
    /// - [`TxError::Failed`] with the last log message if the transaction failed.
    /// - A not-found [`TxError::Record`] for unknown or foreign transactions.
    pub async fn wait_for_transaction(&self, owner: &OwnerId, tx_id: &TxId) -> Result<(), TxError> {
        let watcher = &self.inner.watcher;
        let mut rx = watcher.subscribe(*tx_id);
        let result = loop {
            let tx = match self.get_transaction(owner, tx_id).await {
                Ok(tx) => tx,
                Err(e) => break Err(e),
            };
            match tx.status {
                Status::Success => break Ok(()),
                Status::Failed => {
                    break Err(TxError::Failed {
                        tx_id: *tx_id,
                        message: tx.last_log().map(|l| l.message.clone()).unwrap_or_default(),
                    })
                },
                Status::Pending => {},
            }
            if rx.changed().await.is_err() {
                rx = watcher.subscribe(*tx_id);
            }
        };
        drop(rx);
        watcher.release(tx_id);
        result
    }

    /// Stops accepting work and waits for every spawned work unit and
    /// coordinator to finish.
    pub async fn shutdown(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }

    /// Applies `apply` and, if the meta-status changed, wakes waiters.
    async fn settle(
        &self,
        owner: &OwnerId,
        tx_id: &TxId,
        apply: &(dyn for<'a> Fn(&'a mut Transaction) + Send + Sync),
    ) -> Result<(), TxError> {
        let tx = self
            .inner
            .repo
            .update_transaction(owner, tx_id, apply)
            .await?;
        if tx.status.is_terminal() {
            self.inner.watcher.publish(tx_id, tx.status);
        }
        Ok(())
    }
}

struct Coordinator {
    manager: TxManager,
    owner: OwnerId,
    tx_id: TxId,
    description: String,
    fresh: bool,
    ctx: CancellationToken,
    work_token: CancellationToken,
    supervision: Option<Duration>,
}

impl Coordinator {
    async fn run(
        self,
        mut handle: JoinHandle<Result<(), TaskError>>,
        done: oneshot::Sender<TxOutcome>,
    ) {
        let supervision = self.supervision;
        let bound = async move {
            match supervision {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        let outcome = tokio::select! {
            biased;
            joined = &mut handle => match joined {
                Ok(Ok(())) if self.fresh => TxOutcome::Succeeded,
                Ok(Ok(())) => TxOutcome::Completed,
                Ok(Err(TaskError::Retryable)) => TxOutcome::RetryRequested,
                Ok(Err(TaskError::Failed { message })) => TxOutcome::Failed { message },
                Err(join_err) => TxOutcome::Failed {
                    message: format!("work unit aborted: {join_err}"),
                },
            },
            _ = self.ctx.cancelled() => TxOutcome::ContextClosed,
            _ = bound => {
                self.work_token.cancel();
                TxOutcome::TimedOut
            },
        };

        if let Err(e) = self.persist(&outcome).await {
            tracing::error!(
                tx_id = %self.tx_id,
                owner = %self.owner,
                error = %e,
                "failed to persist transaction outcome"
            );
        }
        // The caller may have dropped its TxDone.
        let _ = done.send(outcome);
    }

    async fn persist(&self, outcome: &TxOutcome) -> Result<(), TxError> {
        let manager_task = manager_task_name(&self.description);
        match outcome {
            TxOutcome::Succeeded => {
                tracing::debug!(tx_id = %self.tx_id, "transaction succeeded");
                self.manager
                    .settle(&self.owner, &self.tx_id, &|tx: &mut Transaction| {
                        tx.status = Status::Success;
                    })
                    .await
            },
            TxOutcome::Completed | TxOutcome::Abandoned => Ok(()),
            TxOutcome::Failed { message } => {
                tracing::debug!(tx_id = %self.tx_id, error = %message, "transaction failed");
                self.manager
                    .settle(&self.owner, &self.tx_id, &|tx: &mut Transaction| {
                        tx.status = Status::Failed;
                        tx.record_task(&manager_task, Status::Failed, message.clone());
                    })
                    .await
            },
            TxOutcome::RetryRequested => {
                self.manager
                    .settle(&self.owner, &self.tx_id, &|tx: &mut Transaction| {
                        tx.append_log(&manager_task, RETRY_REQUESTED);
                    })
                    .await
            },
            TxOutcome::ContextClosed => {
                let message = format!(
                    "Transaction {} for account {} with description \"{}\" is stopped because of context close",
                    self.tx_id, self.owner, self.description
                );
                tracing::warn!(tx_id = %self.tx_id, owner = %self.owner, "{message}");
                self.manager
                    .settle(&self.owner, &self.tx_id, &|tx: &mut Transaction| {
                        tx.append_log(CONTEXT_CLOSED, message.clone());
                    })
                    .await
            },
            TxOutcome::TimedOut => {
                let message = format!(
                    "work unit still running after {:?}, marked failed",
                    self.supervision.unwrap_or_default()
                );
                tracing::warn!(tx_id = %self.tx_id, owner = %self.owner, "{message}");
                self.manager
                    .settle(&self.owner, &self.tx_id, &|tx: &mut Transaction| {
                        tx.status = Status::Failed;
                        tx.task_status.insert(manager_task.clone(), Status::Failed);
                        tx.append_log(SUPERVISION_TIMEOUT, message.clone());
                    })
                    .await
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryBackend, RecordStore};
    use pretty_assertions::assert_eq;

    fn test_manager() -> TxManager {
        let store = RecordStore::new(Arc::new(InMemoryBackend::new()));
        TxManager::new(Arc::new(store), OrchestratorConfig::default())
    }

    fn owner() -> OwnerId {
        OwnerId::new([0x42; 32])
    }

    #[tokio::test]
    async fn default_task_timeout_comes_from_config() {
        let store = RecordStore::new(Arc::new(InMemoryBackend::new()));
        let config = OrchestratorConfig {
            task_timeout_ms: 1234,
            ..OrchestratorConfig::default()
        };
        let manager = TxManager::new(Arc::new(store), config);
        assert_eq!(manager.default_task_timeout(), Duration::from_millis(1234));
    }

    #[tokio::test]
    async fn retry_request_leaves_status_pending() {
        let manager = test_manager();
        let ctx = CancellationToken::new();
        let (tx_id, done) = manager
            .execute_within_tx(&ctx, owner(), TxId::nil(), "anchor", |_unit| async {
                Err::<(), _>(TaskError::Retryable)
            })
            .await
            .unwrap();
        assert_eq!(done.await, TxOutcome::RetryRequested);

        let tx = manager.get_transaction(&owner(), &tx_id).await.unwrap();
        assert_eq!(tx.status, Status::Pending);
        assert_eq!(tx.logs.len(), 1);
        assert_eq!(tx.logs[0].task_name, "manager[anchor]");
        assert_eq!(tx.logs[0].message, RETRY_REQUESTED);
        assert!(tx.task_status.is_empty());
    }

    #[tokio::test]
    async fn panicking_work_unit_marks_failed() {
        let manager = test_manager();
        let ctx = CancellationToken::new();
        let (tx_id, done) = manager
            .execute_within_tx(&ctx, owner(), TxId::nil(), "anchor", |unit| async move {
                if !unit.is_cancelled() {
                    panic!("boom");
                }
                Ok::<_, TaskError>(())
            })
            .await
            .unwrap();
        assert!(matches!(done.await, TxOutcome::Failed { .. }));
        let tx = manager.get_transaction(&owner(), &tx_id).await.unwrap();
        assert_eq!(tx.status, Status::Failed);
    }

    #[tokio::test]
    async fn update_with_value_is_persisted() {
        let manager = test_manager();
        let tx = manager.create_transaction(owner(), "identity").await.unwrap();
        manager
            .update_transaction_with_value(&owner(), &tx.id, "identity", 1, vec![0xab])
            .await
            .unwrap();
        let stored = manager.get_transaction(&owner(), &tx.id).await.unwrap();
        assert_eq!(stored.values["identity"].value, vec![0xab]);
        assert_eq!(stored.values["identity"].key_idx, 1);
    }

    #[tokio::test]
    async fn shutdown_waits_for_work_units() {
        let manager = test_manager();
        let ctx = CancellationToken::new();
        let (tx_id, _done) = manager
            .execute_within_tx(&ctx, owner(), TxId::nil(), "slow", |_unit| async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<_, TaskError>(())
            })
            .await
            .unwrap();
        manager.shutdown().await;
        let tx = manager.get_transaction(&owner(), &tx_id).await.unwrap();
        assert_eq!(tx.status, Status::Success);
    }
}
