//! What a work unit receives and what its caller gets back.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{TaskError, TxError};
use crate::transactions::manager::TxManager;
use crate::types::{OwnerId, Status, TxId};

/// Handle given to a transaction work unit.
///
/// The token is a child of the caller's context: it fires when the caller
/// gives up or when the supervision bound elapses. Work units are expected
/// to watch it; nothing aborts them forcibly.
#[derive(Debug, Clone)]
pub struct WorkUnit {
    owner: OwnerId,
    tx_id: TxId,
    manager: TxManager,
    cancel: CancellationToken,
}

impl WorkUnit {
    pub(crate) fn new(
        owner: OwnerId,
        tx_id: TxId,
        manager: TxManager,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            owner,
            tx_id,
            manager,
            cancel,
        }
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    pub fn tx_id(&self) -> &TxId {
        &self.tx_id
    }

    pub fn manager(&self) -> &TxManager {
        &self.manager
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Shorthand for [`TxManager::update_task_status`] on this transaction.
    pub async fn update_task_status(
        &self,
        status: Status,
        task_name: &str,
        message: impl Into<String>,
    ) -> Result<(), TxError> {
        self.manager
            .update_task_status(&self.owner, &self.tx_id, status, task_name, message)
            .await
    }
}

/// How the coordinator settled a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOutcome {
    /// Fresh transaction, work succeeded: status is now `Success`.
    Succeeded,
    /// Resumed transaction, work succeeded: status left to its tasks.
    Completed,
    /// Work failed: status is now `Failed`.
    Failed { message: String },
    /// Work asked to be retried: status unchanged.
    RetryRequested,
    /// The caller's context closed first: status unchanged.
    ContextClosed,
    /// The supervision bound elapsed: status is now `Failed`.
    TimedOut,
    /// The coordinator went away without settling (runtime shutdown).
    Abandoned,
}

/// Resolves once, after the coordinator has persisted the outcome.
#[derive(Debug)]
pub struct TxDone {
    rx: oneshot::Receiver<TxOutcome>,
}

impl TxDone {
    pub(crate) fn new(rx: oneshot::Receiver<TxOutcome>) -> Self {
        Self { rx }
    }
}

impl Future for TxDone {
    type Output = TxOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(TxOutcome::Abandoned))
    }
}

/// Runs one runner task and records its outcome on a transaction.
///
/// Success sets `task_status[task_name] = Success`, a terminal failure sets
/// it to `Failed`; both append one log entry. [`TaskError::Retryable`] is
/// returned untouched and nothing is written, so the engine can re-enqueue
/// the task without the transaction looking failed.
///
/// A failed status write is logged and does not replace the task's result.
pub async fn track_task<T, Fut>(
    manager: &TxManager,
    owner: &OwnerId,
    tx_id: &TxId,
    task_name: &str,
    task: Fut,
) -> Result<T, TaskError>
where
    Fut: Future<Output = Result<T, TaskError>>,
{
    let result = task.await;
    let record = match &result {
        Ok(_) => Some((Status::Success, format!("{task_name} succeeded"))),
        Err(TaskError::Failed { message }) => Some((Status::Failed, message.clone())),
        Err(TaskError::Retryable) => None,
    };
    if let Some((status, message)) = record {
        if let Err(e) = manager
            .update_task_status(owner, tx_id, status, task_name, message)
            .await
        {
            tracing::error!(
                tx_id = %tx_id,
                task = task_name,
                error = %e,
                "failed to record task status"
            );
        }
    }
    result
}
