//! Ownership-scoped front door to a [`JobEngine`].
//!
//! Every dispatched job is attributed to exactly one account. The claim is
//! written atomically before the job reaches the engine, so two callers
//! racing on the same job id cannot both dispatch it. Reads through the
//! dispatcher are owner-checked: a job owned by someone else looks missing.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::{Job, Overrides};
use crate::error::JobError;
use crate::jobs::engine::{JobEngine, JobResult};
use crate::store::RecordStore;
use crate::types::{JobId, OwnerId};

#[derive(Clone)]
pub struct JobDispatcher {
    engine: Arc<dyn JobEngine>,
    store: RecordStore,
}

impl std::fmt::Debug for JobDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDispatcher")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl JobDispatcher {
    pub fn new(engine: Arc<dyn JobEngine>, store: RecordStore) -> Self {
        Self { engine, store }
    }

    pub fn engine(&self) -> &Arc<dyn JobEngine> {
        &self.engine
    }

    /// Builds a pending job for `runner`. Without `valid_until` the job
    /// stays valid for the engine's requeue window.
    pub fn new_runner_job(
        &self,
        description: impl Into<String>,
        runner: impl Into<String>,
        first_task: impl Into<String>,
        args: Vec<Value>,
        overrides: Overrides,
        valid_until: Option<DateTime<Utc>>,
    ) -> Job {
        let valid_until = valid_until.unwrap_or_else(|| self.engine.default_valid_until());
        Job::new(description, runner, first_task, args, overrides, valid_until)
    }

    /// Claims `job` for `owner` and hands it to the engine.
    ///
    /// # Errors
    ///
    /// - [`JobError::UnknownRunner`] before anything is written.
    /// - [`JobError::AlreadyDispatched`] if the id was claimed before, by
    ///   any owner.
    /// - Whatever the engine returns. The claim is released first, so the
    ///   id can be dispatched again.
    pub async fn dispatch(&self, owner: &OwnerId, job: Job) -> Result<JobResult, JobError> {
        if !self.engine.has_runner(&job.runner) {
            return Err(JobError::UnknownRunner { name: job.runner });
        }
        if !self.store.claim_ownership(owner, &job.id).await? {
            tracing::warn!(job_id = %job.id, owner = %owner, "job id already claimed");
            return Err(JobError::AlreadyDispatched { job_id: job.id });
        }
        tracing::info!(
            job_id = %job.id,
            owner = %owner,
            runner = %job.runner,
            description = %job.description,
            "dispatching job"
        );
        let job_id = job.id.clone();
        match self.engine.dispatch(job).await {
            Ok(result) => Ok(result),
            Err(e) => {
                tracing::warn!(
                    job_id = %job_id,
                    owner = %owner,
                    error = %e,
                    "engine rejected job, releasing claim"
                );
                if let Err(release_err) = self.store.release_ownership(owner, &job_id).await {
                    tracing::error!(
                        job_id = %job_id,
                        error = %release_err,
                        "failed to release ownership claim"
                    );
                }
                Err(e)
            },
        }
    }

    /// Reads a job dispatched by `owner`.
    pub async fn job(&self, owner: &OwnerId, job_id: &JobId) -> Result<Job, JobError> {
        self.check_owner(owner, job_id).await?;
        self.engine.job(job_id).await
    }

    /// A result handle for a job dispatched by `owner`.
    pub async fn result(&self, owner: &OwnerId, job_id: &JobId) -> Result<JobResult, JobError> {
        self.check_owner(owner, job_id).await?;
        self.engine.result(job_id).await
    }

    /// Resolves the account that dispatched `job_id`.
    pub async fn job_owner(&self, job_id: &JobId) -> Result<Option<OwnerId>, JobError> {
        Ok(self.store.job_owner(job_id).await?)
    }

    /// Calls `on_finished` with the owner of every job that reaches a
    /// terminal state, until `cancel` fires.
    ///
    /// Jobs without an ownership record (dispatched straight to the engine)
    /// are skipped.
    pub fn watch_finished<F>(&self, cancel: CancellationToken, on_finished: F) -> JoinHandle<()>
    where
        F: Fn(OwnerId, Job) + Send + Sync + 'static,
    {
        let mut rx = self.engine.subscribe_finished();
        let store = self.store.clone();
        tokio::spawn(async move {
            loop {
                let job = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(job) => job,
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "finished-job listener lagged");
                            continue;
                        },
                        Err(RecvError::Closed) => break,
                    },
                };
                match store.job_owner(&job.id).await {
                    Ok(Some(owner)) => on_finished(owner, job),
                    Ok(None) => {},
                    Err(e) => tracing::warn!(
                        job_id = %job.id,
                        error = %e,
                        "cannot resolve owner of finished job"
                    ),
                }
            }
        })
    }

    async fn check_owner(&self, owner: &OwnerId, job_id: &JobId) -> Result<(), JobError> {
        if self.store.has_ownership(owner, job_id).await? {
            return Ok(());
        }
        tracing::warn!(
            job_id = %job_id,
            owner = %owner,
            "job not owned by caller (returning NotFound)"
        );
        Err(JobError::NotFound {
            job_id: job_id.clone(),
        })
    }
}
