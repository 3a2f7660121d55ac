//! Local queue engine: a worker pool draining a job queue.
//!
//! Jobs are persisted in the [`RecordStore`] before they are enqueued, and
//! every task transition is written back, so [`LocalJobEngine::start`] can
//! pick up whatever a previous process left unfinished.
//!
//! # Task Loop
//!
//! A worker loads the job, instantiates a fresh runner and executes
//! `current_task`:
//!
//! - `Ok` moves to the runner's next task, or finishes the job.
//! - [`TaskError::Retryable`] parks the job as `Pending` and re-enqueues it
//!   after `retry_delay`, unless it is past `valid_until`.
//! - [`TaskError::Failed`] finishes the job as `Failed`.
//!
//! Every execution is recorded in [`Job::attempts`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::OrchestratorConfig;
use crate::domain::{AttemptOutcome, Job, JobState, Overrides};
use crate::error::{ErrorKind, JobError, RecordError, TaskError};
use crate::jobs::runner::{ChainRunner, RunnerRegistry};
use crate::store::RecordStore;
use crate::types::JobId;
use crate::watch::JobWatcher;

/// Capacity of the finished-job broadcast; slow listeners see `Lagged`.
const FINISHED_CAPACITY: usize = 256;

/// A queue engine that executes jobs with registered runners.
#[async_trait]
pub trait JobEngine: Send + Sync {
    /// Persists `job` and enqueues it.
    ///
    /// # Errors
    ///
    /// - [`JobError::UnknownRunner`] if no runner is registered for it.
    /// - [`JobError::AlreadyDispatched`] if the job id is taken.
    /// - [`JobError::EngineStopped`] after shutdown.
    async fn dispatch(&self, job: Job) -> Result<JobResult, JobError>;

    /// Reads the current job record.
    async fn job(&self, job_id: &JobId) -> Result<Job, JobError>;

    /// A result handle for an already dispatched job.
    async fn result(&self, job_id: &JobId) -> Result<JobResult, JobError>;

    fn has_runner(&self, name: &str) -> bool;

    /// Stream of jobs as they reach a terminal state.
    fn subscribe_finished(&self) -> broadcast::Receiver<Job>;

    /// Validity deadline for a job dispatched now without an explicit one.
    fn default_valid_until(&self) -> DateTime<Utc>;
}

/// Handle for awaiting the outcome of one job.
///
/// Dropping the handle, awaited or not, releases its watch channel.
#[derive(Debug)]
pub struct JobResult {
    job_id: JobId,
    rx: Option<watch::Receiver<JobState>>,
    store: RecordStore,
    watcher: Arc<JobWatcher>,
    engine_cancel: CancellationToken,
}

impl JobResult {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Waits until the job finishes and returns the last task's value.
    ///
    /// # Errors
    ///
    /// - [`JobError::Failed`] with the job's error text.
    /// - [`JobError::AwaitCancelled`] when `ctx` fires first.
    /// - [`JobError::EngineStopped`] when the engine shuts down first.
    pub async fn await_result(mut self, ctx: &CancellationToken) -> Result<Value, JobError> {
        loop {
            let job = match self.store.get_job(&self.job_id).await {
                Ok(job) => job,
                Err(e) => break Err(job_error(e)),
            };
            match job.state {
                JobState::Succeeded => break Ok(job.result.unwrap_or(Value::Null)),
                JobState::Failed => {
                    break Err(JobError::Failed {
                        job_id: job.id,
                        message: job.error.unwrap_or_default(),
                    })
                },
                JobState::Pending | JobState::Running => {},
            }
            let rx = self
                .rx
                .get_or_insert_with(|| self.watcher.subscribe(self.job_id.clone()));
            tokio::select! {
                biased;
                _ = ctx.cancelled() => {
                    break Err(JobError::AwaitCancelled { job_id: self.job_id.clone() });
                },
                _ = self.engine_cancel.cancelled() => break Err(JobError::EngineStopped),
                changed = rx.changed() => {
                    // A terminal publish drops the sender; subscribe again
                    // before the next read.
                    if changed.is_err() {
                        self.rx = Some(self.watcher.subscribe(self.job_id.clone()));
                    }
                },
            }
        }
    }
}

impl Drop for JobResult {
    fn drop(&mut self) {
        self.rx.take();
        self.watcher.release(&self.job_id);
    }
}

fn job_error(err: RecordError) -> JobError {
    match err {
        RecordError::JobMissing { job_id } => JobError::NotFound { job_id },
        other => JobError::Record(other),
    }
}

fn expired(job: &Job) -> JobError {
    JobError::Expired {
        job_id: job.id.clone(),
        valid_until: job.valid_until,
    }
}

struct EngineInner {
    store: RecordStore,
    registry: RunnerRegistry,
    config: OrchestratorConfig,
    queue_tx: mpsc::UnboundedSender<JobId>,
    queue_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<JobId>>>,
    /// Ids sitting in the queue; an id is never queued twice.
    queued: DashSet<JobId>,
    watcher: Arc<JobWatcher>,
    finished: broadcast::Sender<Job>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

/// In-process [`JobEngine`] backed by a [`RecordStore`].
///
/// Cheap to clone. Dispatching before [`start`](Self::start) is allowed;
/// the jobs wait in the queue.
#[derive(Clone)]
pub struct LocalJobEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for LocalJobEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalJobEngine")
            .field("registry", &self.inner.registry)
            .field("workers", &self.inner.config.worker_count)
            .field("stopped", &self.inner.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl LocalJobEngine {
    pub fn new(store: RecordStore, config: OrchestratorConfig) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (finished, _) = broadcast::channel(FINISHED_CAPACITY);
        Self {
            inner: Arc::new(EngineInner {
                store,
                registry: RunnerRegistry::new(),
                config,
                queue_tx,
                queue_rx: parking_lot::Mutex::new(Some(queue_rx)),
                queued: DashSet::new(),
                watcher: Arc::new(JobWatcher::new()),
                finished,
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub fn registry(&self) -> &RunnerRegistry {
        &self.inner.registry
    }

    pub fn store(&self) -> &RecordStore {
        &self.inner.store
    }

    /// Registers a chained runner. Returns `false` if `name` is taken.
    pub fn register_runner<R, F>(&self, name: impl Into<String>, factory: F) -> bool
    where
        R: ChainRunner + 'static,
        F: Fn() -> R + Send + Sync + 'static,
    {
        self.inner.registry.register_runner(name, factory)
    }

    /// Registers a single-task runner. Returns `false` if `name` is taken.
    pub fn register_runner_fn<F, Fut>(&self, name: impl Into<String>, f: F) -> bool
    where
        F: Fn(Vec<Value>, Overrides) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        self.inner.registry.register_runner_fn(name, f)
    }

    /// Recovers unfinished jobs and spawns the worker pool.
    ///
    /// Jobs left `Running` by a previous process are reset to `Pending` and
    /// re-enqueued along with every other non-terminal job. Jobs dispatched
    /// to this engine before `start` are already queued and are not counted.
    /// Returns the number of recovered jobs. Calling it twice is a no-op.
    pub async fn start(&self) -> Result<usize, JobError> {
        let Some(queue_rx) = self.inner.queue_rx.lock().take() else {
            tracing::warn!("job engine already started");
            return Ok(0);
        };

        let mut unfinished: Vec<Job> = self
            .inner
            .store
            .list_jobs()
            .await?
            .into_iter()
            .filter(|job| !job.state.is_terminal() && !self.inner.queued.contains(&job.id))
            .collect();
        for job in unfinished.iter_mut() {
            if job.state == JobState::Running {
                job.state = JobState::Pending;
            }
        }
        futures::future::try_join_all(unfinished.iter().map(|job| self.inner.store.save_job(job)))
            .await?;

        let mut recovered = 0;
        for job in unfinished {
            tracing::info!(
                job_id = %job.id,
                runner = %job.runner,
                task = %job.current_task,
                "recovering unfinished job"
            );
            if self.inner.enqueue(job.id)? {
                recovered += 1;
            }
        }

        let queue = Arc::new(tokio::sync::Mutex::new(queue_rx));
        let workers = self.inner.config.worker_count.max(1);
        for worker_id in 0..workers {
            let inner = self.inner.clone();
            let queue = queue.clone();
            self.inner
                .tracker
                .spawn(async move { worker_loop(worker_id, inner, queue).await });
        }
        tracing::info!(workers, recovered, "job engine started");
        Ok(recovered)
    }

    /// Stops the workers and waits for in-flight tasks to return.
    ///
    /// Jobs still queued stay `Pending` in the store for the next start.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        tracing::info!("job engine stopped");
    }

    fn result_handle(&self, job_id: JobId) -> JobResult {
        JobResult {
            rx: Some(self.inner.watcher.subscribe(job_id.clone())),
            job_id,
            store: self.inner.store.clone(),
            watcher: self.inner.watcher.clone(),
            engine_cancel: self.inner.cancel.clone(),
        }
    }
}

#[async_trait]
impl JobEngine for LocalJobEngine {
    async fn dispatch(&self, job: Job) -> Result<JobResult, JobError> {
        if self.inner.cancel.is_cancelled() {
            return Err(JobError::EngineStopped);
        }
        if !self.inner.registry.contains(&job.runner) {
            return Err(JobError::UnknownRunner { name: job.runner });
        }
        match self.inner.store.create_job(&job).await {
            Ok(()) => {},
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(JobError::AlreadyDispatched { job_id: job.id })
            },
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = self.inner.enqueue(job.id.clone()) {
            if let Err(delete_err) = self.inner.store.delete_job(&job.id).await {
                tracing::error!(
                    job_id = %job.id,
                    error = %delete_err,
                    "failed to drop unqueued job"
                );
            }
            return Err(e);
        }
        let result = self.result_handle(job.id.clone());
        tracing::debug!(job_id = %job.id, runner = %job.runner, "job enqueued");
        Ok(result)
    }

    async fn job(&self, job_id: &JobId) -> Result<Job, JobError> {
        self.inner.store.get_job(job_id).await.map_err(job_error)
    }

    async fn result(&self, job_id: &JobId) -> Result<JobResult, JobError> {
        self.job(job_id).await?;
        Ok(self.result_handle(job_id.clone()))
    }

    fn has_runner(&self, name: &str) -> bool {
        self.inner.registry.contains(name)
    }

    fn subscribe_finished(&self) -> broadcast::Receiver<Job> {
        self.inner.finished.subscribe()
    }

    fn default_valid_until(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.inner.config.requeue_timeout())
            .ok()
            .and_then(|window| Utc::now().checked_add_signed(window))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

async fn worker_loop(
    worker_id: usize,
    inner: Arc<EngineInner>,
    queue: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<JobId>>>,
) {
    loop {
        let next = {
            let mut rx = queue.lock().await;
            tokio::select! {
                biased;
                _ = inner.cancel.cancelled() => None,
                id = rx.recv() => id,
            }
        };
        let Some(job_id) = next else {
            break;
        };
        inner.queued.remove(&job_id);

        // Run on its own task so a panicking runner only takes down this job.
        let handle = tokio::spawn(inner.clone().execute(job_id.clone()));
        if let Err(join_err) = handle.await {
            tracing::error!(worker_id, job_id = %job_id, error = %join_err, "runner panicked");
            inner.abort_job(&job_id, format!("runner panicked: {join_err}")).await;
        }
    }
    tracing::debug!(worker_id, "worker stopped");
}

impl EngineInner {
    async fn execute(self: Arc<Self>, job_id: JobId) {
        if let Err(e) = self.drive(&job_id).await {
            tracing::error!(job_id = %job_id, error = %e, "job execution aborted");
            self.abort_job(&job_id, format!("job execution aborted: {e}")).await;
        }
    }

    /// Puts `job_id` on the queue unless it is already waiting there.
    /// Returns `false` for an id that was already queued.
    fn enqueue(&self, job_id: JobId) -> Result<bool, JobError> {
        if !self.queued.insert(job_id.clone()) {
            tracing::debug!(job_id = %job_id, "job already queued");
            return Ok(false);
        }
        if self.queue_tx.send(job_id.clone()).is_err() {
            self.queued.remove(&job_id);
            return Err(JobError::EngineStopped);
        }
        Ok(true)
    }

    async fn drive(self: &Arc<Self>, job_id: &JobId) -> Result<(), JobError> {
        let mut job = match self.store.get_job(job_id).await {
            Ok(job) => job,
            Err(RecordError::JobMissing { .. }) => {
                tracing::warn!(job_id = %job_id, "dequeued job has no record, dropping");
                return Ok(());
            },
            Err(e) => return Err(e.into()),
        };
        if job.state.is_terminal() {
            return Ok(());
        }
        if job.is_expired_at(Utc::now()) {
            let message = expired(&job).to_string();
            job.fail(message);
            return self.finish(job).await;
        }
        let Some(runner) = self.registry.instantiate(&job.runner) else {
            let message = JobError::UnknownRunner {
                name: job.runner.clone(),
            }
            .to_string();
            job.fail(message);
            return self.finish(job).await;
        };

        loop {
            let task = job.current_task.clone();
            if !runner.knows(&task) {
                let message = JobError::UnknownTask {
                    runner: job.runner.clone(),
                    task,
                }
                .to_string();
                job.fail(message);
                return self.finish(job).await;
            }

            job.state = JobState::Running;
            self.store.save_job(&job).await?;
            self.watcher.publish(&job.id, JobState::Running);
            tracing::debug!(job_id = %job.id, task = %task, "running task");

            match runner.run_task(&task, &job.args, &mut job.overrides).await {
                Ok(value) => {
                    job.record_attempt(AttemptOutcome::Success, None);
                    match runner.next_task(&task) {
                        Some(next) => job.current_task = next,
                        None => {
                            job.succeed(value);
                            return self.finish(job).await;
                        },
                    }
                },
                Err(TaskError::Retryable) => {
                    job.record_attempt(AttemptOutcome::Retry, None);
                    if job.is_expired_at(Utc::now()) {
                        let message = expired(&job).to_string();
                        job.fail(message);
                        return self.finish(job).await;
                    }
                    job.state = JobState::Pending;
                    self.store.save_job(&job).await?;
                    self.watcher.publish(&job.id, JobState::Pending);
                    tracing::debug!(job_id = %job.id, task = %task, "task asked for a retry");
                    self.requeue(job.id);
                    return Ok(());
                },
                Err(TaskError::Failed { message }) => {
                    job.record_attempt(AttemptOutcome::Failed, Some(message.clone()));
                    job.fail(message);
                    return self.finish(job).await;
                },
            }
        }
    }

    /// Puts `job_id` back on the queue after the retry delay.
    fn requeue(self: &Arc<Self>, job_id: JobId) {
        let delay: Duration = self.config.retry_delay();
        let inner = self.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = inner.cancel.cancelled() => {},
                _ = tokio::time::sleep(delay) => {
                    if inner.enqueue(job_id.clone()).is_err() {
                        tracing::warn!(job_id = %job_id, "queue closed, job left pending");
                    }
                },
            }
        });
    }

    async fn finish(&self, job: Job) -> Result<(), JobError> {
        self.store.save_job(&job).await?;
        self.watcher.publish(&job.id, job.state);
        match job.state {
            JobState::Succeeded => {
                tracing::info!(job_id = %job.id, runner = %job.runner, "job succeeded")
            },
            _ => tracing::info!(
                job_id = %job.id,
                runner = %job.runner,
                error = job.error.as_deref().unwrap_or_default(),
                "job failed"
            ),
        }
        // No listeners is fine.
        let _ = self.finished.send(job);
        Ok(())
    }

    async fn abort_job(&self, job_id: &JobId, message: String) {
        let result = async {
            let mut job = self.store.get_job(job_id).await?;
            if !job.state.is_terminal() {
                job.record_attempt(AttemptOutcome::Failed, Some(message.clone()));
                job.fail(message);
                self.finish(job).await?;
            }
            Ok::<_, JobError>(())
        }
        .await;
        if let Err(e) = result {
            tracing::error!(job_id = %job_id, error = %e, "failed to record aborted job");
        }
    }
}
