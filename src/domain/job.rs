//! Persisted job record driven by a named runner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::JobId;

/// Mutable key/value bag shared by all tasks of one job execution.
///
/// Step N stashes data (a submitted transaction hash, an expected address)
/// for step N+1 to read.
pub type Overrides = serde_json::Map<String, Value>;

/// Lifecycle of a job inside the queue engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for a worker (first run or re-enqueued after a retry).
    #[default]
    Pending,
    /// A worker is executing `current_task`.
    Running,
    /// The last task finished successfully.
    Succeeded,
    /// A task failed terminally or the job expired.
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Outcome of one task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Retry,
    Failed,
}

/// One execution of one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAttempt {
    pub task: String,
    pub outcome: AttemptOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub at: DateTime<Utc>,
}

/// A unit of work progressing through the tasks of one runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub description: String,
    /// Registered runner name.
    pub runner: String,
    /// Task to execute next (or the one that ended the job).
    pub current_task: String,
    pub args: Vec<Value>,
    #[serde(default)]
    pub overrides: Overrides,
    /// Past this instant the job fails instead of retrying.
    pub valid_until: DateTime<Utc>,
    pub state: JobState,
    #[serde(default)]
    pub attempts: Vec<TaskAttempt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Builds a pending job for `runner`, starting at `first_task`.
    ///
    /// ```
    /// use anchor_jobs::Job;
    /// use chrono::{Duration, Utc};
    /// use serde_json::json;
    ///
    /// let job = Job::new(
    ///     "create identity",
    ///     "identity",
    ///     "send",
    ///     vec![json!("0xabc")],
    ///     Default::default(),
    ///     Utc::now() + Duration::minutes(30),
    /// );
    /// assert_eq!(job.current_task, "send");
    /// assert!(!job.state.is_terminal());
    /// ```
    pub fn new(
        description: impl Into<String>,
        runner: impl Into<String>,
        first_task: impl Into<String>,
        args: Vec<Value>,
        overrides: Overrides,
        valid_until: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            description: description.into(),
            runner: runner.into(),
            current_task: first_task.into(),
            args,
            overrides,
            valid_until,
            state: JobState::Pending,
            attempts: Vec::new(),
            result: None,
            error: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Replaces the generated id with a caller-chosen one.
    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = id;
        self
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.valid_until
    }

    /// Number of times `task` was executed, whatever the outcome.
    pub fn executions_of(&self, task: &str) -> usize {
        self.attempts.iter().filter(|a| a.task == task).count()
    }

    pub(crate) fn record_attempt(
        &mut self,
        outcome: AttemptOutcome,
        message: Option<String>,
    ) {
        self.attempts.push(TaskAttempt {
            task: self.current_task.clone(),
            outcome,
            message,
            at: Utc::now(),
        });
    }

    pub(crate) fn succeed(&mut self, result: Value) {
        self.state = JobState::Succeeded;
        self.result = Some(result);
        self.finished_at = Some(Utc::now());
    }

    pub(crate) fn fail(&mut self, message: impl Into<String>) {
        self.state = JobState::Failed;
        self.error = Some(message.into());
        self.finished_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn sample() -> Job {
        Job::new(
            "anchor",
            "anchor_runner",
            "send",
            vec![json!(1)],
            Overrides::new(),
            Utc::now() + Duration::minutes(5),
        )
    }

    #[test]
    fn attempts_are_counted_per_task() {
        let mut job = sample();
        job.record_attempt(AttemptOutcome::Retry, Some("node busy".to_string()));
        job.record_attempt(AttemptOutcome::Success, None);
        job.current_task = "wait".to_string();
        job.record_attempt(AttemptOutcome::Success, None);
        assert_eq!(job.executions_of("send"), 2);
        assert_eq!(job.executions_of("wait"), 1);
        assert_eq!(job.executions_of("mint"), 0);
    }

    #[test]
    fn terminal_transitions_stamp_finish_time() {
        let mut job = sample();
        job.succeed(json!({"hash": "0x01"}));
        assert_eq!(job.state, JobState::Succeeded);
        assert!(job.finished_at.is_some());

        let mut job = sample();
        job.fail("reverted");
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.error.as_deref(), Some("reverted"));
    }

    #[test]
    fn expiry_is_strictly_after_valid_until() {
        let job = sample();
        assert!(!job.is_expired_at(job.valid_until));
        assert!(job.is_expired_at(job.valid_until + Duration::milliseconds(1)));
    }
}
