//! Key prefixes and well-known log markers.

/// Namespace for ownership records: `jobs_v2_ || owner || job_id`.
pub const OWNERSHIP_PREFIX: &[u8] = b"jobs_v2_";

/// Namespace for the reverse index `job_id -> owner`.
pub const JOB_OWNER_PREFIX: &[u8] = b"job_owner_";

/// Namespace for persisted job records.
pub const JOB_PREFIX: &[u8] = b"job_record_";

/// Task-name prefix used for log entries written by the transaction
/// manager itself; the full name is `manager[<description>]`.
pub const MANAGER_TASK: &str = "manager";

/// Log action recorded when the caller's context closes before the work
/// unit reports back.
pub const CONTEXT_CLOSED: &str = "context closed";

/// Log action recorded when the supervision bound elapses.
pub const SUPERVISION_TIMEOUT: &str = "supervision timeout";

/// Log message recorded when a work unit asks to be retried.
pub const RETRY_REQUESTED: &str = "retry requested";

/// Builds the task name the manager logs under for a given description.
///
/// ```
/// use anchor_jobs::constants::manager_task_name;
///
/// assert_eq!(manager_task_name("create identity"), "manager[create identity]");
/// ```
pub fn manager_task_name(description: &str) -> String {
    format!("{MANAGER_TASK}[{description}]")
}
