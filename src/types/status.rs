//! Transaction status and the status query response.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Meta-status of a transaction, also used per task in `task_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Work is still in flight.
    #[default]
    Pending,
    /// Work finished successfully.
    Success,
    /// Work failed terminally.
    Failed,
}

impl Status {
    /// Returns `true` once the status has left `Pending`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Snapshot returned by the status query.
///
/// `message` is the most recent log message (empty when nothing was logged
/// yet) and `last_updated` is that entry's timestamp, or the creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    /// `0x`-prefixed hex transaction id.
    pub transaction_id: String,
    /// Persisted meta-status.
    pub status: Status,
    /// Most recent log message.
    pub message: String,
    /// Timestamp of the most recent log entry.
    pub last_updated: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Status::Failed).unwrap(), "\"failed\"");
        assert_eq!(Status::Success.to_string(), "success");
        assert!(!Status::Pending.is_terminal());
        assert!(Status::Failed.is_terminal());
    }
}
