//! Persisted transaction record: the per-account audit ledger.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{OwnerId, Status, StatusResponse, TxId};

/// One entry in a transaction's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLog {
    /// Task (or manager action) that wrote the entry.
    pub task_name: String,
    /// Free-form message, usually the task outcome or error text.
    pub message: String,
    /// When the entry was appended.
    pub created_at: DateTime<Utc>,
}

impl TaskLog {
    /// Builds an entry stamped with the current time.
    pub fn new(task_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            message: message.into(),
            created_at: Utc::now(),
        }
    }
}

/// A value captured from chain events while the transaction ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxValue {
    /// Name the value is stored under.
    pub key: String,
    /// Index of the event topic/field the value came from.
    pub key_idx: u64,
    /// Raw value bytes, hex encoded when persisted.
    #[serde(with = "hex::serde")]
    pub value: Vec<u8>,
}

/// Application-level transaction tracking one unit of asynchronous work.
///
/// Logs only grow and `task_status` entries are overwritten per task name,
/// never removed. There is no delete path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TxId,
    pub owner: OwnerId,
    pub description: String,
    pub status: Status,
    #[serde(default)]
    pub task_status: BTreeMap<String, Status>,
    #[serde(default)]
    pub logs: Vec<TaskLog>,
    #[serde(default)]
    pub values: BTreeMap<String, TxValue>,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    /// Creates a fresh pending transaction with a new id.
    pub fn new(owner: OwnerId, description: impl Into<String>) -> Self {
        Self {
            id: TxId::new(),
            owner,
            description: description.into(),
            status: Status::Pending,
            task_status: BTreeMap::new(),
            logs: Vec::new(),
            values: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Appends a log entry.
    pub fn append_log(&mut self, task_name: impl Into<String>, message: impl Into<String>) {
        self.logs.push(TaskLog::new(task_name, message));
    }

    /// Overwrites the status of `task_name` and logs `message` under it.
    pub fn record_task(&mut self, task_name: &str, status: Status, message: impl Into<String>) {
        self.task_status.insert(task_name.to_string(), status);
        self.append_log(task_name, message);
    }

    /// Stores a value captured for this transaction; last write per key wins.
    pub fn set_value(&mut self, key: impl Into<String>, key_idx: u64, value: Vec<u8>) {
        let key = key.into();
        self.values.insert(
            key.clone(),
            TxValue {
                key,
                key_idx,
                value,
            },
        );
    }

    /// Most recent log entry, if any.
    pub fn last_log(&self) -> Option<&TaskLog> {
        self.logs.last()
    }

    /// Builds the status query response from the persisted state.
    pub fn status_response(&self) -> StatusResponse {
        let (message, last_updated) = match self.last_log() {
            Some(log) => (log.message.clone(), log.created_at),
            None => (String::new(), self.created_at),
        };
        StatusResponse {
            transaction_id: self.id.to_string(),
            status: self.status,
            message,
            last_updated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn owner() -> OwnerId {
        OwnerId::new([7u8; 32])
    }

    #[test]
    fn new_transaction_is_pending_and_empty() {
        let tx = Transaction::new(owner(), "anchor document");
        assert_eq!(tx.status, Status::Pending);
        assert!(!tx.id.is_nil());
        assert!(tx.logs.is_empty());
        assert!(tx.task_status.is_empty());
    }

    #[test]
    fn record_task_overwrites_status_and_appends_log() {
        let mut tx = Transaction::new(owner(), "anchor document");
        tx.record_task("send", Status::Pending, "submitted");
        tx.record_task("send", Status::Success, "included");
        assert_eq!(tx.task_status.get("send"), Some(&Status::Success));
        assert_eq!(tx.logs.len(), 2);
        assert_eq!(tx.logs[1].message, "included");
    }

    #[test]
    fn status_response_without_logs_uses_created_at() {
        let tx = Transaction::new(owner(), "anchor document");
        let resp = tx.status_response();
        assert_eq!(resp.message, "");
        assert_eq!(resp.last_updated, tx.created_at);
        assert_eq!(resp.transaction_id, tx.id.to_string());
    }

    #[test]
    fn status_response_uses_latest_log() {
        let mut tx = Transaction::new(owner(), "anchor document");
        tx.append_log("send", "first");
        tx.append_log("wait", "second");
        let resp = tx.status_response();
        assert_eq!(resp.message, "second");
        assert_eq!(resp.last_updated, tx.logs[1].created_at);
    }

    #[test]
    fn values_are_keyed_and_hex_persisted() {
        let mut tx = Transaction::new(owner(), "anchor document");
        tx.set_value("identity", 1, vec![0xde, 0xad]);
        let json = serde_json::to_value(&tx).unwrap();
        assert_eq!(json["values"]["identity"]["value"], "dead");
        let back: Transaction = serde_json::from_value(json).unwrap();
        assert_eq!(back, tx);
    }
}
