//! Persistence envelope: `{"type": <kind>, "data": <payload>}`.
//!
//! Every value written by [`RecordStore`](crate::store::RecordStore) is one
//! [`Record`]. The tag is explicit in the stored bytes, so a generic reader
//! (a prefix scan, a migration) can decode heterogeneous keys without
//! knowing in advance which kind each one holds.

use serde::{Deserialize, Serialize};

use crate::domain::{Job, OwnershipRecord, Transaction};
use crate::error::RecordError;

/// Closed set of persisted record kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Record {
    Transaction(Transaction),
    Ownership(OwnershipRecord),
    Job(Job),
}

impl Record {
    /// The tag written in the envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transaction(_) => "transaction",
            Self::Ownership(_) => "ownership",
            Self::Job(_) => "job",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, RecordError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn into_transaction(self) -> Result<Transaction, RecordError> {
        match self {
            Self::Transaction(tx) => Ok(tx),
            other => Err(other.mismatch("transaction")),
        }
    }

    pub fn into_ownership(self) -> Result<OwnershipRecord, RecordError> {
        match self {
            Self::Ownership(record) => Ok(record),
            other => Err(other.mismatch("ownership")),
        }
    }

    pub fn into_job(self) -> Result<Job, RecordError> {
        match self {
            Self::Job(job) => Ok(job),
            other => Err(other.mismatch("job")),
        }
    }

    fn mismatch(&self, expected: &'static str) -> RecordError {
        RecordError::UnexpectedRecord {
            expected,
            found: self.kind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobId, OwnerId};
    use pretty_assertions::assert_eq;

    #[test]
    fn envelope_carries_explicit_type_tag() {
        let record = Record::Ownership(OwnershipRecord::new(
            OwnerId::new([3u8; 32]),
            JobId::from_bytes(vec![9]),
        ));
        let value: serde_json::Value = serde_json::from_slice(&record.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "ownership");
        assert_eq!(value["data"]["job_id"], "0x09");
    }

    #[test]
    fn decode_dispatches_on_tag() {
        let tx = Transaction::new(OwnerId::new([4u8; 32]), "anchor");
        let bytes = Record::Transaction(tx.clone()).encode().unwrap();
        let decoded = Record::decode(&bytes).unwrap();
        assert_eq!(decoded.kind(), "transaction");
        assert_eq!(decoded.into_transaction().unwrap(), tx);
    }

    #[test]
    fn wrong_kind_is_unexpected_record() {
        let tx = Transaction::new(OwnerId::new([4u8; 32]), "anchor");
        let err = Record::Transaction(tx).into_job().unwrap_err();
        assert!(matches!(
            err,
            RecordError::UnexpectedRecord {
                expected: "job",
                found: "transaction"
            }
        ));
    }

    #[test]
    fn unknown_tag_fails_to_decode() {
        let err = Record::decode(br#"{"type":"invoice","data":{}}"#).unwrap_err();
        assert!(matches!(err, RecordError::Serialization(_)));
    }
}
