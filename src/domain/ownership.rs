//! Ownership marker binding a dispatched job to one account.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{JobId, OwnerId};

/// Existence marker for `(owner, job_id)`.
///
/// Written exactly once through a create-if-absent write; there is no
/// update path. The first successful write decides which account may
/// observe the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipRecord {
    pub owner: OwnerId,
    pub job_id: JobId,
    pub claimed_at: DateTime<Utc>,
}

impl OwnershipRecord {
    pub fn new(owner: OwnerId, job_id: JobId) -> Self {
        Self {
            owner,
            job_id,
            claimed_at: Utc::now(),
        }
    }
}
