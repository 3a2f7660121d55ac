//! Identifier and status types shared across the crate.

pub mod ids;
pub mod status;

pub use ids::{JobId, OwnerId, TxId, OWNER_ID_LEN};
pub use status::{Status, StatusResponse};
