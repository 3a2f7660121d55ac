//! Status query boundary.
//!
//! The transport layer authenticates the request and hands over an
//! [`AuthContext`]; this module resolves the owner, parses the transaction
//! id and maps manager errors to the three errors the RPC surfaces.

use crate::error::{ApiError, ErrorKind, IdError};
use crate::transactions::TxManager;
use crate::types::{OwnerId, StatusResponse, TxId};

/// Identity attached to a request by the authentication layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthContext {
    /// Hex account id, if the caller authenticated as an account.
    pub account_id: Option<String>,
}

impl AuthContext {
    pub fn for_account(account: &OwnerId) -> Self {
        Self {
            account_id: Some(account.to_string()),
        }
    }
}

/// Resolves the owning account from the request context.
///
/// ```
/// use anchor_jobs::api::{resolve_owner, AuthContext};
/// use anchor_jobs::OwnerId;
///
/// let owner = OwnerId::new([3u8; 32]);
/// assert_eq!(resolve_owner(&AuthContext::for_account(&owner)).unwrap(), owner);
/// assert!(resolve_owner(&AuthContext::default()).is_err());
/// ```
pub fn resolve_owner(auth: &AuthContext) -> Result<OwnerId, ApiError> {
    let raw = auth
        .account_id
        .as_deref()
        .ok_or_else(|| ApiError::InvalidAccountId {
            reason: "no account in request context".to_string(),
        })?;
    raw.parse().map_err(|e: IdError| ApiError::InvalidAccountId {
        reason: e.to_string(),
    })
}

/// Serves transaction status lookups.
#[derive(Debug, Clone)]
pub struct StatusQuery {
    manager: TxManager,
}

impl StatusQuery {
    pub fn new(manager: TxManager) -> Self {
        Self { manager }
    }

    /// Looks up `tx_id` for the account in `auth`.
    ///
    /// # Errors
    ///
    /// - [`ApiError::InvalidAccountId`] when no owner can be resolved.
    /// - [`ApiError::InvalidTransactionId`] for malformed or Nil ids.
    /// - [`ApiError::TransactionMissing`] when the account has no such
    ///   transaction.
    pub async fn transaction_status(
        &self,
        auth: &AuthContext,
        tx_id: &str,
    ) -> Result<StatusResponse, ApiError> {
        let owner = resolve_owner(auth)?;
        let id: TxId = tx_id.parse().map_err(ApiError::InvalidTransactionId)?;
        if id.is_nil() {
            return Err(ApiError::InvalidTransactionId(IdError::Nil {
                kind: "transaction id",
            }));
        }

        match self.manager.get_transaction_status(&owner, &id).await {
            Ok(status) => Ok(status),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(ApiError::TransactionMissing),
            Err(e) => {
                tracing::error!(tx_id = %id, owner = %owner, error = %e, "status lookup failed");
                Err(ApiError::Internal {
                    message: e.to_string(),
                })
            },
        }
    }
}
