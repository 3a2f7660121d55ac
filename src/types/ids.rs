//! Identifiers: accounts, transactions and jobs.
//!
//! All three render as `0x`-prefixed lowercase hex and parse back from that
//! form (the prefix is optional when parsing). Serialized forms use the same
//! text so persisted records stay readable.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::IdError;

/// Length in bytes of an account identifier.
pub const OWNER_ID_LEN: usize = 32;

const TX_ID_LEN: usize = 16;

fn decode_hex(kind: &'static str, input: &str) -> Result<Vec<u8>, IdError> {
    let trimmed = input.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if digits.is_empty() {
        return Err(IdError::Empty { kind });
    }
    hex::decode(digits).map_err(|source| IdError::InvalidHex {
        kind,
        input: input.to_string(),
        source,
    })
}

/// Fixed-size account identifier (a decentralized identity).
///
/// The owner is the scoping key for every authorization check: transactions
/// are keyed by `owner || tx_id` and jobs are only visible to the account
/// that dispatched them.
///
/// ```
/// use anchor_jobs::OwnerId;
///
/// let owner = OwnerId::new([0x11; 32]);
/// let parsed: OwnerId = owner.to_string().parse().unwrap();
/// assert_eq!(owner, parsed);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OwnerId([u8; OWNER_ID_LEN]);

impl OwnerId {
    /// Wraps raw account bytes.
    pub const fn new(bytes: [u8; OWNER_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Builds an owner from a byte slice of exactly [`OWNER_ID_LEN`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, IdError> {
        let array: [u8; OWNER_ID_LEN] =
            bytes.try_into().map_err(|_| IdError::InvalidLength {
                kind: "account id",
                expected: OWNER_ID_LEN,
                actual: bytes.len(),
            })?;
        Ok(Self(array))
    }

    /// Raw bytes, used as the leading part of storage keys.
    pub fn as_bytes(&self) -> &[u8; OWNER_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OwnerId({self})")
    }
}

impl FromStr for OwnerId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_slice(&decode_hex("account id", s)?)
    }
}

impl TryFrom<String> for OwnerId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<OwnerId> for String {
    fn from(value: OwnerId) -> Self {
        value.to_string()
    }
}

/// Transaction identifier with a distinguished Nil value.
///
/// Nil means "no existing transaction" when passed to
/// [`TxManager::execute_within_tx`](crate::TxManager::execute_within_tx)
/// and can never be used to build a storage key.
///
/// ```
/// use anchor_jobs::TxId;
///
/// assert!(TxId::nil().is_nil());
/// let id = TxId::new();
/// assert!(id.to_string().starts_with("0x"));
/// assert_eq!(id.to_string().parse::<TxId>().unwrap(), id);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TxId(Uuid);

impl TxId {
    /// Generates a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The Nil id.
    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }

    /// Returns `true` for the Nil id.
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    /// Raw 16 bytes, used as the trailing part of storage keys.
    pub fn as_bytes(&self) -> &[u8; TX_ID_LEN] {
        self.0.as_bytes()
    }
}

impl Default for TxId {
    fn default() -> Self {
        Self::nil()
    }
}

impl From<Uuid> for TxId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0.as_bytes()))
    }
}

impl fmt::Debug for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxId({self})")
    }
}

impl FromStr for TxId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = decode_hex("transaction id", s)?;
        let uuid = Uuid::from_slice(&bytes).map_err(|_| IdError::InvalidLength {
            kind: "transaction id",
            expected: TX_ID_LEN,
            actual: bytes.len(),
        })?;
        Ok(Self(uuid))
    }
}

impl TryFrom<String> for TxId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TxId> for String {
    fn from(value: TxId) -> Self {
        value.to_string()
    }
}

/// Opaque job identifier exchanged with workflow code.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(Vec<u8>);

impl JobId {
    /// Generates a fresh id from random UUID bytes.
    pub fn new() -> Self {
        Self(Uuid::new_v4().as_bytes().to_vec())
    }

    /// Wraps caller-chosen bytes, e.g. a document id that must be
    /// dispatched at most once per account.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0))
    }
}

impl fmt::Debug for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobId({self})")
    }
}

impl FromStr for JobId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_hex("job id", s).map(Self)
    }
}

impl TryFrom<String> for JobId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<JobId> for String {
    fn from(value: JobId) -> Self {
        value.to_string()
    }
}
