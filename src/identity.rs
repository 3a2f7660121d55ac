//! Identity creation as a two-step runner chain.
//!
//! `send` submits the create transaction and stashes its hash together with
//! the address the chain is expected to assign. `wait` polls for inclusion,
//! reads the created address from the receipt and stores it on the owning
//! transaction. Both steps report to that transaction through
//! [`track_task`], so a caller waiting on it sees per-task progress.
//!
//! When the observed address differs from the expected one (two concurrent
//! creations interleaved their nonces), [`ConflictPolicy`] decides whether
//! the job fails or adopts the observed address.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::domain::Overrides;
use crate::error::{TaskError, TxError};
use crate::jobs::{ChainRunner, ChainStep, JobDispatcher, LocalJobEngine};
use crate::transactions::{track_task, TxDone, TxManager};
use crate::types::{OwnerId, TxId};

/// Registered runner name.
pub const IDENTITY_RUNNER: &str = "identity_creation";

/// Overrides key holding the submitted transaction hash.
pub const TX_HASH_KEY: &str = "tx_hash";

/// Overrides key holding the address computed before submission.
pub const EXPECTED_ADDRESS_KEY: &str = "expected_identity_address";

/// Overrides key holding the address observed on chain.
pub const IDENTITY_ADDRESS_KEY: &str = "identity_address";

/// Transaction value key for the created identity.
pub const IDENTITY_VALUE_KEY: &str = "identity";

/// The chain operations identity creation needs.
#[async_trait]
pub trait IdentityChain: Send + Sync {
    /// Address the next identity created for `owner` will get.
    async fn expected_identity(&self, owner: &OwnerId) -> Result<String, TaskError>;

    /// Submits the create transaction and returns its hash.
    async fn submit_create(&self, owner: &OwnerId) -> Result<String, TaskError>;

    /// Address emitted by the included transaction, or `None` while it is
    /// still pending.
    async fn created_identity(&self, tx_hash: &str) -> Result<Option<String>, TaskError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityStep {
    Send,
    Wait,
}

impl ChainStep for IdentityStep {
    fn name(&self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Wait => "wait",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name {
            "send" => Some(Self::Send),
            "wait" => Some(Self::Wait),
            _ => None,
        }
    }

    fn next(&self) -> Option<Self> {
        match self {
            Self::Send => Some(Self::Wait),
            Self::Wait => None,
        }
    }
}

/// What `wait` does when the created address is not the expected one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Fail the job, naming both addresses.
    #[default]
    Reject,
    /// Log a "recovered" warning and adopt the observed address.
    Reconcile,
}

/// Runner for [`IDENTITY_RUNNER`].
///
/// Job arguments: `[owner, tx_id]`, both in their hex text form.
pub struct IdentityRunner {
    chain: Arc<dyn IdentityChain>,
    manager: TxManager,
    policy: ConflictPolicy,
}

impl IdentityRunner {
    pub fn new(chain: Arc<dyn IdentityChain>, manager: TxManager, policy: ConflictPolicy) -> Self {
        Self {
            chain,
            manager,
            policy,
        }
    }

    async fn send(
        &self,
        owner: &OwnerId,
        tx_id: &TxId,
        overrides: &mut Overrides,
    ) -> Result<Value, TaskError> {
        if let Some(hash) = overrides.get(TX_HASH_KEY).and_then(Value::as_str) {
            tracing::debug!(tx_id = %tx_id, tx_hash = hash, "identity create already submitted");
            return Ok(json!(hash));
        }
        let (expected, hash) = track_task(&self.manager, owner, tx_id, "send", async {
            let expected = self.chain.expected_identity(owner).await?;
            let hash = self.chain.submit_create(owner).await?;
            Ok::<_, TaskError>((expected, hash))
        })
        .await?;
        tracing::info!(owner = %owner, tx_hash = %hash, expected = %expected, "identity create submitted");
        overrides.insert(TX_HASH_KEY.to_string(), json!(hash));
        overrides.insert(EXPECTED_ADDRESS_KEY.to_string(), json!(expected));
        Ok(json!(hash))
    }

    async fn wait(
        &self,
        owner: &OwnerId,
        tx_id: &TxId,
        overrides: &mut Overrides,
    ) -> Result<Value, TaskError> {
        let hash = string_override(overrides, TX_HASH_KEY)?;
        let expected = string_override(overrides, EXPECTED_ADDRESS_KEY)?;

        let observed = track_task(&self.manager, owner, tx_id, "wait", async {
            let observed = self
                .chain
                .created_identity(&hash)
                .await?
                .ok_or(TaskError::Retryable)?;
            let observed = self.resolve(&expected, observed)?;
            self.manager
                .update_transaction_with_value(
                    owner,
                    tx_id,
                    IDENTITY_VALUE_KEY,
                    0,
                    address_bytes(&observed),
                )
                .await
                .map_err(TaskError::from)?;
            Ok::<_, TaskError>(observed)
        })
        .await?;

        overrides.insert(IDENTITY_ADDRESS_KEY.to_string(), json!(observed));
        Ok(json!(observed))
    }

    fn resolve(&self, expected: &str, observed: String) -> Result<String, TaskError> {
        if observed.eq_ignore_ascii_case(expected) {
            return Ok(observed);
        }
        match self.policy {
            ConflictPolicy::Reject => Err(TaskError::failed(format!(
                "created identity {observed} does not match expected {expected}"
            ))),
            ConflictPolicy::Reconcile => {
                tracing::warn!(
                    expected = %expected,
                    observed = %observed,
                    "recovered: identity created at a different address than expected"
                );
                Ok(observed)
            },
        }
    }
}

#[async_trait]
impl ChainRunner for IdentityRunner {
    type Step = IdentityStep;

    async fn run(
        &self,
        step: IdentityStep,
        args: &[Value],
        overrides: &mut Overrides,
    ) -> Result<Value, TaskError> {
        let (owner, tx_id) = parse_args(args)?;
        match step {
            IdentityStep::Send => self.send(&owner, &tx_id, overrides).await,
            IdentityStep::Wait => self.wait(&owner, &tx_id, overrides).await,
        }
    }
}

fn parse_args(args: &[Value]) -> Result<(OwnerId, TxId), TaskError> {
    let text = |idx: usize, what: &str| {
        args.get(idx)
            .and_then(Value::as_str)
            .ok_or_else(|| TaskError::failed(format!("missing {what} argument")))
    };
    let owner: OwnerId = text(0, "owner")?.parse()?;
    let tx_id: TxId = text(1, "transaction id")?.parse()?;
    Ok((owner, tx_id))
}

fn string_override(overrides: &Overrides, key: &str) -> Result<String, TaskError> {
    overrides
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| TaskError::failed(format!("override '{key}' missing")))
}

fn address_bytes(address: &str) -> Vec<u8> {
    let digits = address.strip_prefix("0x").unwrap_or(address);
    hex::decode(digits).unwrap_or_else(|_| address.as_bytes().to_vec())
}

/// Registers [`IdentityRunner`] under [`IDENTITY_RUNNER`].
pub fn register_identity_runner(
    engine: &LocalJobEngine,
    chain: Arc<dyn IdentityChain>,
    manager: TxManager,
    policy: ConflictPolicy,
) -> bool {
    engine.register_runner(IDENTITY_RUNNER, move || {
        IdentityRunner::new(chain.clone(), manager.clone(), policy)
    })
}

/// Starts identity creations as tracked transactions.
#[derive(Debug, Clone)]
pub struct IdentityService {
    manager: TxManager,
    dispatcher: JobDispatcher,
}

impl IdentityService {
    pub fn new(manager: TxManager, dispatcher: JobDispatcher) -> Self {
        Self {
            manager,
            dispatcher,
        }
    }

    /// Creates an identity for `owner`.
    ///
    /// Returns the tracking transaction at once; the identity job runs
    /// inside it and the transaction settles when the job does.
    pub async fn create_identity(
        &self,
        ctx: &CancellationToken,
        owner: OwnerId,
    ) -> Result<(TxId, TxDone), TxError> {
        let dispatcher = self.dispatcher.clone();
        self.manager
            .execute_within_tx(ctx, owner, TxId::nil(), "create identity", move |unit| async move {
                let job = dispatcher.new_runner_job(
                    format!("create identity for {}", unit.owner()),
                    IDENTITY_RUNNER,
                    IdentityStep::Send.name(),
                    vec![json!(unit.owner().to_string()), json!(unit.tx_id().to_string())],
                    Overrides::new(),
                    None,
                );
                let result = dispatcher.dispatch(unit.owner(), job).await?;
                result.await_result(unit.cancellation()).await?;
                Ok::<(), TaskError>(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn steps_chain_send_then_wait() {
        assert_eq!(IdentityStep::parse("send"), Some(IdentityStep::Send));
        assert_eq!(IdentityStep::Send.next(), Some(IdentityStep::Wait));
        assert_eq!(IdentityStep::Wait.next(), None);
        assert_eq!(IdentityStep::parse("mint"), None);
    }

    #[test]
    fn args_must_be_owner_then_tx() {
        let owner = OwnerId::new([7u8; 32]);
        let tx_id = TxId::new();
        let args = vec![json!(owner.to_string()), json!(tx_id.to_string())];
        assert_eq!(parse_args(&args).unwrap(), (owner, tx_id));

        let err = parse_args(&args[..1]).unwrap_err();
        assert_eq!(err, TaskError::failed("missing transaction id argument"));
        assert!(parse_args(&[json!("0xzz"), json!(tx_id.to_string())]).is_err());
    }

    #[test]
    fn address_bytes_decode_hex_or_fall_back() {
        assert_eq!(address_bytes("0x0a0b"), vec![0x0a, 0x0b]);
        assert_eq!(address_bytes("not-hex"), b"not-hex".to_vec());
    }
}
