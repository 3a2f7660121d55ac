//! Integration tests for the transaction manager.
//!
//! Exercises `execute_within_tx` outcomes (success, failure, context close,
//! supervision timeout, resume), `wait_for_transaction`, and concurrent
//! task-status updates against the in-memory backend.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use anchor_jobs::constants::{CONTEXT_CLOSED, SUPERVISION_TIMEOUT};
use anchor_jobs::transactions::TxOutcome;
use anchor_jobs::{
    InMemoryBackend, OrchestratorConfig, OwnerId, RecordStore, Status, TaskError, TxError, TxId,
    TxManager,
};

fn manager_with(config: OrchestratorConfig) -> (TxManager, RecordStore) {
    let store = RecordStore::new(Arc::new(InMemoryBackend::new()));
    let manager = TxManager::new(Arc::new(store.clone()), config);
    (manager, store)
}

fn manager() -> TxManager {
    manager_with(OrchestratorConfig::default()).0
}

fn alice() -> OwnerId {
    OwnerId::new([0xa1; 32])
}

fn bob() -> OwnerId {
    OwnerId::new([0xb0; 32])
}

// ─── Outcomes ────────────────────────────────────────────────────────────

mod outcome_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_prompt_success_marks_new_transaction_success() {
        let manager = manager();
        let ctx = CancellationToken::new();
        let (tx_id, done) = manager
            .execute_within_tx(&ctx, alice(), TxId::nil(), "anchor document", |_unit| async {
                Ok::<_, TaskError>(())
            })
            .await
            .unwrap();

        assert!(!tx_id.is_nil());
        assert_eq!(done.await, TxOutcome::Succeeded);
        let tx = manager.get_transaction(&alice(), &tx_id).await.unwrap();
        assert_eq!(tx.status, Status::Success);
        assert_eq!(tx.description, "anchor document");
        assert!(tx.logs.is_empty());
    }

    #[tokio::test]
    async fn test_failure_appends_one_log_and_fails_manager_task() {
        let manager = manager();
        let ctx = CancellationToken::new();
        let (tx_id, done) = manager
            .execute_within_tx(&ctx, alice(), TxId::nil(), "mint nft", |_unit| async {
                Err::<(), _>(TaskError::failed("execution reverted"))
            })
            .await
            .unwrap();

        assert_eq!(
            done.await,
            TxOutcome::Failed {
                message: "execution reverted".to_string()
            }
        );
        let tx = manager.get_transaction(&alice(), &tx_id).await.unwrap();
        assert_eq!(tx.status, Status::Failed);
        assert_eq!(tx.logs.len(), 1);
        assert_eq!(tx.logs[0].task_name, "manager[mint nft]");
        assert_eq!(tx.logs[0].message, "execution reverted");
        assert_eq!(tx.task_status.get("manager[mint nft]"), Some(&Status::Failed));
    }

    #[tokio::test]
    async fn test_context_close_leaves_pending_with_marker() {
        let manager = manager();
        let ctx = CancellationToken::new();
        let (tx_id, done) = manager
            .execute_within_tx(&ctx, alice(), TxId::nil(), "slow anchor", |_unit| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok::<_, TaskError>(())
            })
            .await
            .unwrap();

        ctx.cancel();
        assert_eq!(done.await, TxOutcome::ContextClosed);

        let tx = manager.get_transaction(&alice(), &tx_id).await.unwrap();
        assert_eq!(tx.status, Status::Pending);
        assert_eq!(tx.logs.len(), 1);
        assert_eq!(tx.logs[0].task_name, CONTEXT_CLOSED);
        assert!(tx.logs[0].message.contains("is stopped because of context close"));
        assert!(tx.logs[0].message.contains("\"slow anchor\""));
    }

    #[tokio::test]
    async fn test_context_close_is_visible_to_work_unit() {
        let manager = manager();
        let ctx = CancellationToken::new();
        let (observed_tx, observed_rx) = tokio::sync::oneshot::channel();
        let (_tx_id, done) = manager
            .execute_within_tx(&ctx, alice(), TxId::nil(), "watcher", |unit| async move {
                unit.cancellation().cancelled().await;
                let _ = observed_tx.send(());
                Ok::<_, TaskError>(())
            })
            .await
            .unwrap();

        ctx.cancel();
        observed_rx.await.unwrap();
        done.await;
    }

    #[tokio::test]
    async fn test_supervision_timeout_fails_and_cancels_work() {
        let (manager, _) = manager_with(OrchestratorConfig {
            supervision_timeout_ms: Some(20),
            ..OrchestratorConfig::default()
        });
        let ctx = CancellationToken::new();
        let (tx_id, done) = manager
            .execute_within_tx(&ctx, alice(), TxId::nil(), "stuck", |unit| async move {
                unit.cancellation().cancelled().await;
                Ok::<_, TaskError>(())
            })
            .await
            .unwrap();

        assert_eq!(done.await, TxOutcome::TimedOut);
        assert!(!ctx.is_cancelled());

        let tx = manager.get_transaction(&alice(), &tx_id).await.unwrap();
        assert_eq!(tx.status, Status::Failed);
        assert_eq!(tx.task_status.get("manager[stuck]"), Some(&Status::Failed));
        assert_eq!(tx.logs.last().unwrap().task_name, SUPERVISION_TIMEOUT);
    }
}

// ─── Resume ──────────────────────────────────────────────────────────────

mod resume_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_existing_transaction_is_resumed_without_auto_success() {
        let manager = manager();
        let existing = manager.create_transaction(alice(), "anchor").await.unwrap();
        let ctx = CancellationToken::new();

        let (tx_id, done) = manager
            .execute_within_tx(&ctx, alice(), existing.id, "anchor", |unit| async move {
                unit.update_task_status(Status::Success, "send", "sent").await?;
                Ok::<_, TaskError>(())
            })
            .await
            .unwrap();

        assert_eq!(tx_id, existing.id);
        assert_eq!(done.await, TxOutcome::Completed);
        let tx = manager.get_transaction(&alice(), &tx_id).await.unwrap();
        assert_eq!(tx.status, Status::Pending);
        assert_eq!(tx.task_status.get("send"), Some(&Status::Success));
        assert_eq!(tx.logs.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_existing_id_starts_new_transaction() {
        let manager = manager();
        let ctx = CancellationToken::new();
        let stale = TxId::new();

        let (tx_id, done) = manager
            .execute_within_tx(&ctx, alice(), stale, "anchor", |_unit| async {
                Ok::<_, TaskError>(())
            })
            .await
            .unwrap();

        assert_ne!(tx_id, stale);
        assert_eq!(done.await, TxOutcome::Succeeded);
        assert!(manager.get_transaction(&alice(), &stale).await.is_err());
    }

    #[tokio::test]
    async fn test_other_owners_transaction_is_not_resumed() {
        let manager = manager();
        let foreign = manager.create_transaction(bob(), "anchor").await.unwrap();
        let ctx = CancellationToken::new();

        let (tx_id, done) = manager
            .execute_within_tx(&ctx, alice(), foreign.id, "anchor", |_unit| async {
                Ok::<_, TaskError>(())
            })
            .await
            .unwrap();
        done.await;

        assert_ne!(tx_id, foreign.id);
        let untouched = manager.get_transaction(&bob(), &foreign.id).await.unwrap();
        assert_eq!(untouched.status, Status::Pending);
    }
}

// ─── Waiting ─────────────────────────────────────────────────────────────

mod wait_tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_returns_when_work_succeeds() {
        let manager = manager();
        let ctx = CancellationToken::new();
        let (tx_id, _done) = manager
            .execute_within_tx(&ctx, alice(), TxId::nil(), "anchor", |_unit| async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<_, TaskError>(())
            })
            .await
            .unwrap();

        manager.wait_for_transaction(&alice(), &tx_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_reports_failure_message() {
        let manager = manager();
        let ctx = CancellationToken::new();
        let (tx_id, _done) = manager
            .execute_within_tx(&ctx, alice(), TxId::nil(), "anchor", |_unit| async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err::<(), _>(TaskError::failed("nonce too low"))
            })
            .await
            .unwrap();

        let err = manager
            .wait_for_transaction(&alice(), &tx_id)
            .await
            .unwrap_err();
        match err {
            TxError::Failed { tx_id: id, message } => {
                assert_eq!(id, tx_id);
                assert_eq!(message, "nonce too low");
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_wait_sees_status_settled_before_restart() {
        let (first, store) = manager_with(OrchestratorConfig::default());
        let ctx = CancellationToken::new();
        let (tx_id, done) = first
            .execute_within_tx(&ctx, alice(), TxId::nil(), "anchor", |_unit| async {
                Ok::<_, TaskError>(())
            })
            .await
            .unwrap();
        done.await;

        let restarted = TxManager::new(Arc::new(store), OrchestratorConfig::default());
        restarted.wait_for_transaction(&alice(), &tx_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_unknown_transaction_is_not_found() {
        let manager = manager();
        let err = manager
            .wait_for_transaction(&alice(), &TxId::new())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}

// ─── Task status ─────────────────────────────────────────────────────────

mod task_status_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_concurrent_updates_keep_every_log() {
        let manager = manager();
        let tx = manager.create_transaction(alice(), "batch").await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let manager = manager.clone();
            let id = tx.id;
            handles.push(tokio::spawn(async move {
                manager
                    .update_task_status(&alice(), &id, Status::Success, &format!("task-{i}"), "ok")
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let stored = manager.get_transaction(&alice(), &tx.id).await.unwrap();
        assert_eq!(stored.logs.len(), 8);
        assert_eq!(stored.task_status.len(), 8);
    }

    #[tokio::test]
    async fn test_last_write_wins_per_task_name() {
        let manager = manager();
        let tx = manager.create_transaction(alice(), "anchor").await.unwrap();
        manager
            .update_task_status(&alice(), &tx.id, Status::Pending, "wait", "polling")
            .await
            .unwrap();
        manager
            .update_task_status(&alice(), &tx.id, Status::Success, "wait", "included")
            .await
            .unwrap();

        let status = manager
            .get_transaction_status(&alice(), &tx.id)
            .await
            .unwrap();
        assert_eq!(status.message, "included");
        assert_eq!(status.status, Status::Pending);

        let stored = manager.get_transaction(&alice(), &tx.id).await.unwrap();
        assert_eq!(stored.task_status.get("wait"), Some(&Status::Success));
        assert_eq!(stored.logs.len(), 2);
    }

    #[tokio::test]
    async fn test_list_is_scoped_to_owner() {
        let manager = manager();
        manager.create_transaction(alice(), "one").await.unwrap();
        manager.create_transaction(alice(), "two").await.unwrap();
        manager.create_transaction(bob(), "three").await.unwrap();

        assert_eq!(manager.list_transactions(&alice()).await.unwrap().len(), 2);
        assert_eq!(manager.list_transactions(&bob()).await.unwrap().len(), 1);
    }
}
