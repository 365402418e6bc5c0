//! End-to-end pipeline tests over the in-memory store and mock chain.

use std::sync::Arc;
use std::time::Duration;

use fenced_tx_manager::app::{ManagerConfig, PeriodicTask, TxManager};
use fenced_tx_manager::domain::{
    AppError, CreateTransactionRequest, ManagedTransaction, StuckContext, StuckDecision,
    TransactionReceipt, TransactionState, TransactionStore, sub_state,
};
use fenced_tx_manager::test_utils::{InMemoryTransactionStore, MockChainConnector};
use uuid::Uuid;

fn config(required_confirmations: u64) -> ManagerConfig {
    let mut config = ManagerConfig::default();
    config.writer.worker_count = 2;
    config.finality.required_confirmations = required_confirmations;
    config
}

fn manager_over(
    store: &Arc<InMemoryTransactionStore>,
    chain: &Arc<MockChainConnector>,
) -> Arc<TxManager> {
    TxManager::builder(store.clone(), chain.clone())
        .config(config(3))
        .background_workers(false)
        .build()
}

fn request(submitter: &str, request_id: Option<&str>) -> CreateTransactionRequest {
    CreateTransactionRequest::new(
        submitter,
        request_id.map(str::to_string),
        serde_json::json!({"to": "0xrecipient", "value": "0x10"}),
    )
}

/// Wait for the writer's asynchronous send to be recorded.
async fn wait_for_tracking(store: &InMemoryTransactionStore, id: Uuid) -> ManagedTransaction {
    for _ in 0..100 {
        let tx = store.get_transaction(id).await.unwrap().unwrap();
        if tx.state == TransactionState::Tracking {
            return tx;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("transaction {} never reached tracking", id);
}

fn receipt(tx_hash: &str, block_number: u64, success: bool) -> TransactionReceipt {
    TransactionReceipt {
        tx_hash: tx_hash.to_string(),
        block_number,
        block_hash: format!("0xblock{}", block_number),
        success,
        raw: serde_json::json!({}),
    }
}

#[tokio::test]
async fn test_create_submit_receipt_finalize() {
    let store = Arc::new(InMemoryTransactionStore::new());
    let chain = Arc::new(MockChainConnector::new());
    chain.set_pending_nonce("0xsubmitter", 7);
    let manager = manager_over(&store, &chain);

    let created = manager
        .create_transaction(request("0xsubmitter", Some("order-1")))
        .await
        .unwrap();
    assert_eq!(created.nonce, 7);
    assert_eq!(created.state, TransactionState::Allocated);

    let tracking = wait_for_tracking(&store, created.id).await;
    let tx_hash = tracking.tx_hash.clone().unwrap();
    assert_eq!(tracking.submit_attempts, 1);
    assert_eq!(chain.sent().len(), 1);
    assert_eq!(chain.sent()[0].nonce, 7);

    // Not mined yet: the checker records the lookup and nothing else.
    manager.receipt_checker().poll_once().await.unwrap();
    let checked = store.get_transaction(created.id).await.unwrap().unwrap();
    assert!(checked.receipt.is_none());
    assert!(checked.last_receipt_check_at.is_some());

    chain.set_receipt(&tx_hash, receipt(&tx_hash, 100, true));
    chain.set_block_hash(100, "0xblock100");
    manager.receipt_checker().poll_once().await.unwrap();
    let with_receipt = store.get_transaction(created.id).await.unwrap().unwrap();
    assert!(with_receipt.receipt.is_some());
    assert_eq!(with_receipt.state, TransactionState::Tracking);

    // Two confirmations out of three: wait.
    chain.set_latest_height(101);
    manager.finality_manager().run_cycle().await.unwrap();
    assert!(manager.completions_after(0, 10).await.unwrap().events.is_empty());

    chain.set_latest_height(102);
    manager.finality_manager().run_cycle().await.unwrap();
    let done = store.get_transaction(created.id).await.unwrap().unwrap();
    assert_eq!(done.state, TransactionState::Confirmed);
    assert!(done.confirmed_at.is_some());

    let page = manager.completions_after(0, 10).await.unwrap();
    assert_eq!(page.events.len(), 1);
    assert_eq!(page.events[0].transaction_id, created.id);
    assert_eq!(page.events[0].status, TransactionState::Confirmed);

    // A further cycle has nothing left to finalize.
    manager.finality_manager().run_cycle().await.unwrap();
    assert_eq!(manager.completions_after(0, 10).await.unwrap().events.len(), 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_failed_receipt_finalizes_as_failed_final() {
    let store = Arc::new(InMemoryTransactionStore::new());
    let chain = Arc::new(MockChainConnector::new());
    let manager = manager_over(&store, &chain);

    let created = manager
        .create_transaction(request("0xsubmitter", None))
        .await
        .unwrap();
    let tx_hash = wait_for_tracking(&store, created.id)
        .await
        .tx_hash
        .unwrap();

    chain.set_receipt(&tx_hash, receipt(&tx_hash, 50, false));
    chain.set_block_hash(50, "0xblock50");
    chain.set_latest_height(60);
    manager.receipt_checker().poll_once().await.unwrap();
    manager.finality_manager().run_cycle().await.unwrap();

    let page = manager.completions_after(0, 10).await.unwrap();
    assert_eq!(page.events.len(), 1);
    assert_eq!(page.events[0].status, TransactionState::FailedFinal);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_reorg_fails_closed_as_stuck() {
    let store = Arc::new(InMemoryTransactionStore::new());
    let chain = Arc::new(MockChainConnector::new());
    let manager = manager_over(&store, &chain);

    let created = manager
        .create_transaction(request("0xsubmitter", None))
        .await
        .unwrap();
    let tx_hash = wait_for_tracking(&store, created.id)
        .await
        .tx_hash
        .unwrap();

    chain.set_receipt(&tx_hash, receipt(&tx_hash, 80, true));
    chain.set_block_hash(80, "0xblock80");
    manager.receipt_checker().poll_once().await.unwrap();

    chain.set_block_hash(80, "0xforked");
    chain.set_latest_height(200);
    manager.finality_manager().run_cycle().await.unwrap();

    let stuck = store.get_transaction(created.id).await.unwrap().unwrap();
    assert_eq!(stuck.state, TransactionState::Stuck);
    assert_eq!(stuck.sub_state.as_deref(), Some(sub_state::REORG_DETECTED));
    assert!(stuck.confirmed_at.is_none());
    let page = manager.completions_after(0, 10).await.unwrap();
    assert_eq!(page.events[0].status, TransactionState::Stuck);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_creates_get_distinct_contiguous_nonces() {
    let store = Arc::new(InMemoryTransactionStore::new());
    let chain = Arc::new(MockChainConnector::new());
    chain.set_pending_nonce("0xsubmitter", 5);
    let manager = manager_over(&store, &chain);

    let mut handles = Vec::new();
    for i in 0..10 {
        let manager = Arc::clone(&manager);
        handles.push(tokio::spawn(async move {
            manager
                .create_transaction(request("0xsubmitter", Some(&format!("order-{}", i))))
                .await
        }));
    }
    let mut nonces = Vec::new();
    for handle in handles {
        nonces.push(handle.await.unwrap().unwrap().nonce);
    }
    nonces.sort_unstable();
    assert_eq!(nonces, (5..15).collect::<Vec<_>>());

    let cursor = store.get_nonce_cursor("0xsubmitter").await.unwrap().unwrap();
    assert_eq!(cursor.next_nonce, 15);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_idempotent_create_sends_once() {
    let store = Arc::new(InMemoryTransactionStore::new());
    let chain = Arc::new(MockChainConnector::new());
    let manager = manager_over(&store, &chain);

    let first = manager
        .create_transaction(request("0xsubmitter", Some("order-9")))
        .await
        .unwrap();
    wait_for_tracking(&store, first.id).await;
    let again = manager
        .create_transaction(request("0xsubmitter", Some("order-9")))
        .await
        .unwrap();

    assert_eq!(again.id, first.id);
    assert_eq!(again.state, TransactionState::Tracking);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(chain.send_calls(), 1);
    assert_eq!(store.transaction_count(), 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_takeover_fences_out_previous_leader() {
    let store = Arc::new(InMemoryTransactionStore::new());
    let chain = Arc::new(MockChainConnector::new());
    let node_a = manager_over(&store, &chain);
    let node_b = manager_over(&store, &chain);

    let first = node_a
        .create_transaction(request("0xsubmitter", None))
        .await
        .unwrap();
    wait_for_tracking(&store, first.id).await;
    let token_a = store.get_lease("0xsubmitter").await.unwrap().unwrap().fencing_token;

    // Node B follows while A's lease is valid.
    let result = node_b.create_transaction(request("0xsubmitter", None)).await;
    assert!(matches!(result, Err(AppError::NotLeader { .. })));

    store.advance_clock(chrono::Duration::seconds(60));
    let second = node_b
        .create_transaction(request("0xsubmitter", None))
        .await
        .unwrap();
    let lease = store.get_lease("0xsubmitter").await.unwrap().unwrap();
    assert_eq!(lease.owner_id, node_b.leases().node_id());
    assert!(lease.fencing_token > token_a);
    assert_eq!(second.nonce, first.nonce + 1);
    wait_for_tracking(&store, second.id).await;

    // A is now a follower for this submitter.
    let result = node_a.create_transaction(request("0xsubmitter", None)).await;
    assert!(matches!(result, Err(AppError::NotLeader { .. })));

    node_a.shutdown().await;
    node_b.shutdown().await;
}

#[tokio::test]
async fn test_operator_mark_stuck_emits_completion() {
    let store = Arc::new(InMemoryTransactionStore::new());
    let chain = Arc::new(MockChainConnector::new());
    let hook = |_: &StuckContext| StuckDecision::MarkStuck;
    let manager = TxManager::builder(store.clone(), chain.clone())
        .config(config(3))
        .stuck_hook(Arc::new(hook))
        .background_workers(false)
        .build();

    let created = manager
        .create_transaction(request("0xsubmitter", None))
        .await
        .unwrap();
    wait_for_tracking(&store, created.id).await;

    let applied = manager.resolve_stuck(created.id).await.unwrap();
    assert_eq!(applied.decision, StuckDecision::MarkStuck);

    let stuck = store.get_transaction(created.id).await.unwrap().unwrap();
    assert_eq!(stuck.state, TransactionState::Stuck);
    assert_eq!(stuck.sub_state.as_deref(), Some(sub_state::MARKED_STUCK));

    let page = manager.completions_after(0, 10).await.unwrap();
    assert_eq!(page.events.len(), 1);
    assert_eq!(page.events[0].status, TransactionState::Stuck);

    // Terminal rows are rejected by the operator path.
    assert!(matches!(
        manager.resolve_stuck(created.id).await,
        Err(AppError::Validation(_))
    ));

    manager.shutdown().await;
}
