//! Domain traits defining contracts for external systems.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use super::error::AppError;
use super::types::{
    CompletionEvent, FencedWrite, ManagedTransaction, NonceCacheEntry, NonceCursor,
    StuckContext, StuckDecision, SubmitterBacklog, SubmitterLease, TerminalUpdate,
    TransactionReceipt,
};

/// Chain connector trait for chain operations
#[async_trait]
pub trait ChainConnector: Send + Sync {
    /// Check RPC connectivity
    async fn health_check(&self) -> Result<(), AppError>;

    /// Pending-inclusive transaction count for the submitter
    async fn get_pending_nonce(&self, submitter: &str) -> Result<u64, AppError>;

    /// Send a transaction at an explicit nonce, returning its hash
    async fn send_transaction(
        &self,
        submitter: &str,
        nonce: u64,
        payload: &serde_json::Value,
    ) -> Result<String, AppError>;

    /// Fetch a receipt. `Ok(None)` means "not found yet", which is not an error.
    async fn get_transaction_receipt(
        &self,
        tx_hash: &str,
    ) -> Result<Option<TransactionReceipt>, AppError>;

    /// Latest block height
    async fn get_latest_block_height(&self) -> Result<u64, AppError> {
        Err(AppError::NotSupported(
            "get_latest_block_height not implemented".to_string(),
        ))
    }

    /// Canonical block hash at a height
    async fn get_block_hash(&self, height: u64) -> Result<Option<String>, AppError> {
        let _ = height;
        Err(AppError::NotSupported(
            "get_block_hash not implemented".to_string(),
        ))
    }

    /// Best-effort hash of what a send at this nonce would have produced
    async fn derive_expected_tx_hash(
        &self,
        submitter: &str,
        nonce: u64,
        payload: &serde_json::Value,
    ) -> Result<String, AppError> {
        let _ = (submitter, nonce, payload);
        Err(AppError::NotSupported(
            "derive_expected_tx_hash not implemented".to_string(),
        ))
    }
}

/// Database transaction scope used by the lease manager and the writer batch.
///
/// Dropping without `commit` rolls back.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Database clock, used for leases and record timestamps
    async fn database_now(&mut self) -> Result<DateTime<Utc>, AppError>;

    /// Read the lease row with a row-level lock
    async fn lock_lease(&mut self, submitter: &str) -> Result<Option<SubmitterLease>, AppError>;

    /// Insert a new lease row. Returns `false` if another node inserted first.
    async fn insert_lease(&mut self, lease: &SubmitterLease) -> Result<bool, AppError>;

    /// Overwrite a lease row previously locked in this transaction
    async fn update_lease(&mut self, lease: &SubmitterLease) -> Result<(), AppError>;

    async fn find_by_request_id(
        &mut self,
        submitter: &str,
        request_id: &str,
    ) -> Result<Option<ManagedTransaction>, AppError>;

    async fn insert_transaction(&mut self, transaction: &ManagedTransaction)
    -> Result<(), AppError>;

    async fn get_nonce_cursor(&mut self, submitter: &str)
    -> Result<Option<NonceCursor>, AppError>;

    /// Fenced upsert of the durable nonce floor. Returns affected rows.
    async fn advance_nonce_cursor(
        &mut self,
        submitter: &str,
        next_nonce: u64,
        fencing_token: i64,
    ) -> Result<u64, AppError>;

    async fn commit(self: Box<Self>) -> Result<(), AppError>;

    async fn rollback(self: Box<Self>) -> Result<(), AppError>;
}

/// Persistence boundary for managed transactions.
///
/// Every method taking a [`FencedWrite`] is a single conditional update that
/// only applies while the submitter's lease still carries the given token, and
/// returns the affected-row count for the caller to check.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Check database connectivity
    async fn health_check(&self) -> Result<(), AppError>;

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, AppError>;

    async fn database_now(&self) -> Result<DateTime<Utc>, AppError>;

    async fn get_transaction(&self, id: Uuid) -> Result<Option<ManagedTransaction>, AppError>;

    async fn get_by_request_id(
        &self,
        submitter: &str,
        request_id: &str,
    ) -> Result<Option<ManagedTransaction>, AppError>;

    async fn get_lease(&self, submitter: &str) -> Result<Option<SubmitterLease>, AppError>;

    async fn get_nonce_cursor(&self, submitter: &str) -> Result<Option<NonceCursor>, AppError>;

    /// Receiptless `Allocated`/`Tracking` rows whose resubmit deadline has passed
    async fn list_due_resubmits(&self, limit: i64) -> Result<Vec<ManagedTransaction>, AppError>;

    /// Per-submitter summary of receiptless, non-terminal rows
    async fn list_submitter_backlogs(&self, limit: i64)
    -> Result<Vec<SubmitterBacklog>, AppError>;

    /// `Tracking` rows with a hash but no receipt
    async fn list_receipt_candidates(&self, limit: i64)
    -> Result<Vec<ManagedTransaction>, AppError>;

    /// `Tracking` rows with a receipt but no confirmation timestamp
    async fn list_finality_candidates(
        &self,
        limit: i64,
    ) -> Result<Vec<ManagedTransaction>, AppError>;

    /// Record a send: set hash, move to `Tracking`, bump attempts.
    async fn record_submission(
        &self,
        write: &FencedWrite,
        tx_hash: &str,
        sub_state: Option<&str>,
        resubmit_after: Duration,
    ) -> Result<u64, AppError>;

    /// Push the resubmit deadline out, but only if it still equals `expected_deadline`.
    async fn claim_resubmit(
        &self,
        write: &FencedWrite,
        expected_deadline: Option<DateTime<Utc>>,
        resubmit_after: Duration,
    ) -> Result<u64, AppError>;

    /// Record a failed send: bump attempts, store error, set retry deadline.
    async fn record_submit_failure(
        &self,
        write: &FencedWrite,
        error: &str,
        retry_after: Duration,
    ) -> Result<u64, AppError>;

    /// Adjust the resubmit deadline (and optionally the error text) without a send.
    async fn reschedule(
        &self,
        write: &FencedWrite,
        resubmit_after: Duration,
        note: Option<&str>,
    ) -> Result<u64, AppError>;

    /// Touch the last-receipt-check timestamp while the row still carries `tx_hash`.
    async fn record_receipt_check(&self, write: &FencedWrite, tx_hash: &str)
    -> Result<u64, AppError>;

    async fn store_receipt(
        &self,
        write: &FencedWrite,
        receipt: &TransactionReceipt,
    ) -> Result<u64, AppError>;

    /// Move to a terminal state and append exactly one completion event.
    ///
    /// Returns `None` when the fenced update touched no row; no event is written then.
    async fn complete_transaction(
        &self,
        write: &FencedWrite,
        update: &TerminalUpdate,
    ) -> Result<Option<CompletionEvent>, AppError>;

    /// Events with sequence greater than `after_sequence`, ascending.
    ///
    /// Sequences must become visible in order: once `n` is readable, no event
    /// with a lower sequence may commit later.
    async fn list_completions(
        &self,
        after_sequence: i64,
        limit: i64,
    ) -> Result<Vec<CompletionEvent>, AppError>;
}

/// Process-local nonce cache. Purely advisory.
pub trait NonceCache: Send + Sync {
    /// Hand out the cached value and bump it in place, if the entry was
    /// cached after `fresh_after`.
    fn take_if_fresh(&self, submitter: &str, fresh_after: DateTime<Utc>) -> Option<u64>;

    fn peek(&self, submitter: &str) -> Option<NonceCacheEntry>;

    fn put(&self, submitter: &str, entry: NonceCacheEntry);

    fn clear(&self, submitter: &str);
}

/// Pluggable decision point for transactions that exhausted resubmission
pub trait StuckResolutionHook: Send + Sync {
    fn decide(&self, context: &StuckContext) -> StuckDecision;
}

impl<F> StuckResolutionHook for F
where
    F: Fn(&StuckContext) -> StuckDecision + Send + Sync,
{
    fn decide(&self, context: &StuckContext) -> StuckDecision {
        self(context)
    }
}

/// Observer port for operational counters. All methods default to no-ops.
pub trait MetricsObserver: Send + Sync {
    fn fenced_rejection(&self, operation: &'static str) {
        let _ = operation;
    }

    fn not_leader(&self, submitter: &str) {
        let _ = submitter;
    }

    fn batch_failed(&self, submitters: usize) {
        let _ = submitters;
    }

    fn completion_emitted(&self, event: &CompletionEvent) {
        let _ = event;
    }

    fn chain_error(&self, operation: &'static str) {
        let _ = operation;
    }

    fn resubmitted(&self, submitter: &str) {
        let _ = submitter;
    }
}
