//! In-memory [`TransactionStore`] with the same fenced-write semantics as
//! the Postgres store.
//!
//! A store transaction takes the whole store's lock and works on a copy,
//! which is written back on commit. That is stricter than row locks but gives
//! the same isolation the writer batch relies on. The clock is frozen and
//! only moves through [`InMemoryTransactionStore::advance_clock`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard, OwnedMutexGuard};
use uuid::Uuid;

use crate::domain::{
    AppError, CompletionEvent, DatabaseError, FencedWrite, ManagedTransaction, NonceCursor,
    StoreTransaction, SubmitterBacklog, SubmitterLease, TerminalUpdate, TransactionReceipt,
    TransactionState, TransactionStore,
};

#[derive(Debug, Clone, Default)]
struct StoreState {
    transactions: HashMap<Uuid, ManagedTransaction>,
    leases: HashMap<String, SubmitterLease>,
    cursors: HashMap<String, NonceCursor>,
    completions: Vec<CompletionEvent>,
    last_sequence: i64,
}

impl StoreState {
    /// Whether `write` presents the submitter's current token.
    fn fence_holds(&self, write: &FencedWrite, reject_all: bool) -> bool {
        !reject_all
            && self
                .leases
                .get(&write.submitter)
                .is_some_and(|lease| lease.fencing_token == write.fencing_token)
    }

    /// The row `write` targets, if the fence holds and the row belongs to the submitter.
    fn fenced_row(
        &mut self,
        write: &FencedWrite,
        reject_all: bool,
    ) -> Option<&mut ManagedTransaction> {
        if !self.fence_holds(write, reject_all) {
            return None;
        }
        self.transactions
            .get_mut(&write.transaction_id)
            .filter(|tx| tx.submitter == write.submitter)
    }

    fn find_by_request_id(&self, submitter: &str, request_id: &str) -> Option<ManagedTransaction> {
        self.transactions
            .values()
            .find(|tx| tx.submitter == submitter && tx.request_id.as_deref() == Some(request_id))
            .cloned()
    }
}

fn is_resendable(tx: &ManagedTransaction) -> bool {
    matches!(
        tx.state,
        TransactionState::Allocated | TransactionState::Tracking
    ) && tx.receipt.is_none()
}

fn after(now: DateTime<Utc>, delay: Duration) -> Result<DateTime<Utc>, AppError> {
    chrono::Duration::from_std(delay)
        .map(|d| now + d)
        .map_err(|e| AppError::Internal(format!("Invalid delay: {}", e)))
}

/// In-memory store for tests
pub struct InMemoryTransactionStore {
    state: Arc<AsyncMutex<StoreState>>,
    clock: Arc<Mutex<DateTime<Utc>>>,
    reject_fenced: Arc<AtomicBool>,
    fail_next_insert: Arc<AtomicBool>,
    is_healthy: AtomicBool,
}

impl InMemoryTransactionStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(AsyncMutex::new(StoreState::default())),
            clock: Arc::new(Mutex::new(Utc::now())),
            reject_fenced: Arc::new(AtomicBool::new(false)),
            fail_next_insert: Arc::new(AtomicBool::new(false)),
            is_healthy: AtomicBool::new(true),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.clock.lock().unwrap()
    }

    pub fn advance_clock(&self, by: chrono::Duration) {
        let mut clock = self.clock.lock().unwrap();
        *clock += by;
    }

    /// Make every fenced write affect zero rows, as if the lease moved on.
    pub fn reject_fenced_writes(&self, reject: bool) {
        self.reject_fenced.store(reject, Ordering::Relaxed);
    }

    /// Fail the next `insert_transaction` with a query error.
    pub fn fail_next_insert(&self) {
        self.fail_next_insert.store(true, Ordering::Relaxed);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.is_healthy.store(healthy, Ordering::Relaxed);
    }

    fn state_now(&self) -> MutexGuard<'_, StoreState> {
        self.state
            .try_lock()
            .expect("store is inside an open transaction")
    }

    /// Insert or overwrite a lease row expiring `ttl` from now.
    pub fn seed_lease(&self, submitter: &str, owner: &str, fencing_token: i64, ttl: chrono::Duration) {
        let now = self.now();
        self.state_now().leases.insert(
            submitter.to_string(),
            SubmitterLease {
                submitter: submitter.to_string(),
                owner_id: owner.to_string(),
                fencing_token,
                expires_at: now + ttl,
                updated_at: now,
            },
        );
    }

    /// Insert a `Tracking` row that is due for resubmission now.
    pub fn seed_tracking(
        &self,
        submitter: &str,
        nonce: u64,
        tx_hash: &str,
        submit_attempts: i32,
        fencing_token: i64,
    ) -> ManagedTransaction {
        let now = self.now();
        let mut tx = ManagedTransaction::allocated(
            submitter.to_string(),
            None,
            nonce,
            serde_json::json!({"to": "0xrecipient", "nonce_hint": nonce}),
            fencing_token,
            now,
        );
        tx.state = TransactionState::Tracking;
        tx.tx_hash = Some(tx_hash.to_string());
        tx.submit_attempts = submit_attempts;
        tx.last_submit_at = Some(now);
        tx.next_resubmit_at = Some(now);
        self.state_now().transactions.insert(tx.id, tx.clone());
        tx
    }

    pub fn attach_receipt(&self, id: Uuid, receipt: &TransactionReceipt) {
        if let Some(tx) = self.state_now().transactions.get_mut(&id) {
            tx.receipt = serde_json::to_value(receipt).ok();
            tx.tx_hash = Some(receipt.tx_hash.clone());
        }
    }

    pub fn set_next_resubmit_in(&self, id: Uuid, delay: chrono::Duration) {
        let now = self.now();
        if let Some(tx) = self.state_now().transactions.get_mut(&id) {
            tx.next_resubmit_at = Some(now + delay);
        }
    }

    /// Append a completion event directly, bypassing the fence.
    pub fn seed_completion(&self, id: Uuid, status: TransactionState) -> CompletionEvent {
        let now = self.now();
        let mut state = self.state_now();
        state.last_sequence += 1;
        let event = CompletionEvent {
            sequence: state.last_sequence,
            transaction_id: id,
            occurred_at: now,
            status,
        };
        state.completions.push(event.clone());
        event
    }

    pub fn transaction_count(&self) -> usize {
        self.state_now().transactions.len()
    }

    /// All rows ordered by submitter and nonce
    pub fn all_transactions(&self) -> Vec<ManagedTransaction> {
        let mut all: Vec<_> = self.state_now().transactions.values().cloned().collect();
        all.sort_by(|a, b| (&a.submitter, a.nonce).cmp(&(&b.submitter, b.nonce)));
        all
    }

    fn reject_all(&self) -> bool {
        self.reject_fenced.load(Ordering::Relaxed)
    }

    async fn fenced_update<F>(&self, write: &FencedWrite, apply: F) -> Result<u64, AppError>
    where
        F: FnOnce(&mut ManagedTransaction, DateTime<Utc>) -> Result<bool, AppError> + Send,
    {
        let now = self.now();
        let reject = self.reject_all();
        let mut state = self.state.lock().await;
        let Some(tx) = state.fenced_row(write, reject) else {
            return Ok(0);
        };
        if apply(tx, now)? {
            tx.fencing_token = write.fencing_token;
            tx.updated_at = now;
            Ok(1)
        } else {
            Ok(0)
        }
    }
}

impl Default for InMemoryTransactionStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Store transaction over a private copy of the state
pub struct InMemoryStoreTransaction {
    guard: OwnedMutexGuard<StoreState>,
    working: StoreState,
    now: DateTime<Utc>,
    reject_fenced: bool,
    fail_next_insert: Arc<AtomicBool>,
}

#[async_trait]
impl StoreTransaction for InMemoryStoreTransaction {
    async fn database_now(&mut self) -> Result<DateTime<Utc>, AppError> {
        Ok(self.now)
    }

    async fn lock_lease(&mut self, submitter: &str) -> Result<Option<SubmitterLease>, AppError> {
        Ok(self.working.leases.get(submitter).cloned())
    }

    async fn insert_lease(&mut self, lease: &SubmitterLease) -> Result<bool, AppError> {
        if self.working.leases.contains_key(&lease.submitter) {
            return Ok(false);
        }
        self.working
            .leases
            .insert(lease.submitter.clone(), lease.clone());
        Ok(true)
    }

    async fn update_lease(&mut self, lease: &SubmitterLease) -> Result<(), AppError> {
        self.working
            .leases
            .insert(lease.submitter.clone(), lease.clone());
        Ok(())
    }

    async fn find_by_request_id(
        &mut self,
        submitter: &str,
        request_id: &str,
    ) -> Result<Option<ManagedTransaction>, AppError> {
        Ok(self.working.find_by_request_id(submitter, request_id))
    }

    async fn insert_transaction(&mut self, transaction: &ManagedTransaction) -> Result<(), AppError> {
        if self.fail_next_insert.swap(false, Ordering::Relaxed) {
            return Err(AppError::Database(DatabaseError::Query(
                "Injected insert failure".to_string(),
            )));
        }
        let duplicate_nonce = self
            .working
            .transactions
            .values()
            .any(|tx| tx.submitter == transaction.submitter && tx.nonce == transaction.nonce);
        let duplicate_request = transaction.request_id.as_deref().is_some_and(|rid| {
            self.working
                .find_by_request_id(&transaction.submitter, rid)
                .is_some()
        });
        if duplicate_nonce || duplicate_request {
            return Err(AppError::Database(DatabaseError::Duplicate(format!(
                "Transaction for {} at nonce {} already exists",
                transaction.submitter, transaction.nonce
            ))));
        }
        self.working
            .transactions
            .insert(transaction.id, transaction.clone());
        Ok(())
    }

    async fn get_nonce_cursor(&mut self, submitter: &str) -> Result<Option<NonceCursor>, AppError> {
        Ok(self.working.cursors.get(submitter).cloned())
    }

    async fn advance_nonce_cursor(
        &mut self,
        submitter: &str,
        next_nonce: u64,
        fencing_token: i64,
    ) -> Result<u64, AppError> {
        let fence = FencedWrite {
            transaction_id: Uuid::nil(),
            submitter: submitter.to_string(),
            fencing_token,
        };
        if !self.working.fence_holds(&fence, self.reject_fenced) {
            return Ok(0);
        }
        let now = self.now;
        let cursor = self
            .working
            .cursors
            .entry(submitter.to_string())
            .or_insert_with(|| NonceCursor {
                submitter: submitter.to_string(),
                next_nonce,
                fencing_token,
                updated_at: now,
            });
        cursor.next_nonce = cursor.next_nonce.max(next_nonce);
        cursor.fencing_token = fencing_token;
        cursor.updated_at = now;
        Ok(1)
    }

    async fn commit(self: Box<Self>) -> Result<(), AppError> {
        let this = *self;
        let mut guard = this.guard;
        *guard = this.working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), AppError> {
        Ok(())
    }
}

#[async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn health_check(&self) -> Result<(), AppError> {
        if !self.is_healthy.load(Ordering::Relaxed) {
            return Err(AppError::Database(DatabaseError::Connection(
                "Unhealthy".to_string(),
            )));
        }
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, AppError> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(InMemoryStoreTransaction {
            guard,
            working,
            now: self.now(),
            reject_fenced: self.reject_all(),
            fail_next_insert: Arc::clone(&self.fail_next_insert),
        }))
    }

    async fn database_now(&self) -> Result<DateTime<Utc>, AppError> {
        Ok(self.now())
    }

    async fn get_transaction(&self, id: Uuid) -> Result<Option<ManagedTransaction>, AppError> {
        Ok(self.state.lock().await.transactions.get(&id).cloned())
    }

    async fn get_by_request_id(
        &self,
        submitter: &str,
        request_id: &str,
    ) -> Result<Option<ManagedTransaction>, AppError> {
        Ok(self
            .state
            .lock()
            .await
            .find_by_request_id(submitter, request_id))
    }

    async fn get_lease(&self, submitter: &str) -> Result<Option<SubmitterLease>, AppError> {
        Ok(self.state.lock().await.leases.get(submitter).cloned())
    }

    async fn get_nonce_cursor(&self, submitter: &str) -> Result<Option<NonceCursor>, AppError> {
        Ok(self.state.lock().await.cursors.get(submitter).cloned())
    }

    async fn list_due_resubmits(&self, limit: i64) -> Result<Vec<ManagedTransaction>, AppError> {
        let now = self.now();
        let state = self.state.lock().await;
        let mut due: Vec<_> = state
            .transactions
            .values()
            .filter(|tx| is_resendable(tx) && tx.next_resubmit_at.is_some_and(|at| at <= now))
            .cloned()
            .collect();
        due.sort_by_key(|tx| (tx.next_resubmit_at, tx.nonce));
        due.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(due)
    }

    async fn list_submitter_backlogs(&self, limit: i64) -> Result<Vec<SubmitterBacklog>, AppError> {
        let now = self.now();
        let state = self.state.lock().await;
        let mut grouped: HashMap<&str, (i64, &ManagedTransaction)> = HashMap::new();
        for tx in state.transactions.values().filter(|tx| is_resendable(tx)) {
            grouped
                .entry(tx.submitter.as_str())
                .and_modify(|(count, oldest)| {
                    *count += 1;
                    if tx.nonce < oldest.nonce {
                        *oldest = tx;
                    }
                })
                .or_insert((1, tx));
        }
        let mut backlogs: Vec<_> = grouped
            .into_iter()
            .map(|(submitter, (count, oldest))| SubmitterBacklog {
                submitter: submitter.to_string(),
                pending_count: count,
                oldest_transaction_id: oldest.id,
                oldest_age: now - oldest.created_at,
            })
            .collect();
        backlogs.sort_by(|a, b| {
            b.pending_count
                .cmp(&a.pending_count)
                .then(b.oldest_age.cmp(&a.oldest_age))
        });
        backlogs.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(backlogs)
    }

    async fn list_receipt_candidates(&self, limit: i64) -> Result<Vec<ManagedTransaction>, AppError> {
        let state = self.state.lock().await;
        let mut candidates: Vec<_> = state
            .transactions
            .values()
            .filter(|tx| {
                tx.state == TransactionState::Tracking && tx.tx_hash.is_some() && tx.receipt.is_none()
            })
            .cloned()
            .collect();
        candidates.sort_by_key(|tx| (tx.last_receipt_check_at, tx.nonce));
        candidates.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(candidates)
    }

    async fn list_finality_candidates(
        &self,
        limit: i64,
    ) -> Result<Vec<ManagedTransaction>, AppError> {
        let state = self.state.lock().await;
        let mut candidates: Vec<_> = state
            .transactions
            .values()
            .filter(|tx| {
                tx.state == TransactionState::Tracking
                    && tx.receipt.is_some()
                    && tx.confirmed_at.is_none()
            })
            .cloned()
            .collect();
        candidates.sort_by_key(|tx| (tx.updated_at, tx.nonce));
        candidates.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(candidates)
    }

    async fn record_submission(
        &self,
        write: &FencedWrite,
        tx_hash: &str,
        sub_state: Option<&str>,
        resubmit_after: Duration,
    ) -> Result<u64, AppError> {
        self.fenced_update(write, |tx, now| {
            if !is_resendable(tx) {
                return Ok(false);
            }
            tx.tx_hash = Some(tx_hash.to_string());
            tx.state = TransactionState::Tracking;
            tx.sub_state = sub_state.map(str::to_string);
            tx.last_submit_at = Some(now);
            tx.submit_attempts += 1;
            tx.next_resubmit_at = Some(after(now, resubmit_after)?);
            tx.last_error = None;
            Ok(true)
        })
        .await
    }

    async fn claim_resubmit(
        &self,
        write: &FencedWrite,
        expected_deadline: Option<DateTime<Utc>>,
        resubmit_after: Duration,
    ) -> Result<u64, AppError> {
        self.fenced_update(write, |tx, now| {
            if !is_resendable(tx) || tx.next_resubmit_at != expected_deadline {
                return Ok(false);
            }
            tx.next_resubmit_at = Some(after(now, resubmit_after)?);
            Ok(true)
        })
        .await
    }

    async fn record_submit_failure(
        &self,
        write: &FencedWrite,
        error: &str,
        retry_after: Duration,
    ) -> Result<u64, AppError> {
        self.fenced_update(write, |tx, now| {
            if !is_resendable(tx) {
                return Ok(false);
            }
            tx.submit_attempts += 1;
            tx.last_error = Some(error.to_string());
            tx.next_resubmit_at = Some(after(now, retry_after)?);
            Ok(true)
        })
        .await
    }

    async fn reschedule(
        &self,
        write: &FencedWrite,
        resubmit_after: Duration,
        note: Option<&str>,
    ) -> Result<u64, AppError> {
        self.fenced_update(write, |tx, now| {
            if tx.state.is_terminal() {
                return Ok(false);
            }
            tx.next_resubmit_at = Some(after(now, resubmit_after)?);
            if let Some(note) = note {
                tx.last_error = Some(note.to_string());
            }
            Ok(true)
        })
        .await
    }

    async fn record_receipt_check(&self, write: &FencedWrite, tx_hash: &str) -> Result<u64, AppError> {
        self.fenced_update(write, |tx, now| {
            if tx.state != TransactionState::Tracking
                || tx.receipt.is_some()
                || tx.tx_hash.as_deref() != Some(tx_hash)
            {
                return Ok(false);
            }
            tx.last_receipt_check_at = Some(now);
            Ok(true)
        })
        .await
    }

    async fn store_receipt(
        &self,
        write: &FencedWrite,
        receipt: &TransactionReceipt,
    ) -> Result<u64, AppError> {
        let raw = serde_json::to_value(receipt)
            .map_err(|e| AppError::Serialization(e.to_string()))?;
        self.fenced_update(write, |tx, now| {
            if tx.state != TransactionState::Tracking || tx.receipt.is_some() {
                return Ok(false);
            }
            tx.receipt = Some(raw);
            tx.tx_hash = Some(receipt.tx_hash.clone());
            tx.last_receipt_check_at = Some(now);
            Ok(true)
        })
        .await
    }

    async fn complete_transaction(
        &self,
        write: &FencedWrite,
        update: &TerminalUpdate,
    ) -> Result<Option<CompletionEvent>, AppError> {
        let now = self.now();
        let reject = self.reject_all();
        let mut state = self.state.lock().await;
        let Some(tx) = state.fenced_row(write, reject) else {
            return Ok(None);
        };
        if tx.state.is_terminal() {
            return Ok(None);
        }
        tx.state = update.state;
        if let Some(sub_state) = &update.sub_state {
            tx.sub_state = Some(sub_state.clone());
        }
        if let Some(error) = &update.error {
            tx.last_error = Some(error.clone());
        }
        if update.sets_confirmed_at() {
            tx.confirmed_at = Some(now);
        }
        tx.next_resubmit_at = None;
        tx.fencing_token = write.fencing_token;
        tx.updated_at = now;

        state.last_sequence += 1;
        let event = CompletionEvent {
            sequence: state.last_sequence,
            transaction_id: write.transaction_id,
            occurred_at: now,
            status: update.state,
        };
        state.completions.push(event.clone());
        Ok(Some(event))
    }

    async fn list_completions(
        &self,
        after_sequence: i64,
        limit: i64,
    ) -> Result<Vec<CompletionEvent>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .completions
            .iter()
            .filter(|e| e.sequence > after_sequence)
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }
}
