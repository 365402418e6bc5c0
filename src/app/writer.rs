//! Hash-routed, batched transaction creation.
//!
//! Every submitter maps to exactly one worker queue, so one submitter's
//! creates are serialized without per-request database locking. Each worker
//! drains up to `batch_size` requests and writes them in a single database
//! transaction; chain submission happens only after that transaction commits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::config::{chain_call_timeout_from_env, env_or, env_secs, DEFAULT_CHAIN_CALL_TIMEOUT};
use super::lease::LeaseManager;
use super::nonce::NonceAllocator;
use super::worker::with_chain_timeout;
use crate::domain::{
    AppError, ChainConnector, CreateTransactionRequest, FencedWrite, ManagedTransaction,
    MetricsObserver, StoreTransaction, TransactionStore, sub_state,
};

/// Writer configuration
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Number of hash-routed worker queues
    pub worker_count: usize,
    /// Maximum requests written per database transaction
    pub batch_size: usize,
    /// Bounded capacity of each worker queue
    pub queue_capacity: usize,
    /// Resubmit deadline stamped on newly created and freshly sent records
    pub initial_resubmit_delay: Duration,
    pub chain_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            worker_count: 8,
            batch_size: 50,
            queue_capacity: 1024,
            initial_resubmit_delay: Duration::from_secs(30),
            chain_timeout: DEFAULT_CHAIN_CALL_TIMEOUT,
        }
    }
}

impl WriterConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            worker_count: env_or("WRITER_WORKERS", defaults.worker_count).max(1),
            batch_size: env_or("WRITER_BATCH_SIZE", defaults.batch_size).max(1),
            queue_capacity: env_or("WRITER_QUEUE_CAPACITY", defaults.queue_capacity).max(1),
            initial_resubmit_delay: env_secs(
                "INITIAL_RESUBMIT_DELAY_SECS",
                defaults.initial_resubmit_delay,
            ),
            chain_timeout: chain_call_timeout_from_env(),
        }
    }
}

/// Stable worker index for a submitter.
#[must_use]
pub fn route_index(submitter: &str, worker_count: usize) -> usize {
    let digest = Sha256::digest(submitter.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % worker_count.max(1) as u64) as usize
}

/// A queued create request and the channel its result is delivered on
pub struct CreateOp {
    pub request: CreateTransactionRequest,
    pub responder: oneshot::Sender<Result<ManagedTransaction, AppError>>,
}

impl CreateOp {
    #[must_use]
    pub fn new(
        request: CreateTransactionRequest,
    ) -> (Self, oneshot::Receiver<Result<ManagedTransaction, AppError>>) {
        let (responder, receiver) = oneshot::channel();
        (Self { request, responder }, receiver)
    }
}

/// Per-op result of a batch, before the batch commits
#[derive(Debug)]
enum OpOutcome {
    Created(ManagedTransaction),
    Existing(ManagedTransaction),
    Rejected(AppError),
}

/// Writes create batches and performs post-commit submission.
pub struct BatchProcessor {
    store: Arc<dyn TransactionStore>,
    chain: Arc<dyn ChainConnector>,
    leases: Arc<LeaseManager>,
    allocator: Arc<NonceAllocator>,
    metrics: Arc<dyn MetricsObserver>,
    config: WriterConfig,
}

impl BatchProcessor {
    #[must_use]
    pub fn new(
        store: Arc<dyn TransactionStore>,
        chain: Arc<dyn ChainConnector>,
        leases: Arc<LeaseManager>,
        allocator: Arc<NonceAllocator>,
        metrics: Arc<dyn MetricsObserver>,
        config: WriterConfig,
    ) -> Self {
        Self {
            store,
            chain,
            leases,
            allocator,
            metrics,
            config,
        }
    }

    /// Process one batch and answer every op.
    ///
    /// Returns the records created by this batch; they still need
    /// [`BatchProcessor::submit_created`].
    #[instrument(skip(self, ops), fields(batch_size = ops.len()))]
    pub async fn process_batch(&self, ops: Vec<CreateOp>) -> Vec<ManagedTransaction> {
        let (requests, responders): (Vec<_>, Vec<_>) = ops
            .into_iter()
            .map(|op| (op.request, op.responder))
            .unzip();

        let outcome = match self.store.begin().await {
            Ok(mut tx) => match self.execute_batch(tx.as_mut(), &requests).await {
                Ok(outcomes) => match tx.commit().await {
                    Ok(()) => Ok(outcomes),
                    Err(e) => Err(e),
                },
                Err(e) => {
                    if let Err(rollback_err) = tx.rollback().await {
                        warn!(error = %rollback_err, "Rollback failed");
                    }
                    Err(e)
                }
            },
            Err(e) => Err(e),
        };

        match outcome {
            Ok(outcomes) => {
                let mut created = Vec::new();
                for (outcome, responder) in outcomes.into_iter().zip(responders) {
                    let result = match outcome {
                        OpOutcome::Created(record) => {
                            created.push(record.clone());
                            Ok(record)
                        }
                        OpOutcome::Existing(record) => Ok(record),
                        OpOutcome::Rejected(e) => Err(e),
                    };
                    // Caller may have gone away; the record is durable regardless.
                    let _ = responder.send(result);
                }
                created
            }
            Err(e) => {
                let mut submitters: Vec<&str> =
                    requests.iter().map(|r| r.submitter.as_str()).collect();
                submitters.sort_unstable();
                submitters.dedup();
                for submitter in &submitters {
                    self.allocator.clear_cache(submitter);
                }
                self.metrics.batch_failed(submitters.len());
                error!(error = %e, submitters = submitters.len(), "Writer batch failed; rolled back");

                let surfaced = if e.is_leadership_loss() {
                    e
                } else {
                    AppError::BatchAborted(e.to_string())
                };
                for responder in responders {
                    let _ = responder.send(Err(surfaced.clone()));
                }
                Vec::new()
            }
        }
    }

    async fn execute_batch(
        &self,
        tx: &mut dyn StoreTransaction,
        requests: &[CreateTransactionRequest],
    ) -> Result<Vec<OpOutcome>, AppError> {
        let now = tx.database_now().await?;
        let initial_delay = chrono::Duration::from_std(self.config.initial_resubmit_delay)
            .map_err(|e| AppError::Internal(format!("Invalid resubmit delay: {}", e)))?;
        let mut outcomes: Vec<Option<OpOutcome>> = requests.iter().map(|_| None).collect();

        for (submitter, indices) in group_by_submitter(requests) {
            let grant = self.leases.acquire_or_renew_in(tx, submitter).await?;
            if !grant.is_leader {
                self.metrics.not_leader(submitter);
                for i in indices {
                    outcomes[i] = Some(OpOutcome::Rejected(AppError::NotLeader {
                        submitter: submitter.to_string(),
                        fencing_token: grant.fencing_token,
                    }));
                }
                continue;
            }

            let mut highest: Option<u64> = None;
            for i in indices {
                let request = &requests[i];
                if let Some(request_id) = request.request_id.as_deref() {
                    if let Some(existing) = tx.find_by_request_id(submitter, request_id).await? {
                        debug!(
                            submitter = %submitter,
                            request_id = %request_id,
                            transaction_id = %existing.id,
                            "Idempotent create short-circuited"
                        );
                        outcomes[i] = Some(OpOutcome::Existing(existing));
                        continue;
                    }
                }

                let nonce = self.allocator.next_nonce(tx, submitter, now).await?;
                let mut record = ManagedTransaction::allocated(
                    submitter.to_string(),
                    request.request_id.clone(),
                    nonce,
                    request.payload.clone(),
                    grant.fencing_token,
                    now,
                );
                record.next_resubmit_at = Some(now + initial_delay);
                tx.insert_transaction(&record).await?;
                highest = Some(highest.map_or(nonce, |h| h.max(nonce)));
                outcomes[i] = Some(OpOutcome::Created(record));
            }

            if let Some(highest) = highest {
                let next = self
                    .allocator
                    .cached_next(submitter)
                    .map_or(highest + 1, |cached| cached.max(highest + 1));
                let affected = tx
                    .advance_nonce_cursor(submitter, next, grant.fencing_token)
                    .await?;
                if affected == 0 {
                    self.metrics.fenced_rejection("advance_nonce_cursor");
                    warn!(
                        submitter = %submitter,
                        fencing_token = grant.fencing_token,
                        "Nonce cursor write fenced out; aborting batch"
                    );
                    return Err(AppError::FencedRejection {
                        operation: "advance_nonce_cursor",
                        transaction_id: None,
                    });
                }
            }
        }

        outcomes
            .into_iter()
            .map(|o| o.ok_or_else(|| AppError::Internal("Batch op left unanswered".to_string())))
            .collect()
    }

    /// Send a committed record to the chain and record the outcome.
    ///
    /// A record whose lease changed hands since creation is left for the
    /// current leader's resubmit scan.
    #[instrument(skip(self, record), fields(transaction_id = %record.id, submitter = %record.submitter, nonce = record.nonce))]
    pub async fn submit_created(&self, record: &ManagedTransaction) -> Result<(), AppError> {
        let grant = self.leases.acquire_or_renew(&record.submitter).await?;
        if !grant.is_leader || grant.fencing_token != record.fencing_token {
            self.metrics.fenced_rejection("submit_created");
            warn!(
                created_token = record.fencing_token,
                current_token = grant.fencing_token,
                "Lease changed before submission; skipping send"
            );
            return Err(AppError::FencedRejection {
                operation: "submit_created",
                transaction_id: Some(record.id),
            });
        }

        let write = FencedWrite::new(record, grant.fencing_token);
        let delay = self.config.initial_resubmit_delay;
        let sent = with_chain_timeout(
            self.config.chain_timeout,
            "send_transaction",
            self.chain
                .send_transaction(&record.submitter, record.nonce, &record.payload),
        )
        .await;

        let (affected, operation) = match sent {
            Ok(tx_hash) => {
                info!(tx_hash = %tx_hash, "Transaction sent");
                (
                    self.store
                        .record_submission(&write, &tx_hash, None, delay)
                        .await?,
                    "record_submission",
                )
            }
            Err(send_err) => {
                self.metrics.chain_error("send_transaction");
                warn!(error = %send_err, "Send failed; trying to derive expected hash");
                let derived = with_chain_timeout(
                    self.config.chain_timeout,
                    "derive_expected_tx_hash",
                    self.chain.derive_expected_tx_hash(
                        &record.submitter,
                        record.nonce,
                        &record.payload,
                    ),
                )
                .await;
                match derived {
                    Ok(tx_hash) => {
                        info!(tx_hash = %tx_hash, "Tracking derived hash");
                        (
                            self.store
                                .record_submission(
                                    &write,
                                    &tx_hash,
                                    Some(sub_state::DERIVED_HASH),
                                    delay,
                                )
                                .await?,
                            "record_submission",
                        )
                    }
                    Err(derive_err) => {
                        debug!(error = %derive_err, "No expected hash; leaving for resubmit");
                        (
                            self.store
                                .record_submit_failure(&write, &send_err.to_string(), delay)
                                .await?,
                            "record_submit_failure",
                        )
                    }
                }
            }
        };

        if affected == 0 {
            self.metrics.fenced_rejection(operation);
            warn!(operation, "Post-commit write fenced out");
            return Err(AppError::FencedRejection {
                operation,
                transaction_id: Some(record.id),
            });
        }
        Ok(())
    }
}

/// Group request indices by submitter, keeping first-seen order.
fn group_by_submitter(requests: &[CreateTransactionRequest]) -> Vec<(&str, Vec<usize>)> {
    let mut groups: Vec<(&str, Vec<usize>)> = Vec::new();
    let mut positions: HashMap<&str, usize> = HashMap::new();
    for (i, request) in requests.iter().enumerate() {
        let submitter = request.submitter.as_str();
        match positions.get(submitter) {
            Some(&pos) => groups[pos].1.push(i),
            None => {
                positions.insert(submitter, groups.len());
                groups.push((submitter, vec![i]));
            }
        }
    }
    groups
}

/// Handle to the running writer workers
pub struct TransactionWriter {
    queues: Vec<mpsc::Sender<CreateOp>>,
}

impl TransactionWriter {
    /// Spawn the worker pool. Must be called inside a Tokio runtime.
    pub fn spawn(
        processor: Arc<BatchProcessor>,
        config: &WriterConfig,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let worker_count = config.worker_count.max(1);
        let mut queues = Vec::with_capacity(worker_count);
        let mut handles = Vec::with_capacity(worker_count);

        for worker_id in 0..worker_count {
            let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
            queues.push(sender);
            handles.push(tokio::spawn(run_worker(
                worker_id,
                Arc::clone(&processor),
                receiver,
                config.batch_size.max(1),
                shutdown.clone(),
            )));
        }
        info!(workers = worker_count, "Transaction writer started");

        (Self { queues }, handles)
    }

    /// Queue a create request and wait for its batch to commit.
    pub async fn submit_create(
        &self,
        request: CreateTransactionRequest,
    ) -> Result<ManagedTransaction, AppError> {
        let index = route_index(&request.submitter, self.queues.len());
        let (op, receiver) = CreateOp::new(request);
        self.queues[index]
            .send(op)
            .await
            .map_err(|_| AppError::Internal("Writer queue closed".to_string()))?;
        receiver
            .await
            .map_err(|_| AppError::Internal("Writer dropped request".to_string()))?
    }
}

async fn run_worker(
    worker_id: usize,
    processor: Arc<BatchProcessor>,
    mut receiver: mpsc::Receiver<CreateOp>,
    batch_size: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let first = tokio::select! {
            op = receiver.recv() => match op {
                Some(op) => op,
                None => break,
            },
            _ = shutdown.changed() => break,
        };

        let mut batch = vec![first];
        while batch.len() < batch_size {
            match receiver.try_recv() {
                Ok(op) => batch.push(op),
                Err(_) => break,
            }
        }

        let created = processor.process_batch(batch).await;
        for record in created {
            let processor = Arc::clone(&processor);
            tokio::spawn(async move {
                if let Err(e) = processor.submit_created(&record).await {
                    debug!(transaction_id = %record.id, error = %e, "Post-commit submission incomplete");
                }
            });
        }
    }
    info!(worker_id, "Writer worker stopped");
}
