//! Receipt discovery.
//!
//! A dispatcher task owns a delay queue of receipt tasks, deduplicated by
//! transaction id. A periodic scan feeds it; expired tasks go to a pool of
//! workers over a shared channel, and workers report back whether a task
//! should be requeued. Finding a receipt only persists it: deciding finality
//! belongs to the finality manager.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::time::DelayQueue;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::config::{
    chain_call_timeout_from_env, env_interval_secs, env_millis, env_or, env_secs,
    DEFAULT_CHAIN_CALL_TIMEOUT, MIN_LOOP_INTERVAL,
};
use super::lease::LeaseManager;
use super::worker::{calculate_backoff, with_chain_timeout};
use crate::domain::{AppError, ChainConnector, FencedWrite, MetricsObserver, TransactionStore};

/// Receipt checker configuration
#[derive(Debug, Clone)]
pub struct ReceiptCheckerConfig {
    pub worker_count: usize,
    pub scan_interval: Duration,
    pub scan_batch_size: i64,
    /// Requeue delay after a "not found" lookup
    pub stale_receipt_interval: Duration,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub chain_timeout: Duration,
}

impl Default for ReceiptCheckerConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            scan_interval: Duration::from_secs(5),
            scan_batch_size: 200,
            stale_receipt_interval: Duration::from_secs(10),
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            chain_timeout: DEFAULT_CHAIN_CALL_TIMEOUT,
        }
    }
}

impl ReceiptCheckerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            worker_count: env_or("RECEIPT_WORKERS", defaults.worker_count).max(1),
            scan_interval: env_interval_secs("RECEIPT_SCAN_INTERVAL_SECS", defaults.scan_interval),
            scan_batch_size: env_or("RECEIPT_SCAN_BATCH_SIZE", defaults.scan_batch_size),
            stale_receipt_interval: env_secs(
                "RECEIPT_STALE_INTERVAL_SECS",
                defaults.stale_receipt_interval,
            ),
            base_backoff: env_millis("RECEIPT_BASE_BACKOFF_MS", defaults.base_backoff),
            max_backoff: env_secs("RECEIPT_MAX_BACKOFF_SECS", defaults.max_backoff),
            chain_timeout: chain_call_timeout_from_env(),
        }
    }
}

/// One pending receipt lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptTask {
    pub transaction_id: Uuid,
    pub submitter: String,
    pub tx_hash: String,
}

/// What the dispatcher should do with a task after a worker ran it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Requeue(Duration),
    Finished,
}

enum Control {
    Requeue(ReceiptTask, Duration),
    Finished(Uuid),
}

pub struct ReceiptChecker {
    store: Arc<dyn TransactionStore>,
    chain: Arc<dyn ChainConnector>,
    leases: Arc<LeaseManager>,
    metrics: Arc<dyn MetricsObserver>,
    config: ReceiptCheckerConfig,
    /// Consecutive lookup failures per hash
    failures: DashMap<String, u32>,
}

impl ReceiptChecker {
    #[must_use]
    pub fn new(
        store: Arc<dyn TransactionStore>,
        chain: Arc<dyn ChainConnector>,
        leases: Arc<LeaseManager>,
        metrics: Arc<dyn MetricsObserver>,
        config: ReceiptCheckerConfig,
    ) -> Self {
        Self {
            store,
            chain,
            leases,
            metrics,
            config,
            failures: DashMap::new(),
        }
    }

    /// Tracking rows that still need a receipt.
    pub async fn scan(&self) -> Result<Vec<ReceiptTask>, AppError> {
        let candidates = self
            .store
            .list_receipt_candidates(self.config.scan_batch_size)
            .await?;
        Ok(candidates
            .into_iter()
            .filter_map(|tx| {
                tx.tx_hash.map(|tx_hash| ReceiptTask {
                    transaction_id: tx.id,
                    submitter: tx.submitter,
                    tx_hash,
                })
            })
            .collect())
    }

    fn failure_backoff(&self, tx_hash: &str) -> Duration {
        let mut count = self.failures.entry(tx_hash.to_string()).or_insert(0);
        let attempt = *count;
        *count += 1;
        calculate_backoff(attempt, self.config.base_backoff, self.config.max_backoff)
    }

    /// Run one lookup. A finished task drops its failure counter.
    pub async fn check(&self, task: &ReceiptTask) -> TaskOutcome {
        let outcome = self.lookup(task).await;
        if outcome == TaskOutcome::Finished {
            self.failures.remove(&task.tx_hash);
        }
        outcome
    }

    async fn lookup(&self, task: &ReceiptTask) -> TaskOutcome {
        let grant = match self.leases.acquire_or_renew(&task.submitter).await {
            Ok(grant) => grant,
            Err(e) => {
                warn!(transaction_id = %task.transaction_id, error = %e, "Lease check failed");
                return TaskOutcome::Requeue(self.failure_backoff(&task.tx_hash));
            }
        };
        if !grant.is_leader {
            // The leader's own scan owns this row.
            return TaskOutcome::Finished;
        }
        let write = FencedWrite {
            transaction_id: task.transaction_id,
            submitter: task.submitter.clone(),
            fencing_token: grant.fencing_token,
        };

        let lookup = with_chain_timeout(
            self.config.chain_timeout,
            "get_transaction_receipt",
            self.chain.get_transaction_receipt(&task.tx_hash),
        )
        .await;

        match lookup {
            Ok(None) => {
                self.failures.remove(&task.tx_hash);
                debug!(tx_hash = %task.tx_hash, "Receipt not found yet");
                match self.store.record_receipt_check(&write, &task.tx_hash).await {
                    Ok(0) => {
                        // Fenced out, or the row moved on to a newer hash.
                        self.metrics.fenced_rejection("record_receipt_check");
                        TaskOutcome::Finished
                    }
                    Ok(_) => TaskOutcome::Requeue(self.config.stale_receipt_interval),
                    Err(e) => {
                        warn!(tx_hash = %task.tx_hash, error = %e, "Failed to record receipt check");
                        TaskOutcome::Requeue(self.config.stale_receipt_interval)
                    }
                }
            }
            Ok(Some(receipt)) => {
                self.failures.remove(&task.tx_hash);
                match self.store.store_receipt(&write, &receipt).await {
                    Ok(0) => {
                        self.metrics.fenced_rejection("store_receipt");
                        warn!(tx_hash = %task.tx_hash, "Receipt write fenced out");
                        TaskOutcome::Finished
                    }
                    Ok(_) => {
                        info!(
                            transaction_id = %task.transaction_id,
                            tx_hash = %task.tx_hash,
                            block_number = receipt.block_number,
                            success = receipt.success,
                            "Receipt stored"
                        );
                        TaskOutcome::Finished
                    }
                    Err(e) => {
                        warn!(tx_hash = %task.tx_hash, error = %e, "Failed to store receipt");
                        TaskOutcome::Requeue(self.failure_backoff(&task.tx_hash))
                    }
                }
            }
            Err(e) => {
                self.metrics.chain_error("get_transaction_receipt");
                let backoff = self.failure_backoff(&task.tx_hash);
                warn!(
                    tx_hash = %task.tx_hash,
                    error = %e,
                    backoff_ms = backoff.as_millis() as u64,
                    "Receipt lookup failed"
                );
                TaskOutcome::Requeue(backoff)
            }
        }
    }

    /// Scan once and check every task inline. Returns the number of tasks run.
    pub async fn poll_once(&self) -> Result<usize, AppError> {
        let tasks = self.scan().await?;
        for task in &tasks {
            self.check(task).await;
        }
        Ok(tasks.len())
    }

    /// Spawn the dispatcher and worker pool.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let worker_count = self.config.worker_count.max(1);
        let (work_tx, work_rx) = mpsc::channel::<ReceiptTask>(worker_count * 2);
        let (control_tx, control_rx) = mpsc::unbounded_channel::<Control>();
        let work_rx = Arc::new(Mutex::new(work_rx));

        let mut handles = Vec::with_capacity(worker_count + 1);
        handles.push(tokio::spawn(run_dispatcher(
            Arc::clone(&self),
            work_tx,
            control_rx,
            shutdown.clone(),
        )));
        for worker_id in 0..worker_count {
            handles.push(tokio::spawn(run_worker(
                worker_id,
                Arc::clone(&self),
                Arc::clone(&work_rx),
                control_tx.clone(),
                shutdown.clone(),
            )));
        }
        info!(workers = worker_count, "Receipt checker started");
        handles
    }
}

async fn run_dispatcher(
    checker: Arc<ReceiptChecker>,
    work_tx: mpsc::Sender<ReceiptTask>,
    mut control_rx: mpsc::UnboundedReceiver<Control>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut queue: DelayQueue<ReceiptTask> = DelayQueue::new();
    let mut inflight: HashSet<Uuid> = HashSet::new();
    let mut ticker = tokio::time::interval(checker.config.scan_interval.max(MIN_LOOP_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match checker.scan().await {
                    Ok(tasks) => {
                        for task in tasks {
                            if inflight.insert(task.transaction_id) {
                                queue.insert(task, Duration::ZERO);
                            }
                        }
                    }
                    Err(e) => error!(error = %e, "Receipt scan failed"),
                }
            }
            Some(expired) = std::future::poll_fn(|cx| queue.poll_expired(cx)) => {
                if work_tx.send(expired.into_inner()).await.is_err() {
                    break;
                }
            }
            Some(message) = control_rx.recv() => match message {
                Control::Requeue(task, delay) => {
                    queue.insert(task, delay);
                }
                Control::Finished(id) => {
                    inflight.remove(&id);
                }
            },
            _ = shutdown.changed() => break,
        }
    }
    info!(pending = queue.len(), "Receipt dispatcher stopped");
}

async fn run_worker(
    worker_id: usize,
    checker: Arc<ReceiptChecker>,
    work_rx: Arc<Mutex<mpsc::Receiver<ReceiptTask>>>,
    control_tx: mpsc::UnboundedSender<Control>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let next = {
            let mut receiver = work_rx.lock().await;
            tokio::select! {
                task = receiver.recv() => task,
                _ = shutdown.changed() => None,
            }
        };
        let Some(task) = next else { break };

        let message = match checker.check(&task).await {
            TaskOutcome::Requeue(delay) => Control::Requeue(task, delay),
            TaskOutcome::Finished => Control::Finished(task.transaction_id),
        };
        if control_tx.send(message).is_err() {
            break;
        }
    }
    debug!(worker_id, "Receipt worker stopped");
}
