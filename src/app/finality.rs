//! Finality judgment for transactions that already carry a receipt.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::config::{
    chain_call_timeout_from_env, env_interval_secs, env_or, DEFAULT_CHAIN_CALL_TIMEOUT,
};
use super::lease::LeaseManager;
use super::worker::{PeriodicTask, with_chain_timeout};
use crate::domain::{
    AppError, ChainConnector, FencedWrite, ManagedTransaction, MetricsObserver, TerminalUpdate,
    TransactionState, TransactionStore, sub_state,
};

/// Finality manager configuration
#[derive(Debug, Clone)]
pub struct FinalityConfig {
    pub interval: Duration,
    pub batch_size: i64,
    /// Blocks (inclusive of the receipt's own block) required before finalizing
    pub required_confirmations: u64,
    pub chain_timeout: Duration,
}

impl Default for FinalityConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            batch_size: 100,
            required_confirmations: 12,
            chain_timeout: DEFAULT_CHAIN_CALL_TIMEOUT,
        }
    }
}

impl FinalityConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            interval: env_interval_secs("FINALITY_INTERVAL_SECS", defaults.interval),
            batch_size: env_or("FINALITY_BATCH_SIZE", defaults.batch_size),
            required_confirmations: env_or(
                "REQUIRED_CONFIRMATIONS",
                defaults.required_confirmations,
            ),
            chain_timeout: chain_call_timeout_from_env(),
        }
    }
}

/// Result of evaluating one candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalityOutcome {
    Finalized(TransactionState),
    ReorgDetected,
    /// Not enough confirmations, or the receipt is not visible right now
    Waiting,
    NotLeader,
    /// The terminal write touched no row; no completion event was written
    FencedRejected,
}

/// Confirmations for a receipt at `receipt_block` given the chain head.
#[must_use]
pub fn confirmations(latest_height: u64, receipt_block: u64) -> u64 {
    if latest_height < receipt_block {
        0
    } else {
        latest_height - receipt_block + 1
    }
}

pub struct FinalityManager {
    store: Arc<dyn TransactionStore>,
    chain: Arc<dyn ChainConnector>,
    leases: Arc<LeaseManager>,
    metrics: Arc<dyn MetricsObserver>,
    config: FinalityConfig,
}

impl FinalityManager {
    #[must_use]
    pub fn new(
        store: Arc<dyn TransactionStore>,
        chain: Arc<dyn ChainConnector>,
        leases: Arc<LeaseManager>,
        metrics: Arc<dyn MetricsObserver>,
        config: FinalityConfig,
    ) -> Self {
        Self {
            store,
            chain,
            leases,
            metrics,
            config,
        }
    }

    /// Chain head, or `None` when the connector cannot report it.
    async fn latest_height(&self) -> Result<Option<u64>, AppError> {
        match with_chain_timeout(
            self.config.chain_timeout,
            "get_latest_block_height",
            self.chain.get_latest_block_height(),
        )
        .await
        {
            Ok(height) => Ok(Some(height)),
            Err(AppError::NotSupported(_)) => Ok(None),
            Err(e) => {
                self.metrics.chain_error("get_latest_block_height");
                Err(e)
            }
        }
    }

    /// Evaluate one candidate against a chain head fetched for this cycle.
    #[instrument(skip(self, tx), fields(transaction_id = %tx.id, submitter = %tx.submitter))]
    pub async fn evaluate(
        &self,
        tx: &ManagedTransaction,
        latest_height: Option<u64>,
    ) -> Result<FinalityOutcome, AppError> {
        let stored = match tx.parsed_receipt() {
            Some(Ok(receipt)) => receipt,
            Some(Err(e)) => {
                return Err(AppError::Serialization(format!(
                    "Stored receipt for {} is unreadable: {}",
                    tx.id, e
                )));
            }
            None => return Ok(FinalityOutcome::Waiting),
        };
        let tx_hash = tx.tx_hash.as_deref().unwrap_or(&stored.tx_hash);

        let fresh = with_chain_timeout(
            self.config.chain_timeout,
            "get_transaction_receipt",
            self.chain.get_transaction_receipt(tx_hash),
        )
        .await
        .inspect_err(|_| self.metrics.chain_error("get_transaction_receipt"))?;

        match with_chain_timeout(
            self.config.chain_timeout,
            "get_block_hash",
            self.chain.get_block_hash(stored.block_number),
        )
        .await
        {
            Ok(Some(canonical)) if canonical != stored.block_hash => {
                warn!(
                    block_number = stored.block_number,
                    receipt_block_hash = %stored.block_hash,
                    canonical_block_hash = %canonical,
                    "Reorg detected; failing closed"
                );
                let update = TerminalUpdate::new(TransactionState::Stuck)
                    .with_sub_state(sub_state::REORG_DETECTED)
                    .with_error(format!(
                        "Block {} hash changed from {} to {}",
                        stored.block_number, stored.block_hash, canonical
                    ));
                return self
                    .finish(tx, &update)
                    .await
                    .map(|outcome| match outcome {
                        FinalityOutcome::Finalized(_) => FinalityOutcome::ReorgDetected,
                        other => other,
                    });
            }
            Ok(_) | Err(AppError::NotSupported(_)) => {}
            Err(e) => {
                self.metrics.chain_error("get_block_hash");
                return Err(e);
            }
        }

        let Some(fresh) = fresh else {
            debug!(tx_hash = %tx_hash, "Receipt not visible on re-fetch; waiting");
            return Ok(FinalityOutcome::Waiting);
        };

        if let Some(latest) = latest_height {
            let confirmed_by = confirmations(latest, fresh.block_number);
            if confirmed_by < self.config.required_confirmations {
                debug!(
                    confirmations = confirmed_by,
                    required = self.config.required_confirmations,
                    "Awaiting confirmations"
                );
                return Ok(FinalityOutcome::Waiting);
            }
        }

        let state = if fresh.success {
            TransactionState::Confirmed
        } else {
            TransactionState::FailedFinal
        };
        self.finish(tx, &TerminalUpdate::new(state)).await
    }

    async fn finish(
        &self,
        tx: &ManagedTransaction,
        update: &TerminalUpdate,
    ) -> Result<FinalityOutcome, AppError> {
        let grant = self.leases.acquire_or_renew(&tx.submitter).await?;
        if !grant.is_leader {
            self.metrics.not_leader(&tx.submitter);
            return Ok(FinalityOutcome::NotLeader);
        }

        let write = FencedWrite::new(tx, grant.fencing_token);
        match self.store.complete_transaction(&write, update).await? {
            Some(event) => {
                self.metrics.completion_emitted(&event);
                info!(
                    state = %update.state,
                    sequence = event.sequence,
                    "Transaction finalized"
                );
                Ok(FinalityOutcome::Finalized(update.state))
            }
            None => {
                self.metrics.fenced_rejection("complete_transaction");
                warn!(state = %update.state, "Terminal write fenced out; no completion emitted");
                Ok(FinalityOutcome::FencedRejected)
            }
        }
    }
}

#[async_trait]
impl PeriodicTask for FinalityManager {
    fn name(&self) -> &'static str {
        "finality_manager"
    }

    async fn run_cycle(&self) -> Result<usize, AppError> {
        let candidates = self
            .store
            .list_finality_candidates(self.config.batch_size)
            .await?;
        if candidates.is_empty() {
            return Ok(0);
        }

        let latest = match self.latest_height().await {
            Ok(latest) => latest,
            Err(e) => {
                warn!(error = %e, "Chain head unavailable; skipping finality cycle");
                return Ok(0);
            }
        };

        let mut handled = 0;
        for tx in &candidates {
            match self.evaluate(tx, latest).await {
                Ok(FinalityOutcome::Finalized(_)) | Ok(FinalityOutcome::ReorgDetected) => {
                    handled += 1
                }
                Ok(_) => {}
                Err(e) => warn!(transaction_id = %tx.id, error = %e, "Finality check failed"),
            }
        }
        Ok(handled)
    }
}
