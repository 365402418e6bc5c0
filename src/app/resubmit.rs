//! Periodic resubmission of receiptless transactions.
//!
//! Each cycle merges two inputs: rows whose resubmit deadline has passed,
//! and the oldest pending row of any submitter whose backlog crossed a
//! count or age threshold. Every send is preceded by a fenced claim that
//! pushes the deadline out, so two overlapping triggers never both send.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::config::{
    chain_call_timeout_from_env, env_interval_secs, env_or, env_secs, DEFAULT_CHAIN_CALL_TIMEOUT,
};
use super::lease::LeaseManager;
use super::stuck::StuckResolutionService;
use super::worker::{PeriodicTask, calculate_backoff, with_chain_timeout};
use crate::domain::{
    AppError, ChainConnector, FencedWrite, ManagedTransaction, MetricsObserver, SubmitterBacklog,
    TransactionStore,
};

/// Resubmit scheduler configuration
#[derive(Debug, Clone)]
pub struct ResubmitConfig {
    pub interval: Duration,
    /// Maximum rows pulled per scan
    pub batch_size: i64,
    /// Attempts after which stuck resolution takes over
    pub max_attempts: i32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Deadline applied after a successful (re)send
    pub resubmit_delay: Duration,
    pub backlog_pending_threshold: i64,
    pub backlog_age_threshold: Duration,
    pub chain_timeout: Duration,
}

impl Default for ResubmitConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            batch_size: 100,
            max_attempts: 10,
            base_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(300),
            resubmit_delay: Duration::from_secs(30),
            backlog_pending_threshold: 50,
            backlog_age_threshold: Duration::from_secs(600),
            chain_timeout: DEFAULT_CHAIN_CALL_TIMEOUT,
        }
    }
}

impl ResubmitConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            interval: env_interval_secs("RESUBMIT_INTERVAL_SECS", defaults.interval),
            batch_size: env_or("RESUBMIT_BATCH_SIZE", defaults.batch_size),
            max_attempts: env_or("RESUBMIT_MAX_ATTEMPTS", defaults.max_attempts),
            base_backoff: env_secs("RESUBMIT_BASE_BACKOFF_SECS", defaults.base_backoff),
            max_backoff: env_secs("RESUBMIT_MAX_BACKOFF_SECS", defaults.max_backoff),
            resubmit_delay: env_secs("RESUBMIT_DELAY_SECS", defaults.resubmit_delay),
            backlog_pending_threshold: env_or(
                "BACKLOG_PENDING_THRESHOLD",
                defaults.backlog_pending_threshold,
            ),
            backlog_age_threshold: env_secs(
                "BACKLOG_AGE_THRESHOLD_SECS",
                defaults.backlog_age_threshold,
            ),
            chain_timeout: chain_call_timeout_from_env(),
        }
    }
}

/// Result of handling one candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResubmitOutcome {
    Resubmitted,
    /// Send failed; a backoff deadline was recorded
    SendFailed,
    /// Attempts exhausted; stuck resolution was invoked
    Delegated,
    /// Claim or post-send write touched no row
    Abandoned,
    NotLeader,
}

pub struct ResubmitScheduler {
    store: Arc<dyn TransactionStore>,
    chain: Arc<dyn ChainConnector>,
    leases: Arc<LeaseManager>,
    stuck: Arc<StuckResolutionService>,
    metrics: Arc<dyn MetricsObserver>,
    config: ResubmitConfig,
}

impl ResubmitScheduler {
    #[must_use]
    pub fn new(
        store: Arc<dyn TransactionStore>,
        chain: Arc<dyn ChainConnector>,
        leases: Arc<LeaseManager>,
        stuck: Arc<StuckResolutionService>,
        metrics: Arc<dyn MetricsObserver>,
        config: ResubmitConfig,
    ) -> Self {
        Self {
            store,
            chain,
            leases,
            stuck,
            metrics,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ResubmitConfig {
        &self.config
    }

    /// Whether a submitter's backlog forces its oldest transaction into handling.
    #[must_use]
    pub fn backlog_exceeded(&self, backlog: &SubmitterBacklog) -> bool {
        let age_threshold = chrono::Duration::from_std(self.config.backlog_age_threshold)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        backlog.pending_count >= self.config.backlog_pending_threshold
            || backlog.oldest_age >= age_threshold
    }

    /// Collect this cycle's candidates: forced backlog heads first, then due rows.
    async fn candidates(&self) -> Result<Vec<ManagedTransaction>, AppError> {
        let backlogs = self
            .store
            .list_submitter_backlogs(self.config.batch_size)
            .await?;
        let due = self
            .store
            .list_due_resubmits(self.config.batch_size)
            .await?;

        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for backlog in backlogs.iter().filter(|b| self.backlog_exceeded(b)) {
            if let Some(tx) = self.store.get_transaction(backlog.oldest_transaction_id).await? {
                if tx.state.is_terminal() || tx.receipt.is_some() {
                    continue;
                }
                info!(
                    submitter = %backlog.submitter,
                    pending = backlog.pending_count,
                    oldest_age_secs = backlog.oldest_age.num_seconds(),
                    transaction_id = %tx.id,
                    "Backlog threshold crossed; forcing oldest transaction"
                );
                if seen.insert(tx.id) {
                    candidates.push(tx);
                }
            }
        }
        for tx in due {
            if seen.insert(tx.id) {
                candidates.push(tx);
            }
        }
        Ok(candidates)
    }

    /// Handle one candidate.
    #[instrument(skip(self, tx), fields(transaction_id = %tx.id, submitter = %tx.submitter, nonce = tx.nonce))]
    pub async fn handle(&self, tx: &ManagedTransaction) -> Result<ResubmitOutcome, AppError> {
        if tx.submit_attempts >= self.config.max_attempts {
            let applied = self.stuck.resolve_transaction(tx).await?;
            debug!(decision = applied.decision.as_str(), "Delegated to stuck resolution");
            return Ok(ResubmitOutcome::Delegated);
        }

        let grant = self.leases.acquire_or_renew(&tx.submitter).await?;
        if !grant.is_leader {
            self.metrics.not_leader(&tx.submitter);
            return Ok(ResubmitOutcome::NotLeader);
        }

        let write = FencedWrite::new(tx, grant.fencing_token);
        let claimed = self
            .store
            .claim_resubmit(&write, tx.next_resubmit_at, self.config.resubmit_delay)
            .await?;
        if claimed == 0 {
            self.metrics.fenced_rejection("claim_resubmit");
            warn!("Resubmit claim fenced out; abandoning");
            return Ok(ResubmitOutcome::Abandoned);
        }

        let sent = with_chain_timeout(
            self.config.chain_timeout,
            "send_transaction",
            self.chain
                .send_transaction(&tx.submitter, tx.nonce, &tx.payload),
        )
        .await;

        match sent {
            Ok(tx_hash) => {
                let affected = self
                    .store
                    .record_submission(&write, &tx_hash, None, self.config.resubmit_delay)
                    .await?;
                if affected == 0 {
                    self.metrics.fenced_rejection("record_submission");
                    warn!(tx_hash = %tx_hash, "Resubmission recorded by nobody; lease lost");
                    return Ok(ResubmitOutcome::Abandoned);
                }
                self.metrics.resubmitted(&tx.submitter);
                info!(tx_hash = %tx_hash, attempt = tx.submit_attempts + 1, "Transaction resubmitted");
                Ok(ResubmitOutcome::Resubmitted)
            }
            Err(e) => {
                self.metrics.chain_error("send_transaction");
                let backoff = calculate_backoff(
                    u32::try_from(tx.submit_attempts).unwrap_or(0),
                    self.config.base_backoff,
                    self.config.max_backoff,
                );
                warn!(error = %e, backoff_secs = backoff.as_secs(), "Resubmission failed");
                let affected = self
                    .store
                    .record_submit_failure(&write, &e.to_string(), backoff)
                    .await?;
                if affected == 0 {
                    self.metrics.fenced_rejection("record_submit_failure");
                    return Ok(ResubmitOutcome::Abandoned);
                }
                Ok(ResubmitOutcome::SendFailed)
            }
        }
    }
}

#[async_trait]
impl PeriodicTask for ResubmitScheduler {
    fn name(&self) -> &'static str {
        "resubmit_scheduler"
    }

    async fn run_cycle(&self) -> Result<usize, AppError> {
        let candidates = self.candidates().await?;
        let mut handled = 0;
        for tx in &candidates {
            match self.handle(tx).await {
                Ok(ResubmitOutcome::NotLeader) => {}
                Ok(_) => handled += 1,
                Err(e) => warn!(transaction_id = %tx.id, error = %e, "Resubmit handling failed"),
            }
        }
        Ok(handled)
    }
}
