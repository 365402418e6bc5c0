//! Stuck resolution: applies a pluggable hook's decision under the fence.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use super::lease::LeaseManager;
use super::resubmit::ResubmitConfig;
use super::worker::with_chain_timeout;
use crate::domain::{
    AppError, ChainConnector, DatabaseError, FencedWrite, ManagedTransaction, MetricsObserver,
    StuckContext, StuckDecision, StuckResolutionHook, TerminalUpdate, TransactionState,
    TransactionStore, ValidationError, sub_state,
};

/// Default hook: keep the transaction on its retry cadence.
#[derive(Debug, Clone, Copy, Default)]
pub struct IgnoreHook;

impl StuckResolutionHook for IgnoreHook {
    fn decide(&self, _context: &StuckContext) -> StuckDecision {
        StuckDecision::Ignore
    }
}

/// What happened when a decision was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionOutcome {
    Applied,
    /// Remediation claim succeeded but the send failed; the error was recorded
    SendFailed,
    /// The fenced write touched no row; nothing was changed or sent
    FencedRejected,
    NotLeader,
}

/// A hook decision together with how it was applied
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct AppliedResolution {
    pub transaction_id: Uuid,
    #[schema(value_type = Object)]
    pub decision: StuckDecision,
    pub outcome: ResolutionOutcome,
}

pub struct StuckResolutionService {
    store: Arc<dyn TransactionStore>,
    chain: Arc<dyn ChainConnector>,
    leases: Arc<LeaseManager>,
    hook: Arc<dyn StuckResolutionHook>,
    metrics: Arc<dyn MetricsObserver>,
    config: ResubmitConfig,
}

impl StuckResolutionService {
    #[must_use]
    pub fn new(
        store: Arc<dyn TransactionStore>,
        chain: Arc<dyn ChainConnector>,
        leases: Arc<LeaseManager>,
        hook: Arc<dyn StuckResolutionHook>,
        metrics: Arc<dyn MetricsObserver>,
        config: ResubmitConfig,
    ) -> Self {
        Self {
            store,
            chain,
            leases,
            hook,
            metrics,
            config,
        }
    }

    /// Operator entry point: resolve one transaction by id.
    #[instrument(skip(self))]
    pub async fn resolve(&self, transaction_id: Uuid) -> Result<AppliedResolution, AppError> {
        let transaction = self
            .store
            .get_transaction(transaction_id)
            .await?
            .ok_or_else(|| {
                AppError::Database(DatabaseError::NotFound(format!(
                    "Transaction {} not found",
                    transaction_id
                )))
            })?;

        if transaction.state.is_terminal() {
            return Err(AppError::Validation(ValidationError::InvalidField {
                field: "state".to_string(),
                message: format!("Transaction is already {}", transaction.state),
            }));
        }

        self.resolve_transaction(&transaction).await
    }

    /// Build the context, ask the hook, and apply its decision.
    #[instrument(skip(self, transaction), fields(transaction_id = %transaction.id, submitter = %transaction.submitter))]
    pub async fn resolve_transaction(
        &self,
        transaction: &ManagedTransaction,
    ) -> Result<AppliedResolution, AppError> {
        let now = self.store.database_now().await?;
        let context = StuckContext {
            transaction_id: transaction.id,
            submitter: transaction.submitter.clone(),
            nonce: transaction.nonce,
            state: transaction.state,
            submit_attempts: transaction.submit_attempts,
            max_attempts: self.config.max_attempts,
            age: now - transaction.created_at,
            last_error: transaction.last_error.clone(),
        };
        let decision = self.hook.decide(&context);
        info!(decision = decision.as_str(), attempts = transaction.submit_attempts, "Stuck resolution decided");

        let grant = self.leases.acquire_or_renew(&transaction.submitter).await?;
        if !grant.is_leader {
            self.metrics.not_leader(&transaction.submitter);
            return Ok(AppliedResolution {
                transaction_id: transaction.id,
                decision,
                outcome: ResolutionOutcome::NotLeader,
            });
        }

        let write = FencedWrite::new(transaction, grant.fencing_token);
        let note = format!("stuck resolution: {}", decision.as_str());
        let outcome = match &decision {
            StuckDecision::MarkStuck => {
                let update = TerminalUpdate::new(TransactionState::Stuck)
                    .with_sub_state(sub_state::MARKED_STUCK)
                    .with_error(format!(
                        "Marked stuck after {} submit attempts",
                        transaction.submit_attempts
                    ));
                match self.store.complete_transaction(&write, &update).await? {
                    Some(event) => {
                        self.metrics.completion_emitted(&event);
                        ResolutionOutcome::Applied
                    }
                    None => ResolutionOutcome::FencedRejected,
                }
            }
            StuckDecision::ResubmitNow => {
                self.applied(self.store.reschedule(&write, Duration::ZERO, Some(&note)).await?)
            }
            StuckDecision::Delay(delay) => {
                self.applied(self.store.reschedule(&write, *delay, Some(&note)).await?)
            }
            StuckDecision::Ignore => self.applied(
                self.store
                    .reschedule(&write, self.config.resubmit_delay, Some(&note))
                    .await?,
            ),
            remediation => match remediation.remediation() {
                Some((payload, marker)) => {
                    self.remediate(transaction, &write, payload, marker).await?
                }
                None => ResolutionOutcome::Applied,
            },
        };

        if outcome == ResolutionOutcome::FencedRejected {
            self.metrics.fenced_rejection("stuck_resolution");
            warn!(decision = decision.as_str(), "Stuck resolution fenced out");
        }

        Ok(AppliedResolution {
            transaction_id: transaction.id,
            decision,
            outcome,
        })
    }

    fn applied(&self, affected: u64) -> ResolutionOutcome {
        if affected == 0 {
            ResolutionOutcome::FencedRejected
        } else {
            ResolutionOutcome::Applied
        }
    }

    /// Claim first, then send the remediation body at the unchanged nonce.
    async fn remediate(
        &self,
        transaction: &ManagedTransaction,
        write: &FencedWrite,
        payload: &serde_json::Value,
        marker: &'static str,
    ) -> Result<ResolutionOutcome, AppError> {
        let claimed = self
            .store
            .claim_resubmit(write, transaction.next_resubmit_at, self.config.resubmit_delay)
            .await?;
        if claimed == 0 {
            return Ok(ResolutionOutcome::FencedRejected);
        }

        let sent = with_chain_timeout(
            self.config.chain_timeout,
            "send_transaction",
            self.chain
                .send_transaction(&transaction.submitter, transaction.nonce, payload),
        )
        .await;

        match sent {
            Ok(tx_hash) => {
                info!(tx_hash = %tx_hash, remediation = marker, "Remediation sent");
                let affected = self
                    .store
                    .record_submission(write, &tx_hash, Some(marker), self.config.resubmit_delay)
                    .await?;
                Ok(self.applied(affected))
            }
            Err(e) => {
                self.metrics.chain_error("send_transaction");
                warn!(error = %e, remediation = marker, "Remediation send failed");
                let affected = self
                    .store
                    .record_submit_failure(write, &e.to_string(), self.config.resubmit_delay)
                    .await?;
                if affected == 0 {
                    Ok(ResolutionOutcome::FencedRejected)
                } else {
                    Ok(ResolutionOutcome::SendFailed)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::lease::LeaseConfig;
    use crate::test_utils::{InMemoryTransactionStore, MockChainConnector, RecordingMetrics};

    struct Harness {
        store: Arc<InMemoryTransactionStore>,
        chain: Arc<MockChainConnector>,
        metrics: Arc<RecordingMetrics>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                store: Arc::new(InMemoryTransactionStore::new()),
                chain: Arc::new(MockChainConnector::new()),
                metrics: Arc::new(RecordingMetrics::new()),
            }
        }

        fn service(&self, hook: impl StuckResolutionHook + 'static) -> StuckResolutionService {
            let leases = Arc::new(LeaseManager::new(
                self.store.clone(),
                LeaseConfig {
                    node_id: "node-a".to_string(),
                    ..LeaseConfig::default()
                },
            ));
            StuckResolutionService::new(
                self.store.clone(),
                self.chain.clone(),
                leases,
                Arc::new(hook),
                self.metrics.clone(),
                ResubmitConfig::default(),
            )
        }

        fn seed(&self, attempts: i32) -> ManagedTransaction {
            self.store.seed_lease("s1", "node-a", 1, chrono::Duration::seconds(60));
            self.store.seed_tracking("s1", 3, "0xold", attempts, 1)
        }
    }

    #[tokio::test]
    async fn test_default_hook_only_reschedules() {
        let h = Harness::new();
        let tx = h.seed(10);

        let applied = h.service(IgnoreHook).resolve(tx.id).await.unwrap();

        assert_eq!(applied.decision, StuckDecision::Ignore);
        assert_eq!(applied.outcome, ResolutionOutcome::Applied);
        let stored = h.store.get_transaction(tx.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TransactionState::Tracking);
        assert!(stored.next_resubmit_at > tx.next_resubmit_at);
        assert_eq!(stored.last_error.as_deref(), Some("stuck resolution: ignore"));
        assert_eq!(h.chain.send_calls(), 0);
    }

    #[tokio::test]
    async fn test_mark_stuck_emits_one_completion() {
        let h = Harness::new();
        let tx = h.seed(10);

        let applied = h
            .service(|_: &StuckContext| StuckDecision::MarkStuck)
            .resolve(tx.id)
            .await
            .unwrap();

        assert_eq!(applied.outcome, ResolutionOutcome::Applied);
        let stored = h.store.get_transaction(tx.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TransactionState::Stuck);
        assert_eq!(stored.sub_state.as_deref(), Some(sub_state::MARKED_STUCK));
        assert!(stored.confirmed_at.is_none());
        let events = h.store.list_completions(0, 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, TransactionState::Stuck);
    }

    #[tokio::test]
    async fn test_resolve_rejects_terminal_transaction() {
        let h = Harness::new();
        let tx = h.seed(10);
        let service = h.service(|_: &StuckContext| StuckDecision::MarkStuck);
        service.resolve(tx.id).await.unwrap();

        let result = service.resolve(tx.id).await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn test_resolve_unknown_id_is_not_found() {
        let h = Harness::new();
        let result = h.service(IgnoreHook).resolve(Uuid::new_v4()).await;
        assert!(matches!(
            result,
            Err(AppError::Database(DatabaseError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_delay_pushes_deadline() {
        let h = Harness::new();
        let tx = h.seed(10);
        let service = h.service(|_: &StuckContext| StuckDecision::Delay(Duration::from_secs(3600)));

        service.resolve(tx.id).await.unwrap();

        let stored = h.store.get_transaction(tx.id).await.unwrap().unwrap();
        let now = h.store.database_now().await.unwrap();
        let deadline = stored.next_resubmit_at.unwrap();
        assert!(deadline >= now + chrono::Duration::seconds(3599));
    }

    #[tokio::test]
    async fn test_replace_claims_then_sends_at_same_nonce() {
        let h = Harness::new();
        let tx = h.seed(10);
        let replacement = serde_json::json!({"to": "0xself", "value": "0"});
        let body = replacement.clone();
        let service = h.service(move |_: &StuckContext| StuckDecision::Replace(body.clone()));

        let applied = service.resolve(tx.id).await.unwrap();

        assert_eq!(applied.outcome, ResolutionOutcome::Applied);
        let sends = h.chain.sent();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].nonce, 3);
        assert_eq!(sends[0].payload, replacement);
        let stored = h.store.get_transaction(tx.id).await.unwrap().unwrap();
        assert_eq!(stored.sub_state.as_deref(), Some(sub_state::REMEDIATION_REPLACE));
        assert_ne!(stored.tx_hash.as_deref(), Some("0xold"));
    }

    #[tokio::test]
    async fn test_remediation_not_sent_when_claim_fenced() {
        let h = Harness::new();
        let tx = h.seed(10);
        h.store.reject_fenced_writes(true);
        let service =
            h.service(|_: &StuckContext| StuckDecision::Cancel(serde_json::json!({"cancel": true})));

        let applied = service.resolve(tx.id).await.unwrap();

        assert_eq!(applied.outcome, ResolutionOutcome::FencedRejected);
        assert_eq!(h.chain.send_calls(), 0);
        assert_eq!(h.metrics.fenced_rejection_count(), 1);
    }

    #[tokio::test]
    async fn test_stale_claim_loses_race() {
        let h = Harness::new();
        let tx = h.seed(10);
        let service = h.service(|_: &StuckContext| {
            StuckDecision::Placeholder(serde_json::json!({"noop": true}))
        });
        service.resolve(tx.id).await.unwrap();

        // Second trigger holds the pre-claim snapshot; its claim must fail.
        let applied = service.resolve_transaction(&tx).await.unwrap();
        assert_eq!(applied.outcome, ResolutionOutcome::FencedRejected);
        assert_eq!(h.chain.send_calls(), 1);
    }

    #[tokio::test]
    async fn test_not_leader_applies_nothing() {
        let h = Harness::new();
        let tx = h.seed(10);
        h.store.seed_lease("s1", "node-b", 2, chrono::Duration::seconds(60));

        let applied = h
            .service(|_: &StuckContext| StuckDecision::MarkStuck)
            .resolve(tx.id)
            .await
            .unwrap();

        assert_eq!(applied.outcome, ResolutionOutcome::NotLeader);
        let stored = h.store.get_transaction(tx.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TransactionState::Tracking);
    }
}
