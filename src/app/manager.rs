//! Facade wiring every component and owning the background tasks.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use super::config::ManagerConfig;
use super::finality::FinalityManager;
use super::lease::LeaseManager;
use super::metrics::NoopMetrics;
use super::nonce::NonceAllocator;
use super::receipts::ReceiptChecker;
use super::resubmit::ResubmitScheduler;
use super::stuck::{AppliedResolution, IgnoreHook, StuckResolutionService};
use super::worker::spawn_periodic;
use super::writer::{BatchProcessor, TransactionWriter};
use crate::domain::{
    AppError, ChainConnector, CompletionPage, CreateTransactionRequest, HealthResponse,
    HealthStatus, ManagedTransaction, MetricsObserver, NonceCache, StuckResolutionHook,
    TransactionStore, ValidationError,
};
use crate::infra::LruNonceCache;

/// Upper bound on a completion page
pub const MAX_COMPLETION_PAGE: i64 = 1000;

/// Builder for [`TxManager`]
pub struct TxManagerBuilder {
    store: Arc<dyn TransactionStore>,
    chain: Arc<dyn ChainConnector>,
    config: ManagerConfig,
    hook: Arc<dyn StuckResolutionHook>,
    metrics: Arc<dyn MetricsObserver>,
    cache: Option<Arc<dyn NonceCache>>,
    background_workers: bool,
}

impl TxManagerBuilder {
    #[must_use]
    pub fn new(store: Arc<dyn TransactionStore>, chain: Arc<dyn ChainConnector>) -> Self {
        Self {
            store,
            chain,
            config: ManagerConfig::default(),
            hook: Arc::new(IgnoreHook),
            metrics: Arc::new(NoopMetrics),
            cache: None,
            background_workers: true,
        }
    }

    #[must_use]
    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn stuck_hook(mut self, hook: Arc<dyn StuckResolutionHook>) -> Self {
        self.hook = hook;
        self
    }

    #[must_use]
    pub fn metrics(mut self, metrics: Arc<dyn MetricsObserver>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Replace the default LRU nonce cache
    #[must_use]
    pub fn nonce_cache(mut self, cache: Arc<dyn NonceCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Whether to spawn the resubmit, receipt and finality loops.
    /// The writer pool always runs.
    #[must_use]
    pub fn background_workers(mut self, enabled: bool) -> Self {
        self.background_workers = enabled;
        self
    }

    /// Assemble the manager and spawn its tasks. Must run inside a Tokio runtime.
    pub fn build(self) -> Arc<TxManager> {
        let config = self.config;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(LruNonceCache::from_config(&config.nonce_cache)));
        let leases = Arc::new(LeaseManager::new(
            Arc::clone(&self.store),
            config.lease.clone(),
        ));
        let allocator = Arc::new(NonceAllocator::new(
            Arc::clone(&self.chain),
            cache,
            config.nonce_cache.staleness,
            config.writer.chain_timeout,
        ));
        let processor = Arc::new(BatchProcessor::new(
            Arc::clone(&self.store),
            Arc::clone(&self.chain),
            Arc::clone(&leases),
            allocator,
            Arc::clone(&self.metrics),
            config.writer.clone(),
        ));
        let stuck = Arc::new(StuckResolutionService::new(
            Arc::clone(&self.store),
            Arc::clone(&self.chain),
            Arc::clone(&leases),
            self.hook,
            Arc::clone(&self.metrics),
            config.resubmit.clone(),
        ));
        let resubmit = Arc::new(ResubmitScheduler::new(
            Arc::clone(&self.store),
            Arc::clone(&self.chain),
            Arc::clone(&leases),
            Arc::clone(&stuck),
            Arc::clone(&self.metrics),
            config.resubmit.clone(),
        ));
        let receipts = Arc::new(ReceiptChecker::new(
            Arc::clone(&self.store),
            Arc::clone(&self.chain),
            Arc::clone(&leases),
            Arc::clone(&self.metrics),
            config.receipts.clone(),
        ));
        let finality = Arc::new(FinalityManager::new(
            Arc::clone(&self.store),
            Arc::clone(&self.chain),
            Arc::clone(&leases),
            Arc::clone(&self.metrics),
            config.finality.clone(),
        ));

        let (writer, mut handles) =
            TransactionWriter::spawn(Arc::clone(&processor), &config.writer, shutdown_rx.clone());

        if self.background_workers {
            handles.push(spawn_periodic(
                Arc::clone(&resubmit),
                config.resubmit.interval,
                shutdown_rx.clone(),
            ));
            handles.push(spawn_periodic(
                Arc::clone(&finality),
                config.finality.interval,
                shutdown_rx.clone(),
            ));
            handles.extend(Arc::clone(&receipts).spawn(shutdown_rx));
        }

        info!(
            node_id = %leases.node_id(),
            background_workers = self.background_workers,
            "Transaction manager started"
        );

        Arc::new(TxManager {
            store: self.store,
            chain: self.chain,
            leases,
            writer,
            processor,
            resubmit,
            receipts,
            finality,
            stuck,
            shutdown: shutdown_tx,
            handles: Mutex::new(handles),
        })
    }
}

/// Entry point for creating and querying managed transactions.
pub struct TxManager {
    store: Arc<dyn TransactionStore>,
    chain: Arc<dyn ChainConnector>,
    leases: Arc<LeaseManager>,
    writer: TransactionWriter,
    processor: Arc<BatchProcessor>,
    resubmit: Arc<ResubmitScheduler>,
    receipts: Arc<ReceiptChecker>,
    finality: Arc<FinalityManager>,
    stuck: Arc<StuckResolutionService>,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TxManager {
    #[must_use]
    pub fn builder(
        store: Arc<dyn TransactionStore>,
        chain: Arc<dyn ChainConnector>,
    ) -> TxManagerBuilder {
        TxManagerBuilder::new(store, chain)
    }

    /// Validate and queue a create. Resolves once the batch has committed.
    #[instrument(skip(self, request), fields(submitter = %request.submitter))]
    pub async fn create_transaction(
        &self,
        request: CreateTransactionRequest,
    ) -> Result<ManagedTransaction, AppError> {
        request.validate().map_err(|e| {
            warn!(error = %e, "Validation failed");
            AppError::Validation(ValidationError::Multiple(e.to_string()))
        })?;
        self.writer.submit_create(request).await
    }

    pub async fn get_transaction(&self, id: Uuid) -> Result<Option<ManagedTransaction>, AppError> {
        self.store.get_transaction(id).await
    }

    pub async fn get_by_request_id(
        &self,
        submitter: &str,
        request_id: &str,
    ) -> Result<Option<ManagedTransaction>, AppError> {
        self.store.get_by_request_id(submitter, request_id).await
    }

    /// Completion events with sequence greater than `after`, oldest first.
    ///
    /// Sequences may have gaps (rolled-back inserts) but are visible in order,
    /// so paging with the last seen sequence never skips an event.
    pub async fn completions_after(&self, after: i64, limit: i64) -> Result<CompletionPage, AppError> {
        if after < 0 {
            return Err(AppError::Validation(ValidationError::InvalidField {
                field: "after".to_string(),
                message: "must not be negative".to_string(),
            }));
        }
        let limit = limit.clamp(1, MAX_COMPLETION_PAGE);
        let events = self.store.list_completions(after, limit).await?;
        Ok(CompletionPage::new(events, after))
    }

    /// Operator trigger for stuck resolution.
    pub async fn resolve_stuck(&self, id: Uuid) -> Result<AppliedResolution, AppError> {
        self.stuck.resolve(id).await
    }

    pub async fn health_check(&self) -> HealthResponse {
        let database = match self.store.health_check().await {
            Ok(()) => HealthStatus::Healthy,
            Err(e) => {
                warn!(error = %e, "Database health check failed");
                HealthStatus::Unhealthy
            }
        };
        let chain = match self.chain.health_check().await {
            Ok(()) => HealthStatus::Healthy,
            Err(e) => {
                warn!(error = %e, "Chain health check failed");
                HealthStatus::Unhealthy
            }
        };
        HealthResponse::new(database, chain)
    }

    #[must_use]
    pub fn leases(&self) -> &Arc<LeaseManager> {
        &self.leases
    }

    #[must_use]
    pub fn batch_processor(&self) -> &Arc<BatchProcessor> {
        &self.processor
    }

    #[must_use]
    pub fn resubmit_scheduler(&self) -> &Arc<ResubmitScheduler> {
        &self.resubmit
    }

    #[must_use]
    pub fn receipt_checker(&self) -> &Arc<ReceiptChecker> {
        &self.receipts
    }

    #[must_use]
    pub fn finality_manager(&self) -> &Arc<FinalityManager> {
        &self.finality
    }

    /// Signal every task to stop and wait for them. In-flight cycles finish first.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let handles = match self.handles.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Transaction manager stopped");
    }
}
