//! Mock implementations for testing.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::domain::{
    AppError, ChainConnector, ChainError, CompletionEvent, MetricsObserver, TransactionReceipt,
};

/// Configuration for mock behavior
#[derive(Debug, Clone, Default)]
pub struct MockConfig {
    pub should_fail: bool,
    pub error_message: Option<String>,
}

impl MockConfig {
    #[must_use]
    pub fn success() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            should_fail: true,
            error_message: Some(message.into()),
        }
    }
}

/// A send observed by the mock chain
#[derive(Debug, Clone, PartialEq)]
pub struct SentTransaction {
    pub submitter: String,
    pub nonce: u64,
    pub payload: serde_json::Value,
    pub tx_hash: String,
}

/// Scriptable chain connector.
///
/// Successful sends advance the submitter's pending nonce the way a node's
/// mempool would. Receipts, heights and block hashes are set explicitly.
pub struct MockChainConnector {
    config: MockConfig,
    is_healthy: AtomicBool,
    pending_nonces: Mutex<HashMap<String, u64>>,
    receipts: Mutex<HashMap<String, TransactionReceipt>>,
    block_hashes: Mutex<HashMap<u64, String>>,
    latest_height: AtomicU64,
    derived_hash: Mutex<Option<String>>,
    sent: Mutex<Vec<SentTransaction>>,
    fail_sends: AtomicBool,
    fail_receipts: AtomicBool,
    fail_height: AtomicBool,
    hang_derive: AtomicBool,
    optional_supported: AtomicBool,
    pending_nonce_calls: AtomicUsize,
    send_calls: AtomicUsize,
    receipt_calls: AtomicUsize,
}

impl MockChainConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MockConfig::success())
    }

    #[must_use]
    pub fn with_config(config: MockConfig) -> Self {
        Self {
            config,
            is_healthy: AtomicBool::new(true),
            pending_nonces: Mutex::new(HashMap::new()),
            receipts: Mutex::new(HashMap::new()),
            block_hashes: Mutex::new(HashMap::new()),
            latest_height: AtomicU64::new(0),
            derived_hash: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
            fail_receipts: AtomicBool::new(false),
            fail_height: AtomicBool::new(false),
            hang_derive: AtomicBool::new(false),
            optional_supported: AtomicBool::new(true),
            pending_nonce_calls: AtomicUsize::new(0),
            send_calls: AtomicUsize::new(0),
            receipt_calls: AtomicUsize::new(0),
        }
    }

    /// Every call fails with the given message
    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_config(MockConfig::failure(message))
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.is_healthy.store(healthy, Ordering::Relaxed);
    }

    pub fn set_pending_nonce(&self, submitter: &str, nonce: u64) {
        self.pending_nonces
            .lock()
            .unwrap()
            .insert(submitter.to_string(), nonce);
    }

    pub fn set_receipt(&self, tx_hash: &str, receipt: TransactionReceipt) {
        self.receipts
            .lock()
            .unwrap()
            .insert(tx_hash.to_string(), receipt);
    }

    pub fn clear_receipt(&self, tx_hash: &str) {
        self.receipts.lock().unwrap().remove(tx_hash);
    }

    pub fn set_block_hash(&self, height: u64, hash: &str) {
        self.block_hashes
            .lock()
            .unwrap()
            .insert(height, hash.to_string());
    }

    pub fn set_latest_height(&self, height: u64) {
        self.latest_height.store(height, Ordering::Relaxed);
    }

    pub fn set_derived_hash(&self, hash: Option<String>) {
        *self.derived_hash.lock().unwrap() = hash;
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::Relaxed);
    }

    pub fn fail_receipts(&self, fail: bool) {
        self.fail_receipts.store(fail, Ordering::Relaxed);
    }

    pub fn fail_height(&self, fail: bool) {
        self.fail_height.store(fail, Ordering::Relaxed);
    }

    /// Make hash derivation never complete
    pub fn hang_derive(&self, hang: bool) {
        self.hang_derive.store(hang, Ordering::Relaxed);
    }

    /// Make height, block-hash and hash-derivation calls report `NotSupported`
    pub fn disable_optional_capabilities(&self) {
        self.optional_supported.store(false, Ordering::Relaxed);
    }

    /// Every successful send, in order
    pub fn sent(&self) -> Vec<SentTransaction> {
        self.sent.lock().unwrap().clone()
    }

    pub fn send_calls(&self) -> usize {
        self.send_calls.load(Ordering::Relaxed)
    }

    pub fn pending_nonce_calls(&self) -> usize {
        self.pending_nonce_calls.load(Ordering::Relaxed)
    }

    pub fn receipt_calls(&self) -> usize {
        self.receipt_calls.load(Ordering::Relaxed)
    }

    fn check_should_fail(&self) -> Result<(), AppError> {
        if self.config.should_fail {
            let msg = self
                .config
                .error_message
                .clone()
                .unwrap_or_else(|| "Mock error".to_string());
            return Err(AppError::Chain(ChainError::RpcError(msg)));
        }
        Ok(())
    }

    fn check_optional(&self, operation: &str) -> Result<(), AppError> {
        if !self.optional_supported.load(Ordering::Relaxed) {
            return Err(AppError::NotSupported(format!("{} disabled", operation)));
        }
        self.check_should_fail()
    }
}

impl Default for MockChainConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChainConnector for MockChainConnector {
    async fn health_check(&self) -> Result<(), AppError> {
        if !self.is_healthy.load(Ordering::Relaxed) {
            return Err(AppError::Chain(ChainError::Connection(
                "Unhealthy".to_string(),
            )));
        }
        self.check_should_fail()
    }

    async fn get_pending_nonce(&self, submitter: &str) -> Result<u64, AppError> {
        self.pending_nonce_calls.fetch_add(1, Ordering::Relaxed);
        self.check_should_fail()?;
        Ok(self
            .pending_nonces
            .lock()
            .unwrap()
            .get(submitter)
            .copied()
            .unwrap_or(0))
    }

    async fn send_transaction(
        &self,
        submitter: &str,
        nonce: u64,
        payload: &serde_json::Value,
    ) -> Result<String, AppError> {
        let call = self.send_calls.fetch_add(1, Ordering::Relaxed);
        self.check_should_fail()?;
        if self.fail_sends.load(Ordering::Relaxed) {
            return Err(AppError::Chain(ChainError::SendFailed(
                "Mock send rejected".to_string(),
            )));
        }

        let tx_hash = format!("0x{:016x}{:016x}", nonce, call);
        {
            let mut pending = self.pending_nonces.lock().unwrap();
            let entry = pending.entry(submitter.to_string()).or_insert(0);
            *entry = (*entry).max(nonce + 1);
        }
        self.sent.lock().unwrap().push(SentTransaction {
            submitter: submitter.to_string(),
            nonce,
            payload: payload.clone(),
            tx_hash: tx_hash.clone(),
        });
        Ok(tx_hash)
    }

    async fn get_transaction_receipt(
        &self,
        tx_hash: &str,
    ) -> Result<Option<TransactionReceipt>, AppError> {
        self.receipt_calls.fetch_add(1, Ordering::Relaxed);
        self.check_should_fail()?;
        if self.fail_receipts.load(Ordering::Relaxed) {
            return Err(AppError::Chain(ChainError::RpcError(
                "Mock receipt lookup failed".to_string(),
            )));
        }
        Ok(self.receipts.lock().unwrap().get(tx_hash).cloned())
    }

    async fn get_latest_block_height(&self) -> Result<u64, AppError> {
        self.check_optional("get_latest_block_height")?;
        if self.fail_height.load(Ordering::Relaxed) {
            return Err(AppError::Chain(ChainError::RpcError(
                "Mock height lookup failed".to_string(),
            )));
        }
        Ok(self.latest_height.load(Ordering::Relaxed))
    }

    async fn get_block_hash(&self, height: u64) -> Result<Option<String>, AppError> {
        self.check_optional("get_block_hash")?;
        Ok(self.block_hashes.lock().unwrap().get(&height).cloned())
    }

    async fn derive_expected_tx_hash(
        &self,
        _submitter: &str,
        _nonce: u64,
        _payload: &serde_json::Value,
    ) -> Result<String, AppError> {
        self.check_optional("derive_expected_tx_hash")?;
        if self.hang_derive.load(Ordering::Relaxed) {
            std::future::pending::<()>().await;
        }
        self.derived_hash
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| AppError::NotSupported("No derived hash scripted".to_string()))
    }
}

/// Metrics observer that counts every observation
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    fenced_rejections: Mutex<Vec<&'static str>>,
    not_leader: AtomicUsize,
    batch_failed: AtomicUsize,
    completions: Mutex<Vec<CompletionEvent>>,
    chain_errors: AtomicUsize,
    resubmitted: AtomicUsize,
}

impl RecordingMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fenced_rejection_count(&self) -> usize {
        self.fenced_rejections.lock().unwrap().len()
    }

    /// Operations that hit a fenced rejection, in order
    pub fn fenced_operations(&self) -> Vec<&'static str> {
        self.fenced_rejections.lock().unwrap().clone()
    }

    pub fn not_leader_count(&self) -> usize {
        self.not_leader.load(Ordering::Relaxed)
    }

    pub fn batch_failed_count(&self) -> usize {
        self.batch_failed.load(Ordering::Relaxed)
    }

    pub fn completion_count(&self) -> usize {
        self.completions.lock().unwrap().len()
    }

    pub fn completions(&self) -> Vec<CompletionEvent> {
        self.completions.lock().unwrap().clone()
    }

    pub fn chain_error_count(&self) -> usize {
        self.chain_errors.load(Ordering::Relaxed)
    }

    pub fn resubmitted_count(&self) -> usize {
        self.resubmitted.load(Ordering::Relaxed)
    }
}

impl MetricsObserver for RecordingMetrics {
    fn fenced_rejection(&self, operation: &'static str) {
        self.fenced_rejections.lock().unwrap().push(operation);
    }

    fn not_leader(&self, _submitter: &str) {
        self.not_leader.fetch_add(1, Ordering::Relaxed);
    }

    fn batch_failed(&self, _submitters: usize) {
        self.batch_failed.fetch_add(1, Ordering::Relaxed);
    }

    fn completion_emitted(&self, event: &CompletionEvent) {
        self.completions.lock().unwrap().push(event.clone());
    }

    fn chain_error(&self, _operation: &'static str) {
        self.chain_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn resubmitted(&self, _submitter: &str) {
        self.resubmitted.fetch_add(1, Ordering::Relaxed);
    }
}
