//! EVM-style JSON-RPC chain connector.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::domain::{AppError, ChainConnector, ChainError, ConfigError, TransactionReceipt};

/// Configuration for the JSON-RPC client
#[derive(Debug, Clone)]
pub struct ChainClientConfig {
    pub rpc_url: String,
    /// Per-request HTTP timeout
    pub timeout: Duration,
    /// Retries for read calls; sends are never retried here
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for ChainClientConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://localhost:8545".to_string(),
            timeout: Duration::from_secs(10),
            max_retries: 2,
            retry_delay: Duration::from_millis(250),
        }
    }
}

impl ChainClientConfig {
    /// Load configuration from environment variables. `CHAIN_RPC_URL` is required.
    pub fn from_env() -> Result<Self, ConfigError> {
        use std::env;

        let defaults = Self::default();
        let rpc_url = env::var("CHAIN_RPC_URL")
            .map_err(|_| ConfigError::MissingEnvVar("CHAIN_RPC_URL".to_string()))?;
        let timeout = env::var("CHAIN_RPC_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.timeout);
        let max_retries = env::var("CHAIN_RPC_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_retries);
        let retry_delay = env::var("CHAIN_RPC_RETRY_DELAY_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry_delay);

        Ok(Self {
            rpc_url,
            timeout,
            max_retries,
            retry_delay,
        })
    }
}

/// Transport for JSON-RPC requests, abstracted for testing
#[async_trait]
pub trait JsonRpcProvider: Send + Sync {
    /// Send a JSON-RPC request and return its `result` (which may be `null`)
    async fn send_request(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, AppError>;
}

/// HTTP JSON-RPC transport
pub struct HttpJsonRpcProvider {
    http_client: Client,
    rpc_url: String,
}

impl HttpJsonRpcProvider {
    pub fn new(rpc_url: &str, timeout: Duration) -> Result<Self, AppError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Chain(ChainError::Connection(e.to_string())))?;

        Ok(Self {
            http_client,
            rpc_url: rpc_url.to_string(),
        })
    }
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: serde_json::Value,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[async_trait]
impl JsonRpcProvider for HttpJsonRpcProvider {
    async fn send_request(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, AppError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method,
            params,
        };

        let response = self
            .http_client
            .post(&self.rpc_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Chain(ChainError::Timeout(e.to_string()))
                } else {
                    AppError::Chain(ChainError::Connection(e.to_string()))
                }
            })?;

        let rpc_response: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| AppError::Chain(ChainError::InvalidResponse(e.to_string())))?;

        if let Some(error) = rpc_response.error {
            return Err(AppError::Chain(ChainError::RpcError(format!(
                "{}: {}",
                error.code, error.message
            ))));
        }

        Ok(rpc_response.result)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    transaction_hash: String,
    block_number: Option<String>,
    block_hash: Option<String>,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RpcBlock {
    hash: Option<String>,
}

/// Parse a `0x`-prefixed hex quantity.
pub fn parse_quantity(value: &str) -> Result<u64, AppError> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .ok_or_else(|| {
            AppError::Chain(ChainError::InvalidResponse(format!(
                "Expected hex quantity, got {}",
                value
            )))
        })?;
    if digits.is_empty() {
        return Err(AppError::Chain(ChainError::InvalidResponse(
            "Empty hex quantity".to_string(),
        )));
    }
    u64::from_str_radix(digits, 16).map_err(|e| {
        AppError::Chain(ChainError::InvalidResponse(format!(
            "Invalid hex quantity {}: {}",
            value, e
        )))
    })
}

#[must_use]
pub fn format_quantity(value: u64) -> String {
    format!("{:#x}", value)
}

/// JSON-RPC chain connector
pub struct JsonRpcChainConnector {
    provider: Box<dyn JsonRpcProvider>,
    config: ChainClientConfig,
}

impl JsonRpcChainConnector {
    pub fn new(config: ChainClientConfig) -> Result<Self, AppError> {
        let provider = HttpJsonRpcProvider::new(&config.rpc_url, config.timeout)?;
        info!(rpc_url = %config.rpc_url, "Created JSON-RPC chain connector");
        Ok(Self {
            provider: Box::new(provider),
            config,
        })
    }

    /// Create a connector over a specific transport (useful for testing)
    pub fn with_provider(provider: Box<dyn JsonRpcProvider>, config: ChainClientConfig) -> Self {
        Self { provider, config }
    }

    /// Read call with retries
    async fn rpc_call<R: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<R, AppError> {
        let mut last_error = None;
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry_delay).await;
            }
            match self.provider.send_request(method, params.clone()).await {
                Ok(result_value) => {
                    return serde_json::from_value(result_value).map_err(|e| {
                        AppError::Chain(ChainError::InvalidResponse(format!(
                            "{}: {}",
                            method, e
                        )))
                    });
                }
                Err(e) => {
                    warn!(attempt = attempt, error = ?e, method = %method, "RPC call failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            AppError::Chain(ChainError::RpcError("Unknown error".to_string()))
        }))
    }
}

#[async_trait]
impl ChainConnector for JsonRpcChainConnector {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        let _: String = self.rpc_call("eth_chainId", serde_json::json!([])).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_pending_nonce(&self, submitter: &str) -> Result<u64, AppError> {
        let count: String = self
            .rpc_call(
                "eth_getTransactionCount",
                serde_json::json!([submitter, "pending"]),
            )
            .await?;
        parse_quantity(&count)
    }

    #[instrument(skip(self, payload))]
    async fn send_transaction(
        &self,
        submitter: &str,
        nonce: u64,
        payload: &serde_json::Value,
    ) -> Result<String, AppError> {
        let mut transaction = match payload {
            serde_json::Value::Object(fields) => fields.clone(),
            _ => {
                return Err(AppError::Chain(ChainError::SendFailed(
                    "Payload must be a JSON object".to_string(),
                )));
            }
        };
        transaction.insert("from".to_string(), submitter.into());
        transaction.insert("nonce".to_string(), format_quantity(nonce).into());

        // A timed-out send may still land; retrying here could double-send.
        let result = self
            .provider
            .send_request(
                "eth_sendTransaction",
                serde_json::json!([serde_json::Value::Object(transaction)]),
            )
            .await
            .map_err(|e| match e {
                AppError::Chain(ChainError::RpcError(message)) => {
                    AppError::Chain(ChainError::SendFailed(message))
                }
                other => other,
            })?;

        let tx_hash = result.as_str().map(str::to_string).ok_or_else(|| {
            AppError::Chain(ChainError::InvalidResponse(format!(
                "eth_sendTransaction returned {}",
                result
            )))
        })?;
        debug!(tx_hash = %tx_hash, "Transaction accepted by node");
        Ok(tx_hash)
    }

    #[instrument(skip(self))]
    async fn get_transaction_receipt(
        &self,
        tx_hash: &str,
    ) -> Result<Option<TransactionReceipt>, AppError> {
        let raw: serde_json::Value = self
            .rpc_call("eth_getTransactionReceipt", serde_json::json!([tx_hash]))
            .await?;
        if raw.is_null() {
            return Ok(None);
        }

        let receipt: RpcReceipt = serde_json::from_value(raw.clone())
            .map_err(|e| AppError::Chain(ChainError::InvalidResponse(e.to_string())))?;
        let (Some(block_number), Some(block_hash)) = (receipt.block_number, receipt.block_hash)
        else {
            // Known to the node but not yet mined.
            return Ok(None);
        };

        // Without a status field the outcome is unknown; it must not read as a revert.
        let Some(status) = receipt.status else {
            warn!(tx_hash = %tx_hash, "Receipt carries no status field");
            return Err(AppError::Chain(ChainError::InvalidResponse(format!(
                "receipt for {} has no status field",
                tx_hash
            ))));
        };

        Ok(Some(TransactionReceipt {
            tx_hash: receipt.transaction_hash,
            block_number: parse_quantity(&block_number)?,
            block_hash,
            success: status == "0x1",
            raw,
        }))
    }

    async fn get_latest_block_height(&self) -> Result<u64, AppError> {
        let height: String = self
            .rpc_call("eth_blockNumber", serde_json::json!([]))
            .await?;
        parse_quantity(&height)
    }

    async fn get_block_hash(&self, height: u64) -> Result<Option<String>, AppError> {
        let block: Option<RpcBlock> = self
            .rpc_call(
                "eth_getBlockByNumber",
                serde_json::json!([format_quantity(height), false]),
            )
            .await?;
        Ok(block.and_then(|b| b.hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Replays scripted results and records every request.
    struct ScriptedProvider {
        responses: Mutex<VecDeque<Result<serde_json::Value, AppError>>>,
        requests: Arc<Mutex<Vec<(String, serde_json::Value)>>>,
    }

    impl ScriptedProvider {
        fn new(
            responses: Vec<Result<serde_json::Value, AppError>>,
        ) -> (Self, Arc<Mutex<Vec<(String, serde_json::Value)>>>) {
            let requests = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    responses: Mutex::new(responses.into()),
                    requests: Arc::clone(&requests),
                },
                requests,
            )
        }
    }

    #[async_trait]
    impl JsonRpcProvider for ScriptedProvider {
        async fn send_request(
            &self,
            method: &str,
            params: serde_json::Value,
        ) -> Result<serde_json::Value, AppError> {
            self.requests
                .lock()
                .unwrap()
                .push((method.to_string(), params));
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(serde_json::Value::Null))
        }
    }

    fn connector(
        responses: Vec<Result<serde_json::Value, AppError>>,
    ) -> (JsonRpcChainConnector, Arc<Mutex<Vec<(String, serde_json::Value)>>>) {
        let (provider, requests) = ScriptedProvider::new(responses);
        let config = ChainClientConfig {
            retry_delay: Duration::from_millis(1),
            ..ChainClientConfig::default()
        };
        (
            JsonRpcChainConnector::with_provider(Box::new(provider), config),
            requests,
        )
    }

    fn rpc_error() -> AppError {
        AppError::Chain(ChainError::RpcError("boom".to_string()))
    }

    #[test]
    fn test_quantity_parsing() {
        assert_eq!(parse_quantity("0x0").unwrap(), 0);
        assert_eq!(parse_quantity("0x1f").unwrap(), 31);
        assert!(parse_quantity("1f").is_err());
        assert!(parse_quantity("0x").is_err());
        assert_eq!(format_quantity(255), "0xff");
    }

    #[tokio::test]
    async fn test_pending_nonce_retries_reads() {
        let (chain, requests) = connector(vec![Err(rpc_error()), Ok(serde_json::json!("0xa"))]);
        assert_eq!(chain.get_pending_nonce("0xabc").await.unwrap(), 10);

        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].0, "eth_getTransactionCount");
        assert_eq!(requests[0].1, serde_json::json!(["0xabc", "pending"]));
    }

    #[tokio::test]
    async fn test_send_is_not_retried_and_sets_nonce() {
        let (chain, requests) = connector(vec![Err(rpc_error()), Ok(serde_json::json!("0xhash"))]);
        let result = chain
            .send_transaction("0xabc", 7, &serde_json::json!({"to": "0xdef"}))
            .await;

        assert!(matches!(
            result,
            Err(AppError::Chain(ChainError::SendFailed(_)))
        ));
        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        let tx = &requests[0].1[0];
        assert_eq!(tx["from"], "0xabc");
        assert_eq!(tx["nonce"], "0x7");
        assert_eq!(tx["to"], "0xdef");
    }

    #[tokio::test]
    async fn test_send_rejects_non_object_payload() {
        let (chain, requests) = connector(vec![]);
        let result = chain
            .send_transaction("0xabc", 0, &serde_json::json!("raw"))
            .await;
        assert!(result.is_err());
        assert!(requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_receipt_parsing() {
        let (chain, _) = connector(vec![
            Ok(serde_json::Value::Null),
            Ok(serde_json::json!({
                "transactionHash": "0xhash",
                "blockNumber": "0x64",
                "blockHash": "0xblock",
                "status": "0x0"
            })),
        ]);

        assert!(chain.get_transaction_receipt("0xhash").await.unwrap().is_none());
        let receipt = chain.get_transaction_receipt("0xhash").await.unwrap().unwrap();
        assert_eq!(receipt.block_number, 100);
        assert_eq!(receipt.block_hash, "0xblock");
        assert!(!receipt.success);
        assert_eq!(receipt.raw["status"], "0x0");
    }

    #[tokio::test]
    async fn test_receipt_without_status_is_not_a_failure() {
        let (chain, _) = connector(vec![Ok(serde_json::json!({
            "transactionHash": "0xhash",
            "blockNumber": "0x64",
            "blockHash": "0xblock",
            "root": "0xstateroot"
        }))]);

        let result = chain.get_transaction_receipt("0xhash").await;
        assert!(matches!(
            result,
            Err(AppError::Chain(ChainError::InvalidResponse(_)))
        ));
    }

    #[tokio::test]
    async fn test_block_hash_lookup() {
        let (chain, requests) = connector(vec![
            Ok(serde_json::json!({"hash": "0xcanonical", "number": "0x64"})),
            Ok(serde_json::Value::Null),
        ]);
        assert_eq!(
            chain.get_block_hash(100).await.unwrap().as_deref(),
            Some("0xcanonical")
        );
        assert!(chain.get_block_hash(101).await.unwrap().is_none());
        assert_eq!(
            requests.lock().unwrap()[0].1,
            serde_json::json!(["0x64", false])
        );
    }

    #[tokio::test]
    async fn test_hash_derivation_unsupported() {
        let (chain, _) = connector(vec![]);
        assert!(matches!(
            chain
                .derive_expected_tx_hash("0xabc", 1, &serde_json::json!({}))
                .await,
            Err(AppError::NotSupported(_))
        ));
    }
}
