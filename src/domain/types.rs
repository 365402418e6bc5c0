//! Domain types for managed transactions, leases and the completion feed.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

/// Lifecycle state of a managed transaction.
///
/// States only move forward: `Created -> Allocated -> Tracking -> terminal`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    /// Row exists, no nonce bound yet
    #[default]
    Created,
    /// Nonce bound, not yet recorded as sent
    Allocated,
    /// A send (or derived hash) has been recorded; awaiting receipt/finality
    Tracking,
    /// Receipt reported success with enough confirmations
    Confirmed,
    /// Receipt reported failure with enough confirmations
    FailedFinal,
    /// Remediation exhausted, reorg detected, or marked by an operator
    Stuck,
}

impl TransactionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Allocated => "allocated",
            Self::Tracking => "tracking",
            Self::Confirmed => "confirmed",
            Self::FailedFinal => "failed_final",
            Self::Stuck => "stuck",
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::FailedFinal | Self::Stuck)
    }

    /// Position in the forward-only state machine. Terminal states share a rank.
    #[must_use]
    pub fn rank(&self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Allocated => 1,
            Self::Tracking => 2,
            Self::Confirmed | Self::FailedFinal | Self::Stuck => 3,
        }
    }

    /// Whether moving from `self` to `next` is a legal forward transition.
    #[must_use]
    pub fn can_advance_to(&self, next: TransactionState) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }
}

impl std::str::FromStr for TransactionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "allocated" => Ok(Self::Allocated),
            "tracking" => Ok(Self::Tracking),
            "confirmed" => Ok(Self::Confirmed),
            "failed_final" => Ok(Self::FailedFinal),
            "stuck" => Ok(Self::Stuck),
            _ => Err(format!("Invalid transaction state: {}", s)),
        }
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Well-known sub-state markers written alongside state transitions
pub mod sub_state {
    pub const DERIVED_HASH: &str = "derived_hash";
    pub const REORG_DETECTED: &str = "reorg_detected";
    pub const MARKED_STUCK: &str = "resolution_marked_stuck";
    pub const REMEDIATION_CANCEL: &str = "remediation_cancel";
    pub const REMEDIATION_REPLACE: &str = "remediation_replace";
    pub const REMEDIATION_PLACEHOLDER: &str = "remediation_placeholder";
}

/// One row per logical transaction
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct ManagedTransaction {
    /// Immutable transaction identifier
    pub id: Uuid,
    /// Account on whose behalf the transaction is sent
    #[schema(example = "0x8ba1f109551bd432803012645ac136ddd64dba72")]
    pub submitter: String,
    /// Optional caller-supplied idempotency key
    pub request_id: Option<String>,
    /// Sequence number bound at allocation time
    pub nonce: u64,
    /// Opaque transaction body handed to the chain connector
    #[schema(value_type = Object)]
    pub payload: serde_json::Value,
    /// Hash of the latest recorded submission
    pub tx_hash: Option<String>,
    pub state: TransactionState,
    /// Free-text diagnostic marker
    pub sub_state: Option<String>,
    pub last_submit_at: Option<DateTime<Utc>>,
    pub last_receipt_check_at: Option<DateTime<Utc>>,
    pub next_resubmit_at: Option<DateTime<Utc>>,
    pub submit_attempts: i32,
    pub last_error: Option<String>,
    /// Raw receipt as discovered by the receipt checker
    #[schema(value_type = Option<Object>)]
    pub receipt: Option<serde_json::Value>,
    pub confirmed_at: Option<DateTime<Utc>>,
    /// Fencing token presented by the last successful write
    pub fencing_token: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ManagedTransaction {
    /// Build a freshly allocated record.
    #[must_use]
    pub fn allocated(
        submitter: String,
        request_id: Option<String>,
        nonce: u64,
        payload: serde_json::Value,
        fencing_token: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            submitter,
            request_id,
            nonce,
            payload,
            tx_hash: None,
            state: TransactionState::Allocated,
            sub_state: None,
            last_submit_at: None,
            last_receipt_check_at: None,
            next_resubmit_at: None,
            submit_attempts: 0,
            last_error: None,
            receipt: None,
            confirmed_at: None,
            fencing_token,
            created_at: now,
            updated_at: now,
        }
    }

    /// Parse the persisted receipt, if any.
    pub fn parsed_receipt(&self) -> Option<Result<TransactionReceipt, serde_json::Error>> {
        self.receipt
            .as_ref()
            .map(|raw| serde_json::from_value(raw.clone()))
    }
}

/// Receipt as reported by the chain connector
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransactionReceipt {
    pub tx_hash: String,
    pub block_number: u64,
    pub block_hash: String,
    /// Whether execution succeeded
    pub success: bool,
    /// Connector-specific receipt body
    #[serde(default)]
    pub raw: serde_json::Value,
}

/// Per-submitter leadership lease row
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmitterLease {
    pub submitter: String,
    pub owner_id: String,
    pub fencing_token: i64,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of a lease acquire/renew call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseGrant {
    pub is_leader: bool,
    /// Current token; only usable for writes when `is_leader` is true
    pub fencing_token: i64,
    pub expires_at: DateTime<Utc>,
}

/// Durable "next nonce to allocate" floor for a submitter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NonceCursor {
    pub submitter: String,
    pub next_nonce: u64,
    pub fencing_token: i64,
    pub updated_at: DateTime<Utc>,
}

/// Process-local nonce cache entry. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonceCacheEntry {
    pub next_nonce: u64,
    pub cached_at: DateTime<Utc>,
}

/// Append-only terminal transition record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct CompletionEvent {
    /// Strictly increasing, assigned by storage
    pub sequence: i64,
    pub transaction_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub status: TransactionState,
}

/// Page of completion events
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CompletionPage {
    pub events: Vec<CompletionEvent>,
    /// Sequence to pass as `after` for the next page
    pub next_after: i64,
}

impl CompletionPage {
    #[must_use]
    pub fn new(events: Vec<CompletionEvent>, after: i64) -> Self {
        let next_after = events.last().map(|e| e.sequence).unwrap_or(after);
        Self { events, next_after }
    }
}

/// Pending-work summary for one submitter, used by backlog governance
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitterBacklog {
    pub submitter: String,
    /// Receiptless, non-terminal transactions
    pub pending_count: i64,
    /// Lowest-nonce pending transaction
    pub oldest_transaction_id: Uuid,
    pub oldest_age: chrono::Duration,
}

/// Identifies a fenced write: the row plus the token that must still be current
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FencedWrite {
    pub transaction_id: Uuid,
    pub submitter: String,
    pub fencing_token: i64,
}

impl FencedWrite {
    #[must_use]
    pub fn new(transaction: &ManagedTransaction, fencing_token: i64) -> Self {
        Self {
            transaction_id: transaction.id,
            submitter: transaction.submitter.clone(),
            fencing_token,
        }
    }
}

/// Terminal transition written together with its completion event
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalUpdate {
    pub state: TransactionState,
    pub sub_state: Option<String>,
    pub error: Option<String>,
}

impl TerminalUpdate {
    #[must_use]
    pub fn new(state: TransactionState) -> Self {
        Self {
            state,
            sub_state: None,
            error: None,
        }
    }

    #[must_use]
    pub fn with_sub_state(mut self, sub_state: impl Into<String>) -> Self {
        self.sub_state = Some(sub_state.into());
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Only outcomes judged by finality carry a confirmation timestamp.
    #[must_use]
    pub fn sets_confirmed_at(&self) -> bool {
        matches!(
            self.state,
            TransactionState::Confirmed | TransactionState::FailedFinal
        )
    }
}

/// Request to create a new managed transaction
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct CreateTransactionRequest {
    #[validate(length(min = 1, max = 128, message = "Submitter is required"))]
    #[schema(example = "0x8ba1f109551bd432803012645ac136ddd64dba72")]
    pub submitter: String,
    /// Idempotency key, unique per submitter
    #[validate(length(min = 1, max = 255, message = "Request id must be 1-255 characters"))]
    #[schema(example = "order-1234")]
    pub request_id: Option<String>,
    #[schema(value_type = Object)]
    pub payload: serde_json::Value,
}

impl CreateTransactionRequest {
    #[must_use]
    pub fn new(
        submitter: impl Into<String>,
        request_id: Option<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            submitter: submitter.into(),
            request_id,
            payload,
        }
    }
}

/// Read-only view handed to the stuck-resolution hook
#[derive(Debug, Clone, PartialEq)]
pub struct StuckContext {
    pub transaction_id: Uuid,
    pub submitter: String,
    pub nonce: u64,
    pub state: TransactionState,
    pub submit_attempts: i32,
    pub max_attempts: i32,
    pub age: chrono::Duration,
    pub last_error: Option<String>,
}

/// Decision returned by a stuck-resolution hook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload", rename_all = "snake_case")]
pub enum StuckDecision {
    /// Terminal `Stuck` plus a completion event
    MarkStuck,
    /// Make the transaction due immediately
    ResubmitNow,
    /// Push the next resubmit deadline out
    Delay(Duration),
    /// Leave it retrying on the normal cadence
    Ignore,
    /// Send a cancellation body at the same nonce
    Cancel(serde_json::Value),
    /// Send a replacement body at the same nonce
    Replace(serde_json::Value),
    /// Send a placeholder body at the same nonce
    Placeholder(serde_json::Value),
}

impl StuckDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MarkStuck => "mark_stuck",
            Self::ResubmitNow => "resubmit_now",
            Self::Delay(_) => "delay",
            Self::Ignore => "ignore",
            Self::Cancel(_) => "cancel",
            Self::Replace(_) => "replace",
            Self::Placeholder(_) => "placeholder",
        }
    }

    /// Remediation payload and the sub-state recorded when it is sent
    #[must_use]
    pub fn remediation(&self) -> Option<(&serde_json::Value, &'static str)> {
        match self {
            Self::Cancel(payload) => Some((payload, sub_state::REMEDIATION_CANCEL)),
            Self::Replace(payload) => Some((payload, sub_state::REMEDIATION_REPLACE)),
            Self::Placeholder(payload) => Some((payload, sub_state::REMEDIATION_PLACEHOLDER)),
            _ => None,
        }
    }
}

/// Health status enum
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub database: HealthStatus,
    pub chain: HealthStatus,
    pub timestamp: DateTime<Utc>,
    #[schema(example = "0.1.0")]
    pub version: String,
}

impl HealthResponse {
    #[must_use]
    pub fn new(database: HealthStatus, chain: HealthStatus) -> Self {
        let status = match (&database, &chain) {
            (HealthStatus::Healthy, HealthStatus::Healthy) => HealthStatus::Healthy,
            (HealthStatus::Unhealthy, _) => HealthStatus::Unhealthy,
            _ => HealthStatus::Degraded,
        };
        Self {
            status,
            database,
            chain,
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Error response structure
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

/// Error detail structure
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorDetail {
    #[schema(example = "not_leader")]
    pub r#type: String,
    pub message: String,
}
