//! Domain layer containing core types, traits, and error definitions.

pub mod error;
pub mod traits;
pub mod types;

pub use error::{AppError, ChainError, ConfigError, DatabaseError, ValidationError};
pub use traits::{
    ChainConnector, MetricsObserver, NonceCache, StoreTransaction, StuckResolutionHook,
    TransactionStore,
};
pub use types::{
    CompletionEvent, CompletionPage, CreateTransactionRequest, ErrorDetail, ErrorResponse,
    FencedWrite, HealthResponse, HealthStatus, LeaseGrant, ManagedTransaction, NonceCacheEntry,
    NonceCursor, StuckContext, StuckDecision, SubmitterBacklog, SubmitterLease, TerminalUpdate,
    TransactionReceipt, TransactionState, sub_state,
};
