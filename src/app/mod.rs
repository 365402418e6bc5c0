//! Application layer: coordination services and background workers.

pub mod config;
pub mod finality;
pub mod lease;
pub mod manager;
pub mod metrics;
pub mod nonce;
pub mod receipts;
pub mod resubmit;
pub mod stuck;
pub mod worker;
pub mod writer;

pub use config::ManagerConfig;
pub use finality::{FinalityConfig, FinalityManager, FinalityOutcome};
pub use lease::{LeaseConfig, LeaseManager};
pub use manager::{TxManager, TxManagerBuilder};
pub use metrics::NoopMetrics;
pub use nonce::NonceAllocator;
pub use receipts::{ReceiptChecker, ReceiptCheckerConfig, ReceiptTask, TaskOutcome};
pub use resubmit::{ResubmitConfig, ResubmitOutcome, ResubmitScheduler};
pub use stuck::{AppliedResolution, IgnoreHook, ResolutionOutcome, StuckResolutionService};
pub use worker::{PeriodicTask, calculate_backoff, spawn_periodic};
pub use writer::{BatchProcessor, TransactionWriter, WriterConfig};
