//! Test doubles shared by unit and integration tests.

pub mod mocks;
pub mod store;

pub use mocks::{MockChainConnector, MockConfig, RecordingMetrics, SentTransaction};
pub use store::{InMemoryStoreTransaction, InMemoryTransactionStore};
