//! Infrastructure layer implementations.

pub mod chain;
pub mod database;
pub mod nonce_cache;

pub use chain::{ChainClientConfig, JsonRpcChainConnector};
pub use database::{PostgresClient, PostgresConfig};
pub use nonce_cache::{LruNonceCache, NonceCacheConfig};
