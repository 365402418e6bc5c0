//! Aggregated component configuration.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use super::finality::FinalityConfig;
use super::lease::LeaseConfig;
use super::receipts::ReceiptCheckerConfig;
use super::resubmit::ResubmitConfig;
use super::writer::WriterConfig;
use crate::infra::NonceCacheConfig;

/// Default bound applied to every chain call made by the services
pub const DEFAULT_CHAIN_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Shortest period a periodic loop will tick at
pub const MIN_LOOP_INTERVAL: Duration = Duration::from_millis(1);

/// Parse an environment variable, falling back to `default` when unset or invalid.
pub(crate) fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

pub(crate) fn env_secs(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

/// Loop period in seconds; zero is raised to [`MIN_LOOP_INTERVAL`].
pub(crate) fn env_interval_secs(key: &str, default: Duration) -> Duration {
    env_secs(key, default).max(MIN_LOOP_INTERVAL)
}

pub(crate) fn env_millis(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

/// Bound for service-side chain calls (`CHAIN_CALL_TIMEOUT_MS`)
pub(crate) fn chain_call_timeout_from_env() -> Duration {
    env_millis("CHAIN_CALL_TIMEOUT_MS", DEFAULT_CHAIN_CALL_TIMEOUT)
}

/// Configuration for every component assembled by the manager
#[derive(Debug, Clone, Default)]
pub struct ManagerConfig {
    pub lease: LeaseConfig,
    pub nonce_cache: NonceCacheConfig,
    pub writer: WriterConfig,
    pub resubmit: ResubmitConfig,
    pub receipts: ReceiptCheckerConfig,
    pub finality: FinalityConfig,
}

impl ManagerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            lease: LeaseConfig::from_env(),
            nonce_cache: NonceCacheConfig::from_env(),
            writer: WriterConfig::from_env(),
            resubmit: ResubmitConfig::from_env(),
            receipts: ReceiptCheckerConfig::from_env(),
            finality: FinalityConfig::from_env(),
        }
    }
}
