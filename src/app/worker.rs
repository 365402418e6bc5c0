//! Background worker plumbing shared by the periodic scans.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use super::config::MIN_LOOP_INTERVAL;
use crate::domain::{AppError, ChainError};

/// Highest doubling exponent applied before the cap takes over
const MAX_BACKOFF_EXPONENT: u32 = 20;

/// A scan that runs once per tick.
#[async_trait]
pub trait PeriodicTask: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Run one scan, returning how many items were handled
    async fn run_cycle(&self) -> Result<usize, AppError>;
}

/// Spawn a single-flight periodic loop.
///
/// A cycle always runs to completion; shutdown is only observed between
/// cycles, and a slow cycle causes missed ticks to be skipped rather than
/// queued.
pub fn spawn_periodic<T: PeriodicTask>(
    task: Arc<T>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let interval = interval.max(MIN_LOOP_INTERVAL);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            task = task.name(),
            interval_ms = interval.as_millis() as u64,
            "Periodic task started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match task.run_cycle().await {
                        Ok(0) => {}
                        Ok(handled) => debug!(task = task.name(), handled, "Cycle complete"),
                        Err(e) => error!(task = task.name(), error = ?e, "Cycle failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!(task = task.name(), "Periodic task shutting down");
                    break;
                }
            }
        }
    })
}

/// Calculate exponential backoff: `base * 2^attempt`, capped at `max`.
#[must_use]
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 1u32 << attempt.min(MAX_BACKOFF_EXPONENT);
    base.saturating_mul(factor).min(max)
}

/// Bound a chain call so a wedged RPC cannot block a worker indefinitely.
pub async fn with_chain_timeout<T, F>(
    timeout: Duration,
    operation: &'static str,
    call: F,
) -> Result<T, AppError>
where
    F: Future<Output = Result<T, AppError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(AppError::Chain(ChainError::Timeout(format!(
            "{} did not complete within {}ms",
            operation,
            timeout.as_millis()
        )))),
    }
}
