//! Default metrics observer.

use crate::domain::MetricsObserver;

/// Discards every observation. Used when no observer is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsObserver for NoopMetrics {}
