//! Lease-fenced blockchain transaction manager.
//!
//! Allocates per-submitter nonces under a database lease with fencing tokens,
//! submits and resubmits transactions, follows receipts to finality, and
//! publishes terminal transitions on an append-only completion feed.

pub mod api;
pub mod app;
pub mod domain;
pub mod infra;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
