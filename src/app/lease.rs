//! Per-submitter leadership leases with monotonic fencing tokens.
//!
//! The database clock is the only clock consulted, so nodes with drifting
//! wall clocks agree on expiry. A configured skew allowance is subtracted
//! from database time before comparing against a lease's expiry, which gives
//! the current holder a grace period before anyone may take over.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use crate::domain::{AppError, LeaseGrant, StoreTransaction, SubmitterLease, TransactionStore};

/// Lease configuration
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// Identifier of this process, recorded as lease owner
    pub node_id: String,
    pub lease_duration: Duration,
    /// Tolerated clock skew between the database and lease holders
    pub clock_skew: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            lease_duration: Duration::from_secs(30),
            clock_skew: Duration::from_millis(500),
        }
    }
}

impl LeaseConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        use std::env;

        let defaults = Self::default();
        let node_id = env::var("NODE_ID")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.node_id);
        let lease_duration = env::var("LEASE_DURATION_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.lease_duration);
        let clock_skew = env::var("LEASE_CLOCK_SKEW_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.clock_skew);

        Self {
            node_id,
            lease_duration,
            clock_skew,
        }
    }
}

/// Outcome of evaluating an existing lease row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseAction {
    /// Owned by us and still valid: extend with the same token
    Renew,
    /// Expired (whoever owned it): bump the token and take ownership
    Takeover,
    /// Held by another node and still valid
    Follow,
}

/// Decide what to do with an existing lease row.
#[must_use]
pub fn evaluate_lease(
    lease: &SubmitterLease,
    node_id: &str,
    effective_now: DateTime<Utc>,
) -> LeaseAction {
    let expired = lease.expires_at <= effective_now;
    if expired {
        LeaseAction::Takeover
    } else if lease.owner_id == node_id {
        LeaseAction::Renew
    } else {
        LeaseAction::Follow
    }
}

/// Grants per-submitter exclusive leadership
pub struct LeaseManager {
    store: Arc<dyn TransactionStore>,
    config: LeaseConfig,
}

impl LeaseManager {
    #[must_use]
    pub fn new(store: Arc<dyn TransactionStore>, config: LeaseConfig) -> Self {
        Self { store, config }
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// Acquire or renew in a dedicated database transaction.
    #[instrument(skip(self), fields(node = %self.config.node_id))]
    pub async fn acquire_or_renew(&self, submitter: &str) -> Result<LeaseGrant, AppError> {
        let mut tx = self.store.begin().await?;
        match self.acquire_or_renew_in(tx.as_mut(), submitter).await {
            Ok(grant) => {
                tx.commit().await?;
                Ok(grant)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    /// Acquire or renew inside a caller-owned transaction (the writer batch).
    pub async fn acquire_or_renew_in(
        &self,
        tx: &mut dyn StoreTransaction,
        submitter: &str,
    ) -> Result<LeaseGrant, AppError> {
        let now = tx.database_now().await?;
        let skew = chrono::Duration::from_std(self.config.clock_skew)
            .map_err(|e| AppError::Internal(format!("Invalid clock skew: {}", e)))?;
        let duration = chrono::Duration::from_std(self.config.lease_duration)
            .map_err(|e| AppError::Internal(format!("Invalid lease duration: {}", e)))?;
        let effective_now = now - skew;
        let expires_at = now + duration;

        let current = match tx.lock_lease(submitter).await? {
            Some(lease) => lease,
            None => {
                let lease = SubmitterLease {
                    submitter: submitter.to_string(),
                    owner_id: self.config.node_id.clone(),
                    fencing_token: 1,
                    expires_at,
                    updated_at: now,
                };
                if tx.insert_lease(&lease).await? {
                    info!(submitter = %submitter, fencing_token = 1, "Lease created");
                    return Ok(LeaseGrant {
                        is_leader: true,
                        fencing_token: 1,
                        expires_at,
                    });
                }
                // Lost the insert race; evaluate the winner's row.
                tx.lock_lease(submitter).await?.ok_or_else(|| {
                    AppError::Internal(format!("Lease row for {} vanished", submitter))
                })?
            }
        };

        match evaluate_lease(&current, &self.config.node_id, effective_now) {
            LeaseAction::Renew => {
                let renewed = SubmitterLease {
                    expires_at,
                    updated_at: now,
                    ..current
                };
                tx.update_lease(&renewed).await?;
                debug!(submitter = %submitter, fencing_token = renewed.fencing_token, "Lease renewed");
                Ok(LeaseGrant {
                    is_leader: true,
                    fencing_token: renewed.fencing_token,
                    expires_at,
                })
            }
            LeaseAction::Takeover => {
                let taken = SubmitterLease {
                    submitter: current.submitter.clone(),
                    owner_id: self.config.node_id.clone(),
                    fencing_token: current.fencing_token + 1,
                    expires_at,
                    updated_at: now,
                };
                tx.update_lease(&taken).await?;
                info!(
                    submitter = %submitter,
                    previous_owner = %current.owner_id,
                    fencing_token = taken.fencing_token,
                    "Lease taken over after expiry"
                );
                Ok(LeaseGrant {
                    is_leader: true,
                    fencing_token: taken.fencing_token,
                    expires_at,
                })
            }
            LeaseAction::Follow => {
                debug!(
                    submitter = %submitter,
                    owner = %current.owner_id,
                    fencing_token = current.fencing_token,
                    "Lease held by another node"
                );
                Ok(LeaseGrant {
                    is_leader: false,
                    fencing_token: current.fencing_token,
                    expires_at: current.expires_at,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::InMemoryTransactionStore;

    fn manager(store: &Arc<InMemoryTransactionStore>, node: &str) -> LeaseManager {
        LeaseManager::new(
            Arc::clone(store) as Arc<dyn TransactionStore>,
            LeaseConfig {
                node_id: node.to_string(),
                lease_duration: Duration::from_secs(30),
                clock_skew: Duration::from_millis(500),
            },
        )
    }

    fn lease(owner: &str, token: i64, expires_at: DateTime<Utc>) -> SubmitterLease {
        SubmitterLease {
            submitter: "s1".to_string(),
            owner_id: owner.to_string(),
            fencing_token: token,
            expires_at,
            updated_at: expires_at,
        }
    }

    #[test]
    fn test_evaluate_lease_matrix() {
        let now = Utc::now();
        let future = now + chrono::Duration::seconds(10);
        let past = now - chrono::Duration::seconds(1);

        assert_eq!(evaluate_lease(&lease("a", 1, future), "a", now), LeaseAction::Renew);
        assert_eq!(evaluate_lease(&lease("b", 1, future), "a", now), LeaseAction::Follow);
        assert_eq!(evaluate_lease(&lease("b", 1, past), "a", now), LeaseAction::Takeover);
        assert_eq!(evaluate_lease(&lease("a", 1, past), "a", now), LeaseAction::Takeover);
        assert_eq!(evaluate_lease(&lease("b", 1, now), "a", now), LeaseAction::Takeover);
    }

    #[tokio::test]
    async fn test_first_acquire_creates_token_one() {
        let store = Arc::new(InMemoryTransactionStore::new());
        let grant = manager(&store, "node-a").acquire_or_renew("s1").await.unwrap();

        assert!(grant.is_leader);
        assert_eq!(grant.fencing_token, 1);
        let row = store.get_lease("s1").await.unwrap().unwrap();
        assert_eq!(row.owner_id, "node-a");
    }

    #[tokio::test]
    async fn test_renew_keeps_token_and_extends_expiry() {
        let store = Arc::new(InMemoryTransactionStore::new());
        let leases = manager(&store, "node-a");
        let first = leases.acquire_or_renew("s1").await.unwrap();
        store.advance_clock(chrono::Duration::seconds(5));
        let second = leases.acquire_or_renew("s1").await.unwrap();

        assert!(second.is_leader);
        assert_eq!(second.fencing_token, first.fencing_token);
        assert!(second.expires_at > first.expires_at);
    }

    #[tokio::test]
    async fn test_other_node_follows_while_valid() {
        let store = Arc::new(InMemoryTransactionStore::new());
        manager(&store, "node-a").acquire_or_renew("s1").await.unwrap();
        let grant = manager(&store, "node-b").acquire_or_renew("s1").await.unwrap();

        assert!(!grant.is_leader);
        assert_eq!(grant.fencing_token, 1);
        let row = store.get_lease("s1").await.unwrap().unwrap();
        assert_eq!(row.owner_id, "node-a");
    }

    #[tokio::test]
    async fn test_takeover_after_expiry_bumps_token() {
        let store = Arc::new(InMemoryTransactionStore::new());
        manager(&store, "node-a").acquire_or_renew("s1").await.unwrap();
        store.advance_clock(chrono::Duration::seconds(31));
        let grant = manager(&store, "node-b").acquire_or_renew("s1").await.unwrap();

        assert!(grant.is_leader);
        assert_eq!(grant.fencing_token, 2);
        let row = store.get_lease("s1").await.unwrap().unwrap();
        assert_eq!(row.owner_id, "node-b");
    }

    #[tokio::test]
    async fn test_skew_allowance_delays_takeover() {
        let store = Arc::new(InMemoryTransactionStore::new());
        manager(&store, "node-a").acquire_or_renew("s1").await.unwrap();
        // Past nominal expiry but inside the 500ms skew allowance.
        store.advance_clock(chrono::Duration::milliseconds(30_200));
        let grant = manager(&store, "node-b").acquire_or_renew("s1").await.unwrap();

        assert!(!grant.is_leader);
    }
}
