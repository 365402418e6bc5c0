//! PostgreSQL transaction store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, postgres::PgPoolOptions, postgres::PgRow};
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::domain::{
    AppError, CompletionEvent, ConfigError, DatabaseError, FencedWrite, ManagedTransaction,
    NonceCursor, StoreTransaction, SubmitterBacklog, SubmitterLease, TerminalUpdate,
    TransactionReceipt, TransactionState, TransactionStore,
};

const TRANSACTION_COLUMNS: &str = r#"
    id, submitter, request_id, nonce, payload, tx_hash, state, sub_state,
    last_submit_at, last_receipt_check_at, next_resubmit_at, submit_attempts,
    last_error, receipt, confirmed_at, fencing_token, created_at, updated_at
"#;

/// Rows that may still be (re)sent: nonce bound, no receipt yet.
const RESENDABLE: &str = "t.state IN ('allocated', 'tracking') AND t.receipt IS NULL";

const NOT_TERMINAL: &str = "t.state NOT IN ('confirmed', 'failed_final', 'stuck')";

/// Advisory lock key serializing completion-event inserts until commit, so a
/// reader never sees a sequence number before a lower one becomes visible.
const COMPLETION_FEED_LOCK: i64 = 0x6674_6d5f_6665_6564;

/// PostgreSQL connection pool configuration
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(3),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

impl PostgresConfig {
    /// Override pool sizing from `DB_MAX_CONNECTIONS` and `DB_MIN_CONNECTIONS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(value) = std::env::var("DB_MAX_CONNECTIONS") {
            config.max_connections = value.parse().map_err(|_| ConfigError::InvalidValue {
                key: "DB_MAX_CONNECTIONS".to_string(),
                message: format!("expected an integer, got {}", value),
            })?;
        }
        if let Ok(value) = std::env::var("DB_MIN_CONNECTIONS") {
            config.min_connections = value.parse().map_err(|_| ConfigError::InvalidValue {
                key: "DB_MIN_CONNECTIONS".to_string(),
                message: format!("expected an integer, got {}", value),
            })?;
        }
        Ok(config)
    }
}

fn nonce_to_db(nonce: u64) -> Result<i64, AppError> {
    i64::try_from(nonce)
        .map_err(|_| AppError::Internal(format!("Nonce {} exceeds storage range", nonce)))
}

fn nonce_from_db(nonce: i64) -> Result<u64, AppError> {
    u64::try_from(nonce).map_err(|_| {
        AppError::Database(DatabaseError::Query(format!("Negative nonce {} in storage", nonce)))
    })
}

fn delay_secs(delay: Duration) -> f64 {
    delay.as_secs_f64()
}

fn parse_state(value: &str) -> Result<TransactionState, AppError> {
    value
        .parse()
        .map_err(|e: String| AppError::Database(DatabaseError::Query(e)))
}

/// PostgreSQL store with connection pooling
pub struct PostgresClient {
    pool: PgPool,
}

impl PostgresClient {
    /// Create a new PostgreSQL client with custom configuration
    pub async fn new(database_url: &str, config: PostgresConfig) -> Result<Self, AppError> {
        info!("Connecting to PostgreSQL...");
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .max_lifetime(config.max_lifetime)
            .connect(database_url)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Connection(e.to_string())))?;
        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    pub async fn with_defaults(database_url: &str) -> Result<Self, AppError> {
        Self::new(database_url, PostgresConfig::default()).await
    }

    /// Run database migrations using sqlx migrate
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Migration(e.to_string())))?;
        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying connection pool (for testing)
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_transaction(row: &PgRow) -> Result<ManagedTransaction, AppError> {
        let state: String = row.try_get("state").map_err(DatabaseError::from)?;
        let nonce: i64 = row.try_get("nonce").map_err(DatabaseError::from)?;

        Ok(ManagedTransaction {
            id: row.try_get("id").map_err(DatabaseError::from)?,
            submitter: row.try_get("submitter").map_err(DatabaseError::from)?,
            request_id: row.try_get("request_id").map_err(DatabaseError::from)?,
            nonce: nonce_from_db(nonce)?,
            payload: row.try_get("payload").map_err(DatabaseError::from)?,
            tx_hash: row.try_get("tx_hash").map_err(DatabaseError::from)?,
            state: parse_state(&state)?,
            sub_state: row.try_get("sub_state").map_err(DatabaseError::from)?,
            last_submit_at: row.try_get("last_submit_at").map_err(DatabaseError::from)?,
            last_receipt_check_at: row
                .try_get("last_receipt_check_at")
                .map_err(DatabaseError::from)?,
            next_resubmit_at: row.try_get("next_resubmit_at").map_err(DatabaseError::from)?,
            submit_attempts: row.try_get("submit_attempts").map_err(DatabaseError::from)?,
            last_error: row.try_get("last_error").map_err(DatabaseError::from)?,
            receipt: row.try_get("receipt").map_err(DatabaseError::from)?,
            confirmed_at: row.try_get("confirmed_at").map_err(DatabaseError::from)?,
            fencing_token: row.try_get("fencing_token").map_err(DatabaseError::from)?,
            created_at: row.try_get("created_at").map_err(DatabaseError::from)?,
            updated_at: row.try_get("updated_at").map_err(DatabaseError::from)?,
        })
    }

    fn row_to_lease(row: &PgRow) -> Result<SubmitterLease, AppError> {
        Ok(SubmitterLease {
            submitter: row.try_get("submitter").map_err(DatabaseError::from)?,
            owner_id: row.try_get("owner_id").map_err(DatabaseError::from)?,
            fencing_token: row.try_get("fencing_token").map_err(DatabaseError::from)?,
            expires_at: row.try_get("expires_at").map_err(DatabaseError::from)?,
            updated_at: row.try_get("updated_at").map_err(DatabaseError::from)?,
        })
    }

    fn row_to_cursor(row: &PgRow) -> Result<NonceCursor, AppError> {
        let next_nonce: i64 = row.try_get("next_nonce").map_err(DatabaseError::from)?;
        Ok(NonceCursor {
            submitter: row.try_get("submitter").map_err(DatabaseError::from)?,
            next_nonce: nonce_from_db(next_nonce)?,
            fencing_token: row.try_get("fencing_token").map_err(DatabaseError::from)?,
            updated_at: row.try_get("updated_at").map_err(DatabaseError::from)?,
        })
    }

    fn row_to_event(row: &PgRow) -> Result<CompletionEvent, AppError> {
        let status: String = row.try_get("status").map_err(DatabaseError::from)?;
        Ok(CompletionEvent {
            sequence: row.try_get("sequence").map_err(DatabaseError::from)?,
            transaction_id: row.try_get("transaction_id").map_err(DatabaseError::from)?,
            occurred_at: row.try_get("occurred_at").map_err(DatabaseError::from)?,
            status: parse_state(&status)?,
        })
    }

    async fn list_transactions(
        &self,
        filter_and_order: &str,
        limit: i64,
    ) -> Result<Vec<ManagedTransaction>, AppError> {
        let sql = format!(
            "SELECT {} FROM managed_transactions t WHERE {} LIMIT $1",
            TRANSACTION_COLUMNS, filter_and_order
        );
        let rows = sqlx::query(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from)?;
        rows.iter().map(Self::row_to_transaction).collect()
    }
}

/// Writer-batch scope over one `sqlx` transaction
pub struct PostgresStoreTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTransaction for PostgresStoreTransaction {
    async fn database_now(&mut self) -> Result<DateTime<Utc>, AppError> {
        let now = sqlx::query_scalar::<_, DateTime<Utc>>("SELECT NOW()")
            .fetch_one(&mut *self.tx)
            .await
            .map_err(DatabaseError::from)?;
        Ok(now)
    }

    #[instrument(skip(self))]
    async fn lock_lease(&mut self, submitter: &str) -> Result<Option<SubmitterLease>, AppError> {
        let row = sqlx::query(
            r#"
            SELECT submitter, owner_id, fencing_token, expires_at, updated_at
            FROM submitter_leases
            WHERE submitter = $1
            FOR UPDATE
            "#,
        )
        .bind(submitter)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(DatabaseError::from)?;

        row.as_ref().map(PostgresClient::row_to_lease).transpose()
    }

    async fn insert_lease(&mut self, lease: &SubmitterLease) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO submitter_leases (submitter, owner_id, fencing_token, expires_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (submitter) DO NOTHING
            "#,
        )
        .bind(&lease.submitter)
        .bind(&lease.owner_id)
        .bind(lease.fencing_token)
        .bind(lease.expires_at)
        .bind(lease.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(DatabaseError::from)?;

        Ok(result.rows_affected() == 1)
    }

    async fn update_lease(&mut self, lease: &SubmitterLease) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE submitter_leases
            SET owner_id = $2, fencing_token = $3, expires_at = $4, updated_at = $5
            WHERE submitter = $1
            "#,
        )
        .bind(&lease.submitter)
        .bind(&lease.owner_id)
        .bind(lease.fencing_token)
        .bind(lease.expires_at)
        .bind(lease.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(DatabaseError::from)?;
        Ok(())
    }

    async fn find_by_request_id(
        &mut self,
        submitter: &str,
        request_id: &str,
    ) -> Result<Option<ManagedTransaction>, AppError> {
        let sql = format!(
            "SELECT {} FROM managed_transactions WHERE submitter = $1 AND request_id = $2",
            TRANSACTION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(submitter)
            .bind(request_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(DatabaseError::from)?;

        row.as_ref().map(PostgresClient::row_to_transaction).transpose()
    }

    #[instrument(skip(self, transaction), fields(submitter = %transaction.submitter, nonce = transaction.nonce))]
    async fn insert_transaction(
        &mut self,
        transaction: &ManagedTransaction,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO managed_transactions (
                id, submitter, request_id, nonce, payload, tx_hash, state, sub_state,
                last_submit_at, last_receipt_check_at, next_resubmit_at, submit_attempts,
                last_error, receipt, confirmed_at, fencing_token, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(transaction.id)
        .bind(&transaction.submitter)
        .bind(&transaction.request_id)
        .bind(nonce_to_db(transaction.nonce)?)
        .bind(&transaction.payload)
        .bind(&transaction.tx_hash)
        .bind(transaction.state.as_str())
        .bind(&transaction.sub_state)
        .bind(transaction.last_submit_at)
        .bind(transaction.last_receipt_check_at)
        .bind(transaction.next_resubmit_at)
        .bind(transaction.submit_attempts)
        .bind(&transaction.last_error)
        .bind(&transaction.receipt)
        .bind(transaction.confirmed_at)
        .bind(transaction.fencing_token)
        .bind(transaction.created_at)
        .bind(transaction.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(DatabaseError::from)?;
        Ok(())
    }

    async fn get_nonce_cursor(&mut self, submitter: &str) -> Result<Option<NonceCursor>, AppError> {
        let row = sqlx::query(
            r#"
            SELECT submitter, next_nonce, fencing_token, updated_at
            FROM submitter_nonce_cursors
            WHERE submitter = $1
            "#,
        )
        .bind(submitter)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(DatabaseError::from)?;

        row.as_ref().map(PostgresClient::row_to_cursor).transpose()
    }

    #[instrument(skip(self))]
    async fn advance_nonce_cursor(
        &mut self,
        submitter: &str,
        next_nonce: u64,
        fencing_token: i64,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO submitter_nonce_cursors (submitter, next_nonce, fencing_token, updated_at)
            SELECT l.submitter, $2, l.fencing_token, NOW()
            FROM submitter_leases l
            WHERE l.submitter = $1 AND l.fencing_token = $3
            ON CONFLICT (submitter) DO UPDATE
            SET next_nonce = GREATEST(submitter_nonce_cursors.next_nonce, EXCLUDED.next_nonce),
                fencing_token = EXCLUDED.fencing_token,
                updated_at = NOW()
            "#,
        )
        .bind(submitter)
        .bind(nonce_to_db(next_nonce)?)
        .bind(fencing_token)
        .execute(&mut *self.tx)
        .await
        .map_err(DatabaseError::from)?;

        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<(), AppError> {
        let Self { tx } = *self;
        tx.commit().await.map_err(DatabaseError::from)?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), AppError> {
        let Self { tx } = *self;
        tx.rollback().await.map_err(DatabaseError::from)?;
        Ok(())
    }
}

#[async_trait]
impl TransactionStore for PostgresClient {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Connection(e.to_string())))?;
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, AppError> {
        let tx = self.pool.begin().await.map_err(DatabaseError::from)?;
        Ok(Box::new(PostgresStoreTransaction { tx }))
    }

    async fn database_now(&self) -> Result<DateTime<Utc>, AppError> {
        let now = sqlx::query_scalar::<_, DateTime<Utc>>("SELECT NOW()")
            .fetch_one(&self.pool)
            .await
            .map_err(DatabaseError::from)?;
        Ok(now)
    }

    #[instrument(skip(self))]
    async fn get_transaction(&self, id: Uuid) -> Result<Option<ManagedTransaction>, AppError> {
        let sql = format!(
            "SELECT {} FROM managed_transactions WHERE id = $1",
            TRANSACTION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from)?;

        row.as_ref().map(Self::row_to_transaction).transpose()
    }

    #[instrument(skip(self))]
    async fn get_by_request_id(
        &self,
        submitter: &str,
        request_id: &str,
    ) -> Result<Option<ManagedTransaction>, AppError> {
        let sql = format!(
            "SELECT {} FROM managed_transactions WHERE submitter = $1 AND request_id = $2",
            TRANSACTION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(submitter)
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from)?;

        row.as_ref().map(Self::row_to_transaction).transpose()
    }

    async fn get_lease(&self, submitter: &str) -> Result<Option<SubmitterLease>, AppError> {
        let row = sqlx::query(
            r#"
            SELECT submitter, owner_id, fencing_token, expires_at, updated_at
            FROM submitter_leases
            WHERE submitter = $1
            "#,
        )
        .bind(submitter)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from)?;

        row.as_ref().map(Self::row_to_lease).transpose()
    }

    async fn get_nonce_cursor(&self, submitter: &str) -> Result<Option<NonceCursor>, AppError> {
        let row = sqlx::query(
            r#"
            SELECT submitter, next_nonce, fencing_token, updated_at
            FROM submitter_nonce_cursors
            WHERE submitter = $1
            "#,
        )
        .bind(submitter)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from)?;

        row.as_ref().map(Self::row_to_cursor).transpose()
    }

    #[instrument(skip(self))]
    async fn list_due_resubmits(&self, limit: i64) -> Result<Vec<ManagedTransaction>, AppError> {
        self.list_transactions(
            &format!(
                "{} AND t.next_resubmit_at <= NOW() ORDER BY t.next_resubmit_at ASC, t.nonce ASC",
                RESENDABLE
            ),
            limit,
        )
        .await
    }

    #[instrument(skip(self))]
    async fn list_submitter_backlogs(
        &self,
        limit: i64,
    ) -> Result<Vec<SubmitterBacklog>, AppError> {
        let sql = format!(
            r#"
            SELECT submitter, pending_count, id,
                   EXTRACT(EPOCH FROM (NOW() - created_at))::FLOAT8 AS oldest_age_secs
            FROM (
                SELECT t.submitter, t.id, t.created_at,
                       COUNT(*) OVER (PARTITION BY t.submitter) AS pending_count,
                       ROW_NUMBER() OVER (PARTITION BY t.submitter ORDER BY t.nonce ASC) AS position
                FROM managed_transactions t
                WHERE {}
            ) pending
            WHERE position = 1
            ORDER BY pending_count DESC, oldest_age_secs DESC
            LIMIT $1
            "#,
            RESENDABLE
        );
        let rows = sqlx::query(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from)?;

        rows.iter()
            .map(|row| {
                let age_secs: f64 = row.try_get("oldest_age_secs").map_err(DatabaseError::from)?;
                Ok(SubmitterBacklog {
                    submitter: row.try_get("submitter").map_err(DatabaseError::from)?,
                    pending_count: row.try_get("pending_count").map_err(DatabaseError::from)?,
                    oldest_transaction_id: row.try_get("id").map_err(DatabaseError::from)?,
                    oldest_age: chrono::Duration::milliseconds((age_secs * 1000.0) as i64),
                })
            })
            .collect()
    }

    async fn list_receipt_candidates(
        &self,
        limit: i64,
    ) -> Result<Vec<ManagedTransaction>, AppError> {
        self.list_transactions(
            "t.state = 'tracking' AND t.tx_hash IS NOT NULL AND t.receipt IS NULL \
             ORDER BY t.last_receipt_check_at ASC NULLS FIRST, t.nonce ASC",
            limit,
        )
        .await
    }

    async fn list_finality_candidates(
        &self,
        limit: i64,
    ) -> Result<Vec<ManagedTransaction>, AppError> {
        self.list_transactions(
            "t.state = 'tracking' AND t.receipt IS NOT NULL AND t.confirmed_at IS NULL \
             ORDER BY t.updated_at ASC, t.nonce ASC",
            limit,
        )
        .await
    }

    #[instrument(skip(self, write), fields(transaction_id = %write.transaction_id, fencing_token = write.fencing_token))]
    async fn record_submission(
        &self,
        write: &FencedWrite,
        tx_hash: &str,
        sub_state: Option<&str>,
        resubmit_after: Duration,
    ) -> Result<u64, AppError> {
        let sql = format!(
            r#"
            UPDATE managed_transactions t
            SET tx_hash = $4,
                state = 'tracking',
                sub_state = $5,
                last_submit_at = NOW(),
                submit_attempts = t.submit_attempts + 1,
                next_resubmit_at = NOW() + make_interval(secs => $6),
                last_error = NULL,
                fencing_token = $3,
                updated_at = NOW()
            FROM submitter_leases l
            WHERE t.id = $1 AND t.submitter = $2
              AND l.submitter = t.submitter AND l.fencing_token = $3
              AND {}
            "#,
            RESENDABLE
        );
        let result = sqlx::query(&sql)
            .bind(write.transaction_id)
            .bind(&write.submitter)
            .bind(write.fencing_token)
            .bind(tx_hash)
            .bind(sub_state)
            .bind(delay_secs(resubmit_after))
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from)?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self, write), fields(transaction_id = %write.transaction_id, fencing_token = write.fencing_token))]
    async fn claim_resubmit(
        &self,
        write: &FencedWrite,
        expected_deadline: Option<DateTime<Utc>>,
        resubmit_after: Duration,
    ) -> Result<u64, AppError> {
        let sql = format!(
            r#"
            UPDATE managed_transactions t
            SET next_resubmit_at = NOW() + make_interval(secs => $5),
                fencing_token = $3,
                updated_at = NOW()
            FROM submitter_leases l
            WHERE t.id = $1 AND t.submitter = $2
              AND l.submitter = t.submitter AND l.fencing_token = $3
              AND t.next_resubmit_at IS NOT DISTINCT FROM $4
              AND {}
            "#,
            RESENDABLE
        );
        let result = sqlx::query(&sql)
            .bind(write.transaction_id)
            .bind(&write.submitter)
            .bind(write.fencing_token)
            .bind(expected_deadline)
            .bind(delay_secs(resubmit_after))
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from)?;

        Ok(result.rows_affected())
    }

    async fn record_submit_failure(
        &self,
        write: &FencedWrite,
        error: &str,
        retry_after: Duration,
    ) -> Result<u64, AppError> {
        let sql = format!(
            r#"
            UPDATE managed_transactions t
            SET submit_attempts = t.submit_attempts + 1,
                last_error = $4,
                next_resubmit_at = NOW() + make_interval(secs => $5),
                fencing_token = $3,
                updated_at = NOW()
            FROM submitter_leases l
            WHERE t.id = $1 AND t.submitter = $2
              AND l.submitter = t.submitter AND l.fencing_token = $3
              AND {}
            "#,
            RESENDABLE
        );
        let result = sqlx::query(&sql)
            .bind(write.transaction_id)
            .bind(&write.submitter)
            .bind(write.fencing_token)
            .bind(error)
            .bind(delay_secs(retry_after))
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from)?;

        Ok(result.rows_affected())
    }

    async fn reschedule(
        &self,
        write: &FencedWrite,
        resubmit_after: Duration,
        note: Option<&str>,
    ) -> Result<u64, AppError> {
        let sql = format!(
            r#"
            UPDATE managed_transactions t
            SET next_resubmit_at = NOW() + make_interval(secs => $4),
                last_error = COALESCE($5, t.last_error),
                fencing_token = $3,
                updated_at = NOW()
            FROM submitter_leases l
            WHERE t.id = $1 AND t.submitter = $2
              AND l.submitter = t.submitter AND l.fencing_token = $3
              AND {}
            "#,
            NOT_TERMINAL
        );
        let result = sqlx::query(&sql)
            .bind(write.transaction_id)
            .bind(&write.submitter)
            .bind(write.fencing_token)
            .bind(delay_secs(resubmit_after))
            .bind(note)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from)?;

        Ok(result.rows_affected())
    }

    async fn record_receipt_check(
        &self,
        write: &FencedWrite,
        tx_hash: &str,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE managed_transactions t
            SET last_receipt_check_at = NOW(),
                fencing_token = $3,
                updated_at = NOW()
            FROM submitter_leases l
            WHERE t.id = $1 AND t.submitter = $2
              AND l.submitter = t.submitter AND l.fencing_token = $3
              AND t.state = 'tracking' AND t.receipt IS NULL AND t.tx_hash = $4
            "#,
        )
        .bind(write.transaction_id)
        .bind(&write.submitter)
        .bind(write.fencing_token)
        .bind(tx_hash)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from)?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self, write, receipt), fields(transaction_id = %write.transaction_id, tx_hash = %receipt.tx_hash))]
    async fn store_receipt(
        &self,
        write: &FencedWrite,
        receipt: &TransactionReceipt,
    ) -> Result<u64, AppError> {
        let raw =
            serde_json::to_value(receipt).map_err(|e| AppError::Serialization(e.to_string()))?;
        let result = sqlx::query(
            r#"
            UPDATE managed_transactions t
            SET receipt = $4,
                tx_hash = $5,
                last_receipt_check_at = NOW(),
                fencing_token = $3,
                updated_at = NOW()
            FROM submitter_leases l
            WHERE t.id = $1 AND t.submitter = $2
              AND l.submitter = t.submitter AND l.fencing_token = $3
              AND t.state = 'tracking' AND t.receipt IS NULL
            "#,
        )
        .bind(write.transaction_id)
        .bind(&write.submitter)
        .bind(write.fencing_token)
        .bind(raw)
        .bind(&receipt.tx_hash)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from)?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self, write, update), fields(transaction_id = %write.transaction_id, state = %update.state))]
    async fn complete_transaction(
        &self,
        write: &FencedWrite,
        update: &TerminalUpdate,
    ) -> Result<Option<CompletionEvent>, AppError> {
        let mut tx = self.pool.begin().await.map_err(DatabaseError::from)?;

        let sql = format!(
            r#"
            UPDATE managed_transactions t
            SET state = $4,
                sub_state = COALESCE($5, t.sub_state),
                last_error = COALESCE($6, t.last_error),
                confirmed_at = CASE WHEN $7 THEN NOW() ELSE t.confirmed_at END,
                next_resubmit_at = NULL,
                fencing_token = $3,
                updated_at = NOW()
            FROM submitter_leases l
            WHERE t.id = $1 AND t.submitter = $2
              AND l.submitter = t.submitter AND l.fencing_token = $3
              AND {}
            "#,
            NOT_TERMINAL
        );
        let result = sqlx::query(&sql)
            .bind(write.transaction_id)
            .bind(&write.submitter)
            .bind(write.fencing_token)
            .bind(update.state.as_str())
            .bind(&update.sub_state)
            .bind(&update.error)
            .bind(update.sets_confirmed_at())
            .execute(&mut *tx)
            .await
            .map_err(DatabaseError::from)?;

        if result.rows_affected() != 1 {
            tx.rollback().await.map_err(DatabaseError::from)?;
            debug!("Terminal update touched no row; no completion event written");
            return Ok(None);
        }

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(COMPLETION_FEED_LOCK)
            .execute(&mut *tx)
            .await
            .map_err(DatabaseError::from)?;

        let row = sqlx::query(
            r#"
            INSERT INTO completion_events (transaction_id, occurred_at, status)
            VALUES ($1, NOW(), $2)
            RETURNING sequence, transaction_id, occurred_at, status
            "#,
        )
        .bind(write.transaction_id)
        .bind(update.state.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(DatabaseError::from)?;
        let event = Self::row_to_event(&row)?;

        tx.commit().await.map_err(DatabaseError::from)?;
        Ok(Some(event))
    }

    async fn list_completions(
        &self,
        after_sequence: i64,
        limit: i64,
    ) -> Result<Vec<CompletionEvent>, AppError> {
        let rows = sqlx::query(
            r#"
            SELECT sequence, transaction_id, occurred_at, status
            FROM completion_events
            WHERE sequence > $1
            ORDER BY sequence ASC
            LIMIT $2
            "#,
        )
        .bind(after_sequence)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from)?;

        rows.iter().map(Self::row_to_event).collect()
    }
}
