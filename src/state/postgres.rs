//! PostgreSQL reservation store

use super::{LockGrant, NonceLockStore, ReservationRecord, ReservationState, Settlement};
use crate::config::{DatabaseConfig, LockConfig};
use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Reservation store shared by every relayer process pointing at the same database
pub struct PgLockStore {
    pool: PgPool,
    /// Locks older than this are treated as abandoned by a dead process
    lock_ttl_secs: f64,
}

impl PgLockStore {
    /// Create a new store
    pub async fn new(config: &DatabaseConfig, locks: &LockConfig) -> RelayerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self {
            pool,
            lock_ttl_secs: locks.lock_ttl_secs as f64,
        })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> RelayerResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS nonce_reservations (
                namespace VARCHAR(32) NOT NULL,
                key VARCHAR(128) NOT NULL,
                nonce BIGINT NOT NULL,
                state VARCHAR(10) NOT NULL DEFAULT 'free',
                holder UUID,
                locked_at TIMESTAMPTZ,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (namespace, key)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_reservations_state
            ON nonce_reservations (namespace, state, updated_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    fn record(row: &PgRow) -> RelayerResult<ReservationRecord> {
        let state: String = row.try_get("state")?;
        Ok(ReservationRecord {
            key: row.try_get("key")?,
            nonce: row.try_get::<i64, _>("nonce")? as u64,
            state: state.parse()?,
            holder: row.try_get("holder")?,
            updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        })
    }
}

#[async_trait]
impl NonceLockStore for PgLockStore {
    async fn insert_if_absent(&self, namespace: &str, key: &str, nonce: u64) -> RelayerResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO nonce_reservations (namespace, key, nonce, state)
            VALUES ($1, $2, $3, 'free')
            ON CONFLICT (namespace, key) DO NOTHING
            "#,
        )
        .bind(namespace)
        .bind(key)
        .bind(nonce as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn existing_keys(&self, namespace: &str, keys: &[String]) -> RelayerResult<Vec<String>> {
        let rows = sqlx::query(
            "SELECT key FROM nonce_reservations WHERE namespace = $1 AND key = ANY($2)",
        )
        .bind(namespace)
        .bind(keys)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("key").map_err(RelayerError::from))
            .collect()
    }

    async fn try_lock(
        &self,
        namespace: &str,
        keys: &[String],
        holder: Uuid,
    ) -> RelayerResult<Option<LockGrant>> {
        // SKIP LOCKED lets concurrent claimers pick different rows instead of queueing on one
        let row = sqlx::query(
            r#"
            UPDATE nonce_reservations r
            SET state = 'locked', holder = $3, locked_at = NOW(), updated_at = NOW()
            FROM (
                SELECT namespace, key FROM nonce_reservations
                WHERE namespace = $1
                  AND key = ANY($2)
                  AND (state <> 'locked'
                       OR locked_at < NOW() - make_interval(secs => $4::double precision))
                ORDER BY updated_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            ) candidate
            WHERE r.namespace = candidate.namespace AND r.key = candidate.key
            RETURNING r.key, r.nonce
            "#,
        )
        .bind(namespace)
        .bind(keys)
        .bind(holder)
        .bind(self.lock_ttl_secs)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let key: String = row.try_get("key")?;
                let nonce = row.try_get::<i64, _>("nonce")? as u64;
                debug!("Claimed {}/{} at nonce {}", namespace, key, nonce);
                Ok(Some(LockGrant { key, nonce, holder }))
            }
            None => Ok(None),
        }
    }

    async fn settle(
        &self,
        namespace: &str,
        key: &str,
        holder: Uuid,
        settlement: Settlement,
    ) -> RelayerResult<bool> {
        let (increment, state) = match settlement {
            Settlement::Release => (1i64, ReservationState::Free),
            Settlement::Fail => (0i64, ReservationState::Failed),
        };

        let result = sqlx::query(
            r#"
            UPDATE nonce_reservations
            SET state = $4, nonce = nonce + $5, holder = NULL, locked_at = NULL, updated_at = NOW()
            WHERE namespace = $1 AND key = $2 AND holder = $3
            "#,
        )
        .bind(namespace)
        .bind(key)
        .bind(holder)
        .bind(state.as_str())
        .bind(increment)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn renew(&self, namespace: &str, key: &str, holder: Uuid) -> RelayerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE nonce_reservations
            SET locked_at = NOW(), updated_at = NOW()
            WHERE namespace = $1 AND key = $2 AND holder = $3 AND state = 'locked'
            "#,
        )
        .bind(namespace)
        .bind(key)
        .bind(holder)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn unlock(&self, namespace: &str, key: &str, new_nonce: Option<u64>) -> RelayerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE nonce_reservations
            SET state = 'free', nonce = COALESCE($3, nonce), holder = NULL, locked_at = NULL,
                updated_at = NOW()
            WHERE namespace = $1 AND key = $2
            "#,
        )
        .bind(namespace)
        .bind(key)
        .bind(new_nonce.map(|n| n as i64))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!("Unlock requested for unknown reservation {}/{}", namespace, key);
            return Err(RelayerError::LockStore(format!("No reservation for {}", key)));
        }
        Ok(())
    }

    async fn get(&self, namespace: &str, key: &str) -> RelayerResult<Option<ReservationRecord>> {
        let row = sqlx::query(
            r#"
            SELECT key, nonce, state, holder, updated_at
            FROM nonce_reservations
            WHERE namespace = $1 AND key = $2
            "#,
        )
        .bind(namespace)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::record).transpose()
    }

    async fn list(&self, namespace: &str) -> RelayerResult<Vec<ReservationRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT key, nonce, state, holder, updated_at
            FROM nonce_reservations
            WHERE namespace = $1
            ORDER BY key
            "#,
        )
        .bind(namespace)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::record).collect()
    }

    async fn health_check(&self) -> RelayerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
