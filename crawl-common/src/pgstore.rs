use std::time;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::dedup::{Claim, DedupStore, StoreError};
use crate::keys::{EntityKind, MatchKey};

/// A `DedupStore` on top of two PostgreSQL tables: `seen_keys`, with one row per (kind, key),
/// and `match_archive`, holding raw match payloads.
pub struct PgDedupStore {
    pool: PgPool,
    claim_timeout: time::Duration,
}

impl PgDedupStore {
    pub async fn new(
        url: &str,
        max_connections: u32,
        claim_timeout: time::Duration,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        Ok(Self::from_pool(pool, claim_timeout))
    }

    pub fn from_pool(pool: PgPool, claim_timeout: time::Duration) -> Self {
        Self {
            pool,
            claim_timeout,
        }
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../migrations")
            .run(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "MIGRATE".to_owned(),
                error: error.into(),
            })
    }
}

const COMPLETE_QUERY: &str = r#"
INSERT INTO seen_keys (kind, key, status, claimed_at, completed_at)
VALUES ($1, $2, 'completed', NOW(), NOW())
ON CONFLICT (kind, key) DO UPDATE
SET status = 'completed', completed_at = NOW()
"#;

#[async_trait]
impl DedupStore for PgDedupStore {
    async fn exists(&self, kind: EntityKind, key: &str) -> Result<bool, StoreError> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM seen_keys WHERE kind = $1 AND key = $2)",
        )
        .bind(kind.as_str())
        .bind(key)
        .fetch_one(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "SELECT".to_owned(),
            error,
        })
    }

    async fn mark_seen(&self, kind: EntityKind, key: &str) -> Result<Claim, StoreError> {
        // A conflicting row is only taken over when it is a claim nobody completed in time.
        let query = r#"
INSERT INTO seen_keys (kind, key, status, claimed_at)
VALUES ($1, $2, 'claimed', NOW())
ON CONFLICT (kind, key) DO UPDATE
SET claimed_at = NOW()
WHERE seen_keys.status = 'claimed'
    AND seen_keys.claimed_at < NOW() - make_interval(secs => $3)
RETURNING key
        "#;

        let claimed = sqlx::query(query)
            .bind(kind.as_str())
            .bind(key)
            .bind(self.claim_timeout.as_secs_f64())
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        if claimed.is_some() {
            return Ok(Claim::Claimed);
        }

        let holder: Option<(String, f64)> = sqlx::query_as(
            r#"
SELECT
    status,
    EXTRACT(EPOCH FROM (claimed_at + make_interval(secs => $3) - NOW()))::float8
FROM seen_keys
WHERE kind = $1 AND key = $2
            "#,
        )
        .bind(kind.as_str())
        .bind(key)
        .bind(self.claim_timeout.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "SELECT".to_owned(),
            error,
        })?;

        // A missing row was released in the meantime, and is free to claim on the next try.
        Ok(match holder {
            Some((status, _)) if status == "completed" => Claim::Completed,
            Some((_, remaining)) => Claim::InFlight {
                expires_in: time::Duration::from_secs_f64(remaining.max(0.0)),
            },
            None => Claim::InFlight {
                expires_in: time::Duration::ZERO,
            },
        })
    }

    async fn archive_match(&self, key: &MatchKey, payload: &Value) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        sqlx::query(
            "INSERT INTO match_archive (match_key, payload) VALUES ($1, $2) ON CONFLICT (match_key) DO NOTHING",
        )
        .bind(key.as_str())
        .bind(sqlx::types::Json(payload))
        .execute(&mut *tx)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "INSERT".to_owned(),
            error,
        })?;

        sqlx::query(COMPLETE_QUERY)
            .bind(EntityKind::Match.as_str())
            .bind(key.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        tx.commit()
            .await
            .map_err(|error| StoreError::QueryError {
                command: "COMMIT".to_owned(),
                error,
            })
    }

    async fn complete(&self, kind: EntityKind, key: &str) -> Result<(), StoreError> {
        sqlx::query(COMPLETE_QUERY)
            .bind(kind.as_str())
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(())
    }

    async fn release(&self, kind: EntityKind, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM seen_keys WHERE kind = $1 AND key = $2 AND status = 'claimed'")
            .bind(kind.as_str())
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "DELETE".to_owned(),
                error,
            })?;

        Ok(())
    }
}
