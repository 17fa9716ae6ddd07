//! Postgres-backed dedup store. The primary key enforces per-fingerprint atomicity.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mrt_core::Fingerprint;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::{DedupStore, DuplicateError, RecordError, StoreError};

#[derive(Debug, Clone)]
pub struct PgDedupStore {
    pool: PgPool,
}

impl PgDedupStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl DedupStore for PgDedupStore {
    async fn has_seen(&self, company: &str, fingerprint: &Fingerprint) -> Result<bool, StoreError> {
        let seen: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM seen_fingerprints WHERE company = $1 AND fingerprint = $2)",
        )
        .bind(company)
        .bind(fingerprint.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(seen)
    }

    async fn record(
        &self,
        company: &str,
        fingerprint: &Fingerprint,
        seen_at: DateTime<Utc>,
    ) -> Result<(), RecordError> {
        let result = sqlx::query(
            "INSERT INTO seen_fingerprints (company, fingerprint, first_seen) VALUES ($1, $2, $3) \
             ON CONFLICT (company, fingerprint) DO NOTHING",
        )
        .bind(company)
        .bind(fingerprint.as_str())
        .bind(seen_at)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;

        if result.rows_affected() == 0 {
            return Err(DuplicateError {
                company: company.to_string(),
                fingerprint: fingerprint.clone(),
            }
            .into());
        }
        Ok(())
    }

    async fn prune(&self, older_than: DateTime<Utc>) -> Result<usize, StoreError> {
        let result = sqlx::query("DELETE FROM seen_fingerprints WHERE first_seen < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM seen_fingerprints")
            .fetch_one(&self.pool)
            .await?;
        Ok(n.max(0) as usize)
    }
}
