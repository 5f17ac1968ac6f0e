//! Rate-limit marker repository
//!
//! One marker per account, upsert semantics: a new limit observation
//! replaces the previous marker wholesale. "Limited" is always evaluated
//! with a strict `resets_at > now`, so a marker expiring exactly now no
//! longer blocks the account.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::{RateLimit, millis, rate_limit_from_row};

#[derive(Clone)]
pub struct RateLimitRepo {
    pool: SqlitePool,
}

impl RateLimitRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Upsert the marker for an account.
    ///
    /// Fails if the account does not exist (foreign key).
    pub async fn mark_limited(
        &self,
        account_name: &str,
        resets_at: DateTime<Utc>,
        triggered_by: Option<&str>,
    ) -> Result<RateLimit> {
        sqlx::query(
            "INSERT INTO rate_limits (account_name, limited_at, resets_at, triggered_by) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(account_name) DO UPDATE SET \
             limited_at = excluded.limited_at, \
             resets_at = excluded.resets_at, \
             triggered_by = excluded.triggered_by",
        )
        .bind(account_name)
        .bind(millis(Utc::now()))
        .bind(millis(resets_at))
        .bind(triggered_by)
        .execute(&self.pool)
        .await?;

        debug!(account = account_name, resets_at = %resets_at, "rate limit recorded");
        let row = sqlx::query("SELECT * FROM rate_limits WHERE account_name = ?")
            .bind(account_name)
            .fetch_one(&self.pool)
            .await?;
        rate_limit_from_row(&row).map_err(Error::Db)
    }

    /// Whether the account has an active marker (strict future reset).
    pub async fn is_limited(&self, account_name: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM rate_limits WHERE account_name = ? AND resets_at > ?",
        )
        .bind(account_name)
        .bind(millis(Utc::now()))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Fetch the marker for an account, active or not.
    pub async fn get(&self, account_name: &str) -> Result<Option<RateLimit>> {
        let row = sqlx::query("SELECT * FROM rate_limits WHERE account_name = ?")
            .bind(account_name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| rate_limit_from_row(&r).map_err(Error::Db))
            .transpose()
    }

    /// Remove the marker. Returns whether one existed.
    pub async fn clear(&self, account_name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM rate_limits WHERE account_name = ?")
            .bind(account_name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// All markers that are still active.
    pub async fn get_all_limited(&self) -> Result<Vec<RateLimit>> {
        let rows = sqlx::query(
            "SELECT * FROM rate_limits WHERE resets_at > ? ORDER BY account_name",
        )
        .bind(millis(Utc::now()))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| rate_limit_from_row(r).map_err(Error::Db))
            .collect()
    }

    /// Delete markers whose reset instant has passed. Returns count deleted.
    pub async fn cleanup_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM rate_limits WHERE resets_at <= ?")
            .bind(millis(Utc::now()))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
