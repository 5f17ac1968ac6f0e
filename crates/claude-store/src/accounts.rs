//! Account repository

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::{Account, account_from_row, millis};

/// Repository for account rows.
///
/// Every method is a single transaction. Token columns are never allowed to
/// be empty; `updated_at` is clamped so it never decreases even if the wall
/// clock steps backwards between writes.
#[derive(Clone)]
pub struct AccountRepo {
    pool: SqlitePool,
}

impl AccountRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a new account. Fails if the name is taken or a token is empty.
    pub async fn create(
        &self,
        name: &str,
        access_token: &str,
        refresh_token: &str,
        expires_at: DateTime<Utc>,
        email: Option<&str>,
        display_name: Option<&str>,
    ) -> Result<Account> {
        if access_token.is_empty() || refresh_token.is_empty() {
            return Err(Error::EmptyToken(name.to_string()));
        }

        let now = millis(Utc::now());
        sqlx::query(
            "INSERT INTO accounts \
             (name, access_token, refresh_token, token_expires_at, created_at, updated_at, \
              email, display_name, use_count) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(name)
        .bind(access_token)
        .bind(refresh_token)
        .bind(millis(expires_at))
        .bind(now)
        .bind(now)
        .bind(email)
        .bind(display_name)
        .execute(&self.pool)
        .await?;

        debug!(account = name, "account created");
        self.get(name)
            .await?
            .ok_or_else(|| Error::Db(sqlx::Error::RowNotFound))
    }

    /// Fetch an account by name.
    pub async fn get(&self, name: &str) -> Result<Option<Account>> {
        let row = sqlx::query("SELECT * FROM accounts WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| account_from_row(&r).map_err(Error::Db)).transpose()
    }

    /// List all accounts, ordered by name for determinism.
    pub async fn list(&self) -> Result<Vec<Account>> {
        let rows = sqlx::query("SELECT * FROM accounts ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| account_from_row(r).map_err(Error::Db))
            .collect()
    }

    /// Delete an account. Returns whether a row was removed.
    ///
    /// The rate-limit marker, if any, goes with it (ON DELETE CASCADE).
    pub async fn delete(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM accounts WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Replace the token triple after a refresh or re-login.
    ///
    /// Returns the updated account, or None if it does not exist.
    pub async fn update_tokens(
        &self,
        name: &str,
        access_token: &str,
        refresh_token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<Account>> {
        if access_token.is_empty() || refresh_token.is_empty() {
            return Err(Error::EmptyToken(name.to_string()));
        }

        let result = sqlx::query(
            "UPDATE accounts SET \
             access_token = ?, refresh_token = ?, token_expires_at = ?, \
             updated_at = MAX(updated_at, ?) \
             WHERE name = ?",
        )
        .bind(access_token)
        .bind(refresh_token)
        .bind(millis(expires_at))
        .bind(millis(Utc::now()))
        .bind(name)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        debug!(account = name, "tokens updated");
        self.get(name).await
    }

    /// Record a successful dispatch: bump `last_used_at` and `use_count`.
    pub async fn mark_used(&self, name: &str) -> Result<()> {
        sqlx::query(
            "UPDATE accounts SET \
             last_used_at = ?, use_count = use_count + 1, updated_at = MAX(updated_at, ?) \
             WHERE name = ?",
        )
        .bind(millis(Utc::now()))
        .bind(millis(Utc::now()))
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
