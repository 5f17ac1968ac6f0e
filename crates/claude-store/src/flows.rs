//! OAuth flow repository
//!
//! Flows are keyed by the PKCE code verifier (the OAuth `state` value) and
//! are single-use: the login surface deletes a flow as soon as it exchanges
//! the code. Expired flows are invisible to `get_valid` and reaped by the
//! periodic sweep.

use chrono::Utc;
use common::Secret;
use sqlx::sqlite::SqlitePool;
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::{OAuthFlow, flow_from_row, millis};

/// Default flow lifetime: one hour.
pub const DEFAULT_FLOW_TTL_SECONDS: i64 = 3600;

#[derive(Clone)]
pub struct OAuthFlowRepo {
    pool: SqlitePool,
}

impl OAuthFlowRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record a new pending flow with `expires_at = now + ttl_seconds`.
    pub async fn create(
        &self,
        state: &str,
        account_name: &str,
        code_challenge: &str,
        redirect_uri: &str,
        ttl_seconds: i64,
    ) -> Result<OAuthFlow> {
        let now = Utc::now();
        let expires = now + chrono::Duration::seconds(ttl_seconds);

        sqlx::query(
            "INSERT INTO oauth_flows \
             (state, account_name, created_at, expires_at, code_challenge, redirect_uri) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(state)
        .bind(account_name)
        .bind(millis(now))
        .bind(millis(expires))
        .bind(code_challenge)
        .bind(redirect_uri)
        .execute(&self.pool)
        .await?;

        debug!(account = account_name, "oauth flow created");
        let row = sqlx::query("SELECT * FROM oauth_flows WHERE state = ?")
            .bind(state)
            .fetch_one(&self.pool)
            .await?;
        flow_from_row(&row).map_err(Error::Db)
    }

    /// Fetch a flow only if it has not expired.
    ///
    /// The presented state is caller-supplied; the stored key is re-matched
    /// in constant time before the flow is handed out.
    pub async fn get_valid(&self, state: &str) -> Result<Option<OAuthFlow>> {
        let row = sqlx::query("SELECT * FROM oauth_flows WHERE state = ? AND expires_at > ?")
            .bind(state)
            .bind(millis(Utc::now()))
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else { return Ok(None) };
        let flow = flow_from_row(&row).map_err(Error::Db)?;
        let stored = Secret::new(flow.state.clone());
        Ok(stored.verify(state).then_some(flow))
    }

    /// Delete a flow (normally right after a successful exchange).
    pub async fn delete(&self, state: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM oauth_flows WHERE state = ?")
            .bind(state)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Reap expired flows. Returns the number deleted.
    pub async fn cleanup_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM oauth_flows WHERE expires_at <= ?")
            .bind(millis(Utc::now()))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Names of accounts with at least one live flow (used by the login
    /// surface to show which accounts are mid-authorization).
    pub async fn get_pending_account_names(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT account_name FROM oauth_flows WHERE expires_at > ? \
             ORDER BY account_name",
        )
        .bind(millis(Utc::now()))
        .fetch_all(&self.pool)
        .await?;

        use sqlx::Row;
        rows.iter()
            .map(|r| r.try_get("account_name").map_err(Error::Db))
            .collect()
    }
}
