//! SQLite engine: pool creation and schema
//!
//! WAL mode with NORMAL synchronous matches SQLite's single-writer model to
//! the store contract: writes are durable before the call returns, readers
//! never see uncommitted rows. Foreign keys are enabled per connection so a
//! rate-limit marker cannot outlive (or predate) its account.

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use tracing::{debug, info};

use crate::accounts::AccountRepo;
use crate::error::Result;
use crate::flows::OAuthFlowRepo;
use crate::rate_limits::RateLimitRepo;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    name             TEXT PRIMARY KEY,
    access_token     TEXT NOT NULL,
    refresh_token    TEXT NOT NULL,
    token_expires_at INTEGER NOT NULL,
    created_at       INTEGER NOT NULL,
    updated_at       INTEGER NOT NULL,
    email            TEXT,
    display_name     TEXT,
    last_used_at     INTEGER,
    use_count        INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS oauth_flows (
    state          TEXT PRIMARY KEY,
    account_name   TEXT NOT NULL,
    created_at     INTEGER NOT NULL,
    expires_at     INTEGER NOT NULL,
    code_challenge TEXT NOT NULL,
    redirect_uri   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_oauth_flows_account ON oauth_flows(account_name);

CREATE TABLE IF NOT EXISTS rate_limits (
    account_name TEXT PRIMARY KEY REFERENCES accounts(name) ON DELETE CASCADE,
    limited_at   INTEGER NOT NULL,
    resets_at    INTEGER NOT NULL,
    triggered_by TEXT
);
"#;

/// Handle to the SQLite store. Cheap to clone; repositories share the pool.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) the store at `path` and ensure the schema exists.
    ///
    /// The parent directory is created if missing.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        info!(path = %path.display(), "store opened");

        Ok(Self { pool })
    }

    /// Account repository bound to this store.
    pub fn accounts(&self) -> AccountRepo {
        AccountRepo::new(self.pool.clone())
    }

    /// OAuth flow repository bound to this store.
    pub fn oauth_flows(&self) -> OAuthFlowRepo {
        OAuthFlowRepo::new(self.pool.clone())
    }

    /// Rate-limit repository bound to this store.
    pub fn rate_limits(&self) -> RateLimitRepo {
        RateLimitRepo::new(self.pool.clone())
    }

    /// Close the underlying pool, flushing outstanding writes.
    pub async fn close(&self) {
        self.pool.close().await;
        debug!("store closed");
    }
}
