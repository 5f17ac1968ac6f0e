//! Row types for the three store tables

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

/// A stored account with its OAuth credentials and usage bookkeeping.
///
/// `updated_at` never moves backwards and `use_count` only grows; both are
/// maintained by the repository, not by callers.
#[derive(Debug, Clone)]
pub struct Account {
    pub name: String,
    pub access_token: String,
    pub refresh_token: String,
    pub token_expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub use_count: i64,
}

/// A pending OAuth authorization attempt, keyed by the PKCE verifier.
#[derive(Debug, Clone)]
pub struct OAuthFlow {
    pub state: String,
    pub account_name: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub code_challenge: String,
    pub redirect_uri: String,
}

impl OAuthFlow {
    /// A flow past its expiry must be ignored.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Marks an account unavailable until `resets_at`.
#[derive(Debug, Clone)]
pub struct RateLimit {
    pub account_name: String,
    pub limited_at: DateTime<Utc>,
    pub resets_at: DateTime<Utc>,
    pub triggered_by: Option<String>,
}

impl RateLimit {
    /// Active iff the reset instant is strictly in the future; a marker
    /// whose reset has passed is logically absent.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.resets_at > now
    }
}

/// Millisecond encoding used for every timestamp column.
pub(crate) fn millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::UNIX_EPOCH)
}

pub(crate) fn account_from_row(row: &SqliteRow) -> Result<Account, sqlx::Error> {
    Ok(Account {
        name: row.try_get("name")?,
        access_token: row.try_get("access_token")?,
        refresh_token: row.try_get("refresh_token")?,
        token_expires_at: datetime(row.try_get("token_expires_at")?),
        created_at: datetime(row.try_get("created_at")?),
        updated_at: datetime(row.try_get("updated_at")?),
        email: row.try_get("email")?,
        display_name: row.try_get("display_name")?,
        last_used_at: row
            .try_get::<Option<i64>, _>("last_used_at")?
            .map(datetime),
        use_count: row.try_get("use_count")?,
    })
}

pub(crate) fn flow_from_row(row: &SqliteRow) -> Result<OAuthFlow, sqlx::Error> {
    Ok(OAuthFlow {
        state: row.try_get("state")?,
        account_name: row.try_get("account_name")?,
        created_at: datetime(row.try_get("created_at")?),
        expires_at: datetime(row.try_get("expires_at")?),
        code_challenge: row.try_get("code_challenge")?,
        redirect_uri: row.try_get("redirect_uri")?,
    })
}

pub(crate) fn rate_limit_from_row(row: &SqliteRow) -> Result<RateLimit, sqlx::Error> {
    Ok(RateLimit {
        account_name: row.try_get("account_name")?,
        limited_at: datetime(row.try_get("limited_at")?),
        resets_at: datetime(row.try_get("resets_at")?),
        triggered_by: row.try_get("triggered_by")?,
    })
}
