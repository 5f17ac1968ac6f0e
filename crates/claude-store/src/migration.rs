//! Legacy accounts.json migration
//!
//! Earlier deployments kept accounts in a flat JSON file:
//! `{"accounts": {"<name>": {"accessToken": …, "refreshToken": …,
//! "expiresAt": …, "email"?, "displayName"?}}}`. On first boot against a
//! fresh store this module copies those entries over, skipping names that
//! already exist, so running the migration twice yields the same store
//! state as running it once.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::engine::Store;
use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
struct LegacyFile {
    #[serde(default)]
    accounts: std::collections::BTreeMap<String, LegacyAccount>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyAccount {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    refresh_token: String,
    #[serde(default)]
    expires_at: Value,
    email: Option<String>,
    display_name: Option<String>,
}

/// Migrate accounts from a legacy JSON file into the store.
///
/// Missing file is a no-op. Entries whose name already exists are skipped;
/// entries that fail to insert (e.g. empty tokens) are logged and skipped.
/// Returns the number of accounts migrated.
pub async fn migrate_from_accounts_json(store: &Store, json_path: &Path) -> Result<u64> {
    if !json_path.exists() {
        debug!(path = %json_path.display(), "no legacy accounts file, skipping migration");
        return Ok(0);
    }

    let contents = tokio::fs::read_to_string(json_path).await?;
    let legacy: LegacyFile = serde_json::from_str(&contents)
        .map_err(|e| Error::LegacyParse(format!("{}: {e}", json_path.display())))?;

    if legacy.accounts.is_empty() {
        info!(path = %json_path.display(), "legacy accounts file is empty, nothing to migrate");
        return Ok(0);
    }

    let repo = store.accounts();
    let mut migrated = 0u64;

    for (name, entry) in &legacy.accounts {
        if repo.get(name).await?.is_some() {
            debug!(account = %name, "already in store, skipping");
            continue;
        }

        let now = Utc::now();
        let expires_at = match parse_legacy_expiry(&entry.expires_at, now) {
            Some(dt) => dt,
            None => {
                warn!(account = %name, value = %entry.expires_at,
                      "unparseable expiry in legacy file, treating token as expired now");
                now
            }
        };

        match repo
            .create(
                name,
                &entry.access_token,
                &entry.refresh_token,
                expires_at,
                entry.email.as_deref(),
                entry.display_name.as_deref(),
            )
            .await
        {
            Ok(_) => {
                migrated += 1;
                info!(account = %name, "migrated from legacy file");
            }
            Err(e) => {
                warn!(account = %name, error = %e, "failed to migrate account, skipping");
            }
        }
    }

    info!(
        migrated,
        total = legacy.accounts.len(),
        "legacy migration complete"
    );
    Ok(migrated)
}

/// Parse the legacy `expiresAt` field.
///
/// Accepted forms: integer unix milliseconds, the same as a numeric string,
/// or an ISO-8601 timestamp (a trailing `Z` reads as `+00:00`). Anything
/// else yields None and the caller falls back to `now`.
fn parse_legacy_expiry(value: &Value, _now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(DateTime::from_timestamp_millis),
        Value::String(s) => {
            if s.chars().all(|c| c.is_ascii_digit()) && !s.is_empty() {
                s.parse::<i64>().ok().and_then(DateTime::from_timestamp_millis)
            } else {
                DateTime::parse_from_rfc3339(s)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc))
            }
        }
        _ => None,
    }
}
