//! Pool state machine and account selection
//!
//! The pool is the single writer of the runtime-state projection; the store
//! remains the source of truth for account rows and rate-limit markers, and
//! every mutation here commits to the store before the in-memory index is
//! touched. Selection prefers the account that has been idle longest and
//! breaks ties by name so identical pools make identical choices.
//!
//! Rate-limit recovery is lazy: an account whose marker has expired flips
//! back to Available the next time selection scans it, with a periodic sweep
//! (driven by the refresh scheduler) catching accounts nobody asks for.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use claude_store::{Account, Store};
use common::Secret;
use serde::Serialize;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::events::{EVENT_CAPACITY, PoolEvent};

/// Runtime status of a pool account.
///
/// Transitions:
/// - Available → RateLimited (upstream 429/529/503)
/// - RateLimited → Available (reset instant passed)
/// - any → Disabled (refresh token rejected, or row gone after reload)
///
/// A refresh in progress is an overlay flag, not a state: selection is
/// allowed against the pre-refresh token while it is still within expiry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AccountState {
    Available,
    RateLimited { until: DateTime<Utc> },
    Disabled,
}

struct Entry {
    account: Account,
    state: AccountState,
    refreshing: bool,
}

impl Entry {
    /// Eligibility is a pure function of (now, account, marker): not
    /// disabled, no active marker, access token not yet expired.
    fn eligible(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            AccountState::Disabled => false,
            AccountState::RateLimited { until } if until > now => false,
            _ => self.account.token_expires_at > now,
        }
    }

    fn state_label(&self, now: DateTime<Utc>) -> &'static str {
        match self.state {
            AccountState::Disabled => "disabled",
            _ if self.refreshing => "refreshing",
            AccountState::RateLimited { until } if until > now => "rate_limited",
            _ => "available",
        }
    }
}

/// Selection hint from the request path.
#[derive(Debug, Default)]
pub struct SelectHint<'a> {
    /// Client-preferred account (`X-Account-Name`); honored only if eligible.
    pub preferred: Option<&'a str>,
    /// Accounts already tried this request.
    pub exclude: Option<&'a HashSet<String>>,
}

/// A selected account with its access token captured at selection time, so
/// a concurrent refresh cannot swap the token mid-request.
#[derive(Debug)]
pub struct Selected {
    pub name: String,
    pub access_token: Secret<String>,
}

/// Read-only snapshot for the status surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    pub total_accounts: usize,
    pub available_accounts: usize,
    pub rate_limited_accounts: usize,
    pub refreshing_accounts: usize,
    pub disabled_accounts: usize,
    pub accounts: Vec<AccountStatusEntry>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountStatusEntry {
    pub name: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    pub use_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limited_until: Option<DateTime<Utc>>,
}

/// What the refresh scheduler needs to know per account.
#[derive(Debug, Clone)]
pub struct RefreshCandidate {
    pub name: String,
    pub token_expires_at: DateTime<Utc>,
    pub refreshing: bool,
    pub rate_limited: bool,
    pub disabled: bool,
}

/// Rotation pool over all known accounts.
pub struct Pool {
    entries: RwLock<HashMap<String, Entry>>,
    store: Store,
    events: broadcast::Sender<PoolEvent>,
}

impl Pool {
    /// Load the pool from the store: every account row becomes an entry,
    /// active rate-limit markers carry over as RateLimited state.
    pub async fn load(store: Store) -> Result<Self> {
        let accounts = store.accounts().list().await?;
        let markers: HashMap<String, DateTime<Utc>> = store
            .rate_limits()
            .get_all_limited()
            .await?
            .into_iter()
            .map(|m| (m.account_name.clone(), m.resets_at))
            .collect();

        let entries: HashMap<String, Entry> = accounts
            .into_iter()
            .map(|account| {
                let state = match markers.get(&account.name) {
                    Some(&until) => AccountState::RateLimited { until },
                    None => AccountState::Available,
                };
                (
                    account.name.clone(),
                    Entry {
                        account,
                        state,
                        refreshing: false,
                    },
                )
            })
            .collect();

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        info!(
            accounts = entries.len(),
            rate_limited = markers.len(),
            "pool loaded"
        );
        Ok(Self {
            entries: RwLock::new(entries),
            store,
            events,
        })
    }

    /// Subscribe to pool events.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// The store this pool persists through.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Select an eligible account.
    ///
    /// A preferred name wins if eligible and not excluded. Otherwise the
    /// eligible account with the oldest `last_used_at` wins (never-used
    /// sorts first), ties broken by name. Expired rate-limit markers are
    /// recovered lazily during the scan.
    pub async fn select(&self, hint: SelectHint<'_>) -> Result<Selected> {
        let now = Utc::now();
        let mut entries = self.entries.write().await;

        for (name, entry) in entries.iter_mut() {
            if let AccountState::RateLimited { until } = entry.state
                && until <= now
            {
                debug!(account = %name, "rate limit expired, account available again");
                entry.state = AccountState::Available;
            }
        }

        let excluded =
            |name: &str| hint.exclude.map(|set| set.contains(name)).unwrap_or(false);

        if let Some(preferred) = hint.preferred
            && !excluded(preferred)
            && let Some(entry) = entries.get(preferred)
            && entry.eligible(now)
        {
            debug!(account = preferred, "preferred account selected");
            return Ok(Selected {
                name: preferred.to_string(),
                access_token: Secret::new(entry.account.access_token.clone()),
            });
        }

        let mut best: Option<(i64, &str)> = None;
        for (name, entry) in entries.iter() {
            if excluded(name) || !entry.eligible(now) {
                continue;
            }
            let idle_key = entry
                .account
                .last_used_at
                .map(|t| t.timestamp_millis())
                .unwrap_or(0);
            let better = match best {
                None => true,
                Some((best_key, best_name)) => {
                    idle_key < best_key || (idle_key == best_key && name.as_str() < best_name)
                }
            };
            if better {
                best = Some((idle_key, name));
            }
        }

        match best {
            Some((_, name)) => {
                let name = name.to_string();
                let entry = &entries[&name];
                debug!(account = %name, "account selected");
                Ok(Selected {
                    access_token: Secret::new(entry.account.access_token.clone()),
                    name,
                })
            }
            None => Err(Error::NoEligibleAccount),
        }
    }

    /// Record a successful dispatch for an account (store first, then the
    /// in-memory row is refreshed from the committed state).
    pub async fn mark_used(&self, name: &str) -> Result<()> {
        self.store.accounts().mark_used(name).await?;
        let updated = self.store.accounts().get(name).await?;

        let mut entries = self.entries.write().await;
        if let (Some(entry), Some(account)) = (entries.get_mut(name), updated) {
            entry.account = account;
        }
        drop(entries);

        metrics::counter!("pool_requests_served_total", "account" => name.to_string())
            .increment(1);
        self.emit(PoolEvent::Used {
            name: name.to_string(),
        });
        Ok(())
    }

    /// Mark an account rate-limited until `resets_at`.
    pub async fn mark_rate_limited(
        &self,
        name: &str,
        resets_at: DateTime<Utc>,
        triggered_by: Option<&str>,
    ) -> Result<()> {
        self.store
            .rate_limits()
            .mark_limited(name, resets_at, triggered_by)
            .await?;

        let mut entries = self.entries.write().await;
        match entries.get_mut(name) {
            Some(entry) if entry.state != AccountState::Disabled => {
                entry.state = AccountState::RateLimited { until: resets_at };
            }
            Some(_) => {}
            None => return Err(Error::NotFound(name.to_string())),
        }
        drop(entries);

        warn!(account = name, resets_at = %resets_at, triggered_by = ?triggered_by,
              "account rate-limited");
        metrics::counter!("pool_rate_limited_total", "account" => name.to_string()).increment(1);
        self.emit(PoolEvent::RateLimited {
            name: name.to_string(),
            resets_at,
        });
        Ok(())
    }

    /// Clear an account's rate-limit marker if present.
    pub async fn mark_available(&self, name: &str) -> Result<bool> {
        let cleared = self.store.rate_limits().clear(name).await?;

        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(name)
            && matches!(entry.state, AccountState::RateLimited { .. })
        {
            entry.state = AccountState::Available;
        }
        drop(entries);

        if cleared {
            self.emit(PoolEvent::RateLimitCleared {
                name: name.to_string(),
            });
        }
        Ok(cleared)
    }

    /// Replace an account's token triple. The in-memory entry is updated
    /// only after the store commit, so readers never see tokens the store
    /// does not hold.
    pub async fn replace_tokens(
        &self,
        name: &str,
        access_token: &str,
        refresh_token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let updated = self
            .store
            .accounts()
            .update_tokens(name, access_token, refresh_token, expires_at)
            .await?
            .ok_or_else(|| Error::NotFound(name.to_string()))?;

        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(name) {
            entry.account = updated;
        }
        drop(entries);

        self.emit(PoolEvent::TokensReplaced {
            name: name.to_string(),
        });
        Ok(())
    }

    /// Disable an account. The store row is kept for audit.
    pub async fn disable(&self, name: &str) -> bool {
        let mut entries = self.entries.write().await;
        let found = match entries.get_mut(name) {
            Some(entry) => {
                entry.state = AccountState::Disabled;
                true
            }
            None => false,
        };
        drop(entries);

        if found {
            warn!(account = name, "account disabled");
            metrics::counter!("pool_disabled_total", "account" => name.to_string()).increment(1);
            self.emit(PoolEvent::Disabled {
                name: name.to_string(),
            });
        }
        found
    }

    /// Add an account to the pool (the row must already be stored).
    pub async fn add(&self, account: Account) {
        let name = account.name.clone();
        self.entries.write().await.insert(
            name.clone(),
            Entry {
                account,
                state: AccountState::Available,
                refreshing: false,
            },
        );
        info!(account = %name, "account added to pool");
        self.emit(PoolEvent::MembershipChanged);
    }

    /// Remove an account from the pool and delete its store row.
    pub async fn remove(&self, name: &str) -> Result<bool> {
        let deleted = self.store.accounts().delete(name).await?;
        self.entries.write().await.remove(name);
        info!(account = name, "account removed from pool");
        self.emit(PoolEvent::MembershipChanged);
        Ok(deleted)
    }

    /// Re-read the store and reconcile the in-memory index.
    ///
    /// New rows appear Available (or RateLimited if a marker is active);
    /// rows whose `updated_at` is unchanged keep their in-memory entry
    /// untouched; rows missing from the store are disabled on first sight
    /// and dropped on the following reload, so requests that already
    /// captured a token finish undisturbed.
    pub async fn reload(&self) -> Result<()> {
        let accounts = self.store.accounts().list().await?;
        let markers: HashMap<String, DateTime<Utc>> = self
            .store
            .rate_limits()
            .get_all_limited()
            .await?
            .into_iter()
            .map(|m| (m.account_name.clone(), m.resets_at))
            .collect();

        let mut entries = self.entries.write().await;
        let mut seen: HashSet<String> = HashSet::with_capacity(accounts.len());

        for account in accounts {
            seen.insert(account.name.clone());
            let marker = markers.get(&account.name).copied();
            match entries.get_mut(&account.name) {
                Some(entry) => {
                    if entry.account.updated_at != account.updated_at {
                        entry.account = account;
                    }
                    if entry.state != AccountState::Disabled {
                        entry.state = match marker {
                            Some(until) => AccountState::RateLimited { until },
                            None => match entry.state {
                                AccountState::RateLimited { .. } => AccountState::Available,
                                other => other,
                            },
                        };
                    }
                }
                None => {
                    let state = match marker {
                        Some(until) => AccountState::RateLimited { until },
                        None => AccountState::Available,
                    };
                    entries.insert(
                        account.name.clone(),
                        Entry {
                            account,
                            state,
                            refreshing: false,
                        },
                    );
                }
            }
        }

        entries.retain(|name, entry| {
            if seen.contains(name) {
                return true;
            }
            if entry.state == AccountState::Disabled {
                debug!(account = %name, "dropping account missing from store");
                return false;
            }
            info!(account = %name, "account missing from store, disabling");
            entry.state = AccountState::Disabled;
            true
        });
        drop(entries);

        self.emit(PoolEvent::MembershipChanged);
        Ok(())
    }

    /// Sweep expired rate-limit markers (memory and store) and expired OAuth
    /// flows. Returns (markers deleted, flows deleted).
    pub async fn sweep_expired(&self) -> Result<(u64, u64)> {
        let now = Utc::now();
        let mut recovered = Vec::new();
        {
            let mut entries = self.entries.write().await;
            for (name, entry) in entries.iter_mut() {
                if let AccountState::RateLimited { until } = entry.state
                    && until <= now
                {
                    entry.state = AccountState::Available;
                    recovered.push(name.clone());
                }
            }
        }
        for name in recovered {
            self.emit(PoolEvent::RateLimitCleared { name });
        }

        let markers = self.store.rate_limits().cleanup_expired().await?;
        let flows = self.store.oauth_flows().cleanup_expired().await?;
        if markers > 0 || flows > 0 {
            debug!(markers, flows, "swept expired state");
        }
        Ok((markers, flows))
    }

    /// Snapshot for the status endpoint.
    pub async fn status(&self) -> PoolStatus {
        let now = Utc::now();
        let entries = self.entries.read().await;

        let mut accounts: Vec<AccountStatusEntry> = entries
            .values()
            .map(|entry| {
                let state = entry.state_label(now);
                let rate_limited_until = match entry.state {
                    AccountState::RateLimited { until } if until > now => Some(until),
                    _ => None,
                };
                AccountStatusEntry {
                    name: entry.account.name.clone(),
                    state: state.to_string(),
                    last_used_at: entry.account.last_used_at,
                    use_count: entry.account.use_count,
                    rate_limited_until,
                }
            })
            .collect();
        accounts.sort_by(|a, b| a.name.cmp(&b.name));

        let count = |label: &str| accounts.iter().filter(|a| a.state == label).count();
        PoolStatus {
            total_accounts: accounts.len(),
            available_accounts: count("available"),
            rate_limited_accounts: count("rate_limited"),
            refreshing_accounts: count("refreshing"),
            disabled_accounts: count("disabled"),
            accounts,
        }
    }

    /// Begin a refresh for an account. Returns false if the account is
    /// unknown or a refresh is already in flight.
    pub async fn begin_refresh(&self, name: &str) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get_mut(name) {
            Some(entry) if !entry.refreshing => {
                entry.refreshing = true;
                true
            }
            _ => false,
        }
    }

    /// Clear the refreshing flag.
    pub async fn finish_refresh(&self, name: &str) {
        if let Some(entry) = self.entries.write().await.get_mut(name) {
            entry.refreshing = false;
        }
    }

    /// Clone of an account's current row, if present.
    pub async fn get(&self, name: &str) -> Option<Account> {
        self.entries
            .read()
            .await
            .get(name)
            .map(|e| e.account.clone())
    }

    /// Per-account view for the refresh scheduler.
    pub async fn refresh_candidates(&self) -> Vec<RefreshCandidate> {
        let now = Utc::now();
        self.entries
            .read()
            .await
            .values()
            .map(|entry| RefreshCandidate {
                name: entry.account.name.clone(),
                token_expires_at: entry.account.token_expires_at,
                refreshing: entry.refreshing,
                rate_limited: matches!(entry.state, AccountState::RateLimited { until } if until > now),
                disabled: entry.state == AccountState::Disabled,
            })
            .collect()
    }

    /// Number of accounts in the pool (any state).
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn emit(&self, event: PoolEvent) {
        // No receivers is fine; events are advisory.
        let _ = self.events.send(event);
    }
}

/// Bridge an external file-watcher signal to `Pool::reload`.
///
/// The watcher itself lives outside the core; whatever it is, it sends a
/// unit on the channel when the store may have changed out from under us.
/// The task ends when the sender side is dropped.
pub fn spawn_reload_listener(
    pool: std::sync::Arc<Pool>,
    mut signals: tokio::sync::mpsc::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while signals.recv().await.is_some() {
            if let Err(e) = pool.reload().await {
                warn!(error = %e, "pool reload failed");
            }
        }
        debug!("reload listener stopped");
    })
}
