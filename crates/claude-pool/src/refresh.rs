//! Proactive token refresh
//!
//! One long-running task per process keeps every account's access token
//! fresh: each account has a deadline of `token_expires_at - lead`, the task
//! sleeps until the earliest one and recomputes whenever the pool changes.
//! Transient token-endpoint failures back off exponentially with jitter;
//! a rejected refresh token disables the account. The same `Refresher` is
//! shared with the request path for on-demand refreshes after an upstream
//! 401/403, so a storm of failing requests still produces one refresh.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngExt;
use tokio::sync::{Semaphore, broadcast, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::pool::{Pool, RefreshCandidate};
use crate::singleflight::SingleFlight;

/// Wake at least this often even with nothing scheduled; pool events
/// normally wake the loop much sooner.
const IDLE_WAKE: Duration = Duration::from_secs(300);

/// Scheduler tuning. The defaults match the service's contract: refresh
/// five minutes ahead, back off 30 s → 10 min, at most four refreshes in
/// flight, sweep every minute, five seconds of shutdown grace.
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    pub lead: Duration,
    pub backoff_initial: Duration,
    pub backoff_cap: Duration,
    pub max_concurrent: usize,
    pub sweep_interval: Duration,
    pub shutdown_grace: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            lead: Duration::from_secs(300),
            backoff_initial: Duration::from_secs(30),
            backoff_cap: Duration::from_secs(600),
            max_concurrent: 4,
            sweep_interval: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Result of one refresh attempt, as seen by callers that coalesced on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// New tokens persisted and live in the pool.
    Refreshed,
    /// Refresh token permanently rejected; the account is now disabled.
    Rejected,
    /// Worth retrying: transport error, 5xx, or a store hiccup.
    Transient,
}

/// Executes refreshes, at most one per account at a time.
pub struct Refresher {
    pool: Arc<Pool>,
    http: reqwest::Client,
    token_endpoint: String,
    flight: SingleFlight<RefreshOutcome>,
}

impl Refresher {
    pub fn new(pool: Arc<Pool>, http: reqwest::Client) -> Self {
        Self::with_endpoint(pool, http, claude_auth::TOKEN_ENDPOINT)
    }

    /// Point refreshes at a non-default token endpoint (tests, self-hosted
    /// authorization servers).
    pub fn with_endpoint(
        pool: Arc<Pool>,
        http: reqwest::Client,
        token_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            http,
            token_endpoint: token_endpoint.into(),
            flight: SingleFlight::new(),
        }
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    /// Refresh one account's tokens. Concurrent calls for the same account
    /// coalesce onto the in-flight refresh and observe its outcome.
    pub async fn refresh_account(&self, name: &str) -> RefreshOutcome {
        self.flight.run(name, || self.do_refresh(name)).await
    }

    async fn do_refresh(&self, name: &str) -> RefreshOutcome {
        if !self.pool.begin_refresh(name).await {
            // Unknown account (or a stale flag); nothing to do here.
            return RefreshOutcome::Transient;
        }
        let outcome = self.refresh_inner(name).await;
        self.pool.finish_refresh(name).await;

        let label = match outcome {
            RefreshOutcome::Refreshed => "refreshed",
            RefreshOutcome::Rejected => "rejected",
            RefreshOutcome::Transient => "transient",
        };
        metrics::counter!("pool_refresh_total", "outcome" => label).increment(1);
        outcome
    }

    async fn refresh_inner(&self, name: &str) -> RefreshOutcome {
        let Some(account) = self.pool.get(name).await else {
            return RefreshOutcome::Transient;
        };

        match claude_auth::refresh_token_at(&self.http, &self.token_endpoint, &account.refresh_token)
            .await
        {
            Ok(token) => {
                match self
                    .pool
                    .replace_tokens(
                        name,
                        &token.access_token,
                        &token.refresh_token,
                        token.expires_at,
                    )
                    .await
                {
                    Ok(()) => {
                        info!(account = name, expires_at = %token.expires_at, "token refreshed");
                        RefreshOutcome::Refreshed
                    }
                    Err(e) => {
                        warn!(account = name, error = %e, "failed to persist refreshed token");
                        RefreshOutcome::Transient
                    }
                }
            }
            Err(e) if e.is_terminal() => {
                warn!(account = name, error = %e, "refresh token rejected, disabling account");
                self.pool.disable(name).await;
                RefreshOutcome::Rejected
            }
            Err(e) => {
                warn!(account = name, error = %e, "token refresh failed, will retry");
                RefreshOutcome::Transient
            }
        }
    }
}

#[derive(Debug)]
struct Backoff {
    attempt: u32,
    next_due: DateTime<Utc>,
}

/// Handle to the background refresh task.
pub struct RefreshScheduler {
    shutdown: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

impl RefreshScheduler {
    /// Spawn the scheduler loop.
    pub fn spawn(refresher: Arc<Refresher>, config: RefreshConfig) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_loop(refresher, config, shutdown_rx));
        info!("refresh scheduler started");
        Self { shutdown, handle }
    }

    /// Signal shutdown and wait for the loop to drain (bounded internally
    /// by the configured grace period).
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if self.handle.await.is_err() {
            warn!("refresh scheduler task panicked during shutdown");
        }
        info!("refresh scheduler stopped");
    }
}

async fn run_loop(
    refresher: Arc<Refresher>,
    config: RefreshConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let pool = Arc::clone(refresher.pool());
    let mut events = pool.subscribe();
    let mut sweep = tokio::time::interval(config.sweep_interval);
    sweep.tick().await; // the first tick fires immediately

    let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
    let mut backoffs: HashMap<String, Backoff> = HashMap::new();
    let mut inflight: JoinSet<(String, RefreshOutcome)> = JoinSet::new();
    let mut pending: HashSet<String> = HashSet::new();

    loop {
        let candidates = pool.refresh_candidates().await;
        backoffs.retain(|name, _| candidates.iter().any(|c| &c.name == name));

        let now = Utc::now();
        for candidate in &candidates {
            if !wants_refresh(candidate) || pending.contains(&candidate.name) {
                continue;
            }
            if effective_deadline(candidate, backoffs.get(&candidate.name), config.lead) > now {
                continue;
            }
            // Concurrency ceiling: leave the rest for the next wake-up.
            let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                break;
            };
            let refresher = Arc::clone(&refresher);
            let name = candidate.name.clone();
            pending.insert(name.clone());
            debug!(account = %name, "refresh due");
            inflight.spawn(async move {
                let outcome = refresher.refresh_account(&name).await;
                drop(permit);
                (name, outcome)
            });
        }

        let now = Utc::now();
        let next_due = candidates
            .iter()
            .filter(|c| wants_refresh(c) && !pending.contains(&c.name))
            .map(|c| effective_deadline(c, backoffs.get(&c.name), config.lead))
            .min();
        let sleep_for = match next_due {
            // Due but not spawned (semaphore full): re-check shortly.
            Some(due) if due <= now => Duration::from_millis(50),
            Some(due) => (due - now).to_std().unwrap_or_default().min(IDLE_WAKE),
            None => IDLE_WAKE,
        };

        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = sweep.tick() => {
                if let Err(e) = pool.sweep_expired().await {
                    warn!(error = %e, "periodic sweep failed");
                }
            }
            Some(joined) = inflight.join_next(), if !inflight.is_empty() => {
                if let Ok((name, outcome)) = joined {
                    pending.remove(&name);
                    if outcome == RefreshOutcome::Transient {
                        let attempt =
                            backoffs.get(&name).map(|b| b.attempt).unwrap_or(0) + 1;
                        let delay = backoff_delay(attempt, &config);
                        debug!(account = %name, attempt, delay_secs = delay.as_secs(),
                               "scheduling refresh retry");
                        backoffs.insert(
                            name,
                            Backoff {
                                attempt,
                                next_due: Utc::now()
                                    + chrono::Duration::from_std(delay).unwrap_or_default(),
                            },
                        );
                    } else {
                        backoffs.remove(&name);
                    }
                }
            }
            event = events.recv() => {
                match event {
                    // Any pool change invalidates the computed deadline;
                    // just fall through and recompute.
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "pool event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    let drained = tokio::time::timeout(config.shutdown_grace, async {
        while inflight.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!("shutdown grace elapsed, abandoning in-flight refreshes");
        inflight.abort_all();
    }
}

fn wants_refresh(candidate: &RefreshCandidate) -> bool {
    // Rate-limited accounts skip proactive refresh until they recover;
    // the post-recovery pool event re-schedules them.
    !candidate.disabled && !candidate.refreshing && !candidate.rate_limited
}

fn effective_deadline(
    candidate: &RefreshCandidate,
    backoff: Option<&Backoff>,
    lead: Duration,
) -> DateTime<Utc> {
    match backoff {
        Some(b) => b.next_due,
        None => {
            candidate.token_expires_at - chrono::Duration::from_std(lead).unwrap_or_default()
        }
    }
}

/// Exponential backoff with ±20% jitter: initial · 2^(attempt-1), capped.
fn backoff_delay(attempt: u32, config: &RefreshConfig) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let base = config
        .backoff_initial
        .saturating_mul(2u32.saturating_pow(exponent))
        .min(config.backoff_cap);
    base.mul_f64(rand::rng().random_range(0.8..1.2))
}
