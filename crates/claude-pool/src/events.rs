//! Pool event channel
//!
//! The pool, the refresh scheduler, and the rotation request loop never call
//! each other directly; state changes fan out over this broadcast channel.
//! The scheduler recomputes its deadlines on any event; other subscribers
//! (status surfaces, tests) can watch transitions without polling.

use chrono::{DateTime, Utc};

/// Broadcast capacity. Events are advisory — a lagged receiver just
/// recomputes from pool state, so a modest buffer is enough.
pub(crate) const EVENT_CAPACITY: usize = 128;

#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// An account served a successful request.
    Used { name: String },
    /// An account was marked rate-limited until the given instant.
    RateLimited {
        name: String,
        resets_at: DateTime<Utc>,
    },
    /// An account's rate-limit marker was cleared.
    RateLimitCleared { name: String },
    /// An account's token triple was replaced.
    TokensReplaced { name: String },
    /// An account was administratively or terminally disabled.
    Disabled { name: String },
    /// Accounts were added, removed, or reloaded.
    MembershipChanged,
}
