//! Rotation pool for Claude OAuth accounts
//!
//! Holds the in-memory projection of every stored account, selects one per
//! request, and drives the runtime state machine off upstream signals. A
//! background scheduler refreshes access tokens ahead of expiry so rotation
//! decisions never block on a token refresh.
//!
//! Account lifecycle:
//! 1. `Pool::load` reads accounts and active rate-limit markers from the store
//! 2. `select` returns the idle-longest eligible account (or a preferred one)
//! 3. Upstream 429/529/503 → `mark_rate_limited` until the reset instant
//! 4. Reset instant passes → lazy recovery on selection plus a periodic sweep
//! 5. The scheduler refreshes tokens `lead` before expiry, single-flight per
//!    account, and disables accounts whose refresh token is rejected
//! 6. `reload` reconciles the index against the store on file-change signals

pub mod error;
pub mod events;
pub mod pool;
pub mod refresh;
pub mod singleflight;

pub use error::{Error, Result};
pub use events::PoolEvent;
pub use pool::{AccountState, Pool, PoolStatus, SelectHint, Selected, spawn_reload_listener};
pub use refresh::{RefreshConfig, RefreshOutcome, RefreshScheduler, Refresher};
pub use singleflight::SingleFlight;
