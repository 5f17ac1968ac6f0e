//! Durable state for the rotation core
//!
//! A single SQLite file holds three tables: accounts, pending OAuth flows,
//! and rate-limit markers. Every repository operation runs in its own
//! transaction against a WAL-mode pool, so callers observe either the full
//! pre-state or the full post-state. The pool and the refresh scheduler go
//! through the repositories here, never through file I/O of their own.
//!
//! Timestamps are stored as INTEGER unix milliseconds and surfaced as
//! `chrono::DateTime<Utc>`, which keeps SQL comparisons exact and cheap.

pub mod accounts;
pub mod engine;
pub mod error;
pub mod flows;
pub mod migration;
pub mod models;
pub mod rate_limits;

pub use accounts::AccountRepo;
pub use engine::Store;
pub use error::{Error, Result};
pub use flows::OAuthFlowRepo;
pub use migration::migrate_from_accounts_json;
pub use models::{Account, OAuthFlow, RateLimit};
pub use rate_limits::RateLimitRepo;
