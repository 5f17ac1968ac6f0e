//! Claude OAuth credential model and token-endpoint primitives
//!
//! Provides the typed OAuth token model, PKCE generation, and the two token
//! endpoint interactions the rotation core needs: authorization-code exchange
//! and refresh. This crate is a standalone library with no dependency on the
//! proxy binary or the persistence layer — flows and accounts are persisted
//! elsewhere; this crate is strictly data plus HTTP actions.
//!
//! Credential flow:
//! 1. Login surface calls `PkcePair::generate()` and persists the flow
//! 2. User authorizes via `pkce::authorization_url()`
//! 3. Core calls `token::exchange_code()` with the authorization code
//! 4. The resulting `OAuthToken` is stored by the persistence layer
//! 5. The refresh scheduler calls `token::refresh_token()` before expiry

pub mod constants;
pub mod error;
pub mod pkce;
pub mod token;

pub use constants::*;
pub use error::{Error, Result};
pub use pkce::{PkcePair, authorization_url};
pub use token::{
    OAuthToken, exchange_code, exchange_code_at, oauth_http_client, refresh_token,
    refresh_token_at,
};
