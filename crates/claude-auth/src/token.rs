//! OAuth token model, exchange, and refresh
//!
//! The token endpoint serves both grant types; the two public functions here
//! differ in how failures map onto the error taxonomy. Exchange failures are
//! always surfaced to the login surface; refresh failures are split into
//! terminal (`RefreshRejected` — the account must be disabled) and transient
//! (retry with backoff), because the refresh scheduler reacts differently
//! to each.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::constants::{CLIENT_ID, OAUTH_HTTP_TIMEOUT, TOKEN_ENDPOINT};
use crate::error::{Error, Result};

/// A complete OAuth credential as held in memory.
///
/// Strictly data: persistence is the store's job, refresh scheduling is the
/// pool's. `expires_at` is absolute; the wire format's `expires_in` delta is
/// resolved against the response time when the token is parsed.
#[derive(Debug, Clone)]
pub struct OAuthToken {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub token_type: String,
    pub scopes: Vec<String>,
    pub subscription_type: Option<String>,
}

impl OAuthToken {
    /// Whether the access token has expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Wire shape of a token endpoint response.
///
/// `refresh_token` is optional on refresh responses — the server may rotate
/// it or keep the old one. `expires_in` is a delta in seconds.
#[derive(Debug, Deserialize)]
struct TokenWire {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: u64,
    token_type: Option<String>,
    scope: Option<String>,
    subscription_type: Option<String>,
}

/// Build the HTTP client used for token-endpoint actions (30 s timeout).
pub fn oauth_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(OAUTH_HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Exchange an authorization code for tokens (PKCE flow completion).
///
/// `verifier` is the stored flow state; `redirect_uri` must match the URI
/// the flow registered with the authorization server.
pub async fn exchange_code(
    client: &reqwest::Client,
    code: &str,
    verifier: &str,
    redirect_uri: &str,
) -> Result<OAuthToken> {
    exchange_code_at(client, TOKEN_ENDPOINT, code, verifier, redirect_uri).await
}

/// Refresh an access token using a refresh token.
///
/// If the server returns a new refresh token it replaces the old one;
/// otherwise the old one is carried forward.
pub async fn refresh_token(client: &reqwest::Client, refresh: &str) -> Result<OAuthToken> {
    refresh_token_at(client, TOKEN_ENDPOINT, refresh).await
}

/// Same as [`exchange_code`] against an explicit endpoint (tests, self-hosted
/// authorization servers).
pub async fn exchange_code_at(
    client: &reqwest::Client,
    endpoint: &str,
    code: &str,
    verifier: &str,
    redirect_uri: &str,
) -> Result<OAuthToken> {
    let response = client
        .post(endpoint)
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("code_verifier", verifier),
            ("client_id", CLIENT_ID),
            ("redirect_uri", redirect_uri),
        ])
        .send()
        .await
        .map_err(|e| Error::Transport(format!("token exchange request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = read_body(response).await;
        return Err(Error::ExchangeFailed {
            status: status.as_u16(),
            body,
        });
    }

    let wire = response
        .json::<TokenWire>()
        .await
        .map_err(|e| Error::MalformedResponse(format!("invalid token response: {e}")))?;
    let token = parse_token(wire, None, Utc::now())?;
    debug!(expires_at = %token.expires_at, "authorization code exchanged");
    Ok(token)
}

/// Same as [`refresh_token`] against an explicit endpoint.
pub async fn refresh_token_at(
    client: &reqwest::Client,
    endpoint: &str,
    refresh: &str,
) -> Result<OAuthToken> {
    let response = client
        .post(endpoint)
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh),
            ("client_id", CLIENT_ID),
        ])
        .send()
        .await
        .map_err(|e| Error::Transport(format!("token refresh request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = read_body(response).await;
        // 400/401/403 mean the refresh token itself is invalid or revoked.
        // Anything else (429, 5xx, …) is worth retrying.
        return Err(match status.as_u16() {
            400 | 401 | 403 => Error::RefreshRejected {
                status: status.as_u16(),
                body,
            },
            code => Error::RefreshTransient { status: code, body },
        });
    }

    let wire = response
        .json::<TokenWire>()
        .await
        .map_err(|e| Error::MalformedResponse(format!("invalid refresh response: {e}")))?;
    let token = parse_token(wire, Some(refresh), Utc::now())?;
    debug!(expires_at = %token.expires_at, "access token refreshed");
    Ok(token)
}

/// Turn a wire response into an `OAuthToken`, resolving the expiry delta
/// against `now` and falling back to `previous_refresh` when the server
/// kept the refresh token.
fn parse_token(
    wire: TokenWire,
    previous_refresh: Option<&str>,
    now: DateTime<Utc>,
) -> Result<OAuthToken> {
    if wire.access_token.is_empty() {
        return Err(Error::MalformedResponse(
            "access_token empty in 2xx response".into(),
        ));
    }

    let refresh_token = match wire.refresh_token {
        Some(ref t) if !t.is_empty() => t.clone(),
        _ => previous_refresh
            .map(str::to_string)
            .ok_or_else(|| Error::MalformedResponse("refresh_token missing".into()))?,
    };

    Ok(OAuthToken {
        access_token: wire.access_token,
        refresh_token,
        expires_at: now + chrono::Duration::seconds(wire.expires_in as i64),
        token_type: wire.token_type.unwrap_or_else(|| "Bearer".into()),
        scopes: wire
            .scope
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default(),
        subscription_type: wire.subscription_type,
    })
}

async fn read_body(response: reqwest::Response) -> String {
    response
        .text()
        .await
        .unwrap_or_else(|_| String::from("<no body>"))
}
