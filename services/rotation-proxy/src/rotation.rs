//! Account rotation on the request path
//!
//! For each rotation-enabled request: pick an account, attach its token,
//! forward, and react to the upstream's verdict. Rate-limit signals move the
//! account out of the pool until the advertised reset instant and the loop
//! fails over to the next account; auth rejections trigger a single-flight
//! refresh and one retry against the same account before it is disabled.
//! The upstream response is only ever surfaced unchanged — bodies stream
//! through untouched, headers lose nothing but hop-by-hop entries.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::Response;
use chrono::{DateTime, Utc};
use claude_pool::{Pool, RefreshOutcome, Refresher, SelectHint};
use tracing::{debug, error, info, warn};

use crate::error::error_response;
use crate::forward::{ForwardError, Forwarder, relay_response};
use crate::metrics;

/// Paths that trigger account rotation; everything else passes through.
pub const ROTATION_ENABLED_PATHS: &[&str] = &[
    "/api/v1/chat/completions",
    "/api/v1/messages",
    "/sdk/v1/messages",
];

/// Client hint header naming the account to try first.
pub const ACCOUNT_NAME_HEADER: &str = "x-account-name";

/// Retry-After value returned when every account is rate-limited.
const ALL_LIMITED_RETRY_AFTER: &str = "3600";

/// Fallback reset horizon when a rate-limit response carries no usable
/// reset information.
const FALLBACK_RESET_SECS: i64 = 3600;

/// Cap on buffered request bodies. Rotation may retry a request against
/// several accounts, so the body has to be held in memory.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Shared state for the request handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<Pool>,
    pub refresher: Arc<Refresher>,
    pub forwarder: Arc<Forwarder>,
    pub max_attempts: u32,
}

/// Handler for the rotation-enabled endpoints.
pub async fn rotation_handler(State(state): State<AppState>, request: Request) -> Response {
    let method = request.method().as_str().to_string();
    let started = Instant::now();

    let response = run_rotation(&state, request).await;

    metrics::record_request(
        response.status().as_u16(),
        &method,
        started.elapsed().as_secs_f64(),
    );
    response
}

async fn run_rotation(state: &AppState, request: Request) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    let (parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| path.clone());

    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(request_id = %request_id, error = %e, "failed to buffer request body");
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "could not read request body",
            );
        }
    };

    let client_preferred = parts
        .headers
        .get(ACCOUNT_NAME_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let mut tried: HashSet<String> = HashSet::new();
    let mut prefer = client_preferred;
    let mut attempt = 1u32;

    loop {
        let selected = match state
            .pool
            .select(SelectHint {
                preferred: prefer.as_deref(),
                exclude: Some(&tried),
            })
            .await
        {
            Ok(selected) => selected,
            Err(claude_pool::Error::NoEligibleAccount) => {
                info!(request_id = %request_id, path = %path, "no eligible account");
                return all_accounts_limited_response();
            }
            Err(e) => {
                error!(request_id = %request_id, error = %e, "account selection failed");
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_server_error",
                    "account selection failed",
                );
            }
        };
        prefer = None;

        let mut headers = parts.headers.clone();
        headers.remove(header::AUTHORIZATION);
        headers.remove(ACCOUNT_NAME_HEADER);
        let bearer = format!("Bearer {}", selected.access_token.expose());
        match HeaderValue::from_str(&bearer) {
            Ok(value) => {
                headers.insert(header::AUTHORIZATION, value);
            }
            Err(e) => {
                error!(request_id = %request_id, account = %selected.name, error = %e,
                       "stored access token is not a valid header value");
                state.pool.disable(&selected.name).await;
                tried.insert(selected.name.clone());
                continue;
            }
        }

        debug!(request_id = %request_id, account = %selected.name, attempt, path = %path, "dispatching");
        let upstream = match state
            .forwarder
            .send(parts.method.clone(), &path_and_query, &headers, body.clone())
            .await
        {
            Ok(response) => response,
            Err(e) => {
                let error_type = match e {
                    ForwardError::Timeout => "timeout",
                    ForwardError::Transport(_) => "transport",
                };
                warn!(request_id = %request_id, account = %selected.name, error = %e, "upstream unreachable");
                metrics::record_upstream_error(error_type);
                return error_response(
                    StatusCode::BAD_GATEWAY,
                    "upstream_error",
                    &e.to_string(),
                );
            }
        };
        let status = upstream.status();

        if status.is_success() {
            if let Err(e) = state.pool.mark_used(&selected.name).await {
                warn!(request_id = %request_id, account = %selected.name, error = %e,
                      "failed to record account use");
            }
            debug!(request_id = %request_id, account = %selected.name, status = status.as_u16(), "relaying");
            return relay_response(upstream);
        }

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            warn!(request_id = %request_id, account = %selected.name, status = status.as_u16(),
                  "upstream rejected token, refreshing");
            let outcome = state.refresher.refresh_account(&selected.name).await;

            if outcome == RefreshOutcome::Refreshed && attempt < state.max_attempts {
                attempt += 1;
                prefer = Some(selected.name.clone());
                continue;
            }

            // No usable token, or this account is out of retries: take it
            // out of rotation and pick another.
            state.pool.disable(&selected.name).await;
            tried.insert(selected.name.clone());
            metrics::record_failover("auth_rejected");
            if attempt < state.max_attempts && another_eligible(&state.pool, &tried).await {
                attempt += 1;
                continue;
            }
            return relay_response(upstream);
        }

        if is_rate_limit_status(status) {
            let resets_at = compute_resets_at(upstream.headers(), Utc::now());
            if let Err(e) = state
                .pool
                .mark_rate_limited(&selected.name, resets_at, Some(&path))
                .await
            {
                warn!(request_id = %request_id, account = %selected.name, error = %e,
                      "failed to persist rate-limit marker");
            }
            tried.insert(selected.name.clone());
            metrics::record_failover("rate_limited");

            if attempt < state.max_attempts && another_eligible(&state.pool, &tried).await {
                attempt += 1;
                continue;
            }
            // Nothing left to try: the client gets the upstream response
            // unchanged, rate-limit headers included.
            return relay_response(upstream);
        }

        // Any other upstream status (including plain 5xx) is the client's
        // problem to interpret; no marking, no retry.
        debug!(request_id = %request_id, account = %selected.name, status = status.as_u16(),
               "surfacing upstream response");
        return relay_response(upstream);
    }
}

/// Handler for every non-rotation path: forward unchanged, client
/// credentials included.
pub async fn passthrough_handler(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());

    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "could not read request body",
            );
        }
    };

    match state
        .forwarder
        .send(parts.method.clone(), &path_and_query, &parts.headers, body)
        .await
    {
        Ok(upstream) => relay_response(upstream),
        Err(e) => {
            metrics::record_upstream_error(match e {
                ForwardError::Timeout => "timeout",
                ForwardError::Transport(_) => "transport",
            });
            error_response(StatusCode::BAD_GATEWAY, "upstream_error", &e.to_string())
        }
    }
}

/// Whether some account outside `tried` could still serve a retry.
async fn another_eligible(pool: &Pool, tried: &HashSet<String>) -> bool {
    pool.select(SelectHint {
        preferred: None,
        exclude: Some(tried),
    })
    .await
    .is_ok()
}

fn is_rate_limit_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status.as_u16() == 529
        || status == StatusCode::SERVICE_UNAVAILABLE
}

/// Derive the reset instant from upstream rate-limit headers.
///
/// Precedence: absolute epoch seconds in `anthropic-ratelimit-reset` /
/// `x-ratelimit-reset`, then `retry-after` (delta seconds or HTTP-date),
/// then a one-hour fallback.
fn compute_resets_at(headers: &HeaderMap, now: DateTime<Utc>) -> DateTime<Utc> {
    for name in ["anthropic-ratelimit-reset", "x-ratelimit-reset"] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok())
            && let Ok(epoch) = value.trim().parse::<i64>()
            && let Some(instant) = DateTime::from_timestamp(epoch, 0)
        {
            return instant;
        }
    }

    if let Some(value) = headers
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
    {
        let value = value.trim();
        if let Ok(seconds) = value.parse::<i64>() {
            return now + chrono::Duration::seconds(seconds.max(0));
        }
        if let Ok(date) = DateTime::parse_from_rfc2822(value) {
            return date.with_timezone(&Utc);
        }
    }

    now + chrono::Duration::seconds(FALLBACK_RESET_SECS)
}

fn all_accounts_limited_response() -> Response {
    let mut response = error_response(
        StatusCode::SERVICE_UNAVAILABLE,
        "service_unavailable_error",
        "all accounts rate-limited",
    );
    if let Ok(value) = HeaderValue::from_str(ALL_LIMITED_RETRY_AFTER) {
        response.headers_mut().insert(header::RETRY_AFTER, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::routing::post;
    use claude_store::Store;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tokio::sync::Mutex;
    use tower::ServiceExt;

    // --- compute_resets_at ---

    fn headers_of(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                value.parse().unwrap(),
            );
        }
        headers
    }

    #[test]
    fn resets_at_prefers_anthropic_epoch_header() {
        let now = Utc::now();
        let epoch = now.timestamp() + 600;
        let headers = headers_of(&[
            ("anthropic-ratelimit-reset", &epoch.to_string()),
            ("retry-after", "60"),
        ]);
        assert_eq!(compute_resets_at(&headers, now).timestamp(), epoch);
    }

    #[test]
    fn resets_at_accepts_x_ratelimit_reset() {
        let now = Utc::now();
        let epoch = now.timestamp() + 1200;
        let headers = headers_of(&[("x-ratelimit-reset", &epoch.to_string())]);
        assert_eq!(compute_resets_at(&headers, now).timestamp(), epoch);
    }

    #[test]
    fn resets_at_uses_retry_after_seconds() {
        let now = Utc::now();
        let headers = headers_of(&[("retry-after", "120")]);
        assert_eq!(
            compute_resets_at(&headers, now),
            now + chrono::Duration::seconds(120)
        );
    }

    #[test]
    fn resets_at_parses_retry_after_http_date() {
        let now = Utc::now();
        let headers = headers_of(&[("retry-after", "Sun, 06 Nov 2094 08:49:37 GMT")]);
        let parsed = compute_resets_at(&headers, now);
        assert_eq!(parsed.to_rfc3339(), "2094-11-06T08:49:37+00:00");
    }

    #[test]
    fn resets_at_ignores_garbage_epoch_and_falls_through() {
        let now = Utc::now();
        let headers = headers_of(&[
            ("anthropic-ratelimit-reset", "soon"),
            ("retry-after", "90"),
        ]);
        assert_eq!(
            compute_resets_at(&headers, now),
            now + chrono::Duration::seconds(90)
        );
    }

    #[test]
    fn resets_at_falls_back_to_one_hour() {
        let now = Utc::now();
        assert_eq!(
            compute_resets_at(&HeaderMap::new(), now),
            now + chrono::Duration::seconds(3600)
        );
    }

    #[test]
    fn rate_limit_statuses() {
        assert!(is_rate_limit_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_rate_limit_status(StatusCode::from_u16(529).unwrap()));
        assert!(is_rate_limit_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_rate_limit_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(!is_rate_limit_status(StatusCode::BAD_GATEWAY));
    }

    // --- request-loop scenarios against a scripted upstream ---

    struct Scripted {
        status: StatusCode,
        headers: Vec<(&'static str, String)>,
        body: &'static str,
    }

    fn ok_response() -> Scripted {
        Scripted {
            status: StatusCode::OK,
            headers: vec![("request-id", "req_upstream_1".to_string())],
            body: r#"{"id":"msg_1","type":"message"}"#,
        }
    }

    #[derive(Default)]
    struct UpstreamSeen {
        auths: Mutex<Vec<String>>,
    }

    /// Upstream that pops one scripted response per request and records the
    /// Authorization header it saw. Falls back to 200 when out of script.
    async fn scripted_upstream(script: Vec<Scripted>) -> (String, Arc<UpstreamSeen>) {
        let seen = Arc::new(UpstreamSeen::default());
        let queue = Arc::new(Mutex::new(VecDeque::from(script)));

        let seen_for_handler = Arc::clone(&seen);
        let app = Router::new().route(
            "/{*path}",
            post(move |headers: HeaderMap| {
                let seen = Arc::clone(&seen_for_handler);
                let queue = Arc::clone(&queue);
                async move {
                    let auth = headers
                        .get(header::AUTHORIZATION)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    seen.auths.lock().await.push(auth);

                    let scripted = queue.lock().await.pop_front().unwrap_or(ok_response());
                    let mut response = Response::new(Body::from(scripted.body));
                    *response.status_mut() = scripted.status;
                    for (name, value) in &scripted.headers {
                        response.headers_mut().insert(
                            axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                            value.parse().unwrap(),
                        );
                    }
                    response
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), seen)
    }

    /// Token endpoint stub for on-demand refreshes.
    async fn stub_token_endpoint(status: StatusCode, body: &'static str) -> String {
        let app = Router::new().route(
            "/v1/oauth/token",
            post(move || async move {
                (
                    status,
                    [(header::CONTENT_TYPE, "application/json")],
                    body,
                )
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/v1/oauth/token")
    }

    async fn build_state(
        dir: &tempfile::TempDir,
        upstream_base: &str,
        token_endpoint: &str,
        accounts: &[&str],
    ) -> AppState {
        let store = Store::open(&dir.path().join("rotation.db")).await.unwrap();
        for name in accounts {
            store
                .accounts()
                .create(
                    name,
                    &format!("at_{name}"),
                    &format!("rt_{name}"),
                    Utc::now() + chrono::Duration::hours(8),
                    None,
                    None,
                )
                .await
                .unwrap();
        }
        let pool = Arc::new(Pool::load(store).await.unwrap());
        let refresher = Arc::new(Refresher::with_endpoint(
            Arc::clone(&pool),
            reqwest::Client::new(),
            token_endpoint,
        ));
        let forwarder = Arc::new(
            Forwarder::new(
                upstream_base,
                Duration::from_secs(10),
                Duration::from_secs(30),
            )
            .unwrap(),
        );
        AppState {
            pool,
            refresher,
            forwarder,
            max_attempts: 3,
        }
    }

    fn rotation_app(state: AppState) -> Router {
        Router::new()
            .route("/api/v1/messages", post(rotation_handler))
            .route("/api/v1/chat/completions", post(rotation_handler))
            .route("/sdk/v1/messages", post(rotation_handler))
            .with_state(state)
    }

    fn messages_request(extra_headers: &[(&str, &str)]) -> Request {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/v1/messages")
            .header(header::CONTENT_TYPE, "application/json");
        for (name, value) in extra_headers {
            builder = builder.header(*name, *value);
        }
        builder
            .body(Body::from(
                r#"{"model":"claude-sonnet-4-20250514","max_tokens":1,"messages":[{"role":"user","content":"Hi"}]}"#,
            ))
            .unwrap()
    }

    #[tokio::test]
    async fn single_account_happy_path() {
        let dir = tempfile::tempdir().unwrap();
        let (upstream, seen) = scripted_upstream(vec![ok_response()]).await;
        let token_endpoint = stub_token_endpoint(StatusCode::OK, "{}").await;
        let state = build_state(&dir, &upstream, &token_endpoint, &["a1"]).await;
        let pool = Arc::clone(&state.pool);

        let response = rotation_app(state)
            .oneshot(messages_request(&[]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        // Upstream headers are relayed
        assert_eq!(response.headers().get("request-id").unwrap(), "req_upstream_1");

        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["id"], "msg_1");

        assert_eq!(seen.auths.lock().await.as_slice(), ["Bearer at_a1"]);
        let account = pool.get("a1").await.unwrap();
        assert_eq!(account.use_count, 1);
        assert!(account.last_used_at.is_some());
    }

    #[tokio::test]
    async fn failover_on_429_marks_first_account() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let reset_epoch = now.timestamp() + 600;
        let (upstream, seen) = scripted_upstream(vec![
            Scripted {
                status: StatusCode::TOO_MANY_REQUESTS,
                headers: vec![("anthropic-ratelimit-reset", reset_epoch.to_string())],
                body: r#"{"error":{"type":"rate_limit_error"}}"#,
            },
            ok_response(),
        ])
        .await;
        let token_endpoint = stub_token_endpoint(StatusCode::OK, "{}").await;
        let state = build_state(&dir, &upstream, &token_endpoint, &["a1", "a2"]).await;
        let pool = Arc::clone(&state.pool);

        let response = rotation_app(state)
            .oneshot(messages_request(&[]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // a1 tried first (idle-longest tie broken by name), then a2
        assert_eq!(
            seen.auths.lock().await.as_slice(),
            ["Bearer at_a1", "Bearer at_a2"]
        );

        let marker = pool.store().rate_limits().get("a1").await.unwrap().unwrap();
        assert_eq!(marker.resets_at.timestamp(), reset_epoch);
        assert_eq!(marker.triggered_by.as_deref(), Some("/api/v1/messages"));

        assert_eq!(pool.get("a1").await.unwrap().use_count, 0);
        assert_eq!(pool.get("a2").await.unwrap().use_count, 1);
    }

    #[tokio::test]
    async fn all_rate_limited_returns_503_with_retry_after() {
        let dir = tempfile::tempdir().unwrap();
        let (upstream, seen) = scripted_upstream(vec![]).await;
        let token_endpoint = stub_token_endpoint(StatusCode::OK, "{}").await;
        let state = build_state(&dir, &upstream, &token_endpoint, &["a1", "a2"]).await;

        let until = Utc::now() + chrono::Duration::seconds(600);
        state.pool.mark_rate_limited("a1", until, None).await.unwrap();
        state.pool.mark_rate_limited("a2", until, None).await.unwrap();

        let response = rotation_app(state)
            .oneshot(messages_request(&[]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "3600");

        let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["type"], "service_unavailable_error");
        assert_eq!(json["error"]["message"], "all accounts rate-limited");

        // Upstream never contacted
        assert!(seen.auths.lock().await.is_empty());
    }

    #[tokio::test]
    async fn preferred_account_header_wins_first_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let (upstream, seen) = scripted_upstream(vec![ok_response()]).await;
        let token_endpoint = stub_token_endpoint(StatusCode::OK, "{}").await;
        let state = build_state(&dir, &upstream, &token_endpoint, &["a1", "a2"]).await;
        let pool = Arc::clone(&state.pool);

        let response = rotation_app(state)
            .oneshot(messages_request(&[(ACCOUNT_NAME_HEADER, "a2")]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        assert_eq!(seen.auths.lock().await.as_slice(), ["Bearer at_a2"]);
        assert_eq!(pool.get("a2").await.unwrap().use_count, 1);
        assert_eq!(pool.get("a1").await.unwrap().use_count, 0);
    }

    #[tokio::test]
    async fn unknown_preferred_name_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (upstream, seen) = scripted_upstream(vec![ok_response()]).await;
        let token_endpoint = stub_token_endpoint(StatusCode::OK, "{}").await;
        let state = build_state(&dir, &upstream, &token_endpoint, &["a1"]).await;

        let response = rotation_app(state)
            .oneshot(messages_request(&[(ACCOUNT_NAME_HEADER, "who")]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(seen.auths.lock().await.as_slice(), ["Bearer at_a1"]);
    }

    #[tokio::test]
    async fn auth_rejection_refreshes_and_retries_same_account() {
        let dir = tempfile::tempdir().unwrap();
        let (upstream, seen) = scripted_upstream(vec![
            Scripted {
                status: StatusCode::UNAUTHORIZED,
                headers: vec![],
                body: r#"{"error":{"type":"authentication_error"}}"#,
            },
            ok_response(),
        ])
        .await;
        let token_endpoint = stub_token_endpoint(
            StatusCode::OK,
            r#"{"access_token":"at_fresh","refresh_token":"rt_fresh","expires_in":28800}"#,
        )
        .await;
        let state = build_state(&dir, &upstream, &token_endpoint, &["a1"]).await;
        let pool = Arc::clone(&state.pool);

        let response = rotation_app(state)
            .oneshot(messages_request(&[]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Same account, old token then refreshed token
        assert_eq!(
            seen.auths.lock().await.as_slice(),
            ["Bearer at_a1", "Bearer at_fresh"]
        );
        assert_eq!(pool.status().await.disabled_accounts, 0);
        assert_eq!(pool.get("a1").await.unwrap().use_count, 1);
    }

    #[tokio::test]
    async fn auth_rejection_with_exhausted_attempts_disables_account() {
        let dir = tempfile::tempdir().unwrap();
        let unauthorized = || Scripted {
            status: StatusCode::UNAUTHORIZED,
            headers: vec![],
            body: r#"{"error":{"type":"authentication_error"}}"#,
        };
        let (upstream, seen) = scripted_upstream(vec![unauthorized(), unauthorized()]).await;
        // Refreshes keep succeeding; the upstream still refuses the account.
        let token_endpoint = stub_token_endpoint(
            StatusCode::OK,
            r#"{"access_token":"at_fresh","refresh_token":"rt_fresh","expires_in":28800}"#,
        )
        .await;
        let mut state = build_state(&dir, &upstream, &token_endpoint, &["a1", "a2"]).await;
        state.max_attempts = 2;
        let pool = Arc::clone(&state.pool);

        let response = rotation_app(state)
            .oneshot(messages_request(&[]))
            .await
            .unwrap();

        // Out of attempts: the last upstream 401 is surfaced and the
        // account leaves rotation even though its refresh worked.
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            seen.auths.lock().await.as_slice(),
            ["Bearer at_a1", "Bearer at_fresh"]
        );
        assert_eq!(pool.status().await.disabled_accounts, 1);
        let err = pool
            .select(claude_pool::SelectHint {
                preferred: Some("a1"),
                exclude: None,
            })
            .await;
        assert!(matches!(err, Ok(s) if s.name == "a2"));
    }

    #[tokio::test]
    async fn rejected_refresh_disables_and_fails_over() {
        let dir = tempfile::tempdir().unwrap();
        let (upstream, seen) = scripted_upstream(vec![
            Scripted {
                status: StatusCode::UNAUTHORIZED,
                headers: vec![],
                body: r#"{"error":{"type":"authentication_error"}}"#,
            },
            ok_response(),
        ])
        .await;
        // Refresh token permanently rejected
        let token_endpoint =
            stub_token_endpoint(StatusCode::BAD_REQUEST, r#"{"error":"invalid_grant"}"#).await;
        let state = build_state(&dir, &upstream, &token_endpoint, &["a1", "a2"]).await;
        let pool = Arc::clone(&state.pool);

        let response = rotation_app(state)
            .oneshot(messages_request(&[]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        assert_eq!(
            seen.auths.lock().await.as_slice(),
            ["Bearer at_a1", "Bearer at_a2"]
        );

        let status = pool.status().await;
        assert_eq!(status.disabled_accounts, 1);
        // Disabled for rotation, but the row survives for audit
        assert!(pool.store().accounts().get("a1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn plain_500_surfaces_without_marking_or_retry() {
        let dir = tempfile::tempdir().unwrap();
        let (upstream, seen) = scripted_upstream(vec![Scripted {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            headers: vec![],
            body: r#"{"error":{"type":"api_error","message":"boom"}}"#,
        }])
        .await;
        let token_endpoint = stub_token_endpoint(StatusCode::OK, "{}").await;
        let state = build_state(&dir, &upstream, &token_endpoint, &["a1", "a2"]).await;
        let pool = Arc::clone(&state.pool);

        let response = rotation_app(state)
            .oneshot(messages_request(&[]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["message"], "boom");

        // One attempt only, no markers anywhere
        assert_eq!(seen.auths.lock().await.len(), 1);
        assert!(!pool.store().rate_limits().is_limited("a1").await.unwrap());
        assert_eq!(pool.status().await.available_accounts, 2);
    }

    #[tokio::test]
    async fn overloaded_529_without_headers_uses_fallback_reset() {
        let dir = tempfile::tempdir().unwrap();
        let before = Utc::now();
        let (upstream, _) = scripted_upstream(vec![
            Scripted {
                status: StatusCode::from_u16(529).unwrap(),
                headers: vec![],
                body: r#"{"error":{"type":"overloaded_error"}}"#,
            },
            ok_response(),
        ])
        .await;
        let token_endpoint = stub_token_endpoint(StatusCode::OK, "{}").await;
        let state = build_state(&dir, &upstream, &token_endpoint, &["a1", "a2"]).await;
        let pool = Arc::clone(&state.pool);

        let response = rotation_app(state)
            .oneshot(messages_request(&[]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let marker = pool.store().rate_limits().get("a1").await.unwrap().unwrap();
        let delta = marker.resets_at - before;
        assert!(delta >= chrono::Duration::seconds(3590));
        assert!(delta <= chrono::Duration::seconds(3610));
    }

    #[tokio::test]
    async fn attempts_exhausted_surfaces_last_rate_limit_response() {
        let dir = tempfile::tempdir().unwrap();
        let limited = || Scripted {
            status: StatusCode::TOO_MANY_REQUESTS,
            headers: vec![("retry-after", "60".to_string())],
            body: r#"{"error":{"type":"rate_limit_error","message":"slow down"}}"#,
        };
        let (upstream, seen) = scripted_upstream(vec![limited(), limited()]).await;
        let token_endpoint = stub_token_endpoint(StatusCode::OK, "{}").await;
        let state = build_state(&dir, &upstream, &token_endpoint, &["a1", "a2"]).await;
        let pool = Arc::clone(&state.pool);

        let response = rotation_app(state)
            .oneshot(messages_request(&[]))
            .await
            .unwrap();

        // Both accounts burned; the second upstream 429 is surfaced as-is.
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["message"], "slow down");

        assert_eq!(seen.auths.lock().await.len(), 2);
        assert!(pool.store().rate_limits().is_limited("a1").await.unwrap());
        assert!(pool.store().rate_limits().is_limited("a2").await.unwrap());
    }

    #[tokio::test]
    async fn unreachable_upstream_returns_502_without_marking() {
        let dir = tempfile::tempdir().unwrap();
        let token_endpoint = stub_token_endpoint(StatusCode::OK, "{}").await;
        // Nothing listens on port 1
        let state = build_state(&dir, "http://127.0.0.1:1", &token_endpoint, &["a1"]).await;
        let pool = Arc::clone(&state.pool);

        let response = rotation_app(state)
            .oneshot(messages_request(&[]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["type"], "upstream_error");

        assert!(!pool.store().rate_limits().is_limited("a1").await.unwrap());
        assert_eq!(pool.status().await.available_accounts, 1);
    }

    #[tokio::test]
    async fn passthrough_preserves_client_authorization() {
        let dir = tempfile::tempdir().unwrap();
        let (upstream, seen) = scripted_upstream(vec![ok_response()]).await;
        let token_endpoint = stub_token_endpoint(StatusCode::OK, "{}").await;
        let state = build_state(&dir, &upstream, &token_endpoint, &["a1"]).await;

        let app = Router::new()
            .fallback(passthrough_handler)
            .with_state(state);

        let request = Request::builder()
            .method("POST")
            .uri("/v1/other/endpoint")
            .header(header::AUTHORIZATION, "Bearer client-token")
            .body(Body::from("{}"))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        // Client credentials forwarded unchanged, not replaced
        assert_eq!(seen.auths.lock().await.as_slice(), ["Bearer client-token"]);
    }
}
