//! Upstream forwarder
//!
//! Thin streaming HTTP client: strips hop-by-hop headers, pushes the
//! buffered request body upstream, and hands back the live response so the
//! caller can inspect status and headers before a single body byte moves.
//! Relaying uses `Body::from_stream`, so SSE reaches the client
//! chunk-by-chunk. Connect and request timeouts are separate; both surface
//! as errors the request loop maps to 502 without touching pool state.

use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, Method, Response as HttpResponse, header};
use axum::response::Response;
use bytes::Bytes;
use tracing::debug;

use crate::error::Error;

/// Headers to strip before forwarding (hop-by-hop)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Check if a header is hop-by-hop
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Forwarding failures, by retry semantics: neither marks an account.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("upstream timeout")]
    Timeout,

    #[error("upstream transport error: {0}")]
    Transport(String),
}

/// Streaming client bound to one upstream base URL.
pub struct Forwarder {
    client: reqwest::Client,
    base_url: String,
}

impl Forwarder {
    pub fn new(
        base_url: &str,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("building upstream client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Forward a request and return the live upstream response.
    ///
    /// `path_and_query` must start with `/`. Hop-by-hop headers, Host, and
    /// Content-Length are dropped; everything else passes through verbatim.
    pub async fn send(
        &self,
        method: Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<reqwest::Response, ForwardError> {
        let url = format!("{}{}", self.base_url, path_and_query);

        let mut outgoing = HeaderMap::new();
        for (name, value) in headers {
            if is_hop_by_hop(name.as_str())
                || name == header::HOST
                || name == header::CONTENT_LENGTH
            {
                continue;
            }
            outgoing.append(name.clone(), value.clone());
        }

        debug!(%method, %url, "forwarding to upstream");
        self.client
            .request(method, &url)
            .headers(outgoing)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ForwardError::Timeout
                } else {
                    ForwardError::Transport(e.to_string())
                }
            })
    }
}

/// Turn an upstream response into a client response, preserving status and
/// headers (minus hop-by-hop) and streaming the body. Dropping the returned
/// response aborts the upstream transfer, which is exactly the client-
/// disconnect behavior the request loop wants.
pub fn relay_response(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let mut headers = HeaderMap::new();
    for (name, value) in upstream.headers() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    let mut response = HttpResponse::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::post;

    #[test]
    fn hop_by_hop_detection() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("TRANSFER-ENCODING"));
        assert!(!is_hop_by_hop("Content-Type"));
        assert!(!is_hop_by_hop("Authorization"));
        assert!(!is_hop_by_hop("anthropic-ratelimit-reset"));
    }

    /// Stub upstream that echoes method, path, and selected headers.
    async fn stub_upstream() -> String {
        let app = Router::new().route(
            "/api/v1/messages",
            post(|headers: HeaderMap, body: String| async move {
                let auth = headers
                    .get(header::AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                let connection_seen = headers.contains_key(header::CONNECTION);
                (
                    StatusCode::OK,
                    [
                        ("x-ratelimit-remaining", "99"),
                        ("request-id", "req_stub_1"),
                    ],
                    serde_json::json!({
                        "auth": auth,
                        "connection_seen": connection_seen,
                        "echo": body,
                    })
                    .to_string(),
                )
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn forwards_body_and_headers_strips_hop_by_hop() {
        let base = stub_upstream().await;
        let forwarder = Forwarder::new(
            &base,
            Duration::from_secs(10),
            Duration::from_secs(600),
        )
        .unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            "Bearer at_test".parse().unwrap(),
        );
        headers.insert(header::CONNECTION, "keep-alive".parse().unwrap());

        let response = forwarder
            .send(
                Method::POST,
                "/api/v1/messages",
                &headers,
                Bytes::from_static(b"{\"max_tokens\":1}"),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("request-id").unwrap(),
            "req_stub_1"
        );

        let json: serde_json::Value = response.json().await.unwrap();
        assert_eq!(json["auth"], "Bearer at_test");
        assert_eq!(json["connection_seen"], false);
        assert_eq!(json["echo"], "{\"max_tokens\":1}");
    }

    #[tokio::test]
    async fn relay_preserves_status_headers_and_body() {
        let base = stub_upstream().await;
        let forwarder = Forwarder::new(
            &base,
            Duration::from_secs(10),
            Duration::from_secs(600),
        )
        .unwrap();

        let upstream = forwarder
            .send(
                Method::POST,
                "/api/v1/messages",
                &HeaderMap::new(),
                Bytes::from_static(b"hi"),
            )
            .await
            .unwrap();

        let relayed = relay_response(upstream);
        assert_eq!(relayed.status(), StatusCode::OK);
        assert_eq!(
            relayed.headers().get("x-ratelimit-remaining").unwrap(),
            "99"
        );

        let bytes = axum::body::to_bytes(relayed.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["echo"], "hi");
    }

    #[tokio::test]
    async fn request_timeout_maps_to_timeout_error() {
        let app = Router::new().route(
            "/slow",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let forwarder = Forwarder::new(
            &format!("http://{addr}"),
            Duration::from_secs(5),
            Duration::from_millis(200),
        )
        .unwrap();

        let err = forwarder
            .send(Method::POST, "/slow", &HeaderMap::new(), Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::Timeout), "got: {err}");
    }

    #[tokio::test]
    async fn unreachable_upstream_is_transport_error() {
        let forwarder = Forwarder::new(
            "http://127.0.0.1:1",
            Duration::from_secs(2),
            Duration::from_secs(2),
        )
        .unwrap();

        let err = forwarder
            .send(Method::POST, "/x", &HeaderMap::new(), Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::Transport(_)), "got: {err}");
    }
}
