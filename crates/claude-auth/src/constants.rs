//! Claude OAuth constants
//!
//! Public OAuth client configuration matching the Claude CLI. These values
//! are not secrets — they identify the public client application. The actual
//! secrets (access/refresh tokens) live in the persistence store.

use std::time::Duration;

/// Anthropic's public OAuth client ID (same as Claude CLI)
pub const CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";

/// Default OAuth redirect URI (Anthropic's hosted callback page).
/// Individual flows may register their own redirect URI; it is persisted
/// per flow and echoed back during exchange.
pub const DEFAULT_REDIRECT_URI: &str = "https://console.anthropic.com/oauth/code/callback";

/// Token endpoint for code exchange and token refresh
pub const TOKEN_ENDPOINT: &str = "https://console.anthropic.com/v1/oauth/token";

/// Authorization endpoint for Pro/Max subscriptions (claude.ai, not console)
pub const AUTHORIZE_ENDPOINT: &str = "https://claude.ai/oauth/authorize";

/// OAuth scopes required for inference access
pub const SCOPES: &str = "user:profile user:inference";

/// Timeout applied to both token-endpoint actions
pub const OAUTH_HTTP_TIMEOUT: Duration = Duration::from_secs(30);
