//! Credential exchange with the platform identity service.
//!
//! Standalone agents trade their credentials for a bearer token once and
//! reuse it for every API call until the bootstrap cycle clears it. Agents
//! running inside the cluster skip the token entirely and send basic auth
//! with [`ALLOW_BASIC_AUTH_HEADER`] on every call.

use crate::identity::{Credentials, DeploymentMode};
use crate::{Error, Result};
use reqwest::{Client, RequestBuilder, StatusCode};
use tracing::{debug, error, info};
use url::Url;

/// Response header carrying the issued bearer token.
pub const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";

/// Request header asking the platform to accept basic auth directly.
pub const ALLOW_BASIC_AUTH_HEADER: &str = "X-ALLOW-BASIC-AUTH-SD";

/// Number of token characters that may appear in logs.
const TOKEN_LOG_PREFIX: usize = 10;

/// Build the HTTP client shared by all platform calls.
pub fn platform_client(accept_invalid_certs: bool) -> Result<Client> {
    Ok(Client::builder()
        .danger_accept_invalid_certs(accept_invalid_certs)
        .build()?)
}

/// Opaque bearer token issued by the identity service.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part of the token that is safe to log.
    pub fn log_prefix(&self) -> &str {
        match self.0.char_indices().nth(TOKEN_LOG_PREFIX) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AuthToken({}...)", self.log_prefix())
    }
}

/// Exchanges credentials for a bearer token.
#[derive(Debug, Clone)]
pub struct TokenAuthenticator {
    client: Client,
    identity_url: Url,
    mode: DeploymentMode,
}

impl TokenAuthenticator {
    pub fn new(client: Client, identity_url: Url, mode: DeploymentMode) -> Self {
        Self {
            client,
            identity_url,
            mode,
        }
    }

    /// Authenticate with basic auth and return the issued token.
    pub async fn obtain_token(&self, credentials: &Credentials) -> Result<AuthToken> {
        info!("Application obtaining token from URL: {}", self.identity_url);

        let mut request = self
            .client
            .get(self.identity_url.clone())
            .basic_auth(&credentials.username, Some(&credentials.password));
        if self.mode.is_cluster() {
            request = request.header(ALLOW_BASIC_AUTH_HEADER, "true");
        }

        let response = request.send().await.map_err(|e| {
            error!("Application failed to obtain token ({e})");
            Error::auth(e.to_string())
        })?;

        let status = response.status();
        if status != StatusCode::OK {
            error!("Application failed to obtain token (status {status})");
            return Err(Error::auth(format!(
                "Attempt to obtain token returned ({})",
                status.as_u16()
            )));
        }

        let token = response
            .headers()
            .get(AUTH_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(AuthToken::new)
            .ok_or_else(|| {
                error!("Identity service response carried no {AUTH_TOKEN_HEADER} header");
                Error::auth(format!("Missing {AUTH_TOKEN_HEADER} header"))
            })?;

        info!("Application token retrieved: {}...", token.log_prefix());
        Ok(token)
    }
}

/// How a single API call authenticates.
#[derive(Debug, Clone)]
pub enum ApiAuth {
    /// Bearer token from the identity service.
    Bearer(AuthToken),
    /// Direct basic auth (cluster deployments).
    Basic(Credentials),
}

impl ApiAuth {
    /// Attach authentication to an outgoing request.
    pub fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            ApiAuth::Bearer(token) => request.bearer_auth(token.as_str()),
            ApiAuth::Basic(credentials) => request
                .header(ALLOW_BASIC_AUTH_HEADER, "true")
                .basic_auth(&credentials.username, Some(&credentials.password)),
        }
    }
}

/// Owns the credentials and the cached token for one agent process.
#[derive(Debug)]
pub struct AuthSession {
    authenticator: TokenAuthenticator,
    credentials: Credentials,
    mode: DeploymentMode,
    token: Option<AuthToken>,
}

impl AuthSession {
    pub fn new(authenticator: TokenAuthenticator, credentials: Credentials) -> Self {
        let mode = authenticator.mode;
        Self {
            authenticator,
            credentials,
            mode,
            token: None,
        }
    }

    /// Authentication for the next API call, acquiring a token if needed.
    pub async fn api_auth(&mut self) -> Result<ApiAuth> {
        if self.mode.is_cluster() {
            return Ok(ApiAuth::Basic(self.credentials.clone()));
        }

        if let Some(token) = &self.token {
            return Ok(ApiAuth::Bearer(token.clone()));
        }

        let token = self.authenticator.obtain_token(&self.credentials).await?;
        self.token = Some(token.clone());
        Ok(ApiAuth::Bearer(token))
    }

    /// Drop the cached token so the next call re-authenticates.
    pub fn invalidate(&mut self) {
        if self.token.take().is_some() {
            debug!("Cleared cached auth token");
        }
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn spawn(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn identity_url(addr: SocketAddr) -> Url {
        Url::parse(&format!("http://{addr}/auth/v1/token")).unwrap()
    }

    fn creds() -> Credentials {
        Credentials::new("svc", "pw").unwrap()
    }

    #[test]
    fn test_token_log_prefix() {
        let token = AuthToken::new("abcdefghijklmnopqrstuvwxyz");
        assert_eq!(token.log_prefix(), "abcdefghij");
        assert_eq!(format!("{token:?}"), "AuthToken(abcdefghij...)");

        let short = AuthToken::new("abc");
        assert_eq!(short.log_prefix(), "abc");
    }

    #[tokio::test]
    async fn test_obtain_token() {
        let app = Router::new().route(
            "/auth/v1/token",
            get(|headers: HeaderMap| async move {
                assert!(headers.get(ALLOW_BASIC_AUTH_HEADER).is_none());
                ([(AUTH_TOKEN_HEADER, "tok-1234567890-rest")], "")
            }),
        );
        let addr = spawn(app).await;

        let auth = TokenAuthenticator::new(
            Client::new(),
            identity_url(addr),
            DeploymentMode::Standalone,
        );
        let token = auth.obtain_token(&creds()).await.unwrap();
        assert_eq!(token.as_str(), "tok-1234567890-rest");
    }

    #[tokio::test]
    async fn test_obtain_token_rejects_non_ok() {
        let app = Router::new().route(
            "/auth/v1/token",
            get(|| async { (AxumStatus::CREATED, [(AUTH_TOKEN_HEADER, "tok")], "") }),
        );
        let addr = spawn(app).await;

        let auth = TokenAuthenticator::new(
            Client::new(),
            identity_url(addr),
            DeploymentMode::Standalone,
        );
        let err = auth.obtain_token(&creds()).await.unwrap_err();
        assert!(err.is_auth_error());
        assert!(err.to_string().contains("201"));
    }

    #[tokio::test]
    async fn test_obtain_token_sends_cluster_header() {
        let app = Router::new().route(
            "/auth/v1/token",
            get(|headers: HeaderMap| async move {
                if headers.get(ALLOW_BASIC_AUTH_HEADER).is_some() {
                    ([(AUTH_TOKEN_HEADER, "cluster-token")], "").into_response()
                } else {
                    AxumStatus::UNAUTHORIZED.into_response()
                }
            }),
        );
        let addr = spawn(app).await;

        let auth =
            TokenAuthenticator::new(Client::new(), identity_url(addr), DeploymentMode::Cluster);
        let token = auth.obtain_token(&creds()).await.unwrap();
        assert_eq!(token.as_str(), "cluster-token");
    }

    #[tokio::test]
    async fn test_session_caches_until_invalidated() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let app = Router::new().route(
            "/auth/v1/token",
            get(move || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    ([(AUTH_TOKEN_HEADER, format!("token-{n}"))], "")
                }
            }),
        );
        let addr = spawn(app).await;

        let auth = TokenAuthenticator::new(
            Client::new(),
            identity_url(addr),
            DeploymentMode::Standalone,
        );
        let mut session = AuthSession::new(auth, creds());

        let first = session.api_auth().await.unwrap();
        let second = session.api_auth().await.unwrap();
        assert!(matches!(first, ApiAuth::Bearer(ref t) if t.as_str() == "token-0"));
        assert!(matches!(second, ApiAuth::Bearer(ref t) if t.as_str() == "token-0"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        session.invalidate();
        assert!(!session.has_token());
        let third = session.api_auth().await.unwrap();
        assert!(matches!(third, ApiAuth::Bearer(ref t) if t.as_str() == "token-1"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cluster_session_uses_basic_auth() {
        // No identity server is running: cluster mode must never call it.
        let auth = TokenAuthenticator::new(
            Client::new(),
            Url::parse("http://127.0.0.1:9/auth/v1/token").unwrap(),
            DeploymentMode::Cluster,
        );
        let mut session = AuthSession::new(auth, creds());
        let api_auth = session.api_auth().await.unwrap();
        assert!(matches!(api_auth, ApiAuth::Basic(ref c) if c.username == "svc"));
        assert!(!session.has_token());
    }
}
