use reqwest::{Client, IntoUrl, Method, RequestBuilder, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

/// Path of the access key listing call, relative to the manager base URL.
const LIST_ACCESS_KEYS_PATH: &str = "manager/api/json/1.0/listMyAccessKeys.adm";

#[derive(Debug, Deserialize)]
struct ListAccessKeysResponse {
    #[serde(rename = "responseData")]
    response_data: ListAccessKeysData,
}

#[derive(Debug, Deserialize)]
struct ListAccessKeysData {
    #[serde(rename = "accessKeys", default)]
    access_keys: Vec<AccessKey>,
}

/// One access/secret key pair owned by the authenticated manager account.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessKey {
    #[serde(rename = "accessKeyId")]
    pub access_key_id: String,
    #[serde(rename = "secretAccessKey")]
    pub secret_access_key: String,
}

impl std::fmt::Debug for AccessKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessKey")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error within reqwest library
    #[error("Manager API request failed: {0}")]
    ReqwestError(#[from] reqwest::Error),

    /// Error returned by server
    #[error("HTTP error from Manager API: {0}")]
    HttpError(StatusCode),

    /// Base URL could not be built from the manager address
    #[error("Invalid manager address: {0}")]
    InvalidAddress(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Client for the object-storage Manager API.
///
/// Every call authenticates with HTTP basic auth using the manager account.
pub struct ManagerApi {
    client: Client,
    username: String,
    password: String,
    base_url: Url,
}

impl ManagerApi {
    /// Create a client against an explicit base URL (scheme, host and port).
    pub fn with_base_url<T: IntoUrl, U: ToString, P: ToString>(
        base_url: T,
        username: U,
        password: P,
        allow_invalid_tls: bool,
    ) -> Result<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(allow_invalid_tls)
            .build()?;
        let base_url = base_url.into_url()?;
        if base_url.cannot_be_a_base() {
            return Err(Error::InvalidAddress(base_url.to_string()));
        }
        Ok(Self {
            client,
            username: username.to_string(),
            password: password.to_string(),
            base_url,
        })
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.client
            .request(method, url)
            .basic_auth(&self.username, Some(&self.password))
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| Error::InvalidAddress(format!("{}: {e}", self.base_url)))
    }

    /// List the access keys of the manager account.
    pub async fn list_my_access_keys(&self) -> Result<Vec<AccessKey>> {
        let url = self.endpoint(LIST_ACCESS_KEYS_PATH)?;
        debug!("Listing access keys from {url}");
        let resp = self.request(Method::GET, url.clone()).send().await?;
        let status = resp.status();
        if status.is_success() {
            let resp: ListAccessKeysResponse = resp.json().await?;
            Ok(resp.response_data.access_keys)
        } else {
            let reason = status.canonical_reason().unwrap_or_default();
            error!("Failed to connect to {url}. Response status: {status} {reason}");
            Err(Error::HttpError(status))
        }
    }

    /// Return the first access key pair, or `None` when the account has none.
    pub async fn first_access_key(&self) -> Result<Option<AccessKey>> {
        let keys = self.list_my_access_keys().await?;
        let first = keys.into_iter().next();
        if first.is_some() {
            info!("Accesser credentials successfully retrieved from Manager API");
        }
        Ok(first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::HeaderMap;
    use axum::routing::get;
    use std::net::SocketAddr;

    async fn spawn(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[test]
    fn test_base_url_joins_endpoint() {
        let api =
            ManagerApi::with_base_url("https://manager.local/", "admin", "secret", false).unwrap();
        assert_eq!(
            api.endpoint(LIST_ACCESS_KEYS_PATH).unwrap().as_str(),
            "https://manager.local/manager/api/json/1.0/listMyAccessKeys.adm"
        );
    }

    #[test]
    fn test_access_key_debug_redacts_secret() {
        let key = AccessKey {
            access_key_id: "AKID".to_string(),
            secret_access_key: "topsecret".to_string(),
        };
        let printed = format!("{key:?}");
        assert!(printed.contains("AKID"));
        assert!(!printed.contains("topsecret"));
    }

    #[tokio::test]
    async fn test_first_access_key() {
        let app = Router::new().route(
            "/manager/api/json/1.0/listMyAccessKeys.adm",
            get(|headers: HeaderMap| async move {
                let auth = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                assert!(auth.starts_with("Basic "));
                r#"{"responseData":{"accessKeys":[
                    {"accessKeyId":"first","secretAccessKey":"s1"},
                    {"accessKeyId":"second","secretAccessKey":"s2"}
                ]}}"#
            }),
        );
        let addr = spawn(app).await;

        let api = ManagerApi::with_base_url(format!("http://{addr}/"), "admin", "pw", false)
            .unwrap();
        let key = api.first_access_key().await.unwrap().unwrap();
        assert_eq!(key.access_key_id, "first");
        assert_eq!(key.secret_access_key, "s1");
    }

    #[tokio::test]
    async fn test_no_access_keys() {
        let app = Router::new().route(
            "/manager/api/json/1.0/listMyAccessKeys.adm",
            get(|| async { r#"{"responseData":{"accessKeys":[]}}"# }),
        );
        let addr = spawn(app).await;

        let api = ManagerApi::with_base_url(format!("http://{addr}/"), "admin", "pw", false)
            .unwrap();
        assert!(api.first_access_key().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let app = Router::new().route(
            "/manager/api/json/1.0/listMyAccessKeys.adm",
            get(|| async { (axum::http::StatusCode::UNAUTHORIZED, "denied") }),
        );
        let addr = spawn(app).await;

        let api = ManagerApi::with_base_url(format!("http://{addr}/"), "admin", "bad", false)
            .unwrap();
        let err = api.list_my_access_keys().await.unwrap_err();
        assert!(matches!(err, Error::HttpError(StatusCode::UNAUTHORIZED)));
    }
}
