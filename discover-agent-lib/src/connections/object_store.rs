//! Object storage (IBM COS) connector.

use super::{ConnectContext, ConnectionDescriptor, ConnectorWarning, DataSourceConnection, non_empty};
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use discover_manager_api::ManagerApi;
use serde_json::{Map, Value};
use tracing::{debug, error};

const ACCESS_KEY: &str = "accesser_access_key";
const SECRET_KEY: &str = "accesser_secret_key";
const MANAGER_USERNAME: &str = "manager_username";
const MANAGER_PASSWORD: &str = "manager_password";
const ACCESSER_ADDRESS: &str = "accesser_address";

/// S3 client bound to an object-storage accesser.
#[derive(Debug, Clone)]
pub struct ObjectStoreConnection {
    pub client: aws_sdk_s3::Client,
    pub endpoint: String,
    pub access_key_id: String,
}

fn info_str<'a>(info: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    info.get(key)
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
}

/// Build an S3 client for an object-storage datasource.
///
/// Explicit accesser keys win. Without them the first key pair of the
/// manager account is used; an account without keys yields an empty pair.
pub async fn connect_object_store(
    descriptor: &ConnectionDescriptor,
    ctx: &ConnectContext<'_>,
) -> Result<DataSourceConnection, ConnectorWarning> {
    let info = descriptor.additional_info()?;
    let address = info_str(&info, ACCESSER_ADDRESS).ok_or_else(|| {
        ConnectorWarning::MissingField {
            connection: descriptor.name.clone(),
            field: ACCESSER_ADDRESS,
        }
    })?;

    let (access_key, secret_key) = match (info_str(&info, ACCESS_KEY), info_str(&info, SECRET_KEY)) {
        (Some(access), Some(secret)) => {
            (access.to_string(), ctx.decrypt(&descriptor.name, secret)?)
        }
        _ => manager_keys(descriptor, &info, ctx).await?,
    };

    let endpoint = format!("http://{address}");
    debug!("Binding object store {} to {endpoint}", descriptor.name);

    let config = aws_sdk_s3::Config::builder()
        .behavior_version(BehaviorVersion::latest())
        .endpoint_url(&endpoint)
        .region(Region::new("us-east-1"))
        .credentials_provider(Credentials::new(
            access_key.clone(),
            secret_key,
            None,
            None,
            "connection-manager",
        ))
        .force_path_style(true)
        .build();

    Ok(DataSourceConnection::ObjectStore(ObjectStoreConnection {
        client: aws_sdk_s3::Client::from_conf(config),
        endpoint,
        access_key_id: access_key,
    }))
}

/// Look the key pair up through the Manager API.
async fn manager_keys(
    descriptor: &ConnectionDescriptor,
    info: &Map<String, Value>,
    ctx: &ConnectContext<'_>,
) -> Result<(String, String), ConnectorWarning> {
    let (Some(host), Some(username), Some(password)) = (
        non_empty(&descriptor.host),
        info_str(info, MANAGER_USERNAME),
        info_str(info, MANAGER_PASSWORD),
    ) else {
        debug!(
            "No accesser keys or manager credentials for {}",
            descriptor.name
        );
        return Ok((String::new(), String::new()));
    };

    let password = ctx.decrypt(&descriptor.name, password)?;
    let base_url = format!("{}://{host}/", ctx.settings.manager_scheme);

    let key = match ManagerApi::with_base_url(
        base_url.as_str(),
        username,
        password,
        ctx.settings.accept_invalid_certs,
    ) {
        Ok(api) => api.first_access_key().await,
        Err(e) => Err(e),
    };

    match key {
        Ok(Some(key)) => Ok((key.access_key_id, key.secret_access_key)),
        Ok(None) => Ok((String::new(), String::new())),
        Err(e) => {
            error!(
                "Error when getting COS credentials for {}: {e}",
                descriptor.name
            );
            Ok((String::new(), String::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::CredentialCipher;
    use crate::connections::ConnectorSettings;
    use crate::connections::testing::{FakeShell, descriptor};
    use crate::mount::testing::RecordingMounts;
    use axum::Router;
    use axum::http::HeaderMap;
    use axum::routing::get;

    fn cos(info: Value) -> ConnectionDescriptor {
        let mut d = descriptor("IBM COS", "cos1");
        d.additional_info = Value::String(info.to_string());
        d
    }

    async fn connect(
        d: &ConnectionDescriptor,
        cipher: Option<&CredentialCipher>,
        settings: &ConnectorSettings,
    ) -> Result<DataSourceConnection, ConnectorWarning> {
        let mounts = RecordingMounts::default();
        let shell = FakeShell::default();
        let ctx = ConnectContext {
            cipher,
            mounts: &mounts,
            shell: &shell,
            settings,
        };
        connect_object_store(d, &ctx).await
    }

    #[tokio::test]
    async fn test_explicit_keys_are_decrypted() {
        let cipher = CredentialCipher::from_key_str("k");
        let d = cos(serde_json::json!({
            "accesser_address": "10.1.1.1:8080",
            "accesser_access_key": "AKID",
            "accesser_secret_key": cipher.encrypt("SECRET").unwrap(),
        }));

        let conn = connect(&d, Some(&cipher), &ConnectorSettings::default())
            .await
            .unwrap();
        let DataSourceConnection::ObjectStore(store) = conn else {
            panic!("expected object store");
        };
        assert_eq!(store.endpoint, "http://10.1.1.1:8080");
        assert_eq!(store.access_key_id, "AKID");
    }

    #[tokio::test]
    async fn test_missing_cipher_skips_connection() {
        let d = cos(serde_json::json!({
            "accesser_address": "10.1.1.1:8080",
            "accesser_access_key": "AKID",
            "accesser_secret_key": "encrypted",
        }));
        let err = connect(&d, None, &ConnectorSettings::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorWarning::CipherUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_no_credentials_registers_empty_pair() {
        let d = cos(serde_json::json!({"accesser_address": "10.1.1.1"}));
        let conn = connect(&d, None, &ConnectorSettings::default())
            .await
            .unwrap();
        assert!(matches!(conn, DataSourceConnection::ObjectStore(ref s) if s.access_key_id.is_empty()));
    }

    #[tokio::test]
    async fn test_missing_address_is_a_warning() {
        let d = cos(serde_json::json!({}));
        let err = connect(&d, None, &ConnectorSettings::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConnectorWarning::MissingField { field: "accesser_address", .. }
        ));
    }

    #[tokio::test]
    async fn test_keys_from_manager_api() {
        let app = Router::new().route(
            "/manager/api/json/1.0/listMyAccessKeys.adm",
            get(|headers: HeaderMap| async move {
                // "admin:mgrpw" in basic auth
                assert_eq!(headers["authorization"], "Basic YWRtaW46bWdycHc=");
                axum::Json(serde_json::json!({
                    "responseData": {"accessKeys": [
                        {"accessKeyId": "MGR_AK", "secretAccessKey": "MGR_SK"}
                    ]}
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let cipher = CredentialCipher::from_key_str("k");
        let mut d = cos(serde_json::json!({
            "accesser_address": "10.1.1.1",
            "manager_username": "admin",
            "manager_password": cipher.encrypt("mgrpw").unwrap(),
        }));
        d.host = Some(addr.to_string());
        let settings = ConnectorSettings {
            manager_scheme: "http".to_string(),
            ..ConnectorSettings::default()
        };

        let conn = connect(&d, Some(&cipher), &settings).await.unwrap();
        assert!(matches!(conn, DataSourceConnection::ObjectStore(ref s) if s.access_key_id == "MGR_AK"));
    }

    #[tokio::test]
    async fn test_manager_credentials_without_cipher_skip_manager() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/manager/api/json/1.0/listMyAccessKeys.adm",
            get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    axum::Json(serde_json::json!({"responseData": {"accessKeys": []}}))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let mut d = cos(serde_json::json!({
            "accesser_address": "10.1.1.1",
            "manager_username": "admin",
            "manager_password": "encrypted",
        }));
        d.host = Some(addr.to_string());
        let settings = ConnectorSettings {
            manager_scheme: "http".to_string(),
            ..ConnectorSettings::default()
        };

        let err = connect(&d, None, &settings).await.unwrap_err();
        assert!(matches!(err, ConnectorWarning::CipherUnavailable { .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
