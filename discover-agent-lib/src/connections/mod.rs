//! Datasource connections.
//!
//! The connection manager describes every datasource the platform knows about.
//! Each descriptor is dispatched by platform to one connector; a connector
//! either yields a [`DataSourceConnection`] or a [`ConnectorWarning`]. Warnings
//! are logged and never stop the remaining descriptors from connecting.

mod network_share;
mod object_store;
mod secure_shell;
mod windows_share;

pub use network_share::connect_network_share;
pub use object_store::{ObjectStoreConnection, connect_object_store};
pub use secure_shell::{
    RemoteFiles, RusshSftpClient, SecureShellClient, SshError, SshTarget, connect_secure_shell,
};
pub use windows_share::{connect_windows_share, parse_domain_user};

use crate::auth::ApiAuth;
use crate::cipher::{CipherError, CredentialCipher};
use crate::error::describe_request_error;
use crate::identity::Endpoints;
use crate::mount::MountService;
use crate::{Error, Result};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Storage platform of a datasource, as named on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Platform {
    ObjectStore,
    NetworkShare,
    SecureShell,
    WindowsShare,
    Unsupported(String),
}

impl FromStr for Platform {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "IBM COS" => Platform::ObjectStore,
            "NFS" => Platform::NetworkShare,
            "Spectrum Scale" => Platform::SecureShell,
            "SMB/CIFS" => Platform::WindowsShare,
            other => Platform::Unsupported(other.to_string()),
        })
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::ObjectStore => write!(f, "IBM COS"),
            Platform::NetworkShare => write!(f, "NFS"),
            Platform::SecureShell => write!(f, "Spectrum Scale"),
            Platform::WindowsShare => write!(f, "SMB/CIFS"),
            Platform::Unsupported(name) => write!(f, "{name}"),
        }
    }
}

/// One connection-manager record.
#[derive(Clone, Deserialize)]
pub struct ConnectionDescriptor {
    pub platform: String,
    pub name: String,
    pub datasource: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub cluster: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub mount_point: Option<String>,
    #[serde(default = "default_online", deserialize_with = "online_or_default")]
    pub online: bool,
    /// JSON-encoded object on the wire; tolerated as an inline object too.
    #[serde(default)]
    pub additional_info: Value,
}

fn default_online() -> bool {
    true
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// A null `online` counts as online.
fn online_or_default<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or_else(default_online))
}

/// Treats empty strings like absent values.
pub(crate) fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

impl ConnectionDescriptor {
    pub fn platform(&self) -> Platform {
        match self.platform.parse() {
            Ok(platform) => platform,
            Err(never) => match never {},
        }
    }

    pub fn key(&self) -> ConnectionKey {
        ConnectionKey {
            datasource: self.datasource.clone(),
            cluster: self.cluster.clone(),
        }
    }

    /// Decode `additional_info` into an object.
    pub fn additional_info(&self) -> std::result::Result<Map<String, Value>, ConnectorWarning> {
        let bad = |reason: String| ConnectorWarning::Metadata {
            connection: self.name.clone(),
            reason,
        };
        match &self.additional_info {
            Value::Null => Ok(Map::new()),
            Value::Object(map) => Ok(map.clone()),
            Value::String(raw) if raw.trim().is_empty() => Ok(Map::new()),
            Value::String(raw) => match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(map)) => Ok(map),
                Ok(other) => Err(bad(format!("expected an object, got {other}"))),
                Err(e) => Err(bad(e.to_string())),
            },
            other => Err(bad(format!("expected an object, got {other}"))),
        }
    }
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("platform", &self.platform)
            .field("name", &self.name)
            .field("datasource", &self.datasource)
            .field("cluster", &self.cluster)
            .field("host", &self.host)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("mount_point", &self.mount_point)
            .field("online", &self.online)
            .finish_non_exhaustive()
    }
}

/// Connections are unique per `(datasource, cluster)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey {
    pub datasource: String,
    pub cluster: String,
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.datasource, self.cluster)
    }
}

/// A mounted share: NFS export or CIFS share.
#[derive(Debug, Clone)]
pub struct ShareConnection {
    pub descriptor: ConnectionDescriptor,
    pub additional_info: Map<String, Value>,
    pub local_mount: PathBuf,
    /// Whether the share is known to be mounted at `local_mount`.
    pub mounted: bool,
}

/// An established connection to one datasource.
pub enum DataSourceConnection {
    ObjectStore(ObjectStoreConnection),
    NetworkShare(ShareConnection),
    SecureShell {
        descriptor: ConnectionDescriptor,
        files: Box<dyn RemoteFiles>,
    },
    /// The datasource's file system is mounted on this host.
    SecureShellLocal(ConnectionDescriptor),
    WindowsShare(ShareConnection),
}

impl DataSourceConnection {
    pub fn kind(&self) -> &'static str {
        match self {
            DataSourceConnection::ObjectStore(_) => "COS",
            DataSourceConnection::NetworkShare(_) => "NFS",
            DataSourceConnection::SecureShell { .. } => "Spectrum Scale",
            DataSourceConnection::SecureShellLocal(_) => "Spectrum Scale Local",
            DataSourceConnection::WindowsShare(_) => "SMB",
        }
    }

    /// Local mount path for share connections.
    pub fn local_mount(&self) -> Option<&std::path::Path> {
        match self {
            DataSourceConnection::NetworkShare(share)
            | DataSourceConnection::WindowsShare(share) => Some(&share.local_mount),
            _ => None,
        }
    }
}

impl fmt::Debug for DataSourceConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataSourceConnection::ObjectStore(c) => f.debug_tuple("ObjectStore").field(c).finish(),
            DataSourceConnection::NetworkShare(c) => {
                f.debug_tuple("NetworkShare").field(c).finish()
            }
            DataSourceConnection::SecureShell { descriptor, .. } => f
                .debug_struct("SecureShell")
                .field("descriptor", descriptor)
                .finish_non_exhaustive(),
            DataSourceConnection::SecureShellLocal(d) => {
                f.debug_tuple("SecureShellLocal").field(d).finish()
            }
            DataSourceConnection::WindowsShare(c) => {
                f.debug_tuple("WindowsShare").field(c).finish()
            }
        }
    }
}

pub type ConnectionMap = HashMap<ConnectionKey, DataSourceConnection>;

/// Why a single datasource was not connected.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorWarning {
    #[error("Unsupported connection platform '{platform}' for {connection}")]
    Unsupported { platform: String, connection: String },

    #[error("Skipping creation of offline connection: {connection}")]
    Offline { connection: String },

    #[error("Connection {connection} is missing {field}")]
    MissingField {
        connection: String,
        field: &'static str,
    },

    #[error("Cipher key unavailable, cannot decrypt secret for {connection}")]
    CipherUnavailable { connection: String },

    #[error("Credentials problem '{source}' with connection {connection}")]
    Decrypt {
        connection: String,
        #[source]
        source: CipherError,
    },

    #[error("Malformed connection descriptor {connection}: {reason}")]
    Malformed { connection: String, reason: String },

    #[error("Bad additional_info for {connection}: {reason}")]
    Metadata { connection: String, reason: String },

    #[error("Error when attempting connection {connection}: {source}")]
    Ssh {
        connection: String,
        #[source]
        source: SshError,
    },

    #[error("Could not prepare local mount for {connection}: {source}")]
    LocalPath {
        connection: String,
        #[source]
        source: std::io::Error,
    },
}

/// Knobs shared by the connectors that are not part of a descriptor.
#[derive(Debug, Clone)]
pub struct ConnectorSettings {
    /// Parent directory for CIFS mount points.
    pub smb_mount_root: PathBuf,
    /// Scheme used to reach the object-storage Manager API.
    pub manager_scheme: String,
    pub accept_invalid_certs: bool,
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        Self {
            smb_mount_root: std::env::temp_dir(),
            manager_scheme: "https".to_string(),
            accept_invalid_certs: true,
        }
    }
}

/// Everything a connector may use besides its descriptor.
pub struct ConnectContext<'a> {
    pub cipher: Option<&'a CredentialCipher>,
    pub mounts: &'a dyn MountService,
    pub shell: &'a dyn SecureShellClient,
    pub settings: &'a ConnectorSettings,
}

impl ConnectContext<'_> {
    /// Decrypt a secret stored in a descriptor.
    pub fn decrypt(
        &self,
        connection: &str,
        ciphertext: &str,
    ) -> std::result::Result<String, ConnectorWarning> {
        let cipher = self
            .cipher
            .ok_or_else(|| ConnectorWarning::CipherUnavailable {
                connection: connection.to_string(),
            })?;
        cipher
            .decrypt(ciphertext)
            .map_err(|source| ConnectorWarning::Decrypt {
                connection: connection.to_string(),
                source,
            })
    }
}

/// Fetches descriptors and dispatches them to the connectors.
pub struct ConnectionOrchestrator {
    client: Client,
    connections_url: url::Url,
    mounts: Arc<dyn MountService>,
    shell: Arc<dyn SecureShellClient>,
    settings: ConnectorSettings,
}

impl ConnectionOrchestrator {
    pub fn new(
        client: Client,
        endpoints: &Endpoints,
        mounts: Arc<dyn MountService>,
        shell: Arc<dyn SecureShellClient>,
        settings: ConnectorSettings,
    ) -> Self {
        Self {
            client,
            connections_url: endpoints.connections.clone(),
            mounts,
            shell,
            settings,
        }
    }

    /// Read the datasource descriptors from the connection manager.
    pub async fn fetch_descriptors(&self, auth: &ApiAuth) -> Result<Vec<ConnectionDescriptor>> {
        debug!("Querying information for connections");
        info!("Invoking conn manager at {}", self.connections_url);

        let request = self.client.get(self.connections_url.clone());
        let response = auth
            .apply(request)
            .send()
            .await
            .map_err(|e| Error::transport(describe_request_error(&e)))?;

        let status = response.status();
        debug!("Connection Manager response ({status})");
        if status != StatusCode::OK {
            return Err(Error::transport(format!(
                "Http Error :: connection manager returned {status}"
            )));
        }

        let raw: Vec<Value> = response
            .json()
            .await
            .map_err(|e| Error::transport(describe_request_error(&e)))?;

        Ok(raw
            .into_iter()
            .enumerate()
            .filter_map(|(index, value)| match decode_descriptor(index, value) {
                Ok(descriptor) => Some(descriptor),
                Err(warning) => {
                    warn!("{warning}");
                    None
                }
            })
            .collect())
    }

    /// Connect every descriptor, returning a fresh mapping.
    pub async fn connect_all(
        &self,
        descriptors: &[ConnectionDescriptor],
        cipher: Option<&CredentialCipher>,
    ) -> ConnectionMap {
        let ctx = ConnectContext {
            cipher,
            mounts: self.mounts.as_ref(),
            shell: self.shell.as_ref(),
            settings: &self.settings,
        };

        let mut connections = ConnectionMap::new();
        for descriptor in descriptors {
            match connect_one(descriptor, &ctx).await {
                Ok(connection) => {
                    info!(
                        "Successfully created {} connection for: {}",
                        connection.kind(),
                        descriptor.name
                    );
                    connections.insert(descriptor.key(), connection);
                }
                Err(ConnectorWarning::Offline { connection }) => {
                    info!("Skipping creation of offline connection: {connection}");
                }
                Err(warning) => warn!("{warning}"),
            }
        }
        connections
    }
}

/// Close every open SFTP session in `connections`.
pub async fn close_all(connections: &ConnectionMap) {
    for (key, connection) in connections {
        if let DataSourceConnection::SecureShell { files, .. } = connection
            && let Err(e) = files.close().await
        {
            warn!("Failed to close SFTP session for {key}: {e}");
        }
    }
}

/// Decode one entry of the connection-manager listing.
fn decode_descriptor(
    index: usize,
    value: Value,
) -> std::result::Result<ConnectionDescriptor, ConnectorWarning> {
    let connection = value
        .get("name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("#{index}"));
    serde_json::from_value(value).map_err(|e| ConnectorWarning::Malformed {
        connection,
        reason: e.to_string(),
    })
}

/// Dispatch one descriptor by platform.
pub async fn connect_one(
    descriptor: &ConnectionDescriptor,
    ctx: &ConnectContext<'_>,
) -> std::result::Result<DataSourceConnection, ConnectorWarning> {
    match descriptor.platform() {
        Platform::ObjectStore => connect_object_store(descriptor, ctx).await,
        Platform::NetworkShare => connect_network_share(descriptor, ctx).await,
        Platform::SecureShell => connect_secure_shell(descriptor, ctx).await,
        Platform::WindowsShare => connect_windows_share(descriptor, ctx).await,
        Platform::Unsupported(platform) => Err(ConnectorWarning::Unsupported {
            platform,
            connection: descriptor.name.clone(),
        }),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::mount::testing::RecordingMounts;

    #[test]
    fn test_platform_round_trip() {
        for wire in ["IBM COS", "NFS", "Spectrum Scale", "SMB/CIFS"] {
            let platform: Platform = wire.parse().unwrap();
            assert!(!matches!(platform, Platform::Unsupported(_)));
            assert_eq!(platform.to_string(), wire);
        }
        assert_eq!(
            "Ceph".parse::<Platform>().unwrap(),
            Platform::Unsupported("Ceph".to_string())
        );
    }

    #[test]
    fn test_additional_info_forms() {
        let mut d = descriptor("NFS", "n");
        d.additional_info = Value::String(r#"{"local_mount": "/mnt/x"}"#.into());
        assert_eq!(d.additional_info().unwrap()["local_mount"], "/mnt/x");

        d.additional_info = serde_json::json!({"local_mount": "/mnt/y"});
        assert_eq!(d.additional_info().unwrap()["local_mount"], "/mnt/y");

        d.additional_info = Value::Null;
        assert!(d.additional_info().unwrap().is_empty());

        d.additional_info = Value::String("not json".into());
        assert!(matches!(
            d.additional_info(),
            Err(ConnectorWarning::Metadata { .. })
        ));
    }

    #[test]
    fn test_descriptor_debug_hides_password() {
        let mut d = descriptor("NFS", "n");
        d.password = Some("ciphertext".into());
        assert!(!format!("{d:?}").contains("ciphertext"));
    }

    #[tokio::test]
    async fn test_unsupported_platform_is_skipped() {
        let mounts = RecordingMounts::default();
        let shell = FakeShell::default();
        let settings = ConnectorSettings::default();
        let ctx = ConnectContext {
            cipher: None,
            mounts: &mounts,
            shell: &shell,
            settings: &settings,
        };
        let result = connect_one(&descriptor("Ceph", "c"), &ctx).await;
        assert!(matches!(
            result,
            Err(ConnectorWarning::Unsupported { ref platform, .. }) if platform == "Ceph"
        ));
        assert!(mounts.calls().is_empty());
    }

    #[test]
    fn test_decrypt_without_cipher() {
        let mounts = RecordingMounts::default();
        let shell = FakeShell::default();
        let settings = ConnectorSettings::default();
        let ctx = ConnectContext {
            cipher: None,
            mounts: &mounts,
            shell: &shell,
            settings: &settings,
        };
        assert!(matches!(
            ctx.decrypt("c", "abc"),
            Err(ConnectorWarning::CipherUnavailable { .. })
        ));
    }

    fn orchestrator(
        mounts: Arc<RecordingMounts>,
        connections_url: url::Url,
    ) -> ConnectionOrchestrator {
        let services =
            crate::identity::ServiceUrls::single_host(connections_url.origin().ascii_serialization().as_str())
                .unwrap();
        let endpoints = Endpoints::from_services(&services).unwrap();
        ConnectionOrchestrator::new(
            Client::new(),
            &endpoints,
            mounts,
            Arc::new(FakeShell::default()),
            ConnectorSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_connect_all_isolates_failures() {
        let mounts = Arc::new(RecordingMounts::default());
        let orch = orchestrator(mounts.clone(), url::Url::parse("http://127.0.0.1:9").unwrap());

        let mut nfs = descriptor("NFS", "share");
        nfs.additional_info = Value::String(r#"{"local_mount": "/mnt/share"}"#.into());
        let mut bad_meta = descriptor("NFS", "broken");
        bad_meta.additional_info = Value::String("{".into());
        let unknown = descriptor("Ceph", "ceph");

        let map = orch.connect_all(&[bad_meta, unknown, nfs.clone()], None).await;
        assert_eq!(map.len(), 1);
        assert_eq!(map[&nfs.key()].kind(), "NFS");
    }

    #[tokio::test]
    async fn test_fetch_descriptors_non_ok_is_fatal() {
        use axum::Router;
        use axum::http::StatusCode as AxumStatus;
        use axum::routing::get;

        let app = Router::new().route(
            "/connmgr/v1/internal/connections",
            get(|| async { AxumStatus::SERVICE_UNAVAILABLE }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let orch = orchestrator(
            Arc::new(RecordingMounts::default()),
            url::Url::parse(&format!("http://{addr}")).unwrap(),
        );
        let auth = ApiAuth::Basic(crate::identity::Credentials::new("svc", "pw").unwrap());
        let err = orch.fetch_descriptors(&auth).await.unwrap_err();
        assert!(matches!(err, Error::Transport(ref m) if m.contains("503")));
    }

    #[test]
    fn test_null_cluster_and_online_are_tolerated() {
        let d = decode_descriptor(
            0,
            serde_json::json!({
                "platform": "IBM COS",
                "name": "cos1",
                "datasource": "cos1_ds",
                "cluster": null,
                "online": null,
            }),
        )
        .unwrap();
        assert_eq!(d.cluster, "");
        assert!(d.online);
    }

    #[tokio::test]
    async fn test_malformed_descriptor_does_not_hide_others() {
        use axum::Router;
        use axum::routing::get;

        let app = Router::new().route(
            "/connmgr/v1/internal/connections",
            get(|| async {
                axum::Json(serde_json::json!([
                    {"platform": "IBM COS", "name": "cos1", "datasource": "cos1_ds",
                     "cluster": null, "online": null},
                    {"platform": "NFS", "name": 7, "datasource": "bad_ds"},
                    {"platform": "NFS", "name": "share", "datasource": "share_ds",
                     "cluster": "c1", "host": "nfs1", "mount_point": "/export",
                     "online": true,
                     "additional_info": "{\"local_mount\": \"/mnt/share\"}"},
                ]))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let mounts = Arc::new(RecordingMounts::default());
        let orch = orchestrator(
            mounts.clone(),
            url::Url::parse(&format!("http://{addr}")).unwrap(),
        );
        let auth = ApiAuth::Basic(crate::identity::Credentials::new("svc", "pw").unwrap());
        let descriptors = orch.fetch_descriptors(&auth).await.unwrap();
        let names: Vec<_> = descriptors.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["cos1", "share"]);

        let map = orch.connect_all(&descriptors, None).await;
        let share = ConnectionKey {
            datasource: "share_ds".into(),
            cluster: "c1".into(),
        };
        assert_eq!(map[&share].kind(), "NFS");
    }

    #[test]
    fn test_malformed_descriptor_names_entry() {
        let warning = decode_descriptor(3, serde_json::json!({"platform": "NFS"})).unwrap_err();
        assert!(matches!(
            warning,
            ConnectorWarning::Malformed { ref connection, .. } if connection == "#3"
        ));
    }

    #[tokio::test]
    async fn test_close_all_closes_sftp_sessions() {
        use std::sync::atomic::Ordering;

        let shell = FakeShell::default();
        let target = SshTarget::parse("scale-host", "root", "pw".into());
        let files = shell.open_sftp(&target).await.unwrap();

        let mut connections = ConnectionMap::new();
        let scale = descriptor("Spectrum Scale", "scale1");
        connections.insert(
            scale.key(),
            DataSourceConnection::SecureShell {
                descriptor: scale.clone(),
                files,
            },
        );
        let local = descriptor("Spectrum Scale", "scale2");
        connections.insert(local.key(), DataSourceConnection::SecureShellLocal(local.clone()));

        close_all(&connections).await;
        assert_eq!(shell.closed.load(Ordering::SeqCst), 1);
    }
}
