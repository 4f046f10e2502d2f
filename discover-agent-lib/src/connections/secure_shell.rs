//! SFTP access to parallel file system clusters.

use super::{ConnectContext, ConnectionDescriptor, ConnectorWarning, DataSourceConnection, non_empty};
use async_trait::async_trait;
use russh::client::{self, Config, Handle, Handler};
use russh::keys::ssh_key::PublicKey;
use russh_sftp::client::SftpSession;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const DEFAULT_SSH_PORT: u16 = 22;

#[derive(Debug, thiserror::Error)]
pub enum SshError {
    #[error("SSH connection failed: {0}")]
    Connect(String),
    #[error("Timed out: {0}")]
    Timeout(&'static str),
    #[error("Authentication failed for user {0}")]
    Auth(String),
    #[error("SFTP subsystem failed: {0}")]
    Sftp(String),
}

/// Where and as whom to open an SFTP session.
#[derive(Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl SshTarget {
    /// Build a target from `host` or `host:port`.
    pub fn parse(host: &str, username: &str, password: String) -> Self {
        let (host, port) = match host.rsplit_once(':') {
            Some((h, p)) if !h.is_empty() => match p.parse() {
                Ok(port) => (h, port),
                Err(_) => (host, DEFAULT_SSH_PORT),
            },
            _ => (host, DEFAULT_SSH_PORT),
        };
        Self {
            host: host.to_string(),
            port,
            username: username.to_string(),
            password,
        }
    }
}

impl std::fmt::Debug for SshTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SshTarget({}@{}:{})", self.username, self.host, self.port)
    }
}

/// An open remote file session.
#[async_trait]
pub trait RemoteFiles: Send + Sync {
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, SshError>;

    async fn close(&self) -> Result<(), SshError>;
}

/// Opens SFTP sessions.
#[async_trait]
pub trait SecureShellClient: Send + Sync {
    async fn open_sftp(&self, target: &SshTarget) -> Result<Box<dyn RemoteFiles>, SshError>;
}

/// Client handler for russh.
struct SshHandler;

impl Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        // Cluster nodes are addressed by the connection manager; no known_hosts
        Ok(true)
    }
}

/// russh transport with password auth and the `sftp` subsystem.
#[derive(Debug, Clone)]
pub struct RusshSftpClient {
    timeout: Duration,
}

impl RusshSftpClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn connect(&self, target: &SshTarget) -> Result<Handle<SshHandler>, SshError> {
        let addr = (target.host.as_str(), target.port);
        debug!("Connecting to SSH at {}:{}", target.host, target.port);

        let connect = client::connect(Arc::new(Config::default()), addr, SshHandler);
        let mut session = match tokio::time::timeout(self.timeout, connect).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(SshError::Connect(e.to_string())),
            Err(_) => return Err(SshError::Timeout("SSH handshake")),
        };

        let auth = tokio::time::timeout(
            self.timeout,
            session.authenticate_password(&target.username, &target.password),
        )
        .await
        .map_err(|_| SshError::Timeout("SSH password authentication"))?
        .map_err(|e| SshError::Connect(format!("Password auth failed: {e}")))?;

        if auth.success() {
            debug!("SSH authentication successful");
            Ok(session)
        } else {
            Err(SshError::Auth(target.username.clone()))
        }
    }
}

impl Default for RusshSftpClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl SecureShellClient for RusshSftpClient {
    async fn open_sftp(&self, target: &SshTarget) -> Result<Box<dyn RemoteFiles>, SshError> {
        let handle = self.connect(target).await?;

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| SshError::Sftp(format!("Failed to open channel: {e}")))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| SshError::Sftp(e.to_string()))?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SshError::Sftp(e.to_string()))?;

        Ok(Box::new(SftpFiles {
            sftp,
            _handle: handle,
        }))
    }
}

/// SFTP session; keeps the SSH connection alive for its lifetime.
struct SftpFiles {
    sftp: SftpSession,
    _handle: Handle<SshHandler>,
}

#[async_trait]
impl RemoteFiles for SftpFiles {
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, SshError> {
        self.sftp
            .read(path)
            .await
            .map_err(|e| SshError::Sftp(e.to_string()))
    }

    async fn close(&self) -> Result<(), SshError> {
        self.sftp
            .close()
            .await
            .map_err(|e| SshError::Sftp(e.to_string()))
    }
}

/// Connect a parallel file system datasource.
///
/// Offline descriptors and descriptors without a password are skipped. When
/// this host is itself a member of the datasource's cluster the files are
/// read locally; otherwise an SFTP session is opened to `host`.
pub async fn connect_secure_shell(
    descriptor: &ConnectionDescriptor,
    ctx: &ConnectContext<'_>,
) -> Result<DataSourceConnection, ConnectorWarning> {
    let host = non_empty(&descriptor.host).unwrap_or_default();
    if !descriptor.online {
        return Err(ConnectorWarning::Offline {
            connection: host.to_string(),
        });
    }
    let Some(ciphertext) = non_empty(&descriptor.password) else {
        return Err(ConnectorWarning::MissingField {
            connection: descriptor.name.clone(),
            field: "password",
        });
    };

    if let Some(output) = ctx.mounts.cluster_membership().await
        && output.contains(&descriptor.cluster)
    {
        info!("Cluster {} is local to this host", descriptor.cluster);
        return Ok(DataSourceConnection::SecureShellLocal(descriptor.clone()));
    }

    let password = ctx.decrypt(&descriptor.name, ciphertext)?;
    let user = descriptor.user.as_deref().unwrap_or_default();
    let target = SshTarget::parse(host, user, password);

    let files = ctx
        .shell
        .open_sftp(&target)
        .await
        .map_err(|source| ConnectorWarning::Ssh {
            connection: descriptor.name.clone(),
            source,
        })?;

    Ok(DataSourceConnection::SecureShell {
        descriptor: descriptor.clone(),
        files,
    })
}
