//! Per-process application identity and the platform endpoints derived from it.

use crate::{Error, Result};
use std::path::{Path, PathBuf};
use url::Url;

/// Default application name when none is configured.
pub const DEFAULT_APPLICATION_NAME: &str = "sd_sample_application";

/// How this process is deployed, which decides how API calls authenticate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeploymentMode {
    /// Runs next to the platform; API calls carry a bearer token.
    #[default]
    Standalone,
    /// Runs inside the orchestrated cluster; API calls use basic auth directly.
    Cluster,
}

impl DeploymentMode {
    pub fn is_cluster(&self) -> bool {
        matches!(self, DeploymentMode::Cluster)
    }
}

/// Username/password pair used against the identity service.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// Build credentials, rejecting empty fields.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Result<Self> {
        let username = username.into();
        let password = password.into();

        let mut missing = Vec::new();
        if username.is_empty() {
            missing.push("user");
        }
        if password.is_empty() {
            missing.push("password");
        }
        if !missing.is_empty() {
            return Err(Error::config(format!(
                "Authentication requires an application {}",
                missing.join(" and ")
            )));
        }

        Ok(Self { username, password })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Base URLs of the platform services this agent talks to.
#[derive(Debug, Clone)]
pub struct ServiceUrls {
    /// Identity service (token exchange).
    pub auth: Url,
    /// Policy engine (registration and certificates).
    pub policy: Url,
    /// Connection manager (datasource descriptors).
    pub connmgr: Url,
    /// Public application API (cipher key).
    pub api: Url,
}

impl ServiceUrls {
    /// Every service reachable through the same platform host.
    pub fn single_host(host: &str) -> Result<Self> {
        let base = parse_base(host)?;
        Ok(Self {
            auth: base.clone(),
            policy: base.clone(),
            connmgr: base.clone(),
            api: base,
        })
    }
}

/// Parse a base URL, making sure relative joins keep its full path.
pub fn parse_base(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw)?;
    if url.cannot_be_a_base() {
        return Err(Error::config(format!("Not a usable base URL: {raw}")));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// Fully resolved endpoints used during bootstrap.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub identity: Url,
    pub registration: Url,
    pub certificates: Url,
    pub connections: Url,
    pub cipher_key: Url,
}

impl Endpoints {
    pub fn from_services(services: &ServiceUrls) -> Result<Self> {
        Ok(Self {
            identity: services.auth.join("auth/v1/token")?,
            registration: services.policy.join("policyengine/v1/applications")?,
            certificates: services.policy.join("policyengine/v1/tlscert")?,
            connections: services.connmgr.join("connmgr/v1/internal/connections")?,
            cipher_key: services.api.join("api/application/v1/cipherkey")?,
        })
    }

    /// URL of a single named registration (used for PATCH updates).
    pub fn registration_entry(&self, agent: &str) -> Url {
        let mut url = self.registration.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(agent);
        }
        url
    }
}

/// Immutable identity of this agent process.
#[derive(Debug, Clone)]
pub struct ApplicationIdentity {
    name: String,
    mode: DeploymentMode,
    endpoints: Endpoints,
    certs_dir: PathBuf,
}

impl ApplicationIdentity {
    pub fn new(
        name: impl Into<String>,
        mode: DeploymentMode,
        services: &ServiceUrls,
        certs_dir: impl AsRef<Path>,
    ) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::config("Application name must not be empty"));
        }
        Ok(Self {
            name,
            mode,
            endpoints: Endpoints::from_services(services)?,
            certs_dir: absolute_dir(certs_dir.as_ref())?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> DeploymentMode {
        self.mode
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub fn certs_dir(&self) -> &Path {
        &self.certs_dir
    }

    /// Work queue name used until registration reports the real one.
    pub fn default_work_queue(&self) -> String {
        format!("{}_work", self.name)
    }

    /// Completion queue name used until registration reports the real one.
    pub fn default_completion_queue(&self) -> String {
        format!("{}_compl", self.name)
    }
}

/// Resolve a possibly relative directory against the working directory.
fn absolute_dir(dir: &Path) -> Result<PathBuf> {
    if dir.is_absolute() {
        return Ok(dir.to_path_buf());
    }
    Ok(std::env::current_dir()?.join(dir))
}
