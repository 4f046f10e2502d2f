//! Configuration loading for discover-agent.
//!
//! Loads configuration from an optional TOML file and environment variables
//! using figment.
//!
//! # Configuration Sources (in order of priority, lowest to highest)
//!
//! 1. Default values (from `#[serde(default)]` attributes)
//! 2. TOML config file (if provided and present)
//! 3. Environment variables (prefix: `DISCOVER_`, nested with `__`)
//!
//! # Environment Variable Naming
//!
//! - `DISCOVER_APPLICATION__NAME` → `application.name`
//! - `DISCOVER_SERVICES__HOST` → `services.host`
//! - `DISCOVER_CREDENTIALS__USER` → `credentials.user`
//! - `DISCOVER_KAFKA__CERTS_DIR` → `kafka.certs_dir`
//! - `DISCOVER_KAFKA__MAX_POLL_INTERVAL_MS` → `kafka.max_poll_interval_ms`
//! - `DISCOVER_CIPHER_KEY` → `cipher_key`
//! - `DISCOVER_LOG_LEVEL` → `log_level`
//!
//! # Cluster Deployments
//!
//! Inside Kubernetes (`KUBERNETES_SERVICE_HOST` set) the policy engine and
//! connection manager are reached through their service environment
//! variables, and credentials fall back to the platform's service account.

use anyhow::{Context, Result};
use discover_agent_lib::BootstrapConfig;
use discover_agent_lib::connections::ConnectorSettings;
use discover_agent_lib::identity::{
    ApplicationIdentity, Credentials, DEFAULT_APPLICATION_NAME, DeploymentMode, ServiceUrls,
    parse_base,
};
use discover_agent_lib::transport::{DEFAULT_MAX_POLL_INTERVAL_MS, TransportSettings};
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CLUSTER_MARKER: &str = "KUBERNETES_SERVICE_HOST";
const CLUSTER_AUTH_URL: &str = "http://auth.spectrum-discover";

/// Main configuration structure for the agent.
#[derive(Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub application: ApplicationConfig,
    #[serde(default)]
    pub services: ServicesConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub connectors: ConnectorsConfig,
    /// Overrides the platform cipher key endpoint.
    #[serde(default)]
    pub cipher_key: Option<String>,
    /// Log level used when `RUST_LOG` is not set.
    #[serde(default)]
    pub log_level: Option<String>,
    /// Directory for logs; defaults to the user data dir.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("application", &self.application)
            .field("services", &self.services)
            .field("credentials", &self.credentials)
            .field("kafka", &self.kafka)
            .field("connectors", &self.connectors)
            .field("cipher_key", &self.cipher_key.as_ref().map(|_| "<redacted>"))
            .field("log_level", &self.log_level)
            .field("data_dir", &self.data_dir)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApplicationConfig {
    #[serde(default = "default_application_name")]
    pub name: String,
    /// Replace an existing registration with this one.
    #[serde(default)]
    pub update_registration: bool,
    /// Free-form metadata sent with the registration.
    #[serde(default)]
    pub registration: Map<String, Value>,
}

fn default_application_name() -> String {
    DEFAULT_APPLICATION_NAME.to_string()
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_application_name(),
            update_registration: false,
            registration: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeConfig {
    Standalone,
    Cluster,
}

/// Where the platform services live.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServicesConfig {
    /// Platform host; base for every service not set explicitly.
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub auth_url: Option<String>,
    #[serde(default)]
    pub policy_url: Option<String>,
    #[serde(default)]
    pub connmgr_url: Option<String>,
    /// Auto-detected from `KUBERNETES_SERVICE_HOST` when unset.
    #[serde(default)]
    pub mode: Option<ModeConfig>,
    /// The platform serves self-signed certificates.
    #[serde(default = "default_true")]
    pub accept_invalid_certs: bool,
}

fn default_host() -> String {
    "https://localhost".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            auth_url: None,
            policy_url: None,
            connmgr_url: None,
            mode: None,
            accept_invalid_certs: true,
        }
    }
}

#[derive(Clone, Default, Deserialize, Serialize)]
pub struct CredentialsConfig {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

impl std::fmt::Debug for CredentialsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialsConfig")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConfig {
    /// Relative paths resolve against the working directory.
    #[serde(default = "default_certs_dir")]
    pub certs_dir: PathBuf,
    #[serde(default = "default_max_poll_interval")]
    pub max_poll_interval_ms: u64,
}

fn default_certs_dir() -> PathBuf {
    PathBuf::from("kafka")
}

fn default_max_poll_interval() -> u64 {
    DEFAULT_MAX_POLL_INTERVAL_MS
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            certs_dir: default_certs_dir(),
            max_poll_interval_ms: default_max_poll_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectorsConfig {
    /// Parent of the temporary CIFS mount points.
    #[serde(default)]
    pub smb_mount_root: Option<PathBuf>,
    #[serde(default = "default_ssh_timeout")]
    pub ssh_timeout_secs: u64,
}

fn default_ssh_timeout() -> u64 {
    30
}

impl Default for ConnectorsConfig {
    fn default() -> Self {
        Self {
            smb_mount_root: None,
            ssh_timeout_secs: default_ssh_timeout(),
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(path) = path {
            if !path.exists() {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed("DISCOVER_").split("__"));

        figment
            .extract()
            .context("Failed to load config from file and environment")
    }

    /// Get the default data directory.
    ///
    /// - Linux: `~/.local/share/discover-agent/`
    /// - macOS: `~/Library/Application Support/discover-agent/`
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("discover-agent")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .as_deref()
            .map(expand_tilde)
            .unwrap_or_else(Self::default_data_dir)
    }

    pub fn ssh_timeout(&self) -> Duration {
        Duration::from_secs(self.connectors.ssh_timeout_secs)
    }

    /// Deployment mode: explicit setting, else cluster when running in Kubernetes.
    pub fn deployment_mode(&self, env: &impl Fn(&str) -> Option<String>) -> DeploymentMode {
        match self.services.mode {
            Some(ModeConfig::Cluster) => DeploymentMode::Cluster,
            Some(ModeConfig::Standalone) => DeploymentMode::Standalone,
            None if env(CLUSTER_MARKER).is_some() => DeploymentMode::Cluster,
            None => DeploymentMode::Standalone,
        }
    }

    /// Resolve the base URL of every platform service.
    pub fn service_urls(
        &self,
        mode: DeploymentMode,
        env: &impl Fn(&str) -> Option<String>,
    ) -> Result<ServiceUrls> {
        let explicit = |value: &Option<String>| -> Result<Option<url::Url>> {
            value
                .as_deref()
                .map(|raw| parse_base(raw).with_context(|| format!("Invalid service URL {raw}")))
                .transpose()
        };

        let mut urls = ServiceUrls::single_host(&self.services.host)
            .with_context(|| format!("Invalid platform host {}", self.services.host))?;

        if mode.is_cluster() {
            urls.policy = parse_base(&service_from_env(
                env,
                "POLICY_SERVICE_HOST",
                "POLICY_SERVICE_PORT",
                "POLICY_PROTOCOL",
            ))?;
            urls.connmgr = parse_base(&service_from_env(
                env,
                "CONNMGR_SERVICE_HOST",
                "CONNMGR_SERVICE_PORT",
                "CONNMGR_PROTOCOL",
            ))?;
            urls.auth = parse_base(
                &env("AUTH_SERVICE_HOST").unwrap_or_else(|| CLUSTER_AUTH_URL.to_string()),
            )?;
        }

        if let Some(url) = explicit(&self.services.auth_url)? {
            urls.auth = url;
        }
        if let Some(url) = explicit(&self.services.policy_url)? {
            urls.policy = url;
        }
        if let Some(url) = explicit(&self.services.connmgr_url)? {
            urls.connmgr = url;
        }
        Ok(urls)
    }

    /// Application credentials, falling back to the platform's own variables.
    pub fn credentials(
        &self,
        mode: DeploymentMode,
        env: &impl Fn(&str) -> Option<String>,
    ) -> Result<Credentials> {
        let (user_var, password_var) = if mode.is_cluster() {
            ("DB2WHREST_USER", "DB2WHREST_PASSWORD")
        } else {
            ("APPLICATION_USER", "APPLICATION_USER_PASSWORD")
        };
        let pick = |configured: &str, var: &str| {
            if configured.is_empty() {
                env(var).unwrap_or_default()
            } else {
                configured.to_string()
            }
        };

        Credentials::new(
            pick(&self.credentials.user, user_var),
            pick(&self.credentials.password, password_var),
        )
        .context("Set DISCOVER_CREDENTIALS__USER and DISCOVER_CREDENTIALS__PASSWORD")
    }

    /// Build everything the bootstrap needs.
    pub fn bootstrap_config(&self, env: &impl Fn(&str) -> Option<String>) -> Result<BootstrapConfig> {
        let mode = self.deployment_mode(env);
        let services = self.service_urls(mode, env)?;
        let credentials = self.credentials(mode, env)?;
        let identity = ApplicationIdentity::new(
            self.application.name.clone(),
            mode,
            &services,
            expand_tilde(&self.kafka.certs_dir),
        )
        .context("Invalid application identity")?;

        let mut connectors = ConnectorSettings {
            accept_invalid_certs: self.services.accept_invalid_certs,
            ..ConnectorSettings::default()
        };
        if let Some(root) = &self.connectors.smb_mount_root {
            connectors.smb_mount_root = expand_tilde(root);
        }

        Ok(BootstrapConfig {
            identity,
            credentials,
            registration_info: self.application.registration.clone(),
            cipher_key: self.cipher_key.clone().filter(|k| !k.is_empty()),
            accept_invalid_certs: self.services.accept_invalid_certs,
            connectors,
            transport: TransportSettings {
                max_poll_interval_ms: self.kafka.max_poll_interval_ms,
            },
        })
    }
}

/// Resolve a leading `~` against the home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

/// `{protocol}://{host}:{port}/` from a service's environment triple.
fn service_from_env(
    env: &impl Fn(&str) -> Option<String>,
    host: &str,
    port: &str,
    protocol: &str,
) -> String {
    format!(
        "{}://{}:{}/",
        env(protocol).unwrap_or_else(|| "http".to_string()),
        env(host).unwrap_or_else(|| "localhost".to_string()),
        env(port).unwrap_or_else(|| "80".to_string()),
    )
}
