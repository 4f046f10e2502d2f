//! Startup sequence of a discover application.
//!
//! `start` runs the phases strictly in order: register, provision
//! certificates, connect datasources, configure the messaging transport. Any
//! phase error aborts the sequence. The bearer token is dropped at the end of
//! every completed cycle so later calls fetch a fresh one.

use crate::auth::{AuthSession, TokenAuthenticator, platform_client};
use crate::certs::{CertificateBundle, CertificateProvisioner};
use crate::cipher::{CredentialCipher, resolve_cipher};
use crate::connections::{
    self, ConnectionMap, ConnectionOrchestrator, ConnectorSettings, SecureShellClient,
};
use crate::identity::{ApplicationIdentity, Credentials};
use crate::mount::MountService;
use crate::registration::{RegistrationClient, RegistrationInfo, RegistrationRecord};
use crate::transport::{self, TransportConfig, TransportSettings};
use crate::{Error, Result};
use reqwest::Client;
use std::sync::Arc;
use tracing::info;

/// Everything needed to bootstrap one application process.
#[derive(Clone)]
pub struct BootstrapConfig {
    pub identity: ApplicationIdentity,
    pub credentials: Credentials,
    /// Application metadata sent with the registration.
    pub registration_info: RegistrationInfo,
    /// Cipher key override; skips the cipher key endpoint when set.
    pub cipher_key: Option<String>,
    pub accept_invalid_certs: bool,
    pub connectors: ConnectorSettings,
    pub transport: TransportSettings,
}

impl std::fmt::Debug for BootstrapConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapConfig")
            .field("identity", &self.identity)
            .field("credentials", &self.credentials)
            .field("registration_info", &self.registration_info)
            .field("cipher_key", &self.cipher_key.as_ref().map(|_| "<redacted>"))
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .field("connectors", &self.connectors)
            .field("transport", &self.transport)
            .finish()
    }
}

/// Mutable state accumulated by the bootstrap phases.
#[derive(Debug)]
pub struct BootstrapState {
    pub enabled: bool,
    pub session: AuthSession,
    pub registration: Option<RegistrationRecord>,
    pub certificates: Option<CertificateBundle>,
    pub cipher: Option<CredentialCipher>,
    pub connections: ConnectionMap,
    pub transport: Option<TransportConfig>,
}

impl BootstrapState {
    pub fn new(session: AuthSession) -> Self {
        Self {
            enabled: false,
            session,
            registration: None,
            certificates: None,
            cipher: None,
            connections: ConnectionMap::new(),
            transport: None,
        }
    }
}

pub struct DiscoverApplication {
    identity: ApplicationIdentity,
    client: Client,
    registration: RegistrationClient,
    certificates: CertificateProvisioner,
    orchestrator: ConnectionOrchestrator,
    registration_info: RegistrationInfo,
    cipher_key: Option<String>,
    transport_settings: TransportSettings,
    state: BootstrapState,
}

impl DiscoverApplication {
    pub fn new(
        config: BootstrapConfig,
        mounts: Arc<dyn MountService>,
        shell: Arc<dyn SecureShellClient>,
    ) -> Result<Self> {
        let client = platform_client(config.accept_invalid_certs)?;
        let endpoints = config.identity.endpoints();

        let authenticator = TokenAuthenticator::new(
            client.clone(),
            endpoints.identity.clone(),
            config.identity.mode(),
        );
        let session = AuthSession::new(authenticator, config.credentials);

        Ok(Self {
            registration: RegistrationClient::new(client.clone(), &config.identity),
            certificates: CertificateProvisioner::new(
                client.clone(),
                endpoints.certificates.clone(),
                config.identity.certs_dir(),
            ),
            orchestrator: ConnectionOrchestrator::new(
                client.clone(),
                endpoints,
                mounts,
                shell,
                config.connectors,
            ),
            identity: config.identity,
            client,
            registration_info: config.registration_info,
            cipher_key: config.cipher_key,
            transport_settings: config.transport,
            state: BootstrapState::new(session),
        })
    }

    pub fn identity(&self) -> &ApplicationIdentity {
        &self.identity
    }

    pub fn state(&self) -> &BootstrapState {
        &self.state
    }

    pub fn is_enabled(&self) -> bool {
        self.state.enabled
    }

    /// Work queue name, falling back to the default before registration.
    pub fn work_queue(&self) -> String {
        self.state
            .registration
            .as_ref()
            .map(|r| r.work_q.clone())
            .unwrap_or_else(|| self.identity.default_work_queue())
    }

    pub fn completion_queue(&self) -> String {
        self.state
            .registration
            .as_ref()
            .map(|r| r.completion_q.clone())
            .unwrap_or_else(|| self.identity.default_completion_queue())
    }

    /// Run the full bootstrap sequence.
    ///
    /// With `update_registration` an existing registration is replaced with
    /// this process's registration info.
    pub async fn start(&mut self, update_registration: bool) -> Result<()> {
        info!("Starting discover application {}...", self.identity.name());
        self.state.enabled = true;

        self.register(update_registration).await?;
        self.provision_certificates().await?;
        self.connect_datasources().await?;
        self.configure_transport()?;

        // Tokens expire; the next call after bootstrap re-authenticates.
        self.state.session.invalidate();
        Ok(())
    }

    /// Disable the application and close its open SFTP sessions.
    pub async fn stop(&mut self) {
        info!("Stopping discover application {}...", self.identity.name());
        self.state.enabled = false;
        connections::close_all(&self.state.connections).await;
    }

    async fn register(&mut self, allow_update: bool) -> Result<()> {
        let auth = self.state.session.api_auth().await?;
        let record = self
            .registration
            .register(&auth, &self.registration_info, allow_update)
            .await?
            .ok_or_else(|| {
                Error::registration(format!(
                    "application:{} missing from registrations",
                    self.identity.name()
                ))
            })?;

        info!("Application is registered");
        info!("Kafka host: {}", record.messaging_endpoint());
        info!("Application attached to work queue: {}", record.work_q);
        info!("Application attached to compl queue: {}", record.completion_q);

        self.state.registration = Some(record);
        Ok(())
    }

    async fn provision_certificates(&mut self) -> Result<()> {
        let auth = self.state.session.api_auth().await?;
        let bundle = self.certificates.fetch_and_persist(&auth).await?;
        self.state.certificates = Some(bundle);
        Ok(())
    }

    async fn connect_datasources(&mut self) -> Result<()> {
        let auth = self.state.session.api_auth().await?;
        let descriptors = self.orchestrator.fetch_descriptors(&auth).await?;

        self.state.cipher = resolve_cipher(
            &self.client,
            &self.identity.endpoints().cipher_key,
            &auth,
            self.cipher_key.as_deref(),
        )
        .await?;

        self.state.connections = self
            .orchestrator
            .connect_all(&descriptors, self.state.cipher.as_ref())
            .await;
        info!(
            "Connected {} of {} datasources",
            self.state.connections.len(),
            descriptors.len()
        );
        Ok(())
    }

    fn configure_transport(&mut self) -> Result<()> {
        let (Some(record), Some(certs)) = (&self.state.registration, &self.state.certificates)
        else {
            return Err(Error::config(
                "Transport requires registration and certificates",
            ));
        };
        if !certs.is_complete() {
            return Err(Error::certificate(format!(
                "Certificate files missing in {}",
                certs.dir().display()
            )));
        }
        self.state.transport = Some(transport::configure(
            record,
            certs,
            &self.transport_settings,
        ));
        Ok(())
    }
}
