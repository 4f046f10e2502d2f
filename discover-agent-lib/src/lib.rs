//! Bootstrap runtime for discover applications.
//!
//! An application registers with the policy engine, provisions its messaging
//! certificates, connects to every datasource the connection manager reports
//! and configures an mTLS transport toward the broker:
//! - Token and basic-auth exchange with the platform
//! - Idempotent registration
//! - Certificate download and storage
//! - Decryption of per-connection secrets
//! - Object store, NFS, SFTP and SMB connectors

pub mod auth;
pub mod bootstrap;
pub mod certs;
pub mod cipher;
pub mod connections;
mod error;
pub mod identity;
pub mod mount;
pub mod registration;
pub mod transport;

pub use bootstrap::{BootstrapConfig, BootstrapState, DiscoverApplication};
pub use error::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;
