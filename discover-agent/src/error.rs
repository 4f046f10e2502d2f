//! Error types for the discover agent.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Configuration could not be loaded or resolved
    #[error(transparent)]
    Config(#[from] anyhow::Error),

    /// Bootstrap failure (registration, certificates, connections)
    #[error("Bootstrap error: {0}")]
    AgentLib(#[from] discover_agent_lib::Error),

    #[error("Transport not configured")]
    TransportMissing,
}

pub type Result<T> = std::result::Result<T, Error>;
