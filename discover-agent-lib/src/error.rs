use thiserror::Error;

/// Fatal bootstrap errors.
///
/// Anything returned as an `Error` halts startup. Per-connector problems are
/// reported as [`crate::connections::ConnectorWarning`] instead and never
/// surface here.
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Registration failed: {0}")]
    Registration(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Messaging configuration error: {0}")]
    Messaging(#[from] rdkafka::error::KafkaError),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Error::Auth(msg.into())
    }

    pub fn registration(msg: impl Into<String>) -> Self {
        Error::Registration(msg.into())
    }

    pub fn certificate(msg: impl Into<String>) -> Self {
        Error::Certificate(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(msg.into())
    }

    /// Returns true if this error came from the credential exchange.
    pub fn is_auth_error(&self) -> bool {
        match self {
            Error::Auth(_) => true,
            Error::Http(e) => e.status().is_some_and(|s| s.as_u16() == 401 || s.as_u16() == 403),
            _ => false,
        }
    }
}

/// Describe a failed HTTP exchange the way the platform logs expect.
pub(crate) fn describe_request_error(err: &reqwest::Error) -> String {
    if err.is_connect() {
        format!("Error Connecting :: {err}")
    } else if err.is_timeout() {
        format!("Timeout Error :: {err}")
    } else if err.is_status() {
        format!("Http Error :: {err}")
    } else {
        format!("Request Error :: {err}")
    }
}
