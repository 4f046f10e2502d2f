//! Idempotent application registration with the policy engine.
//!
//! Registration is a POST that may race with other instances of the same
//! application. A 409 means someone already registered the name; the record is
//! then looked up with a GET, optionally after a PATCH that replaces the stored
//! registration info.

use crate::auth::ApiAuth;
use crate::identity::{ApplicationIdentity, Endpoints};
use crate::{Error, Result};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use tracing::{error, info, warn};

/// Free-form application metadata sent with the registration.
pub type RegistrationInfo = Map<String, Value>;

/// Payload key carrying this application's agent name.
const AGENT_NAME_KEY: &str = "action_agent";

/// Broker and queue assignment returned by the policy engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRecord {
    pub broker_ip: String,
    #[serde(deserialize_with = "string_or_number")]
    pub broker_port: String,
    pub work_q: String,
    pub completion_q: String,
    #[serde(default)]
    pub agent: String,
}

impl RegistrationRecord {
    /// Broker address for the messaging transport.
    pub fn messaging_endpoint(&self) -> MessagingEndpoint {
        MessagingEndpoint {
            host: self.broker_ip.clone(),
            port: self.broker_port.clone(),
        }
    }
}

/// `host:port` of the message broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagingEndpoint {
    pub host: String,
    pub port: String,
}

impl fmt::Display for MessagingEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

/// Client for the registration endpoints of the policy engine.
pub struct RegistrationClient {
    client: Client,
    endpoints: Endpoints,
    application_name: String,
}

impl RegistrationClient {
    pub fn new(client: Client, identity: &ApplicationIdentity) -> Self {
        Self {
            client,
            endpoints: identity.endpoints().clone(),
            application_name: identity.name().to_string(),
        }
    }

    /// Register this application, falling back to a lookup when already registered.
    ///
    /// Returns `Ok(None)` when the registration list does not contain this
    /// application's agent name.
    pub async fn register(
        &self,
        auth: &ApiAuth,
        reg_info: &RegistrationInfo,
        allow_update: bool,
    ) -> Result<Option<RegistrationRecord>> {
        let mut payload = reg_info.clone();
        payload.insert(
            AGENT_NAME_KEY.to_string(),
            Value::String(self.application_name.clone()),
        );

        match self.post_register(auth, &payload, allow_update).await {
            Ok(record) => Ok(record),
            Err(e) => {
                error!("Application POST registration request FAIL - ({e})");
                Err(e)
            }
        }
    }

    async fn post_register(
        &self,
        auth: &ApiAuth,
        payload: &RegistrationInfo,
        allow_update: bool,
    ) -> Result<Option<RegistrationRecord>> {
        let request = self
            .client
            .post(self.endpoints.registration.clone())
            .json(payload);
        let response = auth.apply(request).send().await?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => Ok(Some(response.json().await?)),
            StatusCode::CONFLICT => {
                if allow_update {
                    info!(
                        "Application already registered, initiating PATCH update request (application:{})",
                        self.application_name
                    );
                    if let Err(e) = self.patch_register(auth, payload).await {
                        warn!(
                            "Registration PATCH failed, continuing with GET (application:{}): {e}",
                            self.application_name
                        );
                    }
                } else {
                    warn!(
                        "Application already registered, initiating GET request (application:{})",
                        self.application_name
                    );
                }
                self.get_register(auth).await
            }
            status => Err(self.unexpected(status)),
        }
    }

    async fn patch_register(&self, auth: &ApiAuth, payload: &RegistrationInfo) -> Result<()> {
        let url = self.endpoints.registration_entry(&self.application_name);
        let request = self.client.patch(url).json(payload);
        let response = auth.apply(request).send().await?;

        match response.status() {
            // A successful PATCH carries no body.
            StatusCode::OK | StatusCode::CREATED | StatusCode::NO_CONTENT => Ok(()),
            status => Err(self.unexpected(status)),
        }
    }

    async fn get_register(&self, auth: &ApiAuth) -> Result<Option<RegistrationRecord>> {
        let request = self.client.get(self.endpoints.registration.clone());
        let response = auth.apply(request).send().await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(self.unexpected(status));
        }

        // Other applications' entries are not decoded; only ours has to be well formed.
        let registrations: Vec<Value> = response.json().await?;
        if registrations.is_empty() {
            return Err(Error::registration(format!(
                "Application GET registration empty - (application:{})",
                self.application_name
            )));
        }

        let Some(entry) = registrations
            .into_iter()
            .find(|reg| reg.get("agent").and_then(Value::as_str) == Some(self.application_name.as_str()))
        else {
            return Ok(None);
        };

        serde_json::from_value(entry).map(Some).map_err(|e| {
            Error::registration(format!(
                "application:{}, malformed registration: {e}",
                self.application_name
            ))
        })
    }

    fn unexpected(&self, status: StatusCode) -> Error {
        Error::registration(format!(
            "application:{}, error:{}",
            self.application_name,
            status.as_u16()
        ))
    }
}
