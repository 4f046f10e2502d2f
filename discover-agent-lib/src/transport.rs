//! mTLS messaging transport toward the platform broker.

use crate::Result;
use crate::certs::CertificateBundle;
use crate::registration::{MessagingEndpoint, RegistrationRecord};
use rdkafka::ClientConfig;
use rdkafka::consumer::StreamConsumer;
use rdkafka::producer::FutureProducer;
use std::path::Path;
use tracing::info;

/// Default `max.poll.interval.ms` (one day).
pub const DEFAULT_MAX_POLL_INTERVAL_MS: u64 = 86_400_000;

const CONSUMER_GROUP: &str = "myagent_grp";
const SESSION_TIMEOUT_MS: &str = "6000";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSettings {
    pub max_poll_interval_ms: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            max_poll_interval_ms: DEFAULT_MAX_POLL_INTERVAL_MS,
        }
    }
}

/// Client configurations for the registered broker and queues.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub producer: ClientConfig,
    pub consumer: ClientConfig,
    pub endpoint: MessagingEndpoint,
    pub work_queue: String,
    pub completion_queue: String,
}

impl TransportConfig {
    /// Create the producer and consumer. The certificate files must exist.
    pub fn instantiate(&self) -> Result<MessagingTransport> {
        let producer: FutureProducer = self.producer.create()?;
        let consumer: StreamConsumer = self.consumer.create()?;
        info!("Messaging clients created for {}", self.endpoint);
        Ok(MessagingTransport {
            producer,
            consumer,
            work_queue: self.work_queue.clone(),
            completion_queue: self.completion_queue.clone(),
        })
    }
}

/// Live producer and consumer.
pub struct MessagingTransport {
    pub producer: FutureProducer,
    pub consumer: StreamConsumer,
    pub work_queue: String,
    pub completion_queue: String,
}

impl std::fmt::Debug for MessagingTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagingTransport")
            .field("work_queue", &self.work_queue)
            .field("completion_queue", &self.completion_queue)
            .finish_non_exhaustive()
    }
}

fn path_str(path: &Path) -> String {
    path.display().to_string()
}

fn tls_config(record: &RegistrationRecord, certs: &CertificateBundle) -> ClientConfig {
    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", record.messaging_endpoint().to_string())
        .set("security.protocol", "ssl")
        .set("ssl.certificate.location", path_str(&certs.cert_path()))
        .set("ssl.key.location", path_str(&certs.key_path()))
        .set("ssl.ca.location", path_str(&certs.ca_path()));
    config
}

/// Producer configuration: mTLS to the broker, nothing else.
pub fn producer_config(record: &RegistrationRecord, certs: &CertificateBundle) -> ClientConfig {
    tls_config(record, certs)
}

/// Consumer configuration with manual commits.
pub fn consumer_config(
    record: &RegistrationRecord,
    certs: &CertificateBundle,
    settings: &TransportSettings,
) -> ClientConfig {
    let mut config = tls_config(record, certs);
    config
        .set("group.id", CONSUMER_GROUP)
        .set("session.timeout.ms", SESSION_TIMEOUT_MS)
        .set(
            "max.poll.interval.ms",
            settings.max_poll_interval_ms.to_string(),
        )
        .set("auto.offset.reset", "smallest")
        .set("enable.auto.commit", "false");
    config
}

/// Build the producer and consumer configuration for a registration.
pub fn configure(
    record: &RegistrationRecord,
    certs: &CertificateBundle,
    settings: &TransportSettings,
) -> TransportConfig {
    let endpoint = record.messaging_endpoint();
    info!("Configuring messaging transport at {endpoint}");
    TransportConfig {
        producer: producer_config(record, certs),
        consumer: consumer_config(record, certs, settings),
        endpoint,
        work_queue: record.work_q.clone(),
        completion_queue: record.completion_q.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> RegistrationRecord {
        RegistrationRecord {
            broker_ip: "10.0.0.5".into(),
            broker_port: "9092".into(),
            work_q: "app_work".into(),
            completion_q: "app_compl".into(),
            agent: "app".into(),
        }
    }

    #[test]
    fn test_producer_config() {
        let certs = CertificateBundle::new("/etc/discover/kafka");
        let config = producer_config(&record(), &certs);
        assert_eq!(config.get("bootstrap.servers"), Some("10.0.0.5:9092"));
        assert_eq!(config.get("security.protocol"), Some("ssl"));
        assert_eq!(
            config.get("ssl.certificate.location"),
            Some("/etc/discover/kafka/kafka_client.crt")
        );
        assert_eq!(
            config.get("ssl.key.location"),
            Some("/etc/discover/kafka/kafka_client.key")
        );
        assert_eq!(
            config.get("ssl.ca.location"),
            Some("/etc/discover/kafka/kafka-ca.crt")
        );
        assert_eq!(config.get("group.id"), None);
    }

    #[test]
    fn test_consumer_config() {
        let certs = CertificateBundle::new("/etc/discover/kafka");
        let config = consumer_config(&record(), &certs, &TransportSettings::default());
        assert_eq!(config.get("group.id"), Some("myagent_grp"));
        assert_eq!(config.get("session.timeout.ms"), Some("6000"));
        assert_eq!(config.get("max.poll.interval.ms"), Some("86400000"));
        assert_eq!(config.get("auto.offset.reset"), Some("smallest"));
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("security.protocol"), Some("ssl"));
    }

    #[test]
    fn test_configurable_poll_interval() {
        let certs = CertificateBundle::new("/tmp");
        let settings = TransportSettings {
            max_poll_interval_ms: 600_000,
        };
        let config = consumer_config(&record(), &certs, &settings);
        assert_eq!(config.get("max.poll.interval.ms"), Some("600000"));
    }

    #[test]
    fn test_configure_carries_queues() {
        let certs = CertificateBundle::new("/tmp");
        let transport = configure(&record(), &certs, &TransportSettings::default());
        assert_eq!(transport.endpoint.to_string(), "10.0.0.5:9092");
        assert_eq!(transport.work_queue, "app_work");
        assert_eq!(transport.completion_queue, "app_compl");
        assert_eq!(transport.producer.get("bootstrap.servers"), Some("10.0.0.5:9092"));
    }
}
