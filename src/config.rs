use rdkafka::ClientConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::kafka::coordinator::WorkerSettings;
use crate::kafka::poll_loop::PollSettings;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub producer: ProducerConfig,
    /// Unit name to notification destinations, served by the in-memory repository.
    #[serde(default)]
    pub subscribers: HashMap<String, Vec<i64>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    pub group_id: String,
    pub topics: Vec<String>,
    #[serde(default)]
    pub security_protocol: Option<String>,
    #[serde(default)]
    pub sasl_mechanism: Option<String>,
    #[serde(default)]
    pub sasl_username: Option<String>,
    #[serde(default)]
    pub sasl_password: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_max_poll_records")]
    pub max_poll_records: usize,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Batches buffered per partition before the poll loop blocks.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Upper bound on waiting for a revoked worker; `None` or 0 waits forever.
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: Option<u64>,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    #[serde(default = "default_fetch_max_bytes")]
    pub fetch_max_bytes: usize,
    #[serde(default = "default_max_partition_fetch_bytes")]
    pub max_partition_fetch_bytes: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProducerConfig {
    #[serde(default = "default_acks")]
    pub acks: String,
    #[serde(default = "default_compression")]
    pub compression: String,
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u32,
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,
    #[serde(default = "default_max_record_bytes")]
    pub max_record_bytes: usize,
    #[serde(default = "default_flush_timeout_secs")]
    pub flush_timeout_secs: u64,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("TICKET_RELAY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("kafka.brokers")
                    .with_list_parse_key("kafka.topics"),
            )
            .build()?;

        settings.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.kafka.brokers.is_empty() {
            return Err("kafka.brokers must list at least one broker".to_string());
        }
        if self.kafka.group_id.trim().is_empty() {
            return Err("kafka.group_id must not be empty".to_string());
        }
        if self.kafka.topics.is_empty() {
            return Err("kafka.topics must list at least one topic".to_string());
        }
        if self.consumer.queue_capacity == 0 {
            return Err("consumer.queue_capacity must be greater than zero".to_string());
        }
        if self.consumer.max_poll_records == 0 {
            return Err("consumer.max_poll_records must be greater than zero".to_string());
        }
        Ok(())
    }
}

impl KafkaConfig {
    /// Settings shared by every client created against this cluster.
    pub fn client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config.set("bootstrap.servers", self.brokers.join(","));

        if let Some(protocol) = &self.security_protocol {
            client_config.set("security.protocol", protocol);
        }
        if let Some(mechanism) = &self.sasl_mechanism {
            client_config.set("sasl.mechanism", mechanism);
        }
        if let Some(username) = &self.sasl_username {
            client_config.set("sasl.username", username);
        }
        if let Some(password) = &self.sasl_password {
            client_config.set("sasl.password", password);
        }

        client_config
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl ConsumerConfig {
    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            queue_capacity: self.queue_capacity,
            drain_timeout: self
                .drain_timeout_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
        }
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            max_poll_records: self.max_poll_records,
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
        }
    }
}

impl ProducerConfig {
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_secs(self.flush_timeout_secs)
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_poll_records: default_max_poll_records(),
            poll_timeout_ms: default_poll_timeout_ms(),
            queue_capacity: default_queue_capacity(),
            drain_timeout_secs: default_drain_timeout_secs(),
            session_timeout_ms: default_session_timeout_ms(),
            fetch_max_bytes: default_fetch_max_bytes(),
            max_partition_fetch_bytes: default_max_partition_fetch_bytes(),
        }
    }
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            acks: default_acks(),
            compression: default_compression(),
            linger_ms: default_linger_ms(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
            max_record_bytes: default_max_record_bytes(),
            flush_timeout_secs: default_flush_timeout_secs(),
        }
    }
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_max_poll_records() -> usize {
    500
}

fn default_poll_timeout_ms() -> u64 {
    500
}

fn default_queue_capacity() -> usize {
    5
}

fn default_drain_timeout_secs() -> Option<u64> {
    Some(30)
}

fn default_session_timeout_ms() -> u64 {
    45_000
}

fn default_fetch_max_bytes() -> usize {
    52_428_800 // 50MB
}

fn default_max_partition_fetch_bytes() -> usize {
    1_048_576 // 1MB
}

fn default_acks() -> String {
    "all".to_string()
}

fn default_compression() -> String {
    "none".to_string()
}

fn default_linger_ms() -> u32 {
    5
}

fn default_delivery_timeout_ms() -> u64 {
    30_000
}

fn default_max_record_bytes() -> usize {
    1_000_000
}

fn default_flush_timeout_secs() -> u64 {
    10
}
