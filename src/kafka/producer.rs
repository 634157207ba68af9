use std::time::Duration;

use rdkafka::producer::{FutureProducer, FutureRecord, Producer as _};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::ProducerConfig;
use crate::kafka::serializer::JsonSerializer;
use crate::{Error, Result};

/// Where the broker stored a published record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub partition: i32,
    pub offset: i64,
}

/// Synchronous publish path: every call waits for the broker's ack and
/// makes exactly one attempt.
#[derive(Clone)]
pub struct Producer {
    producer: FutureProducer,
    max_record_bytes: usize,
    delivery_timeout: Duration,
}

impl Producer {
    pub fn new(mut client_config: ClientConfig, config: &ProducerConfig) -> Result<Self> {
        let producer: FutureProducer = client_config
            .set("acks", &config.acks)
            .set("compression.type", &config.compression)
            .set("linger.ms", config.linger_ms.to_string())
            .set("message.timeout.ms", config.delivery_timeout_ms.to_string())
            .set("message.max.bytes", config.max_record_bytes.to_string())
            // no internal retry; the caller decides
            .set("retries", "0")
            .create()?;

        Ok(Self {
            producer,
            max_record_bytes: config.max_record_bytes,
            delivery_timeout: config.delivery_timeout(),
        })
    }

    /// Serializes `value` as JSON and publishes it.
    pub async fn publish<T: Serialize + ?Sized>(&self, topic: &str, value: &T) -> Result<Delivery> {
        let payload = JsonSerializer::encode(value)?;
        self.publish_bytes(topic, &payload).await
    }

    pub async fn publish_bytes(&self, topic: &str, payload: &[u8]) -> Result<Delivery> {
        if payload.len() > self.max_record_bytes {
            return Err(Error::Produce {
                topic: topic.to_string(),
                message: format!(
                    "record of {} bytes exceeds the {} byte limit",
                    payload.len(),
                    self.max_record_bytes
                ),
            });
        }

        let record: FutureRecord<'_, (), [u8]> = FutureRecord::to(topic).payload(payload);

        match self
            .producer
            .send(record, Timeout::After(self.delivery_timeout))
            .await
        {
            Ok((partition, offset)) => {
                debug!(topic = topic, partition = partition, offset = offset, "Record published");
                Ok(Delivery { partition, offset })
            }
            Err((e, _)) => {
                warn!(topic = topic, error = %e, "Publish failed");
                Err(Error::Produce {
                    topic: topic.to_string(),
                    message: e.to_string(),
                })
            }
        }
    }

    /// Waits for everything buffered to be acknowledged. Blocking.
    pub fn flush(&self, timeout: Duration) -> Result<()> {
        self.producer.flush(timeout).map_err(Into::into)
    }
}
