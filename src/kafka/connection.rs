//! Broker Connection - the rdkafka side of the engine
//!
//! Owns the group consumer, the producer and the rebalance context that
//! forwards assignment changes to the [`RebalanceCoordinator`]. Rebalance
//! callbacks are served by librdkafka from inside `poll`, i.e. on the poll
//! loop's thread, which serializes them against dispatch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::kafka::coordinator::RebalanceCoordinator;
use crate::kafka::handler::HandlerRegistry;
use crate::kafka::poll_loop::{LogClient, OffsetCommitter, PollLoop, PollSettings};
use crate::kafka::producer::Producer;
use crate::kafka::types::{Fetch, FetchError, Record, TopicPartition};
use crate::{Error, Result};

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);
/// Upper bound for the flush of a connection dropped without `close`
const DROP_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Consumer context that drives the coordinator from rebalance callbacks.
pub struct RebalanceContext {
    coordinator: Arc<RebalanceCoordinator>,
    runtime: Handle,
}

impl RebalanceContext {
    pub fn new(coordinator: Arc<RebalanceCoordinator>, runtime: Handle) -> Self {
        Self {
            coordinator,
            runtime,
        }
    }
}

impl ClientContext for RebalanceContext {}

impl ConsumerContext for RebalanceContext {
    fn pre_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(list) => {
                let partitions: Vec<TopicPartition> = TopicPartition::from_list(list)
                    .into_iter()
                    .filter(|partition| self.coordinator.owns(partition))
                    .collect();

                // also covers the revoke librdkafka issues while the consumer closes
                if partitions.is_empty() {
                    debug!(
                        count = list.count(),
                        "Revoke for partitions without workers, nothing to drain"
                    );
                    return;
                }

                info!(count = partitions.len(), "Revoking partitions");

                // The broker waits for this callback, so a partition is never
                // handled by two members at once.
                let revoked = self
                    .runtime
                    .block_on(self.coordinator.revoke(&partitions, Some(base_consumer)));
                info!(count = revoked, "Revoke finished");
            }
            Rebalance::Assign(list) => {
                debug!(count = list.count(), "Pre-rebalance assign event");
            }
            Rebalance::Error(e) => {
                error!("Rebalance error: {}", e);
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(list) => {
                if list.count() == 0 {
                    debug!("Skipping empty assignment");
                    return;
                }
                self.coordinator.assign(&TopicPartition::from_list(list));
            }
            Rebalance::Revoke(_) => {
                debug!("Post-rebalance revoke event");
            }
            Rebalance::Error(e) => {
                error!("Post-rebalance error: {}", e);
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(_) => {
                debug!(partitions = offsets.count(), "Offsets committed");
            }
            Err(e) => {
                warn!("Failed to commit offsets: {}", e);
            }
        }
    }
}

impl<C: ConsumerContext + 'static> OffsetCommitter for BaseConsumer<C> {
    fn commit_offsets(&self, offsets: &[(TopicPartition, i64)]) -> Result<()> {
        let mut list = TopicPartitionList::new();
        for (partition, position) in offsets {
            list.add_partition_offset(
                partition.topic(),
                partition.partition(),
                Offset::Offset(*position),
            )
            .map_err(|e| Error::Commit(e.to_string()))?;
        }

        self.commit(&list, CommitMode::Sync)
            .map_err(|e| Error::Commit(e.to_string()))
    }
}

/// The group consumer behind the [`LogClient`] seam.
pub struct KafkaLog {
    consumer: BaseConsumer<RebalanceContext>,
    coordinator: Arc<RebalanceCoordinator>,
    closed: AtomicBool,
}

impl KafkaLog {
    fn new(
        consumer: BaseConsumer<RebalanceContext>,
        coordinator: Arc<RebalanceCoordinator>,
    ) -> Self {
        Self {
            consumer,
            coordinator,
            closed: AtomicBool::new(false),
        }
    }

    pub fn consumer(&self) -> &BaseConsumer<RebalanceContext> {
        &self.consumer
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl OffsetCommitter for KafkaLog {
    fn commit_offsets(&self, offsets: &[(TopicPartition, i64)]) -> Result<()> {
        self.consumer.commit_offsets(offsets)
    }
}

impl LogClient for KafkaLog {
    fn fetch(&self, max_records: usize, timeout: Duration) -> Fetch {
        if self.is_closed() {
            return Fetch::closed();
        }

        let mut fetch = Fetch::default();
        let mut received: Vec<(u64, Record)> = Vec::new();
        let mut wait = timeout;

        while received.len() < max_records {
            match self.consumer.poll(wait) {
                None => break,
                Some(Ok(message)) => {
                    received.push((self.coordinator.generation(), Record::from(&message)));
                }
                Some(Err(KafkaError::PartitionEOF(partition))) => {
                    debug!(partition = partition, "Reached end of partition");
                }
                Some(Err(e)) => {
                    fetch.errors.push(FetchError::new(e.to_string()));
                }
            }
            // only the first poll waits; the rest drain what is already buffered
            wait = Duration::ZERO;
        }

        // A rebalance may have run inside one of the polls above
        let generation = self.coordinator.generation();
        let total = received.len();
        fetch.records = received
            .into_iter()
            .filter(|(seen_at, _)| *seen_at == generation)
            .map(|(_, record)| record)
            .collect();

        if fetch.records.len() < total {
            debug!(
                dropped = total - fetch.records.len(),
                "Dropped records fetched before a rebalance"
            );
        }

        fetch
    }

    fn seek(&self, partition: &TopicPartition, offset: i64) -> Result<()> {
        self.consumer
            .seek(
                partition.topic(),
                partition.partition(),
                Offset::Offset(offset),
                SEEK_TIMEOUT,
            )
            .map_err(Into::into)
    }
}

/// A joined consumer group member plus its producer.
pub struct BrokerConnection {
    log: Arc<KafkaLog>,
    producer: Producer,
    coordinator: Arc<RebalanceCoordinator>,
    runtime: Handle,
    poll_settings: PollSettings,
    flush_timeout: Duration,
    closed: bool,
}

impl BrokerConnection {
    /// Creates the clients, checks that a broker answers and subscribes to
    /// the configured topics. Every topic needs a handler in `registry`.
    ///
    /// `handler_ctx` is handed to every handler invocation.
    pub async fn connect(
        config: &Config,
        registry: HandlerRegistry,
        handler_ctx: CancellationToken,
    ) -> Result<Self> {
        config.validate().map_err(Error::Config)?;
        registry.validate(&config.kafka.topics)?;

        let runtime = Handle::current();
        let coordinator = Arc::new(RebalanceCoordinator::new(
            registry,
            config.consumer.worker_settings(),
            handler_ctx,
            runtime.clone(),
        ));

        let producer = Producer::new(config.kafka.client_config(), &config.producer)?;

        let consumer: BaseConsumer<RebalanceContext> = consumer_config(config)
            .create_with_context(RebalanceContext::new(coordinator.clone(), runtime.clone()))?;

        let topics = config.kafka.topics.clone();
        let connect_timeout = config.kafka.connect_timeout();
        let consumer = tokio::task::spawn_blocking(move || -> Result<_> {
            // "Ping" the brokers; also surfaces authentication failures
            let metadata = consumer
                .fetch_metadata(None, connect_timeout)
                .map_err(|e| Error::Connection(format!("no broker reachable: {e}")))?;
            info!(
                brokers = metadata.brokers().len(),
                topics = metadata.topics().len(),
                "Connected to Kafka"
            );

            let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
            consumer.subscribe(&topics)?;
            info!(topics = ?topics, "Subscribed");
            Ok(consumer)
        })
        .await??;

        Ok(Self {
            log: Arc::new(KafkaLog::new(consumer, coordinator.clone())),
            producer,
            coordinator,
            runtime,
            poll_settings: config.consumer.poll_settings(),
            flush_timeout: config.producer.flush_timeout(),
            closed: false,
        })
    }

    pub fn producer(&self) -> &Producer {
        &self.producer
    }

    pub fn coordinator(&self) -> &Arc<RebalanceCoordinator> {
        &self.coordinator
    }

    /// A poll loop over this connection's consumer.
    pub fn poll_loop(&self) -> PollLoop<KafkaLog> {
        PollLoop::new(
            self.log.clone(),
            self.coordinator.clone(),
            self.runtime.clone(),
            self.poll_settings.clone(),
        )
    }

    /// Flushes outbound records, drains and commits every owned partition,
    /// then releases the clients.
    ///
    /// Teardown runs to the end even if the flush fails; the flush error is
    /// returned afterwards.
    pub async fn close(mut self) -> Result<()> {
        self.closed = true;

        tokio::task::spawn_blocking(move || {
            self.log.mark_closed();

            let flushed = self.producer.flush(self.flush_timeout);
            if let Err(e) = &flushed {
                error!(error = %e, "Failed to flush producer");
            }

            let revoked = self
                .runtime
                .block_on(self.coordinator.revoke_all(Some(self.log.consumer())));
            info!(partitions = revoked, "Connection closed");

            // leaving the group on drop blocks, keep it off the runtime
            drop(self);
            flushed
        })
        .await?
    }
}

impl Drop for BrokerConnection {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        warn!("Broker connection dropped without close, abandoning partition workers");
        self.log.mark_closed();
        self.coordinator.abandon();

        if let Err(e) = self.producer.flush(DROP_FLUSH_TIMEOUT) {
            error!(error = %e, "Failed to flush producer on drop");
        }
    }
}

fn consumer_config(config: &Config) -> ClientConfig {
    let mut client_config = config.kafka.client_config();
    client_config
        .set("group.id", &config.kafka.group_id)
        .set("enable.auto.commit", "false")
        .set("enable.auto.offset.store", "false")
        .set("auto.offset.reset", "latest")
        .set("partition.assignment.strategy", "roundrobin")
        .set("enable.partition.eof", "false")
        .set(
            "session.timeout.ms",
            config.consumer.session_timeout_ms.to_string(),
        )
        .set("fetch.max.bytes", config.consumer.fetch_max_bytes.to_string())
        .set(
            "max.partition.fetch.bytes",
            config.consumer.max_partition_fetch_bytes.to_string(),
        );
    client_config
}
