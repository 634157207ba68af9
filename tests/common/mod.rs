#![allow(dead_code)]

use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use ticket_relay::config::{Config, ConsumerConfig, KafkaConfig, ProducerConfig};
use ticket_relay::kafka::test_utils::MemoryLog;
use ticket_relay::kafka::{
    HandlerRegistry, PollLoop, PollSettings, RebalanceCoordinator, RecordHandler, TopicPartition,
    WorkerSettings,
};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const TOPIC: &str = "tickets";

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("ticket_relay=debug")
        .with_test_writer()
        .try_init()
        .ok();
}

/// Get test configuration from environment variables
pub fn get_test_config() -> Config {
    let kafka = KafkaConfig {
        brokers: env::var("TEST_KAFKA_BROKERS")
            .unwrap_or_else(|_| "localhost:9092".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .collect(),
        group_id: format!("ticket-relay-test-{}", std::process::id()),
        topics: vec![format!("test_tickets_{}", std::process::id())],
        security_protocol: None,
        sasl_mechanism: None,
        sasl_username: None,
        sasl_password: None,
        connect_timeout_secs: 5,
    };

    let consumer = ConsumerConfig {
        poll_timeout_ms: 100,
        session_timeout_ms: 10_000, // Fast group rebalances in tests
        ..ConsumerConfig::default()
    };

    let producer = ProducerConfig {
        linger_ms: 0, // Immediate sending for tests
        ..ProducerConfig::default()
    };

    Config {
        kafka,
        consumer,
        producer,
        subscribers: HashMap::new(),
    }
}

pub fn tp(partition: i32) -> TopicPartition {
    TopicPartition::new(TOPIC, partition)
}

/// A poll loop running against an in-memory log on a blocking thread.
pub struct Harness {
    pub coordinator: Arc<RebalanceCoordinator>,
    pub log: Arc<MemoryLog>,
    pub shutdown: CancellationToken,
    pub handler_ctx: CancellationToken,
    running: Option<JoinHandle<()>>,
}

impl Harness {
    pub fn start(handler: Arc<dyn RecordHandler>) -> Self {
        Self::start_with(handler, WorkerSettings::default(), 100)
    }

    pub fn start_with(
        handler: Arc<dyn RecordHandler>,
        settings: WorkerSettings,
        max_poll_records: usize,
    ) -> Self {
        init_tracing();

        let handler_ctx = CancellationToken::new();
        let registry = HandlerRegistry::new().register(TOPIC, handler);
        let coordinator = Arc::new(RebalanceCoordinator::new(
            registry,
            settings,
            handler_ctx.clone(),
            Handle::current(),
        ));
        let log = Arc::new(MemoryLog::new(coordinator.clone(), Handle::current()));

        let poll_loop = PollLoop::new(
            log.clone(),
            coordinator.clone(),
            Handle::current(),
            PollSettings {
                max_poll_records,
                poll_timeout: Duration::from_millis(20),
            },
        );

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let running = tokio::task::spawn_blocking(move || poll_loop.run(token));

        Self {
            coordinator,
            log,
            shutdown,
            handler_ctx,
            running: Some(running),
        }
    }

    /// Cancels the poll loop and waits for it to return.
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(running) = self.running.take() {
            tokio::time::timeout(Duration::from_secs(5), running)
                .await
                .expect("poll loop did not stop")
                .expect("poll loop panicked");
        }
    }

    /// Stops the loop, then drains and final-commits every owned partition.
    pub async fn close(&mut self) {
        self.stop().await;
        self.log.close();
        self.coordinator
            .revoke_all(Some(self.log.as_ref()))
            .await;
    }
}
