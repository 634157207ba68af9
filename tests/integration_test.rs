mod common;

use std::sync::Arc;
use std::time::Duration;

use common::get_test_config;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use ticket_relay::kafka::test_utils::{wait_until, RecordingHandler};
use ticket_relay::kafka::{BrokerConnection, HandlerRegistry, Producer};
use ticket_relay::tickets::Ticket;
use ticket_relay::{Config, Error};
use tokio_util::sync::CancellationToken;
use tracing::info;

async fn create_topic(config: &Config, partitions: i32) {
    let admin: AdminClient<DefaultClientContext> =
        config.kafka.client_config().create().unwrap();
    let topics: Vec<NewTopic<'_>> = config
        .kafka
        .topics
        .iter()
        .map(|topic| NewTopic::new(topic, partitions, TopicReplication::Fixed(1)))
        .collect();
    admin
        .create_topics(&topics, &AdminOptions::new())
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_end_to_end_publish_and_consume() {
    common::init_tracing();

    let config = get_test_config();
    create_topic(&config, 2).await;
    let topic = config.kafka.topics[0].clone();

    let handler = Arc::new(RecordingHandler::new());
    let registry = HandlerRegistry::new().register(topic.clone(), handler.clone());
    let shutdown = CancellationToken::new();

    let connection = BrokerConnection::connect(&config, registry, shutdown.clone())
        .await
        .unwrap();
    let coordinator = connection.coordinator().clone();
    let poll_loop = connection.poll_loop();
    let token = shutdown.clone();
    let running = tokio::task::spawn_blocking(move || poll_loop.run(token));

    // new groups start at the end of the log: wait for the assignment first
    assert!(wait_until(|| coordinator.owned().len() == 2, Duration::from_secs(30)).await);

    let producer = connection.producer().clone();
    for chat_id in 0..10 {
        let ticket = Ticket {
            chat_id,
            unit: "support".to_string(),
            name: format!("ticket {chat_id}"),
            description: "integration".to_string(),
        };
        let delivery = producer.publish(&topic, &ticket).await.unwrap();
        info!(partition = delivery.partition, offset = delivery.offset, "Published");
    }

    assert!(wait_until(|| handler.seen().len() >= 10, Duration::from_secs(30)).await);

    shutdown.cancel();
    running.await.unwrap();
    connection.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_oversized_publish_leaves_producer_usable() {
    let mut config = get_test_config();
    config.producer.max_record_bytes = 1_024;
    create_topic(&config, 1).await;
    let topic = config.kafka.topics[0].clone();

    let producer = Producer::new(config.kafka.client_config(), &config.producer).unwrap();

    let oversized = vec![b'x'; 10_000];
    assert!(matches!(
        producer.publish_bytes(&topic, &oversized).await,
        Err(Error::Produce { .. })
    ));

    let delivery = producer.publish_bytes(&topic, b"{}").await.unwrap();
    assert!(delivery.offset >= 0);
}
