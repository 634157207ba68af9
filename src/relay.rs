use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::kafka::{BrokerConnection, HandlerRegistry};
use crate::tickets::{InMemoryRepository, LogNotifier, TicketHandler};
use crate::{Config, Result};

/// Consumes the configured topics until shutdown.
pub struct Relay {
    config: Config,
    registry: HandlerRegistry,
}

impl Relay {
    pub fn new(config: Config, registry: HandlerRegistry) -> Self {
        Self { config, registry }
    }

    /// Registers the ticket handler for every configured topic.
    pub fn for_tickets(config: Config) -> Self {
        let repository = Arc::new(InMemoryRepository::new(config.subscribers.clone()));
        let handler = Arc::new(TicketHandler::new(repository, Arc::new(LogNotifier)));

        let registry = config
            .kafka
            .topics
            .iter()
            .fold(HandlerRegistry::new(), |registry, topic| {
                registry.register(topic.clone(), handler.clone())
            });

        Self::new(config, registry)
    }

    /// Joins the group and runs the poll loop on a blocking thread. The
    /// connection is closed on every exit path once connected.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        info!(
            group_id = %self.config.kafka.group_id,
            topics = ?self.config.kafka.topics,
            "Relay starting"
        );

        let connection =
            BrokerConnection::connect(&self.config, self.registry, shutdown.clone()).await?;

        let poll_loop = connection.poll_loop();
        let polled = tokio::task::spawn_blocking(move || poll_loop.run(shutdown)).await;
        if let Err(e) = &polled {
            error!(error = %e, "Poll loop terminated abnormally");
        }

        let closed = connection.close().await;
        polled?;
        closed?;

        info!("Relay stopped");
        Ok(())
    }
}
