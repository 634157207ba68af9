use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::tickets::{Notifier, Subscriber, Ticket, TicketRepository};

/// Repository kept in process memory, with subscribers taken from configuration.
///
/// Saving a ticket identical to one already stored is a no-op, so a
/// redelivered record does not create a second ticket.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    tickets: Mutex<Vec<Ticket>>,
    subscribers: HashMap<String, Vec<i64>>,
}

impl InMemoryRepository {
    pub fn new(subscribers: HashMap<String, Vec<i64>>) -> Self {
        Self {
            tickets: Mutex::new(Vec::new()),
            subscribers,
        }
    }

    pub fn tickets(&self) -> Vec<Ticket> {
        self.tickets
            .lock()
            .map(|tickets| tickets.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl TicketRepository for InMemoryRepository {
    async fn save_ticket(&self, ticket: &Ticket) -> anyhow::Result<()> {
        let mut tickets = self
            .tickets
            .lock()
            .map_err(|_| anyhow::anyhow!("ticket store lock poisoned"))?;

        if tickets.contains(ticket) {
            debug!(chat_id = ticket.chat_id, unit = %ticket.unit, "Ticket already stored");
            return Ok(());
        }

        tickets.push(ticket.clone());
        info!(chat_id = ticket.chat_id, unit = %ticket.unit, "Ticket stored");
        Ok(())
    }

    async fn subscribers(&self, unit: &str) -> anyhow::Result<Vec<Subscriber>> {
        Ok(self
            .subscribers
            .get(unit)
            .map(|ids| ids.iter().map(|chat_id| Subscriber { chat_id: *chat_id }).collect())
            .unwrap_or_default())
    }
}

/// Notifier that only writes the notification to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, chat_id: i64, text: &str) -> anyhow::Result<()> {
        info!(chat_id = chat_id, text = text, "Notification");
        Ok(())
    }
}
