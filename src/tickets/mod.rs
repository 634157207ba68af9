//! Ticket events: the payload published by the bot and the handler that
//! stores each ticket and notifies the operators of its unit.

pub mod handler;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use handler::TicketHandler;
pub use memory::{InMemoryRepository, LogNotifier};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ticket {
    /// Chat the ticket was opened from
    pub chat_id: i64,
    pub unit: String,
    pub name: String,
    pub description: String,
}

impl Ticket {
    /// Notification text sent to the unit's operators.
    pub fn notification_text(&self) -> String {
        format!(
            "New ticket received:\n\nName - {}\nDescription - {}\n\nReply to client #{}",
            self.name, self.description, self.chat_id
        )
    }
}

/// An operator who receives notifications for a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Subscriber {
    pub chat_id: i64,
}

/// Ticket storage. Each call is a single attempt; a failure fails the record.
#[async_trait]
pub trait TicketRepository: Send + Sync {
    async fn save_ticket(&self, ticket: &Ticket) -> anyhow::Result<()>;

    async fn subscribers(&self, unit: &str) -> anyhow::Result<Vec<Subscriber>>;
}

/// Outbound notification channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, chat_id: i64, text: &str) -> anyhow::Result<()>;
}
