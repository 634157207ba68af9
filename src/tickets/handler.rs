use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::kafka::handler::RecordHandler;
use crate::kafka::serializer::JsonSerializer;
use crate::tickets::{Notifier, Ticket, TicketRepository};

/// Stores each ticket, then notifies every subscriber of its unit once.
pub struct TicketHandler<R, N> {
    repository: Arc<R>,
    notifier: Arc<N>,
}

impl<R, N> TicketHandler<R, N>
where
    R: TicketRepository,
    N: Notifier,
{
    pub fn new(repository: Arc<R>, notifier: Arc<N>) -> Self {
        Self {
            repository,
            notifier,
        }
    }
}

#[async_trait]
impl<R, N> RecordHandler for TicketHandler<R, N>
where
    R: TicketRepository + 'static,
    N: Notifier + 'static,
{
    async fn handle(&self, ctx: &CancellationToken, payload: Bytes) -> anyhow::Result<()> {
        let ticket: Ticket = JsonSerializer::decode(&payload).context("decode ticket")?;

        self.repository
            .save_ticket(&ticket)
            .await
            .context("save ticket")?;

        let subscribers = self
            .repository
            .subscribers(&ticket.unit)
            .await
            .context("load subscribers")?;

        let destinations: BTreeSet<i64> = subscribers.iter().map(|s| s.chat_id).collect();
        debug!(
            unit = %ticket.unit,
            destinations = destinations.len(),
            "Notifying subscribers"
        );

        if ctx.is_cancelled() {
            anyhow::bail!("cancelled before notifying subscribers of {}", ticket.unit);
        }

        let text = ticket.notification_text();
        for chat_id in destinations {
            self.notifier
                .notify(chat_id, &text)
                .await
                .with_context(|| format!("notify {chat_id}"))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tickets::{InMemoryRepository, Subscriber};
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CapturingNotifier {
        sent: Mutex<Vec<(i64, String)>>,
    }

    #[async_trait]
    impl Notifier for CapturingNotifier {
        async fn notify(&self, chat_id: i64, text: &str) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push((chat_id, text.to_string()));
            Ok(())
        }
    }

    struct FailingRepository;

    #[async_trait]
    impl TicketRepository for FailingRepository {
        async fn save_ticket(&self, _ticket: &Ticket) -> anyhow::Result<()> {
            anyhow::bail!("database unavailable")
        }

        async fn subscribers(&self, _unit: &str) -> anyhow::Result<Vec<Subscriber>> {
            Ok(Vec::new())
        }
    }

    fn ticket_payload() -> Bytes {
        Bytes::from(
            serde_json::to_vec(&Ticket {
                chat_id: 7,
                unit: "billing".to_string(),
                name: "Refund".to_string(),
                description: "Charged twice".to_string(),
            })
            .unwrap(),
        )
    }

    fn handler() -> (
        TicketHandler<InMemoryRepository, CapturingNotifier>,
        Arc<InMemoryRepository>,
        Arc<CapturingNotifier>,
    ) {
        let mut subscribers = HashMap::new();
        subscribers.insert("billing".to_string(), vec![100, 200, 100]);
        let repository = Arc::new(InMemoryRepository::new(subscribers));
        let notifier = Arc::new(CapturingNotifier::default());
        (
            TicketHandler::new(repository.clone(), notifier.clone()),
            repository,
            notifier,
        )
    }

    #[tokio::test]
    async fn test_ticket_is_saved_and_each_subscriber_notified_once() {
        let (handler, repository, notifier) = handler();

        handler
            .handle(&CancellationToken::new(), ticket_payload())
            .await
            .unwrap();

        assert_eq!(repository.tickets().len(), 1);
        let sent = notifier.sent.lock().unwrap();
        let destinations: Vec<i64> = sent.iter().map(|(chat_id, _)| *chat_id).collect();
        assert_eq!(destinations, vec![100, 200]);
        assert!(sent[0].1.contains("Charged twice"));
        assert!(sent[0].1.contains("#7"));
    }

    #[tokio::test]
    async fn test_malformed_payload_fails() {
        let (handler, repository, _) = handler();

        let err = handler
            .handle(&CancellationToken::new(), Bytes::from_static(b"not json"))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("decode ticket"));
        assert!(repository.tickets().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_context_skips_notifications() {
        let (handler, _, notifier) = handler();
        let ctx = CancellationToken::new();
        ctx.cancel();

        assert!(handler.handle(&ctx, ticket_payload()).await.is_err());
        assert!(notifier.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_repository_failure_fails_record() {
        let handler = TicketHandler::new(
            Arc::new(FailingRepository),
            Arc::new(CapturingNotifier::default()),
        );

        let err = handler
            .handle(&CancellationToken::new(), ticket_payload())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("save ticket"));
    }
}
