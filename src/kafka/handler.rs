//! Record handlers and the per-topic registry injected at connection time.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Processes the payload of one record.
///
/// Returning an error (or panicking) leaves the record's offset out of the
/// commit set, so the record is delivered again. Handlers must therefore
/// tolerate seeing the same payload more than once.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle(&self, ctx: &CancellationToken, payload: Bytes) -> anyhow::Result<()>;
}

/// Adapts an async closure into a [`RecordHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> RecordHandler for FnHandler<F>
where
    F: Fn(CancellationToken, Bytes) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, ctx: &CancellationToken, payload: Bytes) -> anyhow::Result<()> {
        (self.0)(ctx.clone(), payload).await
    }
}

/// Wraps an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn RecordHandler>
where
    F: Fn(CancellationToken, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Topic name to handler mapping.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn RecordHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, topic: impl Into<String>, handler: Arc<dyn RecordHandler>) -> Self {
        self.handlers.insert(topic.into(), handler);
        self
    }

    pub fn get(&self, topic: &str) -> Option<Arc<dyn RecordHandler>> {
        self.handlers.get(topic).cloned()
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.handlers.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Every declared topic must have a handler before the consumer joins the group.
    pub fn validate(&self, topics: &[String]) -> Result<()> {
        let missing: Vec<&str> = topics
            .iter()
            .filter(|topic| !self.handlers.contains_key(topic.as_str()))
            .map(String::as_str)
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::Connection(format!(
                "no handler registered for topic(s): {}",
                missing.join(", ")
            )))
        }
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("topics", &self.topics())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop() -> Arc<dyn RecordHandler> {
        handler_fn(|_ctx, _payload| async { anyhow::Ok(()) })
    }

    #[test]
    fn test_validate_reports_missing_topics() {
        let registry = HandlerRegistry::new().register("tickets", noop());

        assert!(registry.validate(&["tickets".to_string()]).is_ok());

        let err = registry
            .validate(&["tickets".to_string(), "audit".to_string()])
            .unwrap_err();
        match err {
            Error::Connection(message) => assert!(message.contains("audit")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_fn_handler_receives_payload() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let handler = handler_fn(move |_ctx, payload: Bytes| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(payload.len(), Ordering::SeqCst);
                anyhow::Ok(())
            }
        });

        let registry = HandlerRegistry::new().register("tickets", handler);
        let ctx = CancellationToken::new();
        registry
            .get("tickets")
            .unwrap()
            .handle(&ctx, Bytes::from_static(b"abc"))
            .await
            .unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert!(registry.get("audit").is_none());
        assert_eq!(registry.topics(), vec!["tickets".to_string()]);
    }
}
