//! Rebalance Coordinator - partition ownership and worker lifecycle
//!
//! The coordinator owns the map from partition to worker. Assignment starts
//! a worker for every newly owned partition; revocation removes the workers
//! from the map first, so the poll loop can no longer route records to them,
//! and only then signals quit and waits for every completion acknowledgment.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::kafka::handler::HandlerRegistry;
use crate::kafka::ledger::OffsetLedger;
use crate::kafka::poll_loop::OffsetCommitter;
use crate::kafka::types::TopicPartition;
use crate::kafka::worker::{Completion, PartitionBatch, PartitionWorker, WorkerState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Batches buffered per worker before the poll loop blocks
    pub queue_capacity: usize,
    /// How long a revocation waits for one worker; `None` waits forever
    pub drain_timeout: Option<Duration>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 5,
            drain_timeout: Some(Duration::from_secs(30)),
        }
    }
}

pub struct RebalanceCoordinator {
    workers: DashMap<TopicPartition, PartitionWorker>,
    registry: HandlerRegistry,
    ledger: Arc<OffsetLedger>,
    settings: WorkerSettings,
    /// Passed to every handler invocation; cancelled on shutdown
    handler_ctx: CancellationToken,
    runtime: Handle,
    /// Bumped on every ownership change
    generation: AtomicU64,
}

impl RebalanceCoordinator {
    pub fn new(
        registry: HandlerRegistry,
        settings: WorkerSettings,
        handler_ctx: CancellationToken,
        runtime: Handle,
    ) -> Self {
        Self {
            workers: DashMap::new(),
            registry,
            ledger: Arc::new(OffsetLedger::new()),
            settings,
            handler_ctx,
            runtime,
            generation: AtomicU64::new(0),
        }
    }

    /// Starts a worker for every partition not owned yet. Returns how many
    /// workers were started.
    pub fn assign(&self, partitions: &[TopicPartition]) -> usize {
        self.generation.fetch_add(1, Ordering::SeqCst);

        let mut started = 0;
        for partition in partitions {
            let Some(handler) = self.registry.get(partition.topic()) else {
                warn!(
                    topic = partition.topic(),
                    partition = partition.partition(),
                    "No handler registered for assigned topic, not consuming"
                );
                continue;
            };

            match self.workers.entry(partition.clone()) {
                Entry::Occupied(_) => {
                    debug!("Partition {} already owned, keeping its worker", partition);
                }
                Entry::Vacant(slot) => {
                    let epoch = self.ledger.open(partition);
                    slot.insert(PartitionWorker::spawn(
                        partition.clone(),
                        handler,
                        self.ledger.clone(),
                        epoch,
                        self.handler_ctx.clone(),
                        self.settings.queue_capacity,
                        &self.runtime,
                    ));
                    started += 1;
                }
            }
        }

        info!(
            assigned = partitions.len(),
            started = started,
            owned = self.workers.len(),
            "Partitions assigned"
        );
        started
    }

    /// Stops the workers of the given partitions and waits until each one
    /// has acknowledged completion (or its drain timeout elapsed).
    ///
    /// With a committer, the final positions of the revoked partitions are
    /// committed before their progress is forgotten.
    pub async fn revoke(
        &self,
        partitions: &[TopicPartition],
        committer: Option<&dyn OffsetCommitter>,
    ) -> usize {
        self.generation.fetch_add(1, Ordering::SeqCst);

        // Unroute first, so no new batch can reach a worker that is draining
        let completions: Vec<Completion> = partitions
            .iter()
            .filter_map(|partition| self.workers.remove(partition))
            .map(|(_, worker)| worker.quit())
            .collect();

        if completions.is_empty() {
            debug!(requested = partitions.len(), "No owned partitions to revoke");
            return 0;
        }

        let revoked: Vec<TopicPartition> = completions
            .iter()
            .map(|completion| completion.partition().clone())
            .collect();

        info!(
            count = revoked.len(),
            "Revoking partitions, waiting for workers to finish"
        );

        join_all(
            completions
                .into_iter()
                .map(|completion| self.await_completion(completion)),
        )
        .await;

        if let Some(committer) = committer {
            self.commit_final(committer, &revoked);
        }
        for partition in &revoked {
            self.ledger.forget(partition);
        }

        info!(
            count = revoked.len(),
            owned = self.workers.len(),
            "Partitions revoked"
        );
        revoked.len()
    }

    /// Revokes everything currently owned.
    pub async fn revoke_all(&self, committer: Option<&dyn OffsetCommitter>) -> usize {
        let owned = self.owned();
        self.revoke(&owned, committer).await
    }

    /// Signals quit to every worker without waiting for them.
    pub fn abandon(&self) -> usize {
        let partitions = self.owned();
        let mut abandoned = 0;
        for partition in &partitions {
            if let Some((_, worker)) = self.workers.remove(partition) {
                drop(worker.quit());
                abandoned += 1;
            }
        }
        if abandoned > 0 {
            warn!(count = abandoned, "Abandoned partition workers without waiting");
        }
        abandoned
    }

    pub fn owns(&self, partition: &TopicPartition) -> bool {
        self.workers.contains_key(partition)
    }

    pub fn owned(&self) -> Vec<TopicPartition> {
        let mut owned: Vec<TopicPartition> =
            self.workers.iter().map(|entry| entry.key().clone()).collect();
        owned.sort();
        owned
    }

    /// Inbound queue of the partition's worker, if the partition is owned.
    pub fn sender_for(&self, partition: &TopicPartition) -> Option<mpsc::Sender<PartitionBatch>> {
        // clone and release the map guard before anyone awaits capacity
        self.workers.get(partition).map(|worker| worker.sender())
    }

    pub fn worker_state(&self, partition: &TopicPartition) -> Option<WorkerState> {
        self.workers.get(partition).map(|worker| worker.state())
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn ledger(&self) -> &Arc<OffsetLedger> {
        &self.ledger
    }

    async fn await_completion(&self, completion: Completion) {
        let partition = completion.partition().clone();
        let started = Instant::now();

        match self.settings.drain_timeout {
            None => completion.wait().await,
            Some(timeout) => {
                if tokio::time::timeout(timeout, completion.wait()).await.is_err() {
                    let stall = Error::ShutdownStall {
                        partition: partition.to_string(),
                        waited_ms: started.elapsed().as_millis(),
                    };
                    error!(error = %stall, "Gave up waiting for partition worker");
                    return;
                }
            }
        }

        debug!(
            topic = partition.topic(),
            partition = partition.partition(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Partition worker finished"
        );
    }

    fn commit_final(&self, committer: &dyn OffsetCommitter, revoked: &[TopicPartition]) {
        let offsets = self.ledger.committable(|partition| revoked.contains(partition));
        if offsets.is_empty() {
            return;
        }

        match committer.commit_offsets(&offsets) {
            Ok(()) => {
                self.ledger.mark_committed(&offsets);
                info!(
                    partitions = offsets.len(),
                    "Committed final positions of revoked partitions"
                );
            }
            Err(e) => {
                warn!(error = %e, "Failed to commit final positions of revoked partitions");
            }
        }
    }
}
