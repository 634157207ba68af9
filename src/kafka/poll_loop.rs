//! Poll Loop - the single fetch-and-dispatch loop of a consumer
//!
//! Each iteration:
//! 1. commits the positions workers have finished for owned partitions
//! 2. seeks partitions with failed records back for redelivery
//! 3. fetches a bounded batch and hands each partition's records to its
//!    worker, blocking while that worker's queue is full
//! 4. lets pending rebalances run
//!
//! The loop runs on a blocking thread; rebalance callbacks fire on that same
//! thread from inside the fetch, so ownership never changes mid-dispatch.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc::error::SendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::kafka::coordinator::RebalanceCoordinator;
use crate::kafka::types::{Fetch, Record, TopicPartition};
use crate::kafka::worker::PartitionBatch;
use crate::Result;

/// Stores consumed positions with the broker.
pub trait OffsetCommitter: Send + Sync {
    /// Commits `(partition, position)` pairs synchronously. A position is the
    /// offset of the next record to read.
    fn commit_offsets(&self, offsets: &[(TopicPartition, i64)]) -> Result<()>;
}

/// The consumer side of the log as seen by the poll loop.
pub trait LogClient: OffsetCommitter {
    /// Returns at most `max_records` records. May run rebalance callbacks.
    fn fetch(&self, max_records: usize, timeout: Duration) -> Fetch;

    /// Moves the fetch position of an owned partition.
    fn seek(&self, partition: &TopicPartition, offset: i64) -> Result<()>;

    /// Called once per iteration after dispatch. Clients that hold
    /// rebalances back while records are in hand release them here.
    fn allow_rebalance(&self) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSettings {
    pub max_poll_records: usize,
    pub poll_timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            max_poll_records: 500,
            poll_timeout: Duration::from_millis(500),
        }
    }
}

enum Dispatched {
    Queued,
    WorkerGone,
    Cancelled,
}

pub struct PollLoop<L: LogClient> {
    log: Arc<L>,
    coordinator: Arc<RebalanceCoordinator>,
    runtime: Handle,
    settings: PollSettings,
    /// Sequence of the last fetch that was dispatched
    seq: u64,
}

impl<L: LogClient> PollLoop<L> {
    pub fn new(
        log: Arc<L>,
        coordinator: Arc<RebalanceCoordinator>,
        runtime: Handle,
        settings: PollSettings,
    ) -> Self {
        Self {
            log,
            coordinator,
            runtime,
            settings,
            seq: 0,
        }
    }

    /// Runs until the client reports closed or `shutdown` is cancelled.
    ///
    /// Blocks the calling thread; run it with `spawn_blocking`.
    pub fn run(mut self, shutdown: CancellationToken) {
        info!(
            max_poll_records = self.settings.max_poll_records,
            poll_timeout_ms = self.settings.poll_timeout.as_millis() as u64,
            "Starting poll loop"
        );

        loop {
            if shutdown.is_cancelled() {
                info!("Shutdown requested, leaving poll loop");
                break;
            }

            self.commit_ready();
            self.apply_rewinds();

            let fetch = self
                .log
                .fetch(self.settings.max_poll_records, self.settings.poll_timeout);

            if fetch.closed {
                info!("Consumer closed, leaving poll loop");
                break;
            }

            for err in &fetch.errors {
                error!(
                    topic = err.topic.as_deref().unwrap_or("-"),
                    partition = err.partition.unwrap_or(-1),
                    error = %err.message,
                    "Fetch error"
                );
            }

            if !fetch.records.is_empty() {
                self.seq += 1;
                if !self.dispatch(fetch.into_partitions(), &shutdown) {
                    info!("Shutdown requested while dispatching, leaving poll loop");
                    break;
                }
            }

            self.log.allow_rebalance();
        }

        self.commit_ready();
        info!(fetches_dispatched = self.seq, "Poll loop stopped");
    }

    /// Commits what workers have finished on partitions still owned.
    fn commit_ready(&self) {
        let ledger = self.coordinator.ledger();
        let offsets = ledger.committable(|partition| self.coordinator.owns(partition));
        if offsets.is_empty() {
            return;
        }

        match self.log.commit_offsets(&offsets) {
            Ok(()) => {
                ledger.mark_committed(&offsets);
                debug!(partitions = offsets.len(), "Committed offsets");
            }
            Err(e) => {
                // positions stay ready and are retried next iteration
                error!(error = %e, "Failed to commit offsets");
            }
        }
    }

    fn apply_rewinds(&self) {
        let ledger = self.coordinator.ledger();
        for (partition, offset) in ledger.pending_rewinds() {
            if !self.coordinator.owns(&partition) {
                continue;
            }

            match self.log.seek(&partition, offset) {
                Ok(()) => {
                    ledger.fence_rewind(&partition, offset, self.seq);
                    info!(
                        topic = partition.topic(),
                        partition = partition.partition(),
                        offset = offset,
                        "Rewound partition for redelivery"
                    );
                }
                Err(e) => {
                    error!(
                        topic = partition.topic(),
                        partition = partition.partition(),
                        offset = offset,
                        error = %e,
                        "Failed to rewind partition"
                    );
                }
            }
        }
    }

    /// Hands every partition's records to its worker. Returns `false` if
    /// shutdown interrupted a blocked hand-off.
    fn dispatch(
        &self,
        partitions: BTreeMap<TopicPartition, Vec<Record>>,
        shutdown: &CancellationToken,
    ) -> bool {
        for (partition, records) in partitions {
            let Some(sender) = self.coordinator.sender_for(&partition) else {
                debug!(
                    topic = partition.topic(),
                    partition = partition.partition(),
                    records = records.len(),
                    "Dropping records of a partition that is not owned"
                );
                continue;
            };

            let count = records.len();
            let batch = PartitionBatch::new(self.seq, records);

            let dispatched = self.runtime.block_on(async {
                tokio::select! {
                    result = sender.send(batch) => match result {
                        Ok(()) => Dispatched::Queued,
                        Err(SendError(_)) => Dispatched::WorkerGone,
                    },
                    _ = shutdown.cancelled() => Dispatched::Cancelled,
                }
            });

            match dispatched {
                Dispatched::Queued => {}
                Dispatched::WorkerGone => {
                    warn!(
                        topic = partition.topic(),
                        partition = partition.partition(),
                        records = count,
                        "Partition worker stopped, dropping batch"
                    );
                }
                Dispatched::Cancelled => return false,
            }
        }
        true
    }
}
