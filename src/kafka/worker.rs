//! Partition Worker - Dedicated worker for the records of a single partition
//!
//! Each owned partition gets its own task with a bounded inbound queue:
//! 1. Records of a partition are handled strictly in arrival order
//! 2. Partitions are handled in parallel with each other
//! 3. A full queue blocks the poll loop, which is the only backpressure
//!
//! Lifecycle: `Created -> Running -> Draining -> Stopped`. Quitting is an
//! explicit one-shot signal; the task answers with a one-shot completion
//! acknowledgment once the batch in flight (if any) is finished.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::kafka::handler::RecordHandler;
use crate::kafka::ledger::{CommitSet, OffsetLedger};
use crate::kafka::types::{Record, TopicPartition};

/// Records of one partition from one fetch.
#[derive(Debug)]
pub struct PartitionBatch {
    /// Sequence number of the fetch the records came from
    pub seq: u64,
    pub records: Vec<Record>,
}

impl PartitionBatch {
    pub fn new(seq: u64, records: Vec<Record>) -> Self {
        Self { seq, records }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Running,
    Draining,
    Stopped,
}

/// Handle to a running worker, held in the ownership map.
pub struct PartitionWorker {
    partition: TopicPartition,
    sender: mpsc::Sender<PartitionBatch>,
    quit: oneshot::Sender<()>,
    done: oneshot::Receiver<()>,
    state: watch::Receiver<WorkerState>,
}

impl PartitionWorker {
    /// Creates the worker and schedules its loop on `runtime` immediately.
    ///
    /// `epoch` is the ownership epoch the ledger issued for this assignment.
    pub fn spawn(
        partition: TopicPartition,
        handler: Arc<dyn RecordHandler>,
        ledger: Arc<OffsetLedger>,
        epoch: u64,
        ctx: CancellationToken,
        queue_capacity: usize,
        runtime: &Handle,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
        let (quit_tx, quit_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        let (state_tx, state_rx) = watch::channel(WorkerState::Created);

        let task = WorkerTask {
            partition: partition.clone(),
            handler,
            ledger,
            epoch,
            ctx,
            state: state_tx,
        };
        runtime.spawn(task.run(receiver, quit_rx, done_tx));

        Self {
            partition,
            sender,
            quit: quit_tx,
            done: done_rx,
            state: state_rx,
        }
    }

    pub fn partition(&self) -> &TopicPartition {
        &self.partition
    }

    /// A clone of the inbound queue, so callers can await capacity without
    /// holding a guard on the ownership map.
    pub fn sender(&self) -> mpsc::Sender<PartitionBatch> {
        self.sender.clone()
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Signals quit and hands back the completion acknowledgment.
    pub fn quit(self) -> Completion {
        // an already finished task has dropped its receiver
        let _ = self.quit.send(());
        Completion {
            partition: self.partition,
            done: self.done,
            state: self.state,
        }
    }
}

/// Completion acknowledgment of a worker that was told to quit.
pub struct Completion {
    partition: TopicPartition,
    done: oneshot::Receiver<()>,
    state: watch::Receiver<WorkerState>,
}

impl Completion {
    pub fn partition(&self) -> &TopicPartition {
        &self.partition
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Resolves once the worker stopped. A task that died without
    /// acknowledging (panic, runtime shutdown) counts as stopped too.
    pub async fn wait(self) {
        let _ = self.done.await;
    }
}

struct WorkerTask {
    partition: TopicPartition,
    handler: Arc<dyn RecordHandler>,
    ledger: Arc<OffsetLedger>,
    epoch: u64,
    ctx: CancellationToken,
    state: watch::Sender<WorkerState>,
}

impl WorkerTask {
    async fn run(
        self,
        mut receiver: mpsc::Receiver<PartitionBatch>,
        mut quit: oneshot::Receiver<()>,
        done: oneshot::Sender<()>,
    ) {
        self.state.send_replace(WorkerState::Running);
        info!(
            "Starting partition worker for {}:{}",
            self.partition.topic(),
            self.partition.partition()
        );

        loop {
            tokio::select! {
                biased;

                _ = &mut quit => break,

                batch = receiver.recv() => {
                    let Some(batch) = batch else { break };

                    let processing = self.process_batch(batch);
                    tokio::pin!(processing);

                    tokio::select! {
                        _ = &mut processing => {}
                        _ = &mut quit => {
                            self.state.send_replace(WorkerState::Draining);
                            debug!(
                                topic = self.partition.topic(),
                                partition = self.partition.partition(),
                                "Quit received mid-batch, finishing batch in flight"
                            );
                            processing.await;
                            break;
                        }
                    }
                }
            }
        }

        self.state.send_replace(WorkerState::Draining);
        // queued batches are dropped; their offsets were never committed
        drop(receiver);
        self.state.send_replace(WorkerState::Stopped);

        info!(
            "Partition worker for {}:{} stopped",
            self.partition.topic(),
            self.partition.partition()
        );
        let _ = done.send(());
    }

    async fn process_batch(&self, batch: PartitionBatch) -> Option<CommitSet> {
        if !self.ledger.admit(&self.partition, batch.seq) {
            debug!(
                topic = self.partition.topic(),
                partition = self.partition.partition(),
                batch_seq = batch.seq,
                records = batch.records.len(),
                "Skipping batch fetched before redelivery"
            );
            return None;
        }

        let mut commit_set = CommitSet::new(self.partition.clone());

        for record in batch.records {
            let offset = record.offset;
            let outcome = AssertUnwindSafe(self.handler.handle(&self.ctx, record.payload))
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(())) => commit_set.record_success(offset),
                Ok(Err(e)) => {
                    error!(
                        topic = self.partition.topic(),
                        partition = self.partition.partition(),
                        offset = offset,
                        error = %e,
                        "Handler failed, record will be redelivered"
                    );
                    commit_set.record_failure(offset);
                }
                Err(_) => {
                    error!(
                        topic = self.partition.topic(),
                        partition = self.partition.partition(),
                        offset = offset,
                        "Handler panicked, record will be redelivered"
                    );
                    commit_set.record_failure(offset);
                }
            }
        }

        self.ledger.record(self.epoch, &commit_set);

        debug!(
            topic = self.partition.topic(),
            partition = self.partition.partition(),
            batch_seq = batch.seq,
            succeeded = commit_set.succeeded().len(),
            failed = commit_set.failed().len(),
            "Batch processed"
        );

        Some(commit_set)
    }
}
