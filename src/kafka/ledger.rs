//! Offset Ledger - what may be committed, and what must be delivered again
//!
//! Workers report one [`CommitSet`] per batch. The broker only stores a
//! position per partition, so the ledger turns commit sets into the highest
//! position below which every record was handled, and keeps it until the poll
//! loop manages to commit it.
//!
//! A batch with failures also requests a rewind: the poll loop seeks the
//! partition back to the lowest failed offset and fences the rewind at the
//! sequence number of the last batch it dispatched. Batches at or below the
//! fence were fetched before the seek and are skipped by the worker.
//!
//! Progress is keyed by ownership epoch: [`OffsetLedger::open`] starts a new
//! epoch when a partition is assigned, and outcomes reported under any other
//! epoch (a worker that outlived its revocation) are discarded.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::kafka::types::TopicPartition;

/// Outcome of one batch on one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitSet {
    partition: TopicPartition,
    succeeded: Vec<i64>,
    failed: Vec<i64>,
}

impl CommitSet {
    pub fn new(partition: TopicPartition) -> Self {
        Self {
            partition,
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn record_success(&mut self, offset: i64) {
        self.succeeded.push(offset);
    }

    pub fn record_failure(&mut self, offset: i64) {
        self.failed.push(offset);
    }

    pub fn partition(&self) -> &TopicPartition {
        &self.partition
    }

    /// Offsets whose handler invocation succeeded, in processing order.
    pub fn succeeded(&self) -> &[i64] {
        &self.succeeded
    }

    pub fn failed(&self) -> &[i64] {
        &self.failed
    }

    /// Position to commit for this batch: everything below it was handled.
    ///
    /// Never covers a failed offset. `None` when nothing below the first
    /// failure succeeded.
    pub fn commit_position(&self) -> Option<i64> {
        match self.redeliver_from() {
            Some(first_failed) => self
                .succeeded
                .iter()
                .any(|offset| *offset < first_failed)
                .then_some(first_failed),
            None => self.succeeded.iter().max().map(|offset| offset + 1),
        }
    }

    /// Lowest failed offset, where redelivery has to restart.
    pub fn redeliver_from(&self) -> Option<i64> {
        self.failed.iter().min().copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rewind {
    offset: i64,
    /// Sequence of the last batch dispatched before the seek was applied.
    fence: Option<u64>,
}

#[derive(Debug, Default)]
struct PartitionProgress {
    epoch: u64,
    ready: Option<i64>,
    committed: Option<i64>,
    rewind: Option<Rewind>,
}

impl PartitionProgress {
    fn pending_commit(&self) -> Option<i64> {
        match (self.ready, self.committed) {
            (Some(ready), Some(committed)) if ready <= committed => None,
            (ready, _) => ready,
        }
    }
}

#[derive(Debug, Default)]
pub struct OffsetLedger {
    partitions: DashMap<TopicPartition, PartitionProgress>,
    last_epoch: AtomicU64,
}

impl OffsetLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts fresh progress for a newly owned partition and returns its
    /// ownership epoch. Anything left from an earlier owner is dropped.
    pub fn open(&self, partition: &TopicPartition) -> u64 {
        let epoch = self.last_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.partitions.insert(
            partition.clone(),
            PartitionProgress {
                epoch,
                ..PartitionProgress::default()
            },
        );
        epoch
    }

    /// Folds a finished batch into the partition's progress.
    ///
    /// Returns `false`, dropping the outcome, when `epoch` is not the
    /// partition's current ownership epoch.
    pub fn record(&self, epoch: u64, commit_set: &CommitSet) -> bool {
        let partition = commit_set.partition();
        let Some(mut progress) = self
            .partitions
            .get_mut(partition)
            .filter(|progress| progress.epoch == epoch)
        else {
            warn!(
                topic = partition.topic(),
                partition = partition.partition(),
                epoch = epoch,
                "Discarding batch outcome of a revoked partition worker"
            );
            return false;
        };

        if let Some(position) = commit_set.commit_position() {
            if progress.ready.map_or(true, |ready| position > ready) {
                progress.ready = Some(position);
            }
        }

        if let Some(offset) = commit_set.redeliver_from() {
            debug!(
                topic = commit_set.partition().topic(),
                partition = commit_set.partition().partition(),
                offset = offset,
                "Requesting redelivery"
            );
            progress.rewind = Some(Rewind {
                offset,
                fence: None,
            });
        }
        true
    }

    /// Positions ready to commit for the partitions accepted by `filter`.
    pub fn committable<F>(&self, filter: F) -> Vec<(TopicPartition, i64)>
    where
        F: Fn(&TopicPartition) -> bool,
    {
        let mut offsets: Vec<(TopicPartition, i64)> = self
            .partitions
            .iter()
            .filter(|entry| filter(entry.key()))
            .filter_map(|entry| {
                entry
                    .value()
                    .pending_commit()
                    .map(|position| (entry.key().clone(), position))
            })
            .collect();
        offsets.sort();
        offsets
    }

    pub fn mark_committed(&self, offsets: &[(TopicPartition, i64)]) {
        for (partition, position) in offsets {
            if let Some(mut progress) = self.partitions.get_mut(partition) {
                if progress.committed.map_or(true, |committed| *position > committed) {
                    progress.committed = Some(*position);
                }
            }
        }
    }

    pub fn committed(&self, partition: &TopicPartition) -> Option<i64> {
        self.partitions
            .get(partition)
            .and_then(|progress| progress.committed)
    }

    /// Rewinds requested by workers that the poll loop has not applied yet.
    pub fn pending_rewinds(&self) -> Vec<(TopicPartition, i64)> {
        let mut rewinds: Vec<(TopicPartition, i64)> = self
            .partitions
            .iter()
            .filter_map(|entry| match entry.value().rewind {
                Some(Rewind { offset, fence: None }) => Some((entry.key().clone(), offset)),
                _ => None,
            })
            .collect();
        rewinds.sort();
        rewinds
    }

    /// Records that the partition was seeked back to `offset` after batch `fence`
    /// was dispatched. Ignored if a newer rewind replaced this one meanwhile.
    pub fn fence_rewind(&self, partition: &TopicPartition, offset: i64, fence: u64) {
        if let Some(mut progress) = self.partitions.get_mut(partition) {
            if let Some(rewind) = progress.rewind.as_mut() {
                if rewind.offset == offset && rewind.fence.is_none() {
                    rewind.fence = Some(fence);
                }
            }
        }
    }

    /// Decides whether a batch fetched with sequence `batch_seq` may be handled.
    ///
    /// Returns `false` while a rewind is pending or the batch predates the
    /// seek. The first batch fetched after the seek clears the rewind.
    pub fn admit(&self, partition: &TopicPartition, batch_seq: u64) -> bool {
        let Some(mut progress) = self.partitions.get_mut(partition) else {
            return true;
        };

        let rewind = progress.rewind;
        match rewind {
            None => true,
            Some(Rewind { fence: None, .. }) => false,
            Some(Rewind {
                fence: Some(fence), ..
            }) if batch_seq <= fence => false,
            Some(Rewind { offset, .. }) => {
                debug!(
                    topic = partition.topic(),
                    partition = partition.partition(),
                    offset = offset,
                    batch_seq = batch_seq,
                    "Redelivery reached worker, resuming"
                );
                progress.rewind = None;
                true
            }
        }
    }

    /// Drops all progress of a partition that is no longer owned.
    pub fn forget(&self, partition: &TopicPartition) {
        if self.partitions.remove(partition).is_some() {
            info!(
                topic = partition.topic(),
                partition = partition.partition(),
                "Cleared offset progress"
            );
        }
    }
}
