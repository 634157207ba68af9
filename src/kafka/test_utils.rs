//! In-memory stand-ins for exercising the consumer engine without a broker.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::kafka::coordinator::RebalanceCoordinator;
use crate::kafka::handler::RecordHandler;
use crate::kafka::poll_loop::{LogClient, OffsetCommitter};
use crate::kafka::types::{Fetch, FetchError, Record, TopicPartition};
use crate::{Error, Result};

/// Polls `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handler that remembers every payload, optionally failing some of them
/// and optionally waiting on a gate before each record.
#[derive(Default)]
pub struct RecordingHandler {
    seen: Mutex<Vec<String>>,
    fail_once: Mutex<HashSet<String>>,
    fail_always: HashSet<String>,
    gate: Option<Arc<Semaphore>>,
    entered: AtomicUsize,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the first attempt of each listed payload.
    pub fn failing_once(self, payloads: &[&str]) -> Self {
        *lock(&self.fail_once) = payloads.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn failing_always(mut self, payloads: &[&str]) -> Self {
        self.fail_always = payloads.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Every record takes one permit from `gate` before it completes.
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Payloads whose handling finished, in completion order.
    pub fn seen(&self) -> Vec<String> {
        lock(&self.seen).clone()
    }

    /// Number of invocations started, including ones still waiting on the gate.
    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordHandler for RecordingHandler {
    async fn handle(&self, _ctx: &CancellationToken, payload: Bytes) -> anyhow::Result<()> {
        let text = String::from_utf8_lossy(&payload).into_owned();
        self.entered.fetch_add(1, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            gate.acquire().await?.forget();
        }

        lock(&self.seen).push(text.clone());

        if self.fail_always.contains(&text) || lock(&self.fail_once).remove(&text) {
            anyhow::bail!("rejected payload {text}");
        }
        Ok(())
    }
}

enum ScriptedRebalance {
    Assign(Vec<TopicPartition>),
    Revoke(Vec<TopicPartition>),
}

#[derive(Default)]
struct MemoryState {
    log: BTreeMap<TopicPartition, Vec<Bytes>>,
    /// Fetch positions of assigned partitions
    positions: BTreeMap<TopicPartition, i64>,
    committed: BTreeMap<TopicPartition, i64>,
    commits: Vec<Vec<(TopicPartition, i64)>>,
    rejected_commits: Vec<Vec<(TopicPartition, i64)>>,
    commit_failures: usize,
    fetch_errors: Vec<FetchError>,
    seeks: Vec<(TopicPartition, i64)>,
    rebalances: VecDeque<ScriptedRebalance>,
    closed: bool,
}

/// A log held in memory. Rebalances are scripted and take effect only when
/// the poll loop allows them, between iterations.
pub struct MemoryLog {
    coordinator: Arc<RebalanceCoordinator>,
    runtime: Handle,
    state: Mutex<MemoryState>,
}

impl MemoryLog {
    pub fn new(coordinator: Arc<RebalanceCoordinator>, runtime: Handle) -> Self {
        Self {
            coordinator,
            runtime,
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Appends a record and returns its offset.
    pub fn append(&self, topic: &str, partition: i32, payload: impl Into<Bytes>) -> i64 {
        let mut state = lock(&self.state);
        let records = state
            .log
            .entry(TopicPartition::new(topic, partition))
            .or_default();
        records.push(payload.into());
        records.len() as i64 - 1
    }

    /// Appends several records at once, so a single fetch can see all of them.
    pub fn append_all<I, P>(&self, topic: &str, partition: i32, payloads: I)
    where
        I: IntoIterator<Item = P>,
        P: Into<Bytes>,
    {
        let mut state = lock(&self.state);
        state
            .log
            .entry(TopicPartition::new(topic, partition))
            .or_default()
            .extend(payloads.into_iter().map(Into::into));
    }

    pub fn schedule_assign(&self, partitions: Vec<TopicPartition>) {
        lock(&self.state)
            .rebalances
            .push_back(ScriptedRebalance::Assign(partitions));
    }

    pub fn schedule_revoke(&self, partitions: Vec<TopicPartition>) {
        lock(&self.state)
            .rebalances
            .push_back(ScriptedRebalance::Revoke(partitions));
    }

    /// Successful commits, in order.
    pub fn commits(&self) -> Vec<Vec<(TopicPartition, i64)>> {
        lock(&self.state).commits.clone()
    }

    /// Rejects the next `count` commit attempts.
    pub fn fail_next_commits(&self, count: usize) {
        lock(&self.state).commit_failures = count;
    }

    pub fn rejected_commits(&self) -> Vec<Vec<(TopicPartition, i64)>> {
        lock(&self.state).rejected_commits.clone()
    }

    /// Hands `error` out with the next fetch.
    pub fn inject_fetch_error(&self, error: FetchError) {
        lock(&self.state).fetch_errors.push(error);
    }

    pub fn pending_fetch_errors(&self) -> usize {
        lock(&self.state).fetch_errors.len()
    }

    pub fn committed(&self, partition: &TopicPartition) -> Option<i64> {
        lock(&self.state).committed.get(partition).copied()
    }

    pub fn seeks(&self) -> Vec<(TopicPartition, i64)> {
        lock(&self.state).seeks.clone()
    }

    pub fn position(&self, partition: &TopicPartition) -> Option<i64> {
        lock(&self.state).positions.get(partition).copied()
    }

    pub fn close(&self) {
        lock(&self.state).closed = true;
    }
}

impl OffsetCommitter for MemoryLog {
    fn commit_offsets(&self, offsets: &[(TopicPartition, i64)]) -> Result<()> {
        let mut state = lock(&self.state);
        if state.commit_failures > 0 {
            state.commit_failures -= 1;
            state.rejected_commits.push(offsets.to_vec());
            return Err(Error::Commit("coordinator not available".to_string()));
        }

        for (partition, position) in offsets {
            state.committed.insert(partition.clone(), *position);
        }
        state.commits.push(offsets.to_vec());
        Ok(())
    }
}

impl LogClient for MemoryLog {
    fn fetch(&self, max_records: usize, timeout: Duration) -> Fetch {
        let mut state = lock(&self.state);
        if state.closed {
            return Fetch::closed();
        }

        let errors = std::mem::take(&mut state.fetch_errors);
        let MemoryState { log, positions, .. } = &mut *state;
        let mut records = Vec::new();
        for (partition, position) in positions.iter_mut() {
            let Some(entries) = log.get(partition) else {
                continue;
            };
            while records.len() < max_records && (*position as usize) < entries.len() {
                records.push(Record::new(
                    partition.topic(),
                    partition.partition(),
                    *position,
                    entries[*position as usize].clone(),
                ));
                *position += 1;
            }
        }
        drop(state);

        if records.is_empty() && errors.is_empty() {
            std::thread::sleep(timeout.min(Duration::from_millis(10)));
        }

        Fetch {
            records,
            errors,
            closed: false,
        }
    }

    fn seek(&self, partition: &TopicPartition, offset: i64) -> Result<()> {
        let mut state = lock(&self.state);
        state.seeks.push((partition.clone(), offset));
        if let Some(position) = state.positions.get_mut(partition) {
            *position = offset;
        }
        Ok(())
    }

    fn allow_rebalance(&self) {
        let pending: Vec<ScriptedRebalance> = lock(&self.state).rebalances.drain(..).collect();

        for rebalance in pending {
            match rebalance {
                ScriptedRebalance::Assign(partitions) => {
                    {
                        let mut state = lock(&self.state);
                        for partition in &partitions {
                            // resume from the committed position, else from the end
                            let start = state.committed.get(partition).copied().unwrap_or_else(|| {
                                state.log.get(partition).map_or(0, |records| records.len() as i64)
                            });
                            state.positions.insert(partition.clone(), start);
                        }
                    }
                    self.coordinator.assign(&partitions);
                }
                ScriptedRebalance::Revoke(partitions) => {
                    self.runtime
                        .block_on(self.coordinator.revoke(&partitions, Some(self)));
                    let mut state = lock(&self.state);
                    for partition in &partitions {
                        state.positions.remove(partition);
                    }
                }
            }
        }
    }
}
