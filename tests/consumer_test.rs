mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{tp, Harness, TOPIC};
use ticket_relay::kafka::test_utils::{wait_until, RecordingHandler};
use ticket_relay::kafka::{TopicPartition, WorkerSettings, WorkerState};
use tokio::sync::Semaphore;

const WAIT: Duration = Duration::from_secs(5);

fn positions(commits: &[Vec<(TopicPartition, i64)>], partition: i32) -> Vec<i64> {
    commits
        .iter()
        .flatten()
        .filter(|(p, _)| *p == tp(partition))
        .map(|(_, position)| *position)
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_assignment_creates_one_worker_per_partition() {
    let handler = Arc::new(RecordingHandler::new());
    let mut harness = Harness::start(handler);

    harness.log.schedule_assign(vec![tp(0), tp(1), tp(2)]);
    harness.log.schedule_assign(vec![tp(1)]);

    let coordinator = harness.coordinator.clone();
    // both assignments applied
    assert!(wait_until(|| coordinator.generation() == 2, WAIT).await);

    assert_eq!(coordinator.owned(), vec![tp(0), tp(1), tp(2)]);
    for partition in 0..3 {
        let running = || coordinator.worker_state(&tp(partition)) == Some(WorkerState::Running);
        assert!(wait_until(running, WAIT).await);
    }

    harness.close().await;
    assert!(harness.coordinator.owned().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_partition_offsets_are_handled_in_order() {
    let handler = Arc::new(RecordingHandler::new());
    let mut harness = Harness::start_with(handler.clone(), WorkerSettings::default(), 7);

    harness.log.schedule_assign(vec![tp(0), tp(1)]);
    let coordinator = harness.coordinator.clone();
    assert!(wait_until(|| coordinator.owned().len() == 2, WAIT).await);

    for offset in 0..40 {
        harness.log.append(TOPIC, 0, format!("0:{offset}"));
        harness.log.append(TOPIC, 1, format!("1:{offset}"));
    }

    let log = harness.log.clone();
    assert!(
        wait_until(
            || log.committed(&tp(0)) == Some(40) && log.committed(&tp(1)) == Some(40),
            WAIT
        )
        .await
    );

    let seen = handler.seen();
    for partition in 0..2 {
        let prefix = format!("{partition}:");
        let offsets: Vec<i64> = seen
            .iter()
            .filter_map(|payload| payload.strip_prefix(&prefix))
            .map(|offset| offset.parse().unwrap())
            .collect();
        assert_eq!(offsets, (0..40).collect::<Vec<i64>>());
    }

    // commit positions only ever move forward
    let commits = harness.log.commits();
    for partition in 0..2 {
        let committed = positions(&commits, partition);
        assert!(committed.windows(2).all(|w| w[0] < w[1]));
    }

    harness.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_record_is_redelivered_before_later_commits() {
    let handler = Arc::new(RecordingHandler::new().failing_once(&["1"]));
    let mut harness = Harness::start(handler.clone());

    harness.log.schedule_assign(vec![tp(0), tp(1)]);
    let coordinator = harness.coordinator.clone();
    assert!(wait_until(|| coordinator.owned().len() == 2, WAIT).await);

    harness.log.append_all(TOPIC, 0, ["0", "1", "2"]);

    let log = harness.log.clone();
    assert!(wait_until(|| log.committed(&tp(0)) == Some(3), WAIT).await);

    let seen = handler.seen();
    assert_eq!(seen.iter().filter(|p| *p == "1").count(), 2);
    assert_eq!(seen[..3], ["0", "1", "2"]);
    assert_eq!(harness.log.seeks(), vec![(tp(0), 1)]);

    // nothing past the failed record was committed before it succeeded
    let committed = positions(&harness.log.commits(), 0);
    assert!(committed.iter().all(|position| *position == 1 || *position == 3));
    assert_eq!(committed.last(), Some(&3));

    harness.log.append(TOPIC, 0, "3");
    assert!(wait_until(|| log.committed(&tp(0)) == Some(4), WAIT).await);
    assert_eq!(handler.seen().last().map(String::as_str), Some("3"));

    harness.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_revoke_waits_for_batch_in_flight() {
    let gate = Arc::new(Semaphore::new(0));
    let handler = Arc::new(RecordingHandler::new().gated(gate.clone()));
    let mut harness = Harness::start_with(handler.clone(), WorkerSettings::default(), 3);

    harness.log.schedule_assign(vec![tp(0), tp(1)]);
    let coordinator = harness.coordinator.clone();
    assert!(wait_until(|| coordinator.owned().len() == 2, WAIT).await);

    // first batch [0, 1, 2] blocks in the handler, the second one is queued
    harness.log.append_all(TOPIC, 0, ["0", "1", "2", "3", "4", "5"]);
    assert!(wait_until(|| handler.entered() == 1, WAIT).await);
    let log = harness.log.clone();
    assert!(wait_until(|| log.position(&tp(0)) == Some(6), WAIT).await);

    harness.log.schedule_revoke(vec![tp(0)]);
    assert!(wait_until(|| !coordinator.owns(&tp(0)), WAIT).await);

    // the revoke is still blocked on the worker
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.log.position(&tp(0)), Some(6));
    assert!(harness.log.committed(&tp(0)).is_none());

    gate.add_permits(100);
    assert!(wait_until(|| log.position(&tp(0)).is_none(), WAIT).await);

    // the in-flight batch finished and was committed, the queued one never ran
    assert_eq!(handler.seen(), vec!["0", "1", "2"]);
    assert_eq!(harness.log.committed(&tp(0)), Some(3));

    // no handler invocation for the partition until it is assigned again
    harness.log.append(TOPIC, 0, "6");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handler.seen(), vec!["0", "1", "2"]);

    harness.log.schedule_assign(vec![tp(0)]);
    assert!(wait_until(|| handler.seen().len() == 7, WAIT).await);
    assert_eq!(handler.seen()[3..], ["3", "4", "5", "6"]);

    harness.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_with_stalled_worker_does_not_hang() {
    let gate = Arc::new(Semaphore::new(0));
    let handler = Arc::new(RecordingHandler::new().gated(gate));
    let settings = WorkerSettings {
        queue_capacity: 1,
        drain_timeout: Some(Duration::from_millis(200)),
    };
    let mut harness = Harness::start_with(handler.clone(), settings, 1);

    harness.log.schedule_assign(vec![tp(0)]);
    let coordinator = harness.coordinator.clone();
    assert!(wait_until(|| coordinator.owns(&tp(0)), WAIT).await);

    harness.log.append_all(TOPIC, 0, ["0", "1", "2", "3"]);
    // one batch in the handler, one queued, the loop blocked on the third
    let log = harness.log.clone();
    assert!(wait_until(|| log.position(&tp(0)) == Some(3), WAIT).await);

    let started = Instant::now();
    harness.close().await;

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(handler.entered(), 1);
    assert!(harness.coordinator.owned().is_empty());
    assert!(harness.log.committed(&tp(0)).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_always_failing_record_is_never_committed() {
    let handler = Arc::new(RecordingHandler::new().failing_always(&["1"]));
    let mut harness = Harness::start(handler.clone());

    harness.log.schedule_assign(vec![tp(0)]);
    let coordinator = harness.coordinator.clone();
    assert!(wait_until(|| coordinator.owns(&tp(0)), WAIT).await);

    harness.log.append_all(TOPIC, 0, ["0", "1", "2"]);

    // redelivered again and again, committed up to the poison record only
    assert!(wait_until(|| handler.seen().iter().filter(|p| *p == "1").count() >= 3, WAIT).await);
    assert_eq!(harness.log.committed(&tp(0)), Some(1));

    harness.close().await;
    assert_eq!(harness.log.committed(&tp(0)), Some(1));
}
