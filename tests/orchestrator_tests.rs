//! Full round DAG through the real router and engine: scoring batches,
//! the completion barrier, finalization and snapshot persistence.


use std::time::Duration;

use rewards_controller::config::ControllerConfig;
use rewards_controller::error::ControllerError;
use rewards_controller::rounds::RoundStore;

use test_harness::{assert_eventually, build_stack, entry, snapshot, MockBackend, TestStack};

const STAMP: u64 = 70_000;

fn config(is_live: bool) -> ControllerConfig {
    ControllerConfig {
        local_leader: true,
        is_live,
        scores_per_batch: 2,
        ..Default::default()
    }
}

/// Wait until the round flow fully drained: every DAG node settled, only the
/// delayed recheck remains in the engine.
async fn wait_for_drain(stack: &TestStack) {
    assert_eventually(
        || async {
            let counts = stack.queue.counts().await.unwrap();
            counts.active == 0 && counts.waiting_children == 0
        },
        Duration::from_secs(10),
        "round flow should settle",
    )
    .await;
}

#[tokio::test]
async fn successful_round_completes_and_persists() {
    let backend = MockBackend::new()
        .with_scores(vec![entry("0xA", "0x1"), entry("0xA", "0x2"), entry("0xB", "0x3")])
        .with_snapshot(snapshot(STAMP));
    let stack = build_stack(backend, config(true));

    let outcome = stack.scheduler.queue_distribution_at(STAMP).await.unwrap();
    assert_eq!(outcome.started, Some(STAMP));

    assert_eventually(
        || async {
            stack
                .rounds
                .latest_round()
                .await
                .unwrap()
                .map(|r| r.persisted)
                .unwrap_or(false)
        },
        Duration::from_secs(10),
        "round should end up persisted",
    )
    .await;

    // Colocated beneficiary batching: [A, A] then [B].
    let mut batches = stack.backend.submitted_batches();
    batches.sort_unstable();
    assert_eq!(batches, vec![1, 2]);
    assert_eq!(stack.backend.finalize_calls(), 1);
    assert_eq!(stack.backend.fetch_calls(), 1);
    assert_eq!(stack.backend.upload_calls(), 1);

    let round = stack.rounds.latest_round().await.unwrap().unwrap();
    assert!(round.complete && round.persisted);
    stack.shutdown();
}

#[tokio::test]
async fn zero_successful_batches_never_finalizes() {
    let backend = MockBackend::new()
        .with_scores(vec![entry("0xA", "0x1"), entry("0xB", "0x2")])
        .with_submit_script(vec![Ok(false), Ok(false)])
        .with_snapshot(snapshot(STAMP));
    let stack = build_stack(backend, config(true));

    stack.scheduler.queue_distribution_at(STAMP).await.unwrap();
    assert_eventually(
        || async { stack.backend.submitted_batches().len() == 2 },
        Duration::from_secs(10),
        "both batches should be attempted",
    )
    .await;
    wait_for_drain(&stack).await;

    assert_eq!(stack.backend.finalize_calls(), 0);
    assert_eq!(stack.backend.fetch_calls(), 0);
    assert_eq!(stack.backend.upload_calls(), 0);
    let round = stack.rounds.latest_round().await.unwrap().unwrap();
    assert!(!round.complete && !round.persisted);
    stack.shutdown();
}

#[tokio::test]
async fn partial_batch_success_still_finalizes() {
    let backend = MockBackend::new()
        .with_scores(vec![entry("0xA", "0x1"), entry("0xB", "0x2")])
        .with_submit_script(vec![
            Ok(true),
            Err(ControllerError::Business("scorer offline".to_string())),
        ])
        .with_snapshot(snapshot(STAMP));
    let stack = build_stack(backend, config(true));

    stack.scheduler.queue_distribution_at(STAMP).await.unwrap();
    assert_eventually(
        || async {
            stack
                .rounds
                .latest_round()
                .await
                .unwrap()
                .map(|r| r.complete)
                .unwrap_or(false)
        },
        Duration::from_secs(10),
        "one good batch is enough to finalize the round",
    )
    .await;

    assert_eq!(stack.backend.finalize_calls(), 1);
    stack.shutdown();
}

#[tokio::test]
async fn snapshot_stamp_mismatch_skips_persistence() {
    let backend = MockBackend::new()
        .with_scores(vec![entry("0xA", "0x1")])
        .with_snapshot(snapshot(STAMP - 1));
    let stack = build_stack(backend, config(true));

    stack.scheduler.queue_distribution_at(STAMP).await.unwrap();
    assert_eventually(
        || async { stack.backend.fetch_calls() == 1 },
        Duration::from_secs(10),
        "persist job should look the snapshot up",
    )
    .await;
    wait_for_drain(&stack).await;

    assert_eq!(stack.backend.upload_calls(), 0);
    let round = stack.rounds.latest_round().await.unwrap().unwrap();
    assert!(round.complete);
    assert!(!round.persisted);
    stack.shutdown();
}

#[tokio::test]
async fn missing_snapshot_skips_persistence() {
    let backend = MockBackend::new().with_scores(vec![entry("0xA", "0x1")]);
    let stack = build_stack(backend, config(true));

    stack.scheduler.queue_distribution_at(STAMP).await.unwrap();
    assert_eventually(
        || async { stack.backend.fetch_calls() == 1 },
        Duration::from_secs(10),
        "persist job should look the snapshot up",
    )
    .await;
    wait_for_drain(&stack).await;

    assert_eq!(stack.backend.upload_calls(), 0);
    assert!(!stack.rounds.latest_round().await.unwrap().unwrap().persisted);
    stack.shutdown();
}

#[tokio::test]
async fn not_live_skips_the_upload() {
    let backend = MockBackend::new()
        .with_scores(vec![entry("0xA", "0x1")])
        .with_snapshot(snapshot(STAMP));
    let stack = build_stack(backend, config(false));

    stack.scheduler.queue_distribution_at(STAMP).await.unwrap();
    assert_eventually(
        || async { stack.backend.fetch_calls() == 1 },
        Duration::from_secs(10),
        "persist job should run its checks",
    )
    .await;
    wait_for_drain(&stack).await;

    assert_eq!(stack.backend.upload_calls(), 0);
    let round = stack.rounds.latest_round().await.unwrap().unwrap();
    assert!(round.complete);
    assert!(!round.persisted);
    stack.shutdown();
}

#[tokio::test]
async fn empty_score_list_still_runs_the_flow() {
    let backend = MockBackend::new().with_snapshot(snapshot(STAMP));
    let stack = build_stack(backend, config(true));

    stack.scheduler.queue_distribution_at(STAMP).await.unwrap();
    wait_for_drain(&stack).await;

    // No batches, so the barrier settles with zero children and the round
    // stays incomplete.
    assert!(stack.backend.submitted_batches().is_empty());
    assert_eq!(stack.backend.finalize_calls(), 0);
    let round = stack.rounds.latest_round().await.unwrap().unwrap();
    assert!(!round.complete);
    stack.shutdown();
}
