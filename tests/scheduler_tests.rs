//! Round cadence: interval gating, recheck delay math and leader-only
//! bootstrap behavior.


use std::sync::Arc;
use std::time::Duration;

use rewards_controller::cluster::LeaderElector;
use rewards_controller::config::ControllerConfig;
use rewards_controller::queue::{JobPayload, RoundJob, TickJob};
use rewards_controller::rounds::{MemoryRoundStore, RoundScheduler, RoundStore};

use test_harness::{assert_eventually, spawn_engine, RecordingHandler};

const MINUTE_MS: u64 = 60_000;

struct SchedulerFixture {
    scheduler: RoundScheduler,
    rounds: Arc<MemoryRoundStore>,
    handler: Arc<RecordingHandler>,
    queue: rewards_controller::queue::QueueHandle,
    cancel: tokio_util::sync::CancellationToken,
}

fn fixture(local_leader: bool, do_clean: bool) -> SchedulerFixture {
    let config = ControllerConfig {
        local_leader,
        do_clean,
        ..Default::default()
    };
    let elector = Arc::new(LeaderElector::new(&config, None).unwrap());
    let rounds = Arc::new(MemoryRoundStore::new());
    let handler = Arc::new(RecordingHandler::new());
    let (queue, cancel, _task) = spawn_engine(handler.clone(), 1);

    let scheduler = RoundScheduler::new(
        elector,
        rounds.clone(),
        queue.clone(),
        Duration::from_millis(MINUTE_MS),
        config.do_clean,
    );
    SchedulerFixture {
        scheduler,
        rounds,
        handler,
        queue,
        cancel,
    }
}

#[tokio::test]
async fn first_tick_starts_a_round_immediately() {
    let fx = fixture(true, false);

    let outcome = fx.scheduler.queue_distribution_at(70_000).await.unwrap();

    assert_eq!(outcome.started, Some(70_000));
    // Recomputed against the round just started: the full interval.
    assert_eq!(outcome.recheck_delay, Duration::from_millis(MINUTE_MS));

    let round = fx.rounds.latest_round().await.unwrap().unwrap();
    assert_eq!(round.stamp, 70_000);
    assert_eq!(round.started_at, 70_000);
    assert!(!round.complete);

    assert_eventually(
        || async {
            fx.handler
                .seen()
                .iter()
                .any(|p| matches!(p, JobPayload::Round(RoundJob::Start { stamp: 70_000 })))
        },
        Duration::from_secs(5),
        "start-round job should be enqueued",
    )
    .await;
    fx.cancel.cancel();
}

#[tokio::test]
async fn tick_inside_the_interval_only_rechecks() {
    let fx = fixture(true, false);
    fx.rounds.upsert_round(10_000, 10_000).await.unwrap();

    let outcome = fx.scheduler.queue_distribution_at(40_000).await.unwrap();

    assert_eq!(outcome.started, None);
    // 60s interval minus the 30s already elapsed.
    assert_eq!(outcome.recheck_delay, Duration::from_millis(30_000));

    let round = fx.rounds.latest_round().await.unwrap().unwrap();
    assert_eq!(round.stamp, 10_000);
    fx.cancel.cancel();
}

#[tokio::test]
async fn tick_exactly_at_the_boundary_starts_a_round() {
    let fx = fixture(true, false);
    fx.rounds.upsert_round(10_000, 10_000).await.unwrap();

    let outcome = fx
        .scheduler
        .queue_distribution_at(10_000 + MINUTE_MS)
        .await
        .unwrap();
    assert_eq!(outcome.started, Some(10_000 + MINUTE_MS));
    fx.cancel.cancel();
}

#[tokio::test]
async fn bootstrap_without_history_starts_the_chain() {
    let fx = fixture(true, false);

    fx.scheduler.on_bootstrap().await.unwrap();

    assert!(fx.rounds.latest_round().await.unwrap().is_some());
    assert_eventually(
        || async {
            fx.handler
                .seen()
                .iter()
                .any(|p| matches!(p, JobPayload::Round(RoundJob::Start { .. })))
        },
        Duration::from_secs(5),
        "bootstrap should start the first round",
    )
    .await;
    fx.cancel.cancel();
}

#[tokio::test]
async fn bootstrap_with_recent_round_only_rearms_the_recheck() {
    let fx = fixture(true, false);
    let now = chrono::Utc::now().timestamp_millis() as u64;
    fx.rounds.upsert_round(now, now).await.unwrap();

    fx.scheduler.on_bootstrap().await.unwrap();

    // No new round, just a delayed recheck keeping the cadence alive.
    let round = fx.rounds.latest_round().await.unwrap().unwrap();
    assert_eq!(round.stamp, now);
    let counts = fx.queue.counts().await.unwrap();
    assert_eq!(counts.delayed, 1);
    assert!(fx
        .handler
        .seen()
        .iter()
        .all(|p| !matches!(p, JobPayload::Round(RoundJob::Start { .. }))));
    fx.cancel.cancel();
}

#[tokio::test]
async fn bootstrap_is_skipped_off_the_singleton() {
    let fx = fixture(false, false);

    fx.scheduler.on_bootstrap().await.unwrap();

    assert!(fx.rounds.latest_round().await.unwrap().is_none());
    let counts = fx.queue.counts().await.unwrap();
    assert_eq!(counts.delayed + counts.active + counts.waiting_children, 0);
    fx.cancel.cancel();
}

#[tokio::test]
async fn clean_bootstrap_wipes_history_first() {
    let fx = fixture(true, true);
    fx.rounds.upsert_round(10_000, 10_000).await.unwrap();
    fx.rounds
        .mark_round(10_000, Some(true), Some(true))
        .await
        .unwrap();

    fx.scheduler.on_bootstrap().await.unwrap();

    // Old bookkeeping is gone; a fresh round replaces it.
    let round = fx.rounds.latest_round().await.unwrap().unwrap();
    assert_ne!(round.stamp, 10_000);
    assert!(!round.complete && !round.persisted);
    fx.cancel.cancel();
}

#[tokio::test]
async fn recheck_job_drives_the_next_tick() {
    let fx = fixture(true, false);

    // A recheck delivered through the queue routes back into the scheduler
    // via the router; here the recording handler just proves delivery.
    fx.scheduler.queue_distribution_at(70_000).await.unwrap();
    assert_eventually(
        || async {
            fx.handler
                .seen()
                .iter()
                .any(|p| matches!(p, JobPayload::Tick(TickJob::Recheck)))
                || fx.queue.counts().await.unwrap().delayed > 0
        },
        Duration::from_secs(5),
        "a recheck must always be scheduled",
    )
    .await;
    fx.cancel.cancel();
}
