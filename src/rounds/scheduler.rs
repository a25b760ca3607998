use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::cluster::LeaderElector;
use crate::error::Result;
use crate::queue::{JobOpts, JobPayload, QueueHandle, RoundJob, TickJob};
use crate::rounds::store::RoundStore;

/// What one scheduler tick decided, mostly for logs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickOutcome {
    /// Stamp of the round started by this tick, if any.
    pub started: Option<u64>,
    /// Delay of the recheck job scheduled by this tick.
    pub recheck_delay: Duration,
}

/// Decides when a new round starts. Not a fixed-rate timer: each tick
/// re-enqueues a single delayed recheck job, so the cadence survives without
/// any standing timer and stops dead the moment no process re-arms it.
pub struct RoundScheduler {
    elector: Arc<LeaderElector>,
    rounds: Arc<dyn RoundStore>,
    queue: QueueHandle,
    min_round_length: Duration,
    do_clean: bool,
}

impl RoundScheduler {
    pub fn new(
        elector: Arc<LeaderElector>,
        rounds: Arc<dyn RoundStore>,
        queue: QueueHandle,
        min_round_length: Duration,
        do_clean: bool,
    ) -> Self {
        Self {
            elector,
            rounds,
            queue,
            min_round_length,
            do_clean,
        }
    }

    /// Leader-only startup: optionally wipe all queues and bookkeeping, then
    /// arm the recheck chain. An existing round is resumed passively (no new
    /// round now, the chain decides); with no history the chain starts
    /// immediately.
    pub async fn on_bootstrap(&self) -> Result<()> {
        if !self.elector.is_the_one() {
            tracing::debug!("Not the elected singleton, skipping scheduler bootstrap");
            return Ok(());
        }

        if self.do_clean {
            tracing::info!("Administrative reset: wiping queues and round bookkeeping");
            if let Err(e) = self.queue.wipe().await {
                tracing::error!(error = %e, "Failed wiping queues");
            }
            if let Err(e) = self.rounds.wipe_all().await {
                tracing::error!(error = %e, "Failed wiping round bookkeeping");
            }
        }

        match self.rounds.latest_round().await? {
            Some(round) => {
                tracing::info!(
                    stamp = round.stamp,
                    started_at = round.started_at,
                    complete = round.complete,
                    persisted = round.persisted,
                    "Resuming from existing round"
                );
                // The queue is process-local, so re-arm the chain instead of
                // assuming a delayed recheck survived the restart.
                let now = now_ms();
                let delay = self.recheck_delay(now, round.started_at);
                self.schedule_recheck(delay).await?;
            }
            None => {
                tracing::info!("No round history, starting distribution chain");
                self.queue_distribution().await?;
            }
        }
        Ok(())
    }

    /// One scheduler tick at the current wall clock.
    pub async fn queue_distribution(&self) -> Result<TickOutcome> {
        self.queue_distribution_at(now_ms()).await
    }

    /// One scheduler tick at time `now` (milliseconds): start a round when
    /// the minimum interval has elapsed, and always schedule the next
    /// recheck, recomputed against the just-updated round start.
    pub async fn queue_distribution_at(&self, now: u64) -> Result<TickOutcome> {
        let last_round = self.rounds.latest_round().await?;
        let mut last_start = last_round.map(|r| r.started_at).unwrap_or(0);
        let min = self.min_round_length.as_millis() as u64;

        let mut started = None;
        if now.saturating_sub(last_start) >= min {
            match self.start_round(now).await {
                Ok(()) => {
                    started = Some(now);
                    last_start = now;
                }
                Err(e) => {
                    // The next recheck catches up; never break the chain.
                    tracing::error!(stamp = now, error = %e, "Failed starting round");
                }
            }
        }

        let delay = self.recheck_delay(now, last_start);
        self.schedule_recheck(delay).await?;

        Ok(TickOutcome {
            started,
            recheck_delay: delay,
        })
    }

    async fn start_round(&self, stamp: u64) -> Result<()> {
        self.queue
            .enqueue(
                JobPayload::Round(RoundJob::Start { stamp }),
                JobOpts::default(),
            )
            .await?;
        self.rounds.upsert_round(stamp, stamp).await?;
        tracing::info!(stamp, "Round started");
        Ok(())
    }

    fn recheck_delay(&self, now: u64, last_start: u64) -> Duration {
        let min = self.min_round_length.as_millis() as u64;
        Duration::from_millis(min.saturating_sub(now.saturating_sub(last_start)))
    }

    async fn schedule_recheck(&self, delay: Duration) -> Result<()> {
        self.queue
            .enqueue(JobPayload::Tick(TickJob::Recheck), JobOpts::delayed(delay))
            .await?;
        tracing::info!(
            delay_s = delay.as_secs_f64(),
            "Scheduled distribution recheck"
        );
        Ok(())
    }
}

fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}
