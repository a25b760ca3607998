//! Per-round job DAG: N score batches joined by a completion barrier, then a
//! persistence root.
//!
//! Round progress: Started → Scoring → Completed → Persisted. A stalled
//! round is abandoned, never retried as a whole; the next scheduled round
//! supersedes it.

use std::sync::Arc;

use async_trait::async_trait;

use crate::backend::{RewardsBackend, ScoreEntry};
use crate::error::Result;
use crate::queue::{
    FlowNode, Job, JobHandler, JobPayload, JobResult, QueueHandle, RoundJob, TickJob,
};
use crate::rounds::batch::group_score_jobs;
use crate::rounds::scheduler::RoundScheduler;
use crate::rounds::store::RoundStore;

pub struct RoundOrchestrator {
    backend: Arc<dyn RewardsBackend>,
    rounds: Arc<dyn RoundStore>,
    queue: QueueHandle,
    scores_per_batch: usize,
    is_live: bool,
}

impl RoundOrchestrator {
    pub fn new(
        backend: Arc<dyn RewardsBackend>,
        rounds: Arc<dyn RoundStore>,
        queue: QueueHandle,
        scores_per_batch: usize,
        is_live: bool,
    ) -> Self {
        Self {
            backend,
            rounds,
            queue,
            scores_per_batch,
            is_live,
        }
    }

    /// DAG for round `stamp`: PersistRound ← CompleteRound ← N× AddScores.
    pub fn round_flow(stamp: u64, score_groups: Vec<Vec<ScoreEntry>>) -> FlowNode {
        let total = score_groups.len();
        let batches = score_groups
            .into_iter()
            .map(|scores| FlowNode::new(JobPayload::Round(RoundJob::AddScores { stamp, scores })))
            .collect();

        FlowNode::new(JobPayload::Round(RoundJob::Persist { stamp })).with_children(vec![
            FlowNode::new(JobPayload::Round(RoundJob::Complete { stamp, total }))
                .with_children(batches),
        ])
    }

    /// Compute scores, batch them, submit the round DAG. Errors propagate:
    /// no parent aggregates this job, so queue-level retry applies.
    pub async fn start_round(&self, stamp: u64) -> Result<JobResult> {
        let scores = self.backend.compute_current_scores(stamp).await?;
        let groups = group_score_jobs(&scores, self.scores_per_batch);

        tracing::info!(
            stamp,
            scores = scores.len(),
            batches = groups.len(),
            "Starting round distribution"
        );

        self.queue
            .submit_flow(Self::round_flow(stamp, groups))
            .await?;
        Ok(JobResult::Done(true))
    }

    /// Forward one batch to the external scorer. This boundary never fails:
    /// every error becomes `result: false` so the completion barrier is
    /// never blocked by an unhandled exception.
    pub async fn add_scores(&self, stamp: u64, scores: &[ScoreEntry]) -> JobResult {
        tracing::info!(stamp, scores = scores.len(), "Adding score batch");

        let result = match self.backend.submit_score_batch(stamp, scores).await {
            Ok(accepted) => {
                if !accepted {
                    tracing::warn!(stamp, "Score batch rejected by backend");
                }
                accepted
            }
            Err(e) => {
                tracing::error!(stamp, error = %e, "Exception while adding scores");
                false
            }
        };

        JobResult::Scored {
            result,
            stamp,
            scored: if result { scores.len() } else { 0 },
        }
    }

    /// Barrier over all AddScores children. Partial success still finalizes
    /// the round; zero successes leaves it incomplete.
    pub async fn complete_round(&self, job: &Job, stamp: u64, total: usize) -> JobResult {
        let (processed, failed) =
            job.child_results
                .values()
                .fold((0usize, 0usize), |(ok, err), result| {
                    if result.succeeded() {
                        (ok + 1, err)
                    } else {
                        (ok, err + 1)
                    }
                });

        if processed < total {
            tracing::warn!(
                stamp,
                processed,
                failed,
                total,
                "Processed fewer score batches than submitted"
            );
        }
        if processed == 0 {
            tracing::warn!(stamp, "No score batches succeeded, round stays incomplete");
            return JobResult::Done(false);
        }
        tracing::info!(stamp, processed, failed, "Score batches processed");

        match self.backend.finalize_round(stamp).await {
            Ok(true) => {
                if let Err(e) = self.rounds.mark_round(stamp, Some(true), None).await {
                    tracing::error!(stamp, error = %e, "Failed recording round completion");
                }
                JobResult::Done(true)
            }
            Ok(false) => {
                tracing::warn!(stamp, "Backend declined to finalize round");
                JobResult::Done(false)
            }
            Err(e) => {
                // The persist parent aggregates this result; convert rather
                // than propagate so the join settles.
                tracing::error!(stamp, error = %e, "Exception completing round");
                JobResult::Done(false)
            }
        }
    }

    /// Flow root. Reads CompleteRound's single child result; an incomplete
    /// round is never persisted. Backend errors propagate into queue retry;
    /// re-persisting is idempotent per stamp.
    pub async fn persist_round(&self, job: &Job, stamp: u64) -> Result<JobResult> {
        let complete = job
            .child_results
            .values()
            .next()
            .map(|r| r.succeeded())
            .unwrap_or(false);

        if !complete {
            tracing::warn!(
                stamp,
                "Round was not marked complete, skipping snapshot persistence"
            );
            return Ok(JobResult::Done(false));
        }

        let Some(snapshot) = self.backend.fetch_latest_snapshot().await? else {
            tracing::error!(stamp, "Last snapshot not found");
            return Ok(JobResult::Done(false));
        };
        if snapshot.timestamp == 0 {
            tracing::error!(stamp, "Last snapshot carries no timestamp");
            return Ok(JobResult::Done(false));
        }
        if snapshot.timestamp != stamp {
            tracing::warn!(
                stamp,
                snapshot_stamp = snapshot.timestamp,
                "Snapshot stamp differs from round, skipping persistence"
            );
            return Ok(JobResult::Done(false));
        }

        if !self.is_live {
            tracing::warn!(stamp, "NOT LIVE: not persisting round snapshot");
            return Ok(JobResult::Done(false));
        }

        let receipt = self.backend.upload_durable(&snapshot).await?;
        tracing::info!(stamp, receipt = %receipt.id, "Persisted round snapshot");
        self.rounds.mark_round(stamp, Some(true), Some(true)).await?;
        Ok(JobResult::Done(true))
    }
}

/// Routes every dequeued job to its handler. Error conversion happens in the
/// orchestrator methods; whatever reaches the engine as `Err` is retried.
pub struct JobRouter {
    scheduler: Arc<RoundScheduler>,
    orchestrator: Arc<RoundOrchestrator>,
}

impl JobRouter {
    pub fn new(scheduler: Arc<RoundScheduler>, orchestrator: Arc<RoundOrchestrator>) -> Self {
        Self {
            scheduler,
            orchestrator,
        }
    }
}

#[async_trait]
impl JobHandler for JobRouter {
    async fn handle(&self, job: Job) -> Result<JobResult> {
        match &job.payload {
            JobPayload::Tick(TickJob::Recheck) => {
                self.scheduler.queue_distribution().await?;
                Ok(JobResult::Done(true))
            }
            JobPayload::Round(RoundJob::Start { stamp }) => {
                self.orchestrator.start_round(*stamp).await
            }
            JobPayload::Round(RoundJob::AddScores { stamp, scores }) => {
                Ok(self.orchestrator.add_scores(*stamp, scores).await)
            }
            JobPayload::Round(RoundJob::Complete { stamp, total }) => {
                Ok(self.orchestrator.complete_round(&job, *stamp, *total).await)
            }
            JobPayload::Round(RoundJob::Persist { stamp }) => {
                self.orchestrator.persist_round(&job, *stamp).await
            }
        }
    }
}
