use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::ScoreEntry;

/// The two queues this service runs. The tick queue carries only the
/// self-perpetuating scheduler recheck; the rounds queue carries the per-round
/// DAG nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueName {
    Ticks,
    Rounds,
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueName::Ticks => write!(f, "tick-queue"),
            QueueName::Rounds => write!(f, "round-queue"),
        }
    }
}

/// Scheduler-queue payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TickJob {
    /// Delayed recheck that keeps the round cadence alive without a standing
    /// timer.
    Recheck,
}

/// Round-queue payloads, one explicit schema per job kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RoundJob {
    /// Compute scores, batch them and submit the round DAG.
    Start { stamp: u64 },
    /// Forward one score batch to the external scorer.
    AddScores { stamp: u64, scores: Vec<ScoreEntry> },
    /// Join over all AddScores children; finalizes the round.
    Complete { stamp: u64, total: usize },
    /// Join over Complete; uploads the finalized snapshot.
    Persist { stamp: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobPayload {
    Tick(TickJob),
    Round(RoundJob),
}

impl JobPayload {
    pub fn queue(&self) -> QueueName {
        match self {
            JobPayload::Tick(_) => QueueName::Ticks,
            JobPayload::Round(_) => QueueName::Rounds,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobPayload::Tick(TickJob::Recheck) => "queued-recheck",
            JobPayload::Round(RoundJob::Start { .. }) => "start-round",
            JobPayload::Round(RoundJob::AddScores { .. }) => "add-scores",
            JobPayload::Round(RoundJob::Complete { .. }) => "complete-round",
            JobPayload::Round(RoundJob::Persist { .. }) => "persist-last-round",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct JobOpts {
    pub delay: Option<Duration>,
    /// Delivery attempts before the job is terminally failed.
    pub max_attempts: u32,
}

impl Default for JobOpts {
    fn default() -> Self {
        Self {
            delay: None,
            max_attempts: 3,
        }
    }
}

impl JobOpts {
    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }
}

/// Terminal outcome of a job, visible to a flow parent through
/// `child_results`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobResult {
    Done(bool),
    Scored {
        result: bool,
        stamp: u64,
        scored: usize,
    },
    /// Recorded by the engine when a job exhausts its attempts. Parents see
    /// this like any other terminal result; the join is a barrier, not a
    /// success gate.
    Failed,
}

impl JobResult {
    pub fn succeeded(&self) -> bool {
        match self {
            JobResult::Done(ok) => *ok,
            JobResult::Scored { result, .. } => *result,
            JobResult::Failed => false,
        }
    }
}

/// A job as delivered to a handler. `child_results` is populated only for
/// flow parents, once every child reached a terminal state.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub queue: QueueName,
    pub payload: JobPayload,
    pub attempts_made: u32,
    pub enqueued_at: DateTime<Utc>,
    pub child_results: HashMap<Uuid, JobResult>,
}

impl Job {
    pub fn new(payload: JobPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue: payload.queue(),
            payload,
            attempts_made: 0,
            enqueued_at: Utc::now(),
            child_results: HashMap::new(),
        }
    }
}

/// One node of a dependency graph submitted as a unit. A node runs only
/// after every child reached a terminal state.
#[derive(Debug, Clone)]
pub struct FlowNode {
    pub payload: JobPayload,
    pub opts: JobOpts,
    pub children: Vec<FlowNode>,
}

impl FlowNode {
    pub fn new(payload: JobPayload) -> Self {
        Self {
            payload,
            opts: JobOpts::default(),
            children: Vec::new(),
        }
    }

    pub fn with_children(mut self, children: Vec<FlowNode>) -> Self {
        self.children = children;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_routes_to_queue() {
        assert_eq!(
            JobPayload::Tick(TickJob::Recheck).queue(),
            QueueName::Ticks
        );
        assert_eq!(
            JobPayload::Round(RoundJob::Start { stamp: 1 }).queue(),
            QueueName::Rounds
        );
    }

    #[test]
    fn result_success_semantics() {
        assert!(JobResult::Done(true).succeeded());
        assert!(!JobResult::Done(false).succeeded());
        assert!(JobResult::Scored {
            result: true,
            stamp: 1,
            scored: 10
        }
        .succeeded());
        assert!(!JobResult::Failed.succeeded());
    }

    #[test]
    fn payload_round_trips_through_json() {
        let payload = JobPayload::Round(RoundJob::Complete {
            stamp: 1700000000000,
            total: 3,
        });
        let json = serde_json::to_string(&payload).unwrap();
        let back: JobPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }
}
