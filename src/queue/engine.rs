use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ControllerError, Result};
use crate::queue::job::{FlowNode, Job, JobOpts, JobPayload, JobResult, QueueName};
use crate::queue::worker::{spawn_workers, JobCompletion, JobHandler};

const COMMAND_CAPACITY: usize = 64;
const READY_CAPACITY: usize = 64;

/// Failed jobs retained for inspection; completed jobs are pruned.
pub const DEFAULT_FAILED_RETENTION: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    pub failed_retention: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            failed_retention: DEFAULT_FAILED_RETENTION,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Waiting for its delay to lapse.
    Delayed,
    /// Waiting for all children to reach a terminal state.
    WaitingChildren,
    /// Delivered to the worker pool (queued or executing).
    Active,
}

#[derive(Debug, Clone)]
pub struct JobInfo {
    pub id: Uuid,
    pub queue: QueueName,
    pub name: String,
    pub state: JobState,
    pub ready_in: Option<Duration>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueCounts {
    pub delayed: usize,
    pub waiting_children: usize,
    pub active: usize,
    pub failed: usize,
}

enum EngineCommand {
    Enqueue {
        payload: JobPayload,
        opts: JobOpts,
        reply: oneshot::Sender<Uuid>,
    },
    SubmitFlow {
        root: FlowNode,
        reply: oneshot::Sender<Uuid>,
    },
    Wipe {
        reply: oneshot::Sender<()>,
    },
    Jobs {
        reply: oneshot::Sender<Vec<JobInfo>>,
    },
    Counts {
        reply: oneshot::Sender<QueueCounts>,
    },
}

/// Producer-side handle to the job engine. Cheap to clone; all operations go
/// through the engine's command channel.
#[derive(Clone)]
pub struct QueueHandle {
    tx: mpsc::Sender<EngineCommand>,
}

impl QueueHandle {
    pub async fn enqueue(&self, payload: JobPayload, opts: JobOpts) -> Result<Uuid> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Enqueue {
            payload,
            opts,
            reply,
        })
        .await?;
        rx.await
            .map_err(|_| ControllerError::Queue("engine dropped enqueue reply".to_string()))
    }

    /// Enqueue an entire DAG as one unit. Leaves become runnable right away;
    /// every parent waits for its children. Returns the root job id.
    pub async fn submit_flow(&self, root: FlowNode) -> Result<Uuid> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::SubmitFlow { root, reply }).await?;
        rx.await
            .map_err(|_| ControllerError::Queue("engine dropped flow reply".to_string()))
    }

    /// Administrative reset: drop every queued, delayed, waiting and failed
    /// job. In-flight handler invocations finish but their results are
    /// discarded.
    pub async fn wipe(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Wipe { reply }).await?;
        rx.await
            .map_err(|_| ControllerError::Queue("engine dropped wipe reply".to_string()))
    }

    pub async fn jobs(&self) -> Result<Vec<JobInfo>> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Jobs { reply }).await?;
        rx.await
            .map_err(|_| ControllerError::Queue("engine dropped jobs reply".to_string()))
    }

    pub async fn counts(&self) -> Result<QueueCounts> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Counts { reply }).await?;
        rx.await
            .map_err(|_| ControllerError::Queue("engine dropped counts reply".to_string()))
    }

    async fn send(&self, cmd: EngineCommand) -> Result<()> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| ControllerError::Queue("job engine is not running".to_string()))
    }
}

struct JobEntry {
    job: Job,
    opts: JobOpts,
    parent: Option<Uuid>,
    pending_children: usize,
    state: JobState,
}

struct EngineState {
    entries: HashMap<Uuid, JobEntry>,
    delayed: BinaryHeap<Reverse<(Instant, Uuid)>>,
    // Dispatchable ids waiting for a worker-channel slot. Buffered here so
    // the actor never blocks handing jobs out.
    ready: VecDeque<Uuid>,
    failed: VecDeque<Job>,
    retention: usize,
}

impl EngineState {
    fn new(retention: usize) -> Self {
        Self {
            entries: HashMap::new(),
            delayed: BinaryHeap::new(),
            ready: VecDeque::new(),
            failed: VecDeque::new(),
            retention,
        }
    }

    /// Insert a job and decide its initial placement. Returns the id and
    /// whether it is immediately ready for dispatch.
    fn insert(
        &mut self,
        payload: JobPayload,
        opts: JobOpts,
        parent: Option<Uuid>,
        pending_children: usize,
    ) -> (Uuid, bool) {
        let job = Job::new(payload);
        let id = job.id;

        let (state, ready) = if pending_children > 0 {
            (JobState::WaitingChildren, false)
        } else if let Some(delay) = opts.delay {
            self.delayed.push(Reverse((Instant::now() + delay, id)));
            (JobState::Delayed, false)
        } else {
            (JobState::Active, true)
        };

        self.entries.insert(
            id,
            JobEntry {
                job,
                opts,
                parent,
                pending_children,
                state,
            },
        );
        (id, ready)
    }

    fn submit_flow(&mut self, node: FlowNode, parent: Option<Uuid>, ready: &mut Vec<Uuid>) -> Uuid {
        let FlowNode {
            payload,
            opts,
            children,
        } = node;
        let (id, is_ready) = self.insert(payload, opts, parent, children.len());
        if is_ready {
            ready.push(id);
        }
        for child in children {
            self.submit_flow(child, Some(id), ready);
        }
        id
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.delayed.peek().map(|Reverse((at, _))| *at)
    }

    /// Pop every delayed job whose deadline passed. Stale heap entries
    /// (wiped or retried jobs) are skipped.
    fn due_jobs(&mut self, now: Instant) -> Vec<Uuid> {
        let mut due = Vec::new();
        while let Some(Reverse((at, id))) = self.delayed.peek().copied() {
            if at > now {
                break;
            }
            self.delayed.pop();
            if let Some(entry) = self.entries.get_mut(&id) {
                if entry.state == JobState::Delayed {
                    entry.state = JobState::Active;
                    due.push(id);
                }
            }
        }
        due
    }

    fn job_for_dispatch(&mut self, id: Uuid) -> Option<Job> {
        let entry = self.entries.get_mut(&id)?;
        entry.state = JobState::Active;
        entry.job.attempts_made += 1;
        Some(entry.job.clone())
    }

    /// Apply a terminal or retryable completion. Returns parents that became
    /// runnable.
    fn complete(&mut self, done: JobCompletion) -> Vec<Uuid> {
        let JobCompletion { id, outcome } = done;
        let Some(mut entry) = self.entries.remove(&id) else {
            tracing::debug!(job_id = %id, "Completion for unknown job (wiped), ignoring");
            return Vec::new();
        };
        let name = entry.job.payload.name();

        match outcome {
            Ok(result) => {
                tracing::debug!(job_id = %id, job = name, "Finished job");
                self.settle_child(entry.parent, id, result)
            }
            Err(message) => {
                let attempts = entry.job.attempts_made;
                if attempts < entry.opts.max_attempts {
                    let backoff = retry_backoff(attempts);
                    tracing::warn!(
                        job_id = %id,
                        job = name,
                        attempts,
                        error = %message,
                        backoff_ms = backoff.as_millis() as u64,
                        "Job failed, scheduling retry"
                    );
                    entry.state = JobState::Delayed;
                    self.delayed.push(Reverse((Instant::now() + backoff, id)));
                    self.entries.insert(id, entry);
                    Vec::new()
                } else {
                    tracing::error!(
                        job_id = %id,
                        job = name,
                        attempts,
                        error = %message,
                        "Job exhausted its attempts, marking failed"
                    );
                    self.failed.push_back(entry.job.clone());
                    while self.failed.len() > self.retention {
                        self.failed.pop_front();
                    }
                    self.settle_child(entry.parent, id, JobResult::Failed)
                }
            }
        }
    }

    /// Record a child's terminal result with its parent; when the last child
    /// settles, the parent crosses the barrier and becomes runnable.
    fn settle_child(&mut self, parent: Option<Uuid>, child: Uuid, result: JobResult) -> Vec<Uuid> {
        let Some(parent_id) = parent else {
            return Vec::new();
        };
        let Some(entry) = self.entries.get_mut(&parent_id) else {
            return Vec::new();
        };

        entry.job.child_results.insert(child, result);
        entry.pending_children = entry.pending_children.saturating_sub(1);
        if entry.pending_children == 0 {
            vec![parent_id]
        } else {
            Vec::new()
        }
    }

    fn wipe(&mut self) {
        let dropped = self.entries.len();
        self.entries.clear();
        self.delayed.clear();
        self.ready.clear();
        self.failed.clear();
        tracing::info!(dropped, "Wiped job queues");
    }

    fn snapshot(&self) -> Vec<JobInfo> {
        let now = Instant::now();
        let deadlines: HashMap<Uuid, Instant> = self
            .delayed
            .iter()
            .map(|Reverse((at, id))| (*id, *at))
            .collect();

        self.entries
            .values()
            .map(|entry| JobInfo {
                id: entry.job.id,
                queue: entry.job.queue,
                name: entry.job.payload.name().to_string(),
                state: entry.state,
                ready_in: deadlines
                    .get(&entry.job.id)
                    .map(|at| at.saturating_duration_since(now)),
            })
            .collect()
    }

    fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts {
            failed: self.failed.len(),
            ..Default::default()
        };
        for entry in self.entries.values() {
            match entry.state {
                JobState::Delayed => counts.delayed += 1,
                JobState::WaitingChildren => counts.waiting_children += 1,
                JobState::Active => counts.active += 1,
            }
        }
        counts
    }
}

fn retry_backoff(attempts: u32) -> Duration {
    Duration::from_secs(u64::from(attempts))
}

/// At-least-once, in-process job engine with delayed jobs, bounded retries,
/// failed-job retention and flow (DAG) submission with child-result
/// aggregation. Runs as a single actor task; workers execute handlers
/// concurrently and report completions back.
pub struct JobEngine {
    command_rx: mpsc::Receiver<EngineCommand>,
    options: EngineOptions,
}

impl JobEngine {
    pub fn new(options: EngineOptions) -> (Self, QueueHandle) {
        let (tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        (
            Self {
                command_rx,
                options,
            },
            QueueHandle { tx },
        )
    }

    pub async fn run(
        mut self,
        handler: Arc<dyn JobHandler>,
        workers: usize,
        cancel: CancellationToken,
    ) {
        let (ready_tx, ready_rx) = mpsc::channel::<Job>(READY_CAPACITY);
        let (completion_tx, mut completion_rx) = mpsc::channel::<JobCompletion>(READY_CAPACITY);
        spawn_workers(workers, ready_rx, completion_tx, handler, cancel.clone());

        let mut state = EngineState::new(self.options.failed_retention);

        loop {
            let deadline = state.next_deadline();

            tokio::select! {
                cmd = self.command_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    self.handle_command(&mut state, cmd);
                }
                Some(done) = completion_rx.recv() => {
                    let unblocked = state.complete(done);
                    state.ready.extend(unblocked);
                }
                // Delivery must not wedge the actor: reserve a slot first and
                // hand over one job per turn, so completions keep draining
                // while a wide flow's leaves trickle out.
                permit = ready_tx.reserve(), if !state.ready.is_empty() => {
                    let Ok(permit) = permit else {
                        tracing::error!(
                            pending = state.ready.len(),
                            "Worker pool is gone, dropping dispatchable jobs"
                        );
                        state.ready.clear();
                        continue;
                    };
                    while let Some(id) = state.ready.pop_front() {
                        // Wiped jobs leave stale ids behind; skip them.
                        if let Some(job) = state.job_for_dispatch(id) {
                            permit.send(job);
                            break;
                        }
                    }
                }
                _ = sleep_until_or_never(deadline), if deadline.is_some() => {
                    let due = state.due_jobs(Instant::now());
                    state.ready.extend(due);
                }
                _ = cancel.cancelled() => break,
            }
        }
        tracing::debug!("Job engine stopped");
    }

    fn handle_command(&self, state: &mut EngineState, cmd: EngineCommand) {
        match cmd {
            EngineCommand::Enqueue {
                payload,
                opts,
                reply,
            } => {
                let name = payload.name();
                let (id, ready) = state.insert(payload, opts, None, 0);
                tracing::debug!(job_id = %id, job = name, delayed = !ready, "Enqueued job");
                if ready {
                    state.ready.push_back(id);
                }
                let _ = reply.send(id);
            }
            EngineCommand::SubmitFlow { root, reply } => {
                let mut ready = Vec::new();
                let root_id = state.submit_flow(root, None, &mut ready);
                tracing::debug!(root_id = %root_id, leaves = ready.len(), "Submitted flow");
                state.ready.extend(ready);
                let _ = reply.send(root_id);
            }
            EngineCommand::Wipe { reply } => {
                state.wipe();
                let _ = reply.send(());
            }
            EngineCommand::Jobs { reply } => {
                let _ = reply.send(state.snapshot());
            }
            EngineCommand::Counts { reply } => {
                let _ = reply.send(state.counts());
            }
        }
    }
}

async fn sleep_until_or_never(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
