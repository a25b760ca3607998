use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;
use crate::queue::job::{Job, JobResult};

/// Handles one dequeued job. An `Err` return triggers queue-level retry; a
/// typed failure result (`Ok` carrying `result: false`) is terminal and
/// flows into the parent's child-result aggregation.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: Job) -> Result<JobResult>;
}

pub struct JobCompletion {
    pub id: Uuid,
    /// Error text only; the engine owns retry bookkeeping.
    pub outcome: std::result::Result<JobResult, String>,
}

/// Spawn `count` consumers over a shared ready-job receiver. Any consumer on
/// any process may execute any DAG node; only handler idempotency makes
/// redelivery safe.
pub fn spawn_workers(
    count: usize,
    ready_rx: mpsc::Receiver<Job>,
    completion_tx: mpsc::Sender<JobCompletion>,
    handler: Arc<dyn JobHandler>,
    cancel: CancellationToken,
) {
    let ready_rx = Arc::new(Mutex::new(ready_rx));

    for worker_id in 0..count {
        let ready_rx = Arc::clone(&ready_rx);
        let completion_tx = completion_tx.clone();
        let handler = Arc::clone(&handler);
        let cancel = cancel.clone();

        tokio::spawn(async move {
            loop {
                let job = {
                    let mut rx = ready_rx.lock().await;
                    tokio::select! {
                        job = rx.recv() => job,
                        _ = cancel.cancelled() => break,
                    }
                };
                let Some(job) = job else { break };

                let id = job.id;
                let name = job.payload.name();
                tracing::debug!(worker_id, job_id = %id, job = name, "Dequeueing job");

                let outcome = handler.handle(job).await.map_err(|e| e.to_string());
                if completion_tx
                    .send(JobCompletion { id, outcome })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            tracing::debug!(worker_id, "Queue worker stopped");
        });
    }
}
