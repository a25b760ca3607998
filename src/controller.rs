use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::backend::RewardsBackend;
use crate::cluster::LeaderElector;
use crate::config::ControllerConfig;
use crate::coordination::CoordinationStore;
use crate::error::Result;
use crate::queue::{EngineOptions, JobEngine, QueueHandle};
use crate::rounds::{JobRouter, RoundOrchestrator, RoundScheduler, RoundStore};

/// Wires the subsystems together: coordination store → leader elector →
/// job engine and workers → round store → scheduler → orchestrator.
pub struct Controller {
    elector: Arc<LeaderElector>,
    scheduler: Arc<RoundScheduler>,
    orchestrator: Arc<RoundOrchestrator>,
    engine: JobEngine,
    queue: QueueHandle,
    workers: usize,
}

impl Controller {
    pub fn new(
        config: &ControllerConfig,
        store: Option<Arc<dyn CoordinationStore>>,
        rounds: Arc<dyn RoundStore>,
        backend: Arc<dyn RewardsBackend>,
    ) -> Result<Self> {
        config.validate()?;

        let elector = Arc::new(LeaderElector::new(config, store)?);
        let (engine, queue) = JobEngine::new(EngineOptions::default());

        let scheduler = Arc::new(RoundScheduler::new(
            Arc::clone(&elector),
            Arc::clone(&rounds),
            queue.clone(),
            config.min_round_length,
            config.do_clean,
        ));
        let orchestrator = Arc::new(RoundOrchestrator::new(
            backend,
            rounds,
            queue.clone(),
            config.scores_per_batch,
            config.is_live,
        ));

        Ok(Self {
            elector,
            scheduler,
            orchestrator,
            engine,
            queue,
            workers: config.workers,
        })
    }

    pub fn elector(&self) -> Arc<LeaderElector> {
        Arc::clone(&self.elector)
    }

    pub fn queue(&self) -> QueueHandle {
        self.queue.clone()
    }

    /// Run until `cancel` fires. Election bootstrap failure (store configured
    /// but unusable) is fatal; scheduler bootstrap failure is logged and the
    /// process stays up, since any process's workers still execute DAG nodes.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let router = Arc::new(JobRouter::new(
            Arc::clone(&self.scheduler),
            Arc::clone(&self.orchestrator),
        ));
        let engine = tokio::spawn(self.engine.run(router, self.workers, cancel.clone()));

        self.elector.bootstrap().await?;

        if let Err(e) = self.scheduler.on_bootstrap().await {
            tracing::error!(error = %e, "Failed to bootstrap round scheduler");
        }

        cancel.cancelled().await;
        tracing::info!("Shutting down controller");
        self.elector.shutdown().await;
        if let Err(e) = engine.await {
            tracing::error!(error = %e, "Job engine task panicked");
        }
        Ok(())
    }
}
