//! Round lifecycle: bookkeeping, cadence scheduling and the per-round DAG.

pub mod batch;
pub mod orchestrator;
pub mod scheduler;
pub mod store;

pub use batch::group_score_jobs;
pub use orchestrator::{JobRouter, RoundOrchestrator};
pub use scheduler::{RoundScheduler, TickOutcome};
pub use store::{MemoryRoundStore, RedbRoundStore, Round, RoundStore};
