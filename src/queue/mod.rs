//! Durable-enough, at-least-once job delivery with delayed jobs and
//! dependency flows.
//!
//! - [`JobEngine`]: single-actor engine owning all queue state
//! - [`QueueHandle`]: cloneable producer handle (enqueue, submit_flow, wipe)
//! - [`JobHandler`]: consumer seam implemented by the orchestration layer
//!
//! A flow parent is delivered only after every child reached a terminal
//! state (success or failure) and sees all child results. Completed jobs
//! are pruned; failed jobs are retained up to a fixed count.

pub mod engine;
pub mod job;
pub mod worker;

pub use engine::{EngineOptions, JobEngine, JobInfo, JobState, QueueCounts, QueueHandle};
pub use job::{FlowNode, Job, JobOpts, JobPayload, JobResult, QueueName, RoundJob, TickJob};
pub use worker::{JobCompletion, JobHandler};
