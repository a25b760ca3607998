use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ControllerError, Result};

/// Coordination store (Consul-compatible) connection settings.
///
/// When `addr` is unset the controller runs in single-node mode and never
/// talks to a coordination store.
#[derive(Debug, Clone, Default)]
pub struct CoordinationConfig {
    /// Base address, e.g. "http://127.0.0.1:8500"
    pub addr: Option<String>,
    /// Service name used for the lock key and session identity
    pub service_name: Option<String>,
    /// Optional ACL token sent with every request
    pub token: Option<String>,
}

impl CoordinationConfig {
    pub fn is_configured(&self) -> bool {
        self.addr.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub coordination: CoordinationConfig,

    /// Whether this OS process participates in leader election when several
    /// share a host. Only the local leader runs singleton duties.
    pub local_leader: bool,

    /// When false, external side effects (batch submission, durable uploads)
    /// are skipped and logged instead.
    pub is_live: bool,

    /// Administrative reset: wipe queues and round bookkeeping on bootstrap.
    pub do_clean: bool,

    /// Minimum interval between round starts.
    pub min_round_length: Duration,

    /// Maximum scores per batch job. Entries sharing a beneficiary are never
    /// split across batches.
    pub scores_per_batch: usize,

    /// Queue consumer count for this process.
    pub workers: usize,

    /// Round bookkeeping database path. None selects the in-memory store.
    pub db_path: Option<PathBuf>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            coordination: CoordinationConfig::default(),
            local_leader: false,
            is_live: false,
            do_clean: false,
            min_round_length: Duration::from_secs(60),
            scores_per_batch: 420,
            workers: 4,
            db_path: None,
        }
    }
}

impl ControllerConfig {
    /// Validate startup settings. A coordination address without a service
    /// name is fatal: the lock key and session identity derive from it.
    pub fn validate(&self) -> Result<()> {
        if self.coordination.addr.is_some() && self.coordination.service_name.is_none() {
            return Err(ControllerError::Configuration(
                "coordination address is set but service name is missing".to_string(),
            ));
        }
        if self.workers == 0 {
            return Err(ControllerError::Configuration(
                "worker count must be at least 1".to_string(),
            ));
        }
        if self.scores_per_batch == 0 {
            return Err(ControllerError::Configuration(
                "scores_per_batch must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_round_period(mut self, seconds: u64) -> Self {
        if seconds > 0 {
            self.min_round_length = Duration::from_secs(seconds);
        }
        self
    }
}
