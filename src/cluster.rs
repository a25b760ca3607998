//! Cluster-wide mutual exclusion over the coordination store.
//!
//! Two independent gates combine: cluster leadership (won by CAS-acquiring
//! the lock key under a live session) and local participation (a per-process
//! flag deciding whether this OS process takes part in election at all).
//! Only a process passing both gates runs singleton duties.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ControllerConfig;
use crate::coordination::{CoordinationStore, SessionId};
use crate::error::{ControllerError, Result};

pub const SESSION_TTL: Duration = Duration::from_secs(15);
/// Renewal cadence, roughly two-thirds of the session TTL.
pub const RENEW_INTERVAL: Duration = Duration::from_secs(10);

const RESUBSCRIBE_BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const RESUBSCRIBE_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Current leadership status. `Unknown` means election has not resolved yet;
/// readers treat it as "not leader" but the distinction is kept for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leadership {
    Unknown,
    Follower,
    Leader,
}

const STATE_UNKNOWN: u8 = 0;
const STATE_FOLLOWER: u8 = 1;
const STATE_LEADER: u8 = 2;

pub struct LeaderElector {
    service_name: String,
    service_id: String,
    local_leader: bool,
    store: Option<Arc<dyn CoordinationStore>>,
    // Single writer (the election loop), lock-free readers.
    leadership: AtomicU8,
    session: tokio::sync::RwLock<Option<SessionId>>,
    cancel: CancellationToken,
}

impl LeaderElector {
    /// Build the elector. When no coordination store is supplied, or local
    /// participation is disabled, leadership resolves to `Leader` immediately
    /// and no coordination calls are ever made (single-node mode).
    pub fn new(
        config: &ControllerConfig,
        store: Option<Arc<dyn CoordinationStore>>,
    ) -> Result<Self> {
        let single_node = store.is_none() || !config.local_leader;

        let service_name = match (&store, &config.coordination.service_name) {
            (Some(_), None) => {
                return Err(ControllerError::Configuration(
                    "coordination store configured without a service name".to_string(),
                ))
            }
            (_, Some(name)) => name.clone(),
            (None, None) => "standalone".to_string(),
        };

        if single_node {
            tracing::warn!(
                store_configured = store.is_some(),
                local_leader = config.local_leader,
                "Skipping coordinated election, bootstrapping in single-node mode"
            );
        }

        let service_id = format!("{}-{}", service_name, Uuid::new_v4());

        Ok(Self {
            service_name,
            service_id,
            local_leader: config.local_leader,
            store: if single_node { None } else { store },
            leadership: AtomicU8::new(if single_node {
                STATE_LEADER
            } else {
                STATE_UNKNOWN
            }),
            session: tokio::sync::RwLock::new(None),
            cancel: CancellationToken::new(),
        })
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn leadership(&self) -> Leadership {
        match self.leadership.load(Ordering::Acquire) {
            STATE_LEADER => Leadership::Leader,
            STATE_FOLLOWER => Leadership::Follower,
            _ => Leadership::Unknown,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.leadership() == Leadership::Leader
    }

    pub fn is_local_leader(&self) -> bool {
        self.local_leader
    }

    /// The live coordination session, if one was created at bootstrap.
    pub async fn session(&self) -> Option<SessionId> {
        self.session.read().await.clone()
    }

    /// Both gates: cluster leader AND local election participant.
    pub fn is_the_one(&self) -> bool {
        let leader = self.is_leader();
        tracing::debug!(
            is_leader = leader,
            is_local_leader = self.local_leader,
            "Singleton duty check"
        );
        leader && self.local_leader
    }

    fn lock_key(&self) -> String {
        format!("clusters/{}/leader", self.service_name)
    }

    /// Create the session, start the renewal timer and the election loop.
    ///
    /// Session creation failure here is fatal: the store is configured but
    /// unusable. Everything after this point is retried and logged instead.
    pub async fn bootstrap(self: &Arc<Self>) -> Result<()> {
        let Some(store) = self.store.clone() else {
            return Ok(());
        };

        let session = store.create_session(&self.service_id, SESSION_TTL).await?;
        tracing::info!(
            service_id = %self.service_id,
            session = %session,
            "Coordination session created"
        );
        *self.session.write().await = Some(session);

        self.spawn_renewal(store.clone());

        // Resolve the first acquisition before returning so callers observe
        // a settled leadership status at bootstrap; the watch loop takes
        // over from here.
        let key = self.lock_key();
        self.try_acquire(store.as_ref(), &key).await;
        self.spawn_election(store);
        Ok(())
    }

    fn spawn_renewal(self: &Arc<Self>, store: Arc<dyn CoordinationStore>) {
        let elector = Arc::clone(self);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(RENEW_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await; // immediate first tick

            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = cancel.cancelled() => break,
                }

                let session = elector.session.read().await.clone();
                let Some(session) = session else { continue };

                // A missed renewal lets the session expire server-side and
                // silently forfeits leadership via the lock-key watch.
                if let Err(e) = store.renew_session(&session).await {
                    tracing::error!(
                        session = %session,
                        error = %e,
                        "Failed to renew coordination session"
                    );
                }
            }
        });
    }

    fn spawn_election(self: &Arc<Self>, store: Arc<dyn CoordinationStore>) {
        let elector = Arc::clone(self);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let key = elector.lock_key();
            let mut backoff = RESUBSCRIBE_BACKOFF_INITIAL;
            'subscribe: loop {
                let mut rx = store.watch(&key, cancel.child_token());
                loop {
                    let event = tokio::select! {
                        ev = rx.recv() => ev,
                        _ = cancel.cancelled() => break 'subscribe,
                    };

                    match event {
                        Some(ev) => {
                            backoff = RESUBSCRIBE_BACKOFF_INITIAL;
                            match ev.value {
                                // Holder gone: every watcher races to re-acquire.
                                None => elector.try_acquire(store.as_ref(), &key).await,
                                Some(holder) => elector.observe_holder(&holder),
                            }
                        }
                        None => {
                            tracing::warn!(
                                key = %key,
                                backoff_ms = backoff.as_millis() as u64,
                                "Lock watch ended, resubscribing"
                            );
                            tokio::select! {
                                _ = tokio::time::sleep(backoff) => {}
                                _ = cancel.cancelled() => break 'subscribe,
                            }
                            backoff = (backoff * 2).min(RESUBSCRIBE_BACKOFF_MAX);
                            continue 'subscribe;
                        }
                    }
                }
            }
            tracing::debug!("Election loop terminated");
        });
    }

    async fn try_acquire(&self, store: &dyn CoordinationStore, key: &str) {
        let session = self.session.read().await.clone();
        let Some(session) = session else { return };

        match store.acquire(key, &self.service_id, &session).await {
            Ok(acquired) => {
                self.set_leadership(acquired);
                tracing::info!(
                    service_id = %self.service_id,
                    acquired,
                    "Leader lock acquisition attempt"
                );
            }
            Err(e) => {
                // Keep the last known status until the next watch event.
                tracing::error!(error = %e, "Error during leader election");
            }
        }
    }

    fn observe_holder(&self, holder: &str) {
        let ours = holder == self.service_id;
        self.set_leadership(ours);
    }

    fn set_leadership(&self, leader: bool) {
        let state = if leader { STATE_LEADER } else { STATE_FOLLOWER };
        let previous = self.leadership.swap(state, Ordering::Release);
        if previous != state {
            tracing::info!(
                service_id = %self.service_id,
                leader,
                "Leadership status changed"
            );
        }
    }

    /// Stop renewal and election, then destroy a live session explicitly so
    /// the lock releases immediately instead of waiting out the TTL.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let Some(store) = &self.store else { return };
        let session = self.session.write().await.take();
        if let Some(session) = session {
            tracing::info!(session = %session, "Releasing leader lock");
            if let Err(e) = store.destroy_session(&session).await {
                tracing::error!(session = %session, error = %e, "Failed to destroy session");
            }
        }
    }
}

impl std::fmt::Debug for LeaderElector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElector")
            .field("service_id", &self.service_id)
            .field("local_leader", &self.local_leader)
            .field("leadership", &self.leadership())
            .finish()
    }
}
