use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::coordination::{CoordinationStore, KeyEvent, SessionId};
use crate::error::{ControllerError, Result};

#[derive(Debug)]
struct SessionState {
    ttl: Duration,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, SessionState>,
    // key -> (value, holding session)
    keys: HashMap<String, (String, SessionId)>,
    watchers: HashMap<String, Vec<mpsc::Sender<KeyEvent>>>,
}

/// In-process coordination store with real session TTL, CAS and watch
/// semantics. Used by tests and available for exercising mutual exclusion
/// without an external service.
///
/// Session expiry is evaluated lazily on each operation against
/// `tokio::time::Instant`, so tests may drive it with a paused clock or
/// force it with [`MemoryStore::expire_session`].
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Force-expire a session, releasing every key it holds and notifying
    /// watchers, exactly as a missed renewal would.
    pub async fn expire_session(&self, session: &SessionId) {
        let notifications = {
            let mut inner = self.inner.lock().expect("memory store lock poisoned");
            inner.sessions.remove(session);
            Self::release_keys_of(&mut inner, session)
        };
        self.notify(notifications).await;
    }

    /// Number of live sessions, for test assertions.
    pub fn session_count(&self) -> usize {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        Self::sweep(&mut inner);
        inner.sessions.len()
    }

    fn sweep(inner: &mut Inner) -> Vec<KeyEvent> {
        let now = Instant::now();
        let expired: Vec<SessionId> = inner
            .sessions
            .iter()
            .filter(|(_, s)| s.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();

        let mut events = Vec::new();
        for session in expired {
            inner.sessions.remove(&session);
            events.extend(Self::release_keys_of(inner, &session));
        }
        events
    }

    fn release_keys_of(inner: &mut Inner, session: &SessionId) -> Vec<KeyEvent> {
        let released: Vec<String> = inner
            .keys
            .iter()
            .filter(|(_, (_, holder))| holder == session)
            .map(|(k, _)| k.clone())
            .collect();

        let mut events = Vec::new();
        for key in released {
            inner.keys.remove(&key);
            events.push(KeyEvent {
                key: key.clone(),
                value: None,
            });
        }
        events
    }

    async fn notify(&self, events: Vec<KeyEvent>) {
        for event in events {
            let targets: Vec<mpsc::Sender<KeyEvent>> = {
                let inner = self.inner.lock().expect("memory store lock poisoned");
                inner
                    .watchers
                    .get(&event.key)
                    .map(|v| v.to_vec())
                    .unwrap_or_default()
            };
            for tx in targets {
                // Dropped receivers are pruned on the next watch registration.
                let _ = tx.send(event.clone()).await;
            }
        }
    }
}

#[async_trait::async_trait]
impl CoordinationStore for MemoryStore {
    async fn create_session(&self, _name: &str, ttl: Duration) -> Result<SessionId> {
        let session = SessionId(Uuid::new_v4().to_string());
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        inner.sessions.insert(
            session.clone(),
            SessionState {
                ttl,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(session)
    }

    async fn renew_session(&self, session: &SessionId) -> Result<()> {
        let events = {
            let mut inner = self.inner.lock().expect("memory store lock poisoned");
            let events = Self::sweep(&mut inner);
            match inner.sessions.get_mut(session) {
                Some(state) => {
                    state.expires_at = Instant::now() + state.ttl;
                }
                None => {
                    return Err(ControllerError::Coordination(format!(
                        "session {} not found",
                        session
                    )))
                }
            }
            events
        };
        self.notify(events).await;
        Ok(())
    }

    async fn destroy_session(&self, session: &SessionId) -> Result<()> {
        let events = {
            let mut inner = self.inner.lock().expect("memory store lock poisoned");
            inner.sessions.remove(session);
            Self::release_keys_of(&mut inner, session)
        };
        self.notify(events).await;
        Ok(())
    }

    async fn acquire(&self, key: &str, value: &str, session: &SessionId) -> Result<bool> {
        let (acquired, events) = {
            let mut inner = self.inner.lock().expect("memory store lock poisoned");
            let mut events = Self::sweep(&mut inner);

            if !inner.sessions.contains_key(session) {
                return Ok(false);
            }

            match inner.keys.get(key) {
                Some((_, holder)) if holder != session => (false, events),
                _ => {
                    inner
                        .keys
                        .insert(key.to_string(), (value.to_string(), session.clone()));
                    events.push(KeyEvent {
                        key: key.to_string(),
                        value: Some(value.to_string()),
                    });
                    (true, events)
                }
            }
        };
        self.notify(events).await;
        Ok(acquired)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        Self::sweep(&mut inner);
        Ok(inner.keys.get(key).map(|(v, _)| v.clone()))
    }

    fn watch(&self, key: &str, cancel: CancellationToken) -> mpsc::Receiver<KeyEvent> {
        let (tx, rx) = mpsc::channel(16);

        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        let initial = KeyEvent {
            key: key.to_string(),
            value: inner.keys.get(key).map(|(v, _)| v.clone()),
        };
        // Capacity is fresh, this cannot fail.
        let _ = tx.try_send(initial);

        let watchers = inner.watchers.entry(key.to_string()).or_default();
        watchers.retain(|w| !w.is_closed());
        watchers.push(tx.clone());
        drop(inner);

        let inner_ref = Arc::downgrade(&self.inner);
        let key = key.to_string();
        tokio::spawn(async move {
            cancel.cancelled().await;
            drop(tx);
            if let Some(inner) = inner_ref.upgrade() {
                let mut inner = inner.lock().expect("memory store lock poisoned");
                if let Some(watchers) = inner.watchers.get_mut(&key) {
                    watchers.retain(|w| !w.is_closed());
                }
            }
        });

        rx
    }
}
