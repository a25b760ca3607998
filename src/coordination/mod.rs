//! Thin client seam over an external session/KV coordination service.
//!
//! The store provides three primitives the elector builds on:
//! - TTL-bound sessions (lock ownership is valid only while renewed)
//! - compare-and-swap key acquisition conditioned on a live session
//! - change-watch subscriptions on a single key
//!
//! No election logic lives here.

pub mod consul;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

pub use consul::ConsulStore;
pub use memory::MemoryStore;

/// Opaque session handle issued by the coordination store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(pub String);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A change notification for a watched key. `value: None` means the key is
/// absent (holder's session expired or it was released explicitly).
#[derive(Debug, Clone)]
pub struct KeyEvent {
    pub key: String,
    pub value: Option<String>,
}

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Create a TTL-bound session. The session is destroyed server-side when
    /// the TTL lapses without renewal, releasing any keys it acquired.
    async fn create_session(&self, name: &str, ttl: Duration) -> Result<SessionId>;

    async fn renew_session(&self, session: &SessionId) -> Result<()>;

    async fn destroy_session(&self, session: &SessionId) -> Result<()>;

    /// Compare-and-swap write of `value` into `key`, conditioned on holding a
    /// live session. Returns true iff this session now holds the key.
    async fn acquire(&self, key: &str, value: &str, session: &SessionId) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Subscribe to change notifications on `key`. The subscription runs
    /// until `cancel` fires or the receiver is dropped. Transient errors are
    /// retried internally with backoff; they never terminate the stream.
    fn watch(&self, key: &str, cancel: CancellationToken) -> mpsc::Receiver<KeyEvent>;
}
