use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::coordination::{CoordinationStore, KeyEvent, SessionId};
use crate::error::Result;

const WATCH_WAIT: &str = "10s";
const WATCH_BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const WATCH_BACKOFF_MAX: Duration = Duration::from_secs(30);

#[derive(Deserialize)]
struct SessionCreated {
    #[serde(rename = "ID")]
    id: String,
}

/// HTTP adapter over the Consul session/KV API.
///
/// Watches use blocking queries: a long-poll GET carrying the last seen
/// modify index, re-issued whenever the index advances.
#[derive(Clone)]
pub struct ConsulStore {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ConsulStore {
    pub fn new(addr: &str, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: addr.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(token) = &self.token {
            req = req.header("X-Consul-Token", token);
        }
        req
    }
}

#[async_trait::async_trait]
impl CoordinationStore for ConsulStore {
    async fn create_session(&self, name: &str, ttl: Duration) -> Result<SessionId> {
        let body = serde_json::json!({
            "Name": name,
            "TTL": format!("{}s", ttl.as_secs()),
            "Behavior": "delete",
        });
        let resp = self
            .request(reqwest::Method::PUT, "/v1/session/create")
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let created: SessionCreated = resp.json().await?;
        Ok(SessionId(created.id))
    }

    async fn renew_session(&self, session: &SessionId) -> Result<()> {
        self.request(
            reqwest::Method::PUT,
            &format!("/v1/session/renew/{}", session),
        )
        .send()
        .await?
        .error_for_status()?;
        Ok(())
    }

    async fn destroy_session(&self, session: &SessionId) -> Result<()> {
        self.request(
            reqwest::Method::PUT,
            &format!("/v1/session/destroy/{}", session),
        )
        .send()
        .await?
        .error_for_status()?;
        Ok(())
    }

    async fn acquire(&self, key: &str, value: &str, session: &SessionId) -> Result<bool> {
        let resp = self
            .request(
                reqwest::Method::PUT,
                &format!("/v1/kv/{}?acquire={}", key, session),
            )
            .body(value.to_string())
            .send()
            .await?
            .error_for_status()?;
        let body = resp.text().await?;
        Ok(body.trim() == "true")
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let resp = self
            .request(reqwest::Method::GET, &format!("/v1/kv/{}?raw", key))
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = resp.error_for_status()?;
        Ok(Some(resp.text().await?))
    }

    fn watch(&self, key: &str, cancel: CancellationToken) -> mpsc::Receiver<KeyEvent> {
        let (tx, rx) = mpsc::channel(16);
        let store = self.clone();
        let key = key.to_string();

        tokio::spawn(async move {
            let mut index: u64 = 0;
            let mut backoff = WATCH_BACKOFF_INITIAL;

            loop {
                let path = format!("/v1/kv/{}?raw&index={}&wait={}", key, index, WATCH_WAIT);
                let poll = tokio::select! {
                    r = store.request(reqwest::Method::GET, &path).send() => r,
                    _ = cancel.cancelled() => break,
                };

                match poll {
                    Ok(resp) => {
                        let status = resp.status();
                        // A reachable store returning errors gets the same
                        // backoff as a transport failure.
                        if status != reqwest::StatusCode::NOT_FOUND && !status.is_success() {
                            tracing::warn!(
                                key = %key,
                                status = %status,
                                backoff_ms = backoff.as_millis() as u64,
                                "Unexpected status from coordination store watch"
                            );
                            let pause = with_jitter(backoff);
                            tokio::select! {
                                _ = tokio::time::sleep(pause) => {}
                                _ = cancel.cancelled() => break,
                            }
                            backoff = (backoff * 2).min(WATCH_BACKOFF_MAX);
                            continue;
                        }
                        backoff = WATCH_BACKOFF_INITIAL;

                        let new_index = resp
                            .headers()
                            .get("X-Consul-Index")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.parse::<u64>().ok())
                            .unwrap_or(0);

                        let value = if status == reqwest::StatusCode::NOT_FOUND {
                            None
                        } else {
                            resp.text().await.ok()
                        };

                        // The index only moves when the key changed; the
                        // first poll (index 0) always reports current state.
                        if new_index != index {
                            index = new_index;
                            let event = KeyEvent {
                                key: key.clone(),
                                value,
                            };
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            key = %key,
                            error = %e,
                            backoff_ms = backoff.as_millis() as u64,
                            "Coordination store watch failed, backing off"
                        );
                        let pause = with_jitter(backoff);
                        tokio::select! {
                            _ = tokio::time::sleep(pause) => {}
                            _ = cancel.cancelled() => break,
                        }
                        backoff = (backoff * 2).min(WATCH_BACKOFF_MAX);
                    }
                }
            }
            tracing::debug!(key = %key, "Watch loop terminated");
        });

        rx
    }
}

/// Spread retries out so watchers racing for the same lock key do not
/// hammer the store in lockstep.
fn with_jitter(base: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
    base + Duration::from_millis(jitter)
}

impl std::fmt::Debug for ConsulStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsulStore")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve `500 Internal Server Error` to every request, counting them.
    async fn spawn_failing_server(hits: Arc<AtomicUsize>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let hits = hits.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 2048];
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(_) => {
                                hits.fetch_add(1, Ordering::SeqCst);
                                let response =
                                    b"HTTP/1.1 500 Internal Server Error\r\ncontent-length: 0\r\n\r\n";
                                if socket.write_all(response).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });

        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn watch_backs_off_when_the_store_returns_errors() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base_url = spawn_failing_server(hits.clone()).await;

        let store = ConsulStore::new(&base_url, None);
        let cancel = CancellationToken::new();
        let mut rx = store.watch("clusters/test/leader", cancel.clone());

        tokio::time::sleep(Duration::from_millis(1200)).await;
        cancel.cancel();

        // 500ms initial backoff, doubling: a bit over a second fits only a
        // few polls. Without backoff this counts thousands.
        let polls = hits.load(Ordering::SeqCst);
        assert!(polls >= 1, "watch never reached the server");
        assert!(polls <= 5, "watch hammered the failing store: {} polls", polls);

        // Error statuses never surface as key events.
        assert!(rx.try_recv().is_err());
    }
}
