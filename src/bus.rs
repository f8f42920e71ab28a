//! Store-and-forward bus adapter.
//!
//! The modem sidecar owns the physical notefiles; this module is the only
//! code that talks to it. One JSON request/response per TCP connection,
//! newline-delimited, with a hard per-operation timeout.
//!
//! # Requests
//! - `{"req":"note.drain","file":"telemetry.qi","max":10}` →
//!   `{"notes":[{"body":{...},"epoch":1712345678.0},...]}`
//! - `{"req":"note.add","file":"sms.qo","body":{...},"sync":true}` →
//!   `{"ok":true}` or `{"err":"..."}`
//! - `{"req":"card.time"}` → `{"epoch":1712345678.0}`
//!
//! Drain deletion is acked by the sidecar, so a completed drain never
//! re-yields the same notes. Enqueue failures surface to the caller; the
//! server performs no retry of its own.

use crate::error::{ServerError, ServerResult};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// One note pulled off an inbound notefile.
#[derive(Debug, Clone)]
pub struct Note {
    pub body: Value,
    /// Bus-reported capture epoch; 0.0 when the sidecar did not stamp it.
    pub epoch: f64,
}

/// Abstraction over the notefile bus.
///
/// The serial task is generic over this; tests swap in [`MemoryBus`].
pub trait Bus: Send + Sync + 'static {
    /// Remove up to `max` notes from the named inbound queue.
    fn drain(&self, file: &str, max: usize)
        -> impl Future<Output = ServerResult<Vec<Note>>> + Send;

    /// Publish a note. `sync` asks the sidecar to flush immediately.
    fn enqueue(&self, file: &str, body: Value, sync: bool)
        -> impl Future<Output = ServerResult<()>> + Send;

    /// Ask the bus for reconciled wall-clock epoch seconds.
    fn current_time(&self) -> impl Future<Output = ServerResult<f64>> + Send;
}

// ---------------------------------------------------------------------------
// SidecarBus: JSON-over-TCP client
// ---------------------------------------------------------------------------

/// Production bus client speaking to the modem sidecar over TCP.
#[derive(Debug, Clone)]
pub struct SidecarBus {
    addr: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct RawNote {
    body: Value,
    #[serde(default)]
    epoch: f64,
}

#[derive(Debug, Deserialize)]
struct SidecarReply {
    #[serde(default)]
    notes: Option<Vec<RawNote>>,
    #[serde(default)]
    ok: Option<bool>,
    #[serde(default)]
    epoch: Option<f64>,
    #[serde(default)]
    err: Option<String>,
}

impl SidecarBus {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        SidecarBus {
            addr: addr.into(),
            timeout,
        }
    }

    /// One request/response round trip on a fresh connection.
    async fn round_trip(&self, request: Value) -> ServerResult<SidecarReply> {
        let fut = async {
            let mut stream = TcpStream::connect(&self.addr)
                .await
                .map_err(|e| ServerError::Transport(format!("connect {}: {}", self.addr, e)))?;

            let mut line = serde_json::to_vec(&request)
                .map_err(|e| ServerError::Transport(format!("encode request: {}", e)))?;
            line.push(b'\n');
            stream
                .write_all(&line)
                .await
                .map_err(|e| ServerError::Transport(format!("send: {}", e)))?;

            // The sidecar replies with a single line and closes its half.
            let mut buf = Vec::with_capacity(4096);
            let mut chunk = [0u8; 4096];
            loop {
                let n = stream
                    .read(&mut chunk)
                    .await
                    .map_err(|e| ServerError::Transport(format!("recv: {}", e)))?;
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                if buf.ends_with(b"\n") {
                    break;
                }
            }
            if buf.is_empty() {
                return Err(ServerError::Transport("empty reply from sidecar".to_owned()));
            }

            let reply: SidecarReply = serde_json::from_slice(&buf)
                .map_err(|e| ServerError::Transport(format!("decode reply: {}", e)))?;
            Ok(reply)
        };

        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ServerError::Transport(format!(
                "sidecar call timed out after {:?}",
                self.timeout
            ))),
        }
    }
}

impl Bus for SidecarBus {
    async fn drain(&self, file: &str, max: usize) -> ServerResult<Vec<Note>> {
        let reply = self
            .round_trip(json!({"req": "note.drain", "file": file, "max": max}))
            .await?;
        if let Some(err) = reply.err {
            return Err(ServerError::Transport(err));
        }
        let notes = reply
            .notes
            .unwrap_or_default()
            .into_iter()
            .map(|n| Note {
                body: n.body,
                epoch: n.epoch,
            })
            .collect();
        Ok(notes)
    }

    async fn enqueue(&self, file: &str, body: Value, sync: bool) -> ServerResult<()> {
        let reply = self
            .round_trip(json!({"req": "note.add", "file": file, "body": body, "sync": sync}))
            .await?;
        if let Some(err) = reply.err {
            return Err(ServerError::UpstreamRejected(err));
        }
        match reply.ok {
            Some(true) => Ok(()),
            _ => Err(ServerError::UpstreamRejected(
                "sidecar did not acknowledge note.add".to_owned(),
            )),
        }
    }

    async fn current_time(&self) -> ServerResult<f64> {
        let reply = self.round_trip(json!({"req": "card.time"})).await?;
        if let Some(err) = reply.err {
            return Err(ServerError::Transport(err));
        }
        match reply.epoch {
            Some(epoch) if epoch > 0.0 => Ok(epoch),
            _ => Err(ServerError::TimeUnavailable),
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryBus: in-process bus for tests
// ---------------------------------------------------------------------------

/// In-memory bus double. Inbound queues are seeded by tests; every enqueue
/// is captured for assertion.
#[derive(Debug, Default)]
pub struct MemoryBus {
    inbound: Mutex<HashMap<String, VecDeque<Note>>>,
    outbound: Mutex<Vec<SentNote>>,
    time: Mutex<Option<f64>>,
    fail_enqueue: Mutex<bool>,
}

#[derive(Debug, Clone)]
pub struct SentNote {
    pub file: String,
    pub body: Value,
    pub sync: bool,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a note to a named inbound queue.
    pub fn seed(&self, file: &str, body: Value, epoch: f64) {
        self.inbound
            .lock()
            .unwrap()
            .entry(file.to_owned())
            .or_default()
            .push_back(Note { body, epoch });
    }

    /// Everything enqueued so far, in order.
    pub fn sent(&self) -> Vec<SentNote> {
        self.outbound.lock().unwrap().clone()
    }

    pub fn sent_to(&self, file: &str) -> Vec<SentNote> {
        self.sent().into_iter().filter(|s| s.file == file).collect()
    }

    pub fn set_time(&self, epoch: f64) {
        *self.time.lock().unwrap() = Some(epoch);
    }

    /// Make subsequent enqueues fail with `UpstreamRejected`.
    pub fn fail_enqueues(&self, fail: bool) {
        *self.fail_enqueue.lock().unwrap() = fail;
    }
}

impl Bus for MemoryBus {
    async fn drain(&self, file: &str, max: usize) -> ServerResult<Vec<Note>> {
        let mut inbound = self.inbound.lock().unwrap();
        let queue = match inbound.get_mut(file) {
            Some(q) => q,
            None => return Ok(Vec::new()),
        };
        let take = max.min(queue.len());
        Ok(queue.drain(..take).collect())
    }

    async fn enqueue(&self, file: &str, body: Value, sync: bool) -> ServerResult<()> {
        if *self.fail_enqueue.lock().unwrap() {
            return Err(ServerError::UpstreamRejected("enqueue disabled".to_owned()));
        }
        self.outbound.lock().unwrap().push(SentNote {
            file: file.to_owned(),
            body,
            sync,
        });
        Ok(())
    }

    async fn current_time(&self) -> ServerResult<f64> {
        match *self.time.lock().unwrap() {
            Some(epoch) => Ok(epoch),
            None => Err(ServerError::TimeUnavailable),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn memory_bus_drain_is_bounded_and_fifo() {
        let bus = MemoryBus::new();
        for i in 0..15 {
            bus.seed("telemetry.qi", json!({"seq": i}), 1000.0 + i as f64);
        }

        let first = bus.drain("telemetry.qi", 10).await.unwrap();
        assert_eq!(first.len(), 10);
        assert_eq!(first[0].body["seq"], 0);
        assert_eq!(first[9].body["seq"], 9);

        let rest = bus.drain("telemetry.qi", 10).await.unwrap();
        assert_eq!(rest.len(), 5);
        assert_eq!(rest[0].body["seq"], 10);

        assert!(bus.drain("telemetry.qi", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_bus_captures_enqueues() {
        let bus = MemoryBus::new();
        bus.enqueue("sms.qo", json!({"message": "hi"}), true)
            .await
            .unwrap();
        let sent = bus.sent_to("sms.qo");
        assert_eq!(sent.len(), 1);
        assert!(sent[0].sync);
    }

    #[tokio::test]
    async fn memory_bus_enqueue_failure_is_upstream_rejected() {
        let bus = MemoryBus::new();
        bus.fail_enqueues(true);
        let err = bus.enqueue("sms.qo", json!({}), false).await.unwrap_err();
        assert!(matches!(err, ServerError::UpstreamRejected(_)));
    }

    #[tokio::test]
    async fn memory_bus_time_defaults_to_unavailable() {
        let bus = MemoryBus::new();
        assert!(matches!(
            bus.current_time().await.unwrap_err(),
            ServerError::TimeUnavailable
        ));
        bus.set_time(1_700_000_000.0);
        assert_eq!(bus.current_time().await.unwrap(), 1_700_000_000.0);
    }

    #[tokio::test]
    async fn sidecar_bus_times_out_against_a_silent_peer() {
        // Listener that accepts and never replies.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _keep = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let bus = SidecarBus::new(addr.to_string(), Duration::from_millis(50));
        let err = bus.drain("telemetry.qi", 10).await.unwrap_err();
        assert!(matches!(err, ServerError::Transport(_)));
    }
}
