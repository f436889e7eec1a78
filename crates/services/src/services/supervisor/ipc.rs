//! JSON envelope protocol with interpreted children.
//!
//! Envelopes are newline-delimited JSON objects with a `type` field. The
//! supervisor itself interprets only `{type:"ready"}`; every other type
//! is forwarded to the application-level handler table, and replies are
//! sent back on the same channel under the correlator `id` supplied by
//! the child.
//!
//! The ready latch is a single-shot channel created *before* the reader
//! task starts, so a `ready` arriving in the same tick the channel is
//! wired up is still captured by the latch rather than consumed by the
//! generic dispatch path.

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;
#[cfg(unix)]
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::UnixStream,
    sync::{mpsc, oneshot},
};
#[cfg(unix)]
use tracing::{debug, warn};

/// Handler for one message type. Returning `Some` sends a reply under
/// the message's correlator.
pub type IpcHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Option<Value>> + Send + Sync>;

/// Application-level handlers keyed by envelope `type`.
#[derive(Default)]
pub struct IpcHandlerTable {
    handlers: DashMap<String, IpcHandler>,
}

impl IpcHandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, message_type: impl Into<String>, handler: IpcHandler) {
        self.handlers.insert(message_type.into(), handler);
    }

    #[cfg(unix)]
    fn get(&self, message_type: &str) -> Option<IpcHandler> {
        self.handlers.get(message_type).map(|h| h.clone())
    }
}

/// Sink for `progress` envelopes; the supervisor turns them into
/// `process-progress` events for the owning service.
pub type ProgressSink = Arc<dyn Fn(Value) + Send + Sync>;

/// Supervisor-side handle to one child's IPC channel.
#[cfg(unix)]
pub struct IpcChannel {
    /// Fires once with the child's `ready` envelope. Dropped senders
    /// (reader task ended, i.e. the child closed the channel) surface as
    /// a receive error.
    pub ready: oneshot::Receiver<Value>,
    /// Outbound envelopes to the child.
    pub outbound: mpsc::Sender<Value>,
}

/// Wire a connected socket up to the protocol. The returned channel's
/// ready latch is installed before any byte is read.
#[cfg(unix)]
pub fn attach(
    stream: UnixStream,
    handlers: Arc<IpcHandlerTable>,
    service: String,
    progress: ProgressSink,
) -> IpcChannel {
    let (read_half, write_half) = stream.into_split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Value>(64);
    let (ready_tx, ready_rx) = oneshot::channel::<Value>();

    // Writer task.
    let writer_service = service.clone();
    tokio::spawn(async move {
        let mut write_half = write_half;
        while let Some(envelope) = outbound_rx.recv().await {
            let mut line = envelope.to_string();
            line.push('\n');
            if let Err(e) = write_half.write_all(line.as_bytes()).await {
                debug!(service = %writer_service, error = %e, "IPC write failed; channel closed");
                break;
            }
        }
    });

    // Reader task. `ready_tx` already exists here: the latch cannot lose
    // a first-tick ready to the generic dispatch below.
    let reply_tx = outbound_tx.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(read_half).lines();
        let mut ready_tx = Some(ready_tx);
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    debug!(service = %service, error = %e, "IPC read failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let envelope: Value = match serde_json::from_str(&line) {
                Ok(Value::Object(map)) => Value::Object(map),
                Ok(_) | Err(_) => {
                    warn!(service = %service, "Dropping malformed IPC envelope");
                    continue;
                }
            };
            let Some(message_type) = envelope
                .get("type")
                .and_then(Value::as_str)
                .map(|s| s.to_string())
            else {
                warn!(service = %service, "Dropping IPC envelope without a type");
                continue;
            };

            if message_type == "ready" {
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(envelope);
                } else {
                    debug!(service = %service, "Duplicate ready envelope ignored");
                }
                continue;
            }
            if message_type == "progress" {
                progress(envelope);
                continue;
            }

            let Some(handler) = handlers.get(message_type.as_str()) else {
                warn!(service = %service, message_type, "No handler for IPC message type; dropping");
                continue;
            };
            let correlator = envelope.get("id").cloned();
            if let Some(payload) = handler(envelope).await {
                let Some(id) = correlator else {
                    warn!(service = %service, message_type, "Reply produced for envelope without correlator; dropping");
                    continue;
                };
                let reply = serde_json::json!({
                    "type": "response",
                    "id": id,
                    "payload": payload,
                });
                if reply_tx.send(reply).await.is_err() {
                    break;
                }
            }
        }
        debug!(service = %service, "IPC channel closed");
    });

    IpcChannel {
        ready: ready_rx,
        outbound: outbound_tx,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn no_progress() -> ProgressSink {
        Arc::new(|_| {})
    }

    async fn write_line(stream: &mut UnixStream, line: &str) {
        stream.write_all(line.as_bytes()).await.unwrap();
        stream.write_all(b"\n").await.unwrap();
    }

    #[tokio::test]
    async fn test_ready_latch_captures_ready() {
        let (parent, mut child) = UnixStream::pair().unwrap();
        let channel = attach(parent, Arc::new(IpcHandlerTable::new()), "svc".into(), no_progress());

        write_line(&mut child, r#"{"type":"ready","port":40123}"#).await;

        let ready = channel.ready.await.unwrap();
        assert_eq!(ready.get("port").and_then(Value::as_u64), Some(40123));
    }

    #[tokio::test]
    async fn test_ready_written_before_attach_is_not_lost() {
        let (parent, mut child) = UnixStream::pair().unwrap();

        // The child's first message is already in the socket buffer when
        // the channel is wired up.
        write_line(&mut child, r#"{"type":"ready"}"#).await;

        let channel = attach(parent, Arc::new(IpcHandlerTable::new()), "svc".into(), no_progress());
        let ready = channel.ready.await.unwrap();
        assert_eq!(ready.get("type").and_then(Value::as_str), Some("ready"));
    }

    #[tokio::test]
    async fn test_generic_message_dispatches_and_replies_with_correlator() {
        let (parent, child) = UnixStream::pair().unwrap();
        let handlers = Arc::new(IpcHandlerTable::new());
        handlers.register(
            "db-query",
            Arc::new(|envelope: Value| {
                Box::pin(async move {
                    let sql = envelope.get("sql").and_then(Value::as_str).unwrap_or("");
                    Some(serde_json::json!({ "rows": [sql.len()] }))
                }) as BoxFuture<'static, Option<Value>>
            }),
        );

        let _channel = attach(parent, handlers, "memory-service".into(), no_progress());

        let (read_half, mut write_half) = child.into_split();
        write_half
            .write_all(b"{\"type\":\"db-query\",\"id\":7,\"sql\":\"SELECT 1\"}\n")
            .await
            .unwrap();

        let mut lines = BufReader::new(read_half).lines();
        let reply: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply.get("type").and_then(Value::as_str), Some("response"));
        assert_eq!(reply.get("id").and_then(Value::as_u64), Some(7));
        assert_eq!(
            reply.pointer("/payload/rows/0").and_then(Value::as_u64),
            Some(8)
        );
    }

    #[tokio::test]
    async fn test_malformed_envelope_keeps_channel_open() {
        let (parent, mut child) = UnixStream::pair().unwrap();
        let channel = attach(parent, Arc::new(IpcHandlerTable::new()), "svc".into(), no_progress());

        write_line(&mut child, "this is not json").await;
        write_line(&mut child, r#"[1,2,3]"#).await;
        write_line(&mut child, r#"{"no_type":true}"#).await;
        write_line(&mut child, r#"{"type":"ready"}"#).await;

        // The latch still fires after three dropped envelopes.
        let ready = channel.ready.await.unwrap();
        assert_eq!(ready.get("type").and_then(Value::as_str), Some("ready"));
    }

    #[tokio::test]
    async fn test_outbound_envelopes_reach_the_child() {
        let (parent, child) = UnixStream::pair().unwrap();
        let channel = attach(parent, Arc::new(IpcHandlerTable::new()), "svc".into(), no_progress());

        channel
            .outbound
            .send(serde_json::json!({"type": "shutdown"}))
            .await
            .unwrap();

        let mut lines = BufReader::new(child).lines();
        let received: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(received.get("type").and_then(Value::as_str), Some("shutdown"));
    }

    #[tokio::test]
    async fn test_child_hangup_fails_the_latch() {
        let (parent, child) = UnixStream::pair().unwrap();
        let channel = attach(parent, Arc::new(IpcHandlerTable::new()), "svc".into(), no_progress());

        drop(child);

        assert!(channel.ready.await.is_err());
    }
}
