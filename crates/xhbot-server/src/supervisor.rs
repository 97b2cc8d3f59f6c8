use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use chrono::Utc;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use xhbot_core::{HandlerError, MessageHandler};

use crate::registry::{Connection, ConnectionRegistry};

/// How long queued replies may keep flushing after the reader stops.
const WRITER_DRAIN: Duration = Duration::from_secs(2);

/// Why a connection's read loop ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitReason {
    /// Client sent a close frame or the stream ended.
    Closed,
    /// Receive failed at the transport level.
    TransportError,
    /// Nothing arrived within the idle timeout.
    Idle,
    /// The outbound side is gone; replies can no longer be delivered.
    WriterGone,
}

/// Runs one authenticated connection from registration to unregistration.
pub struct Supervisor {
    registry: Arc<ConnectionRegistry>,
    handler: Arc<dyn MessageHandler>,
    heartbeat_interval: Duration,
    client_timeout: Duration,
}

impl Supervisor {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        handler: Arc<dyn MessageHandler>,
        heartbeat_interval: Duration,
        client_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            handler,
            heartbeat_interval,
            client_timeout,
        }
    }

    /// Serve an upgraded socket. Authentication has already happened during
    /// the handshake.
    pub async fn serve(&self, socket: WebSocket, namespace: String) {
        let (conn, rx) = self.registry.register(&namespace);
        tracing::info!(connection_id = %conn.id(), namespace = %namespace, "bot connected");

        let (sink, stream) = socket.split();
        self.run(conn, rx, stream, sink).await;
    }

    /// Drive a registered connection over any message stream/sink pair.
    ///
    /// The reader handles inbound frames one at a time and queues each reply
    /// before reading the next frame, so replies leave in request order. The
    /// writer is the sole owner of the sink. Whichever side stops first ends
    /// the connection, and the registry entry is removed on every exit path.
    /// Replies already queued when the reader stops get a bounded drain.
    pub async fn run<S, E, K>(
        &self,
        conn: Arc<Connection>,
        outbound: mpsc::Receiver<String>,
        stream: S,
        sink: K,
    ) -> ExitReason
    where
        S: Stream<Item = Result<WsMessage, E>> + Unpin + Send + 'static,
        E: std::fmt::Display + Send + 'static,
        K: Sink<WsMessage> + Unpin + Send + 'static,
        K::Error: std::fmt::Display,
    {
        let (drain_tx, drain_rx) = oneshot::channel();
        let mut writer = tokio::spawn(write_loop(
            sink,
            outbound,
            drain_rx,
            self.heartbeat_interval,
            conn.id().to_string(),
        ));
        let mut reader = tokio::spawn(read_loop(
            Arc::clone(&conn),
            stream,
            Arc::clone(&self.handler),
            self.client_timeout,
        ));

        let reason = tokio::select! {
            res = &mut reader => res.unwrap_or_else(|e| {
                tracing::error!(connection_id = %conn.id(), error = %e, "reader task failed");
                ExitReason::TransportError
            }),
            _ = &mut writer => ExitReason::WriterGone,
        };
        reader.abort();
        if reason != ExitReason::WriterGone {
            let _ = drain_tx.send(());
            if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
                tracing::debug!(connection_id = %conn.id(), "writer drain timed out");
            }
        }
        writer.abort();

        self.registry.unregister(conn.id());
        tracing::info!(
            connection_id = %conn.id(),
            reason = ?reason,
            connected_secs = (Utc::now() - conn.connected_at()).num_seconds(),
            "bot disconnected"
        );
        reason
    }
}

/// Forward queued frames to the socket and ping on every heartbeat. Once
/// `drain` fires, stop accepting frames and flush what is already queued.
async fn write_loop<K>(
    mut sink: K,
    mut rx: mpsc::Receiver<String>,
    mut drain: oneshot::Receiver<()>,
    heartbeat: Duration,
    connection_id: String,
) where
    K: Sink<WsMessage> + Unpin,
    K::Error: std::fmt::Display,
{
    let mut ping_interval = tokio::time::interval(heartbeat);
    ping_interval.tick().await; // consume first immediate tick

    loop {
        tokio::select! {
            _ = &mut drain => {
                rx.close();
                while let Some(text) = rx.recv().await {
                    if sink.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                break;
            }
            msg = rx.recv() => {
                let Some(text) = msg else { break };
                if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
                    tracing::info!(connection_id = %connection_id, error = %e, "send failed");
                    break;
                }
            }
            _ = ping_interval.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(axum::body::Bytes::new())).await {
                    tracing::info!(connection_id = %connection_id, error = %e, "ping failed");
                    break;
                }
                tracing::trace!(connection_id = %connection_id, "sent ping");
            }
        }
    }
}

async fn read_loop<S, E>(
    conn: Arc<Connection>,
    mut stream: S,
    handler: Arc<dyn MessageHandler>,
    client_timeout: Duration,
) -> ExitReason
where
    S: Stream<Item = Result<WsMessage, E>> + Unpin,
    E: std::fmt::Display,
{
    loop {
        let msg = match tokio::time::timeout(client_timeout, stream.next()).await {
            Err(_) => {
                tracing::info!(connection_id = %conn.id(), "no traffic within idle timeout");
                return ExitReason::Idle;
            }
            Ok(None) => return ExitReason::Closed,
            Ok(Some(Err(e))) => {
                tracing::info!(connection_id = %conn.id(), error = %e, "ws transport error");
                return ExitReason::TransportError;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        let raw = match msg {
            WsMessage::Text(text) => text.to_string(),
            WsMessage::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    let reply = error_reply("invalid_payload", "binary frame is not valid UTF-8");
                    if conn.send(reply.to_string()).await.is_err() {
                        return ExitReason::WriterGone;
                    }
                    continue;
                }
            },
            WsMessage::Close(_) => return ExitReason::Closed,
            // Pings are answered by the transport; pongs only reset the idle timer.
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
        };
        tracing::debug!(connection_id = %conn.id(), len = raw.len(), "message received");

        let payload = match handler.handle(&raw).await {
            Ok(reply) => {
                if let Some(identity) = reply.identity {
                    conn.associate(identity);
                }
                reply.payload
            }
            Err(e) => {
                tracing::warn!(
                    connection_id = %conn.id(),
                    error = %e,
                    kind = e.error_kind(),
                    "message handler failed"
                );
                handler_error_reply(&e)
            }
        };

        if conn.send(payload.to_string()).await.is_err() {
            return ExitReason::WriterGone;
        }
    }
}

fn error_reply(kind: &str, message: &str) -> serde_json::Value {
    serde_json::json!({ "type": "error", "kind": kind, "message": message })
}

fn handler_error_reply(err: &HandlerError) -> serde_json::Value {
    error_reply(err.error_kind(), &err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::channel::mpsc as fmpsc;
    use xhbot_core::{GroupUserId, Reply};

    use crate::registry::DEFAULT_NAMESPACE;

    /// Replies with the request text; `fail` triggers a handler error and
    /// `slow:<ms>` sleeps first.
    struct Scripted;

    #[async_trait]
    impl MessageHandler for Scripted {
        async fn handle(&self, raw: &str) -> Result<Reply, HandlerError> {
            if raw == "fail" {
                return Err(HandlerError::Internal("boom".into()));
            }
            if let Some(ms) = raw.strip_prefix("slow:") {
                let ms: u64 = ms.parse().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            let reply = Reply::new(serde_json::json!({ "echo": raw }));
            Ok(if raw == "member" {
                reply.with_identity(GroupUserId::new(1, 2))
            } else {
                reply
            })
        }
    }

    type Inbound = Result<WsMessage, String>;

    struct Harness {
        registry: Arc<ConnectionRegistry>,
        supervisor: Arc<Supervisor>,
    }

    fn harness(client_timeout: Duration) -> Harness {
        let registry = Arc::new(ConnectionRegistry::new(32));
        let supervisor = Arc::new(Supervisor::new(
            Arc::clone(&registry),
            Arc::new(Scripted),
            Duration::from_secs(3600),
            client_timeout,
        ));
        Harness {
            registry,
            supervisor,
        }
    }

    /// Spawn a supervised connection wired to in-memory channels.
    fn connect(
        h: &Harness,
    ) -> (
        Arc<Connection>,
        fmpsc::UnboundedSender<Inbound>,
        fmpsc::UnboundedReceiver<WsMessage>,
        tokio::task::JoinHandle<ExitReason>,
    ) {
        let (conn, outbound) = h.registry.register(DEFAULT_NAMESPACE);
        let (in_tx, in_rx) = fmpsc::unbounded::<Inbound>();
        let (out_tx, out_rx) = fmpsc::unbounded::<WsMessage>();
        let supervisor = Arc::clone(&h.supervisor);
        let c = Arc::clone(&conn);
        let task = tokio::spawn(async move { supervisor.run(c, outbound, in_rx, out_tx).await });
        (conn, in_tx, out_rx, task)
    }

    fn text(s: &str) -> Inbound {
        Ok(WsMessage::Text(s.to_string().into()))
    }

    async fn next_text(rx: &mut fmpsc::UnboundedReceiver<WsMessage>) -> serde_json::Value {
        loop {
            match rx.next().await.expect("sink closed") {
                WsMessage::Text(t) => return serde_json::from_str(t.as_str()).unwrap(),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn replies_preserve_request_order() {
        let h = harness(Duration::from_secs(60));
        let (_conn, in_tx, mut out_rx, _task) = connect(&h);

        // Earlier requests are slower; order must still hold.
        let requests = ["slow:30", "slow:20", "slow:10", "a", "b"];
        for r in requests {
            in_tx.unbounded_send(text(r)).unwrap();
        }
        for r in requests {
            assert_eq!(next_text(&mut out_rx).await["echo"], r);
        }
    }

    #[tokio::test]
    async fn handler_error_produces_error_reply_and_loop_continues() {
        let h = harness(Duration::from_secs(60));
        let (conn, in_tx, mut out_rx, _task) = connect(&h);

        in_tx.unbounded_send(text("fail")).unwrap();
        in_tx.unbounded_send(text("after")).unwrap();

        let err = next_text(&mut out_rx).await;
        assert_eq!(err["type"], "error");
        assert_eq!(err["kind"], "internal");
        assert_eq!(next_text(&mut out_rx).await["echo"], "after");
        assert!(h.registry.get(conn.id()).is_some());
    }

    #[tokio::test]
    async fn invalid_utf8_binary_gets_error_reply() {
        let h = harness(Duration::from_secs(60));
        let (_conn, in_tx, mut out_rx, _task) = connect(&h);

        in_tx
            .unbounded_send(Ok(WsMessage::Binary(vec![0xff, 0xfe].into())))
            .unwrap();
        in_tx
            .unbounded_send(Ok(WsMessage::Binary(b"bin".to_vec().into())))
            .unwrap();

        assert_eq!(next_text(&mut out_rx).await["kind"], "invalid_payload");
        assert_eq!(next_text(&mut out_rx).await["echo"], "bin");
    }

    #[tokio::test]
    async fn transport_error_unregisters() {
        let h = harness(Duration::from_secs(60));
        let (conn, in_tx, _out_rx, task) = connect(&h);
        assert_eq!(h.registry.count(), 1);

        in_tx.unbounded_send(Err("connection reset".into())).unwrap();
        assert_eq!(task.await.unwrap(), ExitReason::TransportError);
        assert!(h.registry.get(conn.id()).is_none());
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn close_frame_unregisters() {
        let h = harness(Duration::from_secs(60));
        let (conn, in_tx, _out_rx, task) = connect(&h);

        in_tx.unbounded_send(Ok(WsMessage::Close(None))).unwrap();
        assert_eq!(task.await.unwrap(), ExitReason::Closed);
        assert!(h.registry.get(conn.id()).is_none());
    }

    #[tokio::test]
    async fn queued_replies_flush_after_close() {
        let h = harness(Duration::from_secs(60));
        let (_conn, in_tx, mut out_rx, task) = connect(&h);

        for i in 0..20 {
            in_tx.unbounded_send(text(&format!("m{i}"))).unwrap();
        }
        in_tx.unbounded_send(Ok(WsMessage::Close(None))).unwrap();
        assert_eq!(task.await.unwrap(), ExitReason::Closed);

        for i in 0..20 {
            assert_eq!(next_text(&mut out_rx).await["echo"], format!("m{i}"));
        }
    }

    #[tokio::test]
    async fn stream_end_unregisters() {
        let h = harness(Duration::from_secs(60));
        let (conn, in_tx, _out_rx, task) = connect(&h);

        drop(in_tx);
        assert_eq!(task.await.unwrap(), ExitReason::Closed);
        assert!(h.registry.get(conn.id()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_is_closed() {
        let h = harness(Duration::from_secs(5));
        let (conn, _in_tx, _out_rx, task) = connect(&h);

        assert_eq!(task.await.unwrap(), ExitReason::Idle);
        assert!(h.registry.get(conn.id()).is_none());
    }

    #[tokio::test]
    async fn writer_failure_unregisters() {
        let h = harness(Duration::from_secs(60));
        let (conn, in_tx, out_rx, task) = connect(&h);

        drop(out_rx);
        in_tx.unbounded_send(text("hello")).unwrap();
        assert_eq!(task.await.unwrap(), ExitReason::WriterGone);
        assert!(h.registry.get(conn.id()).is_none());
    }

    #[tokio::test]
    async fn handler_identity_is_recorded() {
        let h = harness(Duration::from_secs(60));
        let (conn, in_tx, mut out_rx, _task) = connect(&h);

        in_tx.unbounded_send(text("member")).unwrap();
        let _ = next_text(&mut out_rx).await;
        assert!(conn.serves(&GroupUserId::new(1, 2)));
    }

    #[tokio::test]
    async fn background_sends_share_the_writer() {
        let h = harness(Duration::from_secs(60));
        let (conn, in_tx, mut out_rx, _task) = connect(&h);

        conn.send(r#"{"type":"alert"}"#.into()).await.unwrap();
        in_tx.unbounded_send(text("after")).unwrap();

        assert_eq!(next_text(&mut out_rx).await["type"], "alert");
        assert_eq!(next_text(&mut out_rx).await["echo"], "after");
    }

    #[tokio::test]
    async fn failure_is_isolated_to_one_connection() {
        let h = harness(Duration::from_secs(60));
        let (broken, broken_tx, _broken_out, broken_task) = connect(&h);
        let (healthy, healthy_tx, mut healthy_out, _healthy_task) = connect(&h);

        broken_tx.unbounded_send(Err("reset".into())).unwrap();
        let _ = broken_task.await.unwrap();

        healthy_tx.unbounded_send(text("still here")).unwrap();
        assert_eq!(next_text(&mut healthy_out).await["echo"], "still here");
        assert!(h.registry.get(broken.id()).is_none());
        assert!(h.registry.get(healthy.id()).is_some());
    }
}
