// src/services/session.rs

//! # Connection Session
//!
//! Drives one WebSocket connection from accept to teardown: register, replay
//! the backlog, relay inbound text to the registry, then unregister and close.

use std::{sync::Arc, time::Duration};

use axum::extract::ws::{Message, WebSocket};
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::services::connection_manager::{
    Connection, ConnectionId, ConnectionRegistry, MessageSink, Registration, ReplayWriter,
    SHUTDOWN_GRACE,
};

/// Interval between server-initiated pings while a session is idle.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(120);

/// Why a session's receive loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The peer sent a close frame.
    ClosedByPeer,
    /// The caller's token or the process-wide shutdown fired.
    Cancelled,
    /// Reading the next frame failed.
    ReadError,
    /// The inbound stream ended without a close frame.
    StreamEnded,
    /// A write to this connection failed (keep-alive ping or a broadcast).
    SendFailed,
}

/// Splits an upgraded socket and runs a session on it until it terminates.
pub async fn serve_socket(
    socket: WebSocket,
    registry: Arc<ConnectionRegistry>,
    cancel: CancellationToken,
) {
    let (ws_sender, ws_receiver) = socket.split();
    let session = ConnectionSession::register(registry, Box::pin(ws_sender), cancel).await;
    let id = session.id();
    info!("New WebSocket connection established: {}", id);

    let end = session.run(ws_receiver).await;
    info!("WebSocket handler finished for client {} ({:?})", id, end);
}

/// A registered connection whose backlog has not been replayed yet. Until
/// `run` replays it, live broadcasts to this connection wait on its writer.
pub struct ConnectionSession {
    live: LiveSession,
    backlog: Vec<String>,
    writer: ReplayWriter,
}

struct LiveSession {
    registry: Arc<ConnectionRegistry>,
    id: ConnectionId,
    connection: Arc<Connection>,
    cancel: CancellationToken,
}

impl ConnectionSession {
    /// Registers the write half with the registry and snapshots the backlog.
    pub async fn register(
        registry: Arc<ConnectionRegistry>,
        sink: MessageSink,
        cancel: CancellationToken,
    ) -> Self {
        let connection = Arc::new(Connection::new(sink));
        let Registration {
            id,
            backlog,
            writer,
        } = registry.register_with_backlog(Arc::clone(&connection)).await;
        Self {
            live: LiveSession {
                registry,
                id,
                connection,
                cancel,
            },
            backlog,
            writer,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.live.id
    }

    /// Replays the backlog, relays inbound frames until termination, then tears
    /// down. Teardown runs exactly once on every exit path.
    pub async fn run<R>(self, mut inbound: R) -> SessionEnd
    where
        R: Stream<Item = Result<Message, axum::Error>> + Unpin,
    {
        let ConnectionSession {
            live,
            backlog,
            writer,
        } = self;
        let shutdown = live.registry.shutdown_token();

        let replayed = live.replay_backlog(writer, backlog, &shutdown).await;
        debug!("Replayed {} backlog messages to {}", replayed, live.id);

        let end = live.receive_loop(&mut inbound, &shutdown).await;
        live.teardown().await;
        end
    }
}

impl LiveSession {
    /// Sends the history snapshot to this connection only, holding its write
    /// lock throughout. Stops early, without error, on cancellation or a failed
    /// write.
    async fn replay_backlog(
        &self,
        writer: ReplayWriter,
        backlog: Vec<String>,
        shutdown: &CancellationToken,
    ) -> usize {
        if self.is_cancelled(shutdown) {
            return 0;
        }
        let abort = either_cancelled(&self.cancel, shutdown);
        match self.connection.replay(writer, backlog, abort).await {
            Ok(replayed) => replayed,
            Err(e) => {
                debug!("Backlog replay to {} stopped: {}", self.id, e);
                0
            }
        }
    }

    async fn receive_loop<R>(&self, inbound: &mut R, shutdown: &CancellationToken) -> SessionEnd
    where
        R: Stream<Item = Result<Message, axum::Error>> + Unpin,
    {
        let mut keep_alive = tokio::time::interval(KEEP_ALIVE_INTERVAL);
        // The first tick completes immediately.
        keep_alive.tick().await;

        loop {
            if !self.connection.is_open() {
                return SessionEnd::SendFailed;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return SessionEnd::Cancelled,
                _ = shutdown.cancelled() => return SessionEnd::Cancelled,
                frame = inbound.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        debug!("Received message from {}: {}", self.id, text);
                        self.registry.broadcast(&text, self.id).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!("Client {} closed connection: {:?}", self.id, frame);
                        self.connection.mark_closed();
                        return SessionEnd::ClosedByPeer;
                    }
                    Some(Ok(_)) => debug!("Ignoring non-text frame from {}", self.id),
                    Some(Err(e)) => {
                        warn!("WebSocket error for client {}: {}", self.id, e);
                        return SessionEnd::ReadError;
                    }
                    None => return SessionEnd::StreamEnded,
                },
                _ = keep_alive.tick() => {
                    let abort = either_cancelled(&self.cancel, shutdown);
                    if let Err(e) = self.connection.send_until(Message::Ping(Vec::new()), abort).await {
                        debug!("Keep-alive to {} failed: {}", self.id, e);
                        return SessionEnd::SendFailed;
                    }
                }
            }
        }
    }

    async fn teardown(&self) {
        self.registry.unregister(self.id).await;
        if !self.connection.is_open() {
            return;
        }
        match tokio::time::timeout(SHUTDOWN_GRACE, self.connection.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Ignoring close error for {}: {}", self.id, e),
            Err(_) => debug!("Close handshake for {} timed out", self.id),
        }
    }

    fn is_cancelled(&self, shutdown: &CancellationToken) -> bool {
        self.cancel.is_cancelled() || shutdown.is_cancelled()
    }
}

/// Resolves when either token is cancelled.
async fn either_cancelled(a: &CancellationToken, b: &CancellationToken) {
    tokio::select! {
        _ = a.cancelled() => {}
        _ = b.cancelled() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::connection_manager::CLOSE_REASON;
    use crate::services::testing::{channel_sink, failing_sink, inbound, recv, stalled_sink};
    use axum::extract::ws::{close_code, CloseFrame};
    use futures::channel::mpsc::UnboundedReceiver;
    use tokio::task::JoinHandle;
    use uuid::Uuid;

    struct Client {
        id: ConnectionId,
        frames: futures::channel::mpsc::UnboundedSender<Result<Message, axum::Error>>,
        outbound: UnboundedReceiver<Message>,
        task: JoinHandle<SessionEnd>,
    }

    async fn connect(registry: &Arc<ConnectionRegistry>, cancel: CancellationToken) -> Client {
        let (sink, outbound) = channel_sink();
        let (frames, stream) = inbound();
        let session = ConnectionSession::register(Arc::clone(registry), sink, cancel).await;
        let id = session.id();
        let task = tokio::spawn(session.run(stream));
        Client {
            id,
            frames,
            outbound,
            task,
        }
    }

    fn text(s: &str) -> Message {
        Message::Text(s.to_string())
    }

    fn normal_close() -> Message {
        Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: CLOSE_REASON.into(),
        }))
    }

    async fn finish(task: JoinHandle<SessionEnd>) -> SessionEnd {
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("session should terminate")
            .expect("session task should not panic")
    }

    #[tokio::test]
    async fn late_joiner_gets_backlog_then_live_messages() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut a = connect(&registry, CancellationToken::new()).await;

        a.frames.unbounded_send(Ok(text("hello"))).unwrap();
        assert_eq!(recv(&mut a.outbound).await, Some(text("hello")));

        let mut b = connect(&registry, CancellationToken::new()).await;
        assert_eq!(recv(&mut b.outbound).await, Some(text("hello")));

        a.frames.unbounded_send(Ok(text("world"))).unwrap();
        assert_eq!(recv(&mut a.outbound).await, Some(text("world")));
        assert_eq!(recv(&mut b.outbound).await, Some(text("world")));
        assert_eq!(registry.connection_count().await, 2);
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn peer_close_unregisters_without_server_close() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut client = connect(&registry, CancellationToken::new()).await;

        client.frames.unbounded_send(Ok(Message::Close(None))).unwrap();

        assert_eq!(finish(client.task).await, SessionEnd::ClosedByPeer);
        assert_eq!(registry.connection_count().await, 0);
        assert_eq!(recv(&mut client.outbound).await, None);
    }

    #[tokio::test]
    async fn read_error_tears_down_with_normal_close() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut client = connect(&registry, CancellationToken::new()).await;

        client
            .frames
            .unbounded_send(Err(axum::Error::new(std::io::Error::other("reset"))))
            .unwrap();

        assert_eq!(finish(client.task).await, SessionEnd::ReadError);
        assert_eq!(registry.connection_count().await, 0);
        assert_eq!(recv(&mut client.outbound).await, Some(normal_close()));
    }

    #[tokio::test]
    async fn stream_end_tears_down() {
        let registry = Arc::new(ConnectionRegistry::new());
        let client = connect(&registry, CancellationToken::new()).await;

        drop(client.frames);

        assert_eq!(finish(client.task).await, SessionEnd::StreamEnded);
        assert_eq!(registry.connection_count().await, 0);
    }

    #[tokio::test]
    async fn caller_cancellation_ends_session() {
        let registry = Arc::new(ConnectionRegistry::new());
        let cancel = CancellationToken::new();
        let mut client = connect(&registry, cancel.clone()).await;

        cancel.cancel();

        assert_eq!(finish(client.task).await, SessionEnd::Cancelled);
        assert_eq!(registry.connection_count().await, 0);
        assert_eq!(recv(&mut client.outbound).await, Some(normal_close()));
    }

    #[tokio::test]
    async fn shutdown_ends_every_session_with_single_close() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut clients = Vec::new();
        for _ in 0..3 {
            clients.push(connect(&registry, CancellationToken::new()).await);
        }

        registry.shutdown().await;

        for mut client in clients {
            assert_eq!(finish(client.task).await, SessionEnd::Cancelled);
            assert_eq!(recv(&mut client.outbound).await, Some(normal_close()));
            assert_eq!(recv(&mut client.outbound).await, None);
        }
        assert_eq!(registry.connection_count().await, 0);
    }

    #[tokio::test]
    async fn non_text_frames_are_ignored() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut client = connect(&registry, CancellationToken::new()).await;

        client.frames.unbounded_send(Ok(Message::Binary(vec![1, 2, 3]))).unwrap();
        client.frames.unbounded_send(Ok(Message::Pong(Vec::new()))).unwrap();
        client.frames.unbounded_send(Ok(text("after"))).unwrap();

        assert_eq!(recv(&mut client.outbound).await, Some(text("after")));
        assert_eq!(registry.snapshot_backlog().await, vec!["after".to_string()]);
    }

    #[tokio::test]
    async fn replay_is_skipped_when_already_shutting_down() {
        let registry = Arc::new(ConnectionRegistry::new());
        registry.broadcast("old", Uuid::new_v4()).await;
        registry.shutdown().await;

        let mut client = connect(&registry, CancellationToken::new()).await;

        assert_eq!(finish(client.task).await, SessionEnd::Cancelled);
        assert_eq!(recv(&mut client.outbound).await, Some(normal_close()));
    }

    #[tokio::test]
    async fn broken_connection_stops_replay_and_unregisters() {
        let registry = Arc::new(ConnectionRegistry::new());
        for i in 0..3 {
            registry.broadcast(&format!("m{i}"), Uuid::new_v4()).await;
        }

        let (frames, stream) = inbound();
        let session =
            ConnectionSession::register(Arc::clone(&registry), failing_sink(), CancellationToken::new())
                .await;
        let task = tokio::spawn(session.run(stream));

        assert_eq!(finish(task).await, SessionEnd::SendFailed);
        assert_eq!(registry.connection_count().await, 0);
        drop(frames);
    }

    #[tokio::test]
    async fn live_message_waits_for_backlog_replay_to_finish() {
        let registry = Arc::new(ConnectionRegistry::new());
        registry.broadcast("h1", Uuid::new_v4()).await;
        registry.broadcast("h2", Uuid::new_v4()).await;

        let (sink, mut outbound) = stalled_sink();
        let (_frames, stream) = inbound();
        let session =
            ConnectionSession::register(Arc::clone(&registry), sink, CancellationToken::new()).await;
        let task = tokio::spawn(session.run(stream));

        // Replay is now blocked on h1; queue a live message behind it.
        let live = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.broadcast("live", Uuid::new_v4()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(recv(&mut outbound).await);
        }
        assert_eq!(
            seen,
            vec![
                Some(text("filler")),
                Some(text("h1")),
                Some(text("h2")),
                Some(text("live")),
            ]
        );
        assert_eq!(live.await.unwrap().delivered, 1);
        task.abort();
    }

    #[tokio::test]
    async fn message_sent_during_registration_is_delivered_once() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (sink, mut outbound) = channel_sink();
        let (_frames, stream) = inbound();
        let session =
            ConnectionSession::register(Arc::clone(&registry), sink, CancellationToken::new()).await;

        let broadcast = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.broadcast("x", Uuid::new_v4()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let task = tokio::spawn(session.run(stream));

        assert_eq!(recv(&mut outbound).await, Some(text("x")));
        assert_eq!(recv(&mut outbound).await, None);
        assert_eq!(broadcast.await.unwrap().delivered, 1);
        task.abort();
    }

    #[tokio::test]
    async fn backlog_snapshot_excludes_later_broadcasts() {
        let registry = Arc::new(ConnectionRegistry::new());
        registry.broadcast("before", Uuid::new_v4()).await;

        let mut client = connect(&registry, CancellationToken::new()).await;
        assert_eq!(recv(&mut client.outbound).await, Some(text("before")));

        registry.broadcast("after", Uuid::new_v4()).await;
        assert_eq!(recv(&mut client.outbound).await, Some(text("after")));
        assert_eq!(recv(&mut client.outbound).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_sends_keep_alive_ping() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut client = connect(&registry, CancellationToken::new()).await;

        tokio::time::sleep(KEEP_ALIVE_INTERVAL + Duration::from_secs(1)).await;

        assert_eq!(recv(&mut client.outbound).await, Some(Message::Ping(Vec::new())));
        assert_eq!(registry.connection_count().await, 1);
        assert!(!client.task.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_keep_alive_ping_ends_session() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (_frames, stream) = inbound();
        let session =
            ConnectionSession::register(Arc::clone(&registry), failing_sink(), CancellationToken::new())
                .await;
        let task = tokio::spawn(session.run(stream));

        tokio::time::sleep(KEEP_ALIVE_INTERVAL + Duration::from_secs(1)).await;

        assert!(task.is_finished());
        assert_eq!(task.await.unwrap(), SessionEnd::SendFailed);
        assert_eq!(registry.connection_count().await, 0);
    }
}
