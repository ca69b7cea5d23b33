// src/services/connection_manager.rs

//! # Connection Manager Service
//!
//! Owns the live set of WebSocket connections and the bounded history of recent
//! messages. Every text message is fanned out to all open connections (the
//! sender included) and appended to the history replayed to late joiners.

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::extract::ws::{close_code, CloseFrame, Message};
use futures::{future::join_all, Sink, SinkExt};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::{RelayError, RelayResult};
use crate::services::history::RecentMessageBuffer;

/// How long `shutdown` waits for close handshakes before abandoning stragglers.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Reason sent with every server-initiated normal closure.
pub const CLOSE_REASON: &str = "Server shutting down";

pub type ConnectionId = Uuid;

/// Write half of a client transport.
pub type MessageSink = Pin<Box<dyn Sink<Message, Error = axum::Error> + Send>>;

type ConnectionMap = Mutex<HashMap<ConnectionId, Arc<Connection>>>;

/// One live client stream, as seen by the registry.
///
/// Writes go through a per-connection lock, so a broadcast, a keep-alive ping
/// and a close handshake never interleave on the same socket while writes to
/// different connections proceed in parallel.
pub struct Connection {
    sink: Arc<Mutex<MessageSink>>,
    open: AtomicBool,
}

/// Exclusive write access to a connection, held from registration until its
/// backlog has been replayed. Live broadcasts queue behind it.
pub struct ReplayWriter {
    sink: OwnedMutexGuard<MessageSink>,
}

/// A freshly registered connection together with the history it has not
/// received live.
pub struct Registration {
    pub id: ConnectionId,
    pub backlog: Vec<String>,
    pub writer: ReplayWriter,
}

impl Connection {
    pub fn new(sink: MessageSink) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
            open: AtomicBool::new(true),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Records that the transport is no longer open (e.g. the peer sent a close frame).
    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }

    /// Sends one message. A failed write marks the connection closed.
    pub async fn send(&self, message: Message) -> RelayResult<()> {
        let mut sink = self.sink.lock().await;
        if !self.is_open() {
            return Err(RelayError::Closed);
        }
        if let Err(e) = sink.send(message).await {
            self.mark_closed();
            return Err(RelayError::Transport(e));
        }
        Ok(())
    }

    /// Like [`Connection::send`], but gives up as soon as `abort` resolves.
    pub async fn send_until<F>(&self, message: Message, abort: F) -> RelayResult<()>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            biased;
            _ = abort => Err(RelayError::Cancelled),
            result = self.send(message) => result,
        }
    }

    /// Takes the write lock for the duration of a backlog replay.
    pub async fn lock_writer(&self) -> ReplayWriter {
        ReplayWriter {
            sink: Arc::clone(&self.sink).lock_owned().await,
        }
    }

    /// Sends `backlog` in order under a single hold of the write lock, so no
    /// other write lands between two entries. Stops at the first failed write
    /// or when `abort` resolves. Returns the number of entries sent.
    pub async fn replay<F>(
        &self,
        mut writer: ReplayWriter,
        backlog: Vec<String>,
        abort: F,
    ) -> RelayResult<usize>
    where
        F: Future<Output = ()>,
    {
        let sends = async {
            let mut sent = 0;
            for payload in backlog {
                if !self.is_open() {
                    return Err(RelayError::Closed);
                }
                if let Err(e) = writer.sink.send(Message::Text(payload)).await {
                    self.mark_closed();
                    return Err(RelayError::Transport(e));
                }
                sent += 1;
            }
            Ok(sent)
        };

        tokio::select! {
            biased;
            _ = abort => Err(RelayError::Cancelled),
            result = sends => result,
        }
    }

    /// Starts a normal-closure handshake. No-op if the connection is already closed.
    pub async fn close(&self) -> RelayResult<()> {
        let mut sink = self.sink.lock().await;
        if !self.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let frame = CloseFrame {
            code: close_code::NORMAL,
            reason: CLOSE_REASON.into(),
        };
        sink.send(Message::Close(Some(frame))).await?;
        Ok(())
    }
}

/// Summary of one fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanoutOutcome {
    pub attempted: usize,
    pub delivered: usize,
}

/// The central structure for managing WebSocket connections.
pub struct ConnectionRegistry {
    active_connections: ConnectionMap,
    history: Mutex<RecentMessageBuffer>,
    shutdown_token: CancellationToken,
    shutdown_grace: Duration,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::with_shutdown_grace(SHUTDOWN_GRACE)
    }

    pub fn with_shutdown_grace(shutdown_grace: Duration) -> Self {
        ConnectionRegistry {
            active_connections: Mutex::new(HashMap::new()),
            history: Mutex::new(RecentMessageBuffer::new()),
            shutdown_token: CancellationToken::new(),
            shutdown_grace,
        }
    }

    /// Adds a connection under a freshly generated id, making it a broadcast target.
    pub async fn register(&self, connection: Arc<Connection>) -> ConnectionId {
        let id = Uuid::new_v4();
        self.active_connections.lock().await.insert(id, connection);
        info!("Connection {} registered.", id);
        id
    }

    /// Removes a connection. Removing an unknown id is a no-op.
    pub async fn unregister(&self, id: ConnectionId) {
        let mut map = self.active_connections.lock().await;
        if map.remove(&id).is_some() {
            info!("Connection {} removed.", id);
        } else {
            debug!("Connection {} was already removed.", id);
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.active_connections.lock().await.len()
    }

    /// Registers a connection and snapshots the history in one step.
    ///
    /// Runs under the history lock, the same lock `broadcast` holds while it
    /// records a payload and picks its recipients, so every message is either
    /// in the returned backlog or delivered live, never both. The connection's
    /// write lock is taken before it becomes visible, so live traffic waits
    /// until the backlog has been replayed through the returned writer.
    pub async fn register_with_backlog(&self, connection: Arc<Connection>) -> Registration {
        let history = self.history.lock().await;
        let writer = connection.lock_writer().await;
        let id = Uuid::new_v4();
        self.active_connections.lock().await.insert(id, connection);
        let backlog = history.snapshot();
        drop(history);

        info!("Connection {} registered with {} backlog messages.", id, backlog.len());
        Registration {
            id,
            backlog,
            writer,
        }
    }

    /// Point-in-time copy of the recent message history, oldest first.
    pub async fn snapshot_backlog(&self) -> Vec<String> {
        self.history.lock().await.snapshot()
    }

    /// Records `payload` in the history and sends it to every open connection,
    /// sender included.
    ///
    /// All sends run concurrently and this returns once every one of them has
    /// settled. Individual failures are logged and dropped; they never affect
    /// other recipients or the caller.
    pub async fn broadcast(&self, payload: &str, sender_id: ConnectionId) -> FanoutOutcome {
        let recipients: Vec<(ConnectionId, Arc<Connection>)> = {
            let mut history = self.history.lock().await;
            history.push(payload.to_owned());
            self.active_connections
                .lock()
                .await
                .iter()
                .filter(|(_, conn)| conn.is_open())
                .map(|(id, conn)| (*id, Arc::clone(conn)))
                .collect()
        };

        let sends = recipients.iter().map(|(id, conn)| async move {
            let message = Message::Text(payload.to_owned());
            match conn.send_until(message, self.shutdown_token.cancelled()).await {
                Ok(()) => true,
                Err(RelayError::Cancelled) => {
                    debug!("Send to {} cancelled by shutdown.", id);
                    false
                }
                Err(e) => {
                    debug!("Dropping failed send to {}: {}", id, e);
                    false
                }
            }
        });
        let delivered = join_all(sends).await.into_iter().filter(|ok| *ok).count();

        let outcome = FanoutOutcome {
            attempted: recipients.len(),
            delivered,
        };
        info!(
            "Broadcast from {} delivered to {}/{} connections.",
            sender_id, outcome.delivered, outcome.attempted
        );
        outcome
    }

    /// Clone of the process-wide shutdown signal observed by every session.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Signals every session to stop, then closes all still-open connections,
    /// waiting at most the grace period. Connections that do not finish in time
    /// are abandoned.
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();

        let open: Vec<(ConnectionId, Arc<Connection>)> = self
            .active_connections
            .lock()
            .await
            .iter()
            .filter(|(_, conn)| conn.is_open())
            .map(|(id, conn)| (*id, Arc::clone(conn)))
            .collect();

        info!("Shutting down: closing {} open connections.", open.len());

        let closes = join_all(open.iter().map(|(id, conn)| async move {
            if let Err(e) = conn.close().await {
                debug!("Ignoring close error for {}: {}", id, e);
            }
        }));

        if tokio::time::timeout(self.shutdown_grace, closes).await.is_err() {
            warn!(
                "Shutdown grace period of {:?} elapsed; abandoning unresponsive connections.",
                self.shutdown_grace
            );
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
