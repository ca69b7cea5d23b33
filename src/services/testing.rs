//! In-memory transport doubles shared by the service tests.

use std::time::Duration;

use axum::extract::ws::Message;
use futures::{
    channel::mpsc::{self, UnboundedReceiver, UnboundedSender},
    SinkExt, Stream, StreamExt,
};

use crate::services::connection_manager::MessageSink;

/// Sink whose writes land in the returned receiver.
pub(crate) fn channel_sink() -> (MessageSink, UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded();
    (Box::pin(tx.sink_map_err(axum::Error::new)), rx)
}

/// Sink that rejects every write.
pub(crate) fn failing_sink() -> MessageSink {
    let (tx, rx) = mpsc::unbounded::<Message>();
    drop(rx);
    Box::pin(tx.sink_map_err(axum::Error::new))
}

/// Sink that never accepts another write while the receiver is held and unread.
pub(crate) fn stalled_sink() -> (MessageSink, mpsc::Receiver<Message>) {
    let (mut tx, rx) = mpsc::channel(0);
    tx.try_send(Message::Text("filler".into()))
        .expect("first send into an empty channel succeeds");
    (Box::pin(tx.sink_map_err(axum::Error::new)), rx)
}

/// Inbound frame stream fed by the returned sender.
pub(crate) fn inbound() -> (
    UnboundedSender<Result<Message, axum::Error>>,
    UnboundedReceiver<Result<Message, axum::Error>>,
) {
    mpsc::unbounded()
}

/// Next message within half a second, or `None` on timeout or closed stream.
pub(crate) async fn recv<S>(rx: &mut S) -> Option<Message>
where
    S: Stream<Item = Message> + Unpin,
{
    tokio::time::timeout(Duration::from_millis(500), rx.next())
        .await
        .ok()
        .flatten()
}
