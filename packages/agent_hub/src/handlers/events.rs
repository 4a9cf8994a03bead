use axum::{
    extract::{
        State,
        ws::{Message, WebSocketUpgrade},
    },
    response::Response,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::AppState;
use crate::protocol::LifecycleMessage;
use crate::session_registry::SessionRegistry;

/// `GET /api/events`: lifecycle notices for every session.
pub async fn events_websocket_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    let registry = state.registry.clone();
    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        forward_status(sink, stream, registry).await;
    })
}

/// Send a snapshot of all sessions, then every status change until the
/// client goes away. Falling behind the broadcast resends the snapshot.
pub async fn forward_status<S, R>(mut sink: S, mut stream: R, registry: Arc<SessionRegistry>)
where
    S: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    // Subscribe first so nothing between snapshot and subscription is lost
    let mut notices = registry.subscribe_status();
    let metrics = registry.metrics();
    metrics.events_opened();

    let mut open = send_snapshot(&mut sink, &registry).await;
    while open {
        tokio::select! {
            notice = notices.recv() => match notice {
                Ok(notice) => {
                    open = send_message(&mut sink, &LifecycleMessage::StatusChanged(notice)).await;
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Events subscriber lagged, resending snapshot");
                    open = send_snapshot(&mut sink, &registry).await;
                }
                Err(RecvError::Closed) => open = false,
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Close(_))) | None => open = false,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "Events socket receive error");
                    open = false;
                }
            },
        }
    }

    metrics.events_closed();
}

async fn send_snapshot<S>(sink: &mut S, registry: &SessionRegistry) -> bool
where
    S: Sink<Message> + Unpin,
{
    let sessions = registry.list_statuses().await;
    send_message(sink, &LifecycleMessage::Snapshot { sessions }).await
}

async fn send_message<S>(sink: &mut S, message: &LifecycleMessage) -> bool
where
    S: Sink<Message> + Unpin,
{
    match serde_json::to_string(message) {
        Ok(json) => sink.send(Message::Text(json.into())).await.is_ok(),
        Err(_) => true,
    }
}
