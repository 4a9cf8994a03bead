//! Per-connection relay between one WebSocket client and its session.

use axum::extract::ws::{CloseFrame, Message, close_code};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::sync::Arc;
use tracing::{debug, info};

use crate::metrics::ServerMetrics;
use crate::protocol::{ClientMessage, ServerNotice};
use crate::session_actor::{Attachment, ClientEvent, Geometry, SessionHandle};
use crate::session_registry::SessionRegistry;

/// Pump an attachment to the client and client messages to the session
/// until either side goes away. Always detaches on the way out.
pub async fn run_relay<S, R>(
    mut sink: S,
    mut stream: R,
    registry: Arc<SessionRegistry>,
    session_id: String,
    attachment: Attachment,
) where
    S: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let metrics = registry.metrics();
    let Attachment {
        handle,
        client_id,
        snapshot,
        exit_info,
        mut events,
        ..
    } = attachment;

    metrics.connection_opened();
    info!(session_id = %session_id, client_id = %client_id, replay_bytes = snapshot.len(), "Relay started");

    let mut open = true;
    if !snapshot.is_empty() {
        open = sink.send(Message::Binary(snapshot.into())).await.is_ok();
    }
    if open {
        if let Some(exit_info) = exit_info {
            open = send_notice(&mut sink, &ServerNotice::Exited { exit_info }).await;
        }
    }

    while open {
        tokio::select! {
            event = events.recv() => match event {
                Some(ClientEvent::Output(data)) => {
                    open = sink.send(Message::Binary(data.into())).await.is_ok();
                }
                Some(ClientEvent::Started) => {
                    open = send_notice(&mut sink, &ServerNotice::Started).await;
                }
                Some(ClientEvent::Exited(exit_info)) => {
                    open = send_notice(&mut sink, &ServerNotice::Exited { exit_info }).await;
                }
                None => {
                    // The session dropped us: either removed or we fell behind
                    let (code, reason) = if handle.is_retired() {
                        (close_code::NORMAL, "session removed")
                    } else {
                        (close_code::AGAIN, "lagged")
                    };
                    debug!(session_id = %session_id, client_id = %client_id, reason, "Closing relay");
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    open = false;
                }
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Some(notice) =
                        handle_client_text(&handle, &metrics, text.as_str()).await
                    {
                        open = send_notice(&mut sink, &notice).await;
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    metrics.protocol_error();
                    open = send_notice(
                        &mut sink,
                        &ServerNotice::error("unsupported_frame", "binary frames are not accepted"),
                    )
                    .await;
                }
                Some(Ok(Message::Close(_))) | None => open = false,
                // Pings are answered by the transport
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(session_id = %session_id, client_id = %client_id, error = %e, "WebSocket receive error");
                    open = false;
                }
            },
        }
    }

    // Connection loss is only a detach; the process keeps running
    if let Err(e) = registry.detach(&session_id, &client_id).await {
        debug!(session_id = %session_id, client_id = %client_id, error = %e, "Detach after disconnect");
    }
    metrics.connection_closed();
    info!(session_id = %session_id, client_id = %client_id, "Relay finished");
}

pub(crate) async fn send_notice<S>(sink: &mut S, notice: &ServerNotice) -> bool
where
    S: Sink<Message> + Unpin,
{
    match serde_json::to_string(notice) {
        Ok(json) => sink.send(Message::Text(json.into())).await.is_ok(),
        Err(_) => true,
    }
}

/// Apply one client text frame; returns a notice to send back on failure.
async fn handle_client_text(
    handle: &SessionHandle,
    metrics: &ServerMetrics,
    text: &str,
) -> Option<ServerNotice> {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            metrics.protocol_error();
            return Some(ServerNotice::error("bad_message", e.to_string()));
        }
    };

    let result = match message {
        ClientMessage::Input { data } => handle.write_input(data.into_bytes()).await,
        ClientMessage::Resize { cols, rows } => {
            if cols == 0 || rows == 0 {
                metrics.protocol_error();
                return Some(ServerNotice::error(
                    "invalid_geometry",
                    format!("invalid terminal size {}x{}", cols, rows),
                ));
            }
            handle.resize(Geometry { cols, rows }).await
        }
    };

    result
        .err()
        .map(|e| ServerNotice::error(e.code(), e.to_string()))
}
