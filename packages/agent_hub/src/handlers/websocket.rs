use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    response::{IntoResponse, Response},
};
use futures::{Sink, SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::AppState;
use crate::error::SessionError;
use crate::front_door::{AdmittedConnection, ConnectParams, admit};
use crate::metrics::ServerMetrics;
use crate::protocol::ServerNotice;
use crate::relay::{run_relay, send_notice};
use crate::session_registry::SessionRegistry;

/// `GET /ws`: admit, upgrade, attach, relay.
///
/// The upgrade extractor is taken as a `Result` so identity and parameter
/// errors are reported even to requests that are not valid upgrades.
pub async fn session_websocket_handler(
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let admitted = match admit(params, state.validator.as_ref(), state.registry.config()) {
        Ok(admitted) => admitted,
        Err(e) => {
            debug!(error = %e, "Connection refused at the front door");
            return e.into_response();
        }
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let registry = state.registry.clone();
    ws.on_upgrade(move |socket| serve_session_socket(socket, registry, admitted))
}

async fn serve_session_socket(
    socket: WebSocket,
    registry: Arc<SessionRegistry>,
    admitted: AdmittedConnection,
) {
    let client_id = Uuid::new_v4().to_string();
    let (mut sink, stream) = socket.split();

    let AdmittedConnection {
        session_id,
        geometry,
        spawn,
    } = admitted;

    match registry
        .attach(&session_id, client_id.clone(), Some(spawn), geometry)
        .await
    {
        Ok(attachment) => run_relay(sink, stream, registry, session_id, attachment).await,
        Err(e) => {
            warn!(session_id = %session_id, client_id = %client_id, error = %e, "Attach failed");
            report_attach_failure(&mut sink, &registry.metrics(), &e).await;
        }
    }
}

/// The socket is already upgraded, so an attach failure goes out as an
/// error notice before the socket is closed.
async fn report_attach_failure<S>(sink: &mut S, metrics: &ServerMetrics, err: &SessionError)
where
    S: Sink<Message> + Unpin,
{
    metrics.protocol_error();
    send_notice(sink, &ServerNotice::error(err.code(), err.to_string())).await;
    let _ = sink.close().await;
}
