//! WebSocket handler bridging viewers into the hub

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::{SinkExt, stream::StreamExt};
use tracing::{debug, info, warn};

use crate::actors::messages::Envelope;
use crate::api::ApiState;

/// WebSocket upgrade handler
///
/// GET /ws
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<ApiState>) -> Response {
    ws.on_upgrade(|socket| handle_websocket(socket, state))
}

async fn handle_websocket(socket: WebSocket, state: ApiState) {
    let (viewer_id, mut event_rx) = state.hub.register().await;
    info!("viewer {viewer_id} connected");

    let (mut sender, mut receiver) = socket.split();

    // Forward hub events to the socket.
    let mut send_task = tokio::spawn(async move {
        while let Some(envelope) = event_rx.recv().await {
            let Ok(text) = serde_json::to_string(&envelope) else {
                continue;
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                debug!("send failed, viewer disconnected");
                break;
            }
        }
    });

    // Forward viewer events upstream.
    let hub = state.hub.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<Envelope>(&text) {
                    Ok(envelope) => hub.from_viewer(viewer_id, envelope).await,
                    Err(e) => warn!("viewer {viewer_id} sent malformed event: {e}"),
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    }

    state.hub.unregister(viewer_id).await;
    info!("viewer {viewer_id} disconnected");
}
