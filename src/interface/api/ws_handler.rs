//! WebSocket bridge between the call controller and the presentation layer
//!
//! Outbound frames: the current `CallView` on connect and on every change,
//! each `CallEvent`, and one ack/error per intent. Inbound: JSON `CallIntent`s.

use super::call_handler::{apply_intent, ApiState};
use super::dto::{CallIntent, ServerFrame};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

const REPLY_BUFFER: usize = 32;

/// WebSocket handler
pub async fn call_ws_handler(ws: WebSocketUpgrade, State(state): State<ApiState>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn send_frame(
    sender: &mut SplitSink<WebSocket, Message>,
    frame: &ServerFrame,
) -> Result<(), axum::Error> {
    match serde_json::to_string(frame) {
        Ok(json) => sender.send(Message::Text(json)).await,
        Err(e) => {
            error!("Failed to serialize frame: {}", e);
            Ok(())
        }
    }
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, state: ApiState) {
    let (mut sender, mut receiver) = socket.split();
    let mut views = state.controller.watch();
    let mut events = state.controller.subscribe();
    let (reply_tx, mut reply_rx) = mpsc::channel::<ServerFrame>(REPLY_BUFFER);

    info!("Call client connected");

    let initial = ServerFrame::View(views.borrow_and_update().clone());
    let mut send_task = tokio::spawn(async move {
        if send_frame(&mut sender, &initial).await.is_err() {
            return;
        }
        loop {
            let frame = tokio::select! {
                changed = views.changed() => match changed {
                    Ok(()) => ServerFrame::View(views.borrow_and_update().clone()),
                    Err(_) => break,
                },
                event = events.recv() => match event {
                    Ok(event) => ServerFrame::Event(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Call client lagged, {} events skipped", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                reply = reply_rx.recv() => match reply {
                    Some(frame) => frame,
                    None => break,
                },
            };
            if send_frame(&mut sender, &frame).await.is_err() {
                debug!("Failed to send frame to call client");
                break;
            }
        }
    });

    let controller = state.controller.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<CallIntent>(&text) {
                    Ok(intent) => {
                        // Answering can wait for the offer; keep reading meanwhile
                        let controller = controller.clone();
                        let reply_tx = reply_tx.clone();
                        tokio::spawn(async move {
                            let frame = apply_intent(&controller, intent).await;
                            let _ = reply_tx.send(frame).await;
                        });
                    }
                    Err(e) => {
                        debug!("Unparseable intent: {}", e);
                        let frame = ServerFrame::Error {
                            action: "unknown",
                            kind: "InvalidIntent".to_string(),
                            message: e.to_string(),
                        };
                        if reply_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                },
                Message::Close(_) => {
                    debug!("Received close message");
                    break;
                }
                Message::Binary(_) => {
                    debug!("Received binary message (ignored)");
                }
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    }

    info!("Call client disconnected");
}
