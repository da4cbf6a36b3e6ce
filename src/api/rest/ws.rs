use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures::SinkExt;
use futures::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::session::DriverSession;
use crate::error::AppError;
use crate::models::events::SessionEvent;
use crate::state::AppState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let session = state.session(id)?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, session)))
}

async fn handle_socket(socket: WebSocket, session: Arc<DriverSession>) {
    let (mut sender, mut receiver) = socket.split();
    let driver_id = session.driver_id();
    let mut events = BroadcastStream::new(session.subscribe());

    // current presence first, so the client does not start from a blank screen
    let initial = SessionEvent::PresenceChanged {
        presence: session.presence().snapshot(),
    };
    drop(session);

    info!(driver_id = %driver_id, "session event stream attached");

    let mut send_task = tokio::spawn(async move {
        if !send_event(&mut sender, &initial).await {
            return;
        }
        while let Some(next) = events.next().await {
            let event = match next {
                Ok(event) => event,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(driver_id = %driver_id, skipped, "event stream lagging, events skipped");
                    continue;
                }
            };
            if !send_event(&mut sender, &event).await {
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(_msg)) = receiver.next().await {}
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    info!(driver_id = %driver_id, "session event stream detached");
}

/// Returns false once the client is gone.
async fn send_event<S>(sender: &mut S, event: &SessionEvent) -> bool
where
    S: futures::Sink<Message> + Unpin,
{
    let json = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(err) => {
            warn!(error = %err, "failed to serialize session event for ws");
            return true;
        }
    };
    sender.send(Message::Text(json)).await.is_ok()
}
