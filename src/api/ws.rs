//! WebSocket feed of job updates.

use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use super::AppState;
use crate::jobs::{Job, JobEvent, JobEventFilter, JobFilter};

/// Snapshot pushed on connect and after the subscriber lags.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SyncMessage {
    JobsSync { jobs: Vec<Job> },
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(filter): Query<JobEventFilter>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    info!(
        client_id = ?filter.client_id,
        conversation_id = ?filter.conversation_id,
        "WebSocket client connecting"
    );
    ws.on_upgrade(move |socket| handle_socket(socket, state, filter))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, filter: JobEventFilter) {
    // Subscribe before the snapshot so nothing between the two is lost.
    let mut rx = state.events.subscribe();

    if !send_sync(&mut socket, &state, &filter).await {
        warn!("Failed to send initial sync, client disconnected");
        return;
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if !filter.matches(&event) {
                            continue;
                        }
                        if !send_event(&mut socket, &event).await {
                            debug!("Client disconnected during send");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!(missed = n, "WS client lagged behind job events");
                        if !send_sync(&mut socket, &state, &filter).await {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => {
                        debug!("Job event channel closed");
                        break;
                    }
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    Some(Ok(Message::Text(text))) => {
                        debug!(text = %text.as_str(), "Ignoring client message");
                    }
                    _ => {}
                }
            }
        }
    }

    info!("WebSocket connection closed");
}

async fn send_event(socket: &mut WebSocket, event: &JobEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to serialize job event");
            true
        }
    }
}

/// Send the current jobs matching `filter`. Returns false once the client is gone.
async fn send_sync(socket: &mut WebSocket, state: &AppState, filter: &JobEventFilter) -> bool {
    let jobs = match state
        .service
        .list_jobs(&JobFilter {
            conversation_id: filter.conversation_id,
            client_id: filter.client_id.clone(),
            ..Default::default()
        })
        .await
    {
        Ok(jobs) => jobs,
        Err(e) => {
            warn!(error = %e, "Could not load jobs for WS sync");
            return true;
        }
    };

    match serde_json::to_string(&SyncMessage::JobsSync { jobs }) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to serialize job sync");
            true
        }
    }
}
