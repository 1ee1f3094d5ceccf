//! HTTP surface for operators and external collectors.
//!
//! - `GET /health`: liveness
//! - `GET /stats`: the latest scheduler snapshot as JSON
//! - `GET /events`: WebSocket stream of scheduler events as JSON text frames

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use hopper_core::events::SchedulerEvent;
use hopper_scheduler::SchedulerSnapshot;
use serde_json::{Value, json};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

#[derive(Clone)]
pub struct HttpState {
    pub snapshots: watch::Receiver<SchedulerSnapshot>,
    pub events: broadcast::Sender<SchedulerEvent>,
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/events", get(events))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn stats(State(state): State<HttpState>) -> Json<SchedulerSnapshot> {
    Json(state.snapshots.borrow().clone())
}

async fn events(ws: WebSocketUpgrade, State(state): State<HttpState>) -> Response {
    let receiver = state.events.subscribe();
    ws.on_upgrade(move |socket| forward_events(socket, receiver))
}

async fn forward_events(mut socket: WebSocket, mut receiver: broadcast::Receiver<SchedulerEvent>) {
    debug!("Event stream opened");
    loop {
        tokio::select! {
            event = receiver.recv() => match event {
                Ok(event) => {
                    let Ok(text) = serde_json::to_string(&event) else {
                        continue;
                    };
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event stream subscriber lagging");
                }
                Err(RecvError::Closed) => break,
            },
            msg = socket.next() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    warn!(error = %e, "WebSocket error");
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }
    debug!("Event stream closed");
}
