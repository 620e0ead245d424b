use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::SinkExt;
use futures::StreamExt;
use serde::Deserialize;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};

use crate::models::event::DispatchEvent;
use crate::models::{DriverId, RideId};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct EventFilter {
    pub ride_id: Option<RideId>,
    pub driver_id: Option<DriverId>,
}

impl EventFilter {
    fn matches(&self, event: &DispatchEvent) -> bool {
        self.ride_id.is_none_or(|id| event.ride_id() == id)
            && self.driver_id.is_none_or(|id| event.concerns_driver(id))
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(filter): Query<EventFilter>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_events(socket, state, filter))
}

async fn stream_events(socket: WebSocket, state: Arc<AppState>, filter: EventFilter) {
    let (mut sink, mut incoming) = socket.split();
    let mut events = BroadcastStream::new(state.events_tx.subscribe());

    info!(
        ride_id = ?filter.ride_id,
        driver_id = ?filter.driver_id,
        "dispatch event stream opened"
    );

    loop {
        tokio::select! {
            item = events.next() => {
                let event = match item {
                    Some(Ok(event)) => event,
                    Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                        warn!(skipped, "event stream lagging, dispatch events dropped");
                        continue;
                    }
                    None => break,
                };
                if !filter.matches(&event) {
                    continue;
                }

                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(err) => {
                        warn!(error = %err, "failed to serialize dispatch event");
                        continue;
                    }
                };
                if sink.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            message = incoming.next() => match message {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    info!("dispatch event stream closed");
}
