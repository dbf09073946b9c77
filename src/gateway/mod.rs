//! WebSocket endpoint for render workers.
//!
//! Each socket becomes one worker with a freshly generated id. Text frames
//! from the worker are [`WorkerEvent`]s and go to the broker; commands
//! published to the worker exchange under that id are written back to the
//! socket. A closed socket is a disconnect. A worker that reconnects gets a
//! new id and starts out idle.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};

use crate::bus::{
    Headers, MessageBus, BROKER_EXCHANGE, BROKER_ROUTING_KEY, HEADER_WORKER_ID, WORKER_EXCHANGE,
};
use crate::protocol::{BrokerMessage, WorkerEvent, WorkerId};

#[derive(Clone)]
pub struct GatewayState {
    pub bus: MessageBus,
}

pub fn router(bus: MessageBus) -> Router {
    Router::new()
        .route("/ws/worker", get(worker_socket_handler))
        .with_state(GatewayState { bus })
}

async fn worker_socket_handler(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_worker(socket, state.bus))
}

async fn handle_worker(socket: WebSocket, bus: MessageBus) {
    let worker_id = WorkerId::generate();

    let mut commands = match bus.subscribe(WORKER_EXCHANGE, worker_id.as_str()).await {
        Ok(subscription) => subscription,
        Err(e) => {
            tracing::error!(worker_id = %worker_id, error = %e, "Could not bind worker queue");
            return;
        }
    };
    tracing::info!(worker_id = %worker_id, "Worker connected");

    let (mut sink, mut stream) = socket.split();

    let sender_id = worker_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(envelope) = commands.recv().await {
            if sink
                .send(Message::Text(envelope.payload.to_string()))
                .await
                .is_err()
            {
                tracing::debug!(worker_id = %sender_id, "Worker socket closed");
                break;
            }
        }
    });

    announce(
        &bus,
        &worker_id,
        BrokerMessage::WorkerConnected {
            worker_id: worker_id.clone(),
        },
    )
    .await;

    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Text(text)) => match serde_json::from_str::<WorkerEvent>(&text) {
                Ok(WorkerEvent::Disconnected {}) => break,
                Ok(event) => {
                    announce(
                        &bus,
                        &worker_id,
                        BrokerMessage::WorkerEvent {
                            worker_id: worker_id.clone(),
                            event,
                        },
                    )
                    .await;
                }
                Err(e) => {
                    tracing::warn!(worker_id = %worker_id, error = %e, "Unrecognised worker message");
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(worker_id = %worker_id, error = %e, "Worker socket error");
                break;
            }
        }
    }

    announce(
        &bus,
        &worker_id,
        BrokerMessage::WorkerDisconnected {
            worker_id: worker_id.clone(),
        },
    )
    .await;
    send_task.abort();
    tracing::info!(worker_id = %worker_id, "Worker disconnected");
}

async fn announce(bus: &MessageBus, worker_id: &WorkerId, message: BrokerMessage) {
    let headers = Headers::new().with(HEADER_WORKER_ID, worker_id);
    if let Err(e) = bus
        .publish(BROKER_EXCHANGE, BROKER_ROUTING_KEY, &message, headers)
        .await
    {
        tracing::error!(worker_id = %worker_id, error = %e, "Failed to reach broker");
    }
}
