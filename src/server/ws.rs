//! Consumer socket: every WebSocket on `/ws` is one attached consumer.

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::error::MuxError;
use crate::mux::{ConsumerFacade, HubEvent};
use crate::server::protocol::{error_frame, ClientMessage};
use crate::TelemuxEngine;

pub fn router(engine: TelemuxEngine) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

pub async fn start_server(engine: TelemuxEngine, addr: &str) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Consumer socket listening on ws://{}/ws", addr);
    serve(listener, engine).await
}

pub async fn serve(listener: TcpListener, engine: TelemuxEngine) -> std::io::Result<()> {
    axum::serve(listener, router(engine)).await
}

async fn health(State(engine): State<TelemuxEngine>) -> impl IntoResponse {
    match (engine.hub.status().await, engine.hub.endpoint_count().await) {
        (Ok(status), Ok(endpoints)) => (
            StatusCode::OK,
            Json(json!({
                "status": status,
                "endpoints": endpoints,
                "transport": engine.transport,
                "uptime_secs": engine.start_time.elapsed().as_secs(),
            })),
        ),
        _ => (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "status": "down" }))),
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(engine): State<TelemuxEngine>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, engine))
}

async fn handle_socket(socket: WebSocket, engine: TelemuxEngine) {
    let mut consumer = match engine.hub.attach().await {
        Ok(c) => c,
        Err(e) => {
            warn!("Rejecting socket: {}", e);
            return;
        }
    };
    let id = consumer.id();
    debug!("Socket attached as {}", id);

    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            event = consumer.recv() => {
                let Some(event) = event else { break };
                if send_event(&mut sink, &event).await.is_err() {
                    break;
                }
            }

            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = dispatch(&consumer, text.as_str()).await {
                        if matches!(e, MuxError::HubClosed) {
                            break;
                        }
                        debug!("Socket {}: {}", id, e);
                        if send_event(&mut sink, &error_frame(&e)).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Socket {} read error: {}", id, e);
                    break;
                }
            }
        }
    }

    if let Err(e) = consumer.detach().await {
        debug!("Detach of {} after socket close: {}", id, e);
    }
    debug!("Socket {} closed", id);
}

async fn dispatch(consumer: &ConsumerFacade, text: &str) -> Result<(), MuxError> {
    match ClientMessage::parse(text)? {
        ClientMessage::Connect(config) => consumer.connect(config).await,
        ClientMessage::Publish { key, value } => consumer.publish(key, value).await,
        ClientMessage::Disconnect => consumer.disconnect().await,
        ClientMessage::RequestState => consumer.request_state().await,
        ClientMessage::Resync => consumer.resync().await,
        ClientMessage::Network { online } => consumer.set_network(online).await,
    }
}

async fn send_event<S>(sink: &mut S, event: &HubEvent) -> Result<(), ()>
where
    S: futures_util::Sink<Message> + Unpin,
{
    let text = serde_json::to_string(event).map_err(|e| warn!("Unserializable event: {}", e))?;
    sink.send(Message::Text(text.into())).await.map_err(|_| ())
}
