//! Connection handlers for the Roomcast server.
//!
//! Each WebSocket is one hub connection. Inbound events are decoded and
//! forwarded to the hub task; events the hub addresses to the connection
//! arrive on its own channel and are written back to the socket.

use crate::config::{Config, CorsConfig};
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::BytesMut;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use roomcast_core::{service, ConnectionId, HubHandle, ServiceError};
use roomcast_protocol::{codec, ClientEvent, Encoded, ProtocolError, ServerEvent, WireFormat};
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Handle to the hub task.
    pub hub: HubHandle,
    /// Server configuration.
    pub config: Config,
    /// Number of open WebSocket connections.
    active_connections: AtomicUsize,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config, hub: HubHandle) -> Self {
        Self {
            hub,
            config,
            active_connections: AtomicUsize::new(0),
        }
    }

    /// Claim one of the `max_connections` slots, or `None` if all are taken.
    fn try_reserve(self: &Arc<Self>) -> Option<ConnectionSlot> {
        let limit = self.config.limits.max_connections;
        self.active_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |open| {
                (open < limit).then_some(open + 1)
            })
            .ok()?;

        Some(ConnectionSlot {
            state: Arc::clone(self),
        })
    }
}

/// A claimed connection slot, released on drop.
struct ConnectionSlot {
    state: Arc<AppState>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.state.active_connections.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Query parameters of the WebSocket endpoint.
#[derive(Debug, Default, Deserialize)]
struct WsParams {
    #[serde(default)]
    format: WireFormat,
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let (hub, _hub_task) = service::spawn();

    if config.rooms.prune_interval_ms > 0 {
        spawn_pruner(
            hub.clone(),
            Duration::from_millis(config.rooms.prune_interval_ms),
        );
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Roomcast server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    let state = Arc::new(AppState::new(config, hub));
    serve(listener, state).await
}

/// Serve the application on an already bound listener.
///
/// # Errors
///
/// Returns an error if the server stops with an I/O error.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Build the HTTP router.
fn app(state: Arc<AppState>) -> Router {
    let cors = build_cors_layer(&state.config.cors);

    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .with_state(state)
}

/// Build the CORS layer.
fn build_cors_layer(config: &CorsConfig) -> CorsLayer {
    if !config.enabled {
        return CorsLayer::new();
    }

    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Periodically drop registry entries of rooms that have emptied out.
fn spawn_pruner(hub: HubHandle, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match hub.prune().await {
                Ok(pruned) if !pruned.is_empty() => {
                    info!(rooms = pruned.len(), "Pruned empty rooms");
                }
                Ok(_) => {}
                Err(ServiceError::Closed) => break,
            }
        }
    })
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.hub.stats().await {
        Ok(stats) => Json(serde_json::json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "connections": stats.connections,
            "rooms": stats.rooms,
        }))
        .into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "unavailable",
                "error": e.to_string(),
            })),
        )
            .into_response(),
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some(slot) = state.try_reserve() else {
        warn!(
            limit = state.config.limits.max_connections,
            "Connection limit reached, refusing upgrade"
        );
        metrics::record_rejected_connection();
        return (StatusCode::SERVICE_UNAVAILABLE, "Connection limit reached").into_response();
    };

    ws.on_upgrade(move |socket| handle_websocket(socket, state, params.format, slot))
}

/// Handle a WebSocket connection.
async fn handle_websocket(
    socket: WebSocket,
    state: Arc<AppState>,
    format: WireFormat,
    _slot: ConnectionSlot,
) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection_id = ConnectionId::generate();
    debug!(connection = %connection_id, format = ?format, "WebSocket connected");

    let mut events = match state.hub.connect(connection_id.clone()) {
        Ok(events) => events,
        Err(e) => {
            error!(connection = %connection_id, error = %e, "Failed to register connection");
            return;
        }
    };
    refresh_active_rooms(&state.hub).await;

    let (mut sender, mut receiver) = socket.split();

    // Read buffer for partial binary frames
    let mut read_buffer = BytesMut::with_capacity(4096);
    let max_message_size = state.config.limits.max_message_size;

    loop {
        tokio::select! {
            biased;

            // Events addressed to this connection by the hub
            Some(event) = events.recv() => {
                metrics::record_event(&event);
                if let Err(e) = send_event(&mut sender, format, &event).await {
                    debug!(connection = %connection_id, error = %e, "Failed to send event");
                    break;
                }
                if changes_rooms(&event) {
                    refresh_active_rooms(&state.hub).await;
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if text.len() > max_message_size {
                            warn!(connection = %connection_id, size = text.len(), "Dropping oversized message");
                            metrics::record_error("oversized");
                            continue;
                        }

                        let start = Instant::now();
                        metrics::record_message(text.len(), "inbound");

                        match codec::decode_json::<ClientEvent>(&text) {
                            Ok(event) => {
                                if dispatch(&state, &connection_id, event).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(connection = %connection_id, error = %e, "Dropping undecodable event");
                                metrics::record_error("decode");
                            }
                        }

                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if data.len() > max_message_size {
                            warn!(connection = %connection_id, size = data.len(), "Dropping oversized message");
                            metrics::record_error("oversized");
                            continue;
                        }

                        let start = Instant::now();
                        metrics::record_message(data.len(), "inbound");
                        read_buffer.extend_from_slice(&data);

                        if dispatch_buffered(&state, &connection_id, &mut read_buffer, max_message_size)
                            .is_err()
                        {
                            break;
                        }

                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pongs
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    if let Err(e) = state.hub.disconnect(connection_id.clone()) {
        error!(connection = %connection_id, error = %e, "Failed to unregister connection");
    }
    refresh_active_rooms(&state.hub).await;

    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Forward a decoded event to the hub.
fn dispatch(
    state: &AppState,
    connection_id: &ConnectionId,
    event: ClientEvent,
) -> Result<(), ServiceError> {
    debug!(connection = %connection_id, event = event.name(), "Event received");

    state
        .hub
        .dispatch(connection_id.clone(), event)
        .map_err(|e| {
            error!(connection = %connection_id, error = %e, "Hub unavailable");
            e
        })
}

/// Forward every complete MessagePack frame in the buffer to the hub.
///
/// A frame declaring more than `max_frame` payload bytes empties the buffer,
/// so a frame split across messages is held to the same limit as a whole one.
fn dispatch_buffered(
    state: &AppState,
    connection_id: &ConnectionId,
    buf: &mut BytesMut,
    max_frame: usize,
) -> Result<(), ServiceError> {
    loop {
        if let Some(length) = codec::frame_len(buf) {
            if length > max_frame {
                warn!(connection = %connection_id, size = length, "Dropping oversized frame");
                metrics::record_error("oversized");
                buf.clear();
                return Ok(());
            }
        }

        match codec::decode_from::<ClientEvent>(buf) {
            Ok(Some(event)) => dispatch(state, connection_id, event)?,
            Ok(None) => return Ok(()),
            Err(e @ ProtocolError::FrameTooLarge(_)) => {
                // The buffer cannot resynchronise past a bad length prefix.
                warn!(connection = %connection_id, error = %e, "Discarding read buffer");
                metrics::record_error("decode");
                buf.clear();
                return Ok(());
            }
            Err(e) => {
                warn!(connection = %connection_id, error = %e, "Dropping undecodable event");
                metrics::record_error("decode");
            }
        }
    }
}

/// Whether delivering this event means its recipient switched rooms.
fn changes_rooms(event: &ServerEvent) -> bool {
    matches!(event, ServerEvent::Joined(_) | ServerEvent::Created(_))
}

/// Update the active rooms gauge from the hub.
async fn refresh_active_rooms(hub: &HubHandle) {
    match hub.active_rooms().await {
        Ok(rooms) => metrics::set_active_rooms(rooms),
        Err(e) => debug!(error = %e, "Skipping active rooms refresh"),
    }
}

/// Encode an event and write it to the WebSocket.
async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    format: WireFormat,
    event: &ServerEvent,
) -> Result<()> {
    let encoded = format.encode(event)?;
    metrics::record_message(encoded.len(), "outbound");

    let message = match encoded {
        Encoded::Text(text) => Message::Text(text),
        Encoded::Binary(data) => Message::Binary(data.to_vec()),
    };
    sender.send(message).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn start(config: Config) -> SocketAddr {
        let (hub, _task) = service::spawn();
        let state = Arc::new(AppState::new(config, hub));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, state));
        addr
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.metrics.enabled = false;
        config
    }

    async fn client(addr: SocketAddr, query: &str) -> Client {
        let (ws, _) = connect_async(format!("ws://{addr}/ws{query}")).await.unwrap();
        ws
    }

    async fn send(ws: &mut Client, event: ClientEvent) {
        let text = codec::encode_json(&event).unwrap();
        ws.send(WsMessage::Text(text)).await.unwrap();
    }

    async fn recv(ws: &mut Client) -> ServerEvent {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for event")
                .expect("stream ended")
                .unwrap();
            match msg {
                WsMessage::Text(text) => return codec::decode_json(&text).unwrap(),
                WsMessage::Binary(data) => return codec::decode(&data).unwrap(),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_room_session_over_websocket() {
        let addr = start(test_config()).await;

        let mut a = client(addr, "").await;
        assert_eq!(recv(&mut a).await, ServerEvent::Count(1));

        send(&mut a, ClientEvent::create("Room1")).await;
        assert_eq!(recv(&mut a).await, ServerEvent::Created("room1".into()));
        assert_eq!(recv(&mut a).await, ServerEvent::Count(1));

        let mut b = client(addr, "").await;
        assert_eq!(recv(&mut b).await, ServerEvent::Count(1));

        send(&mut b, ClientEvent::join("ROOM1")).await;
        assert_eq!(recv(&mut b).await, ServerEvent::Joined("room1".into()));
        assert_eq!(recv(&mut b).await, ServerEvent::Count(2));
        assert_eq!(recv(&mut a).await, ServerEvent::Count(2));

        send(&mut b, ClientEvent::message(serde_json::json!({"x": 1}))).await;
        assert_eq!(
            recv(&mut a).await,
            ServerEvent::Message(serde_json::json!({"x": 1}))
        );

        a.close(None).await.unwrap();
        assert_eq!(recv(&mut b).await, ServerEvent::Count(1));
    }

    #[tokio::test]
    async fn test_bad_input_keeps_connection() {
        let addr = start(test_config()).await;

        let mut a = client(addr, "").await;
        assert_eq!(recv(&mut a).await, ServerEvent::Count(1));

        a.send(WsMessage::Text("garbage".into())).await.unwrap();
        a.send(WsMessage::Text(r#"{"event":"event:count","data":1}"#.into()))
            .await
            .unwrap();

        send(&mut a, ClientEvent::join("ghost")).await;
        assert_eq!(recv(&mut a).await, ServerEvent::error("Room not found"));
    }

    #[tokio::test]
    async fn test_oversized_message_dropped() {
        let mut config = test_config();
        config.limits.max_message_size = 64;
        let addr = start(config).await;

        let mut a = client(addr, "").await;
        assert_eq!(recv(&mut a).await, ServerEvent::Count(1));

        send(&mut a, ClientEvent::create("x".repeat(128))).await;
        send(&mut a, ClientEvent::create("small")).await;
        assert_eq!(recv(&mut a).await, ServerEvent::Created("small".into()));
    }

    #[tokio::test]
    async fn test_chunked_oversized_frame_dropped() {
        let mut config = test_config();
        config.limits.max_message_size = 64;
        let addr = start(config).await;

        let mut a = client(addr, "?format=msgpack").await;
        assert_eq!(recv(&mut a).await, ServerEvent::Count(1));

        // Each message is under the limit, the frame they carry is not.
        let frame = codec::encode(&ClientEvent::create("y".repeat(1000))).unwrap();
        for chunk in frame.chunks(60) {
            a.send(WsMessage::Binary(chunk.to_vec())).await.unwrap();
        }

        let small = codec::encode(&ClientEvent::create("small")).unwrap();
        a.send(WsMessage::Binary(small.to_vec())).await.unwrap();
        assert_eq!(recv(&mut a).await, ServerEvent::Created("small".into()));
    }

    #[tokio::test]
    async fn test_msgpack_format() {
        let addr = start(test_config()).await;

        let mut a = client(addr, "?format=msgpack").await;
        match tokio::time::timeout(Duration::from_secs(5), a.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
        {
            WsMessage::Binary(data) => {
                assert_eq!(codec::decode::<ServerEvent>(&data).unwrap(), ServerEvent::Count(1));
            }
            other => panic!("Expected binary message, got {:?}", other),
        }

        let frame = codec::encode(&ClientEvent::create("bin")).unwrap();
        a.send(WsMessage::Binary(frame.to_vec())).await.unwrap();
        assert_eq!(recv(&mut a).await, ServerEvent::Created("bin".into()));
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let mut config = test_config();
        config.limits.max_connections = 1;
        let addr = start(config).await;

        let mut a = client(addr, "").await;
        assert_eq!(recv(&mut a).await, ServerEvent::Count(1));

        assert!(connect_async(format!("ws://{addr}/ws")).await.is_err());
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let addr = start(test_config()).await;

        let mut a = client(addr, "").await;
        assert_eq!(recv(&mut a).await, ServerEvent::Count(1));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains(r#""status":"ok""#));
        assert!(response.contains(r#""connections":1"#));
    }

    #[tokio::test]
    async fn test_connection_slots_are_reserved() {
        let mut config = test_config();
        config.limits.max_connections = 1;
        let (hub, _task) = service::spawn();
        let state = Arc::new(AppState::new(config, hub));

        let first = state.try_reserve().unwrap();
        assert!(state.try_reserve().is_none());
        assert_eq!(state.active_connections.load(Ordering::SeqCst), 1);

        drop(first);
        assert_eq!(state.active_connections.load(Ordering::SeqCst), 0);
        assert!(state.try_reserve().is_some());
    }

    #[test]
    fn test_room_switch_events() {
        assert!(changes_rooms(&ServerEvent::Joined("r1".into())));
        assert!(changes_rooms(&ServerEvent::Created("r1".into())));
        assert!(!changes_rooms(&ServerEvent::Count(1)));
        assert!(!changes_rooms(&ServerEvent::error("Room not found")));
    }

    #[test]
    fn test_build_cors_layer() {
        let _enabled = build_cors_layer(&CorsConfig { enabled: true });
        let _disabled = build_cors_layer(&CorsConfig { enabled: false });
    }
}
