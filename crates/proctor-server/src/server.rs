use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use proctor_core::{
    ClientEvent, ConnectionId, CoordinatorError, Role, ServerEvent, SessionId, UserId,
};
use proctor_telemetry::MetricsRecorder;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::coordinator::{Outbound, SessionCoordinator};
use crate::http;
use crate::profile::UserProfileStore;
use crate::registry::{self, Conn, ConnectionRegistry};
use crate::store::SessionStore;
use crate::voice::VoiceRoomAllocator;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub port: u16,
    pub max_send_queue: usize,
    pub cleanup_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            max_send_queue: 256,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    /// Default config with the PORT env var honored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(port) = std::env::var("PORT").ok().and_then(|p| p.parse().ok()) {
            config.port = port;
        }
        config
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SessionStore>,
    pub coordinator: Arc<SessionCoordinator>,
    pub registry: Arc<ConnectionRegistry>,
    pub profiles: Arc<dyn UserProfileStore>,
    pub allocator: Arc<VoiceRoomAllocator>,
    pub message_tx: mpsc::Sender<(ConnectionId, String)>,
}

/// Build the Axum router with the realtime and admin routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(http::health))
        .route("/sessions", post(http::create_session))
        .route("/users/{id}/status", post(http::update_user_status))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Create and start the server. Returns a handle that keeps the background
/// tasks alive.
pub async fn start(
    config: ServerConfig,
    profiles: Arc<dyn UserProfileStore>,
    metrics: Arc<MetricsRecorder>,
) -> Result<ServerHandle, std::io::Error> {
    let store = Arc::new(SessionStore::new());
    let registry = Arc::new(ConnectionRegistry::new(
        config.max_send_queue,
        Arc::clone(&metrics),
    ));
    let coordinator = Arc::new(SessionCoordinator::new(
        Arc::clone(&store),
        Arc::clone(&profiles),
        Arc::clone(&metrics),
    ));
    let allocator = Arc::new(VoiceRoomAllocator::default());

    // Inbound event processing channel
    let (message_tx, message_rx) = mpsc::channel::<(ConnectionId, String)>(1024);
    let events = tokio::spawn(process_client_events(
        message_rx,
        Arc::clone(&registry),
        Arc::clone(&coordinator),
        Arc::clone(&store),
    ));

    let cleanup = registry::start_cleanup_task(Arc::clone(&registry), config.cleanup_interval);

    let state = AppState {
        store,
        coordinator,
        registry,
        profiles,
        allocator,
        message_tx,
    };

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "coordination server started");

    let server = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        _server: server,
        _events: events,
        _cleanup: cleanup,
    })
}

/// Handle returned by `start()` — keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
    _events: tokio::task::JoinHandle<()>,
    _cleanup: tokio::task::JoinHandle<()>,
}

/// Connect-time parameters, all required and non-empty.
#[derive(Clone, Debug, PartialEq, Eq)]
struct ConnectParams {
    session_id: String,
    user_id: String,
    role: String,
    station_id: String,
    display_name: String,
}

impl ConnectParams {
    fn from_query(query: &HashMap<String, String>) -> Result<Self, CoordinatorError> {
        let required = |key: &str| -> Result<String, CoordinatorError> {
            query
                .get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_owned)
                .ok_or_else(|| {
                    CoordinatorError::Validation(format!(
                        "missing required connection parameter: {key} \
                         (sessionId, userId, role, stationId, displayName are required)"
                    ))
                })
        };

        Ok(Self {
            session_id: required("sessionId")?,
            user_id: required("userId")?,
            role: required("role")?,
            station_id: required("stationId")?,
            display_name: required("displayName")?,
        })
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, query, state))
}

/// Drive one client connection: validate parameters, resolve the session
/// (creating it on the fallback path), admit, pump events, and unwind on
/// close.
async fn handle_socket(socket: WebSocket, query: HashMap<String, String>, state: AppState) {
    let params = match ConnectParams::from_query(&query) {
        Ok(params) => params,
        Err(err) => {
            tracing::warn!(error = %err, "rejecting connection with incomplete parameters");
            reject(socket, &err).await;
            return;
        }
    };

    let session_id = SessionId::from_raw(params.session_id);
    let user_id = UserId::from_raw(params.user_id);
    let session = state
        .store
        .get_or_create_fallback(session_id.clone(), params.station_id);

    let (conn_id, rx) = state.registry.register(session_id.clone(), user_id.clone());

    match state
        .coordinator
        .admit(
            &session,
            user_id.clone(),
            Role::from(params.role),
            params.display_name,
            conn_id.clone(),
        )
        .await
    {
        Ok(directives) => state.registry.deliver_all(&directives),
        Err(err) => {
            state.registry.unregister(&conn_id);
            reject(socket, &err).await;
            return;
        }
    }

    tracing::info!(connection_id = %conn_id, session_id = %session_id, "client connected");

    registry::run_ws_connection(
        socket,
        conn_id.clone(),
        rx,
        Arc::clone(&state.registry),
        state.message_tx.clone(),
    )
    .await;

    // Unregister first so the departure broadcast only reaches the others
    state.registry.unregister(&conn_id);
    let directives = state
        .coordinator
        .disconnect(&session_id, &user_id, &conn_id)
        .await;
    state.registry.deliver_all(&directives);
}

/// Send a terminal error event on a fresh socket and close it.
async fn reject(mut socket: WebSocket, err: &CoordinatorError) {
    let event = ServerEvent::error(err.to_string());
    if let Ok(json) = serde_json::to_string(&event) {
        let _ = socket.send(WsMessage::Text(json.into())).await;
    }
    let _ = socket.send(WsMessage::Close(None)).await;
}

/// Process inbound client events, in arrival order.
async fn process_client_events(
    mut rx: mpsc::Receiver<(ConnectionId, String)>,
    registry: Arc<ConnectionRegistry>,
    coordinator: Arc<SessionCoordinator>,
    store: Arc<SessionStore>,
) {
    while let Some((conn_id, raw)) = rx.recv().await {
        let Some(conn) = registry.get(&conn_id) else {
            continue; // connection already gone
        };

        let event = match serde_json::from_str::<ClientEvent>(&raw) {
            Ok(event) => event,
            Err(err) => {
                // Unknown event names are ignored for forward compatibility
                tracing::debug!(
                    connection_id = %conn_id,
                    error = %err,
                    "ignoring unrecognized client event"
                );
                continue;
            }
        };

        let directives = dispatch(&coordinator, &store, &conn, event).await;
        registry.deliver_all(&directives);
    }
}

/// Route one inbound event to its coordinator operation, with the
/// connection's bound (session, user) context.
async fn dispatch(
    coordinator: &SessionCoordinator,
    store: &SessionStore,
    conn: &Conn,
    event: ClientEvent,
) -> Vec<Outbound> {
    let Some(session) = store.get(&conn.session_id) else {
        return Vec::new();
    };

    let result = match event {
        ClientEvent::ClientReady => Ok(coordinator.set_ready(&session, &conn.user_id).await),
        ClientEvent::ClientStartSimulation {
            duration_minutes,
            communication_method,
        } => Ok(coordinator
            .start(&session, duration_minutes, communication_method)
            .await),
        ClientEvent::ClientRequestVoiceRoom => {
            coordinator.request_voice_room(&session, &conn.id).await
        }
        ClientEvent::ClientVoiceJoined => Ok(coordinator
            .set_voice_presence(&session, &conn.user_id, true)
            .await),
        ClientEvent::ClientVoiceLeft => Ok(coordinator
            .set_voice_presence(&session, &conn.user_id, false)
            .await),
    };

    match result {
        Ok(directives) => directives,
        Err(err) => {
            tracing::debug!(
                connection_id = %conn.id,
                kind = err.error_kind(),
                "client event failed"
            );
            vec![Outbound::Unicast {
                connection: conn.id.clone(),
                event: ServerEvent::error(err.to_string()),
            }]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::InMemoryProfileStore;

    fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn connect_params_require_all_five_fields() {
        let full = query(&[
            ("sessionId", "s1"),
            ("userId", "u1"),
            ("role", "examinee"),
            ("stationId", "st1"),
            ("displayName", "Ana"),
        ]);
        let params = ConnectParams::from_query(&full).unwrap();
        assert_eq!(params.display_name, "Ana");

        for missing in ["sessionId", "userId", "role", "stationId", "displayName"] {
            let mut q = full.clone();
            q.remove(missing);
            let err = ConnectParams::from_query(&q).unwrap_err();
            assert!(err.closes_connection());
            assert!(err.to_string().contains(missing), "error should name {missing}");
        }
    }

    #[test]
    fn connect_params_reject_empty_values() {
        let q = query(&[
            ("sessionId", "s1"),
            ("userId", "  "),
            ("role", "examinee"),
            ("stationId", "st1"),
            ("displayName", "Ana"),
        ]);
        let err = ConnectParams::from_query(&q).unwrap_err();
        assert!(matches!(err, CoordinatorError::Validation(_)));
    }

    async fn boot() -> ServerHandle {
        let config = ServerConfig {
            port: 0, // random port
            ..Default::default()
        };
        start(
            config,
            Arc::new(InMemoryProfileStore::new()),
            Arc::new(MetricsRecorder::new()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let handle = boot().await;
        assert!(handle.port > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn create_session_requires_station_id() {
        let handle = boot().await;
        let url = format!("http://127.0.0.1:{}/sessions", handle.port);

        let resp = reqwest::Client::new()
            .post(&url)
            .json(&serde_json::json!({}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn create_voice_session_returns_room() {
        let handle = boot().await;
        let url = format!("http://127.0.0.1:{}/sessions", handle.port);

        let resp = reqwest::Client::new()
            .post(&url)
            .json(&serde_json::json!({
                "stationId": "stationA",
                "communicationMethod": "voice"
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert!(body["sessionId"].is_string());
        assert_eq!(body["communicationMethod"], "voice");
        assert!(body["voiceRoom"]["roomId"].is_string());
        assert!(body["voiceRoom"]["joinUrl"].is_string());
    }

    #[tokio::test]
    async fn create_meet_session_has_no_room() {
        let handle = boot().await;
        let url = format!("http://127.0.0.1:{}/sessions", handle.port);

        let resp = reqwest::Client::new()
            .post(&url)
            .json(&serde_json::json!({ "stationId": "stationA" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["communicationMethod"], "meet");
        assert!(body.get("voiceRoom").is_none() || body["voiceRoom"].is_null());
    }

    #[tokio::test]
    async fn user_status_push_round_trips() {
        let handle = boot().await;
        let url = format!("http://127.0.0.1:{}/users/u42/status", handle.port);

        let resp = reqwest::Client::new()
            .post(&url)
            .json(&serde_json::json!({ "status": "online" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["success"], true);
    }

    #[tokio::test]
    async fn user_status_push_requires_status() {
        let handle = boot().await;
        let url = format!("http://127.0.0.1:{}/users/u42/status", handle.port);

        let resp = reqwest::Client::new()
            .post(&url)
            .json(&serde_json::json!({}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    }
}
