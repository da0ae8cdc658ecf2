use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use proctor_core::{ConnectionId, ServerEvent, SessionId, UserId};
use proctor_telemetry::MetricsRecorder;
use tokio::sync::mpsc;

use crate::coordinator::Outbound;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(90);

/// A live WebSocket connection with its session/user binding.
///
/// The binding is fixed at connect time for the connection's lifetime, so
/// none of this needs a lock; liveness flags are atomics.
pub struct Conn {
    pub id: ConnectionId,
    pub session_id: SessionId,
    pub user_id: UserId,
    tx: mpsc::Sender<String>,
    connected: AtomicBool,
    last_pong: AtomicU64,
}

impl Conn {
    fn new(id: ConnectionId, session_id: SessionId, user_id: UserId, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            session_id,
            user_id,
            tx,
            connected: AtomicBool::new(true),
            last_pong: AtomicU64::new(now_secs()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    fn is_alive(&self) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < CONNECTION_TIMEOUT.as_secs()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Registry of all connections currently bound to sessions.
///
/// Fan-out is best-effort: a full or closed send queue drops that one
/// message with a warning and a counter bump, and never affects delivery
/// to other connections.
pub struct ConnectionRegistry {
    conns: DashMap<ConnectionId, Arc<Conn>>,
    max_send_queue: usize,
    metrics: Arc<MetricsRecorder>,
}

impl ConnectionRegistry {
    pub fn new(max_send_queue: usize, metrics: Arc<MetricsRecorder>) -> Self {
        Self {
            conns: DashMap::new(),
            max_send_queue,
            metrics,
        }
    }

    /// Register a connection bound to (session, user). Returns the id and
    /// the receiver the writer task drains.
    pub fn register(
        &self,
        session_id: SessionId,
        user_id: UserId,
    ) -> (ConnectionId, mpsc::Receiver<String>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let conn = Arc::new(Conn::new(id.clone(), session_id, user_id, tx));
        self.conns.insert(id.clone(), conn);
        (id, rx)
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Conn>> {
        self.conns.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove a connection by id.
    pub fn unregister(&self, id: &ConnectionId) {
        if let Some((_, conn)) = self.conns.remove(id) {
            conn.connected.store(false, Ordering::Relaxed);
        }
    }

    /// Force-close a connection. Removing the entry drops the only sender,
    /// which ends the writer task and closes the socket.
    pub fn kick(&self, id: &ConnectionId) {
        if let Some((_, conn)) = self.conns.remove(id) {
            conn.connected.store(false, Ordering::Relaxed);
            tracing::info!(connection_id = %id, "connection superseded, closing");
        }
    }

    fn try_send(&self, conn: &Conn, message: String) -> bool {
        match conn.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                self.metrics.increment("broadcast_drops_total");
                tracing::warn!(
                    connection_id = %conn.id,
                    msg_len = msg.len(),
                    "send queue full, dropping message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Send a serialized event to a specific connection.
    pub fn send_to(&self, id: &ConnectionId, event: &ServerEvent) -> bool {
        let Some(conn) = self.get(id) else {
            return false;
        };
        let Ok(json) = serde_json::to_string(event) else {
            return false;
        };
        self.try_send(&conn, json)
    }

    /// Fan an event out to every connection bound to a session.
    pub fn broadcast_to_session(&self, session_id: &SessionId, event: &ServerEvent) {
        let Ok(json) = serde_json::to_string(event) else {
            return;
        };
        let mut recipients = 0u32;
        for entry in self.conns.iter() {
            let conn = entry.value();
            if &conn.session_id == session_id && conn.is_connected() {
                recipients += 1;
                self.try_send(conn, json.clone());
            }
        }
        tracing::debug!(
            session_id = %session_id,
            event = event.name(),
            recipients,
            "broadcast event"
        );
    }

    /// Execute one coordinator directive.
    pub fn deliver(&self, directive: &Outbound) {
        match directive {
            Outbound::Broadcast { session, event } => self.broadcast_to_session(session, event),
            Outbound::Unicast { connection, event } => {
                self.send_to(connection, event);
            }
            Outbound::Close { connection } => self.kick(connection),
        }
    }

    pub fn deliver_all(&self, directives: &[Outbound]) {
        for directive in directives {
            self.deliver(directive);
        }
    }

    /// Number of live connections.
    pub fn count(&self) -> usize {
        self.conns.len()
    }

    /// Remove connections that stopped answering pings.
    pub fn cleanup_dead_connections(&self) -> usize {
        let dead: Vec<ConnectionId> = self
            .conns
            .iter()
            .filter(|entry| !entry.value().is_alive())
            .map(|entry| entry.key().clone())
            .collect();

        let removed = dead.len();
        for id in dead {
            self.unregister(&id);
            tracing::info!(connection_id = %id, "cleaned up dead connection");
        }
        removed
    }
}

/// Drive one WebSocket: split into reader/writer, heartbeat pings from the
/// writer side, pong-based liveness on the reader side. Returns when either
/// half ends (socket closed, kicked, or errored).
pub async fn run_ws_connection(
    socket: WebSocket,
    conn_id: ConnectionId,
    mut rx: mpsc::Receiver<String>,
    registry: Arc<ConnectionRegistry>,
    on_message: mpsc::Sender<(ConnectionId, String)>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_cid = conn_id.clone();
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        ping_interval.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                    tracing::trace!(connection_id = %writer_cid, "sent ping");
                }
            }
        }
        // Flush a close frame when we initiated the shutdown (kick path)
        let _ = ws_tx.send(WsMessage::Close(None)).await;
    });

    let reader_cid = conn_id.clone();
    let reader_registry = Arc::clone(&registry);
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    let _ = on_message.send((reader_cid.clone(), text.to_string())).await;
                }
                WsMessage::Pong(_) => {
                    if let Some(conn) = reader_registry.get(&reader_cid) {
                        conn.record_pong();
                    }
                }
                WsMessage::Close(_) => break,
                WsMessage::Ping(_) => {} // axum answers pings automatically
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }
}

/// Periodically sweep connections whose pongs stopped.
pub fn start_cleanup_task(
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = registry.cleanup_dead_connections();
            if removed > 0 {
                tracing::info!(removed, "dead connection cleanup");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(queue: usize) -> ConnectionRegistry {
        ConnectionRegistry::new(queue, Arc::new(MetricsRecorder::new()))
    }

    fn bind(reg: &ConnectionRegistry, session: &SessionId, user: &str) -> (ConnectionId, mpsc::Receiver<String>) {
        reg.register(session.clone(), UserId::from_raw(user))
    }

    #[test]
    fn register_and_unregister() {
        let reg = registry(32);
        assert_eq!(reg.count(), 0);

        let session = SessionId::new();
        let (id1, _rx1) = bind(&reg, &session, "u1");
        let (id2, _rx2) = bind(&reg, &session, "u2");
        assert_eq!(reg.count(), 2);

        reg.unregister(&id1);
        reg.unregister(&id2);
        assert_eq!(reg.count(), 0);
    }

    #[test]
    fn send_to_delivers_serialized_event() {
        let reg = registry(32);
        let session = SessionId::new();
        let (id, mut rx) = bind(&reg, &session, "u1");

        assert!(reg.send_to(&id, &ServerEvent::ServerWaitingForPartner));
        let msg = rx.try_recv().unwrap();
        assert!(msg.contains("\"type\":\"ServerWaitingForPartner\""));
    }

    #[test]
    fn send_to_unknown_connection_is_false() {
        let reg = registry(32);
        assert!(!reg.send_to(&ConnectionId::new(), &ServerEvent::ServerPartnerFound));
    }

    #[test]
    fn broadcast_scoped_to_session() {
        let reg = registry(32);
        let session_a = SessionId::new();
        let session_b = SessionId::new();
        let (_, mut rx1) = bind(&reg, &session_a, "u1");
        let (_, mut rx2) = bind(&reg, &session_a, "u2");
        let (_, mut rx3) = bind(&reg, &session_b, "u3");

        reg.broadcast_to_session(&session_a, &ServerEvent::ServerPartnerFound);

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
        assert!(rx3.try_recv().is_err());
    }

    #[test]
    fn kick_removes_and_closes_channel() {
        let reg = registry(32);
        let session = SessionId::new();
        let (id, mut rx) = bind(&reg, &session, "u1");

        reg.kick(&id);
        assert_eq!(reg.count(), 0);
        // Sender dropped: the writer's receive side sees a closed channel
        assert!(matches!(rx.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)));
    }

    #[test]
    fn full_queue_drops_and_counts() {
        let metrics = Arc::new(MetricsRecorder::new());
        let reg = ConnectionRegistry::new(2, Arc::clone(&metrics));
        let session = SessionId::new();
        let (id, _rx) = bind(&reg, &session, "u1");

        assert!(reg.send_to(&id, &ServerEvent::ServerPartnerFound));
        assert!(reg.send_to(&id, &ServerEvent::ServerPartnerFound));
        // Queue of two is full now
        assert!(!reg.send_to(&id, &ServerEvent::ServerPartnerFound));
        assert_eq!(metrics.get("broadcast_drops_total"), 1);
    }

    #[test]
    fn deliver_executes_directives() {
        let reg = registry(32);
        let session = SessionId::new();
        let (id1, mut rx1) = bind(&reg, &session, "u1");
        let (id2, mut rx2) = bind(&reg, &session, "u2");

        reg.deliver_all(&[
            Outbound::Broadcast {
                session: session.clone(),
                event: ServerEvent::ServerPartnerFound,
            },
            Outbound::Unicast {
                connection: id2.clone(),
                event: ServerEvent::ServerWaitingForPartner,
            },
            Outbound::Close { connection: id1.clone() },
        ]);

        assert!(rx1.try_recv().unwrap().contains("ServerPartnerFound"));
        assert!(rx2.try_recv().unwrap().contains("ServerPartnerFound"));
        assert!(rx2.try_recv().unwrap().contains("ServerWaitingForPartner"));
        assert_eq!(reg.count(), 1);
        assert!(reg.get(&id1).is_none());
    }

    #[test]
    fn cleanup_removes_expired_connections() {
        let reg = registry(32);
        let session = SessionId::new();
        let (id, _rx) = bind(&reg, &session, "u1");

        reg.get(&id).unwrap().last_pong.store(0, Ordering::Relaxed);
        assert_eq!(reg.cleanup_dead_connections(), 1);
        assert_eq!(reg.count(), 0);
    }

    #[test]
    fn pong_tracking_keeps_connection_alive() {
        let reg = registry(32);
        let session = SessionId::new();
        let (id, _rx) = bind(&reg, &session, "u1");

        let conn = reg.get(&id).unwrap();
        assert!(conn.is_alive());
        conn.record_pong();
        assert!(conn.is_alive());
        assert_eq!(reg.cleanup_dead_connections(), 0);
    }
}
