use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use proctor_core::{CommunicationMethod, Session, SessionId, VoiceRoom};
use tokio::sync::Mutex;

/// A session record behind its own lock. All mutation of one session is
/// serialized through this mutex; operations on different sessions never
/// contend.
pub type SharedSession = Arc<Mutex<Session>>;

/// The session map already exists.
#[derive(Debug, thiserror::Error)]
#[error("session {0} already exists")]
pub struct SessionExists(pub SessionId);

/// In-memory collection of live sessions.
///
/// Constructed once at process start and injected everywhere; there is no
/// hidden global. No background expiry: a session lives exactly as long as
/// it has at least one participant, so memory is bounded by concurrent
/// simulations, not history.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: DashMap<SessionId, SharedSession>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fully constructed session. Creation is a single atomic
    /// step; no caller can observe a partially built record.
    pub fn create(
        &self,
        id: SessionId,
        station_id: impl Into<String>,
        communication_method: CommunicationMethod,
        voice_room: Option<VoiceRoom>,
    ) -> Result<SharedSession, SessionExists> {
        match self.sessions.entry(id.clone()) {
            Entry::Occupied(_) => Err(SessionExists(id)),
            Entry::Vacant(vacant) => {
                let session = Arc::new(Mutex::new(Session::new(
                    id,
                    station_id,
                    communication_method,
                    voice_room,
                )));
                vacant.insert(Arc::clone(&session));
                Ok(session)
            }
        }
    }

    pub fn get(&self, id: &SessionId) -> Option<SharedSession> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Create-if-absent for connections that reference an unknown session
    /// id. Fallback sessions default to manual conferencing and carry no
    /// voice room. Atomic through the entry API, so two racing connections
    /// resolve to the same record.
    pub fn get_or_create_fallback(
        &self,
        id: SessionId,
        station_id: impl Into<String>,
    ) -> SharedSession {
        Arc::clone(
            self.sessions
                .entry(id.clone())
                .or_insert_with(|| {
                    tracing::info!(session_id = %id, "creating session from connection fallback");
                    Arc::new(Mutex::new(Session::new(
                        id.clone(),
                        station_id,
                        CommunicationMethod::Meet,
                        None,
                    )))
                })
                .value(),
        )
    }

    pub fn remove(&self, id: &SessionId) -> bool {
        self.sessions.remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_get() {
        let store = SessionStore::new();
        let id = SessionId::new();
        store
            .create(id.clone(), "station-a", CommunicationMethod::Meet, None)
            .unwrap();

        assert!(store.get(&id).is_some());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn duplicate_create_fails() {
        let store = SessionStore::new();
        let id = SessionId::new();
        store
            .create(id.clone(), "station-a", CommunicationMethod::Meet, None)
            .unwrap();
        let err = store
            .create(id.clone(), "station-b", CommunicationMethod::Voice, None)
            .unwrap_err();
        assert_eq!(err.0, id);
    }

    #[tokio::test]
    async fn fallback_creates_once_and_defaults_to_meet() {
        let store = SessionStore::new();
        let id = SessionId::from_raw("session_from_client");

        let first = store.get_or_create_fallback(id.clone(), "station-a");
        let second = store.get_or_create_fallback(id.clone(), "station-ignored");
        assert!(Arc::ptr_eq(&first, &second));

        let session = first.lock().await;
        assert_eq!(session.station_id, "station-a");
        assert_eq!(session.communication_method, CommunicationMethod::Meet);
        assert!(session.voice_room.is_none());
    }

    #[tokio::test]
    async fn fallback_returns_existing_session_untouched() {
        let store = SessionStore::new();
        let id = SessionId::new();
        store
            .create(id.clone(), "station-a", CommunicationMethod::Voice, None)
            .unwrap();

        let shared = store.get_or_create_fallback(id.clone(), "station-other");
        let session = shared.lock().await;
        assert_eq!(session.station_id, "station-a");
        assert_eq!(session.communication_method, CommunicationMethod::Voice);
    }

    #[test]
    fn remove_deletes() {
        let store = SessionStore::new();
        let id = SessionId::new();
        store
            .create(id.clone(), "station-a", CommunicationMethod::Meet, None)
            .unwrap();

        assert!(store.remove(&id));
        assert!(store.get(&id).is_none());
        assert!(!store.remove(&id));
    }
}
