use crate::ids::SessionId;

/// Typed error taxonomy for coordination operations.
/// Classifies errors by what they do to the offending connection.
#[derive(Clone, Debug, thiserror::Error)]
pub enum CoordinatorError {
    /// Missing or empty required connect parameter / request field.
    /// Rejected immediately, nothing mutated.
    #[error("invalid connection request: {0}")]
    Validation(String),

    /// Two other users already hold the session's seats.
    #[error("simulation session {0} is already full")]
    SessionFull(SessionId),

    /// A voice-room request on a session that has no room.
    /// Surfaced to the requester only; the connection stays open.
    #[error("no voice room is available for session {0}")]
    NoVoiceRoom(SessionId),

    /// External user-profile store failure. Logged and counted, never
    /// propagated to clients, never blocks session cleanup.
    #[error("user-profile store: {0}")]
    ExternalStore(String),
}

impl CoordinatorError {
    /// Whether this error rejects the connection it came from.
    pub fn closes_connection(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::SessionFull(_))
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::SessionFull(_) => "session_full",
            Self::NoVoiceRoom(_) => "no_voice_room",
            Self::ExternalStore(_) => "external_store",
        }
    }
}
