use std::sync::Arc;
use std::time::Duration;

use proctor_core::{
    CommunicationMethod, ConnectionId, CoordinatorError, Participant, Role, ServerEvent,
    SessionId, SessionPhase, UserId, MAX_PARTICIPANTS,
};
use proctor_telemetry::MetricsRecorder;

use crate::profile::{UserProfileStore, STATUS_OFFLINE};
use crate::store::{SessionStore, SharedSession};

/// Default simulation length when the start signal carries no duration.
const DEFAULT_DURATION_MINUTES: u64 = 10;

/// Budget for the best-effort offline push on disconnect.
const PROFILE_PUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// A delivery directive produced by a coordinator operation.
///
/// The coordinator mutates session state first and describes the fan-out;
/// the gateway executes directives best-effort, so one slow or dead
/// connection can never abort a state transition.
#[derive(Clone, Debug, PartialEq)]
pub enum Outbound {
    /// Deliver to every connection currently bound to the session.
    Broadcast {
        session: SessionId,
        event: ServerEvent,
    },
    /// Deliver to a single connection.
    Unicast {
        connection: ConnectionId,
        event: ServerEvent,
    },
    /// Force-close a connection (superseded by a newer one).
    Close { connection: ConnectionId },
}

/// The state machine governing admission, readiness, start, and disconnect
/// for all sessions. Transport-agnostic: every operation takes the bound
/// (session, user, connection) context explicitly and returns directives.
pub struct SessionCoordinator {
    store: Arc<SessionStore>,
    profiles: Arc<dyn UserProfileStore>,
    metrics: Arc<MetricsRecorder>,
}

impl SessionCoordinator {
    pub fn new(
        store: Arc<SessionStore>,
        profiles: Arc<dyn UserProfileStore>,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        Self {
            store,
            profiles,
            metrics,
        }
    }

    /// Admit a user into a session, or replace their existing membership on
    /// reconnect (newest connection wins; the superseded connection gets a
    /// `Close` directive).
    ///
    /// # Errors
    ///
    /// `SessionFull` when two other users already hold the seats; nothing
    /// is mutated in that case.
    pub async fn admit(
        &self,
        session: &SharedSession,
        user_id: UserId,
        role: Role,
        display_name: String,
        connection_id: ConnectionId,
    ) -> Result<Vec<Outbound>, CoordinatorError> {
        let mut s = session.lock().await;

        let participant =
            Participant::new(user_id.clone(), connection_id.clone(), role, display_name);
        let superseded = match s.admit(participant) {
            Ok(superseded) => superseded,
            Err(err) => {
                self.metrics.increment("admissions_rejected_total");
                tracing::warn!(
                    session_id = %s.id,
                    user_id = %user_id,
                    "admission rejected, session already has two participants"
                );
                return Err(err);
            }
        };

        tracing::info!(
            session_id = %s.id,
            user_id = %user_id,
            participants = s.participant_count(),
            reconnect = superseded.is_some(),
            "participant joined"
        );

        let mut out = Vec::new();
        if let Some(old) = superseded {
            out.push(Outbound::Close { connection: old });
        }

        out.push(Outbound::Broadcast {
            session: s.id.clone(),
            event: ServerEvent::ServerPartnerUpdate {
                participants: s.roster(),
            },
        });

        match s.participant_count() {
            1 => out.push(Outbound::Unicast {
                connection: connection_id.clone(),
                event: ServerEvent::ServerWaitingForPartner,
            }),
            2 => out.push(Outbound::Broadcast {
                session: s.id.clone(),
                event: ServerEvent::ServerPartnerFound,
            }),
            _ => {}
        }

        // Voice sessions hand the room descriptor to each connection as it
        // arrives; earlier members already have it.
        if s.communication_method == CommunicationMethod::Voice {
            if let Some(room) = &s.voice_room {
                out.push(Outbound::Unicast {
                    connection: connection_id,
                    event: ServerEvent::voice_room_info(room),
                });
            }
        }

        Ok(out)
    }

    /// Mark a participant ready. Silent no-op for unknown users, which
    /// covers a readiness signal racing a disconnect.
    pub async fn set_ready(&self, session: &SharedSession, user_id: &UserId) -> Vec<Outbound> {
        let mut s = session.lock().await;

        let Some(participant) = s.participant_mut(user_id) else {
            return Vec::new();
        };
        participant.is_ready = true;

        let mut out = vec![Outbound::Broadcast {
            session: s.id.clone(),
            event: ServerEvent::ServerPartnerUpdate {
                participants: s.roster(),
            },
        }];

        // Gated on count and readiness alone, not on phase: a mid-run
        // rejoin resets the dedup flag, and both participants re-readying
        // fires the signal again even though the session is running.
        if s.participant_count() == MAX_PARTICIPANTS && s.all_ready() && !s.both_ready_announced {
            s.both_ready_announced = true;
            tracing::info!(session_id = %s.id, "both participants ready");
            out.push(Outbound::Broadcast {
                session: s.id.clone(),
                event: ServerEvent::ServerBothReady,
            });
        }

        out
    }

    /// Start the simulation. Trusted operator action: no readiness check,
    /// and a repeated start repeats the broadcasts.
    pub async fn start(
        &self,
        session: &SharedSession,
        duration_minutes: Option<u64>,
        method_override: Option<CommunicationMethod>,
    ) -> Vec<Outbound> {
        let mut s = session.lock().await;
        s.started = true;

        // Client-supplied and unbounded on the wire
        let duration_seconds = duration_minutes
            .unwrap_or(DEFAULT_DURATION_MINUTES)
            .saturating_mul(60);
        tracing::info!(
            session_id = %s.id,
            duration_seconds,
            "simulation started"
        );

        let mut out = vec![Outbound::Broadcast {
            session: s.id.clone(),
            event: ServerEvent::ServerStartSimulation { duration_seconds },
        }];

        // The session's method is immutable; an override in the start
        // payload only steers this branch.
        let method = method_override.unwrap_or(s.communication_method);
        let call_event = match (&method, &s.voice_room) {
            (CommunicationMethod::Voice, Some(room)) => ServerEvent::initiate_voice_call(room),
            _ => ServerEvent::ServerInitiateExternalCall {
                message: "Please start voice communication through your conferencing tool."
                    .to_owned(),
            },
        };
        out.push(Outbound::Broadcast {
            session: s.id.clone(),
            event: call_event,
        });

        out
    }

    /// Unicast the voice-room descriptor to the requester.
    ///
    /// # Errors
    ///
    /// `NoVoiceRoom` when the session has none; the gateway surfaces it as
    /// an error notice without closing the connection.
    pub async fn request_voice_room(
        &self,
        session: &SharedSession,
        connection_id: &ConnectionId,
    ) -> Result<Vec<Outbound>, CoordinatorError> {
        let s = session.lock().await;
        let room = s
            .voice_room
            .as_ref()
            .ok_or_else(|| CoordinatorError::NoVoiceRoom(s.id.clone()))?;

        Ok(vec![Outbound::Unicast {
            connection: connection_id.clone(),
            event: ServerEvent::voice_room_info(room),
        }])
    }

    /// Record that a participant joined or left the voice room. No-op for
    /// unknown users.
    pub async fn set_voice_presence(
        &self,
        session: &SharedSession,
        user_id: &UserId,
        connected: bool,
    ) -> Vec<Outbound> {
        let mut s = session.lock().await;

        let Some(participant) = s.participant_mut(user_id) else {
            return Vec::new();
        };
        participant.voice_connected = connected;
        let display_name = participant.display_name.clone();

        let message = if connected {
            format!("{display_name} joined the voice call")
        } else {
            format!("{display_name} left the voice call")
        };
        tracing::debug!(session_id = %s.id, user_id = %user_id, connected, "voice presence changed");

        vec![Outbound::Broadcast {
            session: s.id.clone(),
            event: ServerEvent::ServerVoiceStatusUpdate {
                participants: s.roster(),
                message,
            },
        }]
    }

    /// Handle a connection ending. Removal only happens when the stored
    /// connection id matches, so a superseded connection's late teardown
    /// cannot evict the member's live connection. The offline status push
    /// is spawned after the session lock is released and never blocks
    /// cleanup.
    pub async fn disconnect(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
        connection_id: &ConnectionId,
    ) -> Vec<Outbound> {
        let Some(session) = self.store.get(session_id) else {
            return Vec::new();
        };

        let (out, now_empty) = {
            let mut s = session.lock().await;
            let Some(removed) = s.remove_if_connection(user_id, connection_id) else {
                tracing::debug!(
                    session_id = %session_id,
                    user_id = %user_id,
                    "ignoring disconnect from superseded connection"
                );
                return Vec::new();
            };

            tracing::info!(
                session_id = %session_id,
                user_id = %user_id,
                remaining = s.participant_count(),
                "participant left"
            );

            let out = vec![Outbound::Broadcast {
                session: s.id.clone(),
                event: ServerEvent::ServerPartnerDisconnected {
                    message: format!("Your partner ({}) disconnected.", removed.display_name),
                    remaining_participants: s.roster(),
                },
            }];
            (out, s.is_empty())
        };

        if now_empty && self.store.remove(session_id) {
            tracing::info!(session_id = %session_id, "session empty, removed");
        }

        self.push_offline_status(user_id.clone());
        out
    }

    /// Fire-and-forget status push to the external profile store, with its
    /// own timeout. Failure is logged and counted, never retried here.
    fn push_offline_status(&self, user_id: UserId) {
        let profiles = Arc::clone(&self.profiles);
        let metrics = Arc::clone(&self.metrics);

        tokio::spawn(async move {
            let push = profiles.update_status(&user_id, STATUS_OFFLINE);
            match tokio::time::timeout(PROFILE_PUSH_TIMEOUT, push).await {
                Ok(Ok(())) => {
                    tracing::debug!(user_id = %user_id, "user marked offline");
                }
                Ok(Err(err)) => {
                    metrics.increment("profile_push_failures_total");
                    tracing::warn!(user_id = %user_id, error = %err, "offline status push failed");
                }
                Err(_) => {
                    metrics.increment("profile_push_failures_total");
                    tracing::warn!(user_id = %user_id, "offline status push timed out");
                }
            }
        });
    }
}
