use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::CoordinatorError;
use crate::ids::{ConnectionId, SessionId, UserId};

/// Hard cap on session membership: one examinee, one examiner.
pub const MAX_PARTICIPANTS: usize = 2;

/// How the paired participants talk to each other during the simulation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommunicationMethod {
    /// Manual external conferencing; the server only announces the start.
    #[default]
    Meet,
    /// Server-allocated voice room, bootstrapped through signaling events.
    Voice,
}

/// Participant role within a session.
///
/// The coordinator never enforces that the two roles differ, and unknown
/// role strings are carried through untouched so callers can layer their
/// own validation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    Examinee,
    Examiner,
    Other(String),
}

impl From<String> for Role {
    fn from(s: String) -> Self {
        match s.as_str() {
            "examinee" => Self::Examinee,
            "examiner" => Self::Examiner,
            _ => Self::Other(s),
        }
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        match role {
            Role::Examinee => "examinee".to_owned(),
            Role::Examiner => "examiner".to_owned(),
            Role::Other(s) => s,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Examinee => f.write_str("examinee"),
            Self::Examiner => f.write_str("examiner"),
            Self::Other(s) => f.write_str(s),
        }
    }
}

/// Descriptor of the externally hosted voice-conferencing room.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceRoom {
    pub room_id: String,
    pub join_url: String,
    pub display_name: String,
}

/// One user's membership record within a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: UserId,
    pub connection_id: ConnectionId,
    pub role: Role,
    pub display_name: String,
    pub is_ready: bool,
    pub voice_connected: bool,
}

impl Participant {
    pub fn new(
        user_id: UserId,
        connection_id: ConnectionId,
        role: Role,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            connection_id,
            role,
            display_name: display_name.into(),
            is_ready: false,
            voice_connected: false,
        }
    }
}

/// Session phase, derived from membership and readiness on read.
///
/// Transitions are total functions of (participant count, readiness,
/// started); no phase is stored independently of the data that implies it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    Empty,
    Waiting,
    ReadyPending,
    BothReady,
    Running,
}

/// One exam-simulation pairing, bounded to two participants.
///
/// The roster keeps insertion order; the order is what clients see in
/// participant-list snapshots.
#[derive(Clone, Debug)]
pub struct Session {
    pub id: SessionId,
    pub station_id: String,
    pub communication_method: CommunicationMethod,
    pub voice_room: Option<VoiceRoom>,
    participants: Vec<Participant>,
    pub created_at: DateTime<Utc>,
    /// Set by the start signal; never cleared for the session's lifetime.
    pub started: bool,
    /// Dedupes the both-ready signal: emitted once per transition into the
    /// all-ready state, reset whenever membership changes.
    pub both_ready_announced: bool,
}

impl Session {
    pub fn new(
        id: SessionId,
        station_id: impl Into<String>,
        communication_method: CommunicationMethod,
        voice_room: Option<VoiceRoom>,
    ) -> Self {
        Self {
            id,
            station_id: station_id.into(),
            communication_method,
            voice_room,
            participants: Vec::with_capacity(MAX_PARTICIPANTS),
            created_at: Utc::now(),
            started: false,
            both_ready_announced: false,
        }
    }

    pub fn participant(&self, user_id: &UserId) -> Option<&Participant> {
        self.participants.iter().find(|p| &p.user_id == user_id)
    }

    pub fn participant_mut(&mut self, user_id: &UserId) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| &p.user_id == user_id)
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Snapshot of the roster, in insertion order.
    pub fn roster(&self) -> Vec<Participant> {
        self.participants.clone()
    }

    pub fn all_ready(&self) -> bool {
        !self.participants.is_empty() && self.participants.iter().all(|p| p.is_ready)
    }

    pub fn phase(&self) -> SessionPhase {
        if self.participants.is_empty() {
            SessionPhase::Empty
        } else if self.started {
            SessionPhase::Running
        } else if self.participants.len() < MAX_PARTICIPANTS {
            SessionPhase::Waiting
        } else if self.all_ready() {
            SessionPhase::BothReady
        } else {
            SessionPhase::ReadyPending
        }
    }

    /// Insert or replace a membership record.
    ///
    /// A replace carries first-time-join semantics: readiness and voice
    /// presence start over. Returns the superseded connection id when an
    /// existing member reconnected, so the caller can force-close the old
    /// transport (newest connection wins).
    ///
    /// # Errors
    ///
    /// `SessionFull` when two other users already hold the seats.
    pub fn admit(&mut self, participant: Participant) -> Result<Option<ConnectionId>, CoordinatorError> {
        let existing = self
            .participants
            .iter()
            .position(|p| p.user_id == participant.user_id);

        if existing.is_none() && self.participants.len() >= MAX_PARTICIPANTS {
            return Err(CoordinatorError::SessionFull(self.id.clone()));
        }

        self.both_ready_announced = false;

        match existing {
            Some(idx) => {
                let superseded = self.participants[idx].connection_id.clone();
                self.participants[idx] = participant;
                Ok(Some(superseded))
            }
            None => {
                self.participants.push(participant);
                Ok(None)
            }
        }
    }

    /// Remove a member, but only when the stored connection id matches.
    ///
    /// The guard keeps a superseded connection's late teardown from
    /// evicting the member's newer connection.
    pub fn remove_if_connection(
        &mut self,
        user_id: &UserId,
        connection_id: &ConnectionId,
    ) -> Option<Participant> {
        let idx = self
            .participants
            .iter()
            .position(|p| &p.user_id == user_id && &p.connection_id == connection_id)?;
        self.both_ready_announced = false;
        Some(self.participants.remove(idx))
    }
}
