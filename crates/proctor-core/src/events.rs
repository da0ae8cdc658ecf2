use serde::{Deserialize, Serialize};

use crate::session::{CommunicationMethod, Participant, VoiceRoom};

/// Events a client may send over its WebSocket connection.
///
/// The `type` tag carries the event name; payload keys are camelCase to
/// match the browser client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    ClientReady,
    #[serde(rename_all = "camelCase")]
    ClientStartSimulation {
        duration_minutes: Option<u64>,
        communication_method: Option<CommunicationMethod>,
    },
    ClientRequestVoiceRoom,
    ClientVoiceJoined,
    ClientVoiceLeft,
}

/// Events the server sends to one connection or fans out to a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    ServerError {
        message: String,
    },
    ServerPartnerUpdate {
        participants: Vec<Participant>,
    },
    ServerWaitingForPartner,
    ServerPartnerFound,
    ServerBothReady,
    #[serde(rename_all = "camelCase")]
    ServerStartSimulation {
        duration_seconds: u64,
    },
    #[serde(rename_all = "camelCase")]
    ServerInitiateVoiceCall {
        room_id: String,
        join_url: String,
        display_name: String,
    },
    ServerInitiateExternalCall {
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    ServerVoiceRoomInfo {
        room_id: String,
        join_url: String,
        display_name: String,
    },
    ServerVoiceStatusUpdate {
        participants: Vec<Participant>,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    ServerPartnerDisconnected {
        message: String,
        remaining_participants: Vec<Participant>,
    },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::ServerError { message: message.into() }
    }

    pub fn voice_room_info(room: &VoiceRoom) -> Self {
        Self::ServerVoiceRoomInfo {
            room_id: room.room_id.clone(),
            join_url: room.join_url.clone(),
            display_name: room.display_name.clone(),
        }
    }

    pub fn initiate_voice_call(room: &VoiceRoom) -> Self {
        Self::ServerInitiateVoiceCall {
            room_id: room.room_id.clone(),
            join_url: room.join_url.clone(),
            display_name: room.display_name.clone(),
        }
    }

    /// The event name on the wire, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ServerError { .. } => "ServerError",
            Self::ServerPartnerUpdate { .. } => "ServerPartnerUpdate",
            Self::ServerWaitingForPartner => "ServerWaitingForPartner",
            Self::ServerPartnerFound => "ServerPartnerFound",
            Self::ServerBothReady => "ServerBothReady",
            Self::ServerStartSimulation { .. } => "ServerStartSimulation",
            Self::ServerInitiateVoiceCall { .. } => "ServerInitiateVoiceCall",
            Self::ServerInitiateExternalCall { .. } => "ServerInitiateExternalCall",
            Self::ServerVoiceRoomInfo { .. } => "ServerVoiceRoomInfo",
            Self::ServerVoiceStatusUpdate { .. } => "ServerVoiceStatusUpdate",
            Self::ServerPartnerDisconnected { .. } => "ServerPartnerDisconnected",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{ConnectionId, UserId};
    use crate::session::Role;

    #[test]
    fn client_ready_parses_from_bare_tag() {
        let event: ClientEvent = serde_json::from_str(r#"{"type":"ClientReady"}"#).unwrap();
        assert_eq!(event, ClientEvent::ClientReady);
    }

    #[test]
    fn start_simulation_accepts_optional_fields() {
        let event: ClientEvent =
            serde_json::from_str(r#"{"type":"ClientStartSimulation"}"#).unwrap();
        assert_eq!(
            event,
            ClientEvent::ClientStartSimulation { duration_minutes: None, communication_method: None }
        );

        let event: ClientEvent = serde_json::from_str(
            r#"{"type":"ClientStartSimulation","durationMinutes":5,"communicationMethod":"voice"}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            ClientEvent::ClientStartSimulation {
                duration_minutes: Some(5),
                communication_method: Some(CommunicationMethod::Voice),
            }
        );
    }

    #[test]
    fn unknown_event_name_fails_to_parse() {
        // The gateway treats this as ignorable, not fatal.
        assert!(serde_json::from_str::<ClientEvent>(r#"{"type":"ClientSomethingNew"}"#).is_err());
    }

    #[test]
    fn server_events_tag_with_event_name() {
        let json = serde_json::to_value(ServerEvent::ServerWaitingForPartner).unwrap();
        assert_eq!(json["type"], "ServerWaitingForPartner");

        let json =
            serde_json::to_value(ServerEvent::ServerStartSimulation { duration_seconds: 300 })
                .unwrap();
        assert_eq!(json["type"], "ServerStartSimulation");
        assert_eq!(json["durationSeconds"], 300);
    }

    #[test]
    fn voice_call_event_carries_room_fields_camel_case() {
        let room = VoiceRoom {
            room_id: "sim-abc123-xy12ab".into(),
            join_url: "https://meet.jit.si/sim-abc123-xy12ab".into(),
            display_name: "Exam Simulation abc123".into(),
        };
        let json = serde_json::to_value(ServerEvent::initiate_voice_call(&room)).unwrap();
        assert_eq!(json["type"], "ServerInitiateVoiceCall");
        assert_eq!(json["roomId"], "sim-abc123-xy12ab");
        assert_eq!(json["joinUrl"], "https://meet.jit.si/sim-abc123-xy12ab");
        assert_eq!(json["displayName"], "Exam Simulation abc123");
    }

    #[test]
    fn partner_update_embeds_roster() {
        let p = Participant::new(
            UserId::from_raw("u1"),
            ConnectionId::new(),
            Role::Examiner,
            "Dr. Silva",
        );
        let json =
            serde_json::to_value(ServerEvent::ServerPartnerUpdate { participants: vec![p] })
                .unwrap();
        assert_eq!(json["participants"][0]["userId"], "u1");
        assert_eq!(json["participants"][0]["role"], "examiner");
    }

    #[test]
    fn partner_disconnected_uses_camel_case_roster_key() {
        let json = serde_json::to_value(ServerEvent::ServerPartnerDisconnected {
            message: "Your partner (Ana) disconnected.".into(),
            remaining_participants: vec![],
        })
        .unwrap();
        assert!(json.get("remainingParticipants").is_some());
    }
}
