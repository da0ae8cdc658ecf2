pub mod errors;
pub mod events;
pub mod ids;
pub mod session;

pub use errors::CoordinatorError;
pub use events::{ClientEvent, ServerEvent};
pub use ids::{ConnectionId, SessionId, UserId};
pub use session::{
    CommunicationMethod, Participant, Role, Session, SessionPhase, VoiceRoom, MAX_PARTICIPANTS,
};
