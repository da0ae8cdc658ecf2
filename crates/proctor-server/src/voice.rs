use proctor_core::{SessionId, VoiceRoom};
use rand::distributions::Alphanumeric;
use rand::Rng;

const SUFFIX_LEN: usize = 6;
const FRAGMENT_LEN: usize = 8;

/// Allocates voice-conferencing room descriptors for sessions.
///
/// Room ids combine a fragment of the session id with a random suffix, so
/// ids stay human-correlatable to their session while collisions across
/// concurrent sessions are negligible (36^6 suffixes on top of distinct
/// fragments). Pure apart from entropy consumption.
#[derive(Clone, Debug)]
pub struct VoiceRoomAllocator {
    base_url: String,
    prefix: String,
}

impl Default for VoiceRoomAllocator {
    fn default() -> Self {
        Self {
            base_url: "https://meet.jit.si".to_owned(),
            prefix: "sim".to_owned(),
        }
    }
}

impl VoiceRoomAllocator {
    pub fn new(base_url: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            prefix: prefix.into(),
        }
    }

    pub fn allocate(&self, session_id: &SessionId) -> VoiceRoom {
        let fragment = Self::fragment(session_id);
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(SUFFIX_LEN)
            .map(|b| char::from(b).to_ascii_lowercase())
            .collect();

        let room_id = format!("{}-{}-{}", self.prefix, fragment, suffix);
        let join_url = format!("{}/{}", self.base_url, room_id);
        let display_name = format!("Exam Simulation {fragment}");

        tracing::debug!(session_id = %session_id, room_id = %room_id, "allocated voice room");

        VoiceRoom {
            room_id,
            join_url,
            display_name,
        }
    }

    /// Trailing alphanumeric characters of the session id, URL-safe.
    fn fragment(session_id: &SessionId) -> String {
        let chars: Vec<char> = session_id
            .as_str()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        chars[chars.len().saturating_sub(FRAGMENT_LEN)..]
            .iter()
            .collect()
    }
}
