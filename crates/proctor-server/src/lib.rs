pub mod coordinator;
pub mod http;
pub mod profile;
pub mod registry;
pub mod server;
pub mod store;
pub mod voice;

pub use coordinator::{Outbound, SessionCoordinator};
pub use profile::{InMemoryProfileStore, ProfileError, UserProfile, UserProfileStore};
pub use registry::ConnectionRegistry;
pub use server::{start, AppState, ServerConfig, ServerHandle};
pub use store::{SessionStore, SharedSession};
pub use voice::VoiceRoomAllocator;
