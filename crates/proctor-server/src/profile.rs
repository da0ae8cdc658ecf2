use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use proctor_core::UserId;
use serde::Serialize;

/// Status strings pushed to the profile store.
pub const STATUS_OFFLINE: &str = "offline";

/// Error from the external user-profile collaborator.
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("user {0} not found")]
    NotFound(UserId),
    #[error("profile backend unavailable: {0}")]
    Unavailable(String),
}

/// One user's profile record, as far as this server cares about it.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub status: String,
    pub last_active: DateTime<Utc>,
}

/// Seam to the upstream user-profile document store.
///
/// The store itself (and its authentication) lives outside this process;
/// callers treat every update as best-effort.
#[async_trait]
pub trait UserProfileStore: Send + Sync {
    /// Set the user's status and bump `lastActive` to now.
    async fn update_status(&self, user_id: &UserId, status: &str) -> Result<(), ProfileError>;

    async fn get(&self, user_id: &UserId) -> Option<UserProfile>;
}

/// In-memory implementation, used as the default collaborator and in tests.
#[derive(Debug, Default)]
pub struct InMemoryProfileStore {
    profiles: DashMap<UserId, UserProfile>,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserProfileStore for InMemoryProfileStore {
    async fn update_status(&self, user_id: &UserId, status: &str) -> Result<(), ProfileError> {
        self.profiles.insert(
            user_id.clone(),
            UserProfile {
                status: status.to_owned(),
                last_active: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get(&self, user_id: &UserId) -> Option<UserProfile> {
        self.profiles.get(user_id).map(|entry| entry.value().clone())
    }
}

/// Profile store whose writes always fail. Exercises the best-effort paths.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct FailingProfileStore;

#[cfg(test)]
#[async_trait]
impl UserProfileStore for FailingProfileStore {
    async fn update_status(&self, _user_id: &UserId, _status: &str) -> Result<(), ProfileError> {
        Err(ProfileError::Unavailable("simulated outage".into()))
    }

    async fn get(&self, _user_id: &UserId) -> Option<UserProfile> {
        None
    }
}
