//! Collaborator ports used by the call controller
//!
//! Implemented in the infrastructure layer (virtual audio device, profile
//! lookups against the store) and by embedding applications.

use crate::domain::shared::{CallError, Result, UserId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Display name used when a caller's profile cannot be resolved
pub const UNKNOWN_USER: &str = "Unknown user";

/// Captured microphone audio
///
/// `stop` releases the device; a stopped stream cannot be restarted.
pub trait LocalAudioStream: Send + Sync {
    fn track_id(&self) -> &str;
    fn stream_id(&self) -> &str;
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
    fn stop(&self);
    fn is_stopped(&self) -> bool;
}

/// Access to capture devices
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Prompt for and open the microphone. Fails with `PermissionDenied`.
    async fn acquire_microphone(&self) -> std::result::Result<Arc<dyn LocalAudioStream>, CallError>;
}

/// Public profile of a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub display_name: String,
    pub avatar_url: Option<String>,
}

impl Profile {
    pub fn unknown() -> Self {
        Self {
            display_name: UNKNOWN_USER.to_string(),
            avatar_url: None,
        }
    }
}

/// Looks up display names and avatars
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProfileResolver: Send + Sync {
    async fn resolve(&self, user_id: UserId) -> Result<Profile>;
}
