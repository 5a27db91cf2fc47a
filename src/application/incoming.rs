//! Incoming Call Listener
//!
//! Watches for ringing call records addressed to the signed-in user, resolves
//! the caller's profile and hands the call to an [`IncomingCallHandler`].

use crate::application::ports::{Profile, ProfileResolver};
use crate::domain::call::{CallRecord, CallStore, ChangeFeed};
use crate::domain::shared::{CallError, UserId};
use crate::infrastructure::signaling::SignalingClient;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A ringing call together with who is calling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCall {
    pub record: CallRecord,
    pub caller: Profile,
}

/// Receives calls surfaced by the listener
#[async_trait]
pub trait IncomingCallHandler: Send + Sync {
    async fn on_incoming_call(&self, call: IncomingCall);
}

/// Resolve a profile, falling back to the placeholder on error or timeout
pub async fn resolve_profile(
    profiles: &dyn ProfileResolver,
    user_id: UserId,
    timeout: Duration,
) -> Profile {
    match tokio::time::timeout(timeout, profiles.resolve(user_id)).await {
        Ok(Ok(profile)) => profile,
        Ok(Err(e)) => {
            debug!("Profile lookup for {} failed: {}", user_id, e);
            Profile::unknown()
        }
        Err(_) => {
            warn!("Profile lookup for {} timed out after {:?}", user_id, timeout);
            Profile::unknown()
        }
    }
}

pub struct IncomingCallListener {
    store: Arc<dyn CallStore>,
    feed: Arc<dyn ChangeFeed>,
    profiles: Arc<dyn ProfileResolver>,
    handler: Arc<dyn IncomingCallHandler>,
    lookup_timeout: Duration,
    running: Mutex<Option<(UserId, JoinHandle<()>)>>,
}

impl IncomingCallListener {
    pub fn new(
        store: Arc<dyn CallStore>,
        feed: Arc<dyn ChangeFeed>,
        profiles: Arc<dyn ProfileResolver>,
        handler: Arc<dyn IncomingCallHandler>,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            store,
            feed,
            profiles,
            handler,
            lookup_timeout,
            running: Mutex::new(None),
        }
    }

    /// Start listening for calls to `user_id`, replacing any earlier subscription
    pub async fn init(&self, user_id: UserId) -> Result<(), CallError> {
        let client = SignalingClient::new(self.store.clone(), self.feed.clone(), user_id);
        let mut subscription = client.subscribe_incoming().await?;

        let profiles = self.profiles.clone();
        let handler = self.handler.clone();
        let lookup_timeout = self.lookup_timeout;

        let task = tokio::spawn(async move {
            while let Some(record) = subscription.recv().await {
                debug!("Call {} is ringing for {}", record.id, record.callee_id);
                let profiles = profiles.clone();
                let handler = handler.clone();
                // One task per call so a slow profile lookup never holds up the next
                tokio::spawn(async move {
                    let caller =
                        resolve_profile(profiles.as_ref(), record.caller_id, lookup_timeout).await;
                    handler.on_incoming_call(IncomingCall { record, caller }).await;
                });
            }
            debug!("Incoming call subscription ended");
        });

        let previous = self.running.lock().await.replace((user_id, task));
        if let Some((previous_user, task)) = previous {
            task.abort();
            debug!("Replaced incoming call listener for {}", previous_user);
        }

        info!("Listening for incoming calls to {}", user_id);
        Ok(())
    }

    /// Stop listening. No-op when not running.
    pub async fn shutdown(&self) {
        if let Some((user_id, task)) = self.running.lock().await.take() {
            task.abort();
            info!("Stopped listening for incoming calls to {}", user_id);
        }
    }

    /// User currently listened for
    pub async fn listening_for(&self) -> Option<UserId> {
        self.running.lock().await.as_ref().map(|(user_id, _)| *user_id)
    }
}

impl Drop for IncomingCallListener {
    fn drop(&mut self) {
        if let Some((_, task)) = self.running.get_mut().take() {
            task.abort();
        }
    }
}
