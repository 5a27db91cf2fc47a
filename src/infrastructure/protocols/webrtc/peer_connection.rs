//! Peer Connection Manager
//!
//! Wraps one [`PeerTransport`] for the lifetime of a call. Remote candidates are
//! de-duplicated and held back until a remote description is applied. Once
//! closed, every operation fails with `ClosedOperation`.
use crate::domain::call::{IceCandidateInit, SessionDescription};
use crate::domain::shared::CallError;
use crate::infrastructure::protocols::ice::candidate_key;
use crate::infrastructure::protocols::webrtc::transport::{
    PeerConfig, PeerEventReceiver, PeerTransport, TransportFactory,
};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// What happened to a remote candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    /// Handed to the transport
    Applied,
    /// Waiting for the remote description
    Queued,
    /// Already seen; ignored
    Duplicate,
}

enum Phase {
    New,
    Ready(Arc<dyn PeerTransport>),
    Closed,
}

struct Inner {
    phase: Phase,
    local_description: bool,
    remote_description: bool,
    seen_candidates: HashSet<String>,
    pending_candidates: Vec<IceCandidateInit>,
}

pub struct PeerConnectionManager {
    factory: Arc<dyn TransportFactory>,
    config: PeerConfig,
    inner: Mutex<Inner>,
}

impl PeerConnectionManager {
    pub fn new(factory: Arc<dyn TransportFactory>, config: PeerConfig) -> Self {
        Self {
            factory,
            config,
            inner: Mutex::new(Inner {
                phase: Phase::New,
                local_description: false,
                remote_description: false,
                seen_candidates: HashSet::new(),
                pending_candidates: Vec::new(),
            }),
        }
    }

    /// Create the transport. The returned receiver carries local candidates,
    /// the remote stream and connection state changes.
    pub async fn initialize(&self) -> Result<PeerEventReceiver, CallError> {
        {
            let inner = self.inner.lock().await;
            match inner.phase {
                Phase::Closed => return Err(CallError::ClosedOperation),
                Phase::Ready(_) => {
                    return Err(CallError::InvalidState(
                        "peer connection already initialized".to_string(),
                    ))
                }
                Phase::New => {}
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let transport = self.factory.create(&self.config, tx).await?;

        let mut inner = self.inner.lock().await;
        match inner.phase {
            Phase::New => {
                inner.phase = Phase::Ready(transport);
                info!(
                    "Peer connection initialized with {} ICE servers",
                    self.config.ice_servers.len()
                );
                Ok(rx)
            }
            // Closed while the transport was being built
            _ => {
                drop(inner);
                let _ = transport.close().await;
                Err(CallError::ClosedOperation)
            }
        }
    }

    pub async fn add_local_track(&self, track_id: &str, stream_id: &str) -> Result<(), CallError> {
        let transport = self.transport().await?;
        transport.add_local_track(track_id, stream_id).await?;
        self.ensure_open().await
    }

    /// Create an offer; it is also set as the local description
    pub async fn create_offer(&self) -> Result<SessionDescription, CallError> {
        let transport = self.transport().await?;
        let offer = transport.create_offer().await?;
        self.mark_local_description().await?;
        debug!("Created local offer ({} bytes)", offer.sdp.len());
        Ok(offer)
    }

    /// Create an answer; it is also set as the local description
    pub async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        let transport = self.transport().await?;
        let answer = transport.create_answer().await?;
        self.mark_local_description().await?;
        debug!("Created local answer ({} bytes)", answer.sdp.len());
        Ok(answer)
    }

    /// Apply the remote description, then flush queued candidates
    pub async fn set_remote_description(&self, description: &SessionDescription) -> Result<(), CallError> {
        let transport = self.transport().await?;
        transport.set_remote_description(description).await?;

        let pending = {
            let mut inner = self.inner.lock().await;
            if matches!(inner.phase, Phase::Closed) {
                return Err(CallError::ClosedOperation);
            }
            inner.remote_description = true;
            std::mem::take(&mut inner.pending_candidates)
        };

        if !pending.is_empty() {
            debug!("Flushing {} queued remote candidates", pending.len());
        }
        for candidate in pending {
            if let Err(e) = transport.add_ice_candidate(&candidate).await {
                warn!("Failed to apply queued ICE candidate: {}", e);
                self.forget_candidate(&candidate_key(&candidate.candidate)).await;
            }
        }

        Ok(())
    }

    /// Apply a remote candidate. Duplicates are ignored; candidates that arrive
    /// before the remote description are queued.
    pub async fn add_remote_ice_candidate(
        &self,
        candidate: &IceCandidateInit,
    ) -> Result<CandidateDisposition, CallError> {
        let key = candidate_key(&candidate.candidate);

        let transport = {
            let mut inner = self.inner.lock().await;
            let transport = match &inner.phase {
                Phase::Closed => return Err(CallError::ClosedOperation),
                Phase::New => None,
                Phase::Ready(t) => Some(Arc::clone(t)),
            };

            if !inner.seen_candidates.insert(key.clone()) {
                return Ok(CandidateDisposition::Duplicate);
            }

            match transport {
                Some(t) if inner.remote_description => t,
                _ => {
                    inner.pending_candidates.push(candidate.clone());
                    return Ok(CandidateDisposition::Queued);
                }
            }
        };

        if let Err(e) = transport.add_ice_candidate(candidate).await {
            // A redelivery of the same candidate gets another chance
            self.forget_candidate(&key).await;
            return Err(e);
        }
        Ok(CandidateDisposition::Applied)
    }

    async fn forget_candidate(&self, key: &str) {
        self.inner.lock().await.seen_candidates.remove(key);
    }

    /// Close the transport. Safe to call at any point and more than once.
    pub async fn close(&self) {
        let previous = {
            let mut inner = self.inner.lock().await;
            inner.pending_candidates.clear();
            std::mem::replace(&mut inner.phase, Phase::Closed)
        };

        if let Phase::Ready(transport) = previous {
            if let Err(e) = transport.close().await {
                warn!("Error closing peer transport: {}", e);
            }
            info!("Peer connection closed");
        }
    }

    pub async fn is_closed(&self) -> bool {
        matches!(self.inner.lock().await.phase, Phase::Closed)
    }

    pub async fn has_local_description(&self) -> bool {
        self.inner.lock().await.local_description
    }

    pub async fn has_remote_description(&self) -> bool {
        self.inner.lock().await.remote_description
    }

    pub async fn pending_candidate_count(&self) -> usize {
        self.inner.lock().await.pending_candidates.len()
    }

    async fn transport(&self) -> Result<Arc<dyn PeerTransport>, CallError> {
        match &self.inner.lock().await.phase {
            Phase::Ready(t) => Ok(Arc::clone(t)),
            Phase::Closed => Err(CallError::ClosedOperation),
            Phase::New => Err(CallError::InvalidState(
                "peer connection not initialized".to_string(),
            )),
        }
    }

    async fn ensure_open(&self) -> Result<(), CallError> {
        if self.is_closed().await {
            return Err(CallError::ClosedOperation);
        }
        Ok(())
    }

    async fn mark_local_description(&self) -> Result<(), CallError> {
        let mut inner = self.inner.lock().await;
        if matches!(inner.phase, Phase::Closed) {
            return Err(CallError::ClosedOperation);
        }
        inner.local_description = true;
        Ok(())
    }
}
