//! Call Lifecycle Controller
//!
//! Owns the single active call of this client. Local intents and remote events
//! (signaling messages, transport state) are applied to one [`CallSession`]
//! behind an async mutex that is never held across an await. Every multi-step
//! operation carries the token of the attempt it belongs to, and gives up as
//! soon as the session has moved on.

use crate::application::incoming::{resolve_profile, IncomingCall, IncomingCallHandler};
use crate::application::ports::{LocalAudioStream, MediaDevices, Profile, ProfileResolver};
use crate::config::CallConfig;
use crate::domain::call::{
    CallEvent, CallRecord, CallRole, CallSession, CallStatus, CallStore, CallView, CallerType,
    ChangeFeed, EndReason, IceCandidateInit, MediaState, NewCallRecord, RecordPatch, RecordStatus,
    SessionDescription, SignalPayload, SignalingMessage,
};
use crate::domain::shared::{CallError, CallId, DomainError, MessageId, UserId};
use crate::infrastructure::metrics;
use crate::infrastructure::protocols::webrtc::{
    PeerConfig, PeerConnectionManager, PeerEvent, PeerEventReceiver, TransportFactory,
    TransportState,
};
use crate::infrastructure::signaling::{SignalingClient, Subscription};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 64;

/// Reject reason that makes the caller end with `busy`
pub const BUSY_REASON: &str = "busy";

/// Optional details attached to an outgoing call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallContext {
    pub appointment_id: Option<Uuid>,
    /// Overrides the configured caller type
    pub caller_type: Option<CallerType>,
}

#[derive(Debug, Clone)]
pub struct CallSettings {
    pub caller_type: CallerType,
    pub timing: CallConfig,
    pub peer: PeerConfig,
}

/// Collaborators the controller drives
#[derive(Clone)]
pub struct CallDependencies {
    pub store: Arc<dyn CallStore>,
    pub feed: Arc<dyn ChangeFeed>,
    pub devices: Arc<dyn MediaDevices>,
    pub profiles: Arc<dyn ProfileResolver>,
    pub transports: Arc<dyn TransportFactory>,
}

/// Who ended the call, which decides what gets published and persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// Publish hangup/reject and persist the end
    Local,
    /// The remote side already signaled; persist the end
    Remote,
    /// Persist without signaling
    Silent,
}

#[derive(Debug, Clone, Copy)]
struct LastEnd {
    token: u64,
    reason: EndReason,
    origin: Origin,
}

struct ActiveCall {
    token: u64,
    session: CallSession,
    remote_name: Option<String>,
    remote_avatar: Option<String>,
    stream: Option<Arc<dyn LocalAudioStream>>,
    peer: Option<Arc<PeerConnectionManager>>,
    offer_tx: watch::Sender<Option<SessionDescription>>,
    early_candidates: Vec<IceCandidateInit>,
    seen_messages: HashSet<MessageId>,
    answer_received: bool,
    accepting: bool,
    connected_at: Option<Instant>,
    /// Ringing timeout (caller) or ringing expiry (callee)
    timer: Option<JoinHandle<()>>,
    grace: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ActiveCall {
    fn new(token: u64, session: CallSession, profile: Option<Profile>) -> Self {
        let (offer_tx, _) = watch::channel(None);
        let (remote_name, remote_avatar) = match profile {
            Some(p) => (Some(p.display_name), p.avatar_url),
            None => (None, None),
        };
        Self {
            token,
            session,
            remote_name,
            remote_avatar,
            stream: None,
            peer: None,
            offer_tx,
            early_candidates: Vec::new(),
            seen_messages: HashSet::new(),
            answer_received: false,
            accepting: false,
            connected_at: None,
            timer: None,
            grace: None,
            tasks: Vec::new(),
        }
    }

    fn elapsed_seconds(&self) -> u64 {
        self.connected_at.map_or(0, |t| t.elapsed().as_secs())
    }

    fn view(&self) -> CallView {
        CallView::from_session(
            &self.session,
            self.remote_name.as_deref(),
            self.remote_avatar.as_deref(),
        )
    }

    fn is_ringing_callee(&self) -> bool {
        self.session.local_role() == CallRole::Callee && self.session.status() == CallStatus::Ringing
    }

    /// Stop background work and release the microphone and transport
    async fn release(self) {
        for task in self.tasks {
            task.abort();
        }
        if let Some(timer) = self.timer {
            timer.abort();
        }
        if let Some(grace) = self.grace {
            grace.abort();
        }
        if let Some(peer) = self.peer {
            peer.close().await;
        }
        if let Some(stream) = self.stream {
            stream.stop();
        }
    }
}

#[derive(Default)]
struct ControllerState {
    next_token: u64,
    active: Option<ActiveCall>,
    last_end: Option<LastEnd>,
}

impl ControllerState {
    fn issue_token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    fn current(&mut self, token: u64) -> Option<&mut ActiveCall> {
        self.active.as_mut().filter(|a| a.token == token)
    }

    fn is_current(&self, token: u64) -> bool {
        self.active.as_ref().is_some_and(|a| a.token == token)
    }

    /// Error for an operation whose attempt was superseded
    fn cancellation(&self, token: u64) -> CallError {
        match self.last_end {
            Some(end) if end.token == token && end.origin == Origin::Remote => match end.reason {
                EndReason::RemoteHangup => CallError::RemoteHangup,
                EndReason::Rejected | EndReason::Busy => CallError::RemoteRejected,
                _ => CallError::Cancelled,
            },
            _ => CallError::Cancelled,
        }
    }
}

enum SignalAction {
    Nothing,
    ApplyAnswer(Arc<PeerConnectionManager>, SessionDescription),
    AddCandidate(Arc<PeerConnectionManager>, IceCandidateInit),
    End(EndReason),
}

struct Shared {
    local_user: UserId,
    settings: CallSettings,
    deps: CallDependencies,
    signaling: SignalingClient,
    state: Mutex<ControllerState>,
    events: broadcast::Sender<CallEvent>,
    view: watch::Sender<CallView>,
}

/// State machine for the local user's calls. Cheap to clone.
#[derive(Clone)]
pub struct CallController {
    shared: Arc<Shared>,
}

impl CallController {
    pub fn new(local_user: UserId, settings: CallSettings, deps: CallDependencies) -> Self {
        let signaling = SignalingClient::new(deps.store.clone(), deps.feed.clone(), local_user);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (view, _) = watch::channel(CallView::idle());

        Self {
            shared: Arc::new(Shared {
                local_user,
                settings,
                deps,
                signaling,
                state: Mutex::new(ControllerState::default()),
                events,
                view,
            }),
        }
    }

    pub fn local_user(&self) -> UserId {
        self.shared.local_user
    }

    /// Current presentation snapshot
    pub fn view(&self) -> CallView {
        self.shared.view.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<CallView> {
        self.shared.view.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.shared.events.subscribe()
    }

    /// Place a call to `remote_user`. Returns once the offer is published.
    pub async fn start_call(&self, remote_user: UserId, context: CallContext) -> Result<CallId, CallError> {
        if remote_user == self.shared.local_user {
            return Err(CallError::InvalidState("cannot call yourself".to_string()));
        }

        let token = {
            let mut state = self.shared.state.lock().await;
            if state.active.is_some() {
                return Err(CallError::AlreadyInCall);
            }
            let token = state.issue_token();
            state.active = Some(ActiveCall::new(token, CallSession::outgoing(remote_user), None));
            self.refresh(&state);
            token
        };
        metrics::set_call_active(true);
        self.emit(CallEvent::StatusChanged {
            call_id: None,
            status: CallStatus::Calling,
        });
        info!("Calling {}", remote_user);

        // A denied prompt must leave no record and no signaling behind
        let stream = match self.shared.deps.devices.acquire_microphone().await {
            Ok(stream) => stream,
            Err(e) => {
                self.abandon(token).await;
                return Err(e);
            }
        };
        self.attach_stream(token, stream).await?;

        let fields = NewCallRecord {
            caller_id: self.shared.local_user,
            callee_id: remote_user,
            caller_type: context.caller_type.unwrap_or(self.shared.settings.caller_type),
            appointment_id: context.appointment_id,
        };
        let record = match self.shared.deps.store.create_call_record(fields).await {
            Ok(record) => record,
            Err(DomainError::Conflict(msg)) => {
                warn!("Call to {} refused: {}", remote_user, msg);
                self.abandon(token).await;
                return Err(CallError::AlreadyInCall);
            }
            Err(e) => {
                error!("Failed to create call record for {}: {}", remote_user, e);
                self.abandon(token).await;
                return Err(CallError::RecordCreationFailed(e.to_string()));
            }
        };
        let call_id = record.id;

        {
            let mut state = self.shared.state.lock().await;
            let Some(active) = state.current(token) else {
                let err = state.cancellation(token);
                drop(state);
                info!("Call {} cancelled during setup", call_id);
                self.persist_end(call_id, EndReason::Cancelled, 0).await;
                return Err(err);
            };
            active.session.assign_id(call_id)?;
            self.refresh(&state);
        }
        self.emit(CallEvent::StatusChanged {
            call_id: Some(call_id),
            status: CallStatus::Calling,
        });

        let peer = self.connect_peer(token, call_id, remote_user).await?;

        // Replies must not slip past us: subscribe before the offer goes out
        let subscription = self
            .guard(token, self.shared.signaling.subscribe_call(call_id).await)
            .await?;
        self.spawn_signal_pump(token, subscription).await?;

        let offer = self.guard(token, peer.create_offer().await).await?;
        self.publish(call_id, remote_user, SignalPayload::Offer(offer)).await;
        self.arm_ringing_timeout(token).await;

        metrics::record_call_started(CallRole::Caller);
        info!("Call {} ringing at {}", call_id, remote_user);
        Ok(call_id)
    }

    /// Accept a ringing call. From idle, the record is looked up first.
    pub async fn answer_call(&self, call_id: CallId) -> Result<(), CallError> {
        let token = match self.begin_accept(call_id).await? {
            Some(token) => token,
            None => {
                self.adopt_ringing_record(call_id).await?;
                self.begin_accept(call_id).await?.ok_or_else(|| {
                    CallError::InvalidState(format!("call {} is no longer ringing", call_id))
                })?
            }
        };
        info!("Answering call {}", call_id);

        let stream = match self.shared.deps.devices.acquire_microphone().await {
            Ok(stream) => stream,
            Err(e) => {
                let mut state = self.shared.state.lock().await;
                if let Some(active) = state.current(token) {
                    active.accepting = false;
                }
                warn!("Call {} keeps ringing: {}", call_id, e);
                return Err(e);
            }
        };
        self.attach_stream(token, stream).await?;

        let (remote_user, offer_rx) = {
            let mut state = self.shared.state.lock().await;
            let Some(active) = state.current(token) else {
                return Err(state.cancellation(token));
            };
            if let Some(expiry) = active.timer.take() {
                expiry.abort();
            }
            (active.session.remote_user_id(), active.offer_tx.subscribe())
        };

        let peer = self.connect_peer(token, call_id, remote_user).await?;
        let offer = self.await_offer(token, offer_rx).await?;
        self.guard(token, peer.set_remote_description(&offer).await)
            .await?;
        let answer = self.guard(token, peer.create_answer().await).await?;
        self.publish(call_id, remote_user, SignalPayload::Answer(answer))
            .await;

        if !self.mark_connected(token).await {
            let state = self.shared.state.lock().await;
            return Err(state.cancellation(token));
        }
        if let Err(e) = self
            .shared
            .deps
            .store
            .update_call_record(call_id, RecordPatch::Connected)
            .await
        {
            warn!("Failed to mark call {} connected: {}", call_id, e);
        }

        metrics::record_call_started(CallRole::Callee);
        Ok(())
    }

    /// Decline the ringing call. No-op when idle.
    pub async fn reject_call(&self, call_id: CallId) -> Result<(), CallError> {
        let token = {
            let state = self.shared.state.lock().await;
            match &state.active {
                None => return Ok(()),
                Some(active) if active.session.id() == Some(call_id) && active.is_ringing_callee() => {
                    active.token
                }
                Some(_) => {
                    return Err(CallError::InvalidState(format!(
                        "call {} is not ringing",
                        call_id
                    )))
                }
            }
        };

        info!("Rejecting call {}", call_id);
        self.finish(token, EndReason::Rejected, Origin::Local).await;
        Ok(())
    }

    /// End the active call. A ringing incoming call is rejected instead.
    /// No-op when idle.
    pub async fn end_call(&self, reason: EndReason) {
        let (token, reason) = {
            let state = self.shared.state.lock().await;
            let Some(active) = &state.active else {
                debug!("end_call with no active call");
                return;
            };
            let reason = if active.is_ringing_callee() {
                EndReason::Rejected
            } else {
                reason
            };
            (active.token, reason)
        };
        self.finish(token, reason, Origin::Local).await;
    }

    /// Flip the microphone on/off. Returns the new muted flag, or `None` when idle.
    pub async fn toggle_mute(&self) -> Option<bool> {
        let mut state = self.shared.state.lock().await;
        let muted = {
            let active = state.active.as_mut()?;
            let muted = active.session.toggle_muted();
            if let Some(stream) = &active.stream {
                stream.set_enabled(!muted);
            }
            muted
        };
        self.refresh(&state);
        debug!("Microphone {}", if muted { "muted" } else { "unmuted" });
        Some(muted)
    }

    /// Returns the new speaker flag, or `None` when idle
    pub async fn toggle_speaker(&self) -> Option<bool> {
        let mut state = self.shared.state.lock().await;
        let speaker_on = state.active.as_mut()?.session.toggle_speaker();
        self.refresh(&state);
        Some(speaker_on)
    }

    /// Record a 1-5 quality rating on a finished call
    pub async fn rate_call(&self, call_id: CallId, rating: i16) -> Result<CallRecord, CallError> {
        let record = self
            .shared
            .deps
            .store
            .update_call_record(call_id, RecordPatch::Rated { rating })
            .await?;
        info!("Call {} rated {}", call_id, rating);
        Ok(record)
    }

    fn emit(&self, event: CallEvent) {
        // No receivers is fine
        let _ = self.shared.events.send(event);
    }

    fn refresh(&self, state: &ControllerState) {
        let view = state.active.as_ref().map_or_else(CallView::idle, ActiveCall::view);
        self.shared.view.send_replace(view);
    }

    async fn publish(&self, call_id: CallId, to_user: UserId, payload: SignalPayload) -> bool {
        match self.shared.signaling.publish(call_id, to_user, payload).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Call {}: {}", call_id, e);
                false
            }
        }
    }

    async fn persist_end(&self, call_id: CallId, reason: EndReason, duration_seconds: u64) {
        let patch = RecordPatch::Ended {
            reason,
            duration_seconds: u32::try_from(duration_seconds).unwrap_or(u32::MAX),
        };
        if let Err(e) = self.shared.deps.store.update_call_record(call_id, patch).await {
            error!("Failed to finalize call record {}: {}", call_id, e);
        }
    }

    async fn attach_stream(&self, token: u64, stream: Arc<dyn LocalAudioStream>) -> Result<(), CallError> {
        let mut state = self.shared.state.lock().await;
        match state.current(token) {
            Some(active) => {
                active.stream = Some(stream);
                Ok(())
            }
            None => {
                stream.stop();
                Err(state.cancellation(token))
            }
        }
    }

    /// Pass through a setup step's result. A superseded attempt yields its
    /// cancellation error; a failed step ends the call.
    async fn guard<T>(&self, token: u64, result: Result<T, CallError>) -> Result<T, CallError> {
        {
            let state = self.shared.state.lock().await;
            if !state.is_current(token) {
                return Err(state.cancellation(token));
            }
        }
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!("Call setup failed: {}", e);
                self.finish(token, EndReason::ConnectionFailed, Origin::Local)
                    .await;
                Err(e)
            }
        }
    }

    async fn adopt_task(&self, token: u64, task: JoinHandle<()>) -> Result<(), CallError> {
        let mut state = self.shared.state.lock().await;
        match state.current(token) {
            Some(active) => {
                active.tasks.push(task);
                Ok(())
            }
            None => {
                task.abort();
                Err(state.cancellation(token))
            }
        }
    }

    /// Create the peer connection, start its event pump and attach the microphone
    async fn connect_peer(
        &self,
        token: u64,
        call_id: CallId,
        remote_user: UserId,
    ) -> Result<Arc<PeerConnectionManager>, CallError> {
        let peer = Arc::new(PeerConnectionManager::new(
            self.shared.deps.transports.clone(),
            self.shared.settings.peer.clone(),
        ));

        let (track_id, stream_id, early) = {
            let mut state = self.shared.state.lock().await;
            let Some(active) = state.current(token) else {
                return Err(state.cancellation(token));
            };
            let (track_id, stream_id) = match &active.stream {
                Some(stream) => (stream.track_id().to_string(), stream.stream_id().to_string()),
                None => return Err(CallError::InvalidState("no local audio".to_string())),
            };
            active.peer = Some(peer.clone());
            (track_id, stream_id, std::mem::take(&mut active.early_candidates))
        };

        let events = self.guard(token, peer.initialize().await).await?;
        let pump = self.spawn_transport_pump(token, call_id, remote_user, events);
        self.adopt_task(token, pump).await?;
        self.guard(token, peer.add_local_track(&track_id, &stream_id).await)
            .await?;

        // Candidates that arrived while ringing wait in the manager for the offer
        for candidate in early {
            if let Err(e) = peer.add_remote_ice_candidate(&candidate).await {
                debug!("Dropping early candidate: {}", e);
            }
        }

        Ok(peer)
    }

    async fn spawn_signal_pump(
        &self,
        token: u64,
        mut subscription: Subscription<SignalingMessage>,
    ) -> Result<(), CallError> {
        let this = self.clone();
        let task = tokio::spawn(async move {
            while let Some(message) = subscription.recv().await {
                this.handle_signal(token, message).await;
            }
        });
        self.adopt_task(token, task).await
    }

    fn spawn_transport_pump(
        &self,
        token: u64,
        call_id: CallId,
        remote_user: UserId,
        mut events: PeerEventReceiver,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    PeerEvent::LocalCandidate(candidate) => {
                        this.publish(call_id, remote_user, SignalPayload::IceCandidate(candidate))
                            .await;
                    }
                    PeerEvent::RemoteStream { stream_id } => {
                        debug!("Call {}: remote stream {}", call_id, stream_id);
                        this.emit(CallEvent::RemoteStream { call_id, stream_id });
                    }
                    PeerEvent::ConnectionStateChanged(transport) => {
                        this.on_transport_state(token, call_id, transport).await;
                    }
                }
            }
        })
    }

    async fn handle_signal(&self, token: u64, message: SignalingMessage) {
        let action = {
            let mut state = self.shared.state.lock().await;
            let Some(active) = state.current(token) else {
                return;
            };
            // Delivery is at-least-once
            if !active.seen_messages.insert(message.id) {
                return;
            }
            if message.from_user_id != active.session.remote_user_id() {
                warn!(
                    "Ignoring {} from {} on call {}",
                    message.payload.kind(),
                    message.from_user_id,
                    message.call_id
                );
                return;
            }

            match message.payload {
                SignalPayload::Offer(offer) => {
                    if active.session.local_role() == CallRole::Callee
                        && active.offer_tx.borrow().is_none()
                    {
                        active.offer_tx.send_replace(Some(offer));
                    }
                    SignalAction::Nothing
                }
                SignalPayload::Answer(answer) => {
                    let expected = active.session.local_role() == CallRole::Caller
                        && active.session.status() == CallStatus::Calling
                        && !active.answer_received;
                    match (&active.peer, expected) {
                        (Some(peer), true) => {
                            active.answer_received = true;
                            SignalAction::ApplyAnswer(peer.clone(), answer)
                        }
                        _ => {
                            debug!("Ignoring unexpected answer on call {}", message.call_id);
                            SignalAction::Nothing
                        }
                    }
                }
                SignalPayload::IceCandidate(candidate) => match &active.peer {
                    Some(peer) => SignalAction::AddCandidate(peer.clone(), candidate),
                    None => {
                        active.early_candidates.push(candidate);
                        SignalAction::Nothing
                    }
                },
                SignalPayload::Hangup => SignalAction::End(EndReason::RemoteHangup),
                SignalPayload::Reject { reason } => {
                    if reason.as_deref() == Some(BUSY_REASON) {
                        SignalAction::End(EndReason::Busy)
                    } else {
                        SignalAction::End(EndReason::Rejected)
                    }
                }
            }
        };

        match action {
            SignalAction::Nothing => {}
            SignalAction::ApplyAnswer(peer, answer) => match peer.set_remote_description(&answer).await {
                Ok(()) => {
                    self.mark_connected(token).await;
                }
                Err(e) => {
                    warn!("Failed to apply answer: {}", e);
                    self.spawn_finish(token, EndReason::ConnectionFailed, Origin::Local);
                }
            },
            SignalAction::AddCandidate(peer, candidate) => {
                match peer.add_remote_ice_candidate(&candidate).await {
                    Ok(disposition) => debug!("Remote candidate {:?}", disposition),
                    Err(CallError::ClosedOperation) => {}
                    Err(e) => warn!("Failed to add remote candidate: {}", e),
                }
            }
            SignalAction::End(reason) => {
                info!("Remote side ended the call: {}", reason);
                self.spawn_finish(token, reason, Origin::Remote);
            }
        }
    }

    async fn on_transport_state(&self, token: u64, call_id: CallId, transport: TransportState) {
        match transport {
            TransportState::Connected => {
                let mut state = self.shared.state.lock().await;
                let Some(active) = state.current(token) else {
                    return;
                };
                if let Some(grace) = active.grace.take() {
                    grace.abort();
                    info!("Call {}: transport recovered", call_id);
                }
                if active.session.media() == MediaState::Flowing {
                    return;
                }
                active.session.set_media(MediaState::Flowing);
                self.refresh(&state);
                drop(state);
                self.emit(CallEvent::MediaFlowing { call_id });
            }
            TransportState::Disconnected => {
                let mut state = self.shared.state.lock().await;
                let Some(active) = state.current(token) else {
                    return;
                };
                if active.grace.is_some() {
                    return;
                }
                let grace = self.shared.settings.timing.disconnect_grace();
                warn!("Call {}: transport disconnected, waiting {:?}", call_id, grace);

                let this = self.clone();
                active.grace = Some(tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    warn!("Call {}: transport did not recover", call_id);
                    this.spawn_finish(token, EndReason::ConnectionFailed, Origin::Local);
                }));
                active.session.set_media(MediaState::Interrupted);
                self.refresh(&state);
                drop(state);
                self.emit(CallEvent::MediaInterrupted { call_id });
            }
            TransportState::Failed => {
                warn!("Call {}: transport failed", call_id);
                self.spawn_finish(token, EndReason::ConnectionFailed, Origin::Local);
            }
            TransportState::New | TransportState::Connecting | TransportState::Closed => {
                debug!("Call {}: transport {}", call_id, transport);
            }
        }
    }

    /// Move to connected and start the duration counter
    async fn mark_connected(&self, token: u64) -> bool {
        let mut state = self.shared.state.lock().await;
        let call_id = {
            let Some(active) = state.current(token) else {
                return false;
            };
            if let Err(e) = active.session.transition_to(CallStatus::Connected) {
                warn!("Not connecting: {}", e);
                return false;
            }
            active.connected_at = Some(Instant::now());
            if let Some(timer) = active.timer.take() {
                timer.abort();
            }
            let this = self.clone();
            active.tasks.push(tokio::spawn(async move { this.tick(token).await }));
            active.session.id()
        };
        self.refresh(&state);
        drop(state);

        if let Some(call_id) = call_id {
            info!("Call {} connected", call_id);
            self.emit(CallEvent::StatusChanged {
                call_id: Some(call_id),
                status: CallStatus::Connected,
            });
            self.emit(CallEvent::Connected { call_id });
        }
        true
    }

    async fn tick(&self, token: u64) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.tick().await;
        loop {
            interval.tick().await;
            let mut state = self.shared.state.lock().await;
            let Some(active) = state.current(token) else {
                break;
            };
            let seconds = active.elapsed_seconds();
            active.session.set_duration(seconds);
            self.refresh(&state);
        }
    }

    async fn arm_ringing_timeout(&self, token: u64) {
        let timeout = self.shared.settings.timing.ringing_timeout();
        let this = self.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            info!("No answer within {:?}", timeout);
            this.spawn_finish(token, EndReason::NoAnswer, Origin::Local);
        });

        let mut state = self.shared.state.lock().await;
        match state.current(token) {
            Some(active) if active.session.status() == CallStatus::Calling => {
                active.timer = Some(timer);
            }
            _ => timer.abort(),
        }
    }

    async fn await_offer(
        &self,
        token: u64,
        mut offer_rx: watch::Receiver<Option<SessionDescription>>,
    ) -> Result<SessionDescription, CallError> {
        let timeout = self.shared.settings.timing.offer_timeout();
        let waited = tokio::time::timeout(timeout, async {
            offer_rx
                .wait_for(Option::is_some)
                .await
                .map(|offer| (*offer).clone())
        })
        .await;

        match waited {
            Ok(Ok(Some(offer))) => Ok(offer),
            Ok(_) => {
                let state = self.shared.state.lock().await;
                Err(state.cancellation(token))
            }
            Err(_) => {
                warn!("No offer within {:?}", timeout);
                self.finish(token, EndReason::ConnectionFailed, Origin::Local)
                    .await;
                Err(CallError::ConnectionFailed(
                    "no offer received from caller".to_string(),
                ))
            }
        }
    }

    /// Mark the ringing call as being answered. `None` when nothing is ringing.
    async fn begin_accept(&self, call_id: CallId) -> Result<Option<u64>, CallError> {
        let mut state = self.shared.state.lock().await;
        let Some(active) = state.active.as_mut() else {
            return Ok(None);
        };
        if active.session.id() != Some(call_id) {
            return Err(CallError::AlreadyInCall);
        }
        if !active.is_ringing_callee() {
            return Err(CallError::InvalidState(format!(
                "call {} is {}",
                call_id,
                active.session.status()
            )));
        }
        if active.accepting {
            return Err(CallError::InvalidState(format!(
                "call {} is already being answered",
                call_id
            )));
        }
        active.accepting = true;
        Ok(Some(active.token))
    }

    async fn adopt_ringing_record(&self, call_id: CallId) -> Result<(), CallError> {
        let record = self
            .shared
            .deps
            .store
            .query_call_record(call_id)
            .await?
            .ok_or_else(|| DomainError::NotFound(format!("call {}", call_id)))?;

        if record.callee_id != self.shared.local_user || record.status != RecordStatus::Ringing {
            return Err(CallError::InvalidState(format!(
                "call {} is not ringing for this user",
                call_id
            )));
        }

        let caller = resolve_profile(
            self.shared.deps.profiles.as_ref(),
            record.caller_id,
            self.shared.settings.timing.profile_lookup_timeout(),
        )
        .await;
        self.on_incoming_call(IncomingCall { record, caller }).await;
        Ok(())
    }

    async fn reject_busy(&self, record: &CallRecord) {
        info!(
            "Busy: rejecting call {} from {}",
            record.id, record.caller_id
        );
        self.persist_end(record.id, EndReason::Busy, 0).await;
        self.publish(
            record.id,
            record.caller_id,
            SignalPayload::Reject {
                reason: Some(BUSY_REASON.to_string()),
            },
        )
        .await;
        metrics::record_call_ended(EndReason::Busy, 0);
    }

    /// Return to idle after a setup step failed before anything was signaled
    async fn abandon(&self, token: u64) {
        let call = {
            let mut state = self.shared.state.lock().await;
            if !state.is_current(token) {
                return;
            }
            state.last_end = Some(LastEnd {
                token,
                reason: EndReason::Cancelled,
                origin: Origin::Local,
            });
            let call = state.active.take();
            self.refresh(&state);
            call
        };

        self.emit(CallEvent::StatusChanged {
            call_id: None,
            status: CallStatus::Idle,
        });
        if let Some(call) = call {
            call.release().await;
        }
        metrics::set_call_active(false);
    }

    /// Teardown requested from inside one of the call's own tasks runs on a
    /// fresh task, since teardown aborts them.
    fn spawn_finish(&self, token: u64, reason: EndReason, origin: Origin) {
        let this = self.clone();
        tokio::spawn(async move {
            this.finish(token, reason, origin).await;
        });
    }

    /// End the attempt `token`. Only the first caller for a token does anything.
    async fn finish(&self, token: u64, reason: EndReason, origin: Origin) -> bool {
        let (mut call, status) = {
            let mut state = self.shared.state.lock().await;
            if !state.is_current(token) {
                return false;
            }
            let Some(call) = state.active.take() else {
                return false;
            };
            state.last_end = Some(LastEnd {
                token,
                reason,
                origin,
            });
            self.refresh(&state);
            let status = call.session.status();
            (call, status)
        };

        let duration = call.elapsed_seconds();
        call.session.set_duration(duration);
        if let Err(e) = call.session.transition_to(CallStatus::Ended) {
            debug!("{}", e);
        }

        let call_id = call.session.id();
        let remote_user = call.session.remote_user_id();
        let reject = call.session.local_role() == CallRole::Callee
            && status == CallStatus::Ringing
            && (!call.accepting || reason == EndReason::Rejected);

        self.emit(CallEvent::StatusChanged {
            call_id,
            status: CallStatus::Ended,
        });
        self.emit(CallEvent::Ended { call_id, reason });
        self.emit(CallEvent::StatusChanged {
            call_id: None,
            status: CallStatus::Idle,
        });
        match call_id {
            Some(id) => info!("Call {} ended: {} after {}s", id, reason, duration),
            None => info!("Call setup ended: {}", reason),
        }

        call.release().await;

        if let Some(call_id) = call_id {
            // Finalize before the remote side hears about it. When the remote
            // ended the call its own write normally lands first and this one
            // is a no-op.
            self.persist_end(call_id, reason, duration).await;
            if origin == Origin::Local {
                let payload = if reject {
                    SignalPayload::Reject { reason: None }
                } else {
                    SignalPayload::Hangup
                };
                self.publish(call_id, remote_user, payload).await;
            }
        }

        metrics::record_call_ended(reason, duration);
        metrics::set_call_active(false);
        true
    }
}

#[async_trait]
impl IncomingCallHandler for CallController {
    async fn on_incoming_call(&self, call: IncomingCall) {
        let IncomingCall { record, caller } = call;
        if record.callee_id != self.shared.local_user || record.status != RecordStatus::Ringing {
            return;
        }

        // The feed may redeliver an insert after the call was already settled
        let record = match self.shared.deps.store.query_call_record(record.id).await {
            Ok(Some(stored)) if stored.is_open() && stored.status == RecordStatus::Ringing => stored,
            Ok(Some(stored)) => {
                debug!("Ignoring call {}: record is {:?}", stored.id, stored.status);
                return;
            }
            Ok(None) => {
                warn!("Ignoring call {}: no record", record.id);
                return;
            }
            Err(e) => {
                warn!("Could not re-read call record {}: {}", record.id, e);
                record
            }
        };

        let token = {
            let mut state = self.shared.state.lock().await;
            if let Some(active) = &state.active {
                if active.session.id() == Some(record.id) {
                    debug!("Call {} already ringing", record.id);
                    return;
                }
                drop(state);
                self.reject_busy(&record).await;
                return;
            }
            let token = state.issue_token();
            state.active = Some(ActiveCall::new(
                token,
                CallSession::incoming(record.id, record.caller_id),
                Some(caller.clone()),
            ));
            self.refresh(&state);
            token
        };

        info!(
            "Incoming call {} from {} ({})",
            record.id, caller.display_name, record.caller_id
        );
        metrics::set_call_active(true);
        self.emit(CallEvent::Incoming {
            call_id: record.id,
            caller_id: record.caller_id,
            caller_name: caller.display_name,
        });
        self.emit(CallEvent::StatusChanged {
            call_id: Some(record.id),
            status: CallStatus::Ringing,
        });

        // Outlive the caller's own timeout so its hangup normally arrives first
        let expiry = self.shared.settings.timing.ringing_window();
        let this = self.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(expiry).await;
            info!("Incoming call expired after {:?}", expiry);
            this.spawn_finish(token, EndReason::NoAnswer, Origin::Silent);
        });
        {
            let mut state = self.shared.state.lock().await;
            match state.current(token) {
                Some(active) => active.timer = Some(timer),
                None => {
                    timer.abort();
                    return;
                }
            }
        }

        // Subscribe first, then replay: the offer (or a cancel) may already be stored
        match self.shared.signaling.subscribe_call(record.id).await {
            Ok(subscription) => {
                if self.spawn_signal_pump(token, subscription).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                error!("Cannot follow signaling for call {}: {}", record.id, e);
                self.finish(token, EndReason::ConnectionFailed, Origin::Silent)
                    .await;
                return;
            }
        }

        match self.shared.signaling.backlog(record.id).await {
            Ok(messages) => {
                for message in messages {
                    self.handle_signal(token, message).await;
                }
            }
            Err(e) => warn!("Failed to replay signaling for call {}: {}", record.id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::media::VirtualAudioDevice;
    use crate::infrastructure::persistence::MemoryCallStore;
    use crate::infrastructure::protocols::webrtc::SimulatedNetwork;
    use crate::domain::shared::ErrorKind;

    fn controller(
        user: UserId,
        store: Arc<MemoryCallStore>,
        devices: Arc<VirtualAudioDevice>,
        network: &SimulatedNetwork,
    ) -> CallController {
        CallController::new(
            user,
            CallSettings {
                caller_type: CallerType::User,
                timing: CallConfig::default(),
                peer: PeerConfig::default(),
            },
            CallDependencies {
                store: store.clone(),
                feed: store.clone(),
                devices,
                profiles: store,
                transports: Arc::new(network.endpoint(user.to_string())),
            },
        )
    }

    #[tokio::test]
    async fn test_permission_denied_leaves_no_trace() {
        let store = Arc::new(MemoryCallStore::new());
        let devices = Arc::new(VirtualAudioDevice::new());
        devices.set_denied(true);
        let network = SimulatedNetwork::new();
        let caller = controller(UserId::new(), store.clone(), devices.clone(), &network);

        let err = caller
            .start_call(UserId::new(), CallContext::default())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert_eq!(caller.view().status, CallStatus::Idle);
        assert!(store.records().await.is_empty());
        assert!(store.signals().await.is_empty());
    }

    #[tokio::test]
    async fn test_record_failure_releases_microphone() {
        let store = Arc::new(MemoryCallStore::new());
        store.fail_record_writes(true);
        let devices = Arc::new(VirtualAudioDevice::new());
        let network = SimulatedNetwork::new();
        let caller = controller(UserId::new(), store.clone(), devices.clone(), &network);

        let err = caller
            .start_call(UserId::new(), CallContext::default())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::RecordCreationFailed);
        assert_eq!(devices.acquisitions(), 1);
        assert_eq!(devices.live_streams(), 0);
        assert!(store.signals().await.is_empty());
        assert_eq!(caller.view().status, CallStatus::Idle);
    }

    #[tokio::test]
    async fn test_cannot_call_self() {
        let store = Arc::new(MemoryCallStore::new());
        let network = SimulatedNetwork::new();
        let me = UserId::new();
        let caller = controller(me, store, Arc::new(VirtualAudioDevice::new()), &network);

        let err = caller.start_call(me, CallContext::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn test_idle_controls_are_no_ops() {
        let store = Arc::new(MemoryCallStore::new());
        let network = SimulatedNetwork::new();
        let controller = controller(
            UserId::new(),
            store.clone(),
            Arc::new(VirtualAudioDevice::new()),
            &network,
        );

        controller.end_call(EndReason::UserHangup).await;
        controller.reject_call(CallId::new()).await.unwrap();
        assert_eq!(controller.toggle_mute().await, None);
        assert_eq!(controller.toggle_speaker().await, None);
        assert_eq!(controller.view(), CallView::idle());
        assert!(store.signals().await.is_empty());
    }

    #[tokio::test]
    async fn test_answer_unknown_call_is_not_found() {
        let store = Arc::new(MemoryCallStore::new());
        let network = SimulatedNetwork::new();
        let callee = controller(
            UserId::new(),
            store,
            Arc::new(VirtualAudioDevice::new()),
            &network,
        );

        let err = callee.answer_call(CallId::new()).await.unwrap_err();
        assert!(matches!(err, CallError::Domain(DomainError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_redelivered_call_does_not_ring_again() {
        let store = Arc::new(MemoryCallStore::new());
        let network = SimulatedNetwork::new();
        let me = UserId::new();
        let callee = controller(me, store.clone(), Arc::new(VirtualAudioDevice::new()), &network);
        let record = store
            .create_call_record(NewCallRecord {
                caller_id: UserId::new(),
                callee_id: me,
                caller_type: CallerType::User,
                appointment_id: None,
            })
            .await
            .unwrap();
        let incoming = IncomingCall {
            record: record.clone(),
            caller: Profile {
                display_name: "Coach".to_string(),
                avatar_url: None,
            },
        };

        callee.on_incoming_call(incoming.clone()).await;
        assert_eq!(callee.view().status, CallStatus::Ringing);
        callee.reject_call(record.id).await.unwrap();

        callee.on_incoming_call(incoming).await;
        assert_eq!(callee.view().status, CallStatus::Idle);

        let stored = store.query_call_record(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RecordStatus::Rejected);
        let rejects = store
            .signals()
            .await
            .iter()
            .filter(|s| s.signal_type == "reject")
            .count();
        assert_eq!(rejects, 1);
    }

    #[test]
    fn test_remote_cancellation_maps_to_remote_errors() {
        let mut state = ControllerState::default();
        state.last_end = Some(LastEnd {
            token: 3,
            reason: EndReason::Busy,
            origin: Origin::Remote,
        });
        assert_eq!(state.cancellation(3), CallError::RemoteRejected);
        assert_eq!(state.cancellation(2), CallError::Cancelled);

        state.last_end = Some(LastEnd {
            token: 4,
            reason: EndReason::UserHangup,
            origin: Origin::Local,
        });
        assert_eq!(state.cancellation(4), CallError::Cancelled);
    }
}
