//! Call bounded context - the lifecycle of one peer-to-peer voice call

pub mod event;
pub mod record;
pub mod repository;
pub mod session;
pub mod signaling;
pub mod value_object;

pub use event::{CallEvent, CallView};
pub use record::{CallRecord, NewCallRecord, RecordPatch};
pub use repository::{CallStore, ChangeFeed, FeedStream};
pub use session::CallSession;
pub use signaling::{
    IceCandidateInit, NewSignal, SdpKind, SessionDescription, SignalEnvelope, SignalKind,
    SignalPayload, SignalingMessage,
};
pub use value_object::{CallRole, CallStatus, CallerType, EndReason, MediaState, RecordStatus};
