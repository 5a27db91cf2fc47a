//! API interface implementations

pub mod call_handler;
pub mod dto;
pub mod metrics_handler;
pub mod router;
pub mod ws_handler;

pub use call_handler::{apply_intent, ApiState};
pub use dto::{CallIntent, ServerFrame};
pub use router::build_router;
