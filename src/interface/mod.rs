//! Interface layer - External interfaces
//!
//! This layer handles:
//! - The call WebSocket used by the presentation layer
//! - Health, call state and metrics endpoints

pub mod api;
