//! Signaling relay over the call store

pub mod client;

pub use client::{SignalingClient, Subscription};
