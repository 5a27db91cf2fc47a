//! Virtual audio capture device
//!
//! Stands in for a real microphone in headless deployments and tests. The
//! permission prompt can be delayed or denied, and live streams are counted so
//! leaks show up.

use crate::application::ports::{LocalAudioStream, MediaDevices};
use crate::domain::shared::CallError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct VirtualAudioDevice {
    denied: AtomicBool,
    prompt_delay: Duration,
    live: Arc<AtomicUsize>,
    acquisitions: AtomicUsize,
}

impl VirtualAudioDevice {
    pub fn new() -> Self {
        Self {
            denied: AtomicBool::new(false),
            prompt_delay: Duration::ZERO,
            live: Arc::new(AtomicUsize::new(0)),
            acquisitions: AtomicUsize::new(0),
        }
    }

    /// Simulate the time a user takes to answer the permission prompt
    pub fn with_prompt_delay(mut self, delay: Duration) -> Self {
        self.prompt_delay = delay;
        self
    }

    pub fn set_denied(&self, denied: bool) {
        self.denied.store(denied, Ordering::SeqCst);
    }

    /// Streams acquired and not yet stopped
    pub fn live_streams(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Successful acquisitions since creation
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }
}

impl Default for VirtualAudioDevice {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaDevices for VirtualAudioDevice {
    async fn acquire_microphone(&self) -> Result<Arc<dyn LocalAudioStream>, CallError> {
        if !self.prompt_delay.is_zero() {
            tokio::time::sleep(self.prompt_delay).await;
        }

        if self.denied.load(Ordering::SeqCst) {
            warn!("Microphone permission denied");
            return Err(CallError::PermissionDenied(
                "microphone access was not granted".to_string(),
            ));
        }

        self.live.fetch_add(1, Ordering::SeqCst);
        self.acquisitions.fetch_add(1, Ordering::SeqCst);

        let stream = VirtualAudioStream {
            track_id: format!("audio-{}", Uuid::new_v4()),
            stream_id: format!("local-{}", Uuid::new_v4()),
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            live: Arc::clone(&self.live),
        };
        info!("Microphone acquired (track {})", stream.track_id);
        Ok(Arc::new(stream))
    }
}

struct VirtualAudioStream {
    track_id: String,
    stream_id: String,
    enabled: AtomicBool,
    stopped: AtomicBool,
    live: Arc<AtomicUsize>,
}

impl LocalAudioStream for VirtualAudioStream {
    fn track_id(&self) -> &str {
        &self.track_id
    }

    fn stream_id(&self) -> &str {
        &self.stream_id
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.live.fetch_sub(1, Ordering::SeqCst);
            debug!("Microphone track {} stopped", self.track_id);
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Drop for VirtualAudioStream {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stop_releases_device_once() {
        let device = VirtualAudioDevice::new();
        let stream = device.acquire_microphone().await.unwrap();
        assert_eq!(device.live_streams(), 1);

        stream.stop();
        stream.stop();
        assert_eq!(device.live_streams(), 0);
        assert!(stream.is_stopped());

        drop(stream);
        assert_eq!(device.live_streams(), 0);
    }

    #[tokio::test]
    async fn test_denied_permission() {
        let device = VirtualAudioDevice::new();
        device.set_denied(true);

        let err = device.acquire_microphone().await.err().unwrap();
        assert!(matches!(err, CallError::PermissionDenied(_)));
        assert_eq!(device.acquisitions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prompt_delay() {
        let device = VirtualAudioDevice::new().with_prompt_delay(Duration::from_secs(2));
        let started = tokio::time::Instant::now();
        let stream = device.acquire_microphone().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(stream.is_enabled());
    }
}
