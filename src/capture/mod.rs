//! Microphone capture behind a polymorphic device seam
//!
//! The engine never touches platform audio APIs directly: it records
//! through the [`AudioCaptureDevice`] trait, so the state machine and
//! codec stay unit-testable without real hardware. The concrete cpal
//! adapter lives in [`cpal_device`].
//!
//! # Acquisition Contract
//!
//! `request_access` is a one-time probe that releases its stream on
//! grant; the microphone is never held open between recordings. Each
//! `start_capture` opens a fresh exclusive stream; the returned
//! [`CaptureHandle`] releases it on `stop()` or on drop, so every exit
//! path (stop, cancel, error, teardown) gives the hardware back.

pub mod cpal_device;

pub use cpal_device::CpalCaptureDevice;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

/// Errors from microphone acquisition and streaming.
#[derive(Debug, Clone)]
pub enum CaptureError {
    /// User refused microphone access
    PermissionDenied,
    /// No usable input device, or no prior access grant
    DeviceUnavailable(String),
    /// A capture is already active on this device
    DeviceBusy,
    /// The platform stream could not be created or died mid-capture
    StreamFailed(String),
}

impl std::fmt::Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureError::PermissionDenied => write!(f, "Microphone access denied"),
            CaptureError::DeviceUnavailable(e) => {
                write!(f, "No audio input device available: {}", e)
            }
            CaptureError::DeviceBusy => write!(f, "A capture is already active on this device"),
            CaptureError::StreamFailed(e) => write!(f, "Audio input stream failed: {}", e),
        }
    }
}

impl std::error::Error for CaptureError {}

/// Outcome of the one-time permission probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessStatus {
    Granted,
    Denied,
}

/// Caller-supplied stream configuration.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Requested sample rate; the device may deliver its native rate
    /// (reported in [`CaptureStream::sample_rate`])
    pub sample_rate: u32,
    pub channels: u16,
    /// Hint only; adapters without platform support ignore it
    pub noise_suppression: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            channels: 1,
            noise_suppression: true,
        }
    }
}

/// Data flowing out of an active capture.
pub struct CaptureStream {
    /// Sample-chunk delivery, one `Vec<f32>` per hardware callback
    pub samples: mpsc::Receiver<Vec<f32>>,
    /// Normalized RMS input level, updated per callback batch
    pub level: watch::Receiver<f32>,
    /// The rate the device actually delivers
    pub sample_rate: u32,
}

/// Handle to an active capture session.
///
/// `stop()` flushes and releases the underlying hardware stream;
/// calling it twice is a no-op, never an error. Dropping an unstopped
/// handle releases the stream too.
pub struct CaptureHandle {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl CaptureHandle {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Stop the capture and release the device. Idempotent.
    pub fn stop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
            log::debug!("Capture handle released");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.release.is_none()
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Exclusive microphone access for one engine instance.
#[async_trait]
pub trait AudioCaptureDevice: Send + Sync {
    /// One-time permission probe. On grant the probe stream is released
    /// immediately; the device is not held open between recordings.
    async fn request_access(&self) -> Result<AccessStatus, CaptureError>;

    /// Open a fresh exclusive stream with the caller's configuration and
    /// begin delivering sample chunks and level updates.
    ///
    /// # Errors
    /// `DeviceUnavailable` if no prior grant exists, `DeviceBusy` if a
    /// capture is already active on this device.
    async fn start_capture(
        &self,
        config: &CaptureConfig,
    ) -> Result<(CaptureHandle, CaptureStream), CaptureError>;
}
