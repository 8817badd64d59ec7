//! CPAL adapter for microphone capture
//!
//! cpal streams are not `Send`, so each capture runs on a dedicated
//! audio thread that owns the stream; samples cross into the async
//! world over a channel. The hardware callback must never block, so
//! full channels drop the batch rather than stall the device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, StreamConfig};
use tokio::sync::{mpsc, oneshot, watch};

use super::{AccessStatus, AudioCaptureDevice, CaptureConfig, CaptureError, CaptureHandle, CaptureStream};

/// Channel depth for sample batches (~10s of 100ms callbacks)
const SAMPLE_CHANNEL_DEPTH: usize = 100;

/// Microphone capture through the default cpal host.
pub struct CpalCaptureDevice {
    granted: AtomicBool,
    active: Arc<AtomicBool>,
}

impl CpalCaptureDevice {
    pub fn new() -> Self {
        Self {
            granted: AtomicBool::new(false),
            active: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Default for CpalCaptureDevice {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl AudioCaptureDevice for CpalCaptureDevice {
    async fn request_access(&self) -> Result<AccessStatus, CaptureError> {
        if self.granted.load(Ordering::SeqCst) {
            return Ok(AccessStatus::Granted);
        }

        // The probe opens and immediately releases a stream on a blocking
        // thread; holding the microphone between recordings causes device
        // contention across long idle periods.
        let probe = tokio::task::spawn_blocking(probe_default_input)
            .await
            .map_err(|e| CaptureError::StreamFailed(e.to_string()))?;

        match probe {
            Ok(()) => {
                self.granted.store(true, Ordering::SeqCst);
                log::info!("Microphone access granted, probe stream released");
                Ok(AccessStatus::Granted)
            }
            Err(ProbeFailure::NoDevice(e)) => Err(CaptureError::DeviceUnavailable(e)),
            Err(ProbeFailure::Refused(e)) => {
                log::warn!("Microphone probe refused: {}", e);
                Ok(AccessStatus::Denied)
            }
        }
    }

    async fn start_capture(
        &self,
        config: &CaptureConfig,
    ) -> Result<(CaptureHandle, CaptureStream), CaptureError> {
        if !self.granted.load(Ordering::SeqCst) {
            return Err(CaptureError::DeviceUnavailable(
                "no prior access grant".to_string(),
            ));
        }
        if self.active.swap(true, Ordering::SeqCst) {
            return Err(CaptureError::DeviceBusy);
        }

        if config.noise_suppression {
            // cpal exposes no processing controls; the OS input chain decides
            log::debug!("Noise suppression requested; deferring to platform input chain");
        }

        let (samples_tx, samples_rx) = mpsc::channel::<Vec<f32>>(SAMPLE_CHANNEL_DEPTH);
        let (level_tx, level_rx) = watch::channel(0.0f32);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<u32, CaptureError>>();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

        let requested = config.clone();
        let active = self.active.clone();

        std::thread::Builder::new()
            .name("voiceloop-capture".to_string())
            .spawn(move || {
                run_capture_thread(requested, samples_tx, level_tx, ready_tx, stop_rx);
                active.store(false, Ordering::SeqCst);
            })
            .map_err(|e| {
                self.active.store(false, Ordering::SeqCst);
                CaptureError::StreamFailed(e.to_string())
            })?;

        let device_rate = match ready_rx.await {
            Ok(Ok(rate)) => rate,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(CaptureError::StreamFailed(
                    "capture thread exited before stream start".to_string(),
                ))
            }
        };

        log::info!("Capture started at {} Hz", device_rate);

        let handle = CaptureHandle::new(move || {
            // Thread drops the stream when the channel closes or signals
            let _ = stop_tx.send(());
        });

        let stream = CaptureStream {
            samples: samples_rx,
            level: level_rx,
            sample_rate: device_rate,
        };

        Ok((handle, stream))
    }
}

enum ProbeFailure {
    NoDevice(String),
    Refused(String),
}

fn probe_default_input() -> Result<(), ProbeFailure> {
    // Build and immediately drop a stream with throwaway channels; some
    // platforms only surface permission failures at stream creation.
    let (samples_tx, _samples_rx) = mpsc::channel::<Vec<f32>>(1);
    let (level_tx, _level_rx) = watch::channel(0.0f32);

    match build_input_stream(&CaptureConfig::default(), samples_tx, level_tx) {
        Ok((stream, _rate)) => {
            drop(stream);
            Ok(())
        }
        Err(CaptureError::DeviceUnavailable(e)) => Err(ProbeFailure::NoDevice(e)),
        Err(e) => Err(ProbeFailure::Refused(e.to_string())),
    }
}

/// Owns the cpal stream for the lifetime of one capture.
fn run_capture_thread(
    config: CaptureConfig,
    samples_tx: mpsc::Sender<Vec<f32>>,
    level_tx: watch::Sender<f32>,
    ready_tx: oneshot::Sender<Result<u32, CaptureError>>,
    stop_rx: std::sync::mpsc::Receiver<()>,
) {
    let built = build_input_stream(&config, samples_tx, level_tx);

    match built {
        Ok((stream, rate)) => {
            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(CaptureError::StreamFailed(e.to_string())));
                return;
            }
            if ready_tx.send(Ok(rate)).is_err() {
                // Caller vanished before the stream started
                return;
            }
            // Park until the handle releases us; a closed channel counts too
            let _ = stop_rx.recv();
            drop(stream);
            log::debug!("Capture thread released hardware stream");
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
        }
    }
}

fn build_input_stream(
    config: &CaptureConfig,
    samples_tx: mpsc::Sender<Vec<f32>>,
    level_tx: watch::Sender<f32>,
) -> Result<(cpal::Stream, u32), CaptureError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| CaptureError::DeviceUnavailable("no default input device".to_string()))?;

    let supported = device
        .default_input_config()
        .map_err(|e| CaptureError::StreamFailed(e.to_string()))?;

    let sample_format = supported.sample_format();
    let stream_config: StreamConfig = supported.into();
    let device_rate = stream_config.sample_rate.0;
    let device_channels = stream_config.channels;

    if device_rate != config.sample_rate {
        log::debug!(
            "Device delivers {} Hz (requested {} Hz); caller resamples",
            device_rate,
            config.sample_rate
        );
    }

    let stream = match sample_format {
        SampleFormat::F32 => build_stream_typed::<f32>(
            &device,
            &stream_config,
            device_channels,
            samples_tx,
            level_tx,
        ),
        SampleFormat::I16 => build_stream_typed::<i16>(
            &device,
            &stream_config,
            device_channels,
            samples_tx,
            level_tx,
        ),
        SampleFormat::U16 => build_stream_typed::<u16>(
            &device,
            &stream_config,
            device_channels,
            samples_tx,
            level_tx,
        ),
        other => {
            return Err(CaptureError::StreamFailed(format!(
                "unsupported sample format {:?}",
                other
            )))
        }
    }?;

    Ok((stream, device_rate))
}

fn build_stream_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    channels: u16,
    samples_tx: mpsc::Sender<Vec<f32>>,
    level_tx: watch::Sender<f32>,
) -> Result<cpal::Stream, CaptureError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let err_fn = |err| log::error!("Audio input stream error: {}", err);
    let channels = channels as usize;

    let stream = device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                // Downmix interleaved frames to mono
                let mono: Vec<f32> = if channels > 1 {
                    data.chunks(channels)
                        .map(|frame| {
                            frame.iter().map(|&s| f32::from_sample(s)).sum::<f32>()
                                / frame.len() as f32
                        })
                        .collect()
                } else {
                    data.iter().map(|&s| f32::from_sample(s)).collect()
                };

                let _ = level_tx.send(rms_level(&mono));

                // Never block the hardware callback; drop the batch if the
                // consumer fell behind
                if samples_tx.try_send(mono).is_err() {
                    log::warn!("Sample channel full, dropping capture batch");
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| CaptureError::StreamFailed(e.to_string()))?;

    Ok(stream)
}

/// Normalized RMS of a sample batch, clamped to 0.0-1.0.
fn rms_level(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    ((sum_squares / samples.len() as f64).sqrt() as f32).clamp(0.0, 1.0)
}
