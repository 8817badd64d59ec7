//! CPAL adapter for speaker output
//!
//! Decodes a WAV container with hound and feeds the samples to the
//! default output device. Like capture, the cpal stream is owned by a
//! dedicated thread; the async side only waits for completion or
//! cancellation. A cancelled or aborted clip resolves `Ok` so the
//! player queue never stalls on an interruption.

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::{PlaybackError, PlaybackSink};

/// Tail delay after the last sample so the DAC drains before the
/// stream is torn down
const DRAIN_DELAY: Duration = Duration::from_millis(100);

/// Speaker output through the default cpal host.
pub struct CpalPlaybackSink;

impl CpalPlaybackSink {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CpalPlaybackSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl PlaybackSink for CpalPlaybackSink {
    async fn play(
        &self,
        container: &[u8],
        cancel: &CancellationToken,
    ) -> Result<(), PlaybackError> {
        let clip = decode_container(container)?;
        log::debug!(
            "Playing clip: {} samples at {} Hz, {} channel(s)",
            clip.samples.len(),
            clip.sample_rate,
            clip.channels
        );

        let (done_tx, done_rx) = oneshot::channel::<Result<(), PlaybackError>>();
        // Dropping this releases the audio thread and its stream
        let (_hold_tx, hold_rx) = std::sync::mpsc::channel::<()>();

        std::thread::Builder::new()
            .name("voiceloop-playback".to_string())
            .spawn(move || run_playback_thread(clip, done_tx, hold_rx))
            .map_err(|e| PlaybackError::SinkFailed(e.to_string()))?;

        tokio::select! {
            result = done_rx => {
                match result {
                    Ok(Ok(())) => {
                        tokio::time::sleep(DRAIN_DELAY).await;
                        Ok(())
                    }
                    Ok(Err(e)) => Err(e),
                    // Thread died without reporting: treat as an abort,
                    // which is benign completion
                    Err(_) => Ok(()),
                }
            }
            _ = cancel.cancelled() => {
                log::debug!("Clip playback cancelled");
                Ok(())
            }
        }
    }
}

struct DecodedClip {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u16,
}

fn decode_container(container: &[u8]) -> Result<DecodedClip, PlaybackError> {
    let mut reader = hound::WavReader::new(Cursor::new(container))
        .map_err(|e| PlaybackError::BadClip(e.to_string()))?;
    let spec = reader.spec();

    if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
        return Err(PlaybackError::BadClip(format!(
            "expected PCM16, got {}-bit {:?}",
            spec.bits_per_sample, spec.sample_format
        )));
    }

    let samples: Vec<f32> = reader
        .samples::<i16>()
        .map(|s| s.map(|v| v as f32 / i16::MAX as f32))
        .collect::<Result<_, _>>()
        .map_err(|e| PlaybackError::BadClip(e.to_string()))?;

    Ok(DecodedClip {
        samples,
        sample_rate: spec.sample_rate,
        channels: spec.channels,
    })
}

/// Owns the output stream until the clip finishes or the async side
/// drops its hold channel.
fn run_playback_thread(
    clip: DecodedClip,
    done_tx: oneshot::Sender<Result<(), PlaybackError>>,
    hold_rx: std::sync::mpsc::Receiver<()>,
) {
    // Shared with the output callback, which takes it to signal natural
    // completion; the thread takes it back on setup failure
    let done_slot = Arc::new(Mutex::new(Some(done_tx)));

    let stream = match build_output_stream(&clip, done_slot.clone()) {
        Ok(stream) => stream,
        Err(e) => {
            if let Some(tx) = done_slot.lock().unwrap().take() {
                let _ = tx.send(Err(e));
            }
            return;
        }
    };

    if let Err(e) = stream.play() {
        if let Some(tx) = done_slot.lock().unwrap().take() {
            let _ = tx.send(Err(PlaybackError::SinkFailed(e.to_string())));
        }
        return;
    }

    // Park until the caller drops its end (completion, cancel, or abort)
    let _ = hold_rx.recv();
    drop(stream);
    log::debug!("Playback thread released output stream");
}

fn build_output_stream(
    clip: &DecodedClip,
    done_slot: Arc<Mutex<Option<oneshot::Sender<Result<(), PlaybackError>>>>>,
) -> Result<cpal::Stream, PlaybackError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| PlaybackError::SinkFailed("no output device available".to_string()))?;

    let supported = device
        .supported_output_configs()
        .ok()
        .and_then(|mut configs| {
            configs.find(|c| {
                c.channels() == clip.channels
                    && c.min_sample_rate() <= SampleRate(clip.sample_rate)
                    && c.max_sample_rate() >= SampleRate(clip.sample_rate)
            })
        })
        .or_else(|| {
            // Fallback: stereo output, clip channels upmixed in the callback
            device.supported_output_configs().ok().and_then(|mut cs| {
                cs.find(|c| {
                    c.channels() == 2
                        && c.min_sample_rate() <= SampleRate(clip.sample_rate)
                        && c.max_sample_rate() >= SampleRate(clip.sample_rate)
                })
            })
        });

    let supported = supported.ok_or_else(|| {
        PlaybackError::SinkFailed(format!(
            "no output config for {} Hz / {} channel(s)",
            clip.sample_rate, clip.channels
        ))
    })?;

    let config: StreamConfig = supported.with_sample_rate(SampleRate(clip.sample_rate)).config();
    let out_channels = config.channels as usize;
    let src_channels = clip.channels as usize;

    let cb_samples = Arc::new(clip.samples.clone());
    let position = Arc::new(AtomicUsize::new(0));
    let cb_done = done_slot;

    let stream = device.build_output_stream(
        &config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            let mut pos = position.load(Ordering::Relaxed);
            for frame in data.chunks_mut(out_channels) {
                if pos + src_channels <= cb_samples.len() {
                    for (ch, out) in frame.iter_mut().enumerate() {
                        // Upmix by repeating the last source channel
                        let src = pos + ch.min(src_channels - 1);
                        *out = cb_samples[src];
                    }
                    pos += src_channels;
                } else {
                    frame.fill(0.0);
                    if let Some(tx) = cb_done.lock().unwrap().take() {
                        let _ = tx.send(Ok(()));
                    }
                }
            }
            position.store(pos, Ordering::Relaxed);
        },
        |err| log::error!("Audio output stream error: {}", err),
        None,
    );

    stream.map_err(|e| PlaybackError::SinkFailed(e.to_string()))
}
