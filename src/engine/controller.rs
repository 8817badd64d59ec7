//! Controller: event loop and effect runner
//!
//! Owns the device, transport, and player, and drives the reducer in
//! `state_machine`. All shared state lives on one logical task; the
//! asynchronous edges (hardware callbacks, network receipt, playback
//! completion) only send events into the loop, so ordering discipline
//! replaces locking.
//!
//! # Architecture
//!
//! ```text
//! UI actions ─────────┐
//! capture tasks ──────┼──events──▶ reduce() ──effects──▶ device /
//! transport receiver ─┤                                  transport /
//! player updates ─────┘                                  player
//!                                      │
//!                                      └──▶ EngineNotification channel
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::interval;
use uuid::Uuid;

use crate::capture::{
    AccessStatus, AudioCaptureDevice, CaptureError, CaptureHandle,
};
use crate::codec::{self, AudioChunk};
use crate::playback::{
    PlaybackError, PlaybackItem, PlaybackOutcome, PlaybackSink, PlaybackUpdate,
    StreamingAudioPlayer,
};
use crate::settings::EngineSettings;
use crate::transport::{
    ClientFrame, Credentials, DuplexConversationTransport, ServerEvent, TransportEvent,
};

use super::state_machine::{reduce, Effect, Event, TurnLimits, TurnState, VoiceSessionState};
use super::turn::ConversationTurn;
use super::EngineNotification;

const EVENT_CHANNEL_DEPTH: usize = 256;
const NOTIFY_CHANNEL_DEPTH: usize = 256;
const TRANSPORT_EVENT_DEPTH: usize = 256;

/// Response audio arrives as 24kHz mono PCM16 per the session config
const RESPONSE_SAMPLE_RATE: u32 = 24_000;
const RESPONSE_CHANNELS: u16 = 1;

/// Public API of the voice engine.
///
/// One controller owns one microphone and one duplex connection at a
/// time. Methods enqueue events; the worker task applies them in order.
pub struct VoiceConversationController {
    events_tx: mpsc::Sender<Event>,
}

impl VoiceConversationController {
    /// Spawn the engine worker over the given seams.
    ///
    /// Returns the controller handle and the notification stream
    /// consumed by the UI layer and collaborators.
    pub fn spawn(
        device: Arc<dyn AudioCaptureDevice>,
        transport: Arc<dyn DuplexConversationTransport>,
        sink: Arc<dyn PlaybackSink>,
        settings: EngineSettings,
        credentials: Credentials,
    ) -> (Self, mpsc::Receiver<EngineNotification>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        let (notify_tx, notify_rx) = mpsc::channel(NOTIFY_CHANNEL_DEPTH);
        let (transport_tx, transport_rx) = mpsc::channel(TRANSPORT_EVENT_DEPTH);
        let (player, player_rx) = StreamingAudioPlayer::new(sink);

        let worker = EngineWorker {
            state: TurnState::default(),
            limits: TurnLimits {
                max_recording: settings.max_recording(),
            },
            settings,
            credentials,
            device,
            transport,
            player,
            captures: Arc::new(Mutex::new(HashMap::new())),
            current_turn: None,
            last_capture_start: None,
            events_tx: events_tx.clone(),
            transport_tx,
            notify_tx,
        };

        tokio::spawn(worker.run(events_rx, transport_rx, player_rx));

        (Self { events_tx }, notify_rx)
    }

    /// Begin a new turn: acquire the microphone and record.
    pub async fn start_turn(&self) {
        self.dispatch(Event::StartTurn).await;
    }

    /// End the user utterance and submit it for a response.
    pub async fn stop_turn(&self) {
        self.dispatch(Event::StopTurn).await;
    }

    /// Abandon the current turn; never surfaced as an error.
    pub async fn cancel_turn(&self) {
        self.dispatch(Event::CancelTurn).await;
    }

    /// Full teardown: stop capture, cancel playback, close the
    /// transport, reset to idle. Safe from any state, any number of
    /// times.
    pub async fn cleanup(&self) {
        self.dispatch(Event::Cleanup).await;
    }

    async fn dispatch(&self, event: Event) {
        if self.events_tx.send(event).await.is_err() {
            log::warn!("Engine worker gone, dropping user action");
        }
    }
}

/// An open capture session and its service tasks.
struct ActiveCapture {
    handle: CaptureHandle,
    pump: tokio::task::JoinHandle<()>,
    ticker: tokio::task::JoinHandle<()>,
    level_task: tokio::task::JoinHandle<()>,
}

struct EngineWorker {
    state: TurnState,
    limits: TurnLimits,
    settings: EngineSettings,
    credentials: Credentials,
    device: Arc<dyn AudioCaptureDevice>,
    transport: Arc<dyn DuplexConversationTransport>,
    player: StreamingAudioPlayer,
    /// Capture handles keyed by turn id; effect tasks insert, stop
    /// effects remove
    captures: Arc<Mutex<HashMap<Uuid, ActiveCapture>>>,
    current_turn: Option<ConversationTurn>,
    /// Debounce timestamp for user-initiated starts
    last_capture_start: Option<Instant>,
    events_tx: mpsc::Sender<Event>,
    transport_tx: mpsc::Sender<TransportEvent>,
    notify_tx: mpsc::Sender<EngineNotification>,
}

impl EngineWorker {
    async fn run(
        mut self,
        mut events_rx: mpsc::Receiver<Event>,
        mut transport_rx: mpsc::Receiver<TransportEvent>,
        mut player_rx: mpsc::Receiver<PlaybackUpdate>,
    ) {
        log::info!("Engine worker started");

        loop {
            tokio::select! {
                maybe_event = events_rx.recv() => match maybe_event {
                    Some(event) => self.dispatch(event).await,
                    None => break, // controller dropped
                },
                Some(transport_event) = transport_rx.recv() => {
                    if let Some(event) = self.translate_transport_event(transport_event) {
                        self.dispatch(event).await;
                    }
                }
                Some(update) = player_rx.recv() => {
                    self.dispatch(Event::PlaybackFinished {
                        id: update.item_id,
                        outcome: update.outcome,
                    })
                    .await;
                }
            }
        }

        // The engine is going away: release every resource
        self.release_all().await;
        self.player.shutdown().await;
        log::info!("Engine worker ended");
    }

    async fn dispatch(&mut self, event: Event) {
        // Debounce user-initiated starts: requests inside the window
        // are silently dropped, not errored
        if matches!(event, Event::StartTurn)
            && self.state.phase() == VoiceSessionState::Idle
        {
            if let Some(last) = self.last_capture_start {
                if last.elapsed() < self.settings.debounce() {
                    log::debug!("Start within debounce window, dropping");
                    return;
                }
            }
        }

        let (next, effects) = reduce(&self.state, event, &self.limits);

        let old_phase = self.state.phase();
        let new_phase = next.phase();
        if old_phase != new_phase {
            log::info!("State transition: {:?} -> {:?}", old_phase, new_phase);
        }
        self.state = next;

        if old_phase != new_phase {
            self.notify(EngineNotification::StateChanged(new_phase)).await;
        }

        for effect in effects {
            self.run_effect(effect).await;
        }

        // Close the turn record on any path that ended the turn
        if self.state.turn_id() != self.current_turn.as_ref().map(|t| t.id) {
            if let Some(mut turn) = self.current_turn.take() {
                turn.close();
                log::debug!(
                    "Turn {} closed ({} bytes captured)",
                    turn.id,
                    turn.captured_audio_bytes
                );
            }
        }
    }

    async fn run_effect(&mut self, effect: Effect) {
        match effect {
            Effect::BeginTurn { id } => self.begin_turn(id).await,
            Effect::StopCapture { id } => self.stop_capture(id, false).await,
            Effect::AbortCapture { id } => self.stop_capture(id, true).await,
            Effect::CommitInput { id, bytes } => {
                if let Some(turn) = self.current_turn.as_mut().filter(|t| t.id == id) {
                    turn.captured_audio_bytes = bytes;
                }
                log::info!("Committing {} input bytes for turn {}", bytes, id);
                self.transport.send(ClientFrame::AudioCommit).await;
                self.transport.send(ClientFrame::ResponseCreate).await;
            }
            Effect::DiscardInput { id } => {
                log::debug!("Discarding input buffer for turn {}", id);
                self.transport.send(ClientFrame::AudioClear).await;
            }
            Effect::AppendResponseText { id, delta } => {
                if let Some(turn) = self.current_turn.as_mut().filter(|t| t.id == id) {
                    turn.append_response_text(&delta);
                }
            }
            Effect::SetResponseText { id, text } => {
                if let Some(turn) = self.current_turn.as_mut().filter(|t| t.id == id) {
                    turn.finish_response_text(&text);
                }
            }
            Effect::AppendResponseAudio { id, audio } => {
                if let Some(turn) = self.current_turn.as_mut().filter(|t| t.id == id) {
                    turn.append_response_audio(&audio);
                }
            }
            Effect::EnqueueResponse { id } => self.enqueue_response(id).await,
            Effect::CancelPlayback => self.player.cancel_all().await,
            Effect::NotifyTranscript { text, is_user } => {
                if is_user {
                    if let Some(turn) = self.current_turn.as_mut() {
                        turn.user_transcript = Some(text.clone());
                    }
                }
                self.notify(EngineNotification::Transcript { text, is_user })
                    .await;
            }
            Effect::Notify { kind, message } => {
                log::warn!("Notice ({:?}): {}", kind, message);
                self.notify(EngineNotification::Notice { kind, message })
                    .await;
            }
            Effect::ReleaseAll => self.release_all().await,
        }
    }

    /// Ensure transport, open a fresh capture stream, and wire up the
    /// pump. Runs as a task so a slow handshake never blocks the loop;
    /// outcomes come back as events carrying the turn id.
    async fn begin_turn(&mut self, id: Uuid) {
        self.last_capture_start = Some(Instant::now());
        self.current_turn = Some(ConversationTurn::new(id));

        let device = self.device.clone();
        let transport = self.transport.clone();
        let credentials = self.credentials.clone();
        let capture_config = self.settings.capture_config();
        let target_rate = self.settings.capture_sample_rate;
        let chunk_ms = self.settings.chunk_ms;
        let captures = self.captures.clone();
        let events = self.events_tx.clone();
        let transport_events = self.transport_tx.clone();
        let notify = self.notify_tx.clone();

        tokio::spawn(async move {
            // Permission probe first; the device caches a prior grant
            match device.request_access().await {
                Ok(AccessStatus::Granted) => {}
                Ok(AccessStatus::Denied) => {
                    let _ = events
                        .send(Event::CaptureFailed {
                            id,
                            error: CaptureError::PermissionDenied,
                        })
                        .await;
                    return;
                }
                Err(error) => {
                    let _ = events.send(Event::CaptureFailed { id, error }).await;
                    return;
                }
            }

            // Lazily establish the duplex session
            if !transport.is_open() {
                if let Err(error) = transport.connect(&credentials, transport_events).await {
                    let _ = events.send(Event::ConnectFailed { id, error }).await;
                    return;
                }
            }

            // Every turn starts from a clean remote input buffer
            transport.send(ClientFrame::AudioClear).await;

            let (handle, stream) = match device.start_capture(&capture_config).await {
                Ok(pair) => pair,
                Err(error) => {
                    let _ = events.send(Event::CaptureFailed { id, error }).await;
                    return;
                }
            };

            let pump = tokio::spawn(run_input_pump(
                id,
                stream.samples,
                stream.sample_rate,
                target_rate,
                chunk_ms,
                transport.clone(),
                events.clone(),
            ));
            let ticker = tokio::spawn(run_recording_ticker(id, events.clone()));
            let level_task = tokio::spawn(forward_levels(stream.level, notify));

            captures.lock().await.insert(
                id,
                ActiveCapture {
                    handle,
                    pump,
                    ticker,
                    level_task,
                },
            );

            let _ = events.send(Event::CaptureStarted { id }).await;
        });
    }

    /// Release the capture handle for a turn. On a normal stop the pump
    /// stays alive to flush the tail and report; an abort kills it and
    /// discards the remote buffer.
    async fn stop_capture(&mut self, id: Uuid, abort: bool) {
        let entry = self.captures.lock().await.remove(&id);
        match entry {
            Some(mut active) => {
                active.handle.stop();
                active.ticker.abort();
                active.level_task.abort();
                if abort {
                    active.pump.abort();
                }
            }
            None => log::debug!("No active capture for turn {}", id),
        }

        if abort {
            self.transport.send(ClientFrame::AudioClear).await;
        }
    }

    async fn enqueue_response(&mut self, id: Uuid) {
        let Some(turn) = self.current_turn.as_mut().filter(|t| t.id == id) else {
            log::warn!("No turn record for response {}", id);
            return;
        };

        let pcm = turn.take_response_audio();
        match codec::synthesize_wav(&pcm, RESPONSE_SAMPLE_RATE, RESPONSE_CHANNELS) {
            Ok(container) => {
                // Never two voices at once: stop anything still playing
                // before this response starts
                self.player.cancel_all().await;
                self.player.enqueue(PlaybackItem::new(id, container)).await;
            }
            Err(e) => {
                log::warn!("Could not build response container for {}: {}", id, e);
                let _ = self
                    .events_tx
                    .send(Event::PlaybackFinished {
                        id,
                        outcome: PlaybackOutcome::Failed(PlaybackError::BadClip(e.to_string())),
                    })
                    .await;
            }
        }
    }

    /// Stop every capture, cancel playback, close the transport, and
    /// reset the guards. Idempotent.
    async fn release_all(&mut self) {
        let entries: Vec<(Uuid, ActiveCapture)> =
            self.captures.lock().await.drain().collect();
        for (id, mut active) in entries {
            log::debug!("Releasing capture for turn {}", id);
            active.handle.stop();
            active.pump.abort();
            active.ticker.abort();
            active.level_task.abort();
        }

        self.player.cancel_all().await;
        self.transport.disconnect().await;
        self.last_capture_start = None;
    }

    fn translate_transport_event(&self, event: TransportEvent) -> Option<Event> {
        match event {
            TransportEvent::ConnectionLost(message) => Some(Event::ConnectionLost { message }),
            TransportEvent::Server(server_event) => self.translate_server_event(server_event),
        }
    }

    /// Tag a server event with the active turn. Events arriving with no
    /// turn in flight are stale and dropped here.
    fn translate_server_event(&self, event: ServerEvent) -> Option<Event> {
        let turn_id = self.state.turn_id();
        let require_turn = |name: &str| {
            if turn_id.is_none() {
                log::debug!("Dropping {} with no turn in flight", name);
            }
            turn_id
        };

        match event {
            ServerEvent::Error { error } => {
                log::warn!("Endpoint error: {} ({:?})", error.message, error.code);
                Some(Event::ServerError {
                    message: error.message,
                })
            }
            ServerEvent::TranscriptCompleted { transcript } => {
                let id = require_turn("transcript")?;
                Some(Event::TranscriptReady { id, transcript })
            }
            ServerEvent::ResponseAudioDelta { delta } => {
                let id = require_turn("audio delta")?;
                match codec::decode_frame(&delta) {
                    Ok(audio) => Some(Event::ResponseAudioDelta { id, audio }),
                    Err(e) => {
                        log::warn!("Undecodable audio delta: {}", e);
                        None
                    }
                }
            }
            ServerEvent::ResponseAudioDone => {
                let id = require_turn("audio done")?;
                Some(Event::ResponseAudioDone { id })
            }
            ServerEvent::ResponseTextDelta { delta } => {
                let id = require_turn("text delta")?;
                Some(Event::ResponseTextDelta { id, delta })
            }
            ServerEvent::ResponseTextDone { transcript } => {
                let id = require_turn("text done")?;
                Some(Event::ResponseTextDone { id, transcript })
            }
            ServerEvent::SpeechStarted { audio_start_ms } => {
                log::debug!("Server speech start at {:?} ms", audio_start_ms);
                None
            }
            ServerEvent::SpeechStopped { audio_end_ms } => {
                log::debug!("Server speech stop at {:?} ms", audio_end_ms);
                None
            }
            ServerEvent::SessionCreated { .. }
            | ServerEvent::SessionUpdated { .. }
            | ServerEvent::AudioCommitted { .. }
            | ServerEvent::AudioCleared
            | ServerEvent::Unknown => None,
        }
    }

    async fn notify(&self, notification: EngineNotification) {
        if self.notify_tx.send(notification).await.is_err() {
            log::debug!("Notification consumer gone");
        }
    }
}

/// Bridge from the capture stream to the transport: downsample, chunk,
/// encode, frame, send. When the stream closes, flush the tail and
/// report the total byte count.
async fn run_input_pump(
    id: Uuid,
    mut samples: mpsc::Receiver<Vec<f32>>,
    device_rate: u32,
    target_rate: u32,
    chunk_ms: u32,
    transport: Arc<dyn DuplexConversationTransport>,
    events: mpsc::Sender<Event>,
) {
    let samples_per_chunk = (target_rate * chunk_ms / 1000).max(1) as usize;
    let mut buffer: Vec<f32> = Vec::with_capacity(samples_per_chunk * 2);
    let mut bytes_sent = 0usize;
    let mut chunks_sent = 0u64;

    while let Some(batch) = samples.recv().await {
        buffer.extend(downsample(&batch, device_rate, target_rate));

        while buffer.len() >= samples_per_chunk {
            let chunk: Vec<f32> = buffer.drain(..samples_per_chunk).collect();
            bytes_sent += send_audio_chunk(&chunk, target_rate, &transport).await;
            chunks_sent += 1;

            if chunks_sent % 50 == 0 {
                log::debug!("Input pump: {} chunks sent", chunks_sent);
            }
        }
    }

    // Capture stopped: flush the partial tail
    if !buffer.is_empty() {
        bytes_sent += send_audio_chunk(&buffer, target_rate, &transport).await;
    }

    log::debug!("Input pump for turn {} drained ({} bytes)", id, bytes_sent);
    let _ = events.send(Event::InputFlushed { id, bytes: bytes_sent }).await;
}

async fn send_audio_chunk(
    samples: &[f32],
    sample_rate: u32,
    transport: &Arc<dyn DuplexConversationTransport>,
) -> usize {
    let chunk = AudioChunk::pcm16(codec::encode_pcm16(samples), sample_rate, 1);
    let len = chunk.len();
    transport
        .send(ClientFrame::audio_append(codec::frame_for_transport(
            &chunk.data,
        )))
        .await;
    len
}

/// Downsample by integer-ratio averaging (e.g. 48kHz device rate to
/// the 24kHz wire rate). Non-integer ratios pass through unchanged.
fn downsample(samples: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == 0 || target_rate == 0 {
        log::warn!(
            "Invalid sample rate (source: {}, target: {}), passing through",
            source_rate,
            target_rate
        );
        return samples.to_vec();
    }
    if source_rate == target_rate {
        return samples.to_vec();
    }
    if source_rate % target_rate != 0 {
        log::warn!(
            "Unsupported resample ratio {}:{}, passing through",
            source_rate,
            target_rate
        );
        return samples.to_vec();
    }

    let ratio = (source_rate / target_rate) as usize;
    samples
        .chunks(ratio)
        .map(|chunk| chunk.iter().sum::<f32>() / chunk.len() as f32)
        .collect()
}

/// One-second heartbeat while recording; the reducer drops stale ticks.
async fn run_recording_ticker(id: Uuid, events: mpsc::Sender<Event>) {
    let mut tick = interval(Duration::from_secs(1));
    tick.tick().await; // the first tick completes immediately

    loop {
        tick.tick().await;
        if events.send(Event::RecordingTick { id }).await.is_err() {
            break;
        }
    }
}

/// Forward level-meter updates to the notification stream. Best-effort:
/// meter frames are dropped when the consumer lags.
async fn forward_levels(
    mut level: watch::Receiver<f32>,
    notify: mpsc::Sender<EngineNotification>,
) {
    while level.changed().await.is_ok() {
        let value = *level.borrow();
        let _ = notify.try_send(EngineNotification::InputLevel(value));
    }
}
