//! Turn-taking state machine
//!
//! The single-writer core of the engine: every transition goes through
//! the pure `reduce()` function, which maps the current state and an
//! event to a new state plus a list of effects for the controller to
//! execute. Asynchronous completions carry the turn id they were
//! spawned for; events whose id no longer matches the active turn are
//! dropped, which eliminates the stale-callback race class.

use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::capture::CaptureError;
use crate::playback::PlaybackOutcome;
use crate::transport::TransportError;

use super::NoticeKind;

/// Public phase of the session, for UI rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceSessionState {
    Idle,
    Recording,
    Processing,
    AiThinking,
    AiSpeaking,
    Error,
}

/// Authoritative internal state. Exactly one value at any instant; all
/// transitions live in `reduce()`.
#[derive(Debug, Clone)]
pub enum TurnState {
    Idle,
    Recording {
        turn_id: Uuid,
        started_at: Instant,
    },
    Processing {
        turn_id: Uuid,
    },
    AiThinking {
        turn_id: Uuid,
    },
    AiSpeaking {
        turn_id: Uuid,
    },
    /// Recoverable: the next user action resets to Idle, never trapped
    Error {
        message: String,
    },
}

impl Default for TurnState {
    fn default() -> Self {
        TurnState::Idle
    }
}

impl TurnState {
    pub fn phase(&self) -> VoiceSessionState {
        match self {
            TurnState::Idle => VoiceSessionState::Idle,
            TurnState::Recording { .. } => VoiceSessionState::Recording,
            TurnState::Processing { .. } => VoiceSessionState::Processing,
            TurnState::AiThinking { .. } => VoiceSessionState::AiThinking,
            TurnState::AiSpeaking { .. } => VoiceSessionState::AiSpeaking,
            TurnState::Error { .. } => VoiceSessionState::Error,
        }
    }

    /// Id of the in-flight turn, if any.
    pub fn turn_id(&self) -> Option<Uuid> {
        match self {
            TurnState::Idle | TurnState::Error { .. } => None,
            TurnState::Recording { turn_id, .. }
            | TurnState::Processing { turn_id }
            | TurnState::AiThinking { turn_id }
            | TurnState::AiSpeaking { turn_id } => Some(*turn_id),
        }
    }

    /// True while a turn occupies the pipeline (guard against a second
    /// recording starting).
    pub fn is_turn_in_flight(&self) -> bool {
        self.turn_id().is_some()
    }
}

/// Events that can trigger state transitions.
#[derive(Debug, Clone)]
pub enum Event {
    // User actions
    StartTurn,
    StopTurn,
    CancelTurn,
    Cleanup,

    // Capture side
    CaptureStarted {
        id: Uuid,
    },
    CaptureFailed {
        id: Uuid,
        error: CaptureError,
    },
    /// The input pump drained after capture stopped
    InputFlushed {
        id: Uuid,
        bytes: usize,
    },
    /// One-second heartbeat while recording (max-duration guard)
    RecordingTick {
        id: Uuid,
    },

    // Transport side
    ConnectFailed {
        id: Uuid,
        error: TransportError,
    },
    TranscriptReady {
        id: Uuid,
        transcript: String,
    },
    ResponseTextDelta {
        id: Uuid,
        delta: String,
    },
    ResponseTextDone {
        id: Uuid,
        transcript: String,
    },
    ResponseAudioDelta {
        id: Uuid,
        audio: Vec<u8>,
    },
    ResponseAudioDone {
        id: Uuid,
    },
    ServerError {
        message: String,
    },
    ConnectionLost {
        message: String,
    },

    // Playback side
    PlaybackFinished {
        id: Uuid,
        outcome: PlaybackOutcome,
    },
}

/// Effects executed by the controller after a transition.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Ensure transport, open a fresh capture stream, start the pump
    BeginTurn { id: Uuid },
    /// Release the capture handle; the pump flushes and reports
    StopCapture { id: Uuid },
    /// Release the capture handle and discard the uncommitted input
    AbortCapture { id: Uuid },
    /// Commit the input buffer and request a response
    CommitInput { id: Uuid, bytes: usize },
    /// Discard the uncommitted input buffer (empty recording)
    DiscardInput { id: Uuid },
    AppendResponseText { id: Uuid, delta: String },
    SetResponseText { id: Uuid, text: String },
    AppendResponseAudio { id: Uuid, audio: Vec<u8> },
    /// Wrap the accumulated response audio and hand it to the player
    EnqueueResponse { id: Uuid },
    CancelPlayback,
    /// Completed-utterance callback (user or AI side)
    NotifyTranscript { text: String, is_user: bool },
    /// One-shot user-visible notice
    Notify { kind: NoticeKind, message: String },
    /// Stop capture, cancel playback, close the transport
    ReleaseAll,
}

/// Reducer limits that come from settings.
#[derive(Debug, Clone)]
pub struct TurnLimits {
    /// Recordings auto-stop at this duration
    pub max_recording: Duration,
}

impl Default for TurnLimits {
    fn default() -> Self {
        Self {
            max_recording: Duration::from_secs(120),
        }
    }
}

/// Map a capture failure to its recoverability class.
///
/// Contention and a refused permission return to Idle with a notice;
/// losing the device after a prior grant is an engine fault.
fn classify_capture_failure(error: &CaptureError) -> (bool, NoticeKind) {
    match error {
        CaptureError::PermissionDenied => (true, NoticeKind::PermissionDenied),
        CaptureError::DeviceBusy => (true, NoticeKind::DeviceBusy),
        CaptureError::DeviceUnavailable(_) => (false, NoticeKind::DeviceUnavailable),
        CaptureError::StreamFailed(_) => (false, NoticeKind::DeviceUnavailable),
    }
}

fn classify_transport_failure(error: &TransportError) -> NoticeKind {
    match error {
        TransportError::AuthFailed(_) => NoticeKind::AuthError,
        TransportError::Timeout => NoticeKind::Timeout,
        TransportError::NetworkFailed(_)
        | TransportError::ProtocolError(_)
        | TransportError::Disconnected(_) => NoticeKind::NetworkError,
    }
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Drop events with stale turn ids
/// - A turn ends only by reaching Idle or Error
pub fn reduce(state: &TurnState, event: Event, limits: &TurnLimits) -> (TurnState, Vec<Effect>) {
    use Effect::*;
    use Event::*;
    use TurnState::*;

    let current_id = state.turn_id();
    let is_stale = |eid: Uuid| Some(eid) != current_id;

    match (state, event) {
        // -----------------
        // Idle
        // -----------------
        (Idle, StartTurn) => {
            let id = Uuid::new_v4();
            (
                Recording {
                    turn_id: id,
                    started_at: Instant::now(),
                },
                vec![BeginTurn { id }],
            )
        }
        (Idle, StopTurn) | (Idle, CancelTurn) => (Idle, vec![]),

        // -----------------
        // Recording
        // -----------------
        (Recording { turn_id, .. }, CaptureStarted { id }) if *turn_id == id => {
            (state.clone(), vec![])
        }
        (Recording { turn_id, .. }, CaptureFailed { id, error }) if *turn_id == id => {
            let (recoverable, kind) = classify_capture_failure(&error);
            let message = error.to_string();
            if recoverable {
                (Idle, vec![Notify { kind, message }])
            } else {
                (
                    TurnState::Error {
                        message: message.clone(),
                    },
                    vec![ReleaseAll, Notify { kind, message }],
                )
            }
        }
        (Recording { turn_id, .. }, ConnectFailed { id, error }) if *turn_id == id => {
            let kind = classify_transport_failure(&error);
            let message = error.to_string();
            (
                TurnState::Error {
                    message: message.clone(),
                },
                vec![ReleaseAll, Notify { kind, message }],
            )
        }
        (Recording { turn_id, .. }, StopTurn) => (
            Processing { turn_id: *turn_id },
            vec![StopCapture { id: *turn_id }],
        ),
        // The sample stream ended on its own (device went away): treat
        // it as an implicit stop so the turn cannot strand
        (Recording { turn_id, .. }, InputFlushed { id, bytes }) if *turn_id == id => {
            if bytes == 0 {
                (
                    Idle,
                    vec![
                        StopCapture { id },
                        DiscardInput { id },
                        Notify {
                            kind: NoticeKind::TranscriptionEmpty,
                            message: "No speech detected".to_string(),
                        },
                    ],
                )
            } else {
                (
                    Processing { turn_id: *turn_id },
                    vec![StopCapture { id }, CommitInput { id, bytes }],
                )
            }
        }
        (Recording { turn_id, .. }, CancelTurn) => {
            (Idle, vec![AbortCapture { id: *turn_id }])
        }
        (
            Recording {
                turn_id,
                started_at,
            },
            RecordingTick { id },
        ) if *turn_id == id => {
            if started_at.elapsed() >= limits.max_recording {
                log::warn!(
                    "Turn {} auto-stopped after {:?} (max recording duration)",
                    turn_id,
                    started_at.elapsed()
                );
                (
                    Processing { turn_id: *turn_id },
                    vec![StopCapture { id: *turn_id }],
                )
            } else {
                (state.clone(), vec![])
            }
        }

        // -----------------
        // Processing
        // -----------------
        // Capture start raced with an early stop: release immediately,
        // the pump will flush whatever was captured
        (Processing { turn_id }, CaptureStarted { id }) if *turn_id == id => {
            (state.clone(), vec![StopCapture { id }])
        }
        (Processing { turn_id }, InputFlushed { id, bytes }) if *turn_id == id => {
            if bytes == 0 {
                (
                    Idle,
                    vec![
                        DiscardInput { id },
                        Notify {
                            kind: NoticeKind::TranscriptionEmpty,
                            message: "No speech detected".to_string(),
                        },
                    ],
                )
            } else {
                (state.clone(), vec![CommitInput { id, bytes }])
            }
        }
        (Processing { turn_id }, TranscriptReady { id, transcript }) if *turn_id == id => {
            if transcript.trim().is_empty() {
                (
                    Idle,
                    vec![Notify {
                        kind: NoticeKind::TranscriptionEmpty,
                        message: "No speech detected".to_string(),
                    }],
                )
            } else {
                (
                    AiThinking { turn_id: *turn_id },
                    vec![NotifyTranscript {
                        text: transcript,
                        is_user: true,
                    }],
                )
            }
        }
        // Response deltas can outrun the user transcript; buffer them
        (Processing { turn_id }, ResponseTextDelta { id, delta }) if *turn_id == id => {
            (state.clone(), vec![AppendResponseText { id, delta }])
        }
        (Processing { turn_id }, ResponseAudioDelta { id, audio }) if *turn_id == id => {
            (state.clone(), vec![AppendResponseAudio { id, audio }])
        }
        (Processing { turn_id }, ResponseAudioDone { id }) if *turn_id == id => (
            AiSpeaking { turn_id: *turn_id },
            vec![EnqueueResponse { id }],
        ),
        (Processing { turn_id }, CancelTurn) => {
            (Idle, vec![DiscardInput { id: *turn_id }])
        }

        // -----------------
        // AiThinking
        // -----------------
        (AiThinking { turn_id }, ResponseTextDelta { id, delta }) if *turn_id == id => {
            (state.clone(), vec![AppendResponseText { id, delta }])
        }
        (AiThinking { turn_id }, ResponseTextDone { id, transcript }) if *turn_id == id => (
            state.clone(),
            vec![
                SetResponseText {
                    id,
                    text: transcript.clone(),
                },
                NotifyTranscript {
                    text: transcript,
                    is_user: false,
                },
            ],
        ),
        (AiThinking { turn_id }, ResponseAudioDelta { id, audio }) if *turn_id == id => {
            (state.clone(), vec![AppendResponseAudio { id, audio }])
        }
        (AiThinking { turn_id }, ResponseAudioDone { id }) if *turn_id == id => (
            AiSpeaking { turn_id: *turn_id },
            vec![EnqueueResponse { id }],
        ),
        // Late deltas for the abandoned turn become stale and drop
        (AiThinking { .. }, CancelTurn) => (Idle, vec![]),

        // -----------------
        // AiSpeaking
        // -----------------
        // Late transcripts after audio completion still reach callers
        (AiSpeaking { turn_id }, TranscriptReady { id, transcript }) if *turn_id == id => (
            state.clone(),
            vec![NotifyTranscript {
                text: transcript,
                is_user: true,
            }],
        ),
        (AiSpeaking { turn_id }, ResponseTextDone { id, transcript }) if *turn_id == id => (
            state.clone(),
            vec![
                SetResponseText {
                    id,
                    text: transcript.clone(),
                },
                NotifyTranscript {
                    text: transcript,
                    is_user: false,
                },
            ],
        ),
        (AiSpeaking { turn_id }, PlaybackFinished { id, outcome }) if *turn_id == id => {
            let mut effects = vec![];
            if let PlaybackOutcome::Failed(e) = outcome {
                effects.push(Notify {
                    kind: NoticeKind::PlaybackFailed,
                    message: e.to_string(),
                });
            }
            // Cancelled is user-initiated; stays silent
            (Idle, effects)
        }
        (AiSpeaking { .. }, CancelTurn) => (Idle, vec![CancelPlayback]),

        // Transcript completion racing into AiThinking (arrived while
        // a response is already streaming)
        (AiThinking { turn_id }, TranscriptReady { id, transcript }) if *turn_id == id => (
            state.clone(),
            vec![NotifyTranscript {
                text: transcript,
                is_user: true,
            }],
        ),

        // -----------------
        // Transport faults (any active state)
        // -----------------
        (TurnState::Error { .. }, ConnectionLost { .. })
        | (TurnState::Error { .. }, ServerError { .. }) => {
            // Already surfaced once; stay put without a second notice
            (state.clone(), vec![])
        }
        (_, ConnectionLost { message }) => (
            TurnState::Error {
                message: message.clone(),
            },
            vec![
                ReleaseAll,
                Notify {
                    kind: NoticeKind::NetworkError,
                    message,
                },
            ],
        ),
        (_, ServerError { message }) => (
            TurnState::Error {
                message: message.clone(),
            },
            vec![
                ReleaseAll,
                Notify {
                    kind: NoticeKind::NetworkError,
                    message,
                },
            ],
        ),

        // -----------------
        // Error (recoverable)
        // -----------------
        (TurnState::Error { .. }, StartTurn) | (TurnState::Error { .. }, CancelTurn) => {
            // User action resets the guards; the next start records
            (Idle, vec![])
        }

        // -----------------
        // Cleanup (any state, idempotent)
        // -----------------
        (_, Cleanup) => (Idle, vec![ReleaseAll]),

        // -----------------
        // Stale or raced capture start: release the orphan handle
        // -----------------
        (_, CaptureStarted { id }) if is_stale(id) => {
            (state.clone(), vec![AbortCapture { id }])
        }

        // -----------------
        // Stale events (drop silently)
        // -----------------
        (_, CaptureFailed { id, .. }) if is_stale(id) => (state.clone(), vec![]),
        (_, ConnectFailed { id, .. }) if is_stale(id) => (state.clone(), vec![]),
        (_, InputFlushed { id, .. }) if is_stale(id) => (state.clone(), vec![]),
        (_, RecordingTick { id }) if is_stale(id) => (state.clone(), vec![]),
        (_, TranscriptReady { id, .. }) if is_stale(id) => (state.clone(), vec![]),
        (_, ResponseTextDelta { id, .. }) if is_stale(id) => (state.clone(), vec![]),
        (_, ResponseTextDone { id, .. }) if is_stale(id) => (state.clone(), vec![]),
        (_, ResponseAudioDelta { id, .. }) if is_stale(id) => (state.clone(), vec![]),
        (_, ResponseAudioDone { id }) if is_stale(id) => (state.clone(), vec![]),
        (_, PlaybackFinished { id, .. }) if is_stale(id) => (state.clone(), vec![]),

        // -----------------
        // Unhandled: no transition
        // -----------------
        _ => (state.clone(), vec![]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::PlaybackError;

    fn limits() -> TurnLimits {
        TurnLimits::default()
    }

    fn recording(id: Uuid) -> TurnState {
        TurnState::Recording {
            turn_id: id,
            started_at: Instant::now(),
        }
    }

    #[test]
    fn idle_start_transitions_to_recording() {
        let (next, effects) = reduce(&TurnState::Idle, Event::StartTurn, &limits());
        assert_eq!(next.phase(), VoiceSessionState::Recording);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::BeginTurn { .. })));
    }

    #[test]
    fn start_while_turn_in_flight_is_rejected_not_queued() {
        let id = Uuid::new_v4();
        for state in [
            recording(id),
            TurnState::Processing { turn_id: id },
            TurnState::AiThinking { turn_id: id },
            TurnState::AiSpeaking { turn_id: id },
        ] {
            let (next, effects) = reduce(&state, Event::StartTurn, &limits());
            assert_eq!(next.phase(), state.phase());
            assert!(effects.is_empty(), "rejected start must have no effects");
        }
    }

    #[test]
    fn recording_stop_transitions_to_processing() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(&recording(id), Event::StopTurn, &limits());
        assert!(matches!(next, TurnState::Processing { turn_id } if turn_id == id));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::StopCapture { id: eid } if *eid == id)));
    }

    #[test]
    fn recording_cancel_aborts_without_commit() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(&recording(id), Event::CancelTurn, &limits());
        assert!(matches!(next, TurnState::Idle));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::AbortCapture { .. })));
        assert!(!effects
            .iter()
            .any(|e| matches!(e, Effect::CommitInput { .. })));
    }

    #[test]
    fn empty_flush_returns_to_idle_with_notice() {
        let id = Uuid::new_v4();
        let state = TurnState::Processing { turn_id: id };
        let (next, effects) = reduce(&state, Event::InputFlushed { id, bytes: 0 }, &limits());

        assert!(matches!(next, TurnState::Idle));
        assert!(effects.iter().any(
            |e| matches!(e, Effect::Notify { kind: NoticeKind::TranscriptionEmpty, .. })
        ));
        assert!(!effects
            .iter()
            .any(|e| matches!(e, Effect::CommitInput { .. })));
    }

    #[test]
    fn non_empty_flush_commits() {
        let id = Uuid::new_v4();
        let state = TurnState::Processing { turn_id: id };
        let (next, effects) = reduce(&state, Event::InputFlushed { id, bytes: 4800 }, &limits());

        assert_eq!(next.phase(), VoiceSessionState::Processing);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::CommitInput { bytes: 4800, .. })));
    }

    #[test]
    fn empty_transcript_returns_to_idle_with_notice() {
        let id = Uuid::new_v4();
        let state = TurnState::Processing { turn_id: id };
        let (next, effects) = reduce(
            &state,
            Event::TranscriptReady {
                id,
                transcript: "   ".to_string(),
            },
            &limits(),
        );

        assert!(matches!(next, TurnState::Idle));
        assert!(effects.iter().any(
            |e| matches!(e, Effect::Notify { kind: NoticeKind::TranscriptionEmpty, .. })
        ));
    }

    #[test]
    fn transcript_advances_to_thinking_and_notifies_user_side() {
        let id = Uuid::new_v4();
        let state = TurnState::Processing { turn_id: id };
        let (next, effects) = reduce(
            &state,
            Event::TranscriptReady {
                id,
                transcript: "hello".to_string(),
            },
            &limits(),
        );

        assert!(matches!(next, TurnState::AiThinking { turn_id } if turn_id == id));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::NotifyTranscript { is_user: true, .. })));
    }

    #[test]
    fn audio_done_enqueues_and_enters_speaking() {
        let id = Uuid::new_v4();
        let state = TurnState::AiThinking { turn_id: id };
        let (next, effects) = reduce(&state, Event::ResponseAudioDone { id }, &limits());

        assert!(matches!(next, TurnState::AiSpeaking { turn_id } if turn_id == id));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::EnqueueResponse { .. })));
    }

    #[test]
    fn response_text_done_notifies_ai_side() {
        let id = Uuid::new_v4();
        let state = TurnState::AiThinking { turn_id: id };
        let (next, effects) = reduce(
            &state,
            Event::ResponseTextDone {
                id,
                transcript: "Hi there!".to_string(),
            },
            &limits(),
        );

        assert_eq!(next.phase(), VoiceSessionState::AiThinking);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::NotifyTranscript { is_user: false, .. })));
    }

    #[test]
    fn playback_drain_returns_to_idle_silently() {
        let id = Uuid::new_v4();
        let state = TurnState::AiSpeaking { turn_id: id };
        let (next, effects) = reduce(
            &state,
            Event::PlaybackFinished {
                id,
                outcome: PlaybackOutcome::Completed,
            },
            &limits(),
        );

        assert!(matches!(next, TurnState::Idle));
        assert!(effects.is_empty());
    }

    #[test]
    fn cancelled_playback_is_silent() {
        let id = Uuid::new_v4();
        let state = TurnState::AiSpeaking { turn_id: id };
        let (next, effects) = reduce(
            &state,
            Event::PlaybackFinished {
                id,
                outcome: PlaybackOutcome::Cancelled,
            },
            &limits(),
        );

        assert!(matches!(next, TurnState::Idle));
        assert!(
            !effects.iter().any(|e| matches!(e, Effect::Notify { .. })),
            "user-initiated interruption must not surface a notice"
        );
    }

    #[test]
    fn failed_playback_surfaces_one_notice() {
        let id = Uuid::new_v4();
        let state = TurnState::AiSpeaking { turn_id: id };
        let (next, effects) = reduce(
            &state,
            Event::PlaybackFinished {
                id,
                outcome: PlaybackOutcome::Failed(PlaybackError::SinkFailed("dead".into())),
            },
            &limits(),
        );

        assert!(matches!(next, TurnState::Idle));
        let notices = effects
            .iter()
            .filter(|e| matches!(e, Effect::Notify { kind: NoticeKind::PlaybackFailed, .. }))
            .count();
        assert_eq!(notices, 1);
    }

    #[test]
    fn cancel_while_speaking_cancels_playback() {
        let id = Uuid::new_v4();
        let state = TurnState::AiSpeaking { turn_id: id };
        let (next, effects) = reduce(&state, Event::CancelTurn, &limits());

        assert!(matches!(next, TurnState::Idle));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::CancelPlayback)));
        assert!(!effects.iter().any(|e| matches!(e, Effect::Notify { .. })));
    }

    #[test]
    fn device_busy_is_recoverable() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(
            &recording(id),
            Event::CaptureFailed {
                id,
                error: CaptureError::DeviceBusy,
            },
            &limits(),
        );

        assert!(matches!(next, TurnState::Idle));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Notify { kind: NoticeKind::DeviceBusy, .. })));
        assert!(!effects.iter().any(|e| matches!(e, Effect::ReleaseAll)));
    }

    #[test]
    fn stream_failure_enters_error_and_releases() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(
            &recording(id),
            Event::CaptureFailed {
                id,
                error: CaptureError::StreamFailed("gone".into()),
            },
            &limits(),
        );

        assert_eq!(next.phase(), VoiceSessionState::Error);
        assert!(effects.iter().any(|e| matches!(e, Effect::ReleaseAll)));
    }

    #[test]
    fn connect_timeout_enters_error() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(
            &recording(id),
            Event::ConnectFailed {
                id,
                error: TransportError::Timeout,
            },
            &limits(),
        );

        assert_eq!(next.phase(), VoiceSessionState::Error);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Notify { kind: NoticeKind::Timeout, .. })));
    }

    #[test]
    fn connection_lost_mid_turn_enters_error_once() {
        let id = Uuid::new_v4();
        let state = TurnState::AiThinking { turn_id: id };
        let (next, effects) = reduce(
            &state,
            Event::ConnectionLost {
                message: "reset".to_string(),
            },
            &limits(),
        );
        assert_eq!(next.phase(), VoiceSessionState::Error);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Notify { kind: NoticeKind::NetworkError, .. })));

        // A second loss report while already in Error stays silent
        let (next2, effects2) = reduce(
            &next,
            Event::ConnectionLost {
                message: "reset again".to_string(),
            },
            &limits(),
        );
        assert_eq!(next2.phase(), VoiceSessionState::Error);
        assert!(effects2.is_empty());
    }

    #[test]
    fn error_resets_to_idle_on_user_action() {
        let state = TurnState::Error {
            message: "boom".to_string(),
        };
        let (next, effects) = reduce(&state, Event::StartTurn, &limits());
        assert!(matches!(next, TurnState::Idle));
        assert!(effects.is_empty());
    }

    #[test]
    fn cleanup_from_any_state_releases_everything() {
        let id = Uuid::new_v4();
        let states = [
            TurnState::Idle,
            recording(id),
            TurnState::Processing { turn_id: id },
            TurnState::AiThinking { turn_id: id },
            TurnState::AiSpeaking { turn_id: id },
            TurnState::Error {
                message: "x".to_string(),
            },
        ];

        for state in states {
            let (next, effects) = reduce(&state, Event::Cleanup, &limits());
            assert!(matches!(next, TurnState::Idle));
            assert!(effects.iter().any(|e| matches!(e, Effect::ReleaseAll)));
        }
    }

    #[test]
    fn stale_events_are_dropped() {
        let id = Uuid::new_v4();
        let stale = Uuid::new_v4();
        let state = TurnState::Processing { turn_id: id };

        let stale_events = [
            Event::InputFlushed {
                id: stale,
                bytes: 100,
            },
            Event::TranscriptReady {
                id: stale,
                transcript: "old".to_string(),
            },
            Event::ResponseAudioDone { id: stale },
            Event::PlaybackFinished {
                id: stale,
                outcome: PlaybackOutcome::Completed,
            },
            Event::CaptureFailed {
                id: stale,
                error: CaptureError::DeviceBusy,
            },
        ];

        for event in stale_events {
            let (next, effects) = reduce(&state, event, &limits());
            assert_eq!(next.phase(), VoiceSessionState::Processing);
            assert!(effects.is_empty());
        }
    }

    #[test]
    fn stale_capture_start_releases_orphan_handle() {
        let orphan = Uuid::new_v4();
        let (next, effects) = reduce(
            &TurnState::Idle,
            Event::CaptureStarted { id: orphan },
            &limits(),
        );
        assert!(matches!(next, TurnState::Idle));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::AbortCapture { id } if *id == orphan)));
    }

    #[test]
    fn capture_start_after_early_stop_stops_immediately() {
        let id = Uuid::new_v4();
        let state = TurnState::Processing { turn_id: id };
        let (next, effects) = reduce(&state, Event::CaptureStarted { id }, &limits());

        assert_eq!(next.phase(), VoiceSessionState::Processing);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::StopCapture { .. })));
    }

    #[test]
    fn tick_past_max_duration_auto_stops() {
        let id = Uuid::new_v4();
        let state = TurnState::Recording {
            turn_id: id,
            started_at: Instant::now() - Duration::from_secs(121),
        };
        let (next, effects) = reduce(&state, Event::RecordingTick { id }, &limits());

        assert_eq!(next.phase(), VoiceSessionState::Processing);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::StopCapture { .. })));
    }

    #[test]
    fn spontaneous_stream_end_mid_recording_commits_instead_of_stranding() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(
            &recording(id),
            Event::InputFlushed { id, bytes: 9600 },
            &limits(),
        );

        assert_eq!(next.phase(), VoiceSessionState::Processing);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::StopCapture { .. })));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::CommitInput { bytes: 9600, .. })));
    }

    #[test]
    fn tick_under_max_duration_is_a_no_op() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(&recording(id), Event::RecordingTick { id }, &limits());
        assert_eq!(next.phase(), VoiceSessionState::Recording);
        assert!(effects.is_empty());
    }

    #[test]
    fn deltas_buffered_while_processing() {
        let id = Uuid::new_v4();
        let state = TurnState::Processing { turn_id: id };

        let (_, effects) = reduce(
            &state,
            Event::ResponseAudioDelta {
                id,
                audio: vec![1, 2, 3],
            },
            &limits(),
        );
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::AppendResponseAudio { .. })));
    }
}
