//! Conversation control plane
//!
//! Sequences capture → transport → playback under the turn-taking
//! state machine, and enforces the concurrency contracts: at most one
//! in-flight turn, at most one playing response, debounced starts, and
//! guaranteed resource release on every exit path.

pub mod controller;
pub mod state_machine;
pub mod turn;

pub use controller::VoiceConversationController;
pub use state_machine::{TurnState, VoiceSessionState};
pub use turn::ConversationTurn;

/// Classification of a user-visible notice.
///
/// Cancellation never appears here: user-initiated interruption is
/// reported through playback outcomes, not as a notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    /// Microphone access refused; terminal until the user grants it
    PermissionDenied,
    DeviceUnavailable,
    DeviceBusy,
    AuthError,
    NetworkError,
    Timeout,
    /// No speech detected in the recording; recoverable
    TranscriptionEmpty,
    /// A single response clip failed; the session continues
    PlaybackFailed,
}

/// What the engine reports to its consumer (UI layer, session timer,
/// transcript storage). Delivered in order on the notification channel.
#[derive(Debug, Clone)]
pub enum EngineNotification {
    /// The session phase changed
    StateChanged(VoiceSessionState),
    /// One completed utterance, user (`is_user`) or AI side
    Transcript { text: String, is_user: bool },
    /// Exactly one per terminal failure; never fired for cancellation
    Notice { kind: NoticeKind, message: String },
    /// Normalized microphone level while recording
    InputLevel(f32),
}
