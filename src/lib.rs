//! voiceloop: real-time voice conversation engine
//!
//! Captures the user's speech, streams it over a duplex channel to a
//! remote conversational AI endpoint, and plays the synthesized
//! response back, under strict turn-taking: one voice speaks at a time,
//! one turn in flight, cancellation always wins over in-flight work.
//!
//! # Layers
//!
//! - [`codec`]: pure transforms between float PCM, wire PCM16/base64,
//!   and WAV containers
//! - [`capture`]: microphone acquisition behind a device seam
//! - [`playback`]: strict-FIFO playback queue over an output seam
//! - [`transport`]: the duplex WebSocket to the conversation endpoint
//! - [`engine`]: the turn state machine and controller tying it all
//!   together
//!
//! The platform adapters (`cpal`, `tokio-tungstenite`) are one
//! implementation each of the seams; the engine itself never touches
//! hardware or sockets, so it runs unchanged against test doubles.

pub mod capture;
pub mod codec;
pub mod engine;
pub mod playback;
pub mod settings;
pub mod transport;

pub use capture::{AudioCaptureDevice, CaptureConfig, CpalCaptureDevice};
pub use engine::{
    EngineNotification, NoticeKind, VoiceConversationController, VoiceSessionState,
};
pub use playback::{CpalPlaybackSink, PlaybackSink, StreamingAudioPlayer};
pub use settings::EngineSettings;
pub use transport::{Credentials, DuplexConversationTransport, RealtimeTransport};
