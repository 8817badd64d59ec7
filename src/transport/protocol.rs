//! Wire protocol for the realtime conversation endpoint
//!
//! JSON frame types exchanged over the duplex WebSocket.
//!
//! # Protocol Overview
//!
//! 1. Connect to the realtime endpoint, receive `session.created`
//! 2. Send `session.update` to configure modalities and formats
//! 3. Stream microphone audio via `input_audio_buffer.append`
//! 4. Commit the buffer and request a response
//! 5. Receive the user transcript, then response text and audio deltas
//!
//! Unknown incoming frame types deserialize to [`ServerEvent::Unknown`]
//! so a protocol addition on the remote side is never fatal here.

use serde::{Deserialize, Serialize};

/// Default realtime endpoint
pub const REALTIME_API_URL: &str =
    "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview-2024-12-17";

/// Session configuration sent in the `session.update` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Response modalities: text plus synthesized audio
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<String>>,

    /// Synthesis voice id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    /// Input audio format - must be "pcm16" for raw PCM
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_format: Option<String>,

    /// Output audio format for response deltas
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_format: Option<String>,

    /// Input audio transcription settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<TranscriptionConfig>,

    /// Server-side speech detection thresholds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_detection: Option<TurnDetection>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_response_output_tokens: Option<u32>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            modalities: Some(vec!["text".to_string(), "audio".to_string()]),
            voice: Some("alloy".to_string()),
            input_audio_format: Some("pcm16".to_string()),
            output_audio_format: Some("pcm16".to_string()),
            input_audio_transcription: Some(TranscriptionConfig {
                model: "whisper-1".to_string(),
            }),
            turn_detection: Some(TurnDetection::default()),
            temperature: Some(0.8),
            max_response_output_tokens: Some(4096),
        }
    }
}

/// Transcription model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    pub model: String,
}

/// Server speech-detection thresholds.
///
/// Detection events (`speech_started`/`speech_stopped`) flow back for
/// UI use, but `create_response` stays false: the engine commits and
/// requests responses explicitly on user stop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub detection_type: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
    pub create_response: bool,
}

impl Default for TurnDetection {
    fn default() -> Self {
        Self {
            detection_type: "server_vad".to_string(),
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
            create_response: false,
        }
    }
}

/// Session information returned by the endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct SessionInfo {
    pub id: String,

    #[serde(default)]
    pub model: String,

    #[serde(default)]
    pub modalities: Vec<String>,
}

/// Error information from the endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorInfo {
    #[serde(rename = "type", default)]
    pub error_type: String,

    #[serde(default)]
    pub code: Option<String>,

    #[serde(default)]
    pub message: String,
}

// ============================================================================
// Client Frames (sent TO the endpoint)
// ============================================================================

/// Frames sent from the engine to the conversation endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    /// Update session configuration
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },

    /// Append audio data to the input buffer
    #[serde(rename = "input_audio_buffer.append")]
    AudioAppend {
        /// Base64-encoded PCM16 audio data
        audio: String,
    },

    /// Commit the input buffer, closing the user utterance
    #[serde(rename = "input_audio_buffer.commit")]
    AudioCommit,

    /// Discard the uncommitted input buffer
    #[serde(rename = "input_audio_buffer.clear")]
    AudioClear,

    /// Request a response for the committed input
    #[serde(rename = "response.create")]
    ResponseCreate,

    /// Inject a typed text message into the conversation
    #[serde(rename = "conversation.item.create")]
    TextMessage { item: TextItem },
}

/// A user text item for [`ClientFrame::TextMessage`]
#[derive(Debug, Clone, Serialize)]
pub struct TextItem {
    #[serde(rename = "type")]
    pub item_type: String,
    pub role: String,
    pub content: Vec<TextContent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextContent {
    #[serde(rename = "type")]
    pub content_type: String,
    pub text: String,
}

impl ClientFrame {
    /// Session update carrying the given configuration
    pub fn session_update(session: SessionConfig) -> Self {
        Self::SessionUpdate { session }
    }

    /// Audio append from an already base64-framed payload
    pub fn audio_append(audio: String) -> Self {
        Self::AudioAppend { audio }
    }

    /// User text message frame
    pub fn text_message(text: &str) -> Self {
        Self::TextMessage {
            item: TextItem {
                item_type: "message".to_string(),
                role: "user".to_string(),
                content: vec![TextContent {
                    content_type: "input_text".to_string(),
                    text: text.to_string(),
                }],
            },
        }
    }

    /// Frame name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ClientFrame::SessionUpdate { .. } => "session.update",
            ClientFrame::AudioAppend { .. } => "input_audio_buffer.append",
            ClientFrame::AudioCommit => "input_audio_buffer.commit",
            ClientFrame::AudioClear => "input_audio_buffer.clear",
            ClientFrame::ResponseCreate => "response.create",
            ClientFrame::TextMessage { .. } => "conversation.item.create",
        }
    }
}

// ============================================================================
// Server Events (received FROM the endpoint)
// ============================================================================

/// Events received from the conversation endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated { session: SessionInfo },

    #[serde(rename = "session.updated")]
    SessionUpdated { session: SessionInfo },

    #[serde(rename = "error")]
    Error { error: ErrorInfo },

    /// Server speech detection: user audio began
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {
        #[serde(default)]
        audio_start_ms: Option<u64>,
    },

    /// Server speech detection: user audio ended
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped {
        #[serde(default)]
        audio_end_ms: Option<u64>,
    },

    #[serde(rename = "input_audio_buffer.committed")]
    AudioCommitted {
        #[serde(default)]
        item_id: Option<String>,
    },

    #[serde(rename = "input_audio_buffer.cleared")]
    AudioCleared,

    /// Final transcript of the user utterance
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptCompleted {
        #[serde(default)]
        transcript: String,
    },

    /// Base64 PCM16 chunk of synthesized response audio
    #[serde(rename = "response.audio.delta")]
    ResponseAudioDelta { delta: String },

    #[serde(rename = "response.audio.done")]
    ResponseAudioDone,

    /// Partial response transcript
    #[serde(rename = "response.audio_transcript.delta")]
    ResponseTextDelta { delta: String },

    /// Authoritative final response transcript
    #[serde(rename = "response.audio_transcript.done")]
    ResponseTextDone {
        #[serde(default)]
        transcript: String,
    },

    /// Catch-all for frame types this engine does not handle; never fatal
    #[serde(other)]
    Unknown,
}

impl ServerEvent {
    pub fn is_error(&self) -> bool {
        matches!(self, ServerEvent::Error { .. })
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            ServerEvent::SessionCreated { session } => Some(&session.id),
            ServerEvent::SessionUpdated { session } => Some(&session.id),
            _ => None,
        }
    }
}
