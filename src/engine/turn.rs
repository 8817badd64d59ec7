//! Per-turn conversation record
//!
//! One user-utterance / AI-response pair, owned exclusively by the
//! controller for the duration of the turn. Response text follows the
//! delta-then-authoritative aggregation strategy: deltas append as they
//! arrive, and the final transcript event replaces the accumulation
//! (the remote may send corrections in the final event).

use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ConversationTurn {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Total PCM16 bytes streamed to the endpoint for this turn
    pub captured_audio_bytes: usize,
    /// Final transcript of the user utterance
    pub user_transcript: Option<String>,
    /// Accumulated partial response text from delta events
    response_text_partial: String,
    /// Authoritative response text from the done event
    response_text_final: Option<String>,
    /// Accumulated response PCM16, decoded from audio deltas
    response_audio: Vec<u8>,
}

impl ConversationTurn {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            started_at: Utc::now(),
            ended_at: None,
            captured_audio_bytes: 0,
            user_transcript: None,
            response_text_partial: String::new(),
            response_text_final: None,
            response_audio: Vec::new(),
        }
    }

    /// Append a partial response text fragment.
    pub fn append_response_text(&mut self, delta: &str) {
        if !delta.is_empty() {
            self.response_text_partial.push_str(delta);
        }
    }

    /// Set the authoritative response text, overriding accumulated deltas.
    pub fn finish_response_text(&mut self, transcript: &str) {
        self.response_text_final = Some(transcript.to_string());
    }

    /// Best available response text at this moment.
    pub fn response_text(&self) -> &str {
        self.response_text_final
            .as_deref()
            .unwrap_or(&self.response_text_partial)
    }

    /// Append a decoded response audio chunk.
    pub fn append_response_audio(&mut self, audio: &[u8]) {
        self.response_audio.extend_from_slice(audio);
    }

    pub fn response_audio(&self) -> &[u8] {
        &self.response_audio
    }

    /// Take the accumulated response audio for playback.
    pub fn take_response_audio(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.response_audio)
    }

    /// Stamp the end of the turn. A second call keeps the first stamp.
    pub fn close(&mut self) {
        if self.ended_at.is_none() {
            self.ended_at = Some(Utc::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_turn_is_open_and_empty() {
        let turn = ConversationTurn::new(Uuid::new_v4());
        assert!(turn.ended_at.is_none());
        assert_eq!(turn.captured_audio_bytes, 0);
        assert_eq!(turn.response_text(), "");
        assert!(turn.response_audio().is_empty());
    }

    #[test]
    fn test_response_text_deltas_accumulate() {
        let mut turn = ConversationTurn::new(Uuid::new_v4());
        turn.append_response_text("Hi ");
        turn.append_response_text("there");
        turn.append_response_text("");
        assert_eq!(turn.response_text(), "Hi there");
    }

    #[test]
    fn test_final_text_overrides_deltas() {
        let mut turn = ConversationTurn::new(Uuid::new_v4());
        turn.append_response_text("Hi ther");
        turn.finish_response_text("Hi there!");
        assert_eq!(turn.response_text(), "Hi there!");
    }

    #[test]
    fn test_response_audio_accumulates_and_takes() {
        let mut turn = ConversationTurn::new(Uuid::new_v4());
        turn.append_response_audio(&[1, 2]);
        turn.append_response_audio(&[3, 4]);
        assert_eq!(turn.response_audio(), &[1, 2, 3, 4]);

        let taken = turn.take_response_audio();
        assert_eq!(taken, vec![1, 2, 3, 4]);
        assert!(turn.response_audio().is_empty());
    }

    #[test]
    fn test_close_keeps_first_stamp() {
        let mut turn = ConversationTurn::new(Uuid::new_v4());
        turn.close();
        let first = turn.ended_at;
        turn.close();
        assert_eq!(turn.ended_at, first);
    }
}
