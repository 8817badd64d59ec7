//! Engine configuration with JSON persistence
//!
//! A missing or corrupt settings file falls back to defaults with a
//! warning; saves are atomic (temp file then rename) so a crash
//! mid-write never leaves a truncated file behind.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capture::CaptureConfig;
use crate::transport::protocol::{SessionConfig, TranscriptionConfig, TurnDetection};

const SETTINGS_FILE_NAME: &str = "settings.json";
const SETTINGS_DIR_NAME: &str = "voiceloop";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Synthesis voice id requested from the endpoint
    pub voice: String,

    /// Model used for input transcription
    pub transcription_model: String,

    pub temperature: f32,

    pub max_response_tokens: u32,

    /// Server speech-detection threshold (0.0-1.0)
    pub vad_threshold: f32,
    pub vad_prefix_padding_ms: u32,
    pub vad_silence_duration_ms: u32,

    /// Requested capture rate; the device may deliver its native rate
    pub capture_sample_rate: u32,
    pub capture_channels: u16,
    pub noise_suppression: bool,

    /// Outgoing audio frame duration
    pub chunk_ms: u32,

    /// Two `start_turn` calls inside this window collapse into one;
    /// absorbs accidental double-taps.
    pub debounce_ms: u64,

    /// Recordings auto-stop at this cap to prevent runaway turns
    pub max_recording_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            voice: "alloy".to_string(),
            transcription_model: "whisper-1".to_string(),
            temperature: 0.8,
            max_response_tokens: 4096,
            vad_threshold: 0.5,
            vad_prefix_padding_ms: 300,
            vad_silence_duration_ms: 500,
            capture_sample_rate: 24_000,
            capture_channels: 1,
            noise_suppression: true,
            chunk_ms: 100,
            debounce_ms: 2_000,
            max_recording_secs: 120,
        }
    }
}

impl EngineSettings {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn max_recording(&self) -> Duration {
        Duration::from_secs(self.max_recording_secs)
    }

    /// Session configuration frame derived from these settings.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            modalities: Some(vec!["text".to_string(), "audio".to_string()]),
            voice: Some(self.voice.clone()),
            input_audio_format: Some("pcm16".to_string()),
            output_audio_format: Some("pcm16".to_string()),
            input_audio_transcription: Some(TranscriptionConfig {
                model: self.transcription_model.clone(),
            }),
            turn_detection: Some(TurnDetection {
                detection_type: "server_vad".to_string(),
                threshold: self.vad_threshold,
                prefix_padding_ms: self.vad_prefix_padding_ms,
                silence_duration_ms: self.vad_silence_duration_ms,
                create_response: false,
            }),
            temperature: Some(self.temperature),
            max_response_output_tokens: Some(self.max_response_tokens),
        }
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            sample_rate: self.capture_sample_rate,
            channels: self.capture_channels,
            noise_suppression: self.noise_suppression,
        }
    }

    /// Load from the default per-user config path.
    pub fn load() -> Self {
        match settings_path() {
            Ok(path) => Self::load_from(&path),
            Err(e) => {
                log::warn!("Settings: {}", e);
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<EngineSettings>(&contents) {
                Ok(settings) => settings,
                Err(e) => {
                    log::warn!("Settings: failed to parse {:?}: {}", path, e);
                    Self::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                log::warn!("Settings: failed to read {:?}: {}", path, e);
                Self::default()
            }
        }
    }

    /// Save to the default per-user config path.
    pub fn save(&self) -> Result<(), String> {
        self.save_to(&settings_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
        }

        let contents =
            serde_json::to_string_pretty(self).map_err(|e| format!("Serialize settings: {}", e))?;

        // Write atomically: temp file in the same directory, then rename.
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &contents)
            .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

        // On Unix, rename atomically replaces the destination. On Windows,
        // rename fails if the destination exists, so remove it first.
        if cfg!(windows) && path.exists() {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(format!("Remove existing settings file {:?}: {}", path, e));
                }
            }
        }

        std::fs::rename(&tmp_path, path)
            .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;
        Ok(())
    }
}

fn settings_path() -> Result<PathBuf, String> {
    let dir =
        dirs::config_dir().ok_or_else(|| "Could not determine config directory".to_string())?;
    Ok(dir.join(SETTINGS_DIR_NAME).join(SETTINGS_FILE_NAME))
}
