//! Audio transcoding between capture buffers and wire formats
//!
//! Pure transforms, no state: float PCM from the microphone becomes
//! little-endian PCM16 for the duplex transport, and decoded response
//! bytes become a self-describing WAV container for playback.
//!
//! # Failure Policy
//!
//! Size problems (odd byte counts, oversized buffers) are clamped or
//! padded, never errors. Only contract violations fail: an empty PCM
//! payload cannot become a playable container.

use base64::{engine::general_purpose::STANDARD, Engine};
use hound::{WavSpec, WavWriter};
use std::io::Cursor;

/// Length of the canonical RIFF/WAVE header for PCM data
pub const WAV_HEADER_LEN: usize = 44;

/// Base64 sub-chunk size. Kept divisible by 3 so per-chunk encoding
/// concatenates into the same string as encoding the whole buffer,
/// while staying under the 32 KB framing limit.
const FRAME_SUB_CHUNK: usize = 30_000;

/// Errors from codec contract violations.
#[derive(Debug, Clone)]
pub enum CodecError {
    /// Zero-length PCM payload cannot be wrapped in a container
    EmptyInput,
    /// Incoming frame was not valid base64
    MalformedFrame(String),
    /// Container serialization failed
    ContainerWrite(String),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::EmptyInput => write!(f, "Cannot synthesize container from empty PCM data"),
            CodecError::MalformedFrame(e) => write!(f, "Failed to decode audio frame: {}", e),
            CodecError::ContainerWrite(e) => write!(f, "Failed to write audio container: {}", e),
        }
    }
}

impl std::error::Error for CodecError {}

/// An immutable audio byte buffer tagged with its format.
///
/// Produced by the capture pipeline (encoded microphone samples) or by
/// the codec (decoded network deltas). Ownership moves into whichever
/// queue consumes it: the transport outbox or the player queue.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Raw little-endian PCM bytes
    pub data: Vec<u8>,
    /// Sample rate in Hz (typically 24000)
    pub sample_rate: u32,
    /// Channel count (typically 1)
    pub channels: u16,
    /// Bit depth (16 for PCM16)
    pub bits_per_sample: u16,
}

impl AudioChunk {
    /// Create a PCM16 chunk with the given format tags
    pub fn pcm16(data: Vec<u8>, sample_rate: u32, channels: u16) -> Self {
        Self {
            data,
            sample_rate,
            channels,
            bits_per_sample: 16,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Duration of this chunk in milliseconds
    pub fn duration_ms(&self) -> u64 {
        let bytes_per_second =
            self.sample_rate as u64 * self.channels as u64 * (self.bits_per_sample as u64 / 8);
        if bytes_per_second == 0 {
            return 0;
        }
        self.data.len() as u64 * 1000 / bytes_per_second
    }
}

/// Encode float samples as little-endian PCM16 bytes.
///
/// Each sample is clamped to [-1.0, 1.0] and scaled to signed 16-bit.
/// Deterministic, no side effects.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let clamped = sample.clamp(-1.0, 1.0);
        let value = (clamped * i16::MAX as f32) as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Decode little-endian PCM16 bytes back to float samples.
///
/// A trailing odd byte is padded with zero rather than rejected.
pub fn decode_pcm16(bytes: &[u8]) -> Vec<f32> {
    let mut samples = Vec::with_capacity(bytes.len() / 2 + 1);
    let mut pairs = bytes.chunks_exact(2);
    for pair in &mut pairs {
        let value = i16::from_le_bytes([pair[0], pair[1]]);
        samples.push(value as f32 / i16::MAX as f32);
    }
    if let [last] = pairs.remainder() {
        let value = i16::from_le_bytes([*last, 0]);
        samples.push(value as f32 / i16::MAX as f32);
    }
    samples
}

/// Base64-encode PCM bytes for a transport frame.
///
/// Input is processed in sub-chunks of at most 32 KB to bound peak
/// string allocation on large buffers. Lossless round-trip with
/// [`decode_frame`].
pub fn frame_for_transport(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() / 3 * 4 + 4);
    for chunk in bytes.chunks(FRAME_SUB_CHUNK) {
        STANDARD.encode_string(chunk, &mut out);
    }
    out
}

/// Decode a base64 transport frame back to raw bytes.
pub fn decode_frame(frame: &str) -> Result<Vec<u8>, CodecError> {
    STANDARD
        .decode(frame)
        .map_err(|e| CodecError::MalformedFrame(e.to_string()))
}

/// Wrap raw PCM16 bytes in a minimal WAV container.
///
/// The result is the exact 44-byte RIFF/WAVE header (format tag 1,
/// little-endian channel count, sample rate, byte rate, block align,
/// bit depth, data length) followed by the PCM data, so any standard
/// decoder can play it without external metadata.
///
/// # Errors
/// `CodecError::EmptyInput` if `pcm` is empty.
pub fn synthesize_wav(pcm: &[u8], sample_rate: u32, channels: u16) -> Result<Vec<u8>, CodecError> {
    if pcm.is_empty() {
        return Err(CodecError::EmptyInput);
    }

    let spec = WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(WAV_HEADER_LEN + pcm.len()));
    {
        let mut writer = WavWriter::new(&mut cursor, spec)
            .map_err(|e| CodecError::ContainerWrite(e.to_string()))?;

        let mut pairs = pcm.chunks_exact(2);
        for pair in &mut pairs {
            writer
                .write_sample(i16::from_le_bytes([pair[0], pair[1]]))
                .map_err(|e| CodecError::ContainerWrite(e.to_string()))?;
        }
        // Odd trailing byte: pad with a zero high byte
        if let [last] = pairs.remainder() {
            writer
                .write_sample(i16::from_le_bytes([*last, 0]))
                .map_err(|e| CodecError::ContainerWrite(e.to_string()))?;
        }

        writer
            .finalize()
            .map_err(|e| CodecError::ContainerWrite(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_u32_le(bytes: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
    }

    fn read_u16_le(bytes: &[u8], offset: usize) -> u16 {
        u16::from_le_bytes(bytes[offset..offset + 2].try_into().unwrap())
    }

    #[test]
    fn test_encode_clamps_and_scales() {
        let bytes = encode_pcm16(&[0.0, 1.0, -1.0, 2.0, -2.0]);
        assert_eq!(bytes.len(), 10);

        let samples = decode_pcm16(&bytes);
        assert_eq!(samples[0], 0.0);
        assert_eq!(samples[1], 1.0);
        assert_eq!(samples[2], -1.0);
        // Out-of-range input clamps to full scale
        assert_eq!(samples[3], 1.0);
        assert_eq!(samples[4], -1.0);
    }

    #[test]
    fn test_pcm16_round_trip_within_one_lsb() {
        let original: Vec<f32> = (0..4800)
            .map(|i| ((i as f32) / 240.0).sin() * 0.8)
            .collect();

        let decoded = decode_pcm16(&encode_pcm16(&original));
        assert_eq!(decoded.len(), original.len());

        let one_lsb = 1.0 / i16::MAX as f32;
        for (a, b) in original.iter().zip(decoded.iter()) {
            assert!(
                (a - b).abs() <= one_lsb,
                "Sample diverged by more than 1 LSB: {} vs {}",
                a,
                b
            );
        }
    }

    #[test]
    fn test_decode_pads_odd_byte() {
        let samples = decode_pcm16(&[0x34, 0x12, 0x78]);
        assert_eq!(samples.len(), 2);
        // [0x78, 0x00] -> 0x0078
        assert_eq!(samples[1], 0x78 as f32 / i16::MAX as f32);
    }

    #[test]
    fn test_frame_round_trip() {
        let bytes: Vec<u8> = (0..1000).map(|i| (i % 251) as u8).collect();
        let frame = frame_for_transport(&bytes);
        assert_eq!(decode_frame(&frame).unwrap(), bytes);
    }

    #[test]
    fn test_frame_chunking_matches_single_pass() {
        // Spans multiple sub-chunks; concatenated encoding must equal
        // a single-pass encoding of the whole buffer.
        let bytes: Vec<u8> = (0..70_000u32).map(|i| (i % 256) as u8).collect();
        let framed = frame_for_transport(&bytes);
        assert_eq!(framed, STANDARD.encode(&bytes));
        assert_eq!(decode_frame(&framed).unwrap(), bytes);
    }

    #[test]
    fn test_decode_frame_rejects_garbage() {
        assert!(matches!(
            decode_frame("not base64!!!"),
            Err(CodecError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_wav_container_layout() {
        let pcm = vec![0u8; 4096];
        let wav = synthesize_wav(&pcm, 24000, 1).unwrap();

        assert_eq!(wav.len(), WAV_HEADER_LEN + 4096);

        // RIFF chunk
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(read_u32_le(&wav, 4), 36 + 4096);
        assert_eq!(&wav[8..12], b"WAVE");

        // fmt chunk: PCM tag, mono, 24kHz
        assert_eq!(&wav[12..16], b"fmt ");
        assert_eq!(read_u32_le(&wav, 16), 16);
        assert_eq!(read_u16_le(&wav, 20), 1);
        assert_eq!(read_u16_le(&wav, 22), 1);
        assert_eq!(read_u32_le(&wav, 24), 24000);
        // byte rate = rate * channels * 2, block align = channels * 2
        assert_eq!(read_u32_le(&wav, 28), 48000);
        assert_eq!(read_u16_le(&wav, 32), 2);
        assert_eq!(read_u16_le(&wav, 34), 16);

        // data chunk
        assert_eq!(&wav[36..40], b"data");
        assert_eq!(read_u32_le(&wav, 40), 4096);
    }

    #[test]
    fn test_wav_container_stereo_fields() {
        let pcm = vec![0u8; 960];
        let wav = synthesize_wav(&pcm, 48000, 2).unwrap();

        assert_eq!(read_u16_le(&wav, 22), 2);
        assert_eq!(read_u32_le(&wav, 24), 48000);
        assert_eq!(read_u32_le(&wav, 28), 192_000);
        assert_eq!(read_u16_le(&wav, 32), 4);
    }

    #[test]
    fn test_wav_container_rejects_empty() {
        assert!(matches!(
            synthesize_wav(&[], 24000, 1),
            Err(CodecError::EmptyInput)
        ));
    }

    #[test]
    fn test_wav_container_is_decodable() {
        let samples: Vec<f32> = (0..2400).map(|i| ((i as f32) / 60.0).sin() * 0.5).collect();
        let pcm = encode_pcm16(&samples);
        let wav = synthesize_wav(&pcm, 24000, 1).unwrap();

        let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        assert_eq!(reader.spec().sample_rate, 24000);
        assert_eq!(reader.spec().channels, 1);
        assert_eq!(reader.len(), 2400);
    }

    #[test]
    fn test_chunk_duration() {
        // 24kHz mono PCM16: 48000 bytes per second
        let chunk = AudioChunk::pcm16(vec![0u8; 4800], 24000, 1);
        assert_eq!(chunk.duration_ms(), 100);
        assert_eq!(chunk.len(), 4800);
        assert!(!chunk.is_empty());
    }
}
