//! PCM16 encoding and decoding
//!
//! Outbound microphone audio is sent as 16-bit little-endian PCM at 16kHz.
//! Inbound reply audio arrives as base64 16-bit little-endian PCM at 24kHz.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::session::MediaBlob;
use crate::{Error, Result};

/// Sample rate for outbound microphone audio (16kHz for speech)
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of inbound reply audio
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// MIME type tag for outbound audio
pub const INPUT_MIME_TYPE: &str = "audio/pcm;rate=16000";

/// Convert one float sample to a signed 16-bit sample
///
/// The input is clamped to [-1, 1]. Negative values scale by 0x8000 and
/// non-negative values by 0x7FFF, truncating toward zero. NaN maps to 0.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn float_to_pcm16(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// Encode float samples as 16-bit little-endian PCM bytes
#[must_use]
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&s| float_to_pcm16(s).to_le_bytes())
        .collect()
}

/// Encode a captured buffer as an outbound audio payload
#[must_use]
pub fn audio_blob(samples: &[f32]) -> MediaBlob {
    MediaBlob {
        mime_type: INPUT_MIME_TYPE.to_string(),
        data: STANDARD.encode(encode_pcm16(samples)),
    }
}

/// Decoded mono audio ready for playback
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl AudioBuffer {
    /// Create a buffer from mono samples
    #[must_use]
    pub const fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Mono samples
    #[must_use]
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Consume the buffer, returning its samples
    #[must_use]
    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }

    /// Sample rate in Hz
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of samples
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the buffer holds no samples
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration in seconds
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / f64::from(self.sample_rate)
    }
}

/// Decode 16-bit little-endian PCM bytes into a playable buffer
///
/// # Errors
///
/// Returns error if the data is empty or has an odd number of bytes
pub fn decode_pcm16(bytes: &[u8], sample_rate: u32) -> Result<AudioBuffer> {
    if bytes.is_empty() {
        return Err(Error::Decode("empty audio chunk".to_string()));
    }
    if bytes.len() % 2 != 0 {
        return Err(Error::Decode(format!(
            "PCM16 chunk has odd length {}",
            bytes.len()
        )));
    }

    let samples = bytes
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
        .collect();

    Ok(AudioBuffer::new(samples, sample_rate))
}

/// Decode a base64 PCM16 chunk as delivered by the live session
///
/// # Errors
///
/// Returns error if the base64 or PCM data is malformed
pub fn decode_base64_chunk(data: &str, sample_rate: u32) -> Result<AudioBuffer> {
    let bytes = STANDARD.decode(data)?;
    decode_pcm16(&bytes, sample_rate)
}
