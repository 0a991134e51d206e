//! Voice processing module
//!
//! Handles microphone capture, PCM encoding, and scheduled playback of
//! streamed reply audio.

mod capture;
mod pcm;
mod playback;
mod scheduler;

pub use capture::{MicrophoneCapture, samples_to_wav};
pub use pcm::{
    AudioBuffer, INPUT_MIME_TYPE, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE, audio_blob,
    decode_base64_chunk, decode_pcm16, encode_pcm16, float_to_pcm16,
};
pub use playback::CpalOutput;
pub use scheduler::{AudioOutput, HandleId, PlaybackScheduler, ScheduledChunk};
