//! Audio capture from microphone
//!
//! The input stream is down-mixed to mono, resampled to 16kHz when the device
//! cannot run at that rate, and re-framed so every delivered buffer holds
//! exactly the configured number of samples.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};
use rubato::{FftFixedIn, Resampler};
use tokio::sync::mpsc;

use super::pcm::float_to_pcm16;
use crate::config::AudioConfig;
use crate::{Error, Result};

/// Input frames handed to the resampler per pass
const RESAMPLER_CHUNK: usize = 1024;

/// Converts device-rate mono audio to the target rate
struct InputResampler {
    inner: FftFixedIn<f32>,
    staged: Vec<f32>,
}

impl InputResampler {
    fn new(device_rate: u32, target_rate: u32) -> Result<Self> {
        let inner = FftFixedIn::<f32>::new(
            device_rate as usize,
            target_rate as usize,
            RESAMPLER_CHUNK,
            2,
            1,
        )
        .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?;

        Ok(Self {
            inner,
            staged: Vec::new(),
        })
    }

    fn push(&mut self, input: &[f32], out: &mut Vec<f32>) {
        self.staged.extend_from_slice(input);

        loop {
            let needed = self.inner.input_frames_next();
            if self.staged.len() < needed {
                break;
            }

            let chunk: Vec<f32> = self.staged.drain(..needed).collect();
            match self.inner.process(&[chunk], None) {
                Ok(channels) => {
                    if let Some(mono) = channels.into_iter().next() {
                        out.extend(mono);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "resampling failed, dropping input");
                }
            }
        }
    }
}

/// Turns an irregular callback stream into fixed-size sample buffers
pub(crate) struct Reframer {
    block: usize,
    pending: Vec<f32>,
    resampler: Option<InputResampler>,
}

impl Reframer {
    pub(crate) fn new(block: usize, device_rate: u32, target_rate: u32) -> Result<Self> {
        let resampler = if device_rate == target_rate {
            None
        } else {
            Some(InputResampler::new(device_rate, target_rate)?)
        };

        Ok(Self {
            block: block.max(1),
            pending: Vec::with_capacity(block * 2),
            resampler,
        })
    }

    /// Feed mono samples; `emit` is called once per complete buffer, in order
    pub(crate) fn push(&mut self, mono: &[f32], mut emit: impl FnMut(Vec<f32>)) {
        match &mut self.resampler {
            Some(resampler) => resampler.push(mono, &mut self.pending),
            None => self.pending.extend_from_slice(mono),
        }

        while self.pending.len() >= self.block {
            let rest = self.pending.split_off(self.block);
            let full = std::mem::replace(&mut self.pending, rest);
            emit(full);
        }
    }
}

/// Average interleaved frames into mono
#[allow(clippy::cast_precision_loss)]
fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Captures audio from the default input device
pub struct MicrophoneCapture {
    stream: Option<Stream>,
    device_rate: u32,
}

impl MicrophoneCapture {
    /// Open the default input device and start delivering buffers to `sink`
    ///
    /// # Errors
    ///
    /// Returns `Error::Permission` if no input device can be acquired, or
    /// `Error::Audio` if the stream cannot be started
    pub fn open(config: &AudioConfig, sink: mpsc::UnboundedSender<Vec<f32>>) -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Permission("no input device available".to_string()))?;

        let stream_config = select_input_config(&device, config.input_sample_rate)?;
        let device_rate = stream_config.sample_rate.0;
        let channels = usize::from(stream_config.channels);

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            device_rate,
            target_rate = config.input_sample_rate,
            channels,
            buffer_size = config.buffer_size,
            "audio capture initialized"
        );

        let mut reframer = Reframer::new(config.buffer_size, device_rate, config.input_sample_rate)?;

        let stream = device
            .build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let mono = downmix(data, channels);
                    reframer.push(&mono, |buffer| {
                        // Receiver gone means the call is being torn down
                        let _ = sink.send(buffer);
                    });
                },
                |err| {
                    tracing::error!(error = %err, "audio capture error");
                },
                None,
            )
            .map_err(|e| Error::Permission(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        tracing::debug!("audio capture started");
        Ok(Self {
            stream: Some(stream),
            device_rate,
        })
    }

    /// Stop capturing and release the device
    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            tracing::debug!("audio capture stopped");
        }
    }

    /// Check if currently capturing
    #[must_use]
    pub const fn is_capturing(&self) -> bool {
        self.stream.is_some()
    }

    /// Native rate of the input device
    #[must_use]
    pub const fn device_rate(&self) -> u32 {
        self.device_rate
    }
}

/// Prefer a native mono config at the target rate, else the device default
fn select_input_config(device: &cpal::Device, target_rate: u32) -> Result<StreamConfig> {
    let wanted = SampleRate(target_rate);

    let native = device
        .supported_input_configs()
        .map_err(|e| Error::Permission(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.sample_format() == cpal::SampleFormat::F32
                && c.min_sample_rate() <= wanted
                && c.max_sample_rate() >= wanted
        });

    if let Some(supported) = native {
        return Ok(supported.with_sample_rate(wanted).config());
    }

    let fallback = device
        .default_input_config()
        .map_err(|e| Error::Permission(e.to_string()))?;

    if fallback.sample_format() != cpal::SampleFormat::F32 {
        return Err(Error::Audio("no suitable audio config found".to_string()));
    }

    Ok(fallback.config())
}

/// Convert f32 samples to 16-bit WAV bytes
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            writer
                .write_sample(float_to_pcm16(sample))
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reframer_emits_exact_blocks_in_order() {
        let mut reframer = Reframer::new(4, 16_000, 16_000).unwrap();
        let mut blocks = Vec::new();

        #[allow(clippy::cast_precision_loss)]
        let input: Vec<f32> = (0..10).map(|i| i as f32).collect();
        reframer.push(&input[..3], |b| blocks.push(b));
        assert!(blocks.is_empty());

        reframer.push(&input[3..], |b| blocks.push(b));
        assert_eq!(blocks, vec![vec![0.0, 1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0, 7.0]]);
    }

    #[test]
    fn test_reframer_resamples_to_target_rate() {
        let mut reframer = Reframer::new(4096, 48_000, 16_000).unwrap();
        let mut total = 0usize;

        // Two seconds of device audio in callback-sized pieces
        for _ in 0..(96_000 / 480) {
            reframer.push(&[0.1f32; 480], |b| {
                assert_eq!(b.len(), 4096);
                total += b.len();
            });
        }

        // Roughly 32k samples at 16kHz, minus resampler latency and the partial block
        assert!(total >= 4096 * 6, "got {total}");
        assert!(total <= 32_000);
    }

    #[test]
    fn test_downmix_stereo() {
        let mono = downmix(&[1.0, 0.0, 0.5, 0.5], 2);
        assert_eq!(mono, vec![0.5, 0.5]);
    }

    #[test]
    fn test_samples_to_wav_header() {
        let wav = samples_to_wav(&[0.0, 0.5, -0.5], 16_000).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(wav.len(), 44 + 6);
    }
}
