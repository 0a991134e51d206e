//! Audio playback to speakers
//!
//! A single output stream runs for the whole call. Scheduled chunks are mixed
//! into it by frame position, and the number of frames rendered so far is the
//! playback clock the scheduler works against.

use std::sync::{Arc, Mutex, PoisonError};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};
use rubato::{FftFixedIn, Resampler};
use tokio::sync::mpsc;

use super::pcm::{AudioBuffer, OUTPUT_SAMPLE_RATE};
use super::scheduler::{AudioOutput, HandleId};
use crate::{Error, Result};

/// Input frames handed to the reply resampler per pass
const RESAMPLER_CHUNK: usize = 1024;

/// One scheduled chunk inside the mixer
struct Voice {
    id: HandleId,
    start_frame: u64,
    samples: Vec<f32>,
    position: usize,
}

impl Voice {
    fn is_done(&self) -> bool {
        self.position >= self.samples.len()
    }
}

/// Frame-accurate mixer shared with the output callback
pub(crate) struct Mixer {
    sample_rate: u32,
    frame: u64,
    voices: Vec<Voice>,
    ended: mpsc::UnboundedSender<HandleId>,
}

impl Mixer {
    pub(crate) const fn new(sample_rate: u32, ended: mpsc::UnboundedSender<HandleId>) -> Self {
        Self {
            sample_rate,
            frame: 0,
            voices: Vec::new(),
            ended,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn clock(&self) -> f64 {
        self.frame as f64 / f64::from(self.sample_rate)
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn frame_at(&self, secs: f64) -> u64 {
        (secs.max(0.0) * f64::from(self.sample_rate)).round() as u64
    }

    /// Place device-rate samples covering `[at, at + duration)`
    ///
    /// The voice spans exactly the frames between the rounded start and end
    /// times, so a chunk scheduled at the previous chunk's end starts on the
    /// frame right after it. Samples are padded with the last value or
    /// truncated to fit.
    pub(crate) fn add(&mut self, id: HandleId, mut samples: Vec<f32>, at: f64, duration: f64) {
        let start_frame = self.frame_at(at);
        let end_frame = self.frame_at(at + duration).max(start_frame);
        let frames = usize::try_from(end_frame - start_frame).unwrap_or(usize::MAX);

        let pad = samples.last().copied().unwrap_or(0.0);
        samples.resize(frames, pad);

        self.voices.push(Voice {
            id,
            start_frame,
            samples,
            position: 0,
        });
    }

    pub(crate) fn remove(&mut self, id: HandleId) -> bool {
        let before = self.voices.len();
        self.voices.retain(|v| v.id != id);
        self.voices.len() != before
    }

    /// Fill an interleaved output buffer and report chunks that ended
    pub(crate) fn render(&mut self, data: &mut [f32], channels: usize) {
        for out_frame in data.chunks_mut(channels.max(1)) {
            let current = self.frame;
            let mut mixed = 0.0f32;

            for voice in &mut self.voices {
                if current >= voice.start_frame && !voice.is_done() {
                    mixed += voice.samples[voice.position];
                    voice.position += 1;
                }
            }

            let sample = mixed.clamp(-1.0, 1.0);
            for out in out_frame.iter_mut() {
                *out = sample;
            }
            self.frame += 1;
        }

        let ended = &self.ended;
        self.voices.retain(|voice| {
            if voice.is_done() {
                // Receiver gone means the call is being torn down
                let _ = ended.send(voice.id);
                false
            } else {
                true
            }
        });
    }
}

/// Plays scheduled chunks on the default output device
pub struct CpalOutput {
    stream: Option<Stream>,
    mixer: Arc<Mutex<Mixer>>,
    sample_rate: u32,
}

impl CpalOutput {
    /// Open the default output device and start the playback clock
    ///
    /// Completed handles are reported on `ended`.
    ///
    /// # Errors
    ///
    /// Returns error if no output device or configuration is available
    pub fn open(ended: mpsc::UnboundedSender<HandleId>) -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        let config = select_output_config(&device)?;
        let sample_rate = config.sample_rate.0;
        let channels = usize::from(config.channels);

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate,
            channels,
            "audio playback initialized"
        );

        let mixer = Arc::new(Mutex::new(Mixer::new(sample_rate, ended)));
        let mixer_clone = Arc::clone(&mixer);

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if let Ok(mut mixer) = mixer_clone.lock() {
                        mixer.render(data, channels);
                    } else {
                        data.fill(0.0);
                    }
                },
                |err| {
                    tracing::error!(error = %err, "audio playback error");
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        Ok(Self {
            stream: Some(stream),
            mixer,
            sample_rate,
        })
    }

    /// Device sample rate
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl AudioOutput for CpalOutput {
    fn now(&self) -> f64 {
        self.mixer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clock()
    }

    fn start(&mut self, id: HandleId, buffer: AudioBuffer, at: f64) -> Result<()> {
        if self.stream.is_none() {
            return Err(Error::Audio("output is closed".to_string()));
        }

        let duration = buffer.duration();
        let samples = resample_reply(buffer.samples(), buffer.sample_rate(), self.sample_rate)?;
        self.mixer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .add(id, samples, at, duration);
        Ok(())
    }

    fn stop(&mut self, id: HandleId) -> Result<()> {
        let removed = self
            .mixer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);

        if removed {
            Ok(())
        } else {
            Err(Error::Audio(format!("handle {id} is not playing")))
        }
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            tracing::debug!("audio playback stopped");
        }
    }
}

/// Resample one reply chunk to the device rate using rubato
///
/// The tail is zero-padded through the resampler and the filter delay is
/// trimmed, so the result lines up with the input in time.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn resample_reply(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let mut resampler =
        FftFixedIn::<f32>::new(from_rate as usize, to_rate as usize, RESAMPLER_CHUNK, 2, 1)
            .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?;
    let failed = |e: rubato::ResampleError| Error::Audio(format!("resample failed: {e}"));

    let delay = resampler.output_delay();
    let expected =
        (samples.len() as f64 * f64::from(to_rate) / f64::from(from_rate)).round() as usize;
    let mut output = Vec::with_capacity(expected + delay);

    let mut rest = samples;
    while rest.len() >= resampler.input_frames_next() {
        let (chunk, tail) = rest.split_at(resampler.input_frames_next());
        let out = resampler.process(&[chunk], None).map_err(failed)?;
        output.extend_from_slice(&out[0]);
        rest = tail;
    }
    if !rest.is_empty() {
        let out = resampler
            .process_partial(Some(&[rest][..]), None)
            .map_err(failed)?;
        output.extend_from_slice(&out[0]);
    }
    while output.len() < expected + delay {
        let out = resampler
            .process_partial::<&[f32]>(None, None)
            .map_err(failed)?;
        if out[0].is_empty() {
            break;
        }
        output.extend_from_slice(&out[0]);
    }

    output.drain(..delay.min(output.len()));
    output.truncate(expected);
    Ok(output)
}

/// Prefer a native 24kHz config (mono, then stereo), else the device default
fn select_output_config(device: &cpal::Device) -> Result<StreamConfig> {
    let wanted = SampleRate(OUTPUT_SAMPLE_RATE);
    let supports = |channels: u16| {
        device.supported_output_configs().ok()?.find(|c| {
            c.channels() == channels
                && c.sample_format() == cpal::SampleFormat::F32
                && c.min_sample_rate() <= wanted
                && c.max_sample_rate() >= wanted
        })
    };

    if let Some(supported) = supports(1).or_else(|| supports(2)) {
        return Ok(supported.with_sample_rate(wanted).config());
    }

    let fallback = device
        .default_output_config()
        .map_err(|e| Error::Audio(e.to_string()))?;

    if fallback.sample_format() != cpal::SampleFormat::F32 {
        return Err(Error::Audio("no suitable output config found".to_string()));
    }

    tracing::debug!(
        sample_rate = fallback.sample_rate().0,
        "device lacks 24kHz output, resampling"
    );
    Ok(fallback.config())
}
