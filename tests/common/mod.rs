//! Shared test utilities
//!
//! Scripted remote session, fake media devices, and a manual-clock audio
//! output, so call scenarios run without network or hardware.

#![allow(dead_code)]

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use image::RgbImage;
use tokio::sync::mpsc;

use livecall::call::{CallController, CallSettings, MediaDevices, MediaTrack};
use livecall::config::{AudioConfig, VideoConfig};
use livecall::session::{
    ConnectRequest, Connection, MediaBlob, RealtimeSession, ServerMessage, SessionConnector,
    SessionEvent,
};
use livecall::video::FrameSource;
use livecall::voice::{AudioBuffer, AudioOutput, HandleId, OUTPUT_SAMPLE_RATE, encode_pcm16};
use livecall::{Error, Result};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().expect("test mutex poisoned")
}

/// What the remote side saw
#[derive(Default)]
pub struct RemoteLog {
    pub connects: usize,
    pub requests: Vec<ConnectRequest>,
    pub sent: Vec<MediaBlob>,
    pub closes: usize,
    pub events: Option<mpsc::UnboundedSender<SessionEvent>>,
}

/// Scripted live session endpoint
#[derive(Clone, Default)]
pub struct FakeRemote {
    log: Arc<Mutex<RemoteLog>>,
    refuse: bool,
    manual_open: bool,
    fail_close: bool,
    close_delay: Option<Duration>,
}

impl FakeRemote {
    /// Accepts connections and completes the handshake immediately
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails every connect
    #[must_use]
    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::default()
        }
    }

    /// Accepts connections but waits for [`FakeRemote::emit`] to open
    #[must_use]
    pub fn manual_open() -> Self {
        Self {
            manual_open: true,
            ..Self::default()
        }
    }

    /// Sessions whose `close` reports an error
    #[must_use]
    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    /// Sessions that take `delay` to finish closing
    #[must_use]
    pub fn slow_close(mut self, delay: Duration) -> Self {
        self.close_delay = Some(delay);
        self
    }

    pub fn log(&self) -> MutexGuard<'_, RemoteLog> {
        lock(&self.log)
    }

    /// Push a server event to the connected client
    pub fn emit(&self, event: SessionEvent) {
        let log = self.log();
        let tx = log.events.as_ref().expect("no session connected");
        tx.send(event).expect("client dropped its events");
    }

    pub fn emit_message(&self, message: ServerMessage) {
        self.emit(SessionEvent::Message(message));
    }

    pub fn sent_count(&self) -> usize {
        self.log().sent.len()
    }

    pub fn closes(&self) -> usize {
        self.log().closes
    }
}

#[async_trait]
impl SessionConnector for FakeRemote {
    async fn connect(&self, request: ConnectRequest) -> Result<Connection> {
        let mut log = self.log();
        log.connects += 1;
        log.requests.push(request);

        if self.refuse {
            return Err(Error::Session("connection refused".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if !self.manual_open {
            tx.send(SessionEvent::Open).expect("receiver alive");
        }
        log.events = Some(tx);

        Ok(Connection {
            session: Arc::new(FakeSession {
                log: Arc::clone(&self.log),
                fail_close: self.fail_close,
                close_delay: self.close_delay,
            }),
            events: rx,
        })
    }
}

struct FakeSession {
    log: Arc<Mutex<RemoteLog>>,
    fail_close: bool,
    close_delay: Option<Duration>,
}

#[async_trait]
impl RealtimeSession for FakeSession {
    async fn send_realtime_input(&self, media: MediaBlob) -> Result<()> {
        lock(&self.log).sent.push(media);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(delay) = self.close_delay {
            tokio::time::sleep(delay).await;
        }
        lock(&self.log).closes += 1;
        if self.fail_close {
            return Err(Error::Session("socket already reset".to_string()));
        }
        Ok(())
    }
}

/// What the fake hardware saw
#[derive(Default)]
pub struct DeviceLog {
    pub mic_opened: usize,
    pub mic_stopped: usize,
    pub camera_opened: usize,
    pub camera_stopped: usize,
    pub frames: usize,
    pub outputs_opened: usize,
    pub outputs_closed: usize,
    /// `(id, start, duration)` of every started buffer
    pub started: Vec<(HandleId, f64, f64)>,
    pub stopped: Vec<HandleId>,
    pub audio_tx: Option<mpsc::UnboundedSender<Vec<f32>>>,
    pub ended_tx: Option<mpsc::UnboundedSender<HandleId>>,
}

/// Fake microphone, camera, and speaker with a manual clock
#[derive(Clone, Default)]
pub struct FakeDevices {
    log: Arc<Mutex<DeviceLog>>,
    clock: Arc<Mutex<f64>>,
    deny_microphone: bool,
    deny_camera: bool,
}

impl FakeDevices {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn deny_microphone(mut self) -> Self {
        self.deny_microphone = true;
        self
    }

    #[must_use]
    pub fn deny_camera(mut self) -> Self {
        self.deny_camera = true;
        self
    }

    pub fn log(&self) -> MutexGuard<'_, DeviceLog> {
        lock(&self.log)
    }

    /// Move the output clock to `t` seconds
    pub fn set_clock(&self, t: f64) {
        *lock(&self.clock) = t;
    }

    /// Deliver one captured block as the microphone would
    pub fn capture(&self, samples: Vec<f32>) {
        let log = self.log();
        let tx = log.audio_tx.as_ref().expect("microphone not open");
        tx.send(samples).expect("controller dropped the microphone");
    }

    /// Report natural completion of a scheduled buffer
    pub fn finish(&self, id: HandleId) {
        let log = self.log();
        let tx = log.ended_tx.as_ref().expect("output not open");
        tx.send(id).expect("controller dropped the output");
    }
}

impl MediaDevices for FakeDevices {
    fn open_microphone(
        &mut self,
        _config: &AudioConfig,
        sink: mpsc::UnboundedSender<Vec<f32>>,
    ) -> Result<Box<dyn MediaTrack>> {
        if self.deny_microphone {
            return Err(Error::Permission("microphone access denied".to_string()));
        }
        let mut log = self.log();
        log.mic_opened += 1;
        log.audio_tx = Some(sink);
        Ok(Box::new(FakeMicrophone {
            log: Arc::clone(&self.log),
            live: true,
        }))
    }

    fn open_camera(&mut self, _config: &VideoConfig) -> Result<Box<dyn FrameSource>> {
        if self.deny_camera {
            return Err(Error::Permission("camera access denied".to_string()));
        }
        self.log().camera_opened += 1;
        Ok(Box::new(FakeCamera {
            log: Arc::clone(&self.log),
            live: true,
        }))
    }

    fn open_output(
        &mut self,
        ended: mpsc::UnboundedSender<HandleId>,
    ) -> Result<Box<dyn AudioOutput>> {
        let mut log = self.log();
        log.outputs_opened += 1;
        log.ended_tx = Some(ended);
        Ok(Box::new(FakeOutput {
            log: Arc::clone(&self.log),
            clock: Arc::clone(&self.clock),
        }))
    }
}

struct FakeMicrophone {
    log: Arc<Mutex<DeviceLog>>,
    live: bool,
}

impl MediaTrack for FakeMicrophone {
    fn stop(&mut self) {
        if std::mem::take(&mut self.live) {
            lock(&self.log).mic_stopped += 1;
        }
    }

    fn is_live(&self) -> bool {
        self.live
    }
}

struct FakeCamera {
    log: Arc<Mutex<DeviceLog>>,
    live: bool,
}

impl FrameSource for FakeCamera {
    fn capture_frame(&mut self) -> Result<RgbImage> {
        lock(&self.log).frames += 1;
        Ok(RgbImage::from_pixel(64, 48, image::Rgb([90, 120, 200])))
    }

    fn stop(&mut self) {
        if std::mem::take(&mut self.live) {
            lock(&self.log).camera_stopped += 1;
        }
    }

    fn is_live(&self) -> bool {
        self.live
    }
}

struct FakeOutput {
    log: Arc<Mutex<DeviceLog>>,
    clock: Arc<Mutex<f64>>,
}

impl AudioOutput for FakeOutput {
    fn now(&self) -> f64 {
        *lock(&self.clock)
    }

    fn start(&mut self, id: HandleId, buffer: AudioBuffer, at: f64) -> Result<()> {
        lock(&self.log).started.push((id, at, buffer.duration()));
        Ok(())
    }

    fn stop(&mut self, id: HandleId) -> Result<()> {
        lock(&self.log).stopped.push(id);
        Ok(())
    }

    fn close(&mut self) {
        lock(&self.log).outputs_closed += 1;
    }
}

/// Call settings for tests
#[must_use]
pub fn settings(video: bool) -> CallSettings {
    CallSettings {
        request: ConnectRequest {
            model: "models/test-live".to_string(),
            voice: None,
            system_instruction: None,
        },
        audio: AudioConfig::default(),
        video: VideoConfig {
            enabled: video,
            ..VideoConfig::default()
        },
        has_credential: true,
    }
}

/// Controller wired to fakes
#[must_use]
pub fn controller(
    settings: CallSettings,
    remote: &FakeRemote,
    devices: &FakeDevices,
) -> CallController<FakeDevices> {
    CallController::new(settings, Arc::new(remote.clone()), devices.clone())
}

/// Base64 PCM16 reply chunk of the given length at the output rate
#[must_use]
pub fn reply_chunk(seconds: f64) -> String {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let len = (f64::from(OUTPUT_SAMPLE_RATE) * seconds).round() as usize;
    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..len)
        .map(|i| (i as f32 * 0.05).sin() * 0.25)
        .collect();
    STANDARD.encode(encode_pcm16(&samples))
}
