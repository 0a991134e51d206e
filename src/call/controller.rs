//! Call controller
//!
//! One [`CallController`] owns everything that lives for a call: the
//! captured tracks, the remote session, the outbound dispatcher, and the
//! playback scheduler. Events are handled one at a time on the caller's
//! task, so no two handlers ever race on call state.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::devices::{MediaDevices, MediaTrack, SystemDevices};
use super::dispatch::{DispatchStats, Dispatcher};
use super::state::{CallGuard, ConnectionState, StateMachine};
use crate::config::{AudioConfig, Config, VideoConfig};
use crate::session::{
    ConnectRequest, Connection, RealtimeSession, ServerMessage, SessionConnector, SessionEvent,
};
use crate::video::{FrameSource, frame_blob};
use crate::voice::{
    AudioOutput, HandleId, PlaybackScheduler, audio_blob, decode_base64_chunk,
};
use crate::{Error, Result};

/// How long teardown waits for an in-flight connect before abandoning it
const CONNECT_GRACE: Duration = Duration::from_secs(5);

/// Everything a call needs from configuration
#[derive(Debug, Clone)]
pub struct CallSettings {
    /// Session to open
    pub request: ConnectRequest,
    /// Capture and playback parameters
    pub audio: AudioConfig,
    /// Camera frame parameters
    pub video: VideoConfig,
    /// Whether an API key is configured
    pub has_credential: bool,
}

impl CallSettings {
    /// Derive call settings from loaded configuration
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            request: ConnectRequest::from(&config.session),
            audio: config.audio,
            video: config.video,
            has_credential: config.api_key.is_some(),
        }
    }
}

/// What a single controller step did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallUpdate {
    /// Transport is up; waiting for the handshake
    SessionOpened,
    /// Handshake complete; capture is armed
    Connected,
    /// A server message was applied to playback
    Reply {
        /// Chunks scheduled from this message
        scheduled: usize,
        /// Chunks that failed to decode or schedule
        failed: usize,
        /// Whether playback was interrupted
        interrupted: bool,
    },
    /// A reply chunk finished playing
    PlaybackFinished(HandleId),
    /// A microphone block was captured
    AudioCaptured {
        /// Whether it was queued for sending
        forwarded: bool,
    },
    /// The frame timer fired
    FrameCaptured {
        /// Whether a frame was queued for sending
        forwarded: bool,
    },
    /// A server message arrived while the call was not connected
    Discarded,
    /// The call is over
    Ended(ConnectionState),
}

/// Drives one live call at a time
pub struct CallController<D = SystemDevices> {
    settings: CallSettings,
    connector: Arc<dyn SessionConnector>,
    devices: D,
    state: StateMachine,
    call: Option<ActiveCall>,
    last_stats: Option<Arc<DispatchStats>>,
}

/// Resources held for the duration of one call
struct ActiveCall {
    token: CancellationToken,
    guard: CallGuard,
    pending: Option<JoinHandle<Result<Connection>>>,
    session: Option<Arc<dyn RealtimeSession>>,
    events: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    dispatcher: Option<Dispatcher>,
    microphone: Box<dyn MediaTrack>,
    audio_rx: mpsc::UnboundedReceiver<Vec<f32>>,
    camera: Option<Box<dyn FrameSource>>,
    frame_timer: Option<Interval>,
    playback: PlaybackScheduler<Box<dyn AudioOutput>>,
    output_rate: u32,
    ended_rx: mpsc::UnboundedReceiver<HandleId>,
}

/// What woke the controller
enum Wake {
    Connect(Result<Connection>),
    Session(Option<SessionEvent>),
    PlaybackEnded(HandleId),
    Audio(Vec<f32>),
    Frame,
    Idle,
}

#[allow(clippy::future_not_send)]
impl<D: MediaDevices> CallController<D> {
    /// Create an idle controller
    #[must_use]
    pub fn new(settings: CallSettings, connector: Arc<dyn SessionConnector>, devices: D) -> Self {
        Self {
            settings,
            connector,
            devices,
            state: StateMachine::new(),
            call: None,
            last_stats: None,
        }
    }

    /// Current connection state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state.state()
    }

    /// Observe state changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Short user-visible message for the last failure
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.state.last_error()
    }

    /// Whether a call is in progress
    #[must_use]
    pub const fn in_call(&self) -> bool {
        self.call.is_some()
    }

    /// Playback scheduler of the current call
    #[must_use]
    pub fn playback(&self) -> Option<&PlaybackScheduler<Box<dyn AudioOutput>>> {
        self.call.as_ref().map(|call| &call.playback)
    }

    /// Outbound counters for the current or most recent call
    #[must_use]
    pub fn dispatch_stats(&self) -> Option<Arc<DispatchStats>> {
        self.call
            .as_ref()
            .and_then(|call| call.dispatcher.as_ref())
            .map(Dispatcher::stats)
            .or_else(|| self.last_stats.clone())
    }

    /// The media device source
    #[must_use]
    pub const fn devices(&self) -> &D {
        &self.devices
    }

    /// Start a call
    ///
    /// Acquires the microphone, then the camera (if enabled), then the
    /// speaker, and begins connecting in the background. Must be called
    /// from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if no API key is configured, `Error::Permission`
    /// if a device cannot be acquired, or `Error::Session` if a call is
    /// already in progress
    pub fn start(&mut self) -> Result<()> {
        if !self.settings.has_credential {
            let err = Error::Config("no API key configured (set GEMINI_API_KEY)".to_string());
            self.state.mark_error(err.user_message());
            return Err(err);
        }

        self.state.begin_connect()?;

        let call = match self.acquire() {
            Ok(call) => call,
            Err(e) => {
                tracing::error!(error = %e, "could not acquire media devices");
                self.state.mark_error(e.user_message());
                return Err(e);
            }
        };

        tracing::info!(
            model = %self.settings.request.model,
            video = call.camera.is_some(),
            "call starting"
        );
        self.call = Some(call);
        Ok(())
    }

    fn acquire(&mut self) -> Result<ActiveCall> {
        let (audio_tx, audio_rx) = mpsc::unbounded_channel();
        let mut microphone = self.devices.open_microphone(&self.settings.audio, audio_tx)?;

        let mut camera = if self.settings.video.enabled {
            match self.devices.open_camera(&self.settings.video) {
                Ok(camera) => Some(camera),
                Err(e) => {
                    microphone.stop();
                    return Err(e);
                }
            }
        } else {
            None
        };

        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        let output = match self.devices.open_output(ended_tx) {
            Ok(output) => output,
            Err(e) => {
                if let Some(camera) = camera.as_mut() {
                    camera.stop();
                }
                microphone.stop();
                return Err(e);
            }
        };

        let token = CancellationToken::new();
        let guard = CallGuard::new(token.clone(), self.state.subscribe());

        let connector = Arc::clone(&self.connector);
        let request = self.settings.request.clone();
        let pending = tokio::spawn(async move { connector.connect(request).await });

        Ok(ActiveCall {
            token,
            guard,
            pending: Some(pending),
            session: None,
            events: None,
            dispatcher: None,
            microphone,
            audio_rx,
            camera,
            frame_timer: None,
            playback: PlaybackScheduler::new(output),
            output_rate: self.settings.audio.output_sample_rate,
            ended_rx,
        })
    }

    /// Wait for and handle the next call event
    ///
    /// Returns `None` when no call is in progress.
    pub async fn step(&mut self) -> Option<CallUpdate> {
        let wake = self.next_wake().await?;
        Some(self.handle(wake).await)
    }

    /// Wait for the next thing to act on; cancel safe
    async fn next_wake(&mut self) -> Option<Wake> {
        let call = self.call.as_mut()?;

        Some(tokio::select! {
            biased;
            joined = join_pending(&mut call.pending), if call.pending.is_some() => {
                Wake::Connect(joined)
            }
            event = recv_event(&mut call.events), if call.events.is_some() => Wake::Session(event),
            Some(id) = call.ended_rx.recv() => Wake::PlaybackEnded(id),
            Some(samples) = call.audio_rx.recv() => Wake::Audio(samples),
            () = tick(&mut call.frame_timer), if call.frame_timer.is_some() => Wake::Frame,
            else => Wake::Idle,
        })
    }

    /// Run the current call until it ends or `shutdown` resolves
    ///
    /// Resolving `shutdown` hangs up. Shutdown is only observed between
    /// events, so a teardown already under way finishes first. Returns the
    /// final state.
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) -> ConnectionState {
        tokio::pin!(shutdown);

        while self.call.is_some() {
            let next = tokio::select! {
                () = &mut shutdown => None,
                wake = self.next_wake() => Some(wake),
            };

            let wake = match next {
                None => {
                    self.hang_up().await;
                    break;
                }
                Some(None) => break,
                Some(Some(wake)) => wake,
            };

            match self.handle(wake).await {
                CallUpdate::Ended(state) => tracing::info!(%state, "call ended"),
                update => tracing::trace!(?update, "call step"),
            }
        }

        self.state()
    }

    /// End the call from the local side
    ///
    /// Calling this with no call in progress is a no-op.
    pub async fn hang_up(&mut self) {
        if self.call.is_some() {
            tracing::info!("hanging up");
        }
        self.teardown().await;
    }

    async fn handle(&mut self, wake: Wake) -> CallUpdate {
        let Some(call) = self.call.as_mut() else {
            return CallUpdate::Ended(self.state.state());
        };

        match wake {
            Wake::Connect(Ok(connection)) => {
                call.attach(connection);
                CallUpdate::SessionOpened
            }
            Wake::Connect(Err(e)) => self.fail(&e).await,
            Wake::Session(Some(SessionEvent::Open)) => {
                if self.state.mark_connected() {
                    call.arm(&self.settings.video);
                    tracing::info!("call connected");
                    CallUpdate::Connected
                } else {
                    CallUpdate::Discarded
                }
            }
            Wake::Session(Some(SessionEvent::Message(message))) => call.play_reply(&message),
            Wake::Session(Some(SessionEvent::Close(reason))) => {
                tracing::info!(?reason, "session closed by remote");
                self.teardown().await;
                CallUpdate::Ended(self.state.state())
            }
            Wake::Session(None) => {
                tracing::info!("session event stream ended");
                self.teardown().await;
                CallUpdate::Ended(self.state.state())
            }
            Wake::Session(Some(SessionEvent::Error(message))) => {
                self.fail(&Error::Session(message)).await
            }
            Wake::PlaybackEnded(id) => {
                call.playback.finished(id);
                CallUpdate::PlaybackFinished(id)
            }
            Wake::Audio(samples) => CallUpdate::AudioCaptured {
                forwarded: call.forward_audio(&samples),
            },
            Wake::Frame => CallUpdate::FrameCaptured {
                forwarded: call.forward_frame(&self.settings.video),
            },
            Wake::Idle => {
                self.fail(&Error::Audio("all call inputs closed".to_string()))
                    .await
            }
        }
    }

    async fn fail(&mut self, error: &Error) -> CallUpdate {
        tracing::error!(error = %error, "call failed");
        self.state.mark_error(error.user_message());
        self.teardown().await;
        CallUpdate::Ended(self.state.state())
    }

    /// Release every resource held by the call
    ///
    /// Marks the call not-connected, closes the session (awaiting a
    /// pending connect first), then releases playback and capture. Safe to
    /// call more than once; an `Error` state is preserved.
    pub async fn teardown(&mut self) {
        self.state.mark_disconnected();

        let Some(mut call) = self.call.take() else {
            return;
        };
        call.token.cancel();

        close_remote(call.session.take(), call.pending.take()).await;

        if let Some(dispatcher) = call.dispatcher.take() {
            self.last_stats = Some(dispatcher.stats());
            dispatcher.join().await;
        }

        call.release_local();
        tracing::debug!(state = %self.state.state(), "call torn down");
    }
}

impl ActiveCall {
    fn attach(&mut self, connection: Connection) {
        self.dispatcher = Some(Dispatcher::spawn(
            Arc::clone(&connection.session),
            self.guard.clone(),
        ));
        self.session = Some(connection.session);
        self.events = Some(connection.events);
    }

    /// Start forwarding capture once the session is open
    fn arm(&mut self, video: &VideoConfig) {
        // Blocks captured during the handshake are not sent
        while self.audio_rx.try_recv().is_ok() {}

        if self.camera.is_some() {
            let mut timer = tokio::time::interval(video.frame_interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            self.frame_timer = Some(timer);
        }
    }

    fn play_reply(&mut self, message: &ServerMessage) -> CallUpdate {
        if !self.guard.is_live() {
            tracing::trace!("server message after disconnect discarded");
            return CallUpdate::Discarded;
        }

        let mut scheduled = 0;
        let mut failed = 0;
        for data in message.audio_chunks() {
            match decode_base64_chunk(data, self.output_rate)
                .and_then(|buffer| self.playback.schedule(buffer))
            {
                Ok(_) => scheduled += 1,
                Err(e) => {
                    failed += 1;
                    tracing::warn!(error = %e, "reply chunk dropped");
                }
            }
        }

        let interrupted = message.is_interrupted();
        if interrupted {
            self.playback.interrupt();
        }
        if message.is_turn_complete() {
            tracing::debug!(active = self.playback.active_count(), "model turn complete");
        }

        CallUpdate::Reply {
            scheduled,
            failed,
            interrupted,
        }
    }

    fn forward_audio(&self, samples: &[f32]) -> bool {
        if !self.guard.is_live() {
            return false;
        }
        self.dispatcher
            .as_ref()
            .is_some_and(|dispatcher| dispatcher.dispatch(audio_blob(samples)))
    }

    fn forward_frame(&mut self, video: &VideoConfig) -> bool {
        if !self.guard.is_live() {
            return false;
        }
        let (Some(camera), Some(dispatcher)) = (self.camera.as_mut(), self.dispatcher.as_ref())
        else {
            return false;
        };

        match camera
            .capture_frame()
            .and_then(|frame| frame_blob(&frame, video))
        {
            Ok(blob) => dispatcher.dispatch(blob),
            Err(e) => {
                tracing::warn!(error = %e, "camera frame skipped");
                false
            }
        }
    }

    /// Stop playback and capture; no awaits
    fn release_local(&mut self) {
        self.token.cancel();
        self.playback.close();
        self.frame_timer = None;
        self.microphone.stop();
        if let Some(camera) = self.camera.as_mut() {
            camera.stop();
        }
    }
}

impl<D> Drop for CallController<D> {
    fn drop(&mut self) {
        let Some(mut call) = self.call.take() else {
            return;
        };
        self.state.mark_disconnected();
        call.release_local();

        let session = call.session.take();
        let pending = call.pending.take();
        if session.is_none() && pending.is_none() {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(close_remote(session, pending));
            }
            Err(_) => {
                if let Some(pending) = pending {
                    pending.abort();
                }
                tracing::debug!("no runtime at drop, session left to its own teardown");
            }
        }
    }
}

/// Close the session, waiting briefly for a connect still in flight
async fn close_remote(
    mut session: Option<Arc<dyn RealtimeSession>>,
    pending: Option<JoinHandle<Result<Connection>>>,
) {
    if let Some(mut pending) = pending {
        match tokio::time::timeout(CONNECT_GRACE, &mut pending).await {
            Ok(Ok(Ok(connection))) => session = Some(connection.session),
            Ok(Ok(Err(e))) => tracing::debug!(error = %e, "pending connect failed during teardown"),
            Ok(Err(e)) => tracing::debug!(error = %e, "pending connect task ended abnormally"),
            Err(_) => {
                pending.abort();
                tracing::warn!("pending connect abandoned during teardown");
            }
        }
    }

    if let Some(session) = session
        && let Err(e) = session.close().await
    {
        tracing::debug!(error = %e, "session close failed during teardown");
    }
}

async fn join_pending(pending: &mut Option<JoinHandle<Result<Connection>>>) -> Result<Connection> {
    let Some(handle) = pending.as_mut() else {
        return std::future::pending().await;
    };
    let joined = handle.await;
    *pending = None;
    joined.map_err(|e| Error::Session(format!("connect task failed: {e}")))?
}

async fn recv_event(
    events: &mut Option<mpsc::UnboundedReceiver<SessionEvent>>,
) -> Option<SessionEvent> {
    match events.as_mut() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn tick(timer: &mut Option<Interval>) {
    match timer.as_mut() {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}
