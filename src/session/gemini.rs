//! Gemini Live connector
//!
//! Opens a WebSocket to the Live API, sends the setup frame, and translates
//! server frames into [`SessionEvent`]s on a background reader task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::message::{ClientMessage, Content, ServerMessage, Setup};
use super::{ConnectRequest, Connection, MediaBlob, RealtimeSession, SessionConnector, SessionEvent};
use crate::{Error, Result};

/// Live API WebSocket endpoint
pub const LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Opens Gemini Live sessions with an API key
pub struct GeminiConnector {
    api_key: SecretString,
    endpoint: String,
}

impl GeminiConnector {
    /// Create a connector for the public Live endpoint
    #[must_use]
    pub fn new(api_key: &SecretString) -> Self {
        Self {
            api_key: SecretString::from(api_key.expose_secret().to_string()),
            endpoint: LIVE_ENDPOINT.to_string(),
        }
    }

    /// Override the endpoint (e.g. a regional or proxy URL)
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn url(&self) -> Result<url::Url> {
        url::Url::parse_with_params(&self.endpoint, &[("key", self.api_key.expose_secret())])
            .map_err(|e| Error::Config(format!("invalid live endpoint: {e}")))
    }
}

/// Build the setup frame for a request
pub(crate) fn build_setup(request: &ConnectRequest) -> Setup {
    let mut generation_config = json!({
        "responseModalities": ["AUDIO"],
    });

    if let Some(voice) = &request.voice {
        generation_config["speechConfig"] = json!({
            "voiceConfig": {
                "prebuiltVoiceConfig": {
                    "voiceName": voice
                }
            }
        });
    }

    let model = if request.model.starts_with("models/") {
        request.model.clone()
    } else {
        format!("models/{}", request.model)
    };

    Setup {
        model,
        generation_config,
        system_instruction: request.system_instruction.as_deref().map(Content::text),
    }
}

#[async_trait]
impl SessionConnector for GeminiConnector {
    async fn connect(&self, request: ConnectRequest) -> Result<Connection> {
        let url = self.url()?;
        let (ws, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::Session(format!("websocket connect failed: {e}")))?;

        let (sink, source) = ws.split();
        let session = Arc::new(GeminiSession {
            session_id: uuid::Uuid::new_v4().to_string(),
            sink: Mutex::new(sink),
            closed: AtomicBool::new(false),
            reader: StdMutex::new(None),
        });

        tracing::info!(
            session_id = %session.session_id,
            model = %request.model,
            "sending live session setup"
        );
        session
            .send(&ClientMessage::setup(build_setup(&request)))
            .await
            .map_err(|e| Error::Session(format!("setup failed: {e}")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(read_loop(session.session_id.clone(), source, tx));
        *session
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        Ok(Connection {
            session,
            events: rx,
        })
    }
}

/// One open Gemini Live WebSocket
struct GeminiSession {
    session_id: String,
    sink: Mutex<WsSink>,
    closed: AtomicBool,
    reader: StdMutex<Option<JoinHandle<()>>>,
}

impl GeminiSession {
    async fn send(&self, message: &ClientMessage) -> Result<()> {
        let text = serde_json::to_string(message)?;
        self.sink
            .lock()
            .await
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| Error::Send(e.to_string()))
    }

    fn abort_reader(&self) {
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = reader {
            handle.abort();
        }
    }
}

#[async_trait]
impl RealtimeSession for GeminiSession {
    async fn send_realtime_input(&self, media: MediaBlob) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Send("session is closed".to_string()));
        }
        self.send(&ClientMessage::media(media)).await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let result = self
            .sink
            .lock()
            .await
            .close()
            .await
            .map_err(|e| Error::Session(format!("close failed: {e}")));
        self.abort_reader();

        tracing::debug!(session_id = %self.session_id, "live session closed");
        result
    }
}

impl Drop for GeminiSession {
    fn drop(&mut self) {
        self.abort_reader();
    }
}

/// Translate server frames into session events until the socket ends
async fn read_loop(
    session_id: String,
    mut source: WsSource,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    while let Some(frame) = source.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text.as_str().to_string(),
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(%session_id, error = %e, "non-UTF-8 binary frame ignored");
                    continue;
                }
            },
            Ok(Message::Close(frame)) => {
                let reason = frame
                    .map(|f| f.reason.as_str().to_string())
                    .filter(|r| !r.is_empty());
                tracing::debug!(%session_id, ?reason, "server closed live session");
                let _ = events.send(SessionEvent::Close(reason));
                return;
            }
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(%session_id, error = %e, "live session transport error");
                let _ = events.send(SessionEvent::Error(e.to_string()));
                return;
            }
        };

        let event = match ServerMessage::parse(&text) {
            Ok(message) if message.is_setup_complete() => SessionEvent::Open,
            Ok(message) => SessionEvent::Message(message),
            Err(e) => {
                tracing::warn!(%session_id, error = %e, "unparseable server frame ignored");
                continue;
            }
        };

        if events.send(event).is_err() {
            return;
        }
    }

    let _ = events.send(SessionEvent::Close(None));
}
