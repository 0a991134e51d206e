//! Remote live session abstraction
//!
//! The call pipeline only needs a handful of capabilities from the remote
//! side: open a session, push realtime media into it, receive its events,
//! and close it. [`SessionConnector`] and [`RealtimeSession`] capture exactly
//! that, so the pipeline can run against the Gemini Live connector or a
//! scripted fake.

mod gemini;
mod message;

pub use gemini::GeminiConnector;
pub use message::{
    ClientMessage, Content, InlineData, Part, RealtimeInput, ServerContent, ServerMessage, Setup,
};

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::Result;
use crate::config::SessionConfig;

/// A unit of realtime input: base64 data tagged with its MIME type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaBlob {
    /// MIME type (e.g. `audio/pcm;rate=16000`, `image/jpeg`)
    pub mime_type: String,
    /// Base64-encoded payload
    pub data: String,
}

/// Lifecycle and data events emitted by a session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Handshake finished; the session accepts input
    Open,
    /// Server frame
    Message(ServerMessage),
    /// Remote side closed the session
    Close(Option<String>),
    /// Transport or protocol failure
    Error(String),
}

/// An open live session
#[async_trait]
pub trait RealtimeSession: Send + Sync {
    /// Push one unit of realtime media
    async fn send_realtime_input(&self, media: MediaBlob) -> Result<()>;

    /// Close the session; closing twice is not an error
    async fn close(&self) -> Result<()>;
}

/// What to open a session with
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Model identifier
    pub model: String,
    /// Prebuilt voice name for spoken replies
    pub voice: Option<String>,
    /// System instruction
    pub system_instruction: Option<String>,
}

impl From<&SessionConfig> for ConnectRequest {
    fn from(config: &SessionConfig) -> Self {
        Self {
            model: config.model.clone(),
            voice: config.voice.clone(),
            system_instruction: config.system_instruction.clone(),
        }
    }
}

/// A session handle plus the stream of its events
pub struct Connection {
    /// Handle for sending input and closing
    pub session: Arc<dyn RealtimeSession>,
    /// Events in the order the remote side produced them
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

/// Opens live sessions
#[async_trait]
pub trait SessionConnector: Send + Sync {
    /// Open a session
    ///
    /// The returned connection emits [`SessionEvent::Open`] once the
    /// handshake completes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Session` if the transport cannot be established
    async fn connect(&self, request: ConnectRequest) -> Result<Connection>;
}
