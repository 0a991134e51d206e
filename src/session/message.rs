//! Live session wire messages
//!
//! Client frames are JSON objects with a single top-level key (`setup` or
//! `realtimeInput`). Server frames carry `setupComplete` once the handshake
//! finishes, then `serverContent` with reply audio and control flags.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::MediaBlob;

/// Message sent from the client to the live session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMessage {
    /// Session configuration, sent once as the first frame
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup: Option<Setup>,
    /// Captured media for the model
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realtime_input: Option<RealtimeInput>,
}

impl ClientMessage {
    /// Session setup frame
    #[must_use]
    pub const fn setup(setup: Setup) -> Self {
        Self {
            setup: Some(setup),
            realtime_input: None,
        }
    }

    /// Realtime media frame
    #[must_use]
    pub fn media(blob: MediaBlob) -> Self {
        Self {
            setup: None,
            realtime_input: Some(RealtimeInput {
                media_chunks: vec![blob],
            }),
        }
    }
}

/// First frame of a session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    /// Model resource name, e.g. `models/gemini-2.0-flash-exp`
    pub model: String,
    /// Response modalities and speech settings
    pub generation_config: Value,
    /// Optional system prompt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
}

/// Streamed media input
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    /// Encoded audio or video payloads
    pub media_chunks: Vec<MediaBlob>,
}

/// Content made of parts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Content {
    /// Text and media parts in order
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    /// Content holding a single text part
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            parts: vec![Part {
                text: Some(text.into()),
                inline_data: None,
            }],
        }
    }
}

/// One part of a content block
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    /// Text, if this is a text part
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Embedded media, if this is a media part
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,
}

/// Base64 media embedded in a part
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    /// MIME type, e.g. `audio/pcm;rate=24000`
    #[serde(default)]
    pub mime_type: String,
    /// Base64 payload
    pub data: String,
}

/// Message received from the live session
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    /// Present once the handshake has finished
    #[serde(default)]
    pub setup_complete: Option<Value>,
    /// Model output for the current turn
    #[serde(default)]
    pub server_content: Option<ServerContent>,
}

/// Model output and control flags
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    /// Reply parts, usually inline audio
    #[serde(default)]
    pub model_turn: Option<Content>,
    /// The user spoke over the reply; queued playback must stop
    #[serde(default)]
    pub interrupted: bool,
    /// The model finished its turn
    #[serde(default)]
    pub turn_complete: bool,
}

impl ServerMessage {
    /// Parse a raw JSON frame
    ///
    /// # Errors
    ///
    /// Returns error if the frame is not valid JSON for this shape
    pub fn parse(raw: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Message carrying one base64 audio chunk
    #[must_use]
    pub fn audio(data: impl Into<String>) -> Self {
        Self {
            setup_complete: None,
            server_content: Some(ServerContent {
                model_turn: Some(Content {
                    parts: vec![Part {
                        text: None,
                        inline_data: Some(InlineData {
                            mime_type: "audio/pcm;rate=24000".to_string(),
                            data: data.into(),
                        }),
                    }],
                }),
                interrupted: false,
                turn_complete: false,
            }),
        }
    }

    /// Message signalling an interruption
    #[must_use]
    pub fn interrupted() -> Self {
        Self {
            setup_complete: None,
            server_content: Some(ServerContent {
                model_turn: None,
                interrupted: true,
                turn_complete: false,
            }),
        }
    }

    /// Whether this frame completes the session handshake
    #[must_use]
    pub const fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Base64 audio chunks in arrival order
    pub fn audio_chunks(&self) -> impl Iterator<Item = &str> {
        self.server_content
            .iter()
            .filter_map(|c| c.model_turn.as_ref())
            .flat_map(|turn| turn.parts.iter())
            .filter_map(|part| part.inline_data.as_ref())
            .filter(|data| data.mime_type.is_empty() || data.mime_type.starts_with("audio/"))
            .map(|data| data.data.as_str())
    }

    /// Whether the remote side interrupted the current reply
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.server_content.as_ref().is_some_and(|c| c.interrupted)
    }

    /// Whether the current model turn is finished
    #[must_use]
    pub fn is_turn_complete(&self) -> bool {
        self.server_content.as_ref().is_some_and(|c| c.turn_complete)
    }
}
