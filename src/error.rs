//! Error types for livecall

use thiserror::Error;

/// Result type alias for livecall operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during a call or chat
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error (including a missing API key)
    #[error("configuration error: {0}")]
    Config(String),

    /// Camera or microphone could not be acquired
    #[error("permission error: {0}")]
    Permission(String),

    /// Remote session handshake or transport failure
    #[error("session error: {0}")]
    Session(String),

    /// Outbound payload could not be delivered
    #[error("send error: {0}")]
    Send(String),

    /// Inbound audio could not be decoded
    #[error("decode error: {0}")]
    Decode(String),

    /// Audio device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Camera or frame encoding error
    #[error("video error: {0}")]
    Video(String),

    /// Text chat request error
    #[error("chat error: {0}")]
    Chat(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Base64 decoding error
    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Image encoding error
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

impl Error {
    /// Short, non-technical message suitable for showing to the user
    #[must_use]
    pub const fn user_message(&self) -> &'static str {
        match self {
            Self::Config(_) => "The assistant is not configured. Check your API key.",
            Self::Permission(_) => "Camera or microphone access was denied.",
            Self::Session(_) | Self::Http(_) => "Could not connect to the assistant.",
            Self::Send(_) => "Some audio or video could not be sent.",
            Self::Decode(_) => "Some reply audio could not be played.",
            Self::Audio(_) => "There was a problem with your audio device.",
            Self::Video(_) | Self::Image(_) => "There was a problem with your camera.",
            Self::Chat(_) => "The assistant could not answer right now.",
            Self::Io(_) | Self::Serialization(_) | Self::Toml(_) | Self::Base64(_) => {
                "Something went wrong."
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_messages_are_short() {
        let errors = [
            Error::Config("missing key".to_string()),
            Error::Permission("denied".to_string()),
            Error::Session("handshake failed".to_string()),
            Error::Decode("odd byte count".to_string()),
        ];

        for error in &errors {
            let message = error.user_message();
            assert!(!message.is_empty());
            assert!(message.len() < 80);
            // Technical detail stays in Display, not in the user message
            assert!(!message.contains("handshake"));
        }
    }
}
