//! Configuration management for livecall
//!
//! Values resolve as env > TOML file > default.

pub mod file;

use std::time::Duration;

use secrecy::SecretString;

use crate::voice::{INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};
use crate::{Error, Result};

use file::LivecallConfigFile;

/// Default live model
pub const DEFAULT_LIVE_MODEL: &str = "models/gemini-2.0-flash-live-001";

/// Default text chat model
pub const DEFAULT_CHAT_MODEL: &str = "gemini-2.5-flash";

/// Samples per outbound audio buffer
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Default time between camera frames (2 FPS)
pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(500);

/// Default JPEG quality for camera frames
pub const DEFAULT_JPEG_QUALITY: u8 = 60;

/// Default downsample factor for camera frames
pub const DEFAULT_FRAME_SCALE: f32 = 0.5;

/// Prior turns sent with each chat request
pub const DEFAULT_HISTORY_TURNS: usize = 5;

/// livecall configuration
#[derive(Debug, Default)]
pub struct Config {
    /// API key for the generative AI service
    pub api_key: Option<SecretString>,

    /// Live session configuration
    pub session: SessionConfig,

    /// Audio pipeline configuration
    pub audio: AudioConfig,

    /// Camera frame configuration
    pub video: VideoConfig,

    /// Text chat configuration
    pub chat: ChatConfig,
}

/// Live session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Live model identifier
    pub model: String,

    /// Prebuilt voice name for spoken replies
    pub voice: Option<String>,

    /// System instruction sent with the session setup
    pub system_instruction: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_LIVE_MODEL.to_string(),
            voice: None,
            system_instruction: None,
        }
    }
}

/// Audio pipeline configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioConfig {
    /// Outbound sample rate (Hz)
    pub input_sample_rate: u32,

    /// Inbound sample rate (Hz)
    pub output_sample_rate: u32,

    /// Samples per outbound buffer
    pub buffer_size: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: INPUT_SAMPLE_RATE,
            output_sample_rate: OUTPUT_SAMPLE_RATE,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Camera frame configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoConfig {
    /// Enable camera frames
    pub enabled: bool,

    /// Time between captured frames
    pub frame_interval: Duration,

    /// JPEG quality (1-100)
    pub jpeg_quality: u8,

    /// Downsample factor applied to width and height
    pub scale: f32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            enabled: cfg!(feature = "camera"),
            frame_interval: DEFAULT_FRAME_INTERVAL,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            scale: DEFAULT_FRAME_SCALE,
        }
    }
}

/// Text chat configuration
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Chat model identifier
    pub model: String,

    /// Prior turns sent with each request
    pub history_turns: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_CHAT_MODEL.to_string(),
            history_turns: DEFAULT_HISTORY_TURNS,
        }
    }
}

impl Config {
    /// Load configuration from the environment and config file
    ///
    /// # Errors
    ///
    /// Returns error if a configured value is out of range
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        let config = Self::from_sources(fc, |key| std::env::var(key).ok());
        config.validate()?;

        tracing::debug!(
            model = %config.session.model,
            video = config.video.enabled,
            has_api_key = config.api_key.is_some(),
            "configuration loaded"
        );

        Ok(config)
    }

    /// Build configuration from a parsed file and an env lookup
    #[must_use]
    pub fn from_sources(fc: LivecallConfigFile, env: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |v: String| if v.trim().is_empty() { None } else { Some(v) };

        let api_key = env("GEMINI_API_KEY")
            .and_then(non_empty)
            .or_else(|| env("API_KEY").and_then(non_empty))
            .or_else(|| fc.api_key.and_then(non_empty))
            .map(SecretString::from);

        let session = SessionConfig {
            model: env("LIVECALL_MODEL")
                .or(fc.session.model)
                .unwrap_or_else(|| DEFAULT_LIVE_MODEL.to_string()),
            voice: env("LIVECALL_VOICE").or(fc.session.voice),
            system_instruction: env("LIVECALL_SYSTEM_INSTRUCTION")
                .or(fc.session.system_instruction),
        };

        let audio = AudioConfig {
            buffer_size: fc.audio.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE),
            ..AudioConfig::default()
        };

        let defaults = VideoConfig::default();
        let video = VideoConfig {
            enabled: env("LIVECALL_VIDEO")
                .map(|v| matches!(v.as_str(), "1" | "true" | "yes" | "on"))
                .or(fc.video.enabled)
                .unwrap_or(defaults.enabled),
            frame_interval: env("LIVECALL_FRAME_INTERVAL_MS")
                .and_then(|v| v.parse().ok())
                .or(fc.video.frame_interval_ms)
                .map_or(defaults.frame_interval, Duration::from_millis),
            jpeg_quality: env("LIVECALL_JPEG_QUALITY")
                .and_then(|v| v.parse().ok())
                .or(fc.video.jpeg_quality)
                .unwrap_or(defaults.jpeg_quality),
            scale: fc.video.scale.unwrap_or(defaults.scale),
        };

        let chat = ChatConfig {
            model: env("LIVECALL_CHAT_MODEL")
                .or(fc.chat.model)
                .unwrap_or_else(|| DEFAULT_CHAT_MODEL.to_string()),
            history_turns: fc.chat.history_turns.unwrap_or(DEFAULT_HISTORY_TURNS),
        };

        Self {
            api_key,
            session,
            audio,
            video,
            chat,
        }
    }

    /// Check that tuning values are in range
    ///
    /// # Errors
    ///
    /// Returns error describing the first invalid value
    pub fn validate(&self) -> Result<()> {
        if self.audio.buffer_size == 0 {
            return Err(Error::Config("audio.buffer_size must be non-zero".to_string()));
        }
        if self.video.frame_interval.is_zero() {
            return Err(Error::Config(
                "video.frame_interval_ms must be non-zero".to_string(),
            ));
        }
        if !(1..=100).contains(&self.video.jpeg_quality) {
            return Err(Error::Config(format!(
                "video.jpeg_quality must be 1-100, got {}",
                self.video.jpeg_quality
            )));
        }
        if !(self.video.scale > 0.0 && self.video.scale <= 1.0) {
            return Err(Error::Config(format!(
                "video.scale must be in (0, 1], got {}",
                self.video.scale
            )));
        }
        if self.session.model.trim().is_empty() {
            return Err(Error::Config("session.model must not be empty".to_string()));
        }
        Ok(())
    }

    /// Return the API key or the error that blocks opening a session
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if no key is configured
    pub fn require_api_key(&self) -> Result<&SecretString> {
        self.api_key.as_ref().ok_or_else(|| {
            Error::Config("no API key configured (set GEMINI_API_KEY)".to_string())
        })
    }
}
