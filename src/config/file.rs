//! TOML configuration file loading
//!
//! Supports `~/.config/omni/livecall/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::PathBuf;

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct LivecallConfigFile {
    /// API key for the generative AI service
    #[serde(default)]
    pub api_key: Option<String>,

    /// Live session configuration
    #[serde(default)]
    pub session: SessionFileConfig,

    /// Audio pipeline configuration
    #[serde(default)]
    pub audio: AudioFileConfig,

    /// Camera frame configuration
    #[serde(default)]
    pub video: VideoFileConfig,

    /// Text chat configuration
    #[serde(default)]
    pub chat: ChatFileConfig,
}

/// Live session configuration
#[derive(Debug, Default, Deserialize)]
pub struct SessionFileConfig {
    /// Live model identifier
    pub model: Option<String>,

    /// Prebuilt voice name for spoken replies
    pub voice: Option<String>,

    /// System instruction sent with the session setup
    pub system_instruction: Option<String>,
}

/// Audio pipeline configuration
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    /// Samples per outbound audio buffer
    pub buffer_size: Option<usize>,
}

/// Camera frame configuration
#[derive(Debug, Default, Deserialize)]
pub struct VideoFileConfig {
    /// Enable camera frames
    pub enabled: Option<bool>,

    /// Milliseconds between captured frames
    pub frame_interval_ms: Option<u64>,

    /// JPEG quality (1-100)
    pub jpeg_quality: Option<u8>,

    /// Downsample factor applied to width and height
    pub scale: Option<f32>,
}

/// Text chat configuration
#[derive(Debug, Default, Deserialize)]
pub struct ChatFileConfig {
    /// Chat model identifier
    pub model: Option<String>,

    /// Prior turns sent with each request
    pub history_turns: Option<usize>,
}

/// Path to the config file
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("omni")
            .join("livecall")
            .join("config.toml")
    })
}

/// Load the config file, returning defaults if missing or unreadable
#[must_use]
pub fn load_config_file() -> LivecallConfigFile {
    let Some(path) = config_file_path() else {
        return LivecallConfigFile::default();
    };

    if !path.exists() {
        return LivecallConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(contents) => match parse_config_file(&contents) {
            Ok(fc) => {
                tracing::debug!(path = %path.display(), "loaded config file");
                fc
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                LivecallConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file, using defaults"
            );
            LivecallConfigFile::default()
        }
    }
}

/// Parse config file contents
///
/// # Errors
///
/// Returns error if the contents are not valid TOML for this schema
pub fn parse_config_file(contents: &str) -> crate::Result<LivecallConfigFile> {
    Ok(toml::from_str(contents)?)
}
