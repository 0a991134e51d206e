//! livecall - Live voice and video calls with a generative AI assistant
//!
//! This library provides the call pipeline behind the `livecall` binary:
//! - Microphone capture, PCM encoding, and gap-free reply playback
//! - Camera frame sampling and JPEG encoding
//! - A live session abstraction with a Gemini Live connector
//! - Text chat with a rolling history window
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  CallController                     │
//! │   StateMachine  │  CallGuard  │  teardown           │
//! └───────┬──────────────────┬─────────────────▲────────┘
//!         │ capture          │ dispatch        │ playback
//! ┌───────▼───────┐  ┌───────▼───────┐  ┌──────┴────────┐
//! │ voice / video │  │  Dispatcher   │  │ Playback-     │
//! │ (cpal, nokhwa)│─►│ (one writer)  │  │ Scheduler     │
//! └───────────────┘  └───────┬───────┘  └──────▲────────┘
//!                            │                 │
//! ┌──────────────────────────▼─────────────────┴────────┐
//! │        RealtimeSession (Gemini Live, WebSocket)     │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod call;
pub mod chat;
pub mod config;
pub mod error;
pub mod session;
pub mod video;
pub mod voice;

pub use call::{CallController, CallSettings, CallUpdate, ConnectionState};
pub use config::Config;
pub use error::{Error, Result};
