//! Live call pipeline
//!
//! Four stages run for the duration of a call:
//!
//! ```text
//! mic/camera ──► encode ──► Dispatcher ──► RealtimeSession
//!                                              │
//! speaker ◄── PlaybackScheduler ◄── decode ◄───┘
//! ```
//!
//! [`CallController`] owns all of them and the [`StateMachine`] that gates
//! them. Every send and every schedule is checked against a [`CallGuard`],
//! so nothing queued by a previous call can touch the next one.

mod controller;
mod devices;
mod dispatch;
mod state;

pub use controller::{CallController, CallSettings, CallUpdate};
pub use devices::{MediaDevices, MediaTrack, SystemDevices};
pub use dispatch::{DispatchStats, Dispatcher};
pub use state::{CallGuard, ConnectionState, StateMachine};
