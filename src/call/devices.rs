//! Media hardware acquisition
//!
//! The controller acquires the microphone, camera, and speaker through
//! [`MediaDevices`], so tests can deny permissions or substitute a manual
//! clock without touching real hardware.

use tokio::sync::mpsc;

use crate::Result;
use crate::config::{AudioConfig, VideoConfig};
use crate::video::FrameSource;
use crate::voice::{AudioOutput, CpalOutput, HandleId, MicrophoneCapture};

/// A held capture device that delivers data until stopped
pub trait MediaTrack {
    /// Stop delivering and release the device
    fn stop(&mut self);

    /// Whether the device is still held
    fn is_live(&self) -> bool;
}

impl MediaTrack for MicrophoneCapture {
    fn stop(&mut self) {
        Self::stop(self);
    }

    fn is_live(&self) -> bool {
        self.is_capturing()
    }
}

/// Source of the call's media devices
pub trait MediaDevices {
    /// Start the microphone; fixed-size mono blocks at the session input
    /// rate are pushed into `sink`
    ///
    /// # Errors
    ///
    /// Returns `Error::Permission` if the microphone cannot be acquired
    fn open_microphone(
        &mut self,
        config: &AudioConfig,
        sink: mpsc::UnboundedSender<Vec<f32>>,
    ) -> Result<Box<dyn MediaTrack>>;

    /// Acquire the camera
    ///
    /// # Errors
    ///
    /// Returns `Error::Permission` if the camera cannot be acquired
    fn open_camera(&mut self, config: &VideoConfig) -> Result<Box<dyn FrameSource>>;

    /// Open the playback device; ids of finished chunks are pushed into
    /// `ended`
    ///
    /// # Errors
    ///
    /// Returns error if no output device can be opened
    fn open_output(&mut self, ended: mpsc::UnboundedSender<HandleId>)
    -> Result<Box<dyn AudioOutput>>;
}

/// Default host devices via cpal (and nokhwa with the `camera` feature)
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDevices;

impl MediaDevices for SystemDevices {
    fn open_microphone(
        &mut self,
        config: &AudioConfig,
        sink: mpsc::UnboundedSender<Vec<f32>>,
    ) -> Result<Box<dyn MediaTrack>> {
        Ok(Box::new(MicrophoneCapture::open(config, sink)?))
    }

    #[cfg(feature = "camera")]
    fn open_camera(&mut self, _config: &VideoConfig) -> Result<Box<dyn FrameSource>> {
        Ok(Box::new(crate::video::NokhwaCamera::open()?))
    }

    #[cfg(not(feature = "camera"))]
    fn open_camera(&mut self, _config: &VideoConfig) -> Result<Box<dyn FrameSource>> {
        Err(crate::Error::Permission(
            "camera support not built (enable the `camera` feature)".to_string(),
        ))
    }

    fn open_output(
        &mut self,
        ended: mpsc::UnboundedSender<HandleId>,
    ) -> Result<Box<dyn AudioOutput>> {
        Ok(Box::new(CpalOutput::open(ended)?))
    }
}
