//! Camera frames for the live call
//!
//! Frames are pulled on a fixed interval while the call is connected,
//! downsampled, and sent as JPEG.

#[cfg(feature = "camera")]
mod camera;
mod encode;

#[cfg(feature = "camera")]
pub use camera::NokhwaCamera;
pub use encode::{FRAME_MIME_TYPE, encode_jpeg, frame_blob, scaled_size};

use image::RgbImage;

use crate::Result;

/// A source of camera frames
pub trait FrameSource {
    /// Grab the current frame
    ///
    /// # Errors
    ///
    /// Returns error if no frame is available
    fn capture_frame(&mut self) -> Result<RgbImage>;

    /// Stop capturing and release the camera
    fn stop(&mut self);

    /// Whether the camera is still held
    fn is_live(&self) -> bool;
}
