//! Camera capture via `nokhwa`

use image::RgbImage;
use nokhwa::Camera;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{CameraIndex, RequestedFormat, RequestedFormatType};

use super::FrameSource;
use crate::{Error, Result};

/// Captures frames from the first camera on the system
pub struct NokhwaCamera {
    camera: Option<Camera>,
}

impl NokhwaCamera {
    /// Open the default camera and start streaming
    ///
    /// # Errors
    ///
    /// Returns `Error::Permission` if the camera cannot be acquired
    pub fn open() -> Result<Self> {
        let format = RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate);
        let mut camera = Camera::new(CameraIndex::Index(0), format)
            .map_err(|e| Error::Permission(format!("camera unavailable: {e}")))?;

        camera
            .open_stream()
            .map_err(|e| Error::Permission(format!("camera stream denied: {e}")))?;

        let resolution = camera.resolution();
        tracing::debug!(
            width = resolution.width(),
            height = resolution.height(),
            "camera capture started"
        );

        Ok(Self {
            camera: Some(camera),
        })
    }
}

impl FrameSource for NokhwaCamera {
    fn capture_frame(&mut self) -> Result<RgbImage> {
        let camera = self
            .camera
            .as_mut()
            .ok_or_else(|| Error::Video("camera is stopped".to_string()))?;

        let buffer = camera.frame().map_err(|e| Error::Video(e.to_string()))?;
        let decoded = buffer
            .decode_image::<RgbFormat>()
            .map_err(|e| Error::Video(e.to_string()))?;

        let (width, height) = (decoded.width(), decoded.height());
        RgbImage::from_raw(width, height, decoded.into_raw())
            .ok_or_else(|| Error::Video("camera frame has unexpected size".to_string()))
    }

    fn stop(&mut self) {
        if let Some(mut camera) = self.camera.take() {
            if let Err(e) = camera.stop_stream() {
                tracing::debug!(error = %e, "camera already stopped");
            }
            tracing::debug!("camera capture stopped");
        }
    }

    fn is_live(&self) -> bool {
        self.camera.is_some()
    }
}
