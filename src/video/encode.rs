//! Camera frame encoding
//!
//! Frames are downsampled, JPEG-compressed, and base64-encoded before being
//! sent as realtime input.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};

use crate::Result;
use crate::config::VideoConfig;
use crate::session::MediaBlob;

/// MIME type tag for camera frames
pub const FRAME_MIME_TYPE: &str = "image/jpeg";

/// Scaled dimensions for a frame, never smaller than 1x1
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn scaled_size(width: u32, height: u32, scale: f32) -> (u32, u32) {
    let scale = f64::from(scale);
    let w = (f64::from(width) * scale).floor().max(1.0) as u32;
    let h = (f64::from(height) * scale).floor().max(1.0) as u32;
    (w, h)
}

/// Downsample and JPEG-encode a frame
///
/// # Errors
///
/// Returns error if JPEG encoding fails
pub fn encode_jpeg(frame: &RgbImage, config: &VideoConfig) -> Result<Vec<u8>> {
    let (w, h) = scaled_size(frame.width(), frame.height(), config.scale);
    let resized = if (w, h) == frame.dimensions() {
        frame.clone()
    } else {
        image::imageops::resize(frame, w, h, FilterType::Triangle)
    };

    let mut buf = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buf, config.jpeg_quality);
    DynamicImage::ImageRgb8(resized).write_with_encoder(encoder)?;
    Ok(buf)
}

/// Encode a frame as an outbound video payload
///
/// # Errors
///
/// Returns error if JPEG encoding fails
pub fn frame_blob(frame: &RgbImage, config: &VideoConfig) -> Result<MediaBlob> {
    let jpeg = encode_jpeg(frame, config)?;
    tracing::trace!(
        width = frame.width(),
        height = frame.height(),
        bytes = jpeg.len(),
        "encoded camera frame"
    );

    Ok(MediaBlob {
        mime_type: FRAME_MIME_TYPE.to_string(),
        data: STANDARD.encode(jpeg),
    })
}
