//! Compressed face snapshots attached to audit log entries.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{ExtendedColorType, GrayImage, ImageEncoder, ImageResult};

/// JPEG-encode a grayscale face image, downscaled to at most `max_side` pixels.
pub fn encode_jpeg(image: &GrayImage, max_side: u32, quality: u8) -> ImageResult<Vec<u8>> {
    let (w, h) = image.dimensions();
    let longest = w.max(h);
    let scaled;
    let source = if max_side > 0 && longest > max_side {
        let scale = max_side as f32 / longest as f32;
        let nw = ((w as f32 * scale).round() as u32).max(1);
        let nh = ((h as f32 * scale).round() as u32).max(1);
        scaled = imageops::resize(image, nw, nh, FilterType::Triangle);
        &scaled
    } else {
        image
    };

    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, quality.clamp(1, 100)).write_image(
        source.as_raw(),
        source.width(),
        source.height(),
        ExtendedColorType::L8,
    )?;
    Ok(bytes)
}
