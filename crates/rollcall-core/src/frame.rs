//! Camera frame type and luma-plane helpers.

use image::{imageops, GrayImage};
use std::borrow::Cow;

/// Pixel layout tag supplied by the capture collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8-bit grayscale (1 byte/pixel).
    Gray8,
    /// NV21 semi-planar YUV 4:2:0 (luma plane first).
    Nv21,
    /// I420 planar YUV 4:2:0 (luma plane first).
    Yuv420,
    /// Packed 24-bit RGB.
    Rgb8,
    /// Packed 32-bit RGBA.
    Rgba8,
    /// Compressed or vendor-specific layout the core does not read.
    Opaque,
}

/// A camera frame borrowed by the pipeline for one cycle.
#[derive(Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Clockwise rotation needed to bring the buffer upright (0, 90, 180, 270).
    pub rotation_degrees: u16,
    pub sequence: u64,
    pub captured_at: std::time::Instant,
    /// Capture-side hint that the scene is lit by daylight.
    pub outdoor: bool,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("rotation_degrees", &self.rotation_degrees)
            .field("sequence", &self.sequence)
            .field("bytes", &self.data.len())
            .finish()
    }
}

impl Frame {
    /// Build an upright grayscale frame.
    pub fn gray(data: Vec<u8>, width: u32, height: u32, sequence: u64) -> Self {
        Self {
            data,
            width,
            height,
            format: PixelFormat::Gray8,
            rotation_degrees: 0,
            sequence,
            captured_at: std::time::Instant::now(),
            outdoor: false,
        }
    }

    fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Luma plane (width * height bytes), or `None` for opaque or truncated buffers.
    pub fn luma(&self) -> Option<Cow<'_, [u8]>> {
        let pixels = self.pixel_count();
        match self.format {
            PixelFormat::Gray8 | PixelFormat::Nv21 | PixelFormat::Yuv420 => {
                self.data.get(..pixels).map(Cow::Borrowed)
            }
            PixelFormat::Rgb8 => packed_to_luma(&self.data, pixels, 3).map(Cow::Owned),
            PixelFormat::Rgba8 => packed_to_luma(&self.data, pixels, 4).map(Cow::Owned),
            PixelFormat::Opaque => None,
        }
    }

    /// Buffer dimensions once `rotation_degrees` is applied.
    pub fn upright_size(&self) -> (u32, u32) {
        match self.rotation_degrees % 360 {
            90 | 270 => (self.height, self.width),
            _ => (self.width, self.height),
        }
    }

    /// Luma plane rotated upright. Detector boxes and landmarks are in this
    /// image's coordinates.
    pub fn upright_luma(&self) -> Option<GrayImage> {
        let luma = self.luma()?;
        let plane = GrayImage::from_raw(self.width, self.height, luma.into_owned())?;
        Some(match self.rotation_degrees % 360 {
            90 => imageops::rotate90(&plane),
            180 => imageops::rotate180(&plane),
            270 => imageops::rotate270(&plane),
            _ => plane,
        })
    }

    /// Average luma (0.0–255.0), if the format exposes one.
    pub fn mean_luma(&self) -> Option<f32> {
        let luma = self.luma()?;
        if luma.is_empty() {
            return None;
        }
        Some(luma.iter().map(|&b| b as f32).sum::<f32>() / luma.len() as f32)
    }

    /// Whether the frame looks underexposed.
    ///
    /// Opaque formats are never reported as low light.
    pub fn is_low_light(&self, mean_floor: f32, dark_fraction: f32) -> bool {
        let Some(luma) = self.luma() else {
            return false;
        };
        if luma.is_empty() {
            return false;
        }
        let mean = luma.iter().map(|&b| b as f32).sum::<f32>() / luma.len() as f32;
        mean < mean_floor || is_dark_frame(&luma, dark_fraction)
    }
}

fn packed_to_luma(data: &[u8], pixels: usize, stride: usize) -> Option<Vec<u8>> {
    let bytes = data.get(..pixels * stride)?;
    Some(
        bytes
            .chunks_exact(stride)
            .map(|px| {
                // BT.601 weights in 8.8 fixed point.
                let y = 77 * px[0] as u32 + 150 * px[1] as u32 + 29 * px[2] as u32;
                (y >> 8) as u8
            })
            .collect(),
    )
}

/// True if more than `threshold_pct` of pixels fall in the darkest bucket (0–31).
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark_count = gray.iter().filter(|&&p| p < 32).count();
    (dark_count as f32 / gray.len() as f32) > threshold_pct
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(data: Vec<u8>, w: u32, h: u32, format: PixelFormat) -> Frame {
        Frame {
            format,
            ..Frame::gray(data, w, h, 0)
        }
    }

    #[test]
    fn test_gray_luma_is_borrowed() {
        let f = frame(vec![7u8; 6], 3, 2, PixelFormat::Gray8);
        assert!(matches!(f.luma(), Some(Cow::Borrowed(_))));
    }

    #[test]
    fn test_nv21_luma_skips_chroma() {
        // 2x2 luma + 2 bytes interleaved VU
        let f = frame(vec![10, 20, 30, 40, 128, 128], 2, 2, PixelFormat::Nv21);
        assert_eq!(f.luma().unwrap().as_ref(), &[10, 20, 30, 40]);
    }

    #[test]
    fn test_rgb_luma_conversion() {
        let f = frame(vec![255, 255, 255, 0, 0, 0], 2, 1, PixelFormat::Rgb8);
        let luma = f.luma().unwrap();
        assert_eq!(luma[0], 255);
        assert_eq!(luma[1], 0);
    }

    #[test]
    fn test_upright_luma_applies_clockwise_rotation() {
        // 3x2 buffer:
        //   1 2 3
        //   4 5 6
        let mut f = frame(vec![1, 2, 3, 4, 5, 6], 3, 2, PixelFormat::Gray8);
        f.rotation_degrees = 90;
        assert_eq!(f.upright_size(), (2, 3));
        let upright = f.upright_luma().unwrap();
        assert_eq!(upright.dimensions(), (2, 3));
        assert_eq!(upright.as_raw(), &[4, 1, 5, 2, 6, 3]);

        f.rotation_degrees = 0;
        assert_eq!(f.upright_luma().unwrap().as_raw(), &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_truncated_buffer_has_no_luma() {
        let f = frame(vec![0u8; 3], 2, 2, PixelFormat::Gray8);
        assert!(f.luma().is_none());
        assert!(f.mean_luma().is_none());
    }

    #[test]
    fn test_opaque_is_never_low_light() {
        let f = frame(vec![0u8; 4], 2, 2, PixelFormat::Opaque);
        assert!(!f.is_low_light(60.0, 0.9));
    }

    #[test]
    fn test_low_light_by_mean() {
        let f = frame(vec![40u8; 100], 10, 10, PixelFormat::Gray8);
        assert!(f.is_low_light(60.0, 0.95));
        let f = frame(vec![140u8; 100], 10, 10, PixelFormat::Gray8);
        assert!(!f.is_low_light(60.0, 0.95));
    }

    #[test]
    fn test_dark_frame_mostly_dark() {
        let mut gray = vec![10u8; 960];
        gray.extend(vec![128u8; 40]);
        assert!(is_dark_frame(&gray, 0.95));
    }

    #[test]
    fn test_dark_frame_borderline_bright() {
        let mut gray = vec![10u8; 940];
        gray.extend(vec![128u8; 60]);
        assert!(!is_dark_frame(&gray, 0.95));
    }
}
