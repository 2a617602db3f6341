//! Fixed-size face crops for the embedding extractor.
//!
//! Faces with landmarks are aligned to the canonical five-point template with
//! a least-squares similarity transform; faces without landmarks fall back to
//! a padded bounding-box crop. Both produce a square grayscale image.

use crate::frame::Frame;
use crate::types::{BoundingBox, DetectedFace};
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};

/// Canonical landmark template for a 112×112 crop.
const TEMPLATE_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

/// Extra context around a bounding box when no landmarks are available.
const BOX_CROP_MARGIN: f32 = 0.15;

/// Square grayscale face crop handed to the embedding extractor.
#[derive(Debug, Clone)]
pub struct FaceCrop {
    pub image: GrayImage,
    /// Whether the crop came from landmark alignment rather than a box crop.
    pub aligned: bool,
}

impl FaceCrop {
    pub fn side(&self) -> u32 {
        self.image.width()
    }
}

/// 4-DOF similarity transform `dst = [a -b; b a] * src + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

/// Closed-form least-squares similarity from `src` onto `dst`.
fn estimate_similarity(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Similarity {
    let n = src.len() as f32;
    let mean = |pts: &[(f32, f32); 5]| {
        let (sx, sy) = pts.iter().fold((0.0, 0.0), |acc, p| (acc.0 + p.0, acc.1 + p.1));
        (sx / n, sy / n)
    };
    let (mx, my) = mean(src);
    let (nx, ny) = mean(dst);

    let mut dot = 0.0f32;
    let mut cross = 0.0f32;
    let mut energy = 0.0f32;
    for (s, d) in src.iter().zip(dst.iter()) {
        let (sx, sy) = (s.0 - mx, s.1 - my);
        let (dx, dy) = (d.0 - nx, d.1 - ny);
        dot += sx * dx + sy * dy;
        cross += sx * dy - sy * dx;
        energy += sx * sx + sy * sy;
    }

    if energy <= f32::EPSILON {
        // Collapsed landmarks: translate only.
        return Similarity { a: 1.0, b: 0.0, tx: nx - mx, ty: ny - my };
    }

    let a = dot / energy;
    let b = cross / energy;
    Similarity {
        a,
        b,
        tx: nx - (a * mx - b * my),
        ty: ny - (b * mx + a * my),
    }
}

fn sample_bilinear(luma: &[u8], width: usize, height: usize, x: f32, y: f32) -> f32 {
    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let px = |xi: i64, yi: i64| -> f32 {
        if xi >= 0 && yi >= 0 && (xi as usize) < width && (yi as usize) < height {
            luma[yi as usize * width + xi as usize] as f32
        } else {
            0.0
        }
    };

    px(x0, y0) * (1.0 - fx) * (1.0 - fy)
        + px(x0 + 1, y0) * fx * (1.0 - fy)
        + px(x0, y0 + 1) * (1.0 - fx) * fy
        + px(x0 + 1, y0 + 1) * fx * fy
}

/// Warp the source luma through the inverse of `sim` into a `side`×`side` image.
fn warp(luma: &[u8], width: usize, height: usize, sim: Similarity, side: u32) -> GrayImage {
    let det = sim.a * sim.a + sim.b * sim.b;
    if det <= f32::EPSILON {
        return GrayImage::new(side, side);
    }

    GrayImage::from_fn(side, side, |ox, oy| {
        let dx = ox as f32 - sim.tx;
        let dy = oy as f32 - sim.ty;
        let sx = (sim.a * dx + sim.b * dy) / det;
        let sy = (-sim.b * dx + sim.a * dy) / det;
        let v = sample_bilinear(luma, width, height, sx, sy);
        Luma([v.round().clamp(0.0, 255.0) as u8])
    })
}

/// Align a face to the canonical template scaled to `side` pixels.
pub fn align_face(
    luma: &[u8],
    width: u32,
    height: u32,
    landmarks: &[(f32, f32); 5],
    side: u32,
) -> FaceCrop {
    let scale = side as f32 / 112.0;
    let template = TEMPLATE_112.map(|(x, y)| (x * scale, y * scale));
    let sim = estimate_similarity(landmarks, &template);
    FaceCrop {
        image: warp(luma, width as usize, height as usize, sim, side),
        aligned: true,
    }
}

/// Clamp a box (grown by `margin` on each side) to the frame; `None` if nothing remains.
fn clamp_box(
    bbox: &BoundingBox,
    margin: f32,
    width: u32,
    height: u32,
) -> Option<(u32, u32, u32, u32)> {
    let grow_x = bbox.width * margin;
    let grow_y = bbox.height * margin;
    let x0 = (bbox.x - grow_x).floor().max(0.0);
    let y0 = (bbox.y - grow_y).floor().max(0.0);
    let x1 = (bbox.x + bbox.width + grow_x).ceil().min(width as f32);
    let y1 = (bbox.y + bbox.height + grow_y).ceil().min(height as f32);
    if x1 - x0 < 1.0 || y1 - y0 < 1.0 {
        return None;
    }
    Some((x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32))
}

/// Crop the (padded) bounding box and resize it to a square.
pub fn crop_box(
    luma: &[u8],
    width: u32,
    height: u32,
    bbox: &BoundingBox,
    side: u32,
) -> Option<FaceCrop> {
    let region = region_image(luma, width, height, bbox, BOX_CROP_MARGIN)?;
    Some(FaceCrop {
        image: imageops::resize(&region, side, side, FilterType::Triangle),
        aligned: false,
    })
}

fn region_image(
    luma: &[u8],
    width: u32,
    height: u32,
    bbox: &BoundingBox,
    margin: f32,
) -> Option<GrayImage> {
    let (x, y, w, h) = clamp_box(bbox, margin, width, height)?;
    let plane = luma.get(..(width * height) as usize)?.to_vec();
    let full = GrayImage::from_raw(width, height, plane)?;
    Some(imageops::crop_imm(&full, x, y, w, h).to_image())
}

/// Grayscale sample of the face region for sharpness scoring, downscaled to
/// at most `max_side` on its longer edge.
pub fn face_sample(frame: &Frame, bbox: &BoundingBox, max_side: u32) -> Option<GrayImage> {
    let upright = frame.upright_luma()?;
    let (width, height) = upright.dimensions();
    let region = region_image(upright.as_raw(), width, height, bbox, 0.0)?;
    let longest = region.width().max(region.height());
    if longest <= max_side || max_side == 0 {
        return Some(region);
    }
    let scale = max_side as f32 / longest as f32;
    let w = ((region.width() as f32 * scale).round() as u32).max(1);
    let h = ((region.height() as f32 * scale).round() as u32).max(1);
    Some(imageops::resize(&region, w, h, FilterType::Triangle))
}

/// Build the extractor input for a detected face: aligned when landmarks exist.
/// Face geometry is read in upright frame coordinates.
pub fn prepare_crop(frame: &Frame, face: &DetectedFace, side: u32) -> Option<FaceCrop> {
    let upright = frame.upright_luma()?;
    let (width, height) = upright.dimensions();
    match &face.landmarks {
        Some(landmarks) => Some(align_face(upright.as_raw(), width, height, landmarks, side)),
        None => crop_box(upright.as_raw(), width, height, &face.bbox, side),
    }
}
