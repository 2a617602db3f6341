//! Composite face quality score.
//!
//! Weighted sum of detector confidence, head orientation, relative face size
//! and sample sharpness. Each term is clamped to [0, 1] before weighting; terms
//! without input (no pose, no sample) are dropped and their weight spread
//! proportionally over the rest.

use crate::types::{DetectedFace, HeadPose};
use image::GrayImage;
use serde::{Deserialize, Serialize};

/// Nose height between the eye line and mouth line on a frontal face.
const FRONTAL_NOSE_RATIO: f32 = 0.494;
/// Degrees of pitch per unit of nose-ratio deviation.
const PITCH_PER_RATIO: f32 = 150.0;
/// Degrees of yaw per unit of horizontal nose offset (in eye distances).
const YAW_PER_OFFSET: f32 = 90.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityWeights {
    pub detection: f32,
    pub orientation: f32,
    pub size: f32,
    pub sharpness: f32,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            detection: 0.60,
            orientation: 0.25,
            size: 0.10,
            sharpness: 0.05,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityConfig {
    pub weights: QualityWeights,
    /// Yaw/pitch (degrees) at which the orientation term reaches 0.
    pub max_angle_deg: f32,
    /// Face-width fraction of the frame at or below which the size term is 0.
    pub min_face_fraction: f32,
    /// Start of the full-score size band.
    pub ideal_min_fraction: f32,
    /// End of the full-score size band.
    pub ideal_max_fraction: f32,
    /// Fraction at which the "too close" decay bottoms out.
    pub max_face_fraction: f32,
    /// Size term for faces at or beyond `max_face_fraction`.
    pub too_close_floor: f32,
    /// Laplacian variance mapped to sharpness 0.
    pub blur_low_variance: f32,
    /// Laplacian variance mapped to sharpness 1.
    pub blur_high_variance: f32,
    /// Eye-open probability under which the face is flagged as eyes closed.
    pub eyes_closed_below: f32,
    /// Components under this value are reported as issues.
    pub issue_floor: f32,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            weights: QualityWeights::default(),
            max_angle_deg: 35.0,
            min_face_fraction: 0.08,
            ideal_min_fraction: 0.20,
            ideal_max_fraction: 0.60,
            max_face_fraction: 0.90,
            too_close_floor: 0.70,
            blur_low_variance: 20.0,
            blur_high_variance: 400.0,
            eyes_closed_below: 0.3,
            issue_floor: 0.6,
        }
    }
}

/// Why a face is not good enough, with guidance for the person in front of the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityIssue {
    LowConfidence,
    TurnedAway,
    TooFar,
    TooClose,
    Blurry,
    EyesClosed,
}

impl QualityIssue {
    pub fn guidance(&self) -> &'static str {
        match self {
            Self::LowConfidence => {
                "Face not clearly visible. Remove obstructions and face the camera."
            }
            Self::TurnedAway => "Please look straight at the camera.",
            Self::TooFar => "Please move closer to the camera.",
            Self::TooClose => "Please move back a little so your whole face is visible.",
            Self::Blurry => "Image is blurry. Hold still for a moment.",
            Self::EyesClosed => "Please keep your eyes open.",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LowConfidence => "low_confidence",
            Self::TurnedAway => "turned_away",
            Self::TooFar => "too_far",
            Self::TooClose => "too_close",
            Self::Blurry => "blurry",
            Self::EyesClosed => "eyes_closed",
        }
    }
}

/// Per-signal scores, each in [0, 1]. `None` means the signal was unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QualityComponents {
    pub detection: f32,
    pub orientation: Option<f32>,
    pub size: f32,
    pub sharpness: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityAssessment {
    /// Composite score in [0, 1].
    pub score: f32,
    pub components: QualityComponents,
    /// Dominant issue, if any signal fell under the issue floor.
    pub issue: Option<QualityIssue>,
    /// Whether the size issue (if any) is about being too close.
    too_close: bool,
}

impl QualityAssessment {
    /// Issue to report when the score is rejected: the flagged issue, or the
    /// weakest signal if nothing crossed the issue floor.
    pub fn rejection_issue(&self) -> QualityIssue {
        if let Some(issue) = self.issue {
            return issue;
        }
        weakest_component(&self.components, self.too_close).0
    }
}

fn size_issue(too_close: bool) -> QualityIssue {
    if too_close {
        QualityIssue::TooClose
    } else {
        QualityIssue::TooFar
    }
}

fn weakest_component(c: &QualityComponents, too_close: bool) -> (QualityIssue, f32) {
    let mut weakest = (QualityIssue::LowConfidence, c.detection);
    let candidates = [
        c.orientation.map(|v| (QualityIssue::TurnedAway, v)),
        Some((size_issue(too_close), c.size)),
        c.sharpness.map(|v| (QualityIssue::Blurry, v)),
    ];
    for (issue, value) in candidates.into_iter().flatten() {
        if value < weakest.1 {
            weakest = (issue, value);
        }
    }
    weakest
}

/// Stateless face quality scorer.
#[derive(Debug, Clone, Default)]
pub struct QualityAssessor {
    config: QualityConfig,
}

impl QualityAssessor {
    pub fn new(config: QualityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &QualityConfig {
        &self.config
    }

    /// Score a face. `frame_width` is the upright frame width in pixels;
    /// `sample` is an optional grayscale crop of the face for the sharpness term.
    pub fn assess(
        &self,
        face: &DetectedFace,
        frame_width: u32,
        sample: Option<&GrayImage>,
    ) -> QualityAssessment {
        let cfg = &self.config;
        let w = &cfg.weights;

        let pose = face.pose.or_else(|| face.landmarks.as_ref().map(pose_from_landmarks));
        let fraction = if frame_width > 0 {
            face.bbox.width / frame_width as f32
        } else {
            0.0
        };

        let components = QualityComponents {
            detection: clamp01(face.confidence),
            orientation: pose.map(|p| self.orientation_score(&p)),
            size: self.size_score(fraction),
            sharpness: sample.and_then(laplacian_variance).map(|v| self.sharpness_score(v)),
        };

        let mut weighted = w.detection * components.detection + w.size * components.size;
        let mut total = w.detection + w.size;
        if let Some(o) = components.orientation {
            weighted += w.orientation * o;
            total += w.orientation;
        }
        if let Some(s) = components.sharpness {
            weighted += w.sharpness * s;
            total += w.sharpness;
        }
        let score = if total > 0.0 { clamp01(weighted / total) } else { 0.0 };

        let too_close = fraction > cfg.ideal_max_fraction;
        let eyes_closed = [face.left_eye_open, face.right_eye_open]
            .into_iter()
            .flatten()
            .any(|p| p < cfg.eyes_closed_below);

        let issue = if eyes_closed {
            Some(QualityIssue::EyesClosed)
        } else {
            let (issue, value) = weakest_component(&components, too_close);
            (value < cfg.issue_floor).then_some(issue)
        };

        tracing::trace!(
            score,
            detection = components.detection,
            orientation = ?components.orientation,
            size = components.size,
            sharpness = ?components.sharpness,
            "quality assessed"
        );

        QualityAssessment {
            score,
            components,
            issue,
            too_close,
        }
    }

    /// Composite score only.
    pub fn score(&self, face: &DetectedFace, frame_width: u32, sample: Option<&GrayImage>) -> f32 {
        self.assess(face, frame_width, sample).score
    }

    pub fn is_acceptable(score: f32, threshold: f32) -> bool {
        score >= threshold
    }

    fn orientation_score(&self, pose: &HeadPose) -> f32 {
        let cutoff = self.config.max_angle_deg.max(f32::EPSILON);
        let axis = |angle: f32| clamp01(1.0 - angle.abs() / cutoff);
        (axis(pose.yaw) + axis(pose.pitch)) / 2.0
    }

    fn size_score(&self, fraction: f32) -> f32 {
        let c = &self.config;
        if fraction <= c.min_face_fraction {
            0.0
        } else if fraction < c.ideal_min_fraction {
            ramp(fraction, c.min_face_fraction, c.ideal_min_fraction)
        } else if fraction <= c.ideal_max_fraction {
            1.0
        } else if fraction < c.max_face_fraction {
            let t = ramp(fraction, c.ideal_max_fraction, c.max_face_fraction);
            1.0 - t * (1.0 - c.too_close_floor)
        } else {
            clamp01(c.too_close_floor)
        }
    }

    fn sharpness_score(&self, variance: f32) -> f32 {
        ramp(
            variance,
            self.config.blur_low_variance,
            self.config.blur_high_variance,
        )
    }
}

/// Linear position of `x` between `lo` (0) and `hi` (1), clamped.
fn ramp(x: f32, lo: f32, hi: f32) -> f32 {
    if hi <= lo {
        return if x >= hi { 1.0 } else { 0.0 };
    }
    clamp01((x - lo) / (hi - lo))
}

fn clamp01(v: f32) -> f32 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

/// Coarse yaw/pitch estimate from five-point landmarks.
pub fn pose_from_landmarks(landmarks: &[(f32, f32); 5]) -> HeadPose {
    let [left_eye, right_eye, nose, left_mouth, right_mouth] = *landmarks;
    let eye_mid = ((left_eye.0 + right_eye.0) / 2.0, (left_eye.1 + right_eye.1) / 2.0);
    let mouth_mid = ((left_mouth.0 + right_mouth.0) / 2.0, (left_mouth.1 + right_mouth.1) / 2.0);

    let eye_dx = right_eye.0 - left_eye.0;
    let eye_dy = right_eye.1 - left_eye.1;
    let eye_dist = (eye_dx * eye_dx + eye_dy * eye_dy).sqrt();
    let face_height = mouth_mid.1 - eye_mid.1;

    let yaw = if eye_dist > f32::EPSILON {
        (nose.0 - eye_mid.0) / eye_dist * YAW_PER_OFFSET
    } else {
        0.0
    };
    let pitch = if face_height.abs() > f32::EPSILON {
        ((nose.1 - eye_mid.1) / face_height - FRONTAL_NOSE_RATIO) * PITCH_PER_RATIO
    } else {
        0.0
    };
    let roll = eye_dy.atan2(eye_dx).to_degrees();

    HeadPose { yaw, pitch, roll }
}

/// Variance of the 4-neighbour Laplacian response; `None` for samples under 3×3.
pub fn laplacian_variance(sample: &GrayImage) -> Option<f32> {
    let (w, h) = sample.dimensions();
    if w < 3 || h < 3 {
        return None;
    }

    let px = |x: u32, y: u32| sample.get_pixel(x, y)[0] as f32;
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut n = 0u64;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let lap = 4.0 * px(x, y) - px(x - 1, y) - px(x + 1, y) - px(x, y - 1) - px(x, y + 1);
            sum += lap as f64;
            sum_sq += (lap as f64) * (lap as f64);
            n += 1;
        }
    }
    let mean = sum / n as f64;
    Some((sum_sq / n as f64 - mean * mean).max(0.0) as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;
    use image::Luma;

    fn face(confidence: f32, width: f32, pose: Option<HeadPose>) -> DetectedFace {
        DetectedFace {
            pose,
            ..DetectedFace::new(BoundingBox { x: 0.0, y: 0.0, width, height: width }, confidence)
        }
    }

    fn frontal() -> Option<HeadPose> {
        Some(HeadPose::default())
    }

    fn checkerboard(side: u32) -> GrayImage {
        GrayImage::from_fn(side, side, |x, y| Luma([if (x + y) % 2 == 0 { 0 } else { 255 }]))
    }

    #[test]
    fn test_ideal_face_scores_one() {
        let a = QualityAssessor::default();
        let q = a.assess(&face(1.0, 400.0, frontal()), 1000, Some(&checkerboard(32)));
        assert!((q.score - 1.0).abs() < 1e-6, "score = {}", q.score);
        assert!(q.issue.is_none());
    }

    #[test]
    fn test_missing_sample_redistributes_weight() {
        let a = QualityAssessor::default();
        // detection 0.5, orientation 1, size 1 → (0.6*0.5 + 0.25 + 0.10) / 0.95
        let q = a.assess(&face(0.5, 400.0, frontal()), 1000, None);
        let expected = (0.6 * 0.5 + 0.25 + 0.10) / 0.95;
        assert!((q.score - expected).abs() < 1e-5, "score = {}", q.score);
        assert!(q.components.sharpness.is_none());
    }

    #[test]
    fn test_missing_pose_and_landmarks_drops_orientation() {
        let a = QualityAssessor::default();
        let q = a.assess(&face(0.8, 400.0, None), 1000, None);
        assert!(q.components.orientation.is_none());
        let expected = (0.6 * 0.8 + 0.10) / 0.70;
        assert!((q.score - expected).abs() < 1e-5);
    }

    #[test]
    fn test_orientation_decays_linearly() {
        let a = QualityAssessor::default();
        let half = HeadPose { yaw: 17.5, pitch: 0.0, roll: 0.0 };
        let q = a.assess(&face(1.0, 400.0, Some(half)), 1000, None);
        // yaw term 0.5, pitch term 1.0 → 0.75
        assert!((q.components.orientation.unwrap() - 0.75).abs() < 1e-5);

        let away = HeadPose { yaw: 80.0, pitch: 80.0, roll: 0.0 };
        let q = a.assess(&face(1.0, 400.0, Some(away)), 1000, None);
        assert_eq!(q.components.orientation, Some(0.0));
        assert_eq!(q.issue, Some(QualityIssue::TurnedAway));
    }

    #[test]
    fn test_size_band() {
        let a = QualityAssessor::default();
        assert_eq!(a.size_score(0.05), 0.0);
        assert!((a.size_score(0.14) - 0.5).abs() < 1e-5);
        assert_eq!(a.size_score(0.3), 1.0);
        assert!((a.size_score(0.75) - 0.85).abs() < 1e-5);
        assert!((a.size_score(0.99) - 0.70).abs() < 1e-5);
    }

    #[test]
    fn test_too_close_and_too_far_issues() {
        let a = QualityAssessor::default();
        let far = a.assess(&face(1.0, 60.0, frontal()), 1000, None);
        assert_eq!(far.issue, Some(QualityIssue::TooFar));
        let near = a.assess(&face(0.4, 950.0, frontal()), 1000, None);
        assert_eq!(near.rejection_issue(), QualityIssue::LowConfidence);
    }

    #[test]
    fn test_blurry_sample_scores_lower_than_sharp() {
        let a = QualityAssessor::default();
        let flat = GrayImage::from_pixel(32, 32, Luma([128]));
        let blurry = a.assess(&face(1.0, 400.0, frontal()), 1000, Some(&flat));
        let sharp = a.assess(&face(1.0, 400.0, frontal()), 1000, Some(&checkerboard(32)));
        assert_eq!(blurry.components.sharpness, Some(0.0));
        assert_eq!(blurry.issue, Some(QualityIssue::Blurry));
        assert!(sharp.score > blurry.score);
    }

    #[test]
    fn test_tiny_sample_is_ignored() {
        let a = QualityAssessor::default();
        let tiny = GrayImage::new(2, 2);
        let q = a.assess(&face(1.0, 400.0, frontal()), 1000, Some(&tiny));
        assert!(q.components.sharpness.is_none());
    }

    #[test]
    fn test_eyes_closed_flagged_without_changing_score() {
        let a = QualityAssessor::default();
        let open = face(0.9, 400.0, frontal());
        let closed = DetectedFace {
            left_eye_open: Some(0.1),
            right_eye_open: Some(0.9),
            ..open.clone()
        };
        let q_open = a.assess(&open, 1000, None);
        let q_closed = a.assess(&closed, 1000, None);
        assert_eq!(q_open.score, q_closed.score);
        assert_eq!(q_closed.issue, Some(QualityIssue::EyesClosed));
    }

    #[test]
    fn test_scores_always_in_unit_range() {
        let a = QualityAssessor::default();
        for conf in [-1.0, 0.0, 0.3, 1.0, 2.5, f32::NAN] {
            for width in [0.0, 10.0, 300.0, 990.0, 5000.0] {
                for yaw in [-200.0, -10.0, 0.0, 45.0, 400.0] {
                    let pose = Some(HeadPose { yaw, pitch: yaw / 2.0, roll: 0.0 });
                    let q = a.score(&face(conf, width, pose), 1000, Some(&checkerboard(8)));
                    assert!((0.0..=1.0).contains(&q), "score {q} out of range");
                }
            }
        }
        assert_eq!(
            a.score(&face(1.0, 100.0, frontal()), 0, None),
            a.score(&face(1.0, 0.0, frontal()), 1000, None)
        );
    }

    #[test]
    fn test_pose_from_frontal_landmarks() {
        let landmarks = [
            (38.2946, 51.6963),
            (73.5318, 51.5014),
            (56.0252, 71.7366),
            (41.5493, 92.3655),
            (70.7299, 92.2041),
        ];
        let pose = pose_from_landmarks(&landmarks);
        assert!(pose.yaw.abs() < 3.0, "yaw = {}", pose.yaw);
        assert!(pose.pitch.abs() < 3.0, "pitch = {}", pose.pitch);
        assert!(pose.roll.abs() < 1.0, "roll = {}", pose.roll);
    }

    #[test]
    fn test_pose_from_turned_landmarks() {
        // Nose shifted half an eye-distance to the right.
        let landmarks = [
            (40.0, 50.0),
            (80.0, 50.0),
            (80.0, 70.0),
            (45.0, 90.0),
            (75.0, 90.0),
        ];
        let pose = pose_from_landmarks(&landmarks);
        assert!((pose.yaw - 45.0).abs() < 1e-3, "yaw = {}", pose.yaw);
    }

    #[test]
    fn test_is_acceptable() {
        assert!(!QualityAssessor::is_acceptable(0.5, 0.8));
        assert!(QualityAssessor::is_acceptable(0.8, 0.8));
    }

    #[test]
    fn test_guidance_is_not_empty() {
        for issue in [
            QualityIssue::LowConfidence,
            QualityIssue::TurnedAway,
            QualityIssue::TooFar,
            QualityIssue::TooClose,
            QualityIssue::Blurry,
            QualityIssue::EyesClosed,
        ] {
            assert!(!issue.guidance().is_empty());
            assert!(!issue.as_str().is_empty());
        }
    }
}
