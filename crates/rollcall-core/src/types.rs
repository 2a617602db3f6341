use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("embedding has no dimensions")]
    Empty,
    #[error("embedding contains non-finite values")]
    NonFinite,
    #[error("embedding has zero norm and cannot be normalized")]
    ZeroNorm,
}

/// Axis-aligned face bounding box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// Head rotation reported by the detector, in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct HeadPose {
    pub yaw: f32,
    pub pitch: f32,
    pub roll: f32,
}

/// A face found by the external detector in one frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedFace {
    /// In upright frame coordinates, after `Frame::rotation_degrees` is applied.
    pub bbox: BoundingBox,
    /// Detector confidence in [0, 1].
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
    pub pose: Option<HeadPose>,
    pub left_eye_open: Option<f32>,
    pub right_eye_open: Option<f32>,
}

impl DetectedFace {
    /// A face with only a bounding box and confidence; everything optional left unset.
    pub fn new(bbox: BoundingBox, confidence: f32) -> Self {
        Self {
            bbox,
            confidence,
            landmarks: None,
            pose: None,
            left_eye_open: None,
            right_eye_open: None,
        }
    }
}

/// Face embedding vector. Unit L2 norm once built through [`Embedding::normalized`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "mobilefacenet-192").
    #[serde(default)]
    pub model_version: Option<String>,
}

impl Embedding {
    /// L2-normalize raw extractor output.
    pub fn normalized(
        values: Vec<f32>,
        model_version: Option<String>,
    ) -> Result<Self, EmbeddingError> {
        if values.is_empty() {
            return Err(EmbeddingError::Empty);
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(EmbeddingError::NonFinite);
        }

        // Accumulate in f64 so large components don't overflow and tiny ones
        // don't underflow to a zero norm.
        let norm = l2_norm_f64(&values);
        if norm == 0.0 || !norm.is_finite() {
            return Err(EmbeddingError::ZeroNorm);
        }

        Ok(Self {
            values: values
                .into_iter()
                .map(|v| (f64::from(v) / norm) as f32)
                .collect(),
            model_version,
        })
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn norm(&self) -> f32 {
        l2_norm(&self.values)
    }

    pub fn is_unit(&self, epsilon: f32) -> bool {
        (self.norm() - 1.0).abs() < epsilon
    }

    /// Euclidean distance between two embeddings.
    ///
    /// # Panics
    ///
    /// Panics if the dimensions differ. Mixing models in one comparison is a
    /// programming error, not a runtime outcome.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        assert_eq!(
            self.values.len(),
            other.values.len(),
            "embedding dimension mismatch"
        );
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

fn l2_norm(values: &[f32]) -> f32 {
    l2_norm_f64(values) as f32
}

fn l2_norm_f64(values: &[f32]) -> f64 {
    values
        .iter()
        .map(|&v| f64::from(v) * f64::from(v))
        .sum::<f64>()
        .sqrt()
}

/// Roster entry as supplied by the sync collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmployeeRecord {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub embeddings: Vec<Embedding>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub last_synced: Option<DateTime<Utc>>,
}

fn default_active() -> bool {
    true
}

/// Result of matching a query embedding against the cached roster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    /// Nearest identity, set only when `is_match`.
    pub identity_id: Option<String>,
    pub display_name: Option<String>,
    /// Distance to the nearest reference embedding.
    pub distance: f32,
    /// Monotonic mapping of distance into [0, 1]; 0 when not matched.
    pub confidence: f32,
    /// Effective threshold the distance was compared against.
    pub threshold: f32,
    pub is_match: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalized_has_unit_norm() {
        let e = Embedding::normalized(vec![3.0, 4.0, 0.0], None).unwrap();
        assert!(e.is_unit(1e-6));
        assert!((e.values[0] - 0.6).abs() < 1e-6);
        assert!((e.values[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_normalized_rejects_degenerate_vectors() {
        assert_eq!(Embedding::normalized(vec![], None), Err(EmbeddingError::Empty));
        assert_eq!(
            Embedding::normalized(vec![0.0, 0.0], None),
            Err(EmbeddingError::ZeroNorm)
        );
        assert_eq!(
            Embedding::normalized(vec![1.0, f32::NAN], None),
            Err(EmbeddingError::NonFinite)
        );
    }

    #[test]
    fn test_normalized_extreme_magnitudes_stay_unit() {
        let large = Embedding::normalized(vec![3e19, 4e19], None).unwrap();
        assert!(large.is_unit(1e-6), "norm = {}", large.norm());
        assert!((large.values[0] - 0.6).abs() < 1e-6);
        assert!((large.values[1] - 0.8).abs() < 1e-6);

        let tiny = Embedding::normalized(vec![3e-23, 4e-23], None).unwrap();
        assert!(tiny.is_unit(1e-6), "norm = {}", tiny.norm());
        assert!((tiny.values[0] - 0.6).abs() < 1e-6);
        assert!((tiny.values[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_normalized_many_shapes_stay_unit() {
        for seed in 1..50u32 {
            let raw: Vec<f32> = (0..128)
                .map(|i: u32| {
                    let mixed = i.wrapping_mul(2_654_435_761).wrapping_add(seed * 40_503);
                    (mixed % 1000) as f32 - 500.0
                })
                .collect();
            if let Ok(e) = Embedding::normalized(raw, None) {
                assert!(e.is_unit(1e-4), "norm = {}", e.norm());
            }
        }
    }

    #[test]
    fn test_euclidean_distance() {
        let a = Embedding { values: vec![1.0, 0.0], model_version: None };
        let b = Embedding { values: vec![0.0, 1.0], model_version: None };
        assert!((a.euclidean_distance(&b) - 2f32.sqrt()).abs() < 1e-6);
        assert_eq!(a.euclidean_distance(&a), 0.0);
    }

    #[test]
    #[should_panic(expected = "embedding dimension mismatch")]
    fn test_euclidean_distance_dimension_mismatch_panics() {
        let a = Embedding { values: vec![1.0, 0.0], model_version: None };
        let b = Embedding { values: vec![1.0, 0.0, 0.0], model_version: None };
        a.euclidean_distance(&b);
    }

    #[test]
    fn test_employee_record_defaults() {
        let json = r#"{"id": "e-1", "display_name": "Ada"}"#;
        let record: EmployeeRecord = serde_json::from_str(json).unwrap();
        assert!(record.active);
        assert!(record.embeddings.is_empty());
        assert!(record.last_synced.is_none());
    }

    #[test]
    fn test_bbox_area_and_center() {
        let b = BoundingBox { x: 10.0, y: 20.0, width: 40.0, height: 60.0 };
        assert_eq!(b.area(), 2400.0);
        assert_eq!(b.center(), (30.0, 50.0));
    }
}
