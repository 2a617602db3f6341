//! rollcall-core: Face quality scoring and identity matching.
//!
//! Pure decision logic for the attendance pipeline: frame metadata, face
//! quality assessment, the atomically swapped encoding cache, and the
//! Euclidean nearest-neighbour matcher with adaptive thresholds.

pub mod alignment;
pub mod cache;
pub mod frame;
pub mod matcher;
pub mod quality;
pub mod snapshot;
pub mod types;

pub use cache::{EncodingCache, Gallery, GalleryEntry, ReloadSummary};
pub use frame::{Frame, PixelFormat};
pub use matcher::{CaptureConditions, EuclideanMatcher, Matcher, ThresholdPolicy};
pub use quality::{QualityAssessment, QualityAssessor, QualityConfig, QualityIssue};
pub use types::{
    BoundingBox, DetectedFace, Embedding, EmbeddingError, EmployeeRecord, HeadPose, MatchResult,
};
