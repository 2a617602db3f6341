use chrono::{DateTime, Utc};
use rollcall_core::{CaptureConditions, QualityIssue};
use rollcall_store::ResultKind;
use serde::Serialize;
use std::borrow::Cow;
use std::time::Duration;

/// How one recognition attempt ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecognitionOutcome {
    NoFaceDetected,
    MultipleFacesAmbiguous {
        faces: usize,
    },
    QualityRejected {
        score: f32,
        issue: QualityIssue,
    },
    ExtractionFailed {
        message: String,
    },
    NoReferenceData,
    Unmatched {
        distance: f32,
        threshold: f32,
        quality: f32,
    },
    Matched {
        identity_id: String,
        display_name: String,
        confidence: f32,
        distance: f32,
        quality: f32,
    },
}

impl RecognitionOutcome {
    /// Text to show the person in front of the camera.
    pub fn guidance(&self) -> Cow<'static, str> {
        match self {
            Self::NoFaceDetected => "No face detected. Please look at the camera.".into(),
            Self::MultipleFacesAmbiguous { .. } => {
                "Several faces in view. Please step up one at a time.".into()
            }
            Self::QualityRejected { issue, .. } => issue.guidance().into(),
            Self::ExtractionFailed { .. } => "Could not read your face. Please try again.".into(),
            Self::NoReferenceData => {
                "No enrolled faces are available. Please contact an administrator.".into()
            }
            Self::Unmatched { .. } => "Face not recognized.".into(),
            Self::Matched { display_name, .. } => format!("Welcome, {display_name}.").into(),
        }
    }

    pub fn kind(&self) -> ResultKind {
        match self {
            Self::NoFaceDetected => ResultKind::NoFace,
            Self::MultipleFacesAmbiguous { .. } => ResultKind::MultipleFaces,
            Self::QualityRejected { .. } => ResultKind::QualityRejected,
            Self::ExtractionFailed { .. } => ResultKind::ExtractionFailed,
            Self::NoReferenceData => ResultKind::NoReferenceData,
            Self::Unmatched { .. } => ResultKind::Unmatched,
            Self::Matched { .. } => ResultKind::Matched,
        }
    }

    pub fn is_match(&self) -> bool {
        matches!(self, Self::Matched { .. })
    }

    /// Whether this outcome counts as a pipeline failure for error recovery.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::ExtractionFailed { .. })
    }
}

/// A finished cycle as delivered to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub outcome: RecognitionOutcome,
    pub frame_sequence: u64,
    /// Composite quality of the selected face, when one was scored.
    pub quality: Option<f32>,
    pub conditions: CaptureConditions,
    /// Gallery generation the match ran against.
    pub gallery_generation: Option<u64>,
    pub duration: Duration,
    pub decided_at: DateTime<Utc>,
}

/// Everything the scheduler broadcasts.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    Decision(Box<Decision>),
    /// Processing suspended after repeated failures.
    Paused { cooldown: Duration },
    Resumed,
    /// The camera could not be restarted; the scheduler has stopped.
    CaptureUnrecoverable { attempts: u32, message: String },
}
