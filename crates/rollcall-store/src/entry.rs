use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Per-row bookkeeping cost added to the payload bytes of an entry.
const ROW_OVERHEAD_BYTES: u64 = 96;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown result kind: {0}")]
pub struct UnknownResultKind(pub String);

/// Tag describing how a recognition attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    Matched,
    Unmatched,
    NoFace,
    MultipleFaces,
    QualityRejected,
    ExtractionFailed,
    NoReferenceData,
    /// Cycle abandoned because a collaborator failed.
    PipelineError,
}

impl ResultKind {
    pub const ALL: [ResultKind; 8] = [
        Self::Matched,
        Self::Unmatched,
        Self::NoFace,
        Self::MultipleFaces,
        Self::QualityRejected,
        Self::ExtractionFailed,
        Self::NoReferenceData,
        Self::PipelineError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Matched => "matched",
            Self::Unmatched => "unmatched",
            Self::NoFace => "no_face",
            Self::MultipleFaces => "multiple_faces",
            Self::QualityRejected => "quality_rejected",
            Self::ExtractionFailed => "extraction_failed",
            Self::NoReferenceData => "no_reference_data",
            Self::PipelineError => "pipeline_error",
        }
    }
}

impl std::fmt::Display for ResultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResultKind {
    type Err = UnknownResultKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| UnknownResultKind(s.to_string()))
    }
}

/// One persisted recognition attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognitionLogEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: ResultKind,
    pub identity_id: Option<String>,
    pub identity_name: Option<String>,
    pub confidence: Option<f32>,
    pub quality: Option<f32>,
    pub duration_ms: u64,
    /// Compressed face snapshot (JPEG).
    #[serde(skip)]
    pub image: Option<Vec<u8>>,
    pub error_message: Option<String>,
}

impl RecognitionLogEntry {
    /// New entry stamped with a fresh id and the current time.
    pub fn new(kind: ResultKind, duration_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind,
            identity_id: None,
            identity_name: None,
            confidence: None,
            quality: None,
            duration_ms,
            image: None,
            error_message: None,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_identity(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.identity_id = Some(id.into());
        self.identity_name = Some(name.into());
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_quality(mut self, quality: f32) -> Self {
        self.quality = Some(quality);
        self
    }

    pub fn with_image(mut self, jpeg: Vec<u8>) -> Self {
        self.image = Some(jpeg);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    /// Approximate storage footprint used for the byte budget.
    pub fn stored_size(&self) -> u64 {
        let text = |s: &Option<String>| s.as_ref().map_or(0, |s| s.len() as u64);
        ROW_OVERHEAD_BYTES
            + text(&self.identity_id)
            + text(&self.identity_name)
            + text(&self.error_message)
            + self.image.as_ref().map_or(0, |b| b.len() as u64)
    }
}

/// Filter for reading the log back, newest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogQuery {
    pub kind: Option<ResultKind>,
    /// Inclusive lower bound.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound.
    pub until: Option<DateTime<Utc>>,
    pub identity_id: Option<String>,
    pub limit: Option<usize>,
}

impl LogQuery {
    pub fn kind(mut self, kind: ResultKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn identity(mut self, identity_id: impl Into<String>) -> Self {
        self.identity_id = Some(identity_id.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}
