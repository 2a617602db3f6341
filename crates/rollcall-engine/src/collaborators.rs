//! Seams to the parts of the system this crate does not implement: the face
//! detector, the embedding model, the roster feed and the camera.

use rollcall_core::alignment::FaceCrop;
use rollcall_core::{DetectedFace, EmployeeRecord, EncodingCache, Frame, ReloadSummary};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CollaboratorError {
    #[error("detector failed: {0}")]
    Detector(String),
    #[error("embedding extractor failed: {0}")]
    Extractor(String),
    #[error("capture failed: {0}")]
    Capture(String),
    #[error("roster I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("roster parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Finds faces in a frame.
pub trait FaceDetector: Send {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<DetectedFace>, CollaboratorError>;
}

/// Turns an aligned face crop into a raw (unnormalized) embedding.
pub trait EmbeddingExtractor: Send {
    fn extract(&mut self, crop: &FaceCrop) -> Result<Vec<f32>, CollaboratorError>;

    /// Version tag attached to produced embeddings.
    fn model_version(&self) -> Option<&str> {
        None
    }
}

/// Supplier of enrolled identities.
pub trait RosterSource: Send + Sync {
    fn load(&self) -> Result<Vec<EmployeeRecord>, CollaboratorError>;
}

/// Camera lifecycle hook used when capture fails.
///
/// `restart` is called from async context and should return promptly.
pub trait CaptureControl: Send {
    fn restart(&mut self) -> Result<(), CollaboratorError>;
}

/// Roster stored as JSON: either a bare array of records or
/// `{ "employees": [...] }`.
#[derive(Debug, Clone)]
pub struct JsonRosterFile {
    path: PathBuf,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RosterDocument {
    Bare(Vec<EmployeeRecord>),
    Wrapped { employees: Vec<EmployeeRecord> },
}

impl JsonRosterFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn parse(json: &str) -> Result<Vec<EmployeeRecord>, CollaboratorError> {
        Ok(match serde_json::from_str(json)? {
            RosterDocument::Bare(records) => records,
            RosterDocument::Wrapped { employees } => employees,
        })
    }
}

impl RosterSource for JsonRosterFile {
    fn load(&self) -> Result<Vec<EmployeeRecord>, CollaboratorError> {
        let json = std::fs::read_to_string(&self.path)?;
        let records = Self::parse(&json)?;
        tracing::debug!(path = %self.path.display(), records = records.len(), "roster file read");
        Ok(records)
    }
}

/// Load `source` and publish it into `cache`. On failure the current gallery
/// stays in place.
pub fn reload_from(
    cache: &EncodingCache,
    source: &dyn RosterSource,
) -> Result<ReloadSummary, CollaboratorError> {
    let records = source.load().map_err(|e| {
        tracing::warn!(error = %e, "roster load failed; keeping current gallery");
        e
    })?;
    Ok(cache.reload(&records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const ROSTER: &str = r#"[
        {"id": "e-1", "display_name": "Ada", "embeddings": [{"values": [3.0, 4.0]}]},
        {"id": "e-2", "display_name": "Grace", "active": false,
         "embeddings": [{"values": [1.0, 0.0], "model_version": "v2"}]},
        {"id": "e-3", "display_name": "Linus", "last_synced": "2024-05-01T08:00:00Z"}
    ]"#;

    #[test]
    fn test_parse_bare_array() {
        let records = JsonRosterFile::parse(ROSTER).unwrap();
        assert_eq!(records.len(), 3);
        assert!(records[0].active);
        assert!(!records[1].active);
        assert!(records[2].embeddings.is_empty());
        assert!(records[2].last_synced.is_some());
    }

    #[test]
    fn test_parse_wrapped_document() {
        let json = format!(r#"{{"employees": {ROSTER}}}"#);
        assert_eq!(JsonRosterFile::parse(&json).unwrap().len(), 3);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            JsonRosterFile::parse("{\"nope\": 1}"),
            Err(CollaboratorError::Parse(_))
        ));
    }

    #[test]
    fn test_reload_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(ROSTER.as_bytes()).unwrap();

        let cache = EncodingCache::new();
        let summary = reload_from(&cache, &JsonRosterFile::new(file.path())).unwrap();
        assert_eq!(summary.identities, 1);
        assert_eq!(summary.skipped_inactive, 1);
        assert_eq!(summary.skipped_without_embeddings, 1);
        assert!(cache.snapshot().get("e-1").unwrap().embeddings[0].is_unit(1e-6));
    }

    #[test]
    fn test_failed_load_keeps_gallery() {
        let cache = EncodingCache::new();
        cache.reload(&JsonRosterFile::parse(ROSTER).unwrap());
        let missing = JsonRosterFile::new("/nonexistent/roster.json");
        assert!(matches!(reload_from(&cache, &missing), Err(CollaboratorError::Io(_))));
        assert_eq!(cache.snapshot().len(), 1);
    }
}
