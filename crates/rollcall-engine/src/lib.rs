//! rollcall-engine: Recognition pipeline orchestration.
//!
//! Wires the pure decision logic from `rollcall-core` to the external
//! collaborators (detector, embedding model, roster feed, camera) and to the
//! audit log. The [`FrameScheduler`] owns admission and the state machine;
//! the [`ErrorRecoveryController`] decides when to back off.

pub mod collaborators;
pub mod config;
pub mod outcome;
pub mod recovery;
pub mod scheduler;
pub mod slot;

pub use collaborators::{
    reload_from, CaptureControl, CollaboratorError, EmbeddingExtractor, FaceDetector,
    JsonRosterFile, RosterSource,
};
pub use config::EngineConfig;
pub use outcome::{Decision, RecognitionOutcome, SchedulerEvent};
pub use recovery::{
    restart_capture, BreakerState, ErrorRecoveryController, FailureKind, RecoveryAction,
    RecoveryConfig,
};
pub use scheduler::{
    Admission, CycleHandle, FrameScheduler, SchedulerBuilder, SchedulerConfig, SchedulerError,
    SchedulerState,
};
pub use slot::FrameSlot;
