//! Frame admission and the single-flight recognition cycle.
//!
//! At most one frame is processed at a time. A timer samples the latest-frame
//! slot at a fixed interval; ticks that land while a cycle is running (or
//! while the breaker holds the scheduler paused) leave the slot alone, so the
//! camera keeps overwriting it and nothing queues up.
//!
//! A cycle runs detection, quality scoring, extraction and matching
//! synchronously on the blocking pool against one gallery snapshot. `stop`
//! bumps an epoch; a cycle that finishes under an older epoch is discarded.

use crate::collaborators::{CaptureControl, CollaboratorError, EmbeddingExtractor, FaceDetector};
use crate::outcome::{Decision, RecognitionOutcome, SchedulerEvent};
use crate::recovery::{
    restart_capture, BreakerState, ErrorRecoveryController, FailureKind, RecoveryAction,
    RecoveryConfig,
};
use crate::slot::FrameSlot;
use chrono::Utc;
use rollcall_core::alignment::{face_sample, prepare_crop};
use rollcall_core::{
    snapshot, CaptureConditions, DetectedFace, Embedding, EncodingCache, EuclideanMatcher, Frame,
    Matcher, QualityAssessor, QualityConfig,
};
use rollcall_store::{RecognitionLogEntry, RecognitionLogStore, ResultKind};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Minimum spacing between recognition attempts.
    pub tick_interval: Duration,
    /// Faces scoring below this are rejected before extraction.
    pub quality_threshold: f32,
    /// Accepted faces below this count as low quality for the adaptive threshold.
    pub good_quality: f32,
    /// Base distance threshold before condition adjustments.
    pub match_threshold: f32,
    /// Runner-up face area, relative to the largest, that makes a frame ambiguous.
    pub ambiguity_ratio: f32,
    /// Side of the square crop handed to the extractor.
    pub crop_side: u32,
    /// Longest side of the sharpness sample.
    pub sample_max_side: u32,
    pub low_light_mean: f32,
    pub low_light_dark_fraction: f32,
    pub capture_snapshots: bool,
    pub snapshot_max_side: u32,
    pub snapshot_quality: u8,
    pub event_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(500),
            quality_threshold: 0.6,
            good_quality: 0.75,
            match_threshold: 1.0,
            ambiguity_ratio: 0.8,
            crop_side: 112,
            sample_max_side: 96,
            low_light_mean: 60.0,
            low_light_dark_fraction: 0.6,
            capture_snapshots: false,
            snapshot_max_side: 160,
            snapshot_quality: 75,
            event_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SchedulerState {
    Idle,
    Detecting,
    Scoring,
    Matching,
    Deciding,
    Paused,
    Stopped,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("cannot start while {0:?}")]
    InvalidStart(SchedulerState),
    #[error("frame timer already running")]
    AlreadyRunning,
}

/// Result of offering a frame to the scheduler.
pub enum Admission {
    Accepted(CycleHandle),
    /// A cycle is already in flight; the frame was dropped.
    Busy,
    Paused,
    Stopped,
}

impl Admission {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }
}

impl std::fmt::Debug for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Accepted(_) => "Accepted",
            Self::Busy => "Busy",
            Self::Paused => "Paused",
            Self::Stopped => "Stopped",
        })
    }
}

/// Completion handle for an admitted frame.
pub struct CycleHandle {
    inner: JoinHandle<Option<Decision>>,
}

impl CycleHandle {
    /// The decision, or `None` if the frame was abandoned on a collaborator
    /// error or discarded by `stop`.
    pub async fn decision(self) -> Option<Decision> {
        match self.inner.await {
            Ok(decision) => decision,
            Err(err) => {
                tracing::error!(error = %err, "recognition cycle panicked");
                None
            }
        }
    }
}

struct Pipeline {
    detector: Box<dyn FaceDetector>,
    extractor: Box<dyn EmbeddingExtractor>,
}

struct Shared {
    config: SchedulerConfig,
    assessor: QualityAssessor,
    matcher: Arc<dyn Matcher>,
    cache: Arc<EncodingCache>,
    log: Option<RecognitionLogStore>,
    pipeline: Mutex<Pipeline>,
    recovery: Mutex<ErrorRecoveryController>,
    state: Mutex<SchedulerState>,
    busy: AtomicBool,
    epoch: AtomicU64,
    events: broadcast::Sender<SchedulerEvent>,
    timer: Mutex<Option<JoinHandle<()>>>,
    resume: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SchedulerBuilder {
    config: SchedulerConfig,
    quality: QualityConfig,
    recovery: RecoveryConfig,
    detector: Box<dyn FaceDetector>,
    extractor: Box<dyn EmbeddingExtractor>,
    cache: Arc<EncodingCache>,
    matcher: Option<Arc<dyn Matcher>>,
    log: Option<RecognitionLogStore>,
}

impl SchedulerBuilder {
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn quality(mut self, quality: QualityConfig) -> Self {
        self.quality = quality;
        self
    }

    pub fn recovery(mut self, recovery: RecoveryConfig) -> Self {
        self.recovery = recovery;
        self
    }

    /// Defaults to [`EuclideanMatcher`] with the default threshold policy.
    pub fn matcher(mut self, matcher: Arc<dyn Matcher>) -> Self {
        self.matcher = Some(matcher);
        self
    }

    pub fn log_store(mut self, store: RecognitionLogStore) -> Self {
        self.log = Some(store);
        self
    }

    pub fn build(self) -> FrameScheduler {
        let (events, _) = broadcast::channel(self.config.event_capacity.max(1));
        let matcher = self
            .matcher
            .unwrap_or_else(|| Arc::new(EuclideanMatcher::default()));
        FrameScheduler {
            shared: Arc::new(Shared {
                assessor: QualityAssessor::new(self.quality),
                matcher,
                cache: self.cache,
                log: self.log,
                pipeline: Mutex::new(Pipeline {
                    detector: self.detector,
                    extractor: self.extractor,
                }),
                recovery: Mutex::new(ErrorRecoveryController::new(self.recovery)),
                state: Mutex::new(SchedulerState::Idle),
                busy: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                events,
                timer: Mutex::new(None),
                resume: Mutex::new(None),
                config: self.config,
            }),
        }
    }
}

/// Clone-safe handle to the recognition pipeline.
#[derive(Clone)]
pub struct FrameScheduler {
    shared: Arc<Shared>,
}

impl FrameScheduler {
    pub fn builder(
        detector: Box<dyn FaceDetector>,
        extractor: Box<dyn EmbeddingExtractor>,
        cache: Arc<EncodingCache>,
    ) -> SchedulerBuilder {
        SchedulerBuilder {
            config: SchedulerConfig::default(),
            quality: QualityConfig::default(),
            recovery: RecoveryConfig::default(),
            detector,
            extractor,
            cache,
            matcher: None,
            log: None,
        }
    }

    pub fn state(&self) -> SchedulerState {
        *lock(&self.shared.state)
    }

    pub fn is_busy(&self) -> bool {
        self.shared.busy.load(Ordering::Acquire)
    }

    pub fn breaker_state(&self) -> BreakerState {
        lock(&self.shared.recovery).state()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.shared.events.subscribe()
    }

    pub fn cache(&self) -> &Arc<EncodingCache> {
        &self.shared.cache
    }

    /// Offer one frame. Runs a cycle on the blocking pool unless one is
    /// already in flight or the scheduler is paused or stopped.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime.
    pub fn admit_frame(&self, frame: Frame) -> Admission {
        let epoch = {
            let mut state = lock(&self.shared.state);
            match *state {
                SchedulerState::Stopped => return Admission::Stopped,
                SchedulerState::Paused => return Admission::Paused,
                _ => {}
            }
            if self
                .shared
                .busy
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                tracing::trace!(sequence = frame.sequence, "cycle in flight; frame dropped");
                return Admission::Busy;
            }
            *state = SchedulerState::Detecting;
            self.shared.epoch.load(Ordering::SeqCst)
        };

        let shared = Arc::clone(&self.shared);
        let runtime = tokio::runtime::Handle::current();
        let inner = tokio::task::spawn_blocking(move || shared.run_cycle(frame, epoch, &runtime));
        Admission::Accepted(CycleHandle { inner })
    }

    /// Start sampling `slot` on the configured interval. Valid from `Idle`
    /// or `Stopped`.
    pub fn start(&self, slot: Arc<FrameSlot>) -> Result<(), SchedulerError> {
        let mut state = lock(&self.shared.state);
        match *state {
            SchedulerState::Idle | SchedulerState::Stopped => {}
            other => return Err(SchedulerError::InvalidStart(other)),
        }
        let mut timer = lock(&self.shared.timer);
        if timer.as_ref().is_some_and(|t| !t.is_finished()) {
            return Err(SchedulerError::AlreadyRunning);
        }

        lock(&self.shared.recovery).reset();
        *state = SchedulerState::Idle;
        let epoch = self.shared.epoch.load(Ordering::SeqCst);
        let this = self.clone();
        *timer = Some(tokio::spawn(async move { this.timer_loop(slot, epoch).await }));

        tracing::info!(
            interval_ms = self.shared.config.tick_interval.as_millis() as u64,
            "frame scheduler started"
        );
        Ok(())
    }

    /// Stop sampling. Any cycle still running finishes in the background and
    /// its result is dropped.
    pub fn stop(&self) {
        {
            let mut state = lock(&self.shared.state);
            self.shared.epoch.fetch_add(1, Ordering::SeqCst);
            *state = SchedulerState::Stopped;
            self.shared.busy.store(false, Ordering::Release);
        }
        if let Some(timer) = lock(&self.shared.timer).take() {
            timer.abort();
        }
        if let Some(resume) = lock(&self.shared.resume).take() {
            resume.abort();
        }
        tracing::info!("frame scheduler stopped");
    }

    /// Handle a camera failure: count it against the breaker, then try to
    /// restart capture. If every restart fails the scheduler stops and
    /// `CaptureUnrecoverable` is broadcast.
    pub async fn report_capture_failure<C>(&self, control: &mut C, error: CollaboratorError)
    where
        C: CaptureControl + ?Sized,
    {
        tracing::warn!(error = %error, "capture failure reported");
        let action =
            lock(&self.shared.recovery).record_failure(FailureKind::Capture, Instant::now());
        if let RecoveryAction::Pause { cooldown } = action {
            let epoch = self.shared.epoch.load(Ordering::SeqCst);
            if self.shared.pause(epoch, cooldown, &tokio::runtime::Handle::current()) {
                self.shared.emit(SchedulerEvent::Paused { cooldown });
            }
        }

        let config = lock(&self.shared.recovery).config().clone();
        if let Err((attempts, err)) = restart_capture(control, &config).await {
            self.stop();
            self.shared.emit(SchedulerEvent::CaptureUnrecoverable {
                attempts,
                message: err.to_string(),
            });
        }
    }

    async fn timer_loop(self, slot: Arc<FrameSlot>, epoch: u64) {
        let mut ticker = tokio::time::interval(self.shared.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if self.shared.epoch.load(Ordering::SeqCst) != epoch {
                break;
            }
            if self.is_busy() || self.state() == SchedulerState::Paused {
                continue;
            }
            let Some(frame) = slot.take() else {
                continue;
            };
            let sequence = frame.sequence;
            let admission = self.admit_frame(frame);
            tracing::trace!(sequence, ?admission, "timer tick");
        }
    }
}

/// Why a cycle ended without a decision.
struct Abandoned {
    kind: FailureKind,
    error: CollaboratorError,
}

struct CycleOutput {
    outcome: RecognitionOutcome,
    face: Option<DetectedFace>,
    quality: Option<f32>,
    conditions: CaptureConditions,
    gallery_generation: Option<u64>,
}

impl CycleOutput {
    fn early(outcome: RecognitionOutcome) -> Self {
        Self {
            outcome,
            face: None,
            quality: None,
            conditions: CaptureConditions::default(),
            gallery_generation: None,
        }
    }
}

impl Shared {
    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    /// Advance the cycle's state. `Paused` is only left by the cooldown task.
    fn enter(&self, epoch: u64, next: SchedulerState) {
        let mut state = lock(&self.state);
        if self.is_current(epoch) && *state != SchedulerState::Paused {
            *state = next;
        }
    }

    fn emit(&self, event: SchedulerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn run_cycle(
        self: Arc<Self>,
        frame: Frame,
        epoch: u64,
        runtime: &tokio::runtime::Handle,
    ) -> Option<Decision> {
        let started = Instant::now();
        let result = {
            let mut pipeline = lock(&self.pipeline);
            self.process(&mut pipeline, &frame, epoch)
        };
        let duration = started.elapsed();

        if !self.is_current(epoch) {
            tracing::debug!(
                sequence = frame.sequence,
                "scheduler stopped mid-cycle; result discarded"
            );
            return None;
        }

        let now = Instant::now();
        match result {
            Ok(output) => {
                let action = {
                    let mut recovery = lock(&self.recovery);
                    if output.outcome.is_failure() {
                        recovery.record_failure(FailureKind::Extraction, now)
                    } else {
                        recovery.record_success();
                        RecoveryAction::Continue
                    }
                };

                let decision = Decision {
                    outcome: output.outcome,
                    frame_sequence: frame.sequence,
                    quality: output.quality,
                    conditions: output.conditions,
                    gallery_generation: output.gallery_generation,
                    duration,
                    decided_at: Utc::now(),
                };
                self.log_decision(&decision, &frame, output.face.as_ref());

                tracing::info!(
                    sequence = frame.sequence,
                    outcome = %decision.outcome.kind(),
                    quality = ?decision.quality,
                    duration_ms = duration.as_millis() as u64,
                    "recognition decision"
                );

                self.finish(epoch, action, runtime);
                self.emit(SchedulerEvent::Decision(Box::new(decision.clone())));
                if let RecoveryAction::Pause { cooldown } = action {
                    self.emit(SchedulerEvent::Paused { cooldown });
                }
                Some(decision)
            }
            Err(abandoned) => {
                tracing::warn!(
                    sequence = frame.sequence,
                    kind = ?abandoned.kind,
                    error = %abandoned.error,
                    "recognition cycle abandoned"
                );
                if let Some(log) = &self.log {
                    let elapsed_ms = duration.as_millis() as u64;
                    log.append(
                        RecognitionLogEntry::new(ResultKind::PipelineError, elapsed_ms)
                            .with_error(abandoned.error.to_string()),
                    );
                }
                let action = lock(&self.recovery).record_failure(abandoned.kind, now);
                self.finish(epoch, action, runtime);
                if let RecoveryAction::Pause { cooldown } = action {
                    self.emit(SchedulerEvent::Paused { cooldown });
                }
                None
            }
        }
    }

    /// Leave the cycle: back to `Idle`, or `Paused` if the breaker tripped.
    fn finish(
        self: &Arc<Self>,
        epoch: u64,
        action: RecoveryAction,
        runtime: &tokio::runtime::Handle,
    ) {
        match action {
            RecoveryAction::Continue => self.enter(epoch, SchedulerState::Idle),
            RecoveryAction::Pause { cooldown } => {
                self.pause(epoch, cooldown, runtime);
            }
        }
        let state = lock(&self.state);
        if self.is_current(epoch) {
            self.busy.store(false, Ordering::Release);
        }
        drop(state);
    }

    /// Enter `Paused` and schedule the resume. False if the scheduler was
    /// stopped in the meantime.
    fn pause(
        self: &Arc<Self>,
        epoch: u64,
        cooldown: Duration,
        runtime: &tokio::runtime::Handle,
    ) -> bool {
        {
            let mut state = lock(&self.state);
            if !self.is_current(epoch) {
                return false;
            }
            *state = SchedulerState::Paused;
        }
        let shared = Arc::clone(self);
        let task = runtime.spawn(async move {
            tokio::time::sleep(cooldown).await;
            shared.resume_after_cooldown(epoch);
        });
        if let Some(previous) = lock(&self.resume).replace(task) {
            previous.abort();
        }
        true
    }

    fn resume_after_cooldown(&self, epoch: u64) {
        {
            let mut state = lock(&self.state);
            if !self.is_current(epoch) || *state != SchedulerState::Paused {
                return;
            }
            if !lock(&self.recovery).try_half_open(Instant::now()) {
                return;
            }
            *state = SchedulerState::Idle;
        }
        tracing::info!("cooldown elapsed; recognition resumed");
        self.emit(SchedulerEvent::Resumed);
    }

    fn process(
        &self,
        pipeline: &mut Pipeline,
        frame: &Frame,
        epoch: u64,
    ) -> Result<CycleOutput, Abandoned> {
        let cfg = &self.config;

        self.enter(epoch, SchedulerState::Detecting);
        let faces = pipeline.detector.detect(frame).map_err(|error| Abandoned {
            kind: FailureKind::Detector,
            error,
        })?;

        let Some(face) = select_face(&faces, cfg.ambiguity_ratio) else {
            return Ok(CycleOutput::early(if faces.is_empty() {
                RecognitionOutcome::NoFaceDetected
            } else {
                RecognitionOutcome::MultipleFacesAmbiguous { faces: faces.len() }
            }));
        };

        self.enter(epoch, SchedulerState::Scoring);
        let (upright_width, _) = frame.upright_size();
        let sample = face_sample(frame, &face.bbox, cfg.sample_max_side);
        let assessment = self.assessor.assess(face, upright_width, sample.as_ref());
        let quality = assessment.score;
        let conditions = CaptureConditions {
            low_light: frame.is_low_light(cfg.low_light_mean, cfg.low_light_dark_fraction),
            low_quality: quality < cfg.good_quality,
            outdoor: frame.outdoor,
        };

        let mut output = CycleOutput {
            outcome: RecognitionOutcome::NoReferenceData,
            face: Some(face.clone()),
            quality: Some(quality),
            conditions,
            gallery_generation: None,
        };

        if !QualityAssessor::is_acceptable(quality, cfg.quality_threshold) {
            output.outcome = RecognitionOutcome::QualityRejected {
                score: quality,
                issue: assessment.rejection_issue(),
            };
            return Ok(output);
        }

        self.enter(epoch, SchedulerState::Matching);
        // Pin the roster for the rest of the cycle.
        let gallery = self.cache.snapshot();
        output.gallery_generation = Some(gallery.generation());
        if gallery.is_empty() {
            return Ok(output);
        }

        let embedding = match extract(pipeline.extractor.as_mut(), frame, face, cfg.crop_side) {
            Ok(e) => e,
            Err(message) => {
                output.outcome = RecognitionOutcome::ExtractionFailed { message };
                return Ok(output);
            }
        };
        if let Some(dim) = gallery.dim().filter(|&d| d != embedding.dim()) {
            output.outcome = RecognitionOutcome::ExtractionFailed {
                message: format!(
                    "embedding has {} dimensions, gallery expects {dim}",
                    embedding.dim()
                ),
            };
            return Ok(output);
        }

        let Some(result) = self
            .matcher
            .find_best_match(&embedding, &gallery, cfg.match_threshold, &conditions)
        else {
            return Ok(output);
        };

        self.enter(epoch, SchedulerState::Deciding);
        output.outcome = match (result.is_match, result.identity_id, result.display_name) {
            (true, Some(identity_id), display_name) => RecognitionOutcome::Matched {
                display_name: display_name.unwrap_or_else(|| identity_id.clone()),
                identity_id,
                confidence: result.confidence,
                distance: result.distance,
                quality,
            },
            _ => RecognitionOutcome::Unmatched {
                distance: result.distance,
                threshold: result.threshold,
                quality,
            },
        };
        Ok(output)
    }

    fn log_decision(&self, decision: &Decision, frame: &Frame, face: Option<&DetectedFace>) {
        let Some(log) = &self.log else {
            return;
        };
        let mut entry =
            RecognitionLogEntry::new(decision.outcome.kind(), decision.duration.as_millis() as u64);
        if let Some(q) = decision.quality {
            entry = entry.with_quality(q);
        }
        match &decision.outcome {
            RecognitionOutcome::Matched {
                identity_id,
                display_name,
                confidence,
                ..
            } => {
                entry = entry
                    .with_identity(identity_id.clone(), display_name.clone())
                    .with_confidence(*confidence);
            }
            RecognitionOutcome::ExtractionFailed { message } => {
                entry = entry.with_error(message.clone());
            }
            _ => {}
        }
        if self.config.capture_snapshots {
            if let Some(jpeg) = face.and_then(|f| self.snapshot(frame, f)) {
                entry = entry.with_image(jpeg);
            }
        }
        log.append(entry);
    }

    fn snapshot(&self, frame: &Frame, face: &DetectedFace) -> Option<Vec<u8>> {
        let cfg = &self.config;
        let image = face_sample(frame, &face.bbox, cfg.snapshot_max_side)?;
        match snapshot::encode_jpeg(&image, cfg.snapshot_max_side, cfg.snapshot_quality) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                tracing::warn!(error = %err, "face snapshot encoding failed");
                None
            }
        }
    }
}

/// Largest face, or `None` when the frame is empty or the runner-up is too
/// close in size to call.
fn select_face(faces: &[DetectedFace], ambiguity_ratio: f32) -> Option<&DetectedFace> {
    let mut by_area: Vec<&DetectedFace> = faces.iter().collect();
    by_area.sort_by(|a, b| b.bbox.area().total_cmp(&a.bbox.area()));
    match by_area.as_slice() {
        [] => None,
        [only] => Some(*only),
        [largest, runner_up, ..] => {
            let largest_area = largest.bbox.area();
            let dominant =
                largest_area > 0.0 && runner_up.bbox.area() < ambiguity_ratio * largest_area;
            dominant.then_some(*largest)
        }
    }
}

fn extract(
    extractor: &mut dyn EmbeddingExtractor,
    frame: &Frame,
    face: &DetectedFace,
    side: u32,
) -> Result<Embedding, String> {
    let crop =
        prepare_crop(frame, face, side).ok_or_else(|| "face region unavailable".to_string())?;
    let raw = extractor.extract(&crop).map_err(|e| e.to_string())?;
    let model_version = extractor.model_version().map(str::to_string);
    Embedding::normalized(raw, model_version).map_err(|e| e.to_string())
}
