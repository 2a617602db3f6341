//! Circuit breaker around the recognition pipeline and camera restart policy.

use crate::collaborators::{CaptureControl, CollaboratorError};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Failures in a row (within `failure_window`) that trip the breaker.
    pub max_consecutive_errors: u32,
    /// Failures further apart than this start a new run.
    pub failure_window: Duration,
    /// How long the breaker stays open before a trial cycle is allowed.
    pub cooldown: Duration,
    pub max_capture_restarts: u32,
    pub restart_backoff: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_consecutive_errors: 3,
            failure_window: Duration::from_secs(30),
            cooldown: Duration::from_secs(5),
            max_capture_restarts: 3,
            restart_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureKind {
    Detector,
    Extraction,
    Capture,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open { until: Instant },
    /// Cooldown elapsed; the next cycle decides whether to close or reopen.
    HalfOpen,
}

/// What the caller should do after reporting a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    Continue,
    Pause { cooldown: Duration },
}

#[derive(Debug)]
pub struct ErrorRecoveryController {
    config: RecoveryConfig,
    state: BreakerState,
    consecutive: u32,
    run_started: Option<Instant>,
}

impl ErrorRecoveryController {
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            state: BreakerState::Closed,
            consecutive: 0,
            run_started: None,
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive
    }

    pub fn record_failure(&mut self, kind: FailureKind, now: Instant) -> RecoveryAction {
        match self.state {
            BreakerState::Open { .. } => return RecoveryAction::Continue,
            BreakerState::HalfOpen => {
                tracing::warn!(?kind, "trial cycle failed; reopening breaker");
                return self.open(now);
            }
            BreakerState::Closed => {}
        }

        let expired = self
            .run_started
            .is_some_and(|start| now.saturating_duration_since(start) > self.config.failure_window);
        if expired || self.run_started.is_none() {
            self.run_started = Some(now);
            self.consecutive = 0;
        }
        self.consecutive += 1;

        tracing::debug!(?kind, consecutive = self.consecutive, "pipeline failure recorded");

        if self.consecutive >= self.config.max_consecutive_errors.max(1) {
            tracing::warn!(
                ?kind,
                failures = self.consecutive,
                cooldown_ms = self.config.cooldown.as_millis() as u64,
                "failure threshold reached; pausing recognition"
            );
            return self.open(now);
        }
        RecoveryAction::Continue
    }

    /// Clear the failure run. Ignored while the breaker is open: a cycle that
    /// started before the trip must not cut the cooldown short.
    pub fn record_success(&mut self) {
        if matches!(self.state, BreakerState::Open { .. }) {
            return;
        }
        if self.state == BreakerState::HalfOpen {
            tracing::info!("trial cycle succeeded; breaker closed");
        }
        self.state = BreakerState::Closed;
        self.consecutive = 0;
        self.run_started = None;
    }

    /// Move from `Open` to `HalfOpen` once the cooldown has passed.
    /// Returns true on that transition.
    pub fn try_half_open(&mut self, now: Instant) -> bool {
        match self.state {
            BreakerState::Open { until } if now >= until => {
                self.state = BreakerState::HalfOpen;
                self.consecutive = 0;
                self.run_started = None;
                true
            }
            _ => false,
        }
    }

    pub fn reset(&mut self) {
        self.state = BreakerState::Closed;
        self.consecutive = 0;
        self.run_started = None;
    }

    fn open(&mut self, now: Instant) -> RecoveryAction {
        let cooldown = self.config.cooldown;
        self.state = BreakerState::Open { until: now + cooldown };
        RecoveryAction::Pause { cooldown }
    }
}

/// Try to bring the camera back, up to `max_capture_restarts` attempts with
/// `restart_backoff` between them. Returns the attempt that succeeded.
pub async fn restart_capture<C>(
    control: &mut C,
    config: &RecoveryConfig,
) -> Result<u32, (u32, CollaboratorError)>
where
    C: CaptureControl + ?Sized,
{
    let max = config.max_capture_restarts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match control.restart() {
            Ok(()) => {
                tracing::info!(attempt, "capture restarted");
                return Ok(attempt);
            }
            Err(err) if attempt < max => {
                tracing::warn!(attempt, max, error = %err, "capture restart failed; retrying");
                tokio::time::sleep(config.restart_backoff).await;
            }
            Err(err) => {
                tracing::error!(
                    attempts = attempt,
                    error = %err,
                    "capture restart failed; giving up"
                );
                return Err((attempt, err));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RecoveryConfig {
        RecoveryConfig {
            max_consecutive_errors: 3,
            failure_window: Duration::from_secs(10),
            cooldown: Duration::from_secs(5),
            max_capture_restarts: 3,
            restart_backoff: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_trips_after_consecutive_failures() {
        let mut c = ErrorRecoveryController::new(config());
        let t0 = Instant::now();
        assert_eq!(c.record_failure(FailureKind::Extraction, t0), RecoveryAction::Continue);
        assert_eq!(c.record_failure(FailureKind::Detector, t0), RecoveryAction::Continue);
        assert_eq!(
            c.record_failure(FailureKind::Extraction, t0),
            RecoveryAction::Pause { cooldown: Duration::from_secs(5) }
        );
        assert!(matches!(c.state(), BreakerState::Open { .. }));
    }

    #[test]
    fn test_success_resets_the_run() {
        let mut c = ErrorRecoveryController::new(config());
        let t0 = Instant::now();
        c.record_failure(FailureKind::Extraction, t0);
        c.record_failure(FailureKind::Extraction, t0);
        c.record_success();
        assert_eq!(c.record_failure(FailureKind::Extraction, t0), RecoveryAction::Continue);
        assert_eq!(c.consecutive_failures(), 1);
    }

    #[test]
    fn test_failures_outside_window_start_a_new_run() {
        let mut c = ErrorRecoveryController::new(config());
        let t0 = Instant::now();
        c.record_failure(FailureKind::Extraction, t0);
        c.record_failure(FailureKind::Extraction, t0 + Duration::from_secs(1));
        let late = t0 + Duration::from_secs(11);
        assert_eq!(c.record_failure(FailureKind::Extraction, late), RecoveryAction::Continue);
        assert_eq!(c.consecutive_failures(), 1);
    }

    #[test]
    fn test_half_open_closes_on_success_and_reopens_on_failure() {
        let mut c = ErrorRecoveryController::new(config());
        let t0 = Instant::now();
        for _ in 0..3 {
            c.record_failure(FailureKind::Extraction, t0);
        }
        assert!(!c.try_half_open(t0 + Duration::from_secs(4)));
        assert!(c.try_half_open(t0 + Duration::from_secs(5)));
        assert_eq!(c.state(), BreakerState::HalfOpen);

        let t1 = t0 + Duration::from_secs(6);
        assert!(matches!(
            c.record_failure(FailureKind::Extraction, t1),
            RecoveryAction::Pause { .. }
        ));
        assert!(c.try_half_open(t1 + Duration::from_secs(5)));
        c.record_success();
        assert_eq!(c.state(), BreakerState::Closed);
    }

    #[test]
    fn test_failures_while_open_are_ignored() {
        let mut c = ErrorRecoveryController::new(config());
        let t0 = Instant::now();
        for _ in 0..3 {
            c.record_failure(FailureKind::Extraction, t0);
        }
        assert_eq!(c.record_failure(FailureKind::Capture, t0), RecoveryAction::Continue);
        assert!(matches!(c.state(), BreakerState::Open { .. }));
    }

    #[test]
    fn test_success_while_open_keeps_breaker_open() {
        let mut c = ErrorRecoveryController::new(config());
        let t0 = Instant::now();
        for _ in 0..3 {
            c.record_failure(FailureKind::Capture, t0);
        }
        c.record_success();
        assert!(matches!(c.state(), BreakerState::Open { .. }));
        assert!(c.try_half_open(t0 + Duration::from_secs(5)));
    }

    struct FlakyCamera {
        failures_left: u32,
        calls: u32,
    }

    impl CaptureControl for FlakyCamera {
        fn restart(&mut self) -> Result<(), CollaboratorError> {
            self.calls += 1;
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(CollaboratorError::Capture("device busy".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_restart_capture_retries_until_success() {
        let mut cam = FlakyCamera { failures_left: 2, calls: 0 };
        assert_eq!(restart_capture(&mut cam, &config()).await.unwrap(), 3);
        assert_eq!(cam.calls, 3);
    }

    #[tokio::test]
    async fn test_restart_capture_gives_up() {
        let mut cam = FlakyCamera { failures_left: 10, calls: 0 };
        let (attempts, err) = restart_capture(&mut cam, &config()).await.unwrap_err();
        assert_eq!(attempts, 3);
        assert_eq!(cam.calls, 3);
        assert!(matches!(err, CollaboratorError::Capture(_)));
    }
}
