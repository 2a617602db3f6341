use crate::recovery::RecoveryConfig;
use crate::scheduler::SchedulerConfig;
use rollcall_core::{QualityConfig, ThresholdPolicy};
use rollcall_store::{LogStoreConfig, RetentionPolicy};
use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// SQLite audit log (default: `$XDG_DATA_HOME/rollcall/recognition.db`).
    pub log_path: PathBuf,
    /// JSON roster file, if one is configured.
    pub roster_path: Option<PathBuf>,
    /// Required embedding dimension; unset accepts whatever the roster holds.
    pub embedding_dim: Option<usize>,
    pub log_channel_capacity: usize,
    pub scheduler: SchedulerConfig,
    pub quality: QualityConfig,
    pub threshold: ThresholdPolicy,
    pub recovery: RecoveryConfig,
    pub retention: RetentionPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl EngineConfig {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);

        let data_dir = lookup("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let log_path = lookup("ROLLCALL_LOG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("recognition.db"));

        let sd = SchedulerConfig::default();
        let scheduler = SchedulerConfig {
            tick_interval: env.millis("ROLLCALL_TICK_INTERVAL_MS", sd.tick_interval),
            quality_threshold: env.f32("ROLLCALL_QUALITY_THRESHOLD", sd.quality_threshold),
            good_quality: env.f32("ROLLCALL_GOOD_QUALITY", sd.good_quality),
            match_threshold: env.f32("ROLLCALL_MATCH_THRESHOLD", sd.match_threshold),
            ambiguity_ratio: env.f32("ROLLCALL_AMBIGUITY_RATIO", sd.ambiguity_ratio),
            crop_side: env.u32("ROLLCALL_CROP_SIDE", sd.crop_side),
            sample_max_side: env.u32("ROLLCALL_SAMPLE_MAX_SIDE", sd.sample_max_side),
            low_light_mean: env.f32("ROLLCALL_LOW_LIGHT_MEAN", sd.low_light_mean),
            low_light_dark_fraction: env.f32(
                "ROLLCALL_LOW_LIGHT_DARK_FRACTION",
                sd.low_light_dark_fraction,
            ),
            capture_snapshots: env.flag("ROLLCALL_CAPTURE_SNAPSHOTS", sd.capture_snapshots),
            snapshot_max_side: env.u32("ROLLCALL_SNAPSHOT_MAX_SIDE", sd.snapshot_max_side),
            snapshot_quality: env
                .u32("ROLLCALL_SNAPSHOT_QUALITY", sd.snapshot_quality as u32)
                .min(100) as u8,
            event_capacity: env.usize("ROLLCALL_EVENT_CAPACITY", sd.event_capacity),
        };

        let qd = QualityConfig::default();
        let quality = QualityConfig {
            weights: rollcall_core::quality::QualityWeights {
                detection: env.f32("ROLLCALL_WEIGHT_DETECTION", qd.weights.detection),
                orientation: env.f32("ROLLCALL_WEIGHT_ORIENTATION", qd.weights.orientation),
                size: env.f32("ROLLCALL_WEIGHT_SIZE", qd.weights.size),
                sharpness: env.f32("ROLLCALL_WEIGHT_SHARPNESS", qd.weights.sharpness),
            },
            max_angle_deg: env.f32("ROLLCALL_MAX_ANGLE_DEG", qd.max_angle_deg),
            min_face_fraction: env.f32("ROLLCALL_MIN_FACE_FRACTION", qd.min_face_fraction),
            ideal_min_fraction: env.f32("ROLLCALL_IDEAL_MIN_FRACTION", qd.ideal_min_fraction),
            ideal_max_fraction: env.f32("ROLLCALL_IDEAL_MAX_FRACTION", qd.ideal_max_fraction),
            max_face_fraction: env.f32("ROLLCALL_MAX_FACE_FRACTION", qd.max_face_fraction),
            too_close_floor: env.f32("ROLLCALL_TOO_CLOSE_FLOOR", qd.too_close_floor),
            blur_low_variance: env.f32("ROLLCALL_BLUR_LOW_VARIANCE", qd.blur_low_variance),
            blur_high_variance: env.f32("ROLLCALL_BLUR_HIGH_VARIANCE", qd.blur_high_variance),
            eyes_closed_below: env.f32("ROLLCALL_EYES_CLOSED_BELOW", qd.eyes_closed_below),
            issue_floor: env.f32("ROLLCALL_ISSUE_FLOOR", qd.issue_floor),
        };

        let td = ThresholdPolicy::default();
        let threshold = ThresholdPolicy {
            strict_bound: env.f32("ROLLCALL_STRICT_BOUND", td.strict_bound),
            lenient_bound: env.f32("ROLLCALL_LENIENT_BOUND", td.lenient_bound),
            low_light_increment: env.f32("ROLLCALL_LOW_LIGHT_INCREMENT", td.low_light_increment),
            low_quality_increment: env
                .f32("ROLLCALL_LOW_QUALITY_INCREMENT", td.low_quality_increment),
            outdoor_increment: env.f32("ROLLCALL_OUTDOOR_INCREMENT", td.outdoor_increment),
        };

        let rd = RecoveryConfig::default();
        let recovery = RecoveryConfig {
            max_consecutive_errors: env
                .u32("ROLLCALL_MAX_CONSECUTIVE_ERRORS", rd.max_consecutive_errors),
            failure_window: env.millis("ROLLCALL_FAILURE_WINDOW_MS", rd.failure_window),
            cooldown: env.millis("ROLLCALL_COOLDOWN_MS", rd.cooldown),
            max_capture_restarts: env.u32("ROLLCALL_MAX_CAPTURE_RESTARTS", rd.max_capture_restarts),
            restart_backoff: env.millis("ROLLCALL_RESTART_BACKOFF_MS", rd.restart_backoff),
        };

        let pd = RetentionPolicy::default();
        let retention = RetentionPolicy {
            max_entries: env.u64("ROLLCALL_LOG_MAX_ENTRIES", pd.max_entries),
            max_bytes: env.u64("ROLLCALL_LOG_MAX_BYTES", pd.max_bytes),
            watermark: env.f64("ROLLCALL_LOG_WATERMARK", pd.watermark),
            max_age: Duration::from_secs(
                env.u64("ROLLCALL_LOG_MAX_AGE_DAYS", pd.max_age.as_secs() / 86_400) * 86_400,
            ),
            interval: env.secs("ROLLCALL_LOG_MAINTENANCE_SECS", pd.interval),
        };

        Self {
            log_path,
            roster_path: lookup("ROLLCALL_ROSTER_PATH").map(PathBuf::from),
            embedding_dim: lookup("ROLLCALL_EMBEDDING_DIM").and_then(|v| v.parse().ok()),
            log_channel_capacity: env.usize(
                "ROLLCALL_LOG_CHANNEL_CAPACITY",
                LogStoreConfig::default().channel_capacity,
            ),
            scheduler,
            quality,
            threshold,
            recovery,
            retention,
        }
    }

    pub fn log_store_config(&self) -> LogStoreConfig {
        LogStoreConfig {
            channel_capacity: self.log_channel_capacity,
            retention: self.retention.clone(),
        }
    }
}

/// Typed accessors over a variable lookup; unparsable values fall back to the default.
struct Env<'a, F>(&'a F);

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        (self.0)(key).and_then(|v| v.trim().parse().ok())
    }

    fn f32(&self, key: &str, default: f32) -> f32 {
        self.parse(key).unwrap_or(default)
    }

    fn f64(&self, key: &str, default: f64) -> f64 {
        self.parse(key).unwrap_or(default)
    }

    fn u32(&self, key: &str, default: u32) -> u32 {
        self.parse(key).unwrap_or(default)
    }

    fn u64(&self, key: &str, default: u64) -> u64 {
        self.parse(key).unwrap_or(default)
    }

    fn usize(&self, key: &str, default: usize) -> usize {
        self.parse(key).unwrap_or(default)
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        self.parse(key).map(Duration::from_millis).unwrap_or(default)
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        self.parse(key).map(Duration::from_secs).unwrap_or(default)
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        (self.0)(key)
            .map(|v| !matches!(v.trim(), "0" | "false" | "no" | "off" | ""))
            .unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> EngineConfig {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EngineConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = config(&[("HOME", "/home/ada")]);
        assert_eq!(cfg.log_path, PathBuf::from("/home/ada/.local/share/rollcall/recognition.db"));
        assert_eq!(cfg.roster_path, None);
        assert_eq!(cfg.scheduler, SchedulerConfig::default());
        assert_eq!(cfg.quality, QualityConfig::default());
        assert_eq!(cfg.threshold, ThresholdPolicy::default());
        assert_eq!(cfg.recovery, RecoveryConfig::default());
        assert_eq!(cfg.retention, RetentionPolicy::default());
    }

    #[test]
    fn test_overrides() {
        let cfg = config(&[
            ("XDG_DATA_HOME", "/data"),
            ("ROLLCALL_ROSTER_PATH", "/etc/rollcall/roster.json"),
            ("ROLLCALL_MATCH_THRESHOLD", "0.9"),
            ("ROLLCALL_COOLDOWN_MS", "2500"),
            ("ROLLCALL_LOG_MAX_ENTRIES", "500"),
            ("ROLLCALL_LOG_MAINTENANCE_SECS", "0"),
            ("ROLLCALL_CAPTURE_SNAPSHOTS", "1"),
            ("ROLLCALL_LOW_LIGHT_INCREMENT", "0.2"),
            ("ROLLCALL_EMBEDDING_DIM", "192"),
        ]);
        assert_eq!(cfg.log_path, PathBuf::from("/data/rollcall/recognition.db"));
        assert_eq!(cfg.roster_path, Some(PathBuf::from("/etc/rollcall/roster.json")));
        assert_eq!(cfg.scheduler.match_threshold, 0.9);
        assert!(cfg.scheduler.capture_snapshots);
        assert_eq!(cfg.recovery.cooldown, Duration::from_millis(2500));
        assert_eq!(cfg.retention.max_entries, 500);
        assert!(cfg.retention.interval.is_zero());
        assert_eq!(cfg.threshold.low_light_increment, 0.2);
        assert_eq!(cfg.embedding_dim, Some(192));
        assert_eq!(cfg.log_store_config().retention.max_entries, 500);
    }

    #[test]
    fn test_unparsable_values_fall_back() {
        let cfg = config(&[
            ("ROLLCALL_QUALITY_THRESHOLD", "high"),
            ("ROLLCALL_CAPTURE_SNAPSHOTS", "off"),
            ("ROLLCALL_SNAPSHOT_QUALITY", "400"),
        ]);
        assert_eq!(cfg.scheduler.quality_threshold, SchedulerConfig::default().quality_threshold);
        assert!(!cfg.scheduler.capture_snapshots);
        assert_eq!(cfg.scheduler.snapshot_quality, 100);
    }
}
