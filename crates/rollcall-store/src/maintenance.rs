use crate::schema;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Size and age limits for the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Hard entry limit.
    pub max_entries: u64,
    /// Hard byte limit, measured with `RecognitionLogEntry::stored_size`.
    pub max_bytes: u64,
    /// Fraction of each limit that eviction trims down to.
    pub watermark: f64,
    /// Entries older than this are removed on every pass.
    pub max_age: Duration,
    /// Period of the background pass; zero disables it.
    pub interval: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_bytes: 64 * 1024 * 1024,
            watermark: 0.8,
            max_age: Duration::from_secs(30 * 24 * 60 * 60),
            interval: Duration::from_secs(15 * 60),
        }
    }
}

impl RetentionPolicy {
    fn target_entries(&self) -> u64 {
        (self.max_entries as f64 * self.watermark.clamp(0.0, 1.0)).floor() as u64
    }

    fn target_bytes(&self) -> u64 {
        (self.max_bytes as f64 * self.watermark.clamp(0.0, 1.0)).floor() as u64
    }
}

/// What one maintenance pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub evicted_by_age: u64,
    pub evicted_by_count: u64,
    pub evicted_by_size: u64,
    pub remaining_entries: u64,
    pub remaining_bytes: u64,
}

impl MaintenanceReport {
    pub fn evicted(&self) -> u64 {
        self.evicted_by_age + self.evicted_by_count + self.evicted_by_size
    }
}

/// Run one maintenance pass inside a single transaction.
///
/// The age sweep runs first. If either hard limit is then exceeded, the
/// oldest entries are removed until both the entry count and the byte total
/// sit at or below `watermark` times their limit.
pub(crate) fn run(
    conn: &mut Connection,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> rusqlite::Result<MaintenanceReport> {
    let tx = conn.transaction()?;
    let mut report = MaintenanceReport::default();

    if let Some(cutoff) = chrono::Duration::from_std(policy.max_age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
    {
        report.evicted_by_age = schema::delete_older_than(&tx, cutoff)? as u64;
    }

    let stats = schema::stats(&tx)?;
    if stats.entries > policy.max_entries || stats.bytes > policy.max_bytes {
        let target_entries = policy.target_entries();
        if stats.entries > target_entries {
            report.evicted_by_count =
                schema::delete_oldest(&tx, stats.entries - target_entries)? as u64;
        }

        let bytes = schema::stats(&tx)?.bytes;
        let target_bytes = policy.target_bytes();
        if bytes > target_bytes {
            let (rows, _) = schema::delete_oldest_bytes(&tx, bytes - target_bytes)?;
            report.evicted_by_size = rows as u64;
        }
    }

    let after = schema::stats(&tx)?;
    tx.commit()?;

    report.remaining_entries = after.entries;
    report.remaining_bytes = after.bytes;
    Ok(report)
}
