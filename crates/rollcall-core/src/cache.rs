//! In-memory registry of enrolled identity embeddings.
//!
//! The cache holds one immutable [`Gallery`] behind an [`ArcSwap`]. A reload
//! builds a complete new gallery off to the side and publishes it with a
//! single pointer swap, so a match that already holds a snapshot keeps seeing
//! the old roster until it drops it.

use crate::types::{Embedding, EmployeeRecord};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One enrolled identity and its normalized reference embeddings.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub identity_id: String,
    pub display_name: String,
    pub embeddings: Vec<Embedding>,
}

/// Immutable comparison set built from one roster load.
#[derive(Debug)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
    index: HashMap<String, usize>,
    dim: Option<usize>,
    generation: u64,
    built_at: DateTime<Utc>,
}

impl Gallery {
    fn empty(generation: u64) -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
            dim: None,
            generation,
            built_at: Utc::now(),
        }
    }

    /// Entries in roster order.
    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn get(&self, identity_id: &str) -> Option<&GalleryEntry> {
        self.index.get(identity_id).map(|&i| &self.entries[i])
    }

    /// Number of identities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn embedding_count(&self) -> usize {
        self.entries.iter().map(|e| e.embeddings.len()).sum()
    }

    /// Embedding dimension shared by every reference, if any were loaded.
    pub fn dim(&self) -> Option<usize> {
        self.dim
    }

    /// Monotonic reload counter; 0 for the initial empty gallery.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }
}

/// Outcome of a roster reload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReloadSummary {
    pub generation: u64,
    pub identities: usize,
    pub embeddings: usize,
    pub skipped_inactive: usize,
    pub skipped_without_embeddings: usize,
    /// References dropped for being non-normalizable or of the wrong dimension.
    pub rejected_embeddings: usize,
}

/// Atomically swapped encoding cache.
pub struct EncodingCache {
    current: ArcSwap<Gallery>,
    generation: AtomicU64,
    expected_dim: Option<usize>,
}

impl Default for EncodingCache {
    fn default() -> Self {
        Self::new()
    }
}

impl EncodingCache {
    /// Empty cache; the first valid reference fixes the dimension of each load.
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(Gallery::empty(0)),
            generation: AtomicU64::new(0),
            expected_dim: None,
        }
    }

    /// Empty cache that only accepts references of `dim` dimensions.
    pub fn with_dimension(dim: usize) -> Self {
        Self {
            expected_dim: Some(dim),
            ..Self::new()
        }
    }

    /// Current snapshot. Holding the returned `Arc` pins that roster.
    pub fn snapshot(&self) -> Arc<Gallery> {
        self.current.load_full()
    }

    /// Rebuild the gallery from `records` and publish it in one swap.
    pub fn reload(&self, records: &[EmployeeRecord]) -> ReloadSummary {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut gallery = Gallery::empty(generation);
        gallery.dim = self.expected_dim;
        let mut summary = ReloadSummary {
            generation,
            ..ReloadSummary::default()
        };

        for record in records {
            if !record.active {
                summary.skipped_inactive += 1;
                continue;
            }

            let mut accepted = Vec::with_capacity(record.embeddings.len());
            for reference in &record.embeddings {
                let normalized = match Embedding::normalized(
                    reference.values.clone(),
                    reference.model_version.clone(),
                ) {
                    Ok(e) => e,
                    Err(err) => {
                        tracing::warn!(
                            identity = %record.id,
                            error = %err,
                            "rejecting reference embedding"
                        );
                        summary.rejected_embeddings += 1;
                        continue;
                    }
                };
                match gallery.dim {
                    Some(dim) if dim != normalized.dim() => {
                        tracing::warn!(
                            identity = %record.id,
                            expected = dim,
                            got = normalized.dim(),
                            "rejecting reference embedding with wrong dimension"
                        );
                        summary.rejected_embeddings += 1;
                        continue;
                    }
                    Some(_) => {}
                    None => gallery.dim = Some(normalized.dim()),
                }
                accepted.push(normalized);
            }

            if accepted.is_empty() {
                summary.skipped_without_embeddings += 1;
                continue;
            }

            summary.embeddings += accepted.len();
            match gallery.index.get(&record.id) {
                Some(&i) => gallery.entries[i].embeddings.extend(accepted),
                None => {
                    gallery.index.insert(record.id.clone(), gallery.entries.len());
                    gallery.entries.push(GalleryEntry {
                        identity_id: record.id.clone(),
                        display_name: record.display_name.clone(),
                        embeddings: accepted,
                    });
                }
            }
        }

        summary.identities = gallery.entries.len();
        self.current.store(Arc::new(gallery));

        tracing::info!(
            generation,
            identities = summary.identities,
            embeddings = summary.embeddings,
            skipped_inactive = summary.skipped_inactive,
            skipped_without_embeddings = summary.skipped_without_embeddings,
            rejected_embeddings = summary.rejected_embeddings,
            "encoding cache reloaded"
        );

        summary
    }

    /// Publish an empty gallery.
    pub fn clear(&self) {
        self.reload(&[]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, refs: Vec<Vec<f32>>) -> EmployeeRecord {
        EmployeeRecord {
            id: id.into(),
            display_name: id.to_uppercase(),
            embeddings: refs
                .into_iter()
                .map(|values| Embedding { values, model_version: None })
                .collect(),
            active: true,
            last_synced: None,
        }
    }

    #[test]
    fn test_new_cache_is_empty() {
        let cache = EncodingCache::new();
        let g = cache.snapshot();
        assert!(g.is_empty());
        assert_eq!(g.generation(), 0);
        assert_eq!(g.dim(), None);
    }

    #[test]
    fn test_reload_normalizes_and_indexes() {
        let cache = EncodingCache::new();
        let summary = cache.reload(&[record("a", vec![vec![3.0, 4.0]])]);
        assert_eq!(summary.identities, 1);
        assert_eq!(summary.embeddings, 1);

        let g = cache.snapshot();
        let entry = g.get("a").unwrap();
        assert_eq!(entry.display_name, "A");
        assert!(entry.embeddings[0].is_unit(1e-6));
        assert_eq!(g.dim(), Some(2));
    }

    #[test]
    fn test_reload_keeps_extreme_references_unit_length() {
        let cache = EncodingCache::new();
        let summary = cache.reload(&[
            record("big", vec![vec![3e19, 4e19]]),
            record("small", vec![vec![3e-23, 4e-23]]),
        ]);
        assert_eq!(summary.rejected_embeddings, 0);
        assert_eq!(summary.identities, 2);

        let g = cache.snapshot();
        for id in ["big", "small"] {
            let e = &g.get(id).unwrap().embeddings[0];
            assert!(e.is_unit(1e-6), "{id}: norm = {}", e.norm());
        }
    }

    #[test]
    fn test_reload_skips_inactive_and_empty_records() {
        let cache = EncodingCache::new();
        let mut inactive = record("gone", vec![vec![1.0, 0.0]]);
        inactive.active = false;
        let summary = cache.reload(&[
            inactive,
            record("none", vec![]),
            record("zero", vec![vec![0.0, 0.0]]),
            record("ok", vec![vec![1.0, 0.0]]),
        ]);
        assert_eq!(summary.skipped_inactive, 1);
        assert_eq!(summary.skipped_without_embeddings, 2);
        assert_eq!(summary.rejected_embeddings, 1);
        assert_eq!(summary.identities, 1);
        assert!(cache.snapshot().get("gone").is_none());
    }

    #[test]
    fn test_reload_rejects_mismatched_dimension() {
        let cache = EncodingCache::new();
        let summary = cache.reload(&[
            record("a", vec![vec![1.0, 0.0, 0.0]]),
            record("b", vec![vec![1.0, 0.0], vec![0.0, 0.0, 1.0]]),
        ]);
        assert_eq!(summary.rejected_embeddings, 1);
        assert_eq!(cache.snapshot().get("b").unwrap().embeddings.len(), 1);
    }

    #[test]
    fn test_expected_dimension_is_enforced() {
        let cache = EncodingCache::with_dimension(4);
        let summary = cache.reload(&[record("a", vec![vec![1.0, 0.0]])]);
        assert_eq!(summary.identities, 0);
        assert!(cache.snapshot().is_empty());
    }

    #[test]
    fn test_duplicate_ids_are_merged() {
        let cache = EncodingCache::new();
        cache.reload(&[
            record("a", vec![vec![1.0, 0.0]]),
            record("b", vec![vec![0.0, 1.0]]),
            record("a", vec![vec![0.7, 0.7]]),
        ]);
        let g = cache.snapshot();
        assert_eq!(g.len(), 2);
        assert_eq!(g.embedding_count(), 3);
        assert_eq!(g.entries()[0].identity_id, "a");
    }

    #[test]
    fn test_held_snapshot_survives_reload() {
        let cache = EncodingCache::new();
        cache.reload(&[record("old", vec![vec![1.0, 0.0]])]);
        let held = cache.snapshot();

        cache.reload(&[record("new", vec![vec![0.0, 1.0]])]);

        assert!(held.get("old").is_some());
        assert!(held.get("new").is_none());
        let fresh = cache.snapshot();
        assert!(fresh.get("new").is_some());
        assert!(fresh.get("old").is_none());
        assert!(fresh.generation() > held.generation());
    }

    #[test]
    fn test_clear_publishes_empty_gallery() {
        let cache = EncodingCache::new();
        cache.reload(&[record("a", vec![vec![1.0]])]);
        cache.clear();
        assert!(cache.snapshot().is_empty());
    }

    #[test]
    fn test_concurrent_readers_never_see_a_mixed_roster() {
        let cache = Arc::new(EncodingCache::new());
        let roster_a: Vec<_> = (0..50)
            .map(|i| record(&format!("a{i}"), vec![vec![1.0, 0.0]]))
            .collect();
        let roster_b: Vec<_> = (0..50)
            .map(|i| record(&format!("b{i}"), vec![vec![0.0, 1.0]]))
            .collect();
        cache.reload(&roster_a);

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        let g = cache.snapshot();
                        let first = g.entries()[0].identity_id.chars().next().unwrap();
                        assert!(g.entries().iter().all(|e| e.identity_id.starts_with(first)));
                        assert_eq!(g.len(), 50);
                    }
                })
            })
            .collect();

        for i in 0..200 {
            cache.reload(if i % 2 == 0 { &roster_b } else { &roster_a });
        }
        for r in readers {
            r.join().unwrap();
        }
    }
}
