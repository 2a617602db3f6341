//! Nearest-neighbour identity matching with an adaptive distance threshold.

use crate::cache::Gallery;
use crate::types::{Embedding, MatchResult};
use serde::{Deserialize, Serialize};

/// Capture conditions that loosen the acceptance threshold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CaptureConditions {
    pub low_light: bool,
    /// Face quality accepted but below the "good" level.
    pub low_quality: bool,
    pub outdoor: bool,
}

/// Bounds and increments for the adaptive threshold.
///
/// `effective = clamp(base + Σ increments, strict_bound, lenient_bound)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdPolicy {
    pub strict_bound: f32,
    pub lenient_bound: f32,
    pub low_light_increment: f32,
    pub low_quality_increment: f32,
    pub outdoor_increment: f32,
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self {
            strict_bound: 0.80,
            lenient_bound: 1.25,
            low_light_increment: 0.10,
            low_quality_increment: 0.05,
            outdoor_increment: 0.03,
        }
    }
}

impl ThresholdPolicy {
    pub fn effective(&self, base_threshold: f32, conditions: &CaptureConditions) -> f32 {
        let mut threshold = base_threshold;
        if conditions.low_light {
            threshold += self.low_light_increment;
        }
        if conditions.low_quality {
            threshold += self.low_quality_increment;
        }
        if conditions.outdoor {
            threshold += self.outdoor_increment;
        }
        let (lo, hi) = if self.strict_bound <= self.lenient_bound {
            (self.strict_bound, self.lenient_bound)
        } else {
            (self.lenient_bound, self.strict_bound)
        };
        threshold.clamp(lo, hi)
    }
}

/// Map a distance onto [0, 1]: 1 at distance 0, 0 at the threshold and beyond.
pub fn confidence_from_distance(distance: f32, threshold: f32) -> f32 {
    if threshold <= 0.0 {
        return 0.0;
    }
    (1.0 - distance / threshold).clamp(0.0, 1.0)
}

/// Strategy for comparing a query embedding against the cached gallery.
pub trait Matcher: Send + Sync {
    /// Best match for `query`, or `None` when the gallery holds no references.
    fn find_best_match(
        &self,
        query: &Embedding,
        candidates: &Gallery,
        base_threshold: f32,
        conditions: &CaptureConditions,
    ) -> Option<MatchResult>;
}

/// Linear-scan Euclidean matcher.
///
/// Every reference of every identity is compared; an identity's distance is
/// its closest reference. On equal distances the first identity in gallery
/// order wins, so ties depend on roster order.
#[derive(Debug, Clone, Default)]
pub struct EuclideanMatcher {
    policy: ThresholdPolicy,
}

impl EuclideanMatcher {
    pub fn new(policy: ThresholdPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ThresholdPolicy {
        &self.policy
    }
}

impl Matcher for EuclideanMatcher {
    /// # Panics
    ///
    /// Panics if `query` and a reference embedding differ in dimension.
    fn find_best_match(
        &self,
        query: &Embedding,
        candidates: &Gallery,
        base_threshold: f32,
        conditions: &CaptureConditions,
    ) -> Option<MatchResult> {
        let mut best: Option<(usize, f32)> = None;

        for (i, entry) in candidates.entries().iter().enumerate() {
            for reference in &entry.embeddings {
                let d = query.euclidean_distance(reference);
                let better = match best {
                    None => true,
                    Some((_, best_d)) => d < best_d,
                };
                if better {
                    best = Some((i, d));
                }
            }
        }

        let (idx, distance) = best?;
        let threshold = self.policy.effective(base_threshold, conditions);
        let entry = &candidates.entries()[idx];

        let result = if distance < threshold {
            MatchResult {
                identity_id: Some(entry.identity_id.clone()),
                display_name: Some(entry.display_name.clone()),
                distance,
                confidence: confidence_from_distance(distance, threshold),
                threshold,
                is_match: true,
            }
        } else {
            MatchResult {
                identity_id: None,
                display_name: None,
                distance,
                confidence: 0.0,
                threshold,
                is_match: false,
            }
        };

        tracing::debug!(
            distance,
            threshold,
            is_match = result.is_match,
            candidates = candidates.len(),
            "matched query against gallery"
        );

        Some(result)
    }
}
