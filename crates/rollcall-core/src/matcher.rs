use crate::gallery::GalleryIndex;
use crate::types::{FeatureVector, MatchResult};
use serde::{Deserialize, Serialize};

/// Reference distance threshold for normalized 128-dim embeddings.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.45;
/// Reference confidence cutoff, `(1 - DEFAULT_MATCH_THRESHOLD) * 100`.
pub const DEFAULT_ACCEPT_CONFIDENCE: u8 = 55;

/// The two matching knobs.
///
/// `threshold` gates candidacy (a distance above it is unknown).
/// `accept_confidence` gates action (a candidate below it is not recorded).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchPolicy {
    pub threshold: f32,
    pub accept_confidence: u8,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
            accept_confidence: DEFAULT_ACCEPT_CONFIDENCE,
        }
    }
}

impl MatchPolicy {
    /// Whether a match result may drive an attendance event.
    pub fn is_actionable(&self, result: &MatchResult) -> bool {
        result.is_match() && result.confidence >= self.accept_confidence
    }
}

/// Map a distance to a 0–100 confidence score.
pub fn confidence_for(distance: f32) -> u8 {
    ((1.0 - distance) * 100.0).round().clamp(0.0, 100.0) as u8
}

/// Strategy for classifying a query vector against a gallery snapshot.
pub trait Matcher {
    fn best_match(&self, index: &GalleryIndex, query: &FeatureVector, threshold: f32)
        -> MatchResult;
}

/// Nearest-neighbor matcher over Euclidean distance.
///
/// An identity's score is the minimum distance over all of its vectors.
/// Identities are visited in ascending id order and only a strictly smaller
/// score replaces the current best, so ties resolve to the lowest id.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn best_match(
        &self,
        index: &GalleryIndex,
        query: &FeatureVector,
        threshold: f32,
    ) -> MatchResult {
        let mut best_dist = f32::INFINITY;
        let mut best = None;

        for identity in index.identities() {
            let score = identity
                .vectors
                .iter()
                .map(|v| query.euclidean_distance(v))
                .fold(f32::INFINITY, f32::min);
            if score < best_dist {
                best_dist = score;
                best = Some(identity);
            }
        }

        match best {
            Some(identity) if best_dist <= threshold => MatchResult {
                identity_id: Some(identity.id),
                display_name: identity.display_name.clone(),
                distance: best_dist,
                confidence: confidence_for(best_dist),
            },
            Some(_) => MatchResult::unknown(best_dist, confidence_for(best_dist)),
            None => MatchResult::unknown(f32::INFINITY, 0),
        }
    }
}
