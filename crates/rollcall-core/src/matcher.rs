//! Query descriptor vs. gallery.

use crate::types::{Descriptor, IdentityRecord, MatchCandidate};

/// Default minimum cosine similarity for a match.
pub const DEFAULT_THRESHOLD: f32 = 0.6;

/// Strategy for comparing a query descriptor against a gallery snapshot.
pub trait Matcher {
    /// Every gallery entry that clears the threshold, best first.
    fn candidates(&self, query: &Descriptor, gallery: &[IdentityRecord]) -> Vec<MatchCandidate>;
}

/// Cosine similarity matcher.
///
/// Visits every gallery entry and returns all of them at or above the
/// threshold. Near-ties are never collapsed to a single best match.
#[derive(Debug, Clone, Copy)]
pub struct CosineMatcher {
    pub threshold: f32,
}

impl Default for CosineMatcher {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

impl Matcher for CosineMatcher {
    fn candidates(&self, query: &Descriptor, gallery: &[IdentityRecord]) -> Vec<MatchCandidate> {
        if query.is_degenerate() {
            return Vec::new();
        }

        let mut hits = Vec::new();
        for record in gallery {
            let similarity = match query.similarity(&record.descriptor) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(identity = %record.identity_id, error = %e, "skipping gallery entry");
                    continue;
                }
            };
            tracing::trace!(identity = %record.identity_id, similarity, "compared");
            if similarity >= self.threshold {
                hits.push(MatchCandidate {
                    identity_id: record.identity_id.clone(),
                    similarity,
                });
            }
        }

        // Stable: equal scores keep gallery order.
        hits.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        hits
    }
}
