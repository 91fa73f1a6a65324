//! Attendance decision for a single capture event.
//!
//! A capture moves `Received → Recognizing → {Accepted, Rejected, Ambiguous}`.
//! Recognition runs the extractor and matcher against one gallery snapshot;
//! the claimed identity (if any) narrows the candidate list rather than
//! vetoing other hits. Acceptance is then checked against attendance already
//! persisted for the day so a repeat capture is a no-op.

use crate::detector::FaceDetector;
use crate::embedder::Embedder;
use crate::extractor::{ExtractError, Extractor};
use crate::matcher::Matcher;
use crate::types::{Descriptor, IdentityRecord, MatchCandidate};
use image::RgbImage;
use serde::Serialize;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Default similarity gap under which a rival candidate marks an acceptance as contested.
pub const DEFAULT_TIE_MARGIN: f32 = 0.05;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum DecisionError {
    #[error("recognition failed: {0}")]
    Recognition(ExtractError),
    #[error("attendance lookup failed: {0}")]
    AttendanceLookup(BoxError),
}

/// A capture in the `Received` state.
#[derive(Debug, Clone)]
pub struct CaptureEvent {
    /// Correlation id carried on every log event and on the decision.
    pub event_id: Uuid,
    pub claimed: Option<String>,
}

impl CaptureEvent {
    pub fn new(claimed: Option<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            claimed: claimed
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    NoFace,
    NoMatch,
    ClaimNotMatched,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RejectReason::NoFace => "no face detected",
            RejectReason::NoMatch => "face does not match any enrolled identity",
            RejectReason::ClaimNotMatched => "face does not match the claimed identity",
        };
        f.write_str(text)
    }
}

/// Terminal state of a capture event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Accepted {
        identity_id: String,
        similarity: f32,
        /// The identity already has attendance for the day; nothing new to record.
        already_marked: bool,
        /// Another candidate scored within the tie margin of the accepted one.
        contested: bool,
    },
    Rejected {
        reason: RejectReason,
    },
    /// Several identities cleared the threshold and none was claimed.
    Ambiguous {
        candidates: Vec<MatchCandidate>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub event_id: Uuid,
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl Decision {
    pub fn accepted_identity(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Accepted { identity_id, .. } => Some(identity_id),
            _ => None,
        }
    }
}

/// Business rules layered on top of matcher output.
#[derive(Debug, Clone, Copy)]
pub struct DecisionPolicy {
    pub tie_margin: f32,
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self {
            tie_margin: DEFAULT_TIE_MARGIN,
        }
    }
}

/// Result of resolving candidates before the attendance check.
#[derive(Debug, Clone, PartialEq)]
enum Resolution {
    Accept { candidate: MatchCandidate, contested: bool },
    Reject(RejectReason),
    Ambiguous,
}

impl DecisionPolicy {
    /// Run the full pipeline for one capture: extract, match, resolve, check attendance.
    pub fn decide<D, E, M, F, PE>(
        &self,
        extractor: &mut Extractor<D, E>,
        matcher: &M,
        event: &CaptureEvent,
        image: &RgbImage,
        gallery: &[IdentityRecord],
        already_marked: F,
    ) -> Result<Decision, DecisionError>
    where
        D: FaceDetector,
        E: Embedder,
        M: Matcher,
        F: FnOnce(&str) -> Result<bool, PE>,
        PE: Into<BoxError>,
    {
        tracing::debug!(event_id = %event.event_id, claimed = ?event.claimed, "capture received");
        let extracted = extractor.extract(image);
        self.conclude(matcher, event, extracted, gallery, already_marked)
    }

    /// Finish a capture whose extraction already ran (possibly elsewhere).
    pub fn conclude<M, F, PE>(
        &self,
        matcher: &M,
        event: &CaptureEvent,
        extracted: Result<Descriptor, ExtractError>,
        gallery: &[IdentityRecord],
        already_marked: F,
    ) -> Result<Decision, DecisionError>
    where
        M: Matcher,
        F: FnOnce(&str) -> Result<bool, PE>,
        PE: Into<BoxError>,
    {
        let event_id = event.event_id;
        tracing::debug!(%event_id, gallery = gallery.len(), "recognizing");

        let query = match extracted {
            Ok(d) => Some(d),
            Err(ExtractError::FaceNotFound) => None,
            Err(e) => {
                tracing::error!(%event_id, error = %e, "recognition failed");
                return Err(DecisionError::Recognition(e));
            }
        };

        let candidates = match &query {
            Some(q) => matcher.candidates(q, gallery),
            None => Vec::new(),
        };
        tracing::debug!(%event_id, candidates = ?candidates, "matcher done");

        let outcome = match self.resolve(query.is_some(), &candidates, event.claimed.as_deref()) {
            Resolution::Reject(reason) => {
                tracing::info!(%event_id, %reason, "capture rejected");
                Outcome::Rejected { reason }
            }
            Resolution::Ambiguous => {
                tracing::warn!(%event_id, candidates = candidates.len(), "capture ambiguous, needs review");
                Outcome::Ambiguous { candidates }
            }
            Resolution::Accept { candidate, contested } => {
                if contested {
                    tracing::warn!(
                        %event_id,
                        identity = %candidate.identity_id,
                        ?candidates,
                        "accepted identity has a near-tied rival"
                    );
                }
                let already = already_marked(&candidate.identity_id)
                    .map_err(|e| DecisionError::AttendanceLookup(e.into()))?;
                tracing::info!(
                    %event_id,
                    identity = %candidate.identity_id,
                    similarity = candidate.similarity,
                    already_marked = already,
                    "capture accepted"
                );
                Outcome::Accepted {
                    identity_id: candidate.identity_id,
                    similarity: candidate.similarity,
                    already_marked: already,
                    contested,
                }
            }
        };

        Ok(Decision { event_id, outcome })
    }

    fn resolve(&self, face_found: bool, candidates: &[MatchCandidate], claimed: Option<&str>) -> Resolution {
        if !face_found {
            return Resolution::Reject(RejectReason::NoFace);
        }
        if candidates.is_empty() {
            return Resolution::Reject(RejectReason::NoMatch);
        }

        let chosen = match claimed {
            Some(id) => match candidates.iter().find(|c| c.identity_id == id) {
                Some(c) => c,
                None => return Resolution::Reject(RejectReason::ClaimNotMatched),
            },
            None if candidates.len() == 1 => &candidates[0],
            None => return Resolution::Ambiguous,
        };

        let contested = candidates
            .iter()
            .any(|c| c.identity_id != chosen.identity_id && c.similarity >= chosen.similarity - self.tie_margin);

        Resolution::Accept {
            candidate: chosen.clone(),
            contested,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::testing::*;
    use crate::matcher::CosineMatcher;
    use crate::types::BoundingBox;
    use image::Rgb;
    use std::convert::Infallible;

    fn record(id: &str, raw: Vec<f32>) -> IdentityRecord {
        IdentityRecord {
            identity_id: id.into(),
            display_name: id.into(),
            descriptor: Descriptor::normalized(raw),
            enrolled_at: String::new(),
        }
    }

    fn candidate(id: &str, similarity: f32) -> MatchCandidate {
        MatchCandidate { identity_id: id.into(), similarity }
    }

    fn red_image() -> RgbImage {
        RgbImage::from_pixel(10, 10, Rgb([255, 0, 0]))
    }

    /// Descriptor the scripted extractor yields for a fully red face.
    fn red() -> Vec<f32> {
        vec![255.0, 0.0, 0.0, 1.0]
    }

    fn never_marked(_: &str) -> Result<bool, Infallible> {
        Ok(false)
    }

    fn run(claimed: Option<&str>, gallery: &[IdentityRecord], faces: Vec<BoundingBox>) -> Decision {
        let mut ex = extractor(vec![faces]);
        let event = CaptureEvent::new(claimed.map(String::from));
        DecisionPolicy::default()
            .decide(&mut ex, &CosineMatcher::default(), &event, &red_image(), gallery, never_marked)
            .unwrap()
    }

    fn full_face() -> Vec<BoundingBox> {
        vec![face(0.0, 0.0, 10.0, 10.0)]
    }

    #[test]
    fn test_no_face_rejected() {
        let gallery = vec![record("A", red())];
        let d = run(None, &gallery, vec![]);
        assert_eq!(d.outcome, Outcome::Rejected { reason: RejectReason::NoFace });
    }

    #[test]
    fn test_no_candidates_rejected() {
        let gallery = vec![record("A", vec![0.0, 1.0, 0.0, 0.0])];
        let d = run(None, &gallery, full_face());
        assert_eq!(d.outcome, Outcome::Rejected { reason: RejectReason::NoMatch });
    }

    #[test]
    fn test_empty_gallery_rejected() {
        let d = run(None, &[], full_face());
        assert_eq!(d.outcome, Outcome::Rejected { reason: RejectReason::NoMatch });
    }

    #[test]
    fn test_single_candidate_accepted() {
        let gallery = vec![record("A", red()), record("B", vec![0.0, 0.0, 1.0, 0.0])];
        let d = run(None, &gallery, full_face());
        assert_eq!(d.accepted_identity(), Some("A"));
        assert!(matches!(d.outcome, Outcome::Accepted { already_marked: false, contested: false, .. }));
    }

    #[test]
    fn test_two_candidates_unclaimed_ambiguous() {
        let gallery = vec![record("A", red()), record("B", vec![255.0, 10.0, 0.0, 1.0])];
        let d = run(None, &gallery, full_face());
        match d.outcome {
            Outcome::Ambiguous { candidates } => {
                let ids: Vec<_> = candidates.iter().map(|c| c.identity_id.as_str()).collect();
                assert_eq!(ids, vec!["A", "B"]);
            }
            other => panic!("expected ambiguous, got {other:?}"),
        }
    }

    #[test]
    fn test_claimed_identity_wins_among_candidates() {
        let gallery = vec![record("C001", red()), record("C003", vec![255.0, 10.0, 0.0, 1.0])];
        let d = run(Some("C003"), &gallery, full_face());
        assert_eq!(d.accepted_identity(), Some("C003"));
        // The rival scored higher, so the acceptance is flagged.
        assert!(matches!(d.outcome, Outcome::Accepted { contested: true, .. }));
    }

    #[test]
    fn test_claim_not_among_candidates_rejected() {
        let gallery = vec![record("A", red()), record("B", vec![0.0, 1.0, 0.0, 0.0])];
        let d = run(Some("B"), &gallery, full_face());
        assert_eq!(d.outcome, Outcome::Rejected { reason: RejectReason::ClaimNotMatched });
    }

    #[test]
    fn test_blank_claim_treated_as_none() {
        let event = CaptureEvent::new(Some("  ".into()));
        assert!(event.claimed.is_none());
    }

    #[test]
    fn test_padded_claim_is_trimmed() {
        let event = CaptureEvent::new(Some(" C003\t".into()));
        assert_eq!(event.claimed.as_deref(), Some("C003"));

        let gallery = vec![record("C001", red()), record("C003", vec![255.0, 10.0, 0.0, 1.0])];
        let d = run(Some(" C003 "), &gallery, full_face());
        assert_eq!(d.accepted_identity(), Some("C003"));
    }

    #[test]
    fn test_already_marked_is_accepted_noop() {
        let gallery = vec![record("A", red())];
        let mut ex = extractor(vec![full_face()]);
        let event = CaptureEvent::new(None);
        let d = DecisionPolicy::default()
            .decide(&mut ex, &CosineMatcher::default(), &event, &red_image(), &gallery, |id| {
                Ok::<_, Infallible>(id == "A")
            })
            .unwrap();
        assert!(matches!(d.outcome, Outcome::Accepted { already_marked: true, .. }));
        assert_eq!(d.event_id, event.event_id);
    }

    #[test]
    fn test_predicate_not_consulted_on_reject() {
        let mut ex = extractor(vec![vec![]]);
        let event = CaptureEvent::new(None);
        let d = DecisionPolicy::default()
            .decide(&mut ex, &CosineMatcher::default(), &event, &red_image(), &[], |_: &str| {
                Err::<bool, _>(std::io::Error::other("must not be called"))
            })
            .unwrap();
        assert!(matches!(d.outcome, Outcome::Rejected { .. }));
    }

    #[test]
    fn test_lookup_failure_is_error() {
        let gallery = vec![record("A", red())];
        let mut ex = extractor(vec![full_face()]);
        let event = CaptureEvent::new(None);
        let result = DecisionPolicy::default().decide(
            &mut ex,
            &CosineMatcher::default(),
            &event,
            &red_image(),
            &gallery,
            |_: &str| Err::<bool, _>(std::io::Error::other("db down")),
        );
        assert!(matches!(result, Err(DecisionError::AttendanceLookup(_))));
    }

    #[test]
    fn test_resolve_contested_margin() {
        let policy = DecisionPolicy { tie_margin: 0.05 };
        let cands = [candidate("A", 0.90), candidate("B", 0.70)];
        assert_eq!(
            policy.resolve(true, &cands, Some("A")),
            Resolution::Accept { candidate: candidate("A", 0.90), contested: false }
        );
        let close = [candidate("A", 0.90), candidate("B", 0.87)];
        assert_eq!(
            policy.resolve(true, &close, Some("A")),
            Resolution::Accept { candidate: candidate("A", 0.90), contested: true }
        );
    }
}
