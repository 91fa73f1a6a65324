//! rollcall-core — Face descriptors, gallery enrollment, matching and
//! attendance decisions.
//!
//! Detection (SCRFD) and embedding (FaceNet) run via ONNX Runtime behind the
//! [`FaceDetector`] and [`Embedder`] seams; everything downstream of the raw
//! embedding is pure.

pub mod decision;
pub mod detector;
pub mod embedder;
pub mod enrollment;
pub mod extractor;
pub mod input;
pub mod matcher;
pub mod types;

pub use decision::{CaptureEvent, Decision, DecisionError, DecisionPolicy, Outcome, RejectReason};
pub use detector::{FaceDetector, ScrfdDetector};
pub use embedder::{Embedder, EmbedderSpec, Normalization, OnnxEmbedder};
pub use enrollment::{enroll, Enrollment, EnrollmentError};
pub use extractor::{ExtractError, Extractor};
pub use matcher::{CosineMatcher, Matcher};
pub use types::{BoundingBox, Descriptor, DescriptorError, IdentityRecord, MatchCandidate};
