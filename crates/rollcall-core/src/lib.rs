//! rollcall-core — people tracking and attendance decisions for one camera.
//!
//! Frames pass a two-tier quality gate, then motion and face detections are
//! folded into a single track registry. Face tracks are identified against
//! the staff and customer galleries; the decision engine turns confirmed
//! tracks into check-in/check-out events or unknown-entry snapshots through
//! an [`AttendanceStore`].
//!
//! Detection, embedding and segmentation models are supplied by the caller
//! through the traits in [`capability`].

pub mod capability;
pub mod config;
pub mod decision;
pub mod frame;
pub mod matcher;
pub mod memory;
pub mod pipeline;
pub mod quality;
pub mod store;
pub mod tracker;
pub mod types;

pub use capability::{CapabilityError, Embedder, FaceDetector, MotionSegmenter};
pub use config::{ConfigError, TrackingConfig};
pub use decision::{DecisionEngine, Evidence, Outcome};
pub use frame::{Frame, FrameError};
pub use matcher::{
    CosineMatcher, Gallery, Identification, IdentityKind, IdentityMatcher, IdentityRecord,
    MatchResult, Matcher,
};
pub use pipeline::{Capabilities, FrameReport, Pipeline};
pub use quality::{Admission, QualityGate};
pub use store::{
    load_gallery, AttendanceRecord, AttendanceStatus, AttendanceStore, EntryType,
    NewUnknownEntry, StoreError, SystemMode,
};
pub use tracker::{Track, TrackId, TrackRegistry, TrackState};
pub use types::{BoundingBox, Embedding, FaceDetection, MotionBlob};
