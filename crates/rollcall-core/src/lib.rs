//! rollcall-core — Attendance decision layer.
//!
//! Matches feature vectors from an external detector against an enrolled
//! gallery, gates recording on cooldown and once-per-day rules, and pauses
//! scanning until the operator acknowledges each recorded event.

pub mod controller;
pub mod eligibility;
pub mod gallery;
pub mod matcher;
pub mod store;
pub mod types;

pub use controller::{
    ConfirmationController, ConfirmationState, ControllerError, Evaluation, ScanOutcome,
};
pub use eligibility::{DenyReason, Eligibility, EligibilityGate, EligibilityPolicy};
pub use gallery::{normalize_name, GalleryIndex, Identity};
pub use matcher::{EuclideanMatcher, MatchPolicy, Matcher};
pub use store::{AttendanceStore, StoreError};
pub use types::{
    AttendanceEvent, EnrollmentRecord, EventId, FeatureVector, IdentityId, MatchResult,
    VectorError, FEATURE_DIM,
};
