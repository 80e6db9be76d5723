//! faceguard-core — owner-presence verification engine.
//!
//! Matches face descriptors by Euclidean distance, enrolls a reference
//! descriptor from several head poses, and monitors a detection source to
//! raise and clear alerts when the owner is absent or not alone.

pub mod alert;
pub mod detector;
pub mod enrollment;
pub mod monitor;
pub mod types;

pub use alert::{AlertState, AlertTracker, ClearError, Clearance, PasswordVerifier};
pub use detector::{CaptureGuard, DetectionError, DetectorHandle, FaceDetector};
pub use enrollment::{Enrollment, EnrollmentConfig, EnrollmentError, EnrollmentEvent, Pose, PoseOutcome};
pub use monitor::{DetectorFaultPolicy, Monitor, MonitorConfig, MonitorEvent, MonitorHandle, MonitorObserver};
pub use types::{
    matches, AlertEvent, AlertReason, Descriptor, EuclideanMatcher, Matcher, SessionState,
    VerificationStatus, DEFAULT_MATCH_THRESHOLD,
};
