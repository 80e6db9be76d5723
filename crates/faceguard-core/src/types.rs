use serde::{Deserialize, Serialize};

/// Euclidean distance below which two descriptors are the same person.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Face descriptor produced by the external detector (typically 128-dimensional).
///
/// Immutable once produced. Serializes as a bare JSON array of floats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Descriptor {
    values: Vec<f32>,
}

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Compute Euclidean distance between two descriptors.
    ///
    /// # Panics
    ///
    /// Panics if the dimensions differ. The detector guarantees a uniform
    /// dimension, so a mismatch is a caller bug.
    pub fn euclidean_distance(&self, other: &Descriptor) -> f32 {
        assert_eq!(
            self.dimension(),
            other.dimension(),
            "descriptor dimension mismatch"
        );
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Element-wise mean of a set of descriptors.
    ///
    /// Returns `None` for an empty set. Summation runs in input order, so the
    /// same samples always produce the same bits.
    ///
    /// # Panics
    ///
    /// Panics if the descriptors do not share one dimension.
    pub fn mean(samples: &[Descriptor]) -> Option<Descriptor> {
        let first = samples.first()?;
        let dim = first.dimension();
        let mut sums = vec![0.0f32; dim];

        for sample in samples {
            assert_eq!(sample.dimension(), dim, "descriptor dimension mismatch");
            for (acc, v) in sums.iter_mut().zip(sample.values.iter()) {
                *acc += v;
            }
        }

        let n = samples.len() as f32;
        Some(Descriptor::new(sums.into_iter().map(|s| s / n).collect()))
    }
}

/// Strategy for deciding whether two descriptors belong to the same person.
pub trait Matcher {
    fn matches(&self, candidate: &Descriptor, reference: &Descriptor) -> bool;
}

/// Euclidean-distance matcher. Lower distance = higher similarity.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    pub threshold: f32,
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
        }
    }
}

impl EuclideanMatcher {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl Matcher for EuclideanMatcher {
    fn matches(&self, candidate: &Descriptor, reference: &Descriptor) -> bool {
        candidate.euclidean_distance(reference) < self.threshold
    }
}

/// Compare two optional descriptors. An absent side never matches.
pub fn matches(a: Option<&Descriptor>, b: Option<&Descriptor>, threshold: f32) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => EuclideanMatcher::new(threshold).matches(a, b),
        _ => false,
    }
}

/// Why an alert was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertReason {
    /// Nobody is in frame.
    PresenceLost,
    /// A single face is in frame and it is not the owner.
    IdentityMismatch,
    /// More than one face is in frame.
    IntruderDetected,
}

/// Alert raised by a monitoring poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub reason: AlertReason,
    /// Faces in frame that are not the owner.
    pub intruder_count: u32,
}

/// Per-poll verification result, emitted whether or not the state changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationStatus {
    pub is_verified: bool,
    /// The owner's descriptor from this poll, if the owner was seen at all.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched: Option<Descriptor>,
}

impl VerificationStatus {
    pub fn unverified() -> Self {
        Self {
            is_verified: false,
            matched: None,
        }
    }
}

/// Lifecycle state of a monitoring session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Not started, or stopped.
    Idle,
    /// Started; no poll has completed yet.
    Polling,
    Verified,
    PresenceLost,
    IdentityMismatch,
    IntruderPresent,
    /// The last poll failed and the fault policy suppressed the alert.
    DetectorUnavailable,
}
