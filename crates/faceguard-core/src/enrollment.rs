//! Multi-pose enrollment.
//!
//! Each pose polls the detector until `samples_per_pose` consecutive detections
//! are collected or the attempt budget runs out. The per-pose means are then
//! averaged into the reference descriptor.

use crate::detector::{DetectionError, DetectorHandle};
use crate::types::{Descriptor, EuclideanMatcher, Matcher};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 15;
pub const DEFAULT_ATTEMPT_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_SAMPLES_PER_POSE: usize = 2;

/// Head orientation requested from the user during capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pose {
    Center,
    Left,
    Right,
    Up,
    Down,
}

impl Pose {
    pub const ALL: [Pose; 5] = [Pose::Center, Pose::Left, Pose::Right, Pose::Up, Pose::Down];

    pub fn label(self) -> &'static str {
        match self {
            Pose::Center => "center",
            Pose::Left => "left",
            Pose::Right => "right",
            Pose::Up => "up",
            Pose::Down => "down",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnrollmentError {
    #[error("pose {pose} ({label}) timed out after {attempts} attempts")]
    Timeout {
        pose: usize,
        label: &'static str,
        attempts: u32,
    },
    #[error("pose {got} requested but pose {expected} is next")]
    PoseOutOfOrder { expected: usize, got: usize },
    #[error("all poses already captured")]
    AlreadyComplete,
    #[error(transparent)]
    Detection(#[from] DetectionError),
}

#[derive(Debug, Clone)]
pub struct EnrollmentConfig {
    pub poses: Vec<Pose>,
    pub samples_per_pose: usize,
    pub max_attempts: u32,
    pub attempt_interval: Duration,
    /// When set, consecutive samples of one pose must lie within this
    /// Euclidean distance of each other; otherwise the older one is dropped.
    pub consistency_threshold: Option<f32>,
}

impl Default for EnrollmentConfig {
    fn default() -> Self {
        Self {
            poses: Pose::ALL.to_vec(),
            samples_per_pose: DEFAULT_SAMPLES_PER_POSE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            attempt_interval: DEFAULT_ATTEMPT_INTERVAL,
            consistency_threshold: None,
        }
    }
}

/// Progress notifications emitted while capturing a pose. Serialized with an
/// `event` tag for clients; the reference descriptor itself is never serialized.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EnrollmentEvent {
    Progress {
        pose: usize,
        attempt: u32,
        max_attempts: u32,
        samples: usize,
    },
    PoseCaptured {
        pose: usize,
    },
    Enrolled {
        #[serde(skip)]
        reference: Descriptor,
    },
    TimedOut {
        pose: usize,
    },
}

/// Result of a successful pose capture.
#[derive(Debug, Clone, PartialEq)]
pub enum PoseOutcome {
    /// The pose is done; `next_pose` is the index to capture next.
    Captured { next_pose: usize },
    /// The last pose is done and the reference descriptor is ready.
    Enrolled(Descriptor),
}

/// Collects consecutive detections for one pose.
#[derive(Debug)]
pub struct PoseAccumulator {
    samples: Vec<Descriptor>,
    needed: usize,
    consistency: Option<EuclideanMatcher>,
}

impl PoseAccumulator {
    pub fn new(needed: usize, consistency_threshold: Option<f32>) -> Self {
        Self {
            samples: Vec::with_capacity(needed),
            needed: needed.max(1),
            consistency: consistency_threshold.map(EuclideanMatcher::new),
        }
    }

    /// Feed one detection attempt. Returns the pose mean once enough
    /// consecutive samples are in. A miss breaks the run.
    pub fn record(&mut self, detection: Option<Descriptor>) -> Option<Descriptor> {
        let Some(sample) = detection else {
            self.samples.clear();
            return None;
        };

        if let (Some(matcher), Some(prev)) = (&self.consistency, self.samples.last()) {
            if !matcher.matches(&sample, prev) {
                tracing::debug!("enroll: sample inconsistent with previous, restarting run");
                self.samples.clear();
            }
        }

        self.samples.push(sample);
        if self.samples.len() < self.needed {
            return None;
        }

        let mean = Descriptor::mean(&self.samples);
        self.samples.clear();
        mean
    }

    pub fn collected(&self) -> usize {
        self.samples.len()
    }
}

/// Guided enrollment across all configured poses.
pub struct Enrollment {
    config: EnrollmentConfig,
    pose_means: Vec<Descriptor>,
}

impl Enrollment {
    pub fn new(config: EnrollmentConfig) -> Self {
        Self {
            config,
            pose_means: Vec::new(),
        }
    }

    pub fn config(&self) -> &EnrollmentConfig {
        &self.config
    }

    /// Index of the next pose to capture, or `None` when every pose is done.
    pub fn next_pose(&self) -> Option<usize> {
        let next = self.pose_means.len();
        (next < self.config.poses.len()).then_some(next)
    }

    pub fn is_complete(&self) -> bool {
        self.next_pose().is_none()
    }

    /// The reference descriptor: the mean of the per-pose means.
    pub fn reference(&self) -> Option<Descriptor> {
        if !self.is_complete() {
            return None;
        }
        Descriptor::mean(&self.pose_means)
    }

    /// Discard all captured poses.
    pub fn reset(&mut self) {
        self.pose_means.clear();
    }

    /// Capture `pose_index`, which must be the next pose.
    ///
    /// A timeout leaves the enrollment where it was, so the same pose can be
    /// retried.
    pub async fn capture_pose<F>(
        &mut self,
        detector: &DetectorHandle,
        pose_index: usize,
        mut on_event: F,
    ) -> Result<PoseOutcome, EnrollmentError>
    where
        F: FnMut(EnrollmentEvent),
    {
        let expected = self.next_pose().ok_or(EnrollmentError::AlreadyComplete)?;
        if pose_index != expected {
            return Err(EnrollmentError::PoseOutOfOrder {
                expected,
                got: pose_index,
            });
        }
        let pose = self.config.poses[pose_index];
        let max_attempts = self.config.max_attempts;

        let _capture = detector.acquire().await?;
        tracing::info!(pose = pose_index, label = pose.label(), "enroll: capturing pose");

        let mut accumulator =
            PoseAccumulator::new(self.config.samples_per_pose, self.config.consistency_threshold);

        for attempt in 1..=max_attempts {
            tokio::time::sleep(self.config.attempt_interval).await;

            let detection = match detector.detect_one().await {
                Ok(d) => d,
                Err(DetectionError::Fault(e)) => {
                    tracing::debug!(error = %e, attempt, "enroll: detection fault, counting as miss");
                    None
                }
                Err(e) => return Err(e.into()),
            };

            let pose_mean = accumulator.record(detection);
            on_event(EnrollmentEvent::Progress {
                pose: pose_index,
                attempt,
                max_attempts,
                samples: if pose_mean.is_some() {
                    self.config.samples_per_pose
                } else {
                    accumulator.collected()
                },
            });

            if let Some(mean) = pose_mean {
                self.pose_means.push(mean);
                tracing::info!(pose = pose_index, attempt, "enroll: pose captured");
                on_event(EnrollmentEvent::PoseCaptured { pose: pose_index });

                return Ok(match self.next_pose() {
                    Some(next_pose) => PoseOutcome::Captured { next_pose },
                    None => {
                        let reference =
                            Descriptor::mean(&self.pose_means).ok_or(EnrollmentError::AlreadyComplete)?;
                        tracing::info!(
                            poses = self.pose_means.len(),
                            dimension = reference.dimension(),
                            "enroll: reference descriptor ready"
                        );
                        on_event(EnrollmentEvent::Enrolled {
                            reference: reference.clone(),
                        });
                        PoseOutcome::Enrolled(reference)
                    }
                });
            }
        }

        tracing::warn!(pose = pose_index, attempts = max_attempts, "enroll: pose timed out");
        on_event(EnrollmentEvent::TimedOut { pose: pose_index });
        Err(EnrollmentError::Timeout {
            pose: pose_index,
            label: pose.label(),
            attempts: max_attempts,
        })
    }
}
