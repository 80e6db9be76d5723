use crate::config::Config;
use faceguard_core::{
    AlertEvent, AlertTracker, ClearError, Clearance, DetectionError, DetectorHandle, Enrollment,
    EnrollmentError, EnrollmentEvent, Monitor, MonitorConfig, MonitorHandle, PoseOutcome,
    SessionState,
};
use faceguard_store::{check_new_password, CredentialStore, PasswordPolicyError, StoreError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Error, Debug)]
pub enum GuardError {
    #[error("no identity enrolled")]
    NotEnrolled,
    #[error("protection already active")]
    AlreadyActive,
    #[error("protection is active; stop it first")]
    ProtectionActive,
    #[error("enrollment in progress")]
    EnrollmentInProgress,
    #[error("enrolled descriptor has dimension {enrolled}, detector produces {detector}; re-enroll")]
    DimensionMismatch { enrolled: usize, detector: usize },
    #[error(transparent)]
    Detection(#[from] DetectionError),
    #[error(transparent)]
    Enrollment(#[from] EnrollmentError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    PasswordPolicy(#[from] PasswordPolicyError),
    #[error(transparent)]
    Clear(#[from] ClearError),
}

/// Outcome of one enrollment pose.
#[derive(Debug, Clone, Serialize)]
pub struct EnrollStep {
    pub pose: usize,
    pub label: &'static str,
    /// Next pose to capture; `None` once enrollment is finished.
    pub next_pose: Option<usize>,
    pub enrolled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct GuardStatus {
    pub version: &'static str,
    pub user_name: String,
    pub registered: bool,
    pub registered_at: Option<String>,
    pub enrolled: bool,
    pub has_password: bool,
    pub enrollment_in_progress: bool,
    /// Unknown while a pose is being captured.
    pub enrollment_next_pose: Option<usize>,
    pub enrollment_poses: usize,
    pub protection_active: bool,
    pub session_id: Option<String>,
    pub session_state: SessionState,
    pub alert: Option<AlertEvent>,
    pub last_verified: bool,
}

/// Owns the credential store, the detector and at most one monitoring session.
///
/// Lock order is `enrollment` then `session`. Enrollment and protection are
/// mutually exclusive: each holds the enrollment lock while checking the other.
pub struct Guard {
    store: CredentialStore,
    detector: DetectorHandle,
    monitor_config: MonitorConfig,
    dimension: usize,
    poses: usize,
    enrollment: Mutex<Enrollment>,
    session: Mutex<Option<MonitorHandle>>,
    alerts: AlertTracker,
}

impl Guard {
    pub fn new(store: CredentialStore, detector: DetectorHandle, config: &Config) -> Self {
        Self {
            store,
            detector,
            monitor_config: config.monitor_config(),
            dimension: config.descriptor_dimension,
            poses: config.enrollment_config().poses.len(),
            enrollment: Mutex::new(Enrollment::new(config.enrollment_config())),
            session: Mutex::new(None),
            alerts: AlertTracker::new(),
        }
    }

    /// Capture one enrollment pose, reporting progress through `on_event`.
    /// The reference descriptor is saved once the last pose is in.
    pub async fn enroll_pose<F>(&self, pose: usize, mut on_event: F) -> Result<EnrollStep, GuardError>
    where
        F: FnMut(EnrollmentEvent) + Send,
    {
        let mut enrollment = self
            .enrollment
            .try_lock()
            .map_err(|_| GuardError::EnrollmentInProgress)?;
        if self.protection_active().await {
            return Err(GuardError::ProtectionActive);
        }

        let label = enrollment
            .config()
            .poses
            .get(pose)
            .map(|p| p.label())
            .unwrap_or("unknown");

        let outcome = enrollment
            .capture_pose(&self.detector, pose, |event| {
                match &event {
                    EnrollmentEvent::Progress {
                        pose,
                        attempt,
                        max_attempts,
                        samples,
                    } => tracing::debug!(pose, attempt, max_attempts, samples, "enroll progress"),
                    EnrollmentEvent::TimedOut { pose } => {
                        tracing::info!(pose, "enroll pose timed out; retry the same pose")
                    }
                    _ => {}
                }
                on_event(event);
            })
            .await?;

        match outcome {
            PoseOutcome::Captured { next_pose } => Ok(EnrollStep {
                pose,
                label,
                next_pose: Some(next_pose),
                enrolled: false,
            }),
            PoseOutcome::Enrolled(reference) => {
                self.store.save_reference_descriptor(&reference)?;
                enrollment.reset();
                tracing::info!("enrollment complete; set a backup password to finish registration");
                Ok(EnrollStep {
                    pose,
                    label,
                    next_pose: None,
                    enrolled: true,
                })
            }
        }
    }

    pub fn reset_enrollment(&self) -> Result<(), GuardError> {
        self.enrollment
            .try_lock()
            .map_err(|_| GuardError::EnrollmentInProgress)?
            .reset();
        Ok(())
    }

    /// Set the fallback password. Finishes registration once a descriptor is enrolled.
    pub fn set_password(&self, password: &str, confirm: &str) -> Result<(), GuardError> {
        check_new_password(password, confirm)?;
        if self.store.reference_descriptor().is_none() {
            return Err(GuardError::NotEnrolled);
        }
        self.store.set_password(password)?;
        self.store.set_registered(true)?;
        Ok(())
    }

    pub fn set_user_name(&self, name: &str) -> Result<(), GuardError> {
        self.store.set_user_name(name.trim())?;
        Ok(())
    }

    /// Start monitoring against the enrolled descriptor. Returns the session id.
    pub async fn start_protection(&self) -> Result<String, GuardError> {
        let _enrollment = self
            .enrollment
            .try_lock()
            .map_err(|_| GuardError::EnrollmentInProgress)?;
        let mut session = self.session.lock().await;
        if session.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(GuardError::AlreadyActive);
        }

        let reference = self
            .store
            .reference_descriptor()
            .ok_or(GuardError::NotEnrolled)?;
        if reference.dimension() != self.dimension {
            return Err(GuardError::DimensionMismatch {
                enrolled: reference.dimension(),
                detector: self.dimension,
            });
        }

        self.alerts.lock().reset();
        let handle = Monitor::start(
            self.detector.clone(),
            reference,
            self.monitor_config.clone(),
            self.alerts.clone(),
        )
        .await?;

        let id = handle.session_id().to_string();
        *session = Some(handle);
        Ok(id)
    }

    /// Stop monitoring. Returns whether a session was running.
    pub async fn stop_protection(&self) -> bool {
        let Some(handle) = self.session.lock().await.take() else {
            return false;
        };
        let was_running = !handle.is_finished();
        handle.stop().await;
        was_running
    }

    async fn protection_active(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Clear the alert on the strength of the last visual verification.
    pub fn allow(&self) -> Result<Clearance, GuardError> {
        Ok(self.alerts.lock().allow()?)
    }

    /// Clear the alert with the fallback password.
    pub fn unlock(&self, password: &str) -> Result<Clearance, GuardError> {
        Ok(self.alerts.lock().unlock(&self.store, password)?)
    }

    /// Stop protection, then erase every credential. Waits for a pose capture
    /// in flight so nothing it saves survives the reset.
    pub async fn reset(&self) -> Result<(), GuardError> {
        let mut enrollment = self.enrollment.lock().await;
        self.stop_protection().await;
        self.store.clear_all()?;
        enrollment.reset();
        self.alerts.lock().reset();
        tracing::info!("application reset");
        Ok(())
    }

    pub async fn status(&self) -> GuardStatus {
        let (protection_active, session_id, session_state) = {
            let session = self.session.lock().await;
            match session.as_ref() {
                Some(h) if !h.is_finished() => {
                    (true, Some(h.session_id().to_string()), h.state())
                }
                _ => (false, None, SessionState::Idle),
            }
        };
        let (enrollment_in_progress, enrollment_next_pose) = match self.enrollment.try_lock() {
            Ok(enrollment) => (false, enrollment.next_pose()),
            Err(_) => (true, None),
        };
        let alerts = self.alerts.snapshot();

        GuardStatus {
            version: env!("CARGO_PKG_VERSION"),
            user_name: self
                .store
                .user_name()
                .unwrap_or_else(|_| faceguard_store::DEFAULT_USER_NAME.to_string()),
            registered: self.store.is_registered(),
            registered_at: self.store.registered_at().map(|t| t.to_rfc3339()),
            enrolled: self.store.reference_descriptor().is_some(),
            has_password: self.store.has_password(),
            enrollment_in_progress,
            enrollment_next_pose,
            enrollment_poses: self.poses,
            protection_active,
            session_id,
            session_state,
            alert: alerts.active().copied(),
            last_verified: alerts.last_verified(),
        }
    }
}
