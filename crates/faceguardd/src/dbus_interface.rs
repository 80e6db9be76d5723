use crate::guard::{Guard, GuardError};
use faceguard_core::{ClearError, EnrollmentError, EnrollmentEvent};
use std::sync::Arc;
use tokio::sync::mpsc;
use zbus::interface;
use zbus::object_server::SignalEmitter;

/// D-Bus interface for the FaceGuard daemon.
///
/// Bus name: org.faceguard.Guard1
/// Object path: /org/faceguard/Guard1
///
/// Structured replies are JSON strings. Pose capture progress is broadcast
/// on the `EnrollProgress` signal as JSON enrollment events.
pub struct GuardService {
    guard: Arc<Guard>,
}

impl GuardService {
    pub fn new(guard: Arc<Guard>) -> Self {
        Self { guard }
    }
}

fn to_fdo(err: GuardError) -> zbus::fdo::Error {
    use zbus::fdo::Error;
    let msg = err.to_string();
    match err {
        GuardError::Clear(ClearError::IdentityNotVerified | ClearError::PasswordMismatch) => {
            Error::AccessDenied(msg)
        }
        GuardError::Enrollment(EnrollmentError::Timeout { .. }) => Error::TimedOut(msg),
        GuardError::PasswordPolicy(_)
        | GuardError::Enrollment(
            EnrollmentError::PoseOutOfOrder { .. } | EnrollmentError::AlreadyComplete,
        ) => Error::InvalidArgs(msg),
        _ => Error::Failed(msg),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

#[interface(name = "org.faceguard.Guard1")]
impl GuardService {
    /// Registration, enrollment, session and alert state.
    async fn status(&self) -> zbus::fdo::Result<String> {
        to_json(&self.guard.status().await)
    }

    /// Capture enrollment pose `pose`; poses must be captured in order.
    async fn enroll_pose(
        &self,
        pose: u32,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(pose, "enroll_pose requested");

        let (tx, mut rx) = mpsc::unbounded_channel::<EnrollmentEvent>();
        let capture = self.guard.enroll_pose(pose as usize, move |event| {
            let _ = tx.send(event);
        });
        let forward = async {
            while let Some(event) = rx.recv().await {
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::warn!(error = %e, "unencodable enroll event");
                        continue;
                    }
                };
                if let Err(e) = Self::enroll_progress(&emitter, &json).await {
                    tracing::debug!(error = %e, "enroll progress signal not sent");
                }
            }
        };

        let (step, ()) = tokio::join!(capture, forward);
        to_json(&step.map_err(to_fdo)?)
    }

    /// Progress of the pose being captured.
    #[zbus(signal)]
    async fn enroll_progress(emitter: &SignalEmitter<'_>, event: &str) -> zbus::Result<()>;

    async fn reset_enrollment(&self) -> zbus::fdo::Result<()> {
        self.guard.reset_enrollment().map_err(to_fdo)
    }

    async fn set_password(&self, password: &str, confirm: &str) -> zbus::fdo::Result<()> {
        tracing::info!("set_password requested");
        self.guard.set_password(password, confirm).map_err(to_fdo)
    }

    async fn set_user_name(&self, name: &str) -> zbus::fdo::Result<()> {
        self.guard.set_user_name(name).map_err(to_fdo)
    }

    /// Start monitoring. Returns the session id.
    async fn start_protection(&self) -> zbus::fdo::Result<String> {
        tracing::info!("start_protection requested");
        self.guard.start_protection().await.map_err(to_fdo)
    }

    /// Stop monitoring. Returns false if nothing was running.
    async fn stop_protection(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("stop_protection requested");
        Ok(self.guard.stop_protection().await)
    }

    /// Clear the active alert if the owner was verified on the last poll.
    async fn allow(&self) -> zbus::fdo::Result<String> {
        let clearance = self.guard.allow().map_err(to_fdo)?;
        to_json(&clearance)
    }

    /// Clear the active alert with the fallback password.
    async fn unlock(&self, password: &str) -> zbus::fdo::Result<String> {
        let clearance = self.guard.unlock(password).map_err(to_fdo)?;
        to_json(&clearance)
    }

    /// Stop protection and erase all stored credentials.
    async fn reset(&self) -> zbus::fdo::Result<()> {
        tracing::warn!("reset requested");
        self.guard.reset().await.map_err(to_fdo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faceguard_store::PasswordPolicyError;

    #[test]
    fn test_error_mapping() {
        assert!(matches!(
            to_fdo(GuardError::Clear(ClearError::PasswordMismatch)),
            zbus::fdo::Error::AccessDenied(_)
        ));
        assert!(matches!(
            to_fdo(GuardError::PasswordPolicy(PasswordPolicyError::ConfirmationMismatch)),
            zbus::fdo::Error::InvalidArgs(_)
        ));
        assert!(matches!(
            to_fdo(GuardError::NotEnrolled),
            zbus::fdo::Error::Failed(_)
        ));
        assert!(matches!(
            to_fdo(GuardError::EnrollmentInProgress),
            zbus::fdo::Error::Failed(_)
        ));
    }

    #[test]
    fn test_only_pose_timeout_maps_to_timed_out() {
        let timeout = GuardError::Enrollment(EnrollmentError::Timeout {
            pose: 2,
            label: "right",
            attempts: 15,
        });
        assert!(matches!(to_fdo(timeout), zbus::fdo::Error::TimedOut(_)));
        assert!(matches!(
            to_fdo(GuardError::Enrollment(EnrollmentError::PoseOutOfOrder {
                expected: 0,
                got: 3
            })),
            zbus::fdo::Error::InvalidArgs(_)
        ));
        assert!(matches!(
            to_fdo(GuardError::ProtectionActive),
            zbus::fdo::Error::Failed(_)
        ));
    }
}
