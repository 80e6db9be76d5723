//! Alert and recovery protocol.
//!
//! The consumer holds a single active alert. It is raised by the first alert
//! from the monitor, refreshed by later ones, and cleared by the owner coming
//! back alone, by an explicit allow while verified, or by the fallback
//! password.

use crate::monitor::MonitorObserver;
use crate::types::{AlertEvent, VerificationStatus};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

/// Checks a fallback password without exposing the stored digest.
pub trait PasswordVerifier {
    fn verify_password(&self, password: &str) -> bool;
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearError {
    #[error("identity not verified; use the backup password")]
    IdentityNotVerified,
    #[error("incorrect password")]
    PasswordMismatch,
}

/// How an alert was cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Clearance {
    AutoRecovered,
    Allowed,
    PasswordOverride,
}

#[derive(Debug, Default, Clone)]
pub struct AlertState {
    active: Option<AlertEvent>,
    last_verified: bool,
    raised: u64,
}

impl AlertState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> Option<&AlertEvent> {
        self.active.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn last_verified(&self) -> bool {
        self.last_verified
    }

    /// Alerts received since creation, including refreshes.
    pub fn alerts_raised(&self) -> u64 {
        self.raised
    }

    /// Raise an alert, or refresh the reason of the one already active.
    pub fn raise(&mut self, alert: AlertEvent) {
        if self.active.is_none() {
            tracing::warn!(reason = ?alert.reason, intruders = alert.intruder_count, "alert raised");
        }
        self.active = Some(alert);
        self.raised += 1;
    }

    /// Record a poll status. A verified status clears an active alert.
    pub fn observe(&mut self, status: &VerificationStatus) -> Option<Clearance> {
        self.last_verified = status.is_verified;
        if status.is_verified && self.active.take().is_some() {
            tracing::info!("owner back alone; alert cleared");
            return Some(Clearance::AutoRecovered);
        }
        None
    }

    /// Clear on the strength of the last visual verification.
    pub fn allow(&mut self) -> Result<Clearance, ClearError> {
        if !self.last_verified {
            tracing::info!("allow rejected: identity not verified");
            return Err(ClearError::IdentityNotVerified);
        }
        self.active = None;
        Ok(Clearance::Allowed)
    }

    /// Clear unconditionally if the fallback password checks out.
    pub fn unlock<V: PasswordVerifier + ?Sized>(
        &mut self,
        verifier: &V,
        password: &str,
    ) -> Result<Clearance, ClearError> {
        if !verifier.verify_password(password) {
            tracing::info!("unlock rejected: password mismatch");
            return Err(ClearError::PasswordMismatch);
        }
        if self.active.take().is_some() {
            tracing::info!("alert cleared by password override");
        }
        Ok(Clearance::PasswordOverride)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Shared [`AlertState`] that can be handed to a monitoring session as its observer.
#[derive(Debug, Clone, Default)]
pub struct AlertTracker {
    state: Arc<Mutex<AlertState>>,
}

impl AlertTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, AlertState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> AlertState {
        self.lock().clone()
    }
}

impl MonitorObserver for AlertTracker {
    fn on_status(&mut self, status: &VerificationStatus) {
        self.lock().observe(status);
    }

    fn on_alert(&mut self, alert: &AlertEvent) {
        self.lock().raise(*alert);
    }
}
