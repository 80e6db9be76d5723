//! Detection source seam.
//!
//! The face-detection model and the camera behind it are external. This module
//! defines the contract they satisfy ([`FaceDetector`]) and a clone-safe
//! [`DetectorHandle`] that runs detection on the blocking pool and scopes
//! camera acquisition with a [`CaptureGuard`].

use crate::types::Descriptor;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DetectionError {
    /// Camera or model not reachable; enrollment and monitoring cannot proceed.
    #[error("detection unavailable: {0}")]
    Unavailable(String),
    /// A single detection attempt failed.
    #[error("detection failed: {0}")]
    Fault(String),
}

/// A face detector bound to its frame source.
///
/// Implementations own their camera. `open` and `close` bracket every capture
/// session and are driven by [`DetectorHandle::acquire`].
pub trait FaceDetector: Send {
    /// Start the frame source.
    fn open(&mut self) -> Result<(), DetectionError> {
        Ok(())
    }

    /// Stop the frame source. Must be safe to call on a closed detector.
    fn close(&mut self) {}

    /// Descriptor of the single best face in frame, or `None` if nobody is there.
    fn detect_one(&mut self) -> Result<Option<Descriptor>, DetectionError>;

    /// Descriptors of every face in frame, in detector order.
    fn detect_all(&mut self) -> Result<Vec<Descriptor>, DetectionError>;
}

struct Shared {
    detector: Box<dyn FaceDetector>,
    leases: usize,
}

/// Clone-safe handle to a detector.
#[derive(Clone)]
pub struct DetectorHandle {
    shared: Arc<Mutex<Shared>>,
}

impl DetectorHandle {
    pub fn new<D: FaceDetector + 'static>(detector: D) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                detector: Box::new(detector),
                leases: 0,
            })),
        }
    }

    /// Open the frame source for the lifetime of the returned guard.
    ///
    /// Leases nest: the source is opened by the first guard and closed when
    /// the last one drops.
    pub async fn acquire(&self) -> Result<CaptureGuard, DetectionError> {
        self.run(|shared| {
            if shared.leases == 0 {
                shared.detector.open()?;
                tracing::debug!("frame source opened");
            }
            shared.leases += 1;
            Ok(())
        })
        .await?;

        Ok(CaptureGuard {
            handle: self.clone(),
        })
    }

    pub async fn detect_one(&self) -> Result<Option<Descriptor>, DetectionError> {
        self.run(|shared| shared.detector.detect_one()).await
    }

    pub async fn detect_all(&self) -> Result<Vec<Descriptor>, DetectionError> {
        self.run(|shared| shared.detector.detect_all()).await
    }

    /// Number of live capture guards.
    pub fn active_leases(&self) -> usize {
        self.lock().leases
    }

    async fn run<T, F>(&self, f: F) -> Result<T, DetectionError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Shared) -> Result<T, DetectionError> + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        tokio::task::spawn_blocking(move || {
            let mut guard = lock_shared(&shared);
            f(&mut *guard)
        })
        .await
        .map_err(|e| DetectionError::Fault(format!("detector task failed: {e}")))?
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        lock_shared(&self.shared)
    }
}

// A detector that panicked mid-call leaves no invariant behind the lock that
// `close` or the next detection cannot cope with.
fn lock_shared(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Keeps the frame source open. Closes it on drop, on every exit path.
pub struct CaptureGuard {
    handle: DetectorHandle,
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        let mut shared = self.handle.lock();
        shared.leases = shared.leases.saturating_sub(1);
        if shared.leases == 0 {
            shared.detector.close();
            tracing::debug!("frame source closed");
        }
    }
}
