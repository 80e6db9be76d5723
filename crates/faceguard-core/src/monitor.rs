//! Owner-presence monitoring.
//!
//! One cooperative task per session: poll the detector, classify the
//! observation against the reference descriptor, deliver status and alert to
//! the observer, sleep, repeat. Polls never overlap and the interval is
//! measured from the end of the previous poll.

use crate::detector::{DetectionError, DetectorHandle};
use crate::types::{
    AlertEvent, AlertReason, Descriptor, EuclideanMatcher, Matcher, SessionState,
    VerificationStatus,
};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// What a failed detection poll means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorFaultPolicy {
    /// Treat the failure as an empty frame: the owner is reported absent.
    #[default]
    Alert,
    /// Report not-verified without raising an alert.
    Suppress,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
    pub matcher: EuclideanMatcher,
    pub fault_policy: DetectorFaultPolicy,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            matcher: EuclideanMatcher::default(),
            fault_policy: DetectorFaultPolicy::default(),
        }
    }
}

/// Classification of one poll.
#[derive(Debug, Clone, PartialEq)]
pub struct PollOutcome {
    pub state: SessionState,
    pub status: VerificationStatus,
    pub alert: Option<AlertEvent>,
}

/// Classify one observation against the reference descriptor.
///
/// Verified iff exactly one face is in frame and it matches. When several faces
/// match, the first in observation order is taken as the owner.
pub fn classify<M: Matcher>(
    observation: &[Descriptor],
    reference: &Descriptor,
    matcher: &M,
) -> PollOutcome {
    if observation.is_empty() {
        return PollOutcome {
            state: SessionState::PresenceLost,
            status: VerificationStatus::unverified(),
            alert: Some(AlertEvent {
                reason: AlertReason::PresenceLost,
                intruder_count: 0,
            }),
        };
    }

    let owner = observation.iter().find(|d| matcher.matches(d, reference));
    let total = observation.len();

    if total == 1 && owner.is_some() {
        return PollOutcome {
            state: SessionState::Verified,
            status: VerificationStatus {
                is_verified: true,
                matched: owner.cloned(),
            },
            alert: None,
        };
    }

    let (state, reason) = if total > 1 {
        (SessionState::IntruderPresent, AlertReason::IntruderDetected)
    } else {
        (SessionState::IdentityMismatch, AlertReason::IdentityMismatch)
    };
    let intruder_count = total - usize::from(owner.is_some());

    PollOutcome {
        state,
        status: VerificationStatus {
            is_verified: false,
            matched: owner.cloned(),
        },
        alert: Some(AlertEvent {
            reason,
            intruder_count: u32::try_from(intruder_count).unwrap_or(u32::MAX),
        }),
    }
}

/// Receives monitoring results. Called from the session task, in poll order:
/// status first, then the alert if the poll raised one.
pub trait MonitorObserver: Send + 'static {
    fn on_status(&mut self, status: &VerificationStatus);
    fn on_alert(&mut self, alert: &AlertEvent);
}

/// Event forwarded by the channel observer.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    Status(VerificationStatus),
    Alert(AlertEvent),
}

impl MonitorObserver for mpsc::UnboundedSender<MonitorEvent> {
    fn on_status(&mut self, status: &VerificationStatus) {
        let _ = self.send(MonitorEvent::Status(status.clone()));
    }

    fn on_alert(&mut self, alert: &AlertEvent) {
        let _ = self.send(MonitorEvent::Alert(*alert));
    }
}

/// Handle to a running monitoring session. Dropping it stops the session.
pub struct MonitorHandle {
    session_id: Uuid,
    cancel: CancellationToken,
    state: watch::Receiver<SessionState>,
    task: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// State after the most recent poll.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Request cancellation without waiting. A poll already being delivered
    /// may still reach the observer; use [`MonitorHandle::stop`] when nothing
    /// may be delivered afterwards.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Cancel and wait for the session task to exit and release the camera.
    /// Once this returns the observer receives nothing further, including the
    /// result of a poll that was in flight.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        self.join_task().await;
    }

    /// Wait for the session task to exit without cancelling it.
    pub async fn join(mut self) {
        self.join_task().await;
    }

    async fn join_task(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!(session = %self.session_id, error = %e, "monitor task failed");
            }
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct Monitor;

impl Monitor {
    /// Start a monitoring session.
    ///
    /// The camera is acquired before returning, so an unreachable detector is
    /// reported here rather than as a stream of alerts. The first poll runs
    /// immediately.
    pub async fn start<O: MonitorObserver>(
        detector: DetectorHandle,
        reference: Descriptor,
        config: MonitorConfig,
        observer: O,
    ) -> Result<MonitorHandle, DetectionError> {
        let capture = detector.acquire().await?;

        let session_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(SessionState::Polling);

        let span = tracing::info_span!("monitor", session = %session_id);
        let session = PollLoop {
            detector,
            reference,
            config,
            observer,
            cancel: cancel.clone(),
            state: state_tx,
        };
        let task = tokio::spawn(
            async move {
                let _capture = capture;
                session.run().await;
            }
            .instrument(span),
        );

        tracing::info!(session = %session_id, "monitoring started");

        Ok(MonitorHandle {
            session_id,
            cancel,
            state: state_rx,
            task: Some(task),
        })
    }
}

struct PollLoop<O> {
    detector: DetectorHandle,
    reference: Descriptor,
    config: MonitorConfig,
    observer: O,
    cancel: CancellationToken,
    state: watch::Sender<SessionState>,
}

impl<O: MonitorObserver> PollLoop<O> {
    async fn run(mut self) {
        let mut polls: u64 = 0;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let observation = self.detector.detect_all().await;

            // Stopped while the detector was busy: drop the result.
            if self.cancel.is_cancelled() {
                tracing::debug!("discarding in-flight poll result");
                break;
            }

            polls += 1;
            let outcome = self.evaluate(observation);
            self.deliver(&outcome);

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        self.state.send_replace(SessionState::Idle);
        tracing::info!(polls, "monitoring stopped");
    }

    fn evaluate(&self, observation: Result<Vec<Descriptor>, DetectionError>) -> PollOutcome {
        match observation {
            Ok(faces) => classify(&faces, &self.reference, &self.config.matcher),
            Err(e) => match self.config.fault_policy {
                DetectorFaultPolicy::Alert => {
                    tracing::warn!(error = %e, "detection failed; treating as empty frame");
                    classify(&[], &self.reference, &self.config.matcher)
                }
                DetectorFaultPolicy::Suppress => {
                    tracing::warn!(error = %e, "detection failed; alert suppressed");
                    PollOutcome {
                        state: SessionState::DetectorUnavailable,
                        status: VerificationStatus::unverified(),
                        alert: None,
                    }
                }
            },
        }
    }

    fn deliver(&mut self, outcome: &PollOutcome) {
        let previous = self.state.send_replace(outcome.state);
        if previous != outcome.state {
            tracing::info!(from = ?previous, to = ?outcome.state, "monitor state changed");
        }

        self.observer.on_status(&outcome.status);
        if let Some(alert) = &outcome.alert {
            tracing::debug!(reason = ?alert.reason, intruders = alert.intruder_count, "alert raised");
            self.observer.on_alert(alert);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::testing::ScriptedDetector;
    use crate::detector::FaceDetector;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use tokio::time::timeout;

    const STEP: Duration = Duration::from_secs(2);

    fn d(values: &[f32]) -> Descriptor {
        Descriptor::new(values.to_vec())
    }

    fn owner() -> Descriptor {
        d(&[0.0, 0.0, 0.0])
    }

    fn stranger() -> Descriptor {
        d(&[1.0, 1.0, 1.0])
    }

    fn other_stranger() -> Descriptor {
        d(&[-1.0, 2.0, 0.5])
    }

    fn fast_config() -> MonitorConfig {
        MonitorConfig {
            poll_interval: Duration::from_millis(5),
            ..MonitorConfig::default()
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<MonitorEvent>) -> MonitorEvent {
        timeout(STEP, rx.recv()).await.unwrap().unwrap()
    }

    #[test]
    fn test_classify_empty_frame() {
        let out = classify(&[], &owner(), &EuclideanMatcher::default());
        assert_eq!(out.state, SessionState::PresenceLost);
        assert!(!out.status.is_verified);
        assert_eq!(
            out.alert,
            Some(AlertEvent { reason: AlertReason::PresenceLost, intruder_count: 0 })
        );
    }

    #[test]
    fn test_classify_owner_alone() {
        let out = classify(&[owner()], &owner(), &EuclideanMatcher::default());
        assert_eq!(out.state, SessionState::Verified);
        assert!(out.status.is_verified);
        assert_eq!(out.status.matched, Some(owner()));
        assert!(out.alert.is_none());
    }

    #[test]
    fn test_classify_single_stranger() {
        let out = classify(&[stranger()], &owner(), &EuclideanMatcher::default());
        assert_eq!(out.state, SessionState::IdentityMismatch);
        assert!(!out.status.is_verified);
        assert_eq!(
            out.alert,
            Some(AlertEvent { reason: AlertReason::IdentityMismatch, intruder_count: 1 })
        );
    }

    #[test]
    fn test_classify_owner_with_onlooker() {
        let out = classify(&[owner(), stranger()], &owner(), &EuclideanMatcher::default());
        assert_eq!(out.state, SessionState::IntruderPresent);
        assert!(!out.status.is_verified);
        assert_eq!(out.status.matched, Some(owner()));
        assert_eq!(
            out.alert,
            Some(AlertEvent { reason: AlertReason::IntruderDetected, intruder_count: 1 })
        );
    }

    #[test]
    fn test_classify_two_strangers() {
        let out = classify(&[stranger(), other_stranger()], &owner(), &EuclideanMatcher::default());
        assert!(!out.status.is_verified);
        assert!(out.status.matched.is_none());
        assert_eq!(
            out.alert,
            Some(AlertEvent { reason: AlertReason::IntruderDetected, intruder_count: 2 })
        );
    }

    #[test]
    fn test_classify_first_match_wins() {
        let near_owner = d(&[0.1, 0.0, 0.0]);
        let out = classify(&[near_owner.clone(), owner()], &owner(), &EuclideanMatcher::default());
        assert_eq!(out.status.matched, Some(near_owner));
        assert_eq!(out.alert.unwrap().intruder_count, 1);
    }

    #[test]
    fn test_classify_respects_threshold() {
        let close = d(&[0.3, 0.0, 0.0]);
        let strict = EuclideanMatcher::new(0.2);
        assert!(!classify(&[close.clone()], &owner(), &strict).status.is_verified);
        assert!(classify(&[close], &owner(), &EuclideanMatcher::default()).status.is_verified);
    }

    #[tokio::test]
    async fn test_session_emits_status_then_alert() {
        let detector = ScriptedDetector::faces(vec![vec![], vec![owner()]]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = Monitor::start(DetectorHandle::new(detector), owner(), fast_config(), tx)
            .await
            .unwrap();

        assert_eq!(next_event(&mut rx).await, MonitorEvent::Status(VerificationStatus::unverified()));
        assert_eq!(
            next_event(&mut rx).await,
            MonitorEvent::Alert(AlertEvent { reason: AlertReason::PresenceLost, intruder_count: 0 })
        );
        let MonitorEvent::Status(status) = next_event(&mut rx).await else {
            panic!("expected status");
        };
        assert!(status.is_verified);

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_session_state_tracks_polls() {
        let detector = ScriptedDetector::faces(vec![vec![owner(), stranger()]]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = Monitor::start(DetectorHandle::new(detector), owner(), fast_config(), tx)
            .await
            .unwrap();

        next_event(&mut rx).await;
        next_event(&mut rx).await;
        assert_eq!(handle.state(), SessionState::IntruderPresent);
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_stop_delivers_nothing_further() {
        let detector = ScriptedDetector::faces(vec![vec![stranger()]]);
        let calls = Arc::clone(&detector.calls);
        let open = Arc::clone(&detector.open);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = Monitor::start(DetectorHandle::new(detector), owner(), fast_config(), tx)
            .await
            .unwrap();

        next_event(&mut rx).await;
        handle.stop().await;
        while rx.try_recv().is_ok() {}

        let polls_at_stop = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(rx.try_recv().is_err());
        assert_eq!(calls.load(Ordering::SeqCst), polls_at_stop);
        assert!(!open.load(Ordering::SeqCst));
    }

    /// Blocks inside `detect_all` until released, to hold a poll in flight.
    struct GatedDetector {
        entered: std::sync::mpsc::Sender<()>,
        release: std::sync::mpsc::Receiver<()>,
    }

    impl FaceDetector for GatedDetector {
        fn detect_one(&mut self) -> Result<Option<Descriptor>, DetectionError> {
            Ok(None)
        }

        fn detect_all(&mut self) -> Result<Vec<Descriptor>, DetectionError> {
            let _ = self.entered.send(());
            let _ = self.release.recv();
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn test_cancel_discards_in_flight_poll() {
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let detector = GatedDetector {
            entered: entered_tx,
            release: release_rx,
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = Monitor::start(DetectorHandle::new(detector), owner(), fast_config(), tx)
            .await
            .unwrap();

        tokio::task::spawn_blocking(move || entered_rx.recv())
            .await
            .unwrap()
            .unwrap();
        handle.cancel();
        release_tx.send(()).unwrap();

        timeout(STEP, handle.join()).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_waits_out_in_flight_poll() {
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let detector = GatedDetector {
            entered: entered_tx,
            release: release_rx,
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = Monitor::start(DetectorHandle::new(detector), owner(), fast_config(), tx)
            .await
            .unwrap();

        tokio::task::spawn_blocking(move || entered_rx.recv())
            .await
            .unwrap()
            .unwrap();

        let release = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            release_tx.send(()).unwrap();
        };
        timeout(STEP, async { tokio::join!(handle.stop(), release) })
            .await
            .unwrap();

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fault_policy_alert_reports_presence_lost() {
        let detector = ScriptedDetector::new(vec![Err(DetectionError::Fault("glitch".into()))]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = Monitor::start(DetectorHandle::new(detector), owner(), fast_config(), tx)
            .await
            .unwrap();

        next_event(&mut rx).await;
        assert_eq!(
            next_event(&mut rx).await,
            MonitorEvent::Alert(AlertEvent { reason: AlertReason::PresenceLost, intruder_count: 0 })
        );
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_fault_policy_suppress_raises_no_alert() {
        let detector = ScriptedDetector::new(vec![
            Err(DetectionError::Fault("glitch".into())),
            Ok(vec![owner()]),
        ]);
        let config = MonitorConfig {
            fault_policy: DetectorFaultPolicy::Suppress,
            ..fast_config()
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = Monitor::start(DetectorHandle::new(detector), owner(), config, tx)
            .await
            .unwrap();

        assert_eq!(next_event(&mut rx).await, MonitorEvent::Status(VerificationStatus::unverified()));
        let MonitorEvent::Status(status) = next_event(&mut rx).await else {
            panic!("suppressed fault must not raise an alert");
        };
        assert!(status.is_verified);
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_start_fails_without_camera() {
        let mut detector = ScriptedDetector::faces(vec![]);
        detector.fail_open = true;
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = Monitor::start(DetectorHandle::new(detector), owner(), fast_config(), tx).await;
        assert!(matches!(result.err(), Some(DetectionError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_dropping_handle_stops_session() {
        let detector = ScriptedDetector::faces(vec![vec![owner()]]);
        let open = Arc::clone(&detector.open);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = Monitor::start(DetectorHandle::new(detector), owner(), fast_config(), tx)
            .await
            .unwrap();

        next_event(&mut rx).await;
        drop(handle);

        // The task exits and drops the sender, closing the channel.
        while timeout(STEP, rx.recv()).await.unwrap().is_some() {}
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!open.load(Ordering::SeqCst));
    }
}
