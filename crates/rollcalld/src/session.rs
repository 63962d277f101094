//! Asynchronous scanning loop.
//!
//! One loop per session: wait for the next frame tick, ask the detector for
//! feature vectors (bounded by a timeout), and hand each vector to the engine.
//! Cycles never overlap; the engine's confirmation state decides whether a
//! vector is matched at all.

use crate::detector::{Detector, DetectorError};
use crate::engine::{EngineError, EngineHandle};
use chrono::Local;
use rollcall_core::{ControllerError, ScanOutcome};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("acquisition failure: {0}")]
    Acquisition(String),
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Notifications for the UI/operator surface.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Started { session_id: String, identities: usize },
    /// Reported once per session start when nobody is enrolled.
    NoGalleryData,
    /// Per-tick status text. Display only.
    Diagnostic(String),
    /// An event was recorded; the UI should block until acknowledged.
    Confirmation { display_name: String, confidence: u8 },
    Ended { reason: String },
}

/// How a session loop finished without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Cancelled,
    SourceExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub tick_interval: Duration,
    pub detect_timeout: Duration,
}

/// Run a scanning session until cancelled, the source ends, or acquisition fails.
///
/// The engine session must already be open (see [`EngineHandle::begin_session`]);
/// `identities` is the gallery size it reported.
pub async fn run_session<D: Detector>(
    session_id: &str,
    identities: usize,
    engine: &EngineHandle,
    detector: &mut D,
    settings: SessionSettings,
    cancel: &CancellationToken,
    events: &broadcast::Sender<SessionEvent>,
) -> Result<SessionEnd, SessionError> {
    tracing::info!(identities, "scanning session started");
    let _ = events.send(SessionEvent::Started {
        session_id: session_id.to_string(),
        identities,
    });
    if identities == 0 {
        tracing::warn!("no enrolled identities; scanning will never match");
        let _ = events.send(SessionEvent::NoGalleryData);
    }

    let mut ticker = tokio::time::interval(settings.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
            _ = ticker.tick() => {}
        }

        // Dropping the detector future on cancellation releases the pending call.
        let detected = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
            r = tokio::time::timeout(settings.detect_timeout, detector.detect()) => r,
        };

        let vectors = match detected {
            Ok(Ok(vectors)) => vectors,
            Ok(Err(DetectorError::Transient(msg))) => {
                tracing::warn!(error = %msg, "detection failed for this tick");
                let _ = events.send(SessionEvent::Diagnostic(format!("detection failed: {msg}")));
                continue;
            }
            Ok(Err(DetectorError::Unavailable(msg))) => {
                return Err(SessionError::Acquisition(msg));
            }
            Ok(Err(DetectorError::Exhausted)) => return Ok(SessionEnd::SourceExhausted),
            Err(_) => {
                tracing::debug!(
                    timeout_ms = settings.detect_timeout.as_millis() as u64,
                    "detector timed out"
                );
                let _ = events.send(SessionEvent::Diagnostic("detector timed out".into()));
                continue;
            }
        };

        if vectors.is_empty() {
            let _ = events.send(SessionEvent::Diagnostic("no face detected".into()));
            continue;
        }

        for vector in vectors {
            if cancel.is_cancelled() {
                return Ok(SessionEnd::Cancelled);
            }

            match engine.query(vector, Local::now(), cancel.clone()).await {
                Ok(outcome) => {
                    let _ = events.send(SessionEvent::Diagnostic(outcome.diagnostic()));
                    if let ScanOutcome::Recorded { event, .. } = outcome {
                        let _ = events.send(SessionEvent::Confirmation {
                            display_name: event.display_name,
                            confidence: event.confidence,
                        });
                    }
                }
                Err(EngineError::Cancelled) => return Ok(SessionEnd::Cancelled),
                Err(EngineError::Controller(err)) => {
                    match &err {
                        ControllerError::Persistence(_) => {
                            tracing::error!(error = %err, "attendance not recorded; cycle aborted")
                        }
                        ControllerError::Lookup(_) => {
                            tracing::warn!(error = %err, "eligibility lookup failed; cycle aborted")
                        }
                    }
                    let _ = events.send(SessionEvent::Diagnostic(err.to_string()));
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_engine;
    use rollcall_core::{
        AttendanceStore, EligibilityPolicy, FeatureVector, MatchPolicy, FEATURE_DIM,
    };
    use rollcall_store::SqliteStore;
    use std::collections::VecDeque;

    /// Scripted detector: pops one step per call.
    enum Step {
        Frame(Vec<FeatureVector>),
        Fail(DetectorError),
        Hang,
    }

    struct ScriptedDetector {
        steps: VecDeque<Step>,
    }

    impl Detector for ScriptedDetector {
        async fn detect(&mut self) -> Result<Vec<FeatureVector>, DetectorError> {
            match self.steps.pop_front() {
                Some(Step::Frame(v)) => Ok(v),
                Some(Step::Fail(e)) => Err(e),
                Some(Step::Hang) => std::future::pending().await,
                None => Err(DetectorError::Exhausted),
            }
        }
    }

    fn vector(v: f32) -> FeatureVector {
        FeatureVector::new(vec![v; FEATURE_DIM]).unwrap()
    }

    fn settings() -> SessionSettings {
        SessionSettings {
            tick_interval: Duration::from_millis(1),
            detect_timeout: Duration::from_millis(50),
        }
    }

    fn engine_with(names: &[(&str, f32)]) -> EngineHandle {
        let mut store = SqliteStore::open_in_memory().unwrap();
        for (name, v) in names {
            store.enroll(name, &vector(*v)).unwrap();
        }
        spawn_engine(
            store,
            MatchPolicy::default(),
            EligibilityPolicy {
                once_per_day: false,
                ..Default::default()
            },
        )
        .unwrap()
    }

    async fn run<D: Detector>(
        session_id: &str,
        engine: &EngineHandle,
        detector: &mut D,
        settings: SessionSettings,
        cancel: &CancellationToken,
        events: &broadcast::Sender<SessionEvent>,
    ) -> Result<SessionEnd, SessionError> {
        let identities = engine.begin_session().await?;
        run_session(session_id, identities, engine, detector, settings, cancel, events).await
    }

    fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn confirmations(events: &[SessionEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, SessionEvent::Confirmation { .. }))
            .count()
    }

    #[tokio::test]
    async fn test_records_once_while_awaiting_ack() {
        let engine = engine_with(&[("Ada", 0.1)]);
        let (tx, mut rx) = broadcast::channel(256);
        let mut steps: VecDeque<Step> = (0..10).map(|_| Step::Frame(vec![vector(0.1)])).collect();
        steps.push_front(Step::Frame(vec![vector(0.1)]));
        let mut detector = ScriptedDetector { steps };

        let end = run("s1", &engine, &mut detector, settings(), &CancellationToken::new(), &tx)
            .await
            .unwrap();
        assert_eq!(end, SessionEnd::SourceExhausted);

        let events = drain(&mut rx);
        assert_eq!(confirmations(&events), 1);
        assert!(events.contains(&SessionEvent::Confirmation {
            display_name: "Ada".into(),
            confidence: 100,
        }));
        assert_eq!(
            events
                .iter()
                .filter(|e| **e == SessionEvent::Diagnostic("awaiting acknowledgment".into()))
                .count(),
            10
        );
    }

    #[tokio::test]
    async fn test_survives_transient_errors_and_timeouts() {
        let engine = engine_with(&[("Ada", 0.1)]);
        let (tx, mut rx) = broadcast::channel(64);
        let mut detector = ScriptedDetector {
            steps: VecDeque::from(vec![
                Step::Fail(DetectorError::Transient("blurry".into())),
                Step::Hang,
                Step::Frame(Vec::new()),
                Step::Frame(vec![vector(0.1)]),
            ]),
        };

        let end = run("s2", &engine, &mut detector, settings(), &CancellationToken::new(), &tx)
            .await
            .unwrap();
        assert_eq!(end, SessionEnd::SourceExhausted);

        let events = drain(&mut rx);
        assert!(events.contains(&SessionEvent::Diagnostic("detection failed: blurry".into())));
        assert!(events.contains(&SessionEvent::Diagnostic("detector timed out".into())));
        assert!(events.contains(&SessionEvent::Diagnostic("no face detected".into())));
        assert_eq!(confirmations(&events), 1);
    }

    #[tokio::test]
    async fn test_acquisition_failure_ends_session() {
        let engine = engine_with(&[("Ada", 0.1)]);
        let (tx, _rx) = broadcast::channel(16);
        let mut detector = ScriptedDetector {
            steps: VecDeque::from(vec![
                Step::Fail(DetectorError::Unavailable("camera unplugged".into())),
                Step::Frame(vec![vector(0.1)]),
            ]),
        };

        let err = run("s3", &engine, &mut detector, settings(), &CancellationToken::new(), &tx)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Acquisition(msg) if msg == "camera unplugged"));
        assert_eq!(
            engine.status().await.unwrap().state,
            rollcall_core::ConfirmationState::Scanning
        );
    }

    #[tokio::test]
    async fn test_empty_gallery_reported_and_never_matches() {
        let engine = engine_with(&[]);
        let (tx, mut rx) = broadcast::channel(64);
        let mut detector = ScriptedDetector {
            steps: VecDeque::from(vec![Step::Frame(vec![vector(0.1)])]),
        };

        run("s4", &engine, &mut detector, settings(), &CancellationToken::new(), &tx)
            .await
            .unwrap();

        let events = drain(&mut rx);
        assert!(events.contains(&SessionEvent::NoGalleryData));
        assert!(events.contains(&SessionEvent::Diagnostic("no gallery data".into())));
        assert_eq!(confirmations(&events), 0);
    }

    #[tokio::test]
    async fn test_cancel_releases_hung_detector() {
        let engine = engine_with(&[("Ada", 0.1)]);
        let (tx, mut rx) = broadcast::channel(16);
        let cancel = CancellationToken::new();
        let mut detector = ScriptedDetector {
            steps: VecDeque::from(vec![Step::Hang, Step::Frame(vec![vector(0.1)])]),
        };
        let long = SessionSettings {
            tick_interval: Duration::from_millis(1),
            detect_timeout: Duration::from_secs(60),
        };

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                cancel.cancel();
            })
        };

        let end = run("s5", &engine, &mut detector, long, &cancel, &tx)
            .await
            .unwrap();
        canceller.await.unwrap();
        assert_eq!(end, SessionEnd::Cancelled);
        assert_eq!(confirmations(&drain(&mut rx)), 0);
    }

    #[tokio::test]
    async fn test_persistence_failure_aborts_cycle_only() {
        struct ReadOnly(SqliteStore);

        impl AttendanceStore for ReadOnly {
            fn list_identities(
                &self,
            ) -> Result<Vec<rollcall_core::EnrollmentRecord>, rollcall_core::StoreError> {
                self.0.list_identities()
            }
            fn add_attendance_event(
                &mut self,
                _event: &rollcall_core::AttendanceEvent,
            ) -> Result<rollcall_core::EventId, rollcall_core::StoreError> {
                Err(rollcall_core::StoreError::Write("read-only".into()))
            }
            fn latest_attendance_event(
                &self,
                identity: rollcall_core::IdentityId,
            ) -> Result<Option<rollcall_core::AttendanceEvent>, rollcall_core::StoreError> {
                self.0.latest_attendance_event(identity)
            }
            fn has_attendance_event_on_date(
                &self,
                identity: rollcall_core::IdentityId,
                date: chrono::NaiveDate,
            ) -> Result<bool, rollcall_core::StoreError> {
                self.0.has_attendance_event_on_date(identity, date)
            }
        }

        let mut inner = SqliteStore::open_in_memory().unwrap();
        inner.enroll("Ada", &vector(0.1)).unwrap();
        let engine = spawn_engine(
            ReadOnly(inner),
            MatchPolicy::default(),
            EligibilityPolicy::default(),
        )
        .unwrap();

        let (tx, mut rx) = broadcast::channel(64);
        let mut detector = ScriptedDetector {
            steps: VecDeque::from(vec![
                Step::Frame(vec![vector(0.1)]),
                Step::Frame(vec![vector(0.1)]),
            ]),
        };

        let end = run("s6", &engine, &mut detector, settings(), &CancellationToken::new(), &tx)
            .await
            .unwrap();
        assert_eq!(end, SessionEnd::SourceExhausted);

        let events = drain(&mut rx);
        assert_eq!(confirmations(&events), 0);
        let failures = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::Diagnostic(msg) if msg.contains("read-only")))
            .count();
        assert_eq!(failures, 2);
        assert_eq!(
            engine.status().await.unwrap().state,
            rollcall_core::ConfirmationState::Scanning
        );
    }

    #[tokio::test]
    async fn test_failed_write_leaves_other_faces_in_frame() {
        /// Fails the first write only.
        struct FailOnce {
            inner: SqliteStore,
            failed: bool,
        }

        impl AttendanceStore for FailOnce {
            fn list_identities(
                &self,
            ) -> Result<Vec<rollcall_core::EnrollmentRecord>, rollcall_core::StoreError> {
                self.inner.list_identities()
            }
            fn add_attendance_event(
                &mut self,
                event: &rollcall_core::AttendanceEvent,
            ) -> Result<rollcall_core::EventId, rollcall_core::StoreError> {
                if !self.failed {
                    self.failed = true;
                    return Err(rollcall_core::StoreError::Write("disk hiccup".into()));
                }
                self.inner.add_attendance_event(event)
            }
            fn latest_attendance_event(
                &self,
                identity: rollcall_core::IdentityId,
            ) -> Result<Option<rollcall_core::AttendanceEvent>, rollcall_core::StoreError> {
                self.inner.latest_attendance_event(identity)
            }
            fn has_attendance_event_on_date(
                &self,
                identity: rollcall_core::IdentityId,
                date: chrono::NaiveDate,
            ) -> Result<bool, rollcall_core::StoreError> {
                self.inner.has_attendance_event_on_date(identity, date)
            }
        }

        let mut inner = SqliteStore::open_in_memory().unwrap();
        inner.enroll("Ada", &vector(0.1)).unwrap();
        inner.enroll("Bob", &vector(0.9)).unwrap();
        let engine = spawn_engine(
            FailOnce {
                inner,
                failed: false,
            },
            MatchPolicy::default(),
            EligibilityPolicy::default(),
        )
        .unwrap();

        let (tx, mut rx) = broadcast::channel(64);
        let mut detector = ScriptedDetector {
            steps: VecDeque::from(vec![Step::Frame(vec![vector(0.1), vector(0.9)])]),
        };

        let end = run("s7", &engine, &mut detector, settings(), &CancellationToken::new(), &tx)
            .await
            .unwrap();
        assert_eq!(end, SessionEnd::SourceExhausted);

        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::Diagnostic(msg) if msg.contains("disk hiccup"))));
        assert_eq!(confirmations(&events), 1);
        assert!(events.contains(&SessionEvent::Confirmation {
            display_name: "Bob".into(),
            confidence: 100,
        }));
    }
}
