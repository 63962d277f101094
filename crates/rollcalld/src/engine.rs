use chrono::{DateTime, Local};
use rollcall_core::{
    AttendanceStore, ConfirmationController, ConfirmationState, ControllerError,
    EligibilityPolicy, Evaluation, FeatureVector, GalleryIndex, MatchPolicy, ScanOutcome,
    StoreError,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("{0}")]
    Controller(#[from] ControllerError),
    #[error("session cancelled before the event was recorded")]
    Cancelled,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Snapshot of the engine for status reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineStatus {
    pub state: ConfirmationState,
    pub identities: usize,
    pub vectors: usize,
}

/// Messages sent from async callers to the engine thread.
enum EngineRequest {
    Query {
        vector: FeatureVector,
        observed_at: DateTime<Local>,
        cancel: CancellationToken,
        reply: oneshot::Sender<Result<ScanOutcome, EngineError>>,
    },
    Acknowledge {
        reply: oneshot::Sender<bool>,
    },
    ReloadGallery {
        reply: oneshot::Sender<Result<usize, EngineError>>,
    },
    BeginSession {
        reply: oneshot::Sender<Result<usize, EngineError>>,
    },
    EndSession {
        reply: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Run one scan cycle for a query vector observed at `observed_at`.
    ///
    /// If `cancel` fires before the event is persisted the cycle is discarded
    /// with [`EngineError::Cancelled`].
    pub async fn query(
        &self,
        vector: FeatureVector,
        observed_at: DateTime<Local>,
        cancel: CancellationToken,
    ) -> Result<ScanOutcome, EngineError> {
        self.request(|reply| EngineRequest::Query {
            vector,
            observed_at,
            cancel,
            reply,
        })
        .await?
    }

    /// Operator acknowledgment. Returns `false` if nothing was awaiting it.
    pub async fn acknowledge(&self) -> Result<bool, EngineError> {
        self.request(|reply| EngineRequest::Acknowledge { reply }).await
    }

    /// Rebuild the gallery from the store. Returns the identity count.
    pub async fn reload_gallery(&self) -> Result<usize, EngineError> {
        self.request(|reply| EngineRequest::ReloadGallery { reply })
            .await?
    }

    /// Reset to `Scanning` and rebuild the gallery for a new session.
    pub async fn begin_session(&self) -> Result<usize, EngineError> {
        self.request(|reply| EngineRequest::BeginSession { reply })
            .await?
    }

    /// Close the current session. Every query handled after this returns
    /// [`EngineError::Cancelled`] until the next [`begin_session`](Self::begin_session).
    pub async fn end_session(&self) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::EndSession { reply }).await
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.request(|reply| EngineRequest::Status { reply }).await
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns the store connection and the confirmation controller, so
/// scan cycles are strictly sequential. The gallery is built before the
/// thread starts; a store that cannot be read fails fast here.
pub fn spawn_engine<S>(
    store: S,
    match_policy: MatchPolicy,
    eligibility: EligibilityPolicy,
) -> Result<EngineHandle, EngineError>
where
    S: AttendanceStore + Send + 'static,
{
    let gallery = GalleryIndex::build(store.list_identities()?);
    tracing::info!(
        identities = gallery.len(),
        vectors = gallery.vector_count(),
        threshold = match_policy.threshold,
        accept_confidence = match_policy.accept_confidence,
        cooldown_secs = eligibility.cooldown.as_secs(),
        once_per_day = eligibility.once_per_day,
        "gallery loaded"
    );

    let mut worker = Worker {
        store,
        controller: ConfirmationController::new(gallery, match_policy, eligibility),
        session_open: true,
    };
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                worker.handle(req);
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

struct Worker<S> {
    store: S,
    controller: ConfirmationController,
    /// Cleared by `EndSession`; requests are handled in order, so no query
    /// queued behind it can record.
    session_open: bool,
}

impl<S: AttendanceStore> Worker<S> {
    fn handle(&mut self, req: EngineRequest) {
        match req {
            EngineRequest::Query {
                vector,
                observed_at,
                cancel,
                reply,
            } => {
                let result = self.run_query(&vector, observed_at, &cancel);
                let _ = reply.send(result);
            }
            EngineRequest::Acknowledge { reply } => {
                let _ = reply.send(self.controller.acknowledge());
            }
            EngineRequest::ReloadGallery { reply } => {
                let _ = reply.send(self.reload_gallery());
            }
            EngineRequest::BeginSession { reply } => {
                self.controller.reset();
                self.session_open = true;
                let _ = reply.send(self.reload_gallery());
            }
            EngineRequest::EndSession { reply } => {
                self.session_open = false;
                tracing::debug!("session closed; rejecting further queries");
                let _ = reply.send(());
            }
            EngineRequest::Status { reply } => {
                let gallery = self.controller.gallery();
                let _ = reply.send(EngineStatus {
                    state: self.controller.state().clone(),
                    identities: gallery.len(),
                    vectors: gallery.vector_count(),
                });
            }
        }
    }

    fn run_query(
        &mut self,
        vector: &FeatureVector,
        observed_at: DateTime<Local>,
        cancel: &CancellationToken,
    ) -> Result<ScanOutcome, EngineError> {
        if cancel.is_cancelled() || !self.session_open {
            return Err(EngineError::Cancelled);
        }

        match self.controller.evaluate(vector, observed_at, &self.store)? {
            Evaluation::Outcome(outcome) => Ok(outcome),
            Evaluation::Eligible(event) => {
                // A match computed before cancellation must still not be recorded.
                if cancel.is_cancelled() {
                    tracing::info!(identity = %event.identity_id, "discarding match after cancellation");
                    return Err(EngineError::Cancelled);
                }
                Ok(self.controller.record(event, &mut self.store)?)
            }
        }
    }

    fn reload_gallery(&mut self) -> Result<usize, EngineError> {
        let gallery = GalleryIndex::build(self.store.list_identities()?);
        let identities = gallery.len();
        tracing::info!(
            identities,
            vectors = gallery.vector_count(),
            "gallery rebuilt"
        );
        self.controller.replace_gallery(gallery);
        Ok(identities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::{IdentityId, FEATURE_DIM};
    use rollcall_store::SqliteStore;

    fn vector(v: f32) -> FeatureVector {
        FeatureVector::new(vec![v; FEATURE_DIM]).unwrap()
    }

    fn engine_with(names: &[(&str, f32)]) -> EngineHandle {
        let mut store = SqliteStore::open_in_memory().unwrap();
        for (name, v) in names {
            store.enroll(name, &vector(*v)).unwrap();
        }
        spawn_engine(store, MatchPolicy::default(), EligibilityPolicy::default()).unwrap()
    }

    #[tokio::test]
    async fn test_query_records_then_ignores_until_ack() {
        let engine = engine_with(&[("Ada", 0.1), ("Bob", 0.9)]);
        let cancel = CancellationToken::new();

        let outcome = engine
            .query(vector(0.1), Local::now(), cancel.clone())
            .await
            .unwrap();
        let ScanOutcome::Recorded { event, .. } = outcome else {
            panic!("expected Recorded, got {outcome:?}");
        };
        assert_eq!(event.identity_id, IdentityId(1));

        let status = engine.status().await.unwrap();
        assert!(matches!(status.state, ConfirmationState::AwaitingAck { .. }));

        let again = engine
            .query(vector(0.1), Local::now(), cancel.clone())
            .await
            .unwrap();
        assert_eq!(again, ScanOutcome::Ignored);

        assert!(engine.acknowledge().await.unwrap());
        assert!(!engine.acknowledge().await.unwrap());
        let status = engine.status().await.unwrap();
        assert_eq!(status.state, ConfirmationState::Scanning);
    }

    #[tokio::test]
    async fn test_cancelled_query_records_nothing() {
        let engine = engine_with(&[("Ada", 0.1)]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = engine.query(vector(0.1), Local::now(), cancel).await;
        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert_eq!(
            engine.status().await.unwrap().state,
            ConfirmationState::Scanning
        );
    }

    #[tokio::test]
    async fn test_begin_session_resets_and_reloads() {
        let engine = engine_with(&[("Ada", 0.1), ("ada ", 0.2), ("Bob", 0.9)]);
        let status = engine.status().await.unwrap();
        assert_eq!(status.identities, 2);
        assert_eq!(status.vectors, 3);

        engine
            .query(vector(0.9), Local::now(), CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(
            engine.status().await.unwrap().state,
            ConfirmationState::AwaitingAck { .. }
        ));

        assert_eq!(engine.begin_session().await.unwrap(), 2);
        assert_eq!(
            engine.status().await.unwrap().state,
            ConfirmationState::Scanning
        );
    }

    #[tokio::test]
    async fn test_empty_gallery_reports_zero() {
        let engine = engine_with(&[]);
        assert_eq!(engine.reload_gallery().await.unwrap(), 0);

        let outcome = engine
            .query(vector(0.5), Local::now(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.diagnostic(), "no gallery data");
    }

    #[tokio::test]
    async fn test_end_session_rejects_later_queries() {
        let engine = engine_with(&[("Ada", 0.1)]);
        engine.end_session().await.unwrap();

        let result = engine
            .query(vector(0.1), Local::now(), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert_eq!(
            engine.status().await.unwrap().state,
            ConfirmationState::Scanning
        );

        engine.begin_session().await.unwrap();
        let outcome = engine
            .query(vector(0.1), Local::now(), CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, ScanOutcome::Recorded { .. }));
    }
}
