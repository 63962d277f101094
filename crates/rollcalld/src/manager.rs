use crate::detector::DetectorSource;
use crate::engine::EngineHandle;
use crate::session::{run_session, SessionEnd, SessionError, SessionEvent, SessionSettings};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

struct RunningSession {
    id: Uuid,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Starts and stops scanning sessions; at most one runs at a time.
pub struct SessionManager<Src: DetectorSource> {
    engine: EngineHandle,
    source: Src,
    settings: SessionSettings,
    events: broadcast::Sender<SessionEvent>,
    current: Mutex<Option<RunningSession>>,
}

impl<Src: DetectorSource> SessionManager<Src> {
    pub fn new(
        engine: EngineHandle,
        source: Src,
        settings: SessionSettings,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            engine,
            source,
            settings,
            events,
            current: Mutex::new(None),
        }
    }

    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Id of the live session, if any.
    pub async fn current(&self) -> Option<Uuid> {
        let current = self.current.lock().await;
        current
            .as_ref()
            .filter(|s| !s.task.is_finished())
            .map(|s| s.id)
    }

    /// Start a session, or return the id of the one already running.
    ///
    /// Fails if the detector cannot be opened.
    pub async fn start(&self) -> Result<Uuid, SessionError> {
        let mut current = self.current.lock().await;
        if let Some(running) = current.as_ref().filter(|s| !s.task.is_finished()) {
            return Ok(running.id);
        }

        let mut detector = self
            .source
            .open()
            .await
            .map_err(|e| SessionError::Acquisition(e.to_string()))?;
        let identities = self.engine.begin_session().await?;

        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let engine = self.engine.clone();
        let events = self.events.clone();
        let settings = self.settings;
        let token = cancel.clone();
        let span = tracing::info_span!("session", id = %id);

        let task = tokio::spawn(
            async move {
                let session_id = id.to_string();
                let result = run_session(
                    &session_id,
                    identities,
                    &engine,
                    &mut detector,
                    settings,
                    &token,
                    &events,
                )
                .await;
                let reason = match result {
                    Ok(SessionEnd::Cancelled) => "stopped".to_string(),
                    Ok(SessionEnd::SourceExhausted) => "feature source exhausted".to_string(),
                    Err(err) => {
                        tracing::error!(error = %err, "scanning session failed");
                        err.to_string()
                    }
                };
                tracing::info!(%reason, "scanning session ended");
                let _ = events.send(SessionEvent::Ended { reason });
            }
            .instrument(span),
        );

        *current = Some(RunningSession { id, cancel, task });
        Ok(id)
    }

    /// Cancel the running session and wait for its loop to exit.
    /// Returns `false` if no session was running.
    pub async fn stop(&self) -> bool {
        // Held until the task is joined so a concurrent `start` cannot open
        // the engine session in between.
        let mut current = self.current.lock().await;
        let Some(running) = current.take() else {
            return false;
        };
        let was_live = !running.task.is_finished();
        // Close the session inside the engine first so a query already past
        // its token check cannot record once this returns.
        if let Err(err) = self.engine.end_session().await {
            tracing::warn!(error = %err, "engine did not acknowledge session end");
        }
        running.cancel.cancel();
        if let Err(err) = running.task.await {
            tracing::warn!(error = %err, "session task did not exit cleanly");
        }
        was_live
    }
}
