use crate::detector::ReplaySource;
use crate::manager::SessionManager;
use crate::session::SessionEvent;
use rollcall_core::ConfirmationState;
use std::sync::Arc;
use tokio::sync::broadcast;
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "org.rollcall.Scanner1";
pub const OBJECT_PATH: &str = "/org/rollcall/Scanner1";

/// D-Bus interface for the rollcall scanning daemon.
///
/// Bus name: org.rollcall.Scanner1
/// Object path: /org/rollcall/Scanner1
pub struct ScannerService {
    sessions: Arc<SessionManager<ReplaySource>>,
}

impl ScannerService {
    pub fn new(sessions: Arc<SessionManager<ReplaySource>>) -> Self {
        Self { sessions }
    }
}

fn failed(err: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(err.to_string())
}

#[interface(name = "org.rollcall.Scanner1")]
impl ScannerService {
    /// Operator acknowledgment of the pending confirmation; resumes scanning.
    async fn acknowledge(&self) -> zbus::fdo::Result<bool> {
        let acked = self.sessions.engine().acknowledge().await.map_err(failed)?;
        tracing::info!(acked, "acknowledge requested");
        Ok(acked)
    }

    /// Start a scanning session. Returns the session id.
    async fn start_session(&self) -> zbus::fdo::Result<String> {
        let id = self.sessions.start().await.map_err(failed)?;
        Ok(id.to_string())
    }

    /// Stop the running scanning session.
    async fn stop_session(&self) -> zbus::fdo::Result<bool> {
        Ok(self.sessions.stop().await)
    }

    /// Rebuild the gallery after enrollments changed. Returns the identity count.
    async fn reload_gallery(&self) -> zbus::fdo::Result<u32> {
        let identities = self
            .sessions
            .engine()
            .reload_gallery()
            .await
            .map_err(failed)?;
        Ok(u32::try_from(identities).unwrap_or(u32::MAX))
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.sessions.engine().status().await.map_err(failed)?;
        let session = self.sessions.current().await.map(|id| id.to_string());
        let (state, awaiting) = match &status.state {
            ConfirmationState::Scanning => ("scanning", None),
            ConfirmationState::AwaitingAck { display_name, .. } => {
                ("awaiting_ack", Some(display_name.clone()))
            }
        };

        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "session": session,
            "state": state,
            "awaiting": awaiting,
            "identities": status.identities,
            "vectors": status.vectors,
        })
        .to_string())
    }

    /// Emitted when an attendance event is recorded; the UI shows a blocking prompt.
    #[zbus(signal)]
    async fn attendance_recorded(
        emitter: &SignalEmitter<'_>,
        display_name: &str,
        confidence: u8,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn diagnostic(emitter: &SignalEmitter<'_>, message: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn session_ended(emitter: &SignalEmitter<'_>, reason: &str) -> zbus::Result<()>;
}

/// Relay session events to D-Bus signals until the event channel closes.
pub async fn forward_events(
    conn: zbus::Connection,
    mut events: broadcast::Receiver<SessionEvent>,
) -> zbus::Result<()> {
    let emitter = SignalEmitter::new(&conn, OBJECT_PATH)?;

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "signal relay lagging; dropped session events");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return Ok(()),
        };

        let sent = match &event {
            SessionEvent::Confirmation {
                display_name,
                confidence,
            } => ScannerService::attendance_recorded(&emitter, display_name, *confidence).await,
            SessionEvent::Diagnostic(message) => {
                ScannerService::diagnostic(&emitter, message).await
            }
            SessionEvent::NoGalleryData => {
                ScannerService::diagnostic(&emitter, "no gallery data").await
            }
            SessionEvent::Started { session_id, identities } => {
                let message = format!("session {session_id} started ({identities} identities)");
                ScannerService::diagnostic(&emitter, &message).await
            }
            SessionEvent::Ended { reason } => ScannerService::session_ended(&emitter, reason).await,
        };

        if let Err(err) = sent {
            tracing::warn!(error = %err, ?event, "failed to emit D-Bus signal");
        }
    }
}
