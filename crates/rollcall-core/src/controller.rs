//! Scan → match → record → pause-for-ack → resume state machine.
//!
//! While a recorded event awaits operator acknowledgment every incoming query
//! is ignored without matching, so each acknowledged interaction produces
//! exactly one attendance event even if the same face stays in frame.

use crate::eligibility::{DenyReason, Eligibility, EligibilityGate, EligibilityPolicy};
use crate::gallery::GalleryIndex;
use crate::matcher::{EuclideanMatcher, MatchPolicy, Matcher};
use crate::store::{AttendanceStore, StoreError};
use crate::types::{AttendanceEvent, EventId, FeatureVector, IdentityId, MatchResult};
use chrono::{DateTime, Local};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("eligibility lookup failed: {0}")]
    Lookup(#[source] StoreError),
    #[error("failed to persist attendance event: {0}")]
    Persistence(#[source] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfirmationState {
    #[default]
    Scanning,
    /// An event was recorded for this identity and the operator has not yet acknowledged it.
    AwaitingAck {
        identity_id: IdentityId,
        display_name: String,
    },
}

/// What happened to one query vector.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    /// Controller was awaiting acknowledgment; no matching performed.
    Ignored,
    /// Unknown, or a candidate below the accept-confidence cutoff.
    NoMatch(MatchResult),
    Denied {
        result: MatchResult,
        reason: DenyReason,
    },
    Recorded {
        event_id: EventId,
        event: AttendanceEvent,
    },
}

impl ScanOutcome {
    /// One-line status for display. Has no effect on the state machine.
    pub fn diagnostic(&self) -> String {
        match self {
            Self::Ignored => "awaiting acknowledgment".to_string(),
            Self::NoMatch(result) if result.distance.is_infinite() => {
                "no gallery data".to_string()
            }
            Self::NoMatch(result) if result.is_match() => format!(
                "{} (confidence {}) below cutoff",
                result.display_name, result.confidence
            ),
            Self::NoMatch(result) => format!("unknown (confidence {})", result.confidence),
            Self::Denied { result, reason } => format!("{}: {reason}", result.display_name),
            Self::Recorded { event, .. } => format!(
                "recorded {} (confidence {})",
                event.display_name, event.confidence
            ),
        }
    }
}

/// Read-only half of a cycle: either a final outcome, or an event ready to persist.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Outcome(ScanOutcome),
    Eligible(AttendanceEvent),
}

pub struct ConfirmationController<M: Matcher = EuclideanMatcher> {
    gallery: GalleryIndex,
    matcher: M,
    match_policy: MatchPolicy,
    gate: EligibilityGate,
    state: ConfirmationState,
}

impl ConfirmationController<EuclideanMatcher> {
    pub fn new(
        gallery: GalleryIndex,
        match_policy: MatchPolicy,
        eligibility: EligibilityPolicy,
    ) -> Self {
        Self::with_matcher(gallery, EuclideanMatcher, match_policy, eligibility)
    }
}

impl<M: Matcher> ConfirmationController<M> {
    pub fn with_matcher(
        gallery: GalleryIndex,
        matcher: M,
        match_policy: MatchPolicy,
        eligibility: EligibilityPolicy,
    ) -> Self {
        Self {
            gallery,
            matcher,
            match_policy,
            gate: EligibilityGate::new(eligibility),
            state: ConfirmationState::Scanning,
        }
    }

    pub fn state(&self) -> &ConfirmationState {
        &self.state
    }

    pub fn is_awaiting_ack(&self) -> bool {
        matches!(self.state, ConfirmationState::AwaitingAck { .. })
    }

    pub fn gallery(&self) -> &GalleryIndex {
        &self.gallery
    }

    pub fn match_policy(&self) -> &MatchPolicy {
        &self.match_policy
    }

    /// Swap in a freshly built gallery snapshot.
    pub fn replace_gallery(&mut self, gallery: GalleryIndex) {
        self.gallery = gallery;
    }

    /// Return to `Scanning` for a new session. The cooldown cache is kept.
    pub fn reset(&mut self) {
        self.state = ConfirmationState::Scanning;
    }

    /// Match and gate one query without side effects.
    pub fn evaluate<S: AttendanceStore + ?Sized>(
        &self,
        query: &FeatureVector,
        now: DateTime<Local>,
        store: &S,
    ) -> Result<Evaluation, ControllerError> {
        if self.is_awaiting_ack() {
            return Ok(Evaluation::Outcome(ScanOutcome::Ignored));
        }

        let result = self
            .matcher
            .best_match(&self.gallery, query, self.match_policy.threshold);
        let actionable = self.match_policy.is_actionable(&result);
        let Some(identity_id) = result.identity_id.filter(|_| actionable) else {
            return Ok(Evaluation::Outcome(ScanOutcome::NoMatch(result)));
        };

        match self
            .gate
            .check(identity_id, now, store)
            .map_err(ControllerError::Lookup)?
        {
            Eligibility::Denied(reason) => {
                tracing::debug!(identity = %identity_id, %reason, "match not eligible");
                Ok(Evaluation::Outcome(ScanOutcome::Denied { result, reason }))
            }
            Eligibility::Allowed => Ok(Evaluation::Eligible(AttendanceEvent {
                identity_id,
                display_name: result.display_name,
                timestamp: now,
                confidence: result.confidence,
                snapshot_ref: None,
            })),
        }
    }

    /// Persist an eligible event and pause for acknowledgment.
    ///
    /// On a store failure nothing changes: the controller stays in `Scanning`
    /// and the cooldown cache is untouched.
    pub fn record<S: AttendanceStore + ?Sized>(
        &mut self,
        event: AttendanceEvent,
        store: &mut S,
    ) -> Result<ScanOutcome, ControllerError> {
        if self.is_awaiting_ack() {
            return Ok(ScanOutcome::Ignored);
        }

        let event_id = store
            .add_attendance_event(&event)
            .map_err(ControllerError::Persistence)?;

        self.gate.note_recorded(event.identity_id, event.timestamp);
        self.state = ConfirmationState::AwaitingAck {
            identity_id: event.identity_id,
            display_name: event.display_name.clone(),
        };

        tracing::info!(
            event = %event_id,
            identity = %event.identity_id,
            name = %event.display_name,
            confidence = event.confidence,
            "attendance recorded; awaiting acknowledgment"
        );

        Ok(ScanOutcome::Recorded { event_id, event })
    }

    /// Full cycle for one query vector: evaluate, then record if eligible.
    pub fn handle_query<S: AttendanceStore + ?Sized>(
        &mut self,
        query: &FeatureVector,
        now: DateTime<Local>,
        store: &mut S,
    ) -> Result<ScanOutcome, ControllerError> {
        match self.evaluate(query, now, &*store)? {
            Evaluation::Outcome(outcome) => Ok(outcome),
            Evaluation::Eligible(event) => self.record(event, store),
        }
    }

    /// Operator acknowledgment. Returns `false` if nothing was pending.
    pub fn acknowledge(&mut self) -> bool {
        match std::mem::take(&mut self.state) {
            ConfirmationState::AwaitingAck { identity_id, .. } => {
                tracing::info!(identity = %identity_id, "acknowledged; resuming scan");
                true
            }
            ConfirmationState::Scanning => false,
        }
    }
}
