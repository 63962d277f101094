//! Eligibility gate: cooldown plus once-per-day rules.
//!
//! The in-memory cache of last-recorded times is a fast path only. Both rules
//! also consult the store so decisions survive restarts and are shared by
//! every session writing to the same store.

use crate::store::{AttendanceStore, StoreError};
use crate::types::IdentityId;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DenyReason {
    CooldownActive,
    AlreadyMarkedToday,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CooldownActive => f.write_str("cooldown active"),
            Self::AlreadyMarkedToday => f.write_str("already marked today"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Allowed,
    Denied(DenyReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EligibilityPolicy {
    /// Minimum spacing between two events of the same identity.
    pub cooldown: Duration,
    /// At most one event per identity per local calendar day.
    pub once_per_day: bool,
}

impl Default for EligibilityPolicy {
    fn default() -> Self {
        Self {
            cooldown: DEFAULT_COOLDOWN,
            once_per_day: true,
        }
    }
}

#[derive(Debug, Default)]
pub struct EligibilityGate {
    policy: EligibilityPolicy,
    last_recorded: HashMap<IdentityId, DateTime<Local>>,
}

impl EligibilityGate {
    pub fn new(policy: EligibilityPolicy) -> Self {
        Self {
            policy,
            last_recorded: HashMap::new(),
        }
    }

    pub fn policy(&self) -> &EligibilityPolicy {
        &self.policy
    }

    /// Decide whether `identity` may have a new event recorded at `now`.
    ///
    /// Cooldown is checked first, then the daily rule. Pure with respect to
    /// the gate: callers report successful persists via [`note_recorded`](Self::note_recorded).
    pub fn check<S: AttendanceStore + ?Sized>(
        &self,
        identity: IdentityId,
        now: DateTime<Local>,
        store: &S,
    ) -> Result<Eligibility, StoreError> {
        let cached = self.last_recorded.get(&identity).copied();
        if cached.is_some_and(|last| self.within_cooldown(last, now)) {
            return Ok(Eligibility::Denied(DenyReason::CooldownActive));
        }

        if let Some(event) = store.latest_attendance_event(identity)? {
            if self.within_cooldown(event.timestamp, now) {
                return Ok(Eligibility::Denied(DenyReason::CooldownActive));
            }
        }

        if self.policy.once_per_day
            && store.has_attendance_event_on_date(identity, now.date_naive())?
        {
            return Ok(Eligibility::Denied(DenyReason::AlreadyMarkedToday));
        }

        Ok(Eligibility::Allowed)
    }

    /// Record that an event for `identity` was persisted at `at`.
    pub fn note_recorded(&mut self, identity: IdentityId, at: DateTime<Local>) {
        let entry = self.last_recorded.entry(identity).or_insert(at);
        if at > *entry {
            *entry = at;
        }
    }

    pub fn last_recorded(&self, identity: IdentityId) -> Option<DateTime<Local>> {
        self.last_recorded.get(&identity).copied()
    }

    /// A `last` later than `now` counts as within the window.
    fn within_cooldown(&self, last: DateTime<Local>, now: DateTime<Local>) -> bool {
        match (now - last).to_std() {
            Ok(elapsed) => elapsed < self.policy.cooldown,
            Err(_) => true,
        }
    }
}
