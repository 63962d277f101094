//! Store collaborator seam.
//!
//! The authoritative record of enrollments and attendance events lives behind
//! this trait. `rollcall-store` provides the SQLite implementation.

use crate::types::{AttendanceEvent, EnrollmentRecord, EventId, IdentityId};
use chrono::NaiveDate;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store read failed: {0}")]
    Read(String),
    #[error("store write failed: {0}")]
    Write(String),
    #[error("corrupt store data: {0}")]
    Corrupt(String),
}

pub trait AttendanceStore {
    /// Raw enrollment rows; grouping into identities is the gallery's job.
    fn list_identities(&self) -> Result<Vec<EnrollmentRecord>, StoreError>;

    fn add_attendance_event(&mut self, event: &AttendanceEvent) -> Result<EventId, StoreError>;

    fn latest_attendance_event(
        &self,
        identity: IdentityId,
    ) -> Result<Option<AttendanceEvent>, StoreError>;

    /// Whether an event exists for `identity` on the given local calendar date.
    fn has_attendance_event_on_date(
        &self,
        identity: IdentityId,
        date: NaiveDate,
    ) -> Result<bool, StoreError>;
}

#[cfg(test)]
pub(crate) mod memory {
    use super::*;

    /// In-memory store for unit tests. `fail_writes` simulates a broken backend.
    #[derive(Default)]
    pub struct MemoryStore {
        pub enrollments: Vec<EnrollmentRecord>,
        pub events: Vec<AttendanceEvent>,
        pub fail_writes: bool,
    }

    impl AttendanceStore for MemoryStore {
        fn list_identities(&self) -> Result<Vec<EnrollmentRecord>, StoreError> {
            Ok(self.enrollments.clone())
        }

        fn add_attendance_event(&mut self, event: &AttendanceEvent) -> Result<EventId, StoreError> {
            if self.fail_writes {
                return Err(StoreError::Write("disk full".into()));
            }
            self.events.push(event.clone());
            Ok(EventId(self.events.len() as i64))
        }

        fn latest_attendance_event(
            &self,
            identity: IdentityId,
        ) -> Result<Option<AttendanceEvent>, StoreError> {
            Ok(self
                .events
                .iter()
                .filter(|e| e.identity_id == identity)
                .max_by_key(|e| e.timestamp)
                .cloned())
        }

        fn has_attendance_event_on_date(
            &self,
            identity: IdentityId,
            date: NaiveDate,
        ) -> Result<bool, StoreError> {
            Ok(self
                .events
                .iter()
                .any(|e| e.identity_id == identity && e.timestamp.date_naive() == date))
        }
    }
}
