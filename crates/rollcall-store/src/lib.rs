//! rollcall-store — SQLite implementation of the attendance store.
//!
//! Identities are keyed by their normalized display name; every enrollment
//! adds a descriptor row. Attendance events carry their local calendar date
//! so the once-per-day rule is a single indexed lookup.

use chrono::{DateTime, Local, NaiveDate};
use rollcall_core::{
    normalize_name, AttendanceEvent, AttendanceStore, EnrollmentRecord, EventId, FeatureVector,
    IdentityId, StoreError, VectorError, FEATURE_DIM,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use thiserror::Error;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS identities (
  identity_id INTEGER PRIMARY KEY AUTOINCREMENT,
  display_name TEXT NOT NULL,
  name_key TEXT NOT NULL UNIQUE CHECK (length(name_key) > 0),
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS descriptors (
  descriptor_id INTEGER PRIMARY KEY AUTOINCREMENT,
  identity_id INTEGER NOT NULL,
  vector BLOB NOT NULL CHECK (length(vector) = 512),
  enrolled_at TEXT NOT NULL,
  FOREIGN KEY (identity_id) REFERENCES identities(identity_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS attendance_events (
  event_id INTEGER PRIMARY KEY AUTOINCREMENT,
  identity_id INTEGER NOT NULL,
  display_name TEXT NOT NULL,
  recorded_at TEXT NOT NULL,
  recorded_at_ms INTEGER NOT NULL,
  local_date TEXT NOT NULL,
  confidence INTEGER NOT NULL CHECK (confidence BETWEEN 0 AND 100),
  snapshot_ref TEXT
);

CREATE INDEX IF NOT EXISTS idx_descriptors_identity ON descriptors(identity_id);
CREATE INDEX IF NOT EXISTS idx_events_identity_time ON attendance_events(identity_id, recorded_at_ms);
CREATE INDEX IF NOT EXISTS idx_events_identity_date ON attendance_events(identity_id, local_date);
CREATE INDEX IF NOT EXISTS idx_events_date ON attendance_events(local_date);
";

const LOCAL_DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Error, Debug)]
pub enum SqliteStoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid stored vector: {0}")]
    Vector(#[from] VectorError),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("display name must not be blank")]
    BlankName,
    #[error("no feature vectors to enroll")]
    NoVectors,
    #[error("unsupported schema version {found}; expected at most {LATEST_SCHEMA_VERSION}")]
    UnsupportedSchema { found: i64 },
}

impl SqliteStoreError {
    fn into_read(self) -> StoreError {
        match self {
            Self::Sqlite(e) => StoreError::Read(e.to_string()),
            other => StoreError::Corrupt(other.to_string()),
        }
    }

    fn into_write(self) -> StoreError {
        StoreError::Write(self.to_string())
    }
}

/// A persisted event together with its store id.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    pub event_id: EventId,
    pub event: AttendanceEvent,
}

/// One enrolled identity with its descriptor count, for listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentitySummary {
    pub identity_id: IdentityId,
    pub display_name: String,
    pub descriptors: usize,
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and bring its schema up to date.
    pub fn open(path: &Path) -> Result<Self, SqliteStoreError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, SqliteStoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, SqliteStoreError> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        let mut store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    /// Apply forward migrations up to the latest schema version.
    pub fn migrate(&mut self) -> Result<(), SqliteStoreError> {
        self.conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)?;
        let version = self.schema_version()?;

        if version > LATEST_SCHEMA_VERSION {
            return Err(SqliteStoreError::UnsupportedSchema { found: version });
        }

        if version < 1 {
            let tx = self.conn.transaction()?;
            tx.execute_batch(MIGRATION_001_SQL)?;
            tx.execute(
                "INSERT INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![1_i64, Local::now().to_rfc3339()],
            )?;
            tx.commit()?;
            tracing::info!(version = 1, "applied schema migration");
        }

        Ok(())
    }

    pub fn schema_version(&self) -> Result<i64, SqliteStoreError> {
        let version: Option<i64> = self
            .conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| row.get(0))?;
        Ok(version.unwrap_or(0))
    }

    /// Add one descriptor for `display_name`, creating the identity if its
    /// normalized name is new. Returns the identity the descriptor joined.
    pub fn enroll(
        &mut self,
        display_name: &str,
        vector: &FeatureVector,
    ) -> Result<IdentityId, SqliteStoreError> {
        self.enroll_many(display_name, std::slice::from_ref(vector))
    }

    /// Add several descriptors for `display_name` in one transaction.
    /// Either every vector is stored or none is.
    pub fn enroll_many(
        &mut self,
        display_name: &str,
        vectors: &[FeatureVector],
    ) -> Result<IdentityId, SqliteStoreError> {
        let name_key = normalize_name(display_name);
        if name_key.is_empty() {
            return Err(SqliteStoreError::BlankName);
        }
        if vectors.is_empty() {
            return Err(SqliteStoreError::NoVectors);
        }
        let now = Local::now().to_rfc3339();

        let tx = self.conn.transaction()?;
        let existing: Option<i64> = tx
            .query_row(
                "SELECT identity_id FROM identities WHERE name_key = ?1",
                params![name_key],
                |row| row.get(0),
            )
            .optional()?;

        let identity_id = match existing {
            Some(id) => id,
            None => {
                tx.execute(
                    "INSERT INTO identities(display_name, name_key, created_at) VALUES (?1, ?2, ?3)",
                    params![display_name.trim(), name_key, now],
                )?;
                tx.last_insert_rowid()
            }
        };

        {
            let mut insert = tx.prepare(
                "INSERT INTO descriptors(identity_id, vector, enrolled_at) VALUES (?1, ?2, ?3)",
            )?;
            for vector in vectors {
                insert.execute(params![identity_id, encode_vector(vector), now])?;
            }
        }
        tx.commit()?;

        tracing::info!(
            identity = identity_id,
            name = display_name.trim(),
            descriptors = vectors.len(),
            "descriptors enrolled"
        );
        Ok(IdentityId(identity_id))
    }

    /// Remove an identity and all of its descriptors. Attendance history is kept.
    pub fn remove_identity(&mut self, identity: IdentityId) -> Result<bool, SqliteStoreError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM descriptors WHERE identity_id = ?1",
            params![identity.0],
        )?;
        let removed = tx.execute(
            "DELETE FROM identities WHERE identity_id = ?1",
            params![identity.0],
        )?;
        tx.commit()?;
        Ok(removed > 0)
    }

    pub fn list_identity_summaries(&self) -> Result<Vec<IdentitySummary>, SqliteStoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT i.identity_id, i.display_name, COUNT(d.descriptor_id)
             FROM identities i
             LEFT JOIN descriptors d ON d.identity_id = i.identity_id
             GROUP BY i.identity_id
             ORDER BY i.identity_id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(IdentitySummary {
                identity_id: IdentityId(row.get(0)?),
                display_name: row.get(1)?,
                descriptors: row.get::<_, i64>(2)? as usize,
            });
        }
        Ok(out)
    }

    /// Events recorded on a local calendar date, oldest first.
    pub fn list_events_on(&self, date: NaiveDate) -> Result<Vec<StoredEvent>, SqliteStoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT event_id, identity_id, display_name, recorded_at, confidence, snapshot_ref
             FROM attendance_events
             WHERE local_date = ?1
             ORDER BY recorded_at_ms ASC, event_id ASC",
        )?;
        let mut rows = stmt.query(params![date.format(LOCAL_DATE_FORMAT).to_string()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(stored_event_from_row(row)?);
        }
        Ok(out)
    }

    fn read_enrollments(&self) -> Result<Vec<EnrollmentRecord>, SqliteStoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT i.identity_id, i.display_name, d.vector
             FROM descriptors d
             JOIN identities i ON i.identity_id = d.identity_id
             ORDER BY i.identity_id ASC, d.descriptor_id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let blob: Vec<u8> = row.get(2)?;
            records.push(EnrollmentRecord {
                identity_id: IdentityId(row.get(0)?),
                display_name: row.get(1)?,
                vector: decode_vector(&blob)?,
            });
        }
        Ok(records)
    }

    fn insert_event(&mut self, event: &AttendanceEvent) -> Result<EventId, SqliteStoreError> {
        self.conn.execute(
            "INSERT INTO attendance_events(
                identity_id, display_name, recorded_at, recorded_at_ms, local_date,
                confidence, snapshot_ref
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.identity_id.0,
                event.display_name,
                event.timestamp.to_rfc3339(),
                event.timestamp.timestamp_millis(),
                event.timestamp.date_naive().format(LOCAL_DATE_FORMAT).to_string(),
                i64::from(event.confidence),
                event.snapshot_ref,
            ],
        )?;
        Ok(EventId(self.conn.last_insert_rowid()))
    }

    fn read_latest_event(
        &self,
        identity: IdentityId,
    ) -> Result<Option<AttendanceEvent>, SqliteStoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT event_id, identity_id, display_name, recorded_at, confidence, snapshot_ref
             FROM attendance_events
             WHERE identity_id = ?1
             ORDER BY recorded_at_ms DESC, event_id DESC
             LIMIT 1",
        )?;
        let mut rows = stmt.query(params![identity.0])?;
        match rows.next()? {
            Some(row) => Ok(Some(stored_event_from_row(row)?.event)),
            None => Ok(None),
        }
    }

    fn read_has_event_on(
        &self,
        identity: IdentityId,
        date: NaiveDate,
    ) -> Result<bool, SqliteStoreError> {
        let exists = self.conn.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM attendance_events WHERE identity_id = ?1 AND local_date = ?2
             )",
            params![identity.0, date.format(LOCAL_DATE_FORMAT).to_string()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }
}

impl AttendanceStore for SqliteStore {
    fn list_identities(&self) -> Result<Vec<EnrollmentRecord>, StoreError> {
        self.read_enrollments().map_err(SqliteStoreError::into_read)
    }

    fn add_attendance_event(&mut self, event: &AttendanceEvent) -> Result<EventId, StoreError> {
        self.insert_event(event).map_err(SqliteStoreError::into_write)
    }

    fn latest_attendance_event(
        &self,
        identity: IdentityId,
    ) -> Result<Option<AttendanceEvent>, StoreError> {
        self.read_latest_event(identity)
            .map_err(SqliteStoreError::into_read)
    }

    fn has_attendance_event_on_date(
        &self,
        identity: IdentityId,
        date: NaiveDate,
    ) -> Result<bool, StoreError> {
        self.read_has_event_on(identity, date)
            .map_err(SqliteStoreError::into_read)
    }
}

fn stored_event_from_row(row: &rusqlite::Row<'_>) -> Result<StoredEvent, SqliteStoreError> {
    let recorded_at: String = row.get(3)?;
    let timestamp = DateTime::parse_from_rfc3339(&recorded_at)
        .map_err(|e| SqliteStoreError::Corrupt(format!("recorded_at {recorded_at:?}: {e}")))?
        .with_timezone(&Local);

    Ok(StoredEvent {
        event_id: EventId(row.get(0)?),
        event: AttendanceEvent {
            identity_id: IdentityId(row.get(1)?),
            display_name: row.get(2)?,
            timestamp,
            confidence: row.get(4)?,
            snapshot_ref: row.get(5)?,
        },
    })
}

/// Little-endian f32 packing, 4 bytes per component.
fn encode_vector(vector: &FeatureVector) -> Vec<u8> {
    vector
        .values()
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect()
}

fn decode_vector(blob: &[u8]) -> Result<FeatureVector, SqliteStoreError> {
    if blob.len() != FEATURE_DIM * 4 {
        return Err(SqliteStoreError::Corrupt(format!(
            "descriptor blob is {} bytes, expected {}",
            blob.len(),
            FEATURE_DIM * 4
        )));
    }
    let values = blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Ok(FeatureVector::new(values)?)
}
