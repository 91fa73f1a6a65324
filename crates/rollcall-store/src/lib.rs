//! rollcall-store — SQLite persistence for enrolled identities, attendance
//! records and absentee alerts.
//!
//! Descriptors are stored as raw little-endian f32 blobs. Attendance is
//! unique per `(faculty_id, date)`; that constraint, not application
//! locking, is what keeps concurrent captures from double-marking.

mod alerts;
mod attendance;
mod identities;

pub use alerts::{Absentee, AlertRecord, NewAlert};
pub use attendance::{
    AttendanceFilter, AttendanceRecord, DailySummary, DepartmentSummary, InsertOutcome, NewAttendance, STATUS_PRESENT,
};
pub use identities::{FacultyRow, NewIdentity, ProfileUpdate};

use rusqlite::Connection;
use std::borrow::Borrow;
use std::path::Path;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Date format used for every `date` column.
pub const DATE_FORMAT: &str = "%Y-%m-%d";
/// Time-of-day format used for every `time` column.
pub const TIME_FORMAT: &str = "%H:%M:%S";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("identity not found: {0}")]
    NotFound(String),
    #[error("invalid descriptor for {identity}: {source}")]
    InvalidDescriptor {
        identity: String,
        source: rollcall_core::DescriptorError,
    },
    #[error("invalid database value: {0}")]
    InvalidDbValue(String),
}

/// Handle to the attendance database.
///
/// Either owns its connection or borrows one that lives elsewhere, such as
/// the `&mut Connection` handed to a `tokio_rusqlite::Connection::call`
/// closure (see [`Store::attach`]).
pub struct Store<C = Connection> {
    conn: C,
}

/// A store over a borrowed connection.
pub type StoreRef<'c> = Store<&'c Connection>;

impl Store {
    /// Open or create the database at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        create_parent_dir(path)?;
        let conn = Connection::open(path)?;
        initialize(&conn)?;
        tracing::debug!(path = %path.display(), "opened attendance database");
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        initialize(&conn)?;
        Ok(Self { conn })
    }
}

impl<'c> Store<&'c Connection> {
    /// Wrap a connection that has already been through [`initialize`].
    pub fn attach(conn: &'c Connection) -> Self {
        Self { conn }
    }
}

impl<C: Borrow<Connection>> Store<C> {
    fn conn(&self) -> &Connection {
        self.conn.borrow()
    }

    pub fn by_ref(&self) -> StoreRef<'_> {
        Store::attach(self.conn())
    }
}

/// Create the directories a database file at `path` will live in.
pub fn create_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Apply connection settings and the idempotent schema to `conn`.
pub fn initialize(conn: &Connection) -> Result<()> {
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    conn.pragma_update(None, "foreign_keys", 1)?;
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS faculty (
    faculty_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    department TEXT NOT NULL DEFAULT '',
    email TEXT NOT NULL DEFAULT '',
    phone TEXT NOT NULL DEFAULT '',
    descriptor BLOB,
    enrolled_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS attendance (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    faculty_id TEXT NOT NULL REFERENCES faculty(faculty_id) ON DELETE CASCADE,
    date TEXT NOT NULL,
    time TEXT NOT NULL,
    location TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL,
    recorded_on TEXT NOT NULL,
    UNIQUE(faculty_id, date)
);

CREATE INDEX IF NOT EXISTS idx_attendance_date ON attendance(date);

CREATE TABLE IF NOT EXISTS absentee_alerts (
    alert_id TEXT PRIMARY KEY,
    faculty_id TEXT NOT NULL REFERENCES faculty(faculty_id) ON DELETE CASCADE,
    date TEXT NOT NULL,
    message TEXT NOT NULL,
    status TEXT NOT NULL,
    sent_time TEXT NOT NULL
);
";
