//! rollcall-store — SQLite persistence for roster, timetable and
//! attendance.
//!
//! A synchronous `rusqlite` layer, owned by whichever thread opened
//! it. Rows only cross the API boundary as typed records.

mod attendance;
mod roster;
mod schedule;
mod schema;

pub use attendance::{AttendanceStatus, MarkOutcome, ReportRow};
pub use roster::{CourseRecord, GroupRecord, StudentRecord, TeacherRecord};
pub use schedule::{ActiveSession, SessionKey, TimetableSlot};

use rusqlite::Connection;
use std::path::Path;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("roll number already registered: {0}")]
    DuplicateRoll(String),

    #[error("timetable slot start {start} is not before end {end}")]
    InvalidSlot { start: String, end: String },

    #[error("invalid {column} value: {value}")]
    Malformed {
        column: &'static str,
        value: String,
    },

    #[error("database schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: i32, supported: i32 },

    #[error("unknown migration target version: {0}")]
    UnknownMigration(i32),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Handle to the rollcall database.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Opens the database at `path`, creating it and any parent
    /// directories, and brings the schema up to date.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self::init(Connection::open(path)?)?;
        tracing::info!(path = %path.display(), "database ready");
        Ok(store)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(mut conn: Connection) -> Result<Self, StoreError> {
        if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
            warn!(error = %err, "failed to enable WAL mode");
        }
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::run_migrations(&mut conn)?;
        Ok(Store { conn })
    }
}
