use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::Entry;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum DatabaseError {
    /// The database file is locked by another process or connection.
    #[error("The entry store is locked by another process; try again later")]
    InstanceLocked,

    #[error("Database migration failed: {0}")]
    Migration(String),

    /// A stored entry document could not be encoded or decoded.
    #[error("Stored document is invalid: {0}")]
    Document(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    pub(crate) fn is_lock_message(message: &str) -> bool {
        let message = message.to_lowercase();
        message.contains("database is locked")
            || message.contains("database table is locked")
            || message.contains("sqlite_busy")
            || message.contains("sqlite_locked")
    }

    /// Classifies a sqlx error, singling out SQLite lock contention
    /// (SQLITE_BUSY, SQLITE_LOCKED) and unopenable files.
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let message = err.to_string();
        if Self::is_lock_message(&message)
            || message.to_lowercase().contains("unable to open database file")
        {
            return DatabaseError::InstanceLocked;
        }
        DatabaseError::Other(err)
    }
}

// ============================================================================
// Rows
// ============================================================================

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct EntryRow {
    pub document: String,
}

impl EntryRow {
    pub(crate) fn into_entry(self) -> Result<Entry, DatabaseError> {
        Ok(serde_json::from_str(&self.document)?)
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct MediaRow {
    pub content_type: String,
    pub data: Vec<u8>,
    pub updated: i64,
}

impl MediaRow {
    pub(crate) fn into_media(self) -> StoredMedia {
        StoredMedia {
            content_type: self.content_type,
            data: self.data,
            updated: DateTime::<Utc>::from_timestamp_micros(self.updated).unwrap_or_default(),
        }
    }
}

/// A media resource body as stored alongside its media-link entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMedia {
    pub content_type: String,
    pub data: Vec<u8>,
    pub updated: DateTime<Utc>,
}
