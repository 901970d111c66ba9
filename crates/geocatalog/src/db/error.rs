//! Catalog storage error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from catalog storage operations.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// SQLite error from rusqlite.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error when creating directories or reading the catalog header.
    #[error("IO error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A migration failed to apply.
    #[error("Migration failed at version {version}: {reason}")]
    Migration { version: u32, reason: String },

    /// The connection lock was poisoned.
    #[error("Database lock poisoned")]
    LockPoisoned,

    /// The file exists but is not a catalog this crate can manage.
    #[error("'{path}' is not a geospatial catalog: {reason}")]
    ForeignCatalog { path: PathBuf, reason: String },

    /// The catalog table lacks identity or core columns.
    #[error("Catalog table '{table}' is missing required columns: {}", missing.join(", "))]
    IncompatibleSchema { table: String, missing: Vec<String> },

    /// The catalog was written by a newer schema.
    #[error("Catalog schema version {found} is newer than the supported version {supported}")]
    NewerSchema { found: u32, supported: u32 },

    /// A table name that is not a plain SQL identifier.
    #[error("Invalid table name '{0}'")]
    InvalidIdentifier(String),

    /// A JSON column could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
