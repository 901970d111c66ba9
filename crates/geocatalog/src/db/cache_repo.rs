//! Cached descriptive-metadata documents, one per identity.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

use super::DatabaseError;
use crate::record::{format_timestamp, parse_timestamp, Identity};

#[derive(Debug, Clone, PartialEq)]
pub struct CachedMetadata {
    pub document: Value,
    pub created: Option<DateTime<Utc>>,
    pub last_edited: Option<DateTime<Utc>>,
    pub last_written: Option<DateTime<Utc>>,
    pub target_location: Option<String>,
    /// True once the cached document has been written to its target.
    pub in_sync: bool,
}

impl CachedMetadata {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let raw: String = row.get("metadata_json")?;
        let document = serde_json::from_str(&raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?;
        let stamp = |name: &str| -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
            Ok(row
                .get::<_, Option<String>>(name)?
                .as_deref()
                .and_then(parse_timestamp))
        };
        Ok(Self {
            document,
            created: stamp("created_date")?,
            last_edited: stamp("last_edited_date")?,
            last_written: stamp("last_written_date")?,
            target_location: row.get("target_location")?,
            in_sync: row.get::<_, Option<bool>>("in_sync")?.unwrap_or(false),
        })
    }
}

/// Stores or replaces the document for an identity. An edited document is
/// out of sync until [`mark_written`] is called.
pub fn save_cached_metadata(
    conn: &Connection,
    identity: &Identity,
    document: &Value,
    now: &DateTime<Utc>,
) -> Result<(), DatabaseError> {
    let stamp = format_timestamp(now);
    conn.execute(
        "INSERT INTO metadata_cache (layer_path, layer_name, metadata_json, created_date, last_edited_date, in_sync)
         VALUES (?1, ?2, ?3, ?4, ?4, 0)
         ON CONFLICT(layer_path, layer_name) DO UPDATE SET
           metadata_json = excluded.metadata_json,
           last_edited_date = excluded.last_edited_date,
           in_sync = 0",
        params![
            identity.file_path,
            identity.layer_name,
            serde_json::to_string(document)?,
            stamp,
        ],
    )?;
    Ok(())
}

pub fn load_cached_metadata(
    conn: &Connection,
    identity: &Identity,
) -> Result<Option<CachedMetadata>, DatabaseError> {
    let entry = conn
        .query_row(
            "SELECT metadata_json, created_date, last_edited_date, last_written_date,
                    target_location, in_sync
             FROM metadata_cache WHERE layer_path = ?1 AND layer_name = ?2",
            params![identity.file_path, identity.layer_name],
            CachedMetadata::from_row,
        )
        .optional()?;
    Ok(entry)
}

/// Records that the cached document was written to `target`.
pub fn mark_written(
    conn: &Connection,
    identity: &Identity,
    target: &str,
    now: &DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE metadata_cache SET in_sync = 1, last_written_date = ?1, target_location = ?2
         WHERE layer_path = ?3 AND layer_name = ?4",
        params![format_timestamp(now), target, identity.file_path, identity.layer_name],
    )?;
    Ok(changed > 0)
}
