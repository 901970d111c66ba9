//! The editor's write path: catalog-management fields only.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::catalog_repo::management_from_row;
use super::DatabaseError;
use crate::record::{format_timestamp, Identity, ManagementFields, MetadataStatus};

/// New management state for one record. `metadata_last_updated` is stamped
/// by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: MetadataStatus,
    pub target: Option<String>,
    pub cached: bool,
}

impl StatusUpdate {
    pub fn new(status: MetadataStatus) -> Self {
        Self {
            status,
            target: None,
            cached: false,
        }
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn cached(mut self, cached: bool) -> Self {
        self.cached = cached;
        self
    }
}

/// Writes the management fields of the active record with this identity.
/// Returns false when no active record matches.
pub fn update_status(
    conn: &Connection,
    table: &str,
    identity: &Identity,
    update: &StatusUpdate,
    now: &DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        &format!(
            "UPDATE \"{}\" SET metadata_status = ?1, metadata_last_updated = ?2,
                 metadata_target = ?3, metadata_cached = ?4
             WHERE file_path = ?5 AND layer_name = ?6 AND retired_datetime IS NULL",
            table
        ),
        params![
            update.status.as_str(),
            format_timestamp(now),
            update.target,
            update.cached,
            identity.file_path,
            identity.layer_name,
        ],
    )?;
    if changed == 0 {
        log::warn!("No active catalog record for {}", identity);
    }
    Ok(changed > 0)
}

pub fn management(
    conn: &Connection,
    table: &str,
    identity: &Identity,
) -> Result<Option<ManagementFields>, DatabaseError> {
    let fields = conn
        .query_row(
            &format!(
                "SELECT metadata_status, metadata_last_updated, metadata_target, metadata_cached
                 FROM \"{}\"
                 WHERE file_path = ?1 AND layer_name = ?2 AND retired_datetime IS NULL",
                table
            ),
            params![identity.file_path, identity.layer_name],
            management_from_row,
        )
        .optional()?;
    Ok(fields)
}

/// Management fields of every active record, keyed by identity.
pub fn active_management(
    conn: &Connection,
    table: &str,
) -> Result<HashMap<Identity, ManagementFields>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT file_path, layer_name, metadata_status, metadata_last_updated,
                metadata_target, metadata_cached
         FROM \"{}\" WHERE retired_datetime IS NULL",
        table
    ))?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                Identity::new(row.get::<_, String>("file_path")?, row.get::<_, String>("layer_name")?),
                management_from_row(row)?,
            ))
        })?
        .collect::<Result<HashMap<_, _>, _>>()?;
    Ok(rows)
}

/// Resets records marked `complete` that have no cached metadata document
/// back to `none`. Returns the number of records fixed.
pub fn fix_incorrect_status(
    conn: &Connection,
    table: &str,
    now: &DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let fixed = conn.execute(
        &format!(
            "UPDATE \"{t}\" SET metadata_status = 'none', metadata_cached = 0,
                 metadata_last_updated = ?1
             WHERE retired_datetime IS NULL
               AND metadata_status = 'complete'
               AND NOT EXISTS (
                   SELECT 1 FROM metadata_cache c
                   WHERE c.layer_path = \"{t}\".file_path AND c.layer_name = \"{t}\".layer_name
               )",
            t = table
        ),
        [format_timestamp(now)],
    )?;
    if fixed > 0 {
        log::info!("Reset {} records marked complete without cached metadata", fixed);
    }
    Ok(fixed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{cache_repo, catalog_repo, migrations};
    use crate::record::{DataType, InventoryRecord};
    use std::collections::HashSet;

    const TABLE: &str = "inventory";

    fn catalog_with(identities: &[(&str, &str)]) -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        migrations::run_all(&conn).unwrap();
        migrations::ensure_catalog_table(&conn, TABLE).unwrap();
        for (path, layer) in identities {
            let record = InventoryRecord::new(Identity::new(*path, *layer), DataType::Vector, Utc::now());
            catalog_repo::upsert(&conn, TABLE, &record).unwrap();
        }
        conn
    }

    #[test]
    fn test_update_status_touches_only_management() {
        let conn = catalog_with(&[("/d/a.shp", "a")]);
        let id = Identity::new("/d/a.shp", "a");
        let before = catalog_repo::find(&conn, TABLE, &id).unwrap().unwrap();

        let update = StatusUpdate::new(MetadataStatus::Partial)
            .target("/d/a.shp.xml")
            .cached(true);
        assert!(update_status(&conn, TABLE, &id, &update, &Utc::now()).unwrap());

        let after = catalog_repo::find(&conn, TABLE, &id).unwrap().unwrap();
        assert_eq!(after.management.status, MetadataStatus::Partial);
        assert_eq!(after.management.target.as_deref(), Some("/d/a.shp.xml"));
        assert!(after.management.cached);
        assert!(after.management.last_updated.is_some());
        assert_eq!(after.scan_timestamp, before.scan_timestamp);
        assert_eq!(after.file, before.file);
    }

    #[test]
    fn test_update_status_ignores_retired_rows() {
        let conn = catalog_with(&[("/d/a.shp", "a")]);
        let id = Identity::new("/d/a.shp", "a");
        catalog_repo::retire_missing(&conn, TABLE, &HashSet::new(), &Utc::now()).unwrap();

        let update = StatusUpdate::new(MetadataStatus::Complete);
        assert!(!update_status(&conn, TABLE, &id, &update, &Utc::now()).unwrap());
        assert!(management(&conn, TABLE, &id).unwrap().is_none());
    }

    #[test]
    fn test_active_management_map() {
        let conn = catalog_with(&[("/d/a.shp", "a"), ("/d/b.gpkg", "roads")]);
        let roads = Identity::new("/d/b.gpkg", "roads");
        update_status(&conn, TABLE, &roads, &StatusUpdate::new(MetadataStatus::Complete), &Utc::now())
            .unwrap();

        let map = active_management(&conn, TABLE).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map[&roads].status, MetadataStatus::Complete);
        assert_eq!(map[&Identity::new("/d/a.shp", "a")].status, MetadataStatus::None);
    }

    #[test]
    fn test_fix_incorrect_status() {
        let conn = catalog_with(&[("/d/a.shp", "a"), ("/d/b.shp", "b")]);
        let a = Identity::new("/d/a.shp", "a");
        let b = Identity::new("/d/b.shp", "b");
        let complete = StatusUpdate::new(MetadataStatus::Complete).cached(true);
        update_status(&conn, TABLE, &a, &complete, &Utc::now()).unwrap();
        update_status(&conn, TABLE, &b, &complete, &Utc::now()).unwrap();
        cache_repo::save_cached_metadata(&conn, &a, &serde_json::json!({"title": "A"}), &Utc::now())
            .unwrap();

        assert_eq!(fix_incorrect_status(&conn, TABLE, &Utc::now()).unwrap(), 1);
        assert_eq!(management(&conn, TABLE, &a).unwrap().unwrap().status, MetadataStatus::Complete);
        let fixed = management(&conn, TABLE, &b).unwrap().unwrap();
        assert_eq!(fixed.status, MetadataStatus::None);
        assert!(!fixed.cached);
    }
}
