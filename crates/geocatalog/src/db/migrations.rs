//! Catalog schema management.
//!
//! Fixed tables (GeoPackage core, bookkeeping, metadata cache) are versioned
//! migrations tracked in `_migrations`. The catalog table itself has a
//! caller-chosen name, so it is created from [`CATALOG_COLUMNS`] and
//! retrofitted column by column when an older catalog is opened.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use super::error::DatabaseError;

/// Schema version written to `catalog_info`. Equal to the last migration.
pub const SCHEMA_VERSION: u32 = 4;

/// Recorded in `upgrade_history.tool`.
pub const TOOL_NAME: &str = concat!("geocatalog ", env!("CARGO_PKG_VERSION"));

/// A single migration definition.
struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
    kind: MigrationKind,
}

enum MigrationKind {
    /// Execute the SQL directly.
    Standard,
    /// ALTER TABLE ADD COLUMN, skipped if the column already exists.
    AddColumn {
        table: &'static str,
        column: &'static str,
    },
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create_gpkg_core_tables",
        sql: include_str!("sql/001_gpkg_core.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 2,
        description: "create_catalog_info_tables",
        sql: include_str!("sql/002_catalog_info.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 3,
        description: "create_metadata_cache_table",
        sql: include_str!("sql/003_metadata_cache.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 4,
        description: "add_sync_state_to_metadata_cache",
        sql: include_str!("sql/004_cache_sync_state.sql"),
        kind: MigrationKind::AddColumn {
            table: "metadata_cache",
            column: "in_sync",
        },
    },
];

/// Runs all pending migrations on the given connection.
pub fn run_all(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    let current_version: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |r| r.get(0),
    )?;

    for migration in MIGRATIONS {
        if migration.version <= current_version {
            continue;
        }

        log::info!(
            "Running migration v{}: {}",
            migration.version,
            migration.description
        );

        let should_run = match &migration.kind {
            MigrationKind::Standard => true,
            MigrationKind::AddColumn { table, column } => !column_exists(conn, table, column)?,
        };

        if should_run {
            conn.execute_batch(migration.sql)
                .map_err(|e| DatabaseError::Migration {
                    version: migration.version,
                    reason: e.to_string(),
                })?;
        } else {
            log::info!(
                "Skipping migration v{} (condition not met)",
                migration.version
            );
        }

        conn.execute(
            "INSERT INTO _migrations (version, description) VALUES (?1, ?2)",
            params![migration.version, migration.description],
        )?;
    }

    Ok(())
}

/// True for names made of ASCII letters, digits and underscores that do not
/// start with a digit or collide with SQLite's and GeoPackage's own tables.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let starts_ok = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    let lower = name.to_ascii_lowercase();
    starts_ok
        && name.len() <= 64
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !lower.starts_with("sqlite_")
        && !lower.starts_with("gpkg_")
        && !lower.starts_with("rtree_")
        && !matches!(
            lower.as_str(),
            "_migrations" | "catalog_info" | "upgrade_history" | "metadata_cache"
        )
}

/// Checks whether a column exists on a table using `PRAGMA table_info`.
pub(crate) fn column_exists(
    conn: &Connection,
    table: &str,
    column: &str,
) -> Result<bool, DatabaseError> {
    Ok(table_columns(conn, table)?.iter().any(|c| c == column))
}

pub(crate) fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>, DatabaseError> {
    if !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(DatabaseError::InvalidIdentifier(table.to_string()));
    }
    let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{}\")", table))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

pub(crate) fn table_exists(conn: &Connection, table: &str) -> Result<bool, DatabaseError> {
    let found: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |r| r.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// How a catalog column is written and whether an old catalog may lack it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ColumnRole {
    /// Row key, never written by the crate.
    Key,
    /// `(file_path, layer_name)`.
    Identity,
    /// Required for the catalog to be usable at all.
    Core,
    /// Refreshed from extraction on every scan.
    Extracted,
    /// Written once when the row is inserted.
    Created,
    /// Owned by the status-update path and the retire step.
    Management,
}

impl ColumnRole {
    /// Missing columns with this role can be added to an existing table.
    fn retrofittable(self) -> bool {
        matches!(
            self,
            ColumnRole::Extracted | ColumnRole::Created | ColumnRole::Management
        )
    }
}

pub(crate) struct ColumnDef {
    pub name: &'static str,
    pub decl: &'static str,
    pub role: ColumnRole,
}

const fn col(name: &'static str, decl: &'static str, role: ColumnRole) -> ColumnDef {
    ColumnDef { name, decl, role }
}

use ColumnRole::{Core, Created, Extracted, Identity, Key, Management};

/// Column layout of the catalog table, in creation order.
pub(crate) const CATALOG_COLUMNS: &[ColumnDef] = &[
    col("fid", "INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL", Key),
    col("geom", "POLYGON", Extracted),
    col("file_path", "TEXT NOT NULL", Identity),
    col("layer_name", "TEXT NOT NULL", Identity),
    col("data_type", "TEXT", Core),
    col("format", "TEXT", Core),
    col("driver_name", "TEXT", Extracted),
    // File
    col("relative_path", "TEXT", Extracted),
    col("file_name", "TEXT", Extracted),
    col("parent_directory", "TEXT", Extracted),
    col("directory_depth", "INTEGER", Extracted),
    col("file_size_bytes", "INTEGER", Extracted),
    col("file_size_mb", "DOUBLE", Extracted),
    col("file_created", "DATETIME", Extracted),
    col("file_modified", "DATETIME", Extracted),
    // Provenance
    col("scanned_by_user", "TEXT", Extracted),
    col("scanned_by_machine", "TEXT", Extracted),
    col("scanned_from_os", "TEXT", Extracted),
    col("scanned_from_os_version", "TEXT", Extracted),
    col("storage_location", "TEXT", Extracted),
    col("network_server", "TEXT", Extracted),
    col("drive_or_mount", "TEXT", Extracted),
    // Spatial
    col("crs_authid", "TEXT", Extracted),
    col("crs_wkt", "TEXT", Extracted),
    col("native_extent", "TEXT", Extracted),
    col("wgs84_extent", "TEXT", Extracted),
    col("has_crs", "BOOLEAN NOT NULL DEFAULT 0", Extracted),
    col("has_extent", "BOOLEAN NOT NULL DEFAULT 0", Extracted),
    col("extent_reprojected", "BOOLEAN NOT NULL DEFAULT 0", Extracted),
    // Vector
    col("geometry_type", "TEXT", Extracted),
    col("feature_count", "INTEGER", Extracted),
    col("field_count", "INTEGER", Extracted),
    col("field_names", "TEXT", Extracted),
    col("field_types", "TEXT", Extracted),
    col("has_z", "BOOLEAN NOT NULL DEFAULT 0", Extracted),
    col("has_m", "BOOLEAN NOT NULL DEFAULT 0", Extracted),
    // Raster
    col("raster_width", "INTEGER", Extracted),
    col("raster_height", "INTEGER", Extracted),
    col("band_count", "INTEGER", Extracted),
    col("pixel_width", "DOUBLE", Extracted),
    col("pixel_height", "DOUBLE", Extracted),
    col("band_types", "TEXT", Extracted),
    col("nodata_values", "TEXT", Extracted),
    col("compression", "TEXT", Extracted),
    col("georeference_method", "TEXT", Extracted),
    // Descriptive
    col("metadata_standard", "TEXT", Extracted),
    col("metadata_file_path", "TEXT", Extracted),
    col("layer_title", "TEXT", Extracted),
    col("layer_abstract", "TEXT", Extracted),
    col("keywords", "TEXT", Extracted),
    col("lineage", "TEXT", Extracted),
    col("constraints", "TEXT", Extracted),
    col("contact_info", "TEXT", Extracted),
    col("links", "TEXT", Extracted),
    col("topic_categories", "TEXT", Extracted),
    // Sidecars
    col("has_prj_file", "BOOLEAN NOT NULL DEFAULT 0", Extracted),
    col("has_world_file", "BOOLEAN NOT NULL DEFAULT 0", Extracted),
    col("has_aux_xml", "BOOLEAN NOT NULL DEFAULT 0", Extracted),
    col("has_metadata_xml", "BOOLEAN NOT NULL DEFAULT 0", Extracted),
    // Quality
    col("quality_score", "DOUBLE", Extracted),
    col("issues", "TEXT", Extracted),
    col("is_valid", "BOOLEAN NOT NULL DEFAULT 1", Extracted),
    // Management
    col("metadata_status", "TEXT DEFAULT 'none'", Management),
    col("metadata_last_updated", "DATETIME", Management),
    col("metadata_target", "TEXT", Management),
    col("metadata_cached", "BOOLEAN NOT NULL DEFAULT 0", Management),
    col("retired_datetime", "DATETIME", Management),
    // Timestamps
    col("record_created", "DATETIME", Created),
    col("scan_timestamp", "DATETIME", Core),
];

fn create_table_sql(table: &str) -> String {
    let columns = CATALOG_COLUMNS
        .iter()
        .map(|c| format!("    {} {}", c.name, c.decl))
        .collect::<Vec<_>>()
        .join(",\n");
    format!("CREATE TABLE \"{}\" (\n{}\n)", table, columns)
}

/// Creates the catalog table, or adds the columns an older catalog lacks.
///
/// Returns the names of retrofitted columns. Fails with
/// [`DatabaseError::IncompatibleSchema`] when identity or core columns are
/// missing, since those cannot be recovered.
pub(crate) fn ensure_catalog_table(
    conn: &Connection,
    table: &str,
) -> Result<Vec<&'static str>, DatabaseError> {
    if !is_valid_identifier(table) {
        return Err(DatabaseError::InvalidIdentifier(table.to_string()));
    }

    let added = if table_exists(conn, table)? {
        let existing = table_columns(conn, table)?;
        let missing: Vec<&ColumnDef> = CATALOG_COLUMNS
            .iter()
            .filter(|c| !existing.iter().any(|e| e == c.name))
            .collect();

        let fatal: Vec<String> = missing
            .iter()
            .filter(|c| !c.role.retrofittable())
            .map(|c| c.name.to_string())
            .collect();
        if !fatal.is_empty() {
            return Err(DatabaseError::IncompatibleSchema {
                table: table.to_string(),
                missing: fatal,
            });
        }

        for column in &missing {
            log::info!("Retrofitting column {}.{}", table, column.name);
            conn.execute_batch(&format!(
                "ALTER TABLE \"{}\" ADD COLUMN {} {}",
                table, column.name, column.decl
            ))?;
        }
        missing.iter().map(|c| c.name).collect()
    } else {
        log::info!("Creating catalog table {}", table);
        conn.execute_batch(&create_table_sql(table))?;
        Vec::new()
    };

    conn.execute_batch(&format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS \"idx_{t}_active_identity\"
             ON \"{t}\" (file_path, layer_name) WHERE retired_datetime IS NULL;
         CREATE INDEX IF NOT EXISTS \"idx_{t}_identity\" ON \"{t}\" (file_path, layer_name);",
        t = table
    ))?;

    register_contents(conn, table)?;
    Ok(added)
}

/// Registers the catalog table as a GeoPackage feature table. Writes only
/// when an entry is missing, so reopening an up-to-date catalog is read-only.
fn register_contents(conn: &Connection, table: &str) -> Result<(), DatabaseError> {
    let registered: Option<String> = conn
        .query_row(
            "SELECT table_name FROM gpkg_contents WHERE table_name = ?1",
            [table],
            |r| r.get(0),
        )
        .optional()?;
    if registered.is_none() {
        conn.execute(
            "INSERT INTO gpkg_contents (table_name, data_type, identifier, description, srs_id)
             VALUES (?1, 'features', ?1, 'Geospatial inventory', 4326)",
            [table],
        )?;
    }

    let geometry: Option<String> = conn
        .query_row(
            "SELECT column_name FROM gpkg_geometry_columns WHERE table_name = ?1",
            [table],
            |r| r.get(0),
        )
        .optional()?;
    if geometry.is_none() {
        conn.execute(
            "INSERT INTO gpkg_geometry_columns (table_name, column_name, geometry_type_name, srs_id, z, m)
             VALUES (?1, 'geom', 'POLYGON', 4326, 0, 0)",
            [table],
        )?;
    }
    Ok(())
}

/// Reads `inventory_schema_version` from `catalog_info`, if the table exists.
pub(crate) fn recorded_version(conn: &Connection) -> Result<Option<String>, DatabaseError> {
    if !table_exists(conn, "catalog_info")? {
        return Ok(None);
    }
    let value: Option<Option<String>> = conn
        .query_row(
            "SELECT value FROM catalog_info WHERE key = 'inventory_schema_version'",
            [],
            |r| r.get(0),
        )
        .optional()?;
    Ok(value.flatten())
}

fn set_info(conn: &Connection, key: &str, value: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO catalog_info (key, value, updated) VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated = excluded.updated",
        params![key, value],
    )?;
    Ok(())
}

/// Appends one row to `upgrade_history`.
pub(crate) fn log_upgrade(
    conn: &Connection,
    from_version: Option<&str>,
    to_version: &str,
    notes: &str,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO upgrade_history (from_version, to_version, tool, success, notes)
         VALUES (?1, ?2, ?3, 1, ?4)",
        params![from_version, to_version, TOOL_NAME, notes],
    )?;
    Ok(())
}

/// Brings `catalog_info` up to date and records the upgrade, if any.
pub(crate) fn record_version(
    conn: &Connection,
    previous: Option<&str>,
    retrofitted: &[&str],
) -> Result<(), DatabaseError> {
    let current = SCHEMA_VERSION.to_string();
    let now = Utc::now().to_rfc3339();

    match previous {
        None => {
            set_info(conn, "inventory_schema_version", &current)?;
            set_info(conn, "catalog_created", &now)?;
            log_upgrade(conn, None, &current, "Catalog created")?;
        }
        Some(found) if found != current => {
            set_info(conn, "inventory_schema_version", &current)?;
            set_info(conn, "last_upgraded", &now)?;
            log_upgrade(conn, Some(found), &current, "Schema upgraded")?;
        }
        Some(_) => {}
    }

    if !retrofitted.is_empty() {
        set_info(conn, "last_upgraded", &now)?;
        log_upgrade(
            conn,
            previous,
            &current,
            &format!("Added columns: {}", retrofitted.join(", ")),
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn migrated() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_all(&conn).unwrap();
        conn
    }

    #[test]
    fn test_migrations_run_on_fresh_db() {
        let conn = migrated();
        let count: u32 = conn
            .query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as u32);
        assert_eq!(MIGRATIONS.last().map(|m| m.version), Some(SCHEMA_VERSION));
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = migrated();
        run_all(&conn).unwrap();

        let count: u32 = conn
            .query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as u32);
        let srs: u32 = conn
            .query_row("SELECT COUNT(*) FROM gpkg_spatial_ref_sys", [], |r| r.get(0))
            .unwrap();
        assert_eq!(srs, 3);
    }

    #[test]
    fn test_cache_table_has_sync_state() {
        let conn = migrated();
        assert!(column_exists(&conn, "metadata_cache", "in_sync").unwrap());
        assert!(column_exists(&conn, "metadata_cache", "target_location").unwrap());
    }

    #[test]
    fn test_identifier_validation() {
        assert!(is_valid_identifier("geospatial_inventory"));
        assert!(is_valid_identifier("_inv2"));
        assert!(!is_valid_identifier("2inv"));
        assert!(!is_valid_identifier("inv; DROP TABLE x"));
        assert!(!is_valid_identifier("gpkg_contents"));
        assert!(!is_valid_identifier("sqlite_master"));
        assert!(!is_valid_identifier(""));
    }

    #[test]
    fn test_ensure_creates_and_registers_table() {
        let conn = migrated();
        let added = ensure_catalog_table(&conn, "inventory").unwrap();
        assert!(added.is_empty());

        let columns = table_columns(&conn, "inventory").unwrap();
        assert_eq!(columns.len(), CATALOG_COLUMNS.len());
        let geometry_type: String = conn
            .query_row(
                "SELECT geometry_type_name FROM gpkg_geometry_columns WHERE table_name = 'inventory'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(geometry_type, "POLYGON");

        // Second call is a no-op.
        assert!(ensure_catalog_table(&conn, "inventory").unwrap().is_empty());
    }

    #[test]
    fn test_retrofit_adds_management_columns() {
        let conn = migrated();
        conn.execute_batch(
            "CREATE TABLE inventory (
                fid INTEGER PRIMARY KEY AUTOINCREMENT,
                file_path TEXT NOT NULL,
                layer_name TEXT NOT NULL,
                data_type TEXT,
                format TEXT,
                scan_timestamp TEXT
            );",
        )
        .unwrap();

        let added = ensure_catalog_table(&conn, "inventory").unwrap();
        assert!(added.contains(&"metadata_status"));
        assert!(added.contains(&"retired_datetime"));
        assert!(added.contains(&"geom"));
        assert!(column_exists(&conn, "inventory", "metadata_cached").unwrap());
    }

    #[test]
    fn test_missing_identity_is_incompatible() {
        let conn = migrated();
        conn.execute_batch("CREATE TABLE inventory (fid INTEGER PRIMARY KEY, file_path TEXT);")
            .unwrap();

        match ensure_catalog_table(&conn, "inventory") {
            Err(DatabaseError::IncompatibleSchema { table, missing }) => {
                assert_eq!(table, "inventory");
                assert!(missing.contains(&"layer_name".to_string()));
                assert!(missing.contains(&"scan_timestamp".to_string()));
            }
            other => panic!("expected IncompatibleSchema, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_record_version_logs_history() {
        let conn = migrated();
        record_version(&conn, None, &[]).unwrap();
        assert_eq!(recorded_version(&conn).unwrap(), Some(SCHEMA_VERSION.to_string()));

        record_version(&conn, Some("1"), &["metadata_target"]).unwrap();
        let rows: u32 = conn
            .query_row("SELECT COUNT(*) FROM upgrade_history", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 3);
        let notes: String = conn
            .query_row(
                "SELECT notes FROM upgrade_history ORDER BY id DESC LIMIT 1",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(notes, "Added columns: metadata_target");
    }
}
