//! Catalog persistence.
//!
//! The catalog is a GeoPackage file: one feature table of inventory records
//! (name chosen by the caller) plus bookkeeping tables. A [`CatalogStore`]
//! is the single writer; every scan runs inside one [`ScanSession`]
//! transaction. [`CatalogReader`] opens its own read-only connection and
//! sees the last committed state while a scan is in flight.

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags};

pub mod cache_repo;
pub mod catalog_repo;
pub mod error;
pub mod geometry;
pub mod migrations;
pub mod stats_repo;
pub mod status_repo;

pub use cache_repo::CachedMetadata;
pub use error::DatabaseError;
pub use stats_repo::{GroupDimension, GroupStats, Recommendation, StatusCounts};
pub use status_repo::StatusUpdate;

use crate::record::{Identity, InventoryRecord, ManagementFields};

/// `PRAGMA application_id` of a GeoPackage (`"GPKG"`).
pub const GPKG_APPLICATION_ID: i32 = 0x4750_4B47;
/// `PRAGMA user_version` for GeoPackage 1.3.
pub const GPKG_USER_VERSION: i32 = 10300;
/// SRS of the footprint geometry column.
pub const GLOBAL_SRS_ID: i32 = 4326;
/// Default name of the catalog table.
pub const DEFAULT_TABLE: &str = "geospatial_inventory";

const SQLITE_HEADER: &[u8; 16] = b"SQLite format 3\0";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Thread-safe database handle wrapping a single rusqlite connection.
///
/// Cloning is cheap (inner `Arc`). All access is serialized through a
/// `Mutex`. WAL mode lets [`CatalogReader`]s read while a scan writes.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens (or creates) the catalog file and runs pending migrations.
    ///
    /// Refuses files that are not SQLite, SQLite files owned by another
    /// application, and catalogs written by a newer schema.
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| DatabaseError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        check_header(path)?;

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        check_application(&conn, path)?;
        check_version(&conn)?;
        migrations::run_all(&conn)?;
        stamp_geopackage(&conn)?;

        log::info!("Catalog database opened at {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an in-memory database for testing. Runs all migrations.
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        migrations::run_all(&conn)?;
        stamp_geopackage(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Provides locked access to the underlying connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        let conn = self.lock()?;
        f(&conn)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, DatabaseError> {
        self.conn.lock().map_err(|_| DatabaseError::LockPoisoned)
    }
}

fn foreign(path: &Path, reason: impl Into<String>) -> DatabaseError {
    DatabaseError::ForeignCatalog {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// A non-empty file must start with the SQLite header.
fn check_header(path: &Path) -> Result<(), DatabaseError> {
    let mut file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(DatabaseError::Io {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    let mut header = Vec::with_capacity(SQLITE_HEADER.len());
    file.by_ref()
        .take(SQLITE_HEADER.len() as u64)
        .read_to_end(&mut header)
        .map_err(|e| DatabaseError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
    if header.is_empty() || header.as_slice() == SQLITE_HEADER {
        Ok(())
    } else {
        Err(foreign(path, "not an SQLite database"))
    }
}

fn user_tables(conn: &Connection) -> Result<Vec<String>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\'",
    )?;
    let names = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

/// Accepts GeoPackages and empty SQLite files only.
fn check_application(conn: &Connection, path: &Path) -> Result<(), DatabaseError> {
    let application_id: i32 = conn.query_row("PRAGMA application_id", [], |r| r.get(0))?;
    if application_id == GPKG_APPLICATION_ID {
        return Ok(());
    }
    if application_id != 0 {
        return Err(foreign(
            path,
            format!("unexpected application_id {:#010x}", application_id),
        ));
    }
    let tables = user_tables(conn)?;
    if tables.is_empty() || tables.iter().any(|t| t == "gpkg_contents") {
        Ok(())
    } else {
        Err(foreign(path, "SQLite database with unrelated tables"))
    }
}

fn check_version(conn: &Connection) -> Result<(), DatabaseError> {
    let Some(recorded) = migrations::recorded_version(conn)? else {
        return Ok(());
    };
    match recorded.trim().parse::<u32>() {
        Ok(found) if found > migrations::SCHEMA_VERSION => Err(DatabaseError::NewerSchema {
            found,
            supported: migrations::SCHEMA_VERSION,
        }),
        Ok(_) => Ok(()),
        Err(_) => Err(DatabaseError::Migration {
            version: migrations::SCHEMA_VERSION,
            reason: format!("unreadable inventory_schema_version '{}'", recorded),
        }),
    }
}

/// Sets the GeoPackage header pragmas if they differ.
fn stamp_geopackage(conn: &Connection) -> Result<(), DatabaseError> {
    let application_id: i32 = conn.query_row("PRAGMA application_id", [], |r| r.get(0))?;
    if application_id != GPKG_APPLICATION_ID {
        conn.execute_batch(&format!("PRAGMA application_id = {}", GPKG_APPLICATION_ID))?;
    }
    let user_version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    if user_version != GPKG_USER_VERSION {
        conn.execute_batch(&format!("PRAGMA user_version = {}", GPKG_USER_VERSION))?;
    }
    Ok(())
}

/// Read operations shared by the store and snapshot readers.
pub trait CatalogAccess {
    /// Runs `f` with a connection and the catalog table name.
    fn with_catalog<T, F>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection, &str) -> Result<T, DatabaseError>;

    /// The active record with this identity.
    fn find(&self, identity: &Identity) -> Result<Option<InventoryRecord>, DatabaseError> {
        self.with_catalog(|conn, table| catalog_repo::find(conn, table, identity))
    }

    /// Every record stored for this identity, retired ones included.
    fn history(&self, identity: &Identity) -> Result<Vec<InventoryRecord>, DatabaseError> {
        self.with_catalog(|conn, table| catalog_repo::history(conn, table, identity))
    }

    fn active_records(&self) -> Result<Vec<InventoryRecord>, DatabaseError> {
        self.with_catalog(catalog_repo::active_records)
    }

    fn active_count(&self) -> Result<u64, DatabaseError> {
        self.with_catalog(catalog_repo::count_active)
    }

    fn management(&self, identity: &Identity) -> Result<Option<ManagementFields>, DatabaseError> {
        self.with_catalog(|conn, table| status_repo::management(conn, table, identity))
    }

    fn statistics_overall(&self) -> Result<StatusCounts, DatabaseError> {
        self.with_catalog(stats_repo::overall)
    }

    fn statistics_grouped_by(
        &self,
        dimension: GroupDimension,
    ) -> Result<Vec<GroupStats>, DatabaseError> {
        self.with_catalog(|conn, table| stats_repo::grouped_by(conn, table, dimension))
    }

    fn priority_recommendations(&self, limit: usize) -> Result<Vec<Recommendation>, DatabaseError> {
        self.with_catalog(|conn, table| stats_repo::priority_recommendations(conn, table, limit))
    }

    fn load_cached_metadata(
        &self,
        identity: &Identity,
    ) -> Result<Option<CachedMetadata>, DatabaseError> {
        self.with_catalog(|conn, _| cache_repo::load_cached_metadata(conn, identity))
    }

    fn schema_version(&self) -> Result<Option<String>, DatabaseError> {
        self.with_catalog(|conn, _| migrations::recorded_version(conn))
    }
}

/// The writable catalog.
#[derive(Clone)]
pub struct CatalogStore {
    db: Database,
    path: Option<PathBuf>,
    table: String,
}

impl CatalogStore {
    /// Opens or creates the catalog at `path`, creating or retrofitting
    /// `table`.
    pub fn open(path: &Path, table: &str) -> Result<Self, DatabaseError> {
        if !migrations::is_valid_identifier(table) {
            return Err(DatabaseError::InvalidIdentifier(table.to_string()));
        }
        let db = Database::open(path)?;
        Self::prepare(&db, table)?;
        Ok(Self {
            db,
            path: Some(path.to_path_buf()),
            table: table.to_string(),
        })
    }

    pub fn open_in_memory(table: &str) -> Result<Self, DatabaseError> {
        if !migrations::is_valid_identifier(table) {
            return Err(DatabaseError::InvalidIdentifier(table.to_string()));
        }
        let db = Database::open_in_memory()?;
        Self::prepare(&db, table)?;
        Ok(Self {
            db,
            path: None,
            table: table.to_string(),
        })
    }

    fn prepare(db: &Database, table: &str) -> Result<(), DatabaseError> {
        db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let previous = migrations::recorded_version(&tx)?;
            let added = migrations::ensure_catalog_table(&tx, table)?;
            migrations::record_version(&tx, previous.as_deref(), &added)?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Starts the scan's write transaction. The session holds this store's
    /// connection until it is committed, rolled back or dropped.
    pub fn begin_scan(&self) -> Result<ScanSession<'_>, DatabaseError> {
        let conn = self.db.lock()?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        log::debug!("Scan transaction started on {}", self.table);
        Ok(ScanSession {
            conn,
            table: &self.table,
            finished: false,
        })
    }

    /// Sets the management fields of one active record. This is the only
    /// write path for those fields.
    pub fn update_status(
        &self,
        identity: &Identity,
        update: &StatusUpdate,
    ) -> Result<bool, DatabaseError> {
        self.db.with_conn(|conn| {
            status_repo::update_status(conn, &self.table, identity, update, &Utc::now())
        })
    }

    /// Resets `complete` records that have no cached document.
    pub fn fix_incorrect_status(&self) -> Result<usize, DatabaseError> {
        self.db
            .with_conn(|conn| status_repo::fix_incorrect_status(conn, &self.table, &Utc::now()))
    }

    pub fn save_cached_metadata(
        &self,
        identity: &Identity,
        document: &serde_json::Value,
    ) -> Result<(), DatabaseError> {
        self.db.with_conn(|conn| {
            cache_repo::save_cached_metadata(conn, identity, document, &Utc::now())
        })
    }

    pub fn mark_cache_written(&self, identity: &Identity, target: &str) -> Result<bool, DatabaseError> {
        self.db
            .with_conn(|conn| cache_repo::mark_written(conn, identity, target, &Utc::now()))
    }
}

impl CatalogAccess for CatalogStore {
    fn with_catalog<T, F>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection, &str) -> Result<T, DatabaseError>,
    {
        self.db.with_conn(|conn| f(conn, &self.table))
    }
}

/// One scan's exclusive write transaction.
///
/// Nothing is visible to readers until [`ScanSession::commit`]. Dropping a
/// session that was neither committed nor rolled back rolls it back.
pub struct ScanSession<'a> {
    conn: MutexGuard<'a, Connection>,
    table: &'a str,
    finished: bool,
}

impl ScanSession<'_> {
    /// Management fields of every active record before this scan.
    pub fn prior_management(&self) -> Result<HashMap<Identity, ManagementFields>, DatabaseError> {
        status_repo::active_management(&self.conn, self.table)
    }

    /// Removes every row, retired history included. Used by fresh scans.
    pub fn clear_all(&mut self) -> Result<usize, DatabaseError> {
        let removed = catalog_repo::clear(&self.conn, self.table)?;
        log::info!("Fresh scan: cleared {} catalog rows", removed);
        Ok(removed)
    }

    /// Inserts or refreshes each record by identity. Management fields are
    /// not written.
    pub fn upsert_active(&mut self, records: &[InventoryRecord]) -> Result<usize, DatabaseError> {
        for record in records {
            catalog_repo::upsert(&self.conn, self.table, record)?;
        }
        Ok(records.len())
    }

    /// Retires every active record whose identity is not in `active`.
    pub fn retire_missing(
        &mut self,
        active: &HashSet<Identity>,
        retired_at: &DateTime<Utc>,
    ) -> Result<usize, DatabaseError> {
        catalog_repo::retire_missing(&self.conn, self.table, active, retired_at)
    }

    pub fn find(&self, identity: &Identity) -> Result<Option<InventoryRecord>, DatabaseError> {
        catalog_repo::find(&self.conn, self.table, identity)
    }

    /// Refreshes the GeoPackage contents entry and commits.
    pub fn commit(mut self, scan_timestamp: &DateTime<Utc>) -> Result<(), DatabaseError> {
        catalog_repo::refresh_contents_extent(&self.conn, self.table, scan_timestamp)?;
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;
        log::debug!("Scan transaction committed on {}", self.table);
        Ok(())
    }

    pub fn rollback(mut self) -> Result<(), DatabaseError> {
        self.finished = true;
        self.conn.execute_batch("ROLLBACK")?;
        log::debug!("Scan transaction rolled back on {}", self.table);
        Ok(())
    }
}

impl Drop for ScanSession<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                log::warn!("Failed to roll back unfinished scan session: {}", e);
            } else {
                log::debug!("Unfinished scan session rolled back on {}", self.table);
            }
        }
    }
}

/// Read-only view of a catalog, usable while another process or thread
/// holds a scan session.
pub struct CatalogReader {
    conn: Connection,
    table: String,
}

impl CatalogReader {
    pub fn open(path: &Path, table: &str) -> Result<Self, DatabaseError> {
        if !migrations::is_valid_identifier(table) {
            return Err(DatabaseError::InvalidIdentifier(table.to_string()));
        }
        if !path.exists() {
            return Err(DatabaseError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "catalog not found"),
            });
        }
        check_header(path)?;

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        check_application(&conn, path)?;
        check_version(&conn)?;

        if !migrations::table_exists(&conn, table)? {
            return Err(foreign(path, format!("no catalog table '{}'", table)));
        }
        let existing = migrations::table_columns(&conn, table)?;
        let missing: Vec<String> = migrations::CATALOG_COLUMNS
            .iter()
            .filter(|c| !existing.iter().any(|e| e == c.name))
            .map(|c| c.name.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(DatabaseError::IncompatibleSchema {
                table: table.to_string(),
                missing,
            });
        }

        Ok(Self {
            conn,
            table: table.to_string(),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

impl CatalogAccess for CatalogReader {
    fn with_catalog<T, F>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection, &str) -> Result<T, DatabaseError>,
    {
        f(&self.conn, &self.table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{DataType, MetadataStatus};
    use tempfile::TempDir;

    fn record(path: &str, layer: &str) -> InventoryRecord {
        InventoryRecord::new(Identity::new(path, layer), DataType::Vector, Utc::now())
    }

    #[test]
    fn test_open_creates_geopackage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out/catalog.gpkg");
        let store = CatalogStore::open(&path, DEFAULT_TABLE).unwrap();
        assert!(path.exists());

        store
            .database()
            .with_conn(|conn| {
                let app: i32 = conn.query_row("PRAGMA application_id", [], |r| r.get(0))?;
                let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
                assert_eq!(app, GPKG_APPLICATION_ID);
                assert_eq!(version, GPKG_USER_VERSION);
                Ok(())
            })
            .unwrap();
        assert_eq!(
            store.schema_version().unwrap(),
            Some(migrations::SCHEMA_VERSION.to_string())
        );
    }

    #[test]
    fn test_reopen_keeps_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.gpkg");
        {
            let store = CatalogStore::open(&path, DEFAULT_TABLE).unwrap();
            let mut session = store.begin_scan().unwrap();
            session.upsert_active(&[record("/d/a.shp", "a")]).unwrap();
            session.commit(&Utc::now()).unwrap();
        }
        let store = CatalogStore::open(&path, DEFAULT_TABLE).unwrap();
        assert_eq!(store.active_count().unwrap(), 1);
    }

    #[test]
    fn test_rejects_non_sqlite_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.gpkg");
        std::fs::write(&path, "just some text, not a database").unwrap();
        assert!(matches!(
            CatalogStore::open(&path, DEFAULT_TABLE),
            Err(DatabaseError::ForeignCatalog { .. })
        ));
    }

    #[test]
    fn test_rejects_unrelated_sqlite_database() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);")
                .unwrap();
        }
        assert!(matches!(
            CatalogStore::open(&path, DEFAULT_TABLE),
            Err(DatabaseError::ForeignCatalog { .. })
        ));
    }

    #[test]
    fn test_rejects_foreign_application_id() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("other.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch("PRAGMA application_id = 1234;").unwrap();
        }
        assert!(matches!(
            CatalogStore::open(&path, DEFAULT_TABLE),
            Err(DatabaseError::ForeignCatalog { .. })
        ));
    }

    #[test]
    fn test_rejects_newer_schema() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.gpkg");
        CatalogStore::open(&path, DEFAULT_TABLE).unwrap();
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute(
                "UPDATE catalog_info SET value = '99' WHERE key = 'inventory_schema_version'",
                [],
            )
            .unwrap();
        }
        assert!(matches!(
            CatalogStore::open(&path, DEFAULT_TABLE),
            Err(DatabaseError::NewerSchema { found: 99, .. })
        ));
    }

    #[test]
    fn test_rejects_invalid_table_name() {
        assert!(matches!(
            CatalogStore::open_in_memory("bad name"),
            Err(DatabaseError::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn test_dropped_session_rolls_back() {
        let store = CatalogStore::open_in_memory(DEFAULT_TABLE).unwrap();
        {
            let mut session = store.begin_scan().unwrap();
            session.upsert_active(&[record("/d/a.shp", "a")]).unwrap();
            assert!(session.find(&Identity::new("/d/a.shp", "a")).unwrap().is_some());
        }
        assert_eq!(store.active_count().unwrap(), 0);
    }

    #[test]
    fn test_explicit_rollback() {
        let store = CatalogStore::open_in_memory(DEFAULT_TABLE).unwrap();
        let mut session = store.begin_scan().unwrap();
        session.upsert_active(&[record("/d/a.shp", "a")]).unwrap();
        session.rollback().unwrap();
        assert_eq!(store.active_count().unwrap(), 0);
    }

    #[test]
    fn test_reader_sees_only_committed_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.gpkg");
        let store = CatalogStore::open(&path, DEFAULT_TABLE).unwrap();
        let reader = CatalogReader::open(&path, DEFAULT_TABLE).unwrap();

        let mut session = store.begin_scan().unwrap();
        session.upsert_active(&[record("/d/a.shp", "a")]).unwrap();
        assert_eq!(reader.active_count().unwrap(), 0);
        session.commit(&Utc::now()).unwrap();
        assert_eq!(reader.active_count().unwrap(), 1);
    }

    #[test]
    fn test_reader_requires_catalog_table() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.gpkg");
        CatalogStore::open(&path, DEFAULT_TABLE).unwrap();
        assert!(matches!(
            CatalogReader::open(&path, "other_inventory"),
            Err(DatabaseError::ForeignCatalog { .. })
        ));
    }

    #[test]
    fn test_status_update_through_store() {
        let store = CatalogStore::open_in_memory(DEFAULT_TABLE).unwrap();
        let id = Identity::new("/d/a.shp", "a");
        let mut session = store.begin_scan().unwrap();
        session.upsert_active(&[record("/d/a.shp", "a")]).unwrap();
        session.commit(&Utc::now()).unwrap();

        assert!(store
            .update_status(&id, &StatusUpdate::new(MetadataStatus::Complete).cached(true))
            .unwrap());
        assert_eq!(store.management(&id).unwrap().unwrap().status, MetadataStatus::Complete);
        assert_eq!(store.fix_incorrect_status().unwrap(), 1);

        store
            .save_cached_metadata(&id, &serde_json::json!({"title": "A"}))
            .unwrap();
        assert!(store.load_cached_metadata(&id).unwrap().is_some());
    }
}
