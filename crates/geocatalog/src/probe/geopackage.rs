//! OGC GeoPackage datasets, read through SQLite.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use rusqlite::{Connection, OpenFlags, OptionalExtension};

use super::{
    extension, geometry_type_name, validate_vector, DatasetDriver, DriverError, DriverFamily,
    DriverLayer, FeatureSample, LayerReport, ProbeOptions,
};
use crate::crs::CrsDefinition;
use crate::db::geometry::{self, Wkb};
use crate::record::{DataType, Extent, FieldInfo, IssueStage, VectorAttributes};

const FORMAT: &str = "GPKG";
const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";

pub struct GeoPackageDriver;

/// Double-quoted SQLite identifier.
pub(crate) fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn has_sqlite_header(path: &Path) -> bool {
    let mut magic = [0u8; 16];
    File::open(path)
        .and_then(|mut f| f.read_exact(&mut magic))
        .map(|_| &magic == SQLITE_MAGIC)
        .unwrap_or(false)
}

#[derive(Debug)]
struct ContentsRow {
    table_name: String,
    data_type: String,
    extent: Option<Extent>,
    srs_id: Option<i64>,
}

#[derive(Debug)]
struct GeometryColumn {
    column: String,
    type_name: String,
    srs_id: i64,
    z: i64,
    m: i64,
}

fn sql_err(e: rusqlite::Error) -> DriverError {
    DriverError::malformed(FORMAT, e.to_string())
}

fn table_exists(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?1",
        [name],
        |row| row.get::<_, i64>(0),
    )
    .map(|n| n > 0)
}

fn read_contents(conn: &Connection) -> rusqlite::Result<Vec<ContentsRow>> {
    let mut stmt = conn.prepare(
        "SELECT table_name, data_type, min_x, min_y, max_x, max_y, srs_id
         FROM gpkg_contents
         WHERE data_type IN ('features', 'attributes')
         ORDER BY table_name",
    )?;
    let rows = stmt.query_map([], |row| {
        let bounds: [Option<f64>; 4] = [row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?];
        let extent = match bounds {
            [Some(a), Some(b), Some(c), Some(d)] => {
                Some(Extent::new(a, b, c, d)).filter(Extent::is_finite)
            }
            _ => None,
        };
        Ok(ContentsRow {
            table_name: row.get(0)?,
            data_type: row.get(1)?,
            extent,
            srs_id: row.get(6)?,
        })
    })?;
    rows.collect()
}

fn read_geometry_column(conn: &Connection, table: &str) -> rusqlite::Result<Option<GeometryColumn>> {
    if !table_exists(conn, "gpkg_geometry_columns")? {
        return Ok(None);
    }
    conn.query_row(
        "SELECT column_name, geometry_type_name, srs_id, z, m
         FROM gpkg_geometry_columns WHERE table_name = ?1",
        [table],
        |row| {
            Ok(GeometryColumn {
                column: row.get(0)?,
                type_name: row.get(1)?,
                srs_id: row.get(2)?,
                z: row.get(3)?,
                m: row.get(4)?,
            })
        },
    )
    .optional()
}

fn read_srs(conn: &Connection, srs_id: i64) -> rusqlite::Result<Option<CrsDefinition>> {
    if srs_id == 0 || srs_id == -1 {
        return Ok(None);
    }
    let row: Option<(Option<String>, Option<i64>, Option<String>)> = conn
        .query_row(
            "SELECT organization, organization_coordsys_id, definition
             FROM gpkg_spatial_ref_sys WHERE srs_id = ?1",
            [srs_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    let Some((organization, code, definition)) = row else {
        return Ok(None);
    };

    let definition = definition.filter(|d| !d.trim().is_empty() && d.trim() != "undefined");
    let mut crs = definition
        .as_deref()
        .map(CrsDefinition::from_wkt)
        .unwrap_or_default();
    if let (Some(org), Some(code)) = (organization, code) {
        if org.eq_ignore_ascii_case("EPSG") {
            if let Ok(code) = u32::try_from(code) {
                crs.authority = Some(crate::crs::AuthorityCode::epsg(code));
            }
        }
    }
    Ok(if crs.is_empty() { None } else { Some(crs) })
}

/// OGR-style names for `gpkg_geometry_columns.geometry_type_name`.
fn base_geometry_name(type_name: &str) -> &'static str {
    match type_name.to_ascii_uppercase().as_str() {
        "POINT" => "Point",
        "LINESTRING" => "Line String",
        "POLYGON" => "Polygon",
        "MULTIPOINT" => "Multi Point",
        "MULTILINESTRING" => "Multi Line String",
        "MULTIPOLYGON" => "Multi Polygon",
        "GEOMETRYCOLLECTION" => "Geometry Collection",
        _ => "Unknown (any)",
    }
}

fn sqlite_type_name(declared: &str) -> &'static str {
    let upper = declared.to_ascii_uppercase();
    let base = upper.split('(').next().unwrap_or("").trim();
    match base {
        "INTEGER" | "INT" | "MEDIUMINT" => "Integer64",
        "SMALLINT" | "TINYINT" | "BOOLEAN" => "Integer",
        "REAL" | "DOUBLE" | "FLOAT" => "Real",
        "DATE" => "Date",
        "DATETIME" => "DateTime",
        "BLOB" => "Binary",
        _ => "String",
    }
}

fn read_fields(
    conn: &Connection,
    table: &str,
    geometry_column: Option<&str>,
) -> rusqlite::Result<Vec<FieldInfo>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_identifier(table)))?;
    let rows = stmt.query_map([], |row| {
        let name: String = row.get(1)?;
        let declared: String = row.get::<_, Option<String>>(2)?.unwrap_or_default();
        let pk: i64 = row.get(5)?;
        Ok((name, declared, pk))
    })?;
    let mut fields = Vec::new();
    for row in rows {
        let (name, declared, pk) = row?;
        if pk > 0 || Some(name.as_str()) == geometry_column {
            continue;
        }
        fields.push(FieldInfo::new(name, sqlite_type_name(&declared)));
    }
    Ok(fields)
}

fn count_rows(conn: &Connection, table: &str) -> rusqlite::Result<u64> {
    conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", quote_identifier(table)),
        [],
        |row| row.get::<_, i64>(0),
    )
    .map(|n| n.max(0) as u64)
}

/// Union of every geometry's bounds, used when `gpkg_contents` has no extent.
fn scan_extent(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<Option<Extent>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM {}",
        quote_identifier(column),
        quote_identifier(table)
    ))?;
    let mut rows = stmt.query([])?;
    let mut extent: Option<Extent> = None;
    while let Some(row) = rows.next()? {
        let Some(blob) = row.get::<_, Option<Vec<u8>>>(0)? else {
            continue;
        };
        let bounds = match geometry::decode(&blob) {
            Ok(g) if g.empty => None,
            Ok(g) => g
                .envelope
                .or_else(|| geometry::parse_wkb(g.wkb).ok().and_then(|w| w.bounds())),
            Err(_) => None,
        };
        if let Some(b) = bounds {
            extent = Some(match extent {
                Some(e) => e.union(&b),
                None => b,
            });
        }
    }
    Ok(extent)
}

fn sample_feature(conn: &Connection, table: &str, column: Option<&str>) -> FeatureSample {
    let Some(column) = column else {
        return match count_rows(conn, table) {
            Ok(_) => FeatureSample::NoGeometry,
            Err(_) => FeatureSample::Unreadable,
        };
    };
    let blob: rusqlite::Result<Option<Vec<u8>>> = conn.query_row(
        &format!(
            "SELECT {} FROM {} LIMIT 1",
            quote_identifier(column),
            quote_identifier(table)
        ),
        [],
        |row| row.get(0),
    );
    match blob {
        Err(_) => FeatureSample::Unreadable,
        Ok(None) => FeatureSample::NoGeometry,
        Ok(Some(blob)) => match geometry::decode(&blob) {
            Err(_) => FeatureSample::Geometry { valid: false },
            Ok(g) if g.empty => FeatureSample::NoGeometry,
            Ok(g) => FeatureSample::Geometry {
                valid: geometry::parse_wkb(g.wkb)
                    .map(|w: Wkb| w.is_valid())
                    .unwrap_or(false),
            },
        },
    }
}

fn describe_layer(
    conn: &Connection,
    contents: &ContentsRow,
    options: &ProbeOptions,
) -> Result<DriverLayer, DriverError> {
    let table = contents.table_name.as_str();
    let geometry = read_geometry_column(conn, table).map_err(sql_err)?;
    let is_table = contents.data_type == "attributes" || geometry.is_none();

    let fields = read_fields(conn, table, geometry.as_ref().map(|g| g.column.as_str()))
        .map_err(sql_err)?;
    let mut report = LayerReport::default();
    let count = match count_rows(conn, table) {
        Ok(n) => Some(n),
        Err(e) => {
            report.fail(IssueStage::Driver, format!("Cannot count features: {}", e));
            None
        }
    };

    let mut vector = VectorAttributes {
        fields,
        feature_count: count,
        ..VectorAttributes::default()
    };

    if let Some(geom) = &geometry {
        vector.has_z = geom.z > 0;
        vector.has_m = geom.m > 0;
        vector.geometry_type = Some(geometry_type_name(
            base_geometry_name(&geom.type_name),
            vector.has_z,
            vector.has_m,
        ));
        let srs_id = contents.srs_id.unwrap_or(geom.srs_id);
        report.crs = read_srs(conn, srs_id).map_err(sql_err)?;
        match contents.extent {
            Some(extent) => report.native_extent = Some(extent),
            None => match scan_extent(conn, table, &geom.column) {
                Ok(extent) => report.native_extent = extent,
                Err(e) => report.fail(IssueStage::Extent, format!("Cannot compute extent: {}", e)),
            },
        }
    }
    report.vector = Some(vector);

    if options.validate {
        let column = geometry.as_ref().map(|g| g.column.as_str());
        validate_vector(&mut report, is_table, count.unwrap_or(0), || {
            sample_feature(conn, table, column)
        });
    }

    Ok(DriverLayer {
        name: table.to_string(),
        data_type: if is_table { DataType::Table } else { DataType::Vector },
        report,
    })
}

impl DatasetDriver for GeoPackageDriver {
    fn short_name(&self) -> &'static str {
        FORMAT
    }

    fn long_name(&self) -> &'static str {
        "GeoPackage"
    }

    fn family(&self) -> DriverFamily {
        DriverFamily::Vector
    }

    fn open(&self, path: &Path, options: &ProbeOptions) -> Result<Vec<DriverLayer>, DriverError> {
        let named = extension(path).as_deref() == Some("gpkg");
        if !named && !has_sqlite_header(path) {
            return Err(DriverError::NotRecognized);
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| {
            if named {
                sql_err(e)
            } else {
                DriverError::NotRecognized
            }
        })?;

        match table_exists(&conn, "gpkg_contents") {
            Ok(true) => {}
            Ok(false) if named => {
                return Err(DriverError::malformed(FORMAT, "no gpkg_contents table"))
            }
            Ok(false) => return Err(DriverError::NotRecognized),
            Err(e) if named => return Err(sql_err(e)),
            Err(_) => return Err(DriverError::NotRecognized),
        }

        let contents = read_contents(&conn).map_err(sql_err)?;
        let mut layers = Vec::with_capacity(contents.len());
        for row in &contents {
            match describe_layer(&conn, row, options) {
                Ok(layer) => layers.push(layer),
                Err(e) => log::debug!("Skipping layer {} in {}: {}", row.table_name, path.display(), e),
            }
        }
        if layers.is_empty() {
            return Err(DriverError::NotRecognized);
        }
        Ok(layers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Footprint;
    use tempfile::TempDir;

    fn build_gpkg(path: &Path) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE gpkg_spatial_ref_sys (
                srs_name TEXT NOT NULL, srs_id INTEGER PRIMARY KEY,
                organization TEXT NOT NULL, organization_coordsys_id INTEGER NOT NULL,
                definition TEXT NOT NULL, description TEXT);
             INSERT INTO gpkg_spatial_ref_sys VALUES
                ('WGS 84', 4326, 'EPSG', 4326, 'GEOGCS[\"WGS 84\",AUTHORITY[\"EPSG\",\"4326\"]]', NULL),
                ('Undefined', -1, 'NONE', -1, 'undefined', NULL);
             CREATE TABLE gpkg_contents (
                table_name TEXT PRIMARY KEY, data_type TEXT NOT NULL, identifier TEXT,
                description TEXT, last_change TEXT, min_x DOUBLE, min_y DOUBLE,
                max_x DOUBLE, max_y DOUBLE, srs_id INTEGER);
             CREATE TABLE gpkg_geometry_columns (
                table_name TEXT, column_name TEXT, geometry_type_name TEXT,
                srs_id INTEGER, z TINYINT, m TINYINT);
             CREATE TABLE parcels (fid INTEGER PRIMARY KEY, geom BLOB, owner TEXT, area REAL);
             CREATE TABLE owners (id INTEGER PRIMARY KEY, name TEXT, since DATE);
             INSERT INTO gpkg_contents VALUES
                ('parcels', 'features', 'parcels', '', '', NULL, NULL, NULL, NULL, 4326),
                ('owners', 'attributes', 'owners', '', '', NULL, NULL, NULL, NULL, NULL);
             INSERT INTO gpkg_geometry_columns VALUES ('parcels', 'geom', 'POLYGON', 4326, 0, 0);
             INSERT INTO owners (name, since) VALUES ('Ada', '2020-01-01');",
        )
        .unwrap();
        for extent in [Extent::new(0.0, 0.0, 1.0, 1.0), Extent::new(2.0, -1.0, 3.0, 4.0)] {
            let blob = geometry::encode_footprint(&Footprint::from_extent(&extent), 4326);
            conn.execute(
                "INSERT INTO parcels (geom, owner, area) VALUES (?1, 'x', 1.0)",
                [blob],
            )
            .unwrap();
        }
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("roads"), "\"roads\"");
        assert_eq!(quote_identifier("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn test_opens_feature_and_attribute_layers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("city.gpkg");
        build_gpkg(&path);

        let layers = GeoPackageDriver
            .open(&path, &ProbeOptions { validate: true })
            .unwrap();
        assert_eq!(layers.len(), 2);

        let owners = &layers[0];
        assert_eq!(owners.name, "owners");
        assert_eq!(owners.data_type, DataType::Table);
        let fields = &owners.report.vector.as_ref().unwrap().fields;
        assert_eq!(
            fields,
            &vec![FieldInfo::new("name", "String"), FieldInfo::new("since", "Date")]
        );

        let parcels = &layers[1];
        assert_eq!(parcels.name, "parcels");
        assert_eq!(parcels.data_type, DataType::Vector);
        let vector = parcels.report.vector.as_ref().unwrap();
        assert_eq!(vector.geometry_type.as_deref(), Some("Polygon"));
        assert_eq!(vector.feature_count, Some(2));
        assert_eq!(vector.fields.len(), 2);
        assert_eq!(parcels.report.crs.as_ref().and_then(|c| c.epsg_code()), Some(4326));
        assert_eq!(parcels.report.native_extent, Some(Extent::new(0.0, -1.0, 3.0, 4.0)));
        assert!(parcels.report.valid);
        assert!(parcels.report.issues.is_empty());
    }

    #[test]
    fn test_plain_sqlite_file_is_not_recognized() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.db");
        Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE t (x INTEGER);")
            .unwrap();
        assert!(matches!(
            GeoPackageDriver.open(&path, &ProbeOptions::default()),
            Err(DriverError::NotRecognized)
        ));
    }

    #[test]
    fn test_sqlite_type_mapping() {
        assert_eq!(sqlite_type_name("INTEGER"), "Integer64");
        assert_eq!(sqlite_type_name("TEXT(30)"), "String");
        assert_eq!(sqlite_type_name("double"), "Real");
        assert_eq!(sqlite_type_name("BLOB"), "Binary");
    }
}
