//! Catalog table rows: the refresh write path, retirement and record reads.
//!
//! The refresh path writes identity, core and extracted columns only. The
//! management columns are left to their defaults on insert and are never in
//! the `DO UPDATE` list, so a rescan cannot overwrite them.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::geometry;
use super::migrations::CATALOG_COLUMNS;
use super::{DatabaseError, GLOBAL_SRS_ID};
use crate::record::{
    format_timestamp, parse_timestamp, BandInfo, DataType, DescriptiveMetadata, Extent,
    FieldInfo, FileAttributes, GeoreferenceMethod, Identity, InventoryRecord, ManagementFields,
    MetadataStandard, MetadataStatus, Provenance, Quality, RasterAttributes, SidecarFlags,
    SpatialAttributes, StorageLocation, VectorAttributes,
};

fn text(value: impl Into<String>) -> Value {
    Value::Text(value.into())
}

fn opt_text(value: Option<&str>) -> Value {
    value.map(text).unwrap_or(Value::Null)
}

fn flag(value: bool) -> Value {
    Value::Integer(i64::from(value))
}

fn int(value: impl TryInto<i64>) -> Value {
    Value::Integer(value.try_into().unwrap_or(i64::MAX))
}

fn real(value: Option<f64>) -> Value {
    value.filter(|v| v.is_finite()).map(Value::Real).unwrap_or(Value::Null)
}

fn timestamp(value: Option<&DateTime<Utc>>) -> Value {
    value.map(|ts| text(format_timestamp(ts))).unwrap_or(Value::Null)
}

fn json<T: Serialize + ?Sized>(value: &T) -> Result<Value, DatabaseError> {
    Ok(Value::Text(serde_json::to_string(value)?))
}

/// Column values written by the refresh path, identity included.
pub(crate) fn refresh_values(
    record: &InventoryRecord,
) -> Result<Vec<(&'static str, Value)>, DatabaseError> {
    let file = &record.file;
    let provenance = &record.provenance;
    let spatial = &record.spatial;
    let sidecars = &record.sidecars;

    let mut values = vec![
        (
            "geom",
            spatial
                .footprint
                .as_ref()
                .map(|f| Value::Blob(geometry::encode_footprint(f, GLOBAL_SRS_ID)))
                .unwrap_or(Value::Null),
        ),
        ("file_path", text(record.identity.file_path.as_str())),
        ("layer_name", text(record.identity.layer_name.as_str())),
        ("data_type", text(record.data_type.as_str())),
        ("format", text(record.format.as_str())),
        ("driver_name", text(record.driver_name.as_str())),
        ("relative_path", text(file.relative_path.as_str())),
        ("file_name", text(file.file_name.as_str())),
        ("parent_directory", text(file.parent_directory.as_str())),
        ("directory_depth", int(file.directory_depth)),
        ("file_size_bytes", int(file.size_bytes)),
        (
            "file_size_mb",
            Value::Real((file.size_bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0),
        ),
        ("file_created", timestamp(file.created.as_ref())),
        ("file_modified", timestamp(file.modified.as_ref())),
        ("scanned_by_user", text(provenance.user.as_str())),
        ("scanned_by_machine", text(provenance.machine.as_str())),
        ("scanned_from_os", text(provenance.os.as_str())),
        ("scanned_from_os_version", opt_text(provenance.os_version.as_deref())),
        ("storage_location", text(provenance.storage.as_str())),
        ("network_server", opt_text(provenance.network_server.as_deref())),
        ("drive_or_mount", opt_text(provenance.drive_or_mount.as_deref())),
        ("crs_authid", opt_text(spatial.crs_authid.as_deref())),
        ("crs_wkt", opt_text(spatial.crs_wkt.as_deref())),
        (
            "native_extent",
            spatial
                .native_extent
                .map(|e| text(e.to_text()))
                .unwrap_or(Value::Null),
        ),
        (
            "wgs84_extent",
            spatial
                .global_extent
                .map(|e| text(e.to_text()))
                .unwrap_or(Value::Null),
        ),
        ("has_crs", flag(spatial.has_crs())),
        ("has_extent", flag(spatial.has_extent())),
        ("extent_reprojected", flag(spatial.extent_reprojected)),
    ];

    match &record.vector {
        Some(vector) => {
            let names: Vec<&str> = vector.fields.iter().map(|f| f.name.as_str()).collect();
            let types: Vec<&str> = vector.fields.iter().map(|f| f.field_type.as_str()).collect();
            values.extend([
                ("geometry_type", opt_text(vector.geometry_type.as_deref())),
                (
                    "feature_count",
                    vector.feature_count.map(int).unwrap_or(Value::Null),
                ),
                ("field_count", int(vector.field_count())),
                ("field_names", json(&names)?),
                ("field_types", json(&types)?),
                ("has_z", flag(vector.has_z)),
                ("has_m", flag(vector.has_m)),
            ]);
        }
        None => values.extend([
            ("geometry_type", Value::Null),
            ("feature_count", Value::Null),
            ("field_count", Value::Null),
            ("field_names", Value::Null),
            ("field_types", Value::Null),
            ("has_z", flag(false)),
            ("has_m", flag(false)),
        ]),
    }

    match &record.raster {
        Some(raster) => {
            let types: Vec<&str> = raster.bands.iter().map(|b| b.data_type.as_str()).collect();
            let nodata: Vec<Option<f64>> = raster.bands.iter().map(|b| b.nodata).collect();
            values.extend([
                ("raster_width", int(raster.width)),
                ("raster_height", int(raster.height)),
                ("band_count", int(raster.band_count)),
                ("pixel_width", real(raster.pixel_size.map(|p| p.0))),
                ("pixel_height", real(raster.pixel_size.map(|p| p.1))),
                ("band_types", json(&types)?),
                ("nodata_values", json(&nodata)?),
                ("compression", opt_text(raster.compression.as_deref())),
                ("georeference_method", text(raster.georeference.as_str())),
            ]);
        }
        None => values.extend([
            ("raster_width", Value::Null),
            ("raster_height", Value::Null),
            ("band_count", Value::Null),
            ("pixel_width", Value::Null),
            ("pixel_height", Value::Null),
            ("band_types", Value::Null),
            ("nodata_values", Value::Null),
            ("compression", Value::Null),
            ("georeference_method", Value::Null),
        ]),
    }

    match &record.descriptive {
        Some(doc) => values.extend([
            ("metadata_standard", text(doc.standard.as_str())),
            ("metadata_file_path", text(doc.document_path.as_str())),
            ("layer_title", opt_text(doc.title.as_deref())),
            ("layer_abstract", opt_text(doc.abstract_text.as_deref())),
            ("keywords", json(&doc.keywords)?),
            ("lineage", opt_text(doc.lineage.as_deref())),
            ("constraints", opt_text(doc.constraints.as_deref())),
            ("contact_info", opt_text(doc.contact.as_deref())),
            ("links", json(&doc.links)?),
            ("topic_categories", json(&doc.topic_categories)?),
        ]),
        None => values.extend([
            ("metadata_standard", Value::Null),
            ("metadata_file_path", Value::Null),
            ("layer_title", Value::Null),
            ("layer_abstract", Value::Null),
            ("keywords", Value::Null),
            ("lineage", Value::Null),
            ("constraints", Value::Null),
            ("contact_info", Value::Null),
            ("links", Value::Null),
            ("topic_categories", Value::Null),
        ]),
    }

    values.extend([
        ("has_prj_file", flag(sidecars.has_prj_file)),
        ("has_world_file", flag(sidecars.has_world_file)),
        ("has_aux_xml", flag(sidecars.has_aux_xml)),
        ("has_metadata_xml", flag(sidecars.has_metadata_xml)),
        ("quality_score", Value::Real(record.quality.score)),
        ("issues", json(&record.quality.issues)?),
        ("is_valid", flag(record.quality.is_valid)),
        ("scan_timestamp", text(format_timestamp(&record.scan_timestamp))),
    ]);
    Ok(values)
}

/// Inserts a record, or refreshes the active row with the same identity.
pub fn upsert(conn: &Connection, table: &str, record: &InventoryRecord) -> Result<(), DatabaseError> {
    let mut values = refresh_values(record)?;
    let updates = values
        .iter()
        .map(|(name, _)| *name)
        .filter(|name| !matches!(*name, "file_path" | "layer_name"))
        .map(|name| format!("{name} = excluded.{name}"))
        .collect::<Vec<_>>()
        .join(", ");
    values.push((
        "record_created",
        text(format_timestamp(&record.record_created)),
    ));

    let names = values.iter().map(|(name, _)| *name).collect::<Vec<_>>().join(", ");
    let placeholders = (1..=values.len())
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT INTO \"{table}\" ({names}) VALUES ({placeholders})
         ON CONFLICT (file_path, layer_name) WHERE retired_datetime IS NULL
         DO UPDATE SET {updates}"
    );

    let mut stmt = conn.prepare_cached(&sql)?;
    stmt.execute(params_from_iter(values.into_iter().map(|(_, value)| value)))?;
    Ok(())
}

/// Deletes every row, retired history included.
pub fn clear(conn: &Connection, table: &str) -> Result<usize, DatabaseError> {
    Ok(conn.execute(&format!("DELETE FROM \"{}\"", table), [])?)
}

/// Active identities with their row keys.
pub fn active_identities(conn: &Connection, table: &str) -> Result<Vec<(i64, Identity)>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT fid, file_path, layer_name FROM \"{}\" WHERE retired_datetime IS NULL",
        table
    ))?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get(0)?, Identity::new(row.get::<_, String>(1)?, row.get::<_, String>(2)?)))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Sets `retired_datetime` on every active row whose identity is not in
/// `active`. No other column is touched.
pub fn retire_missing(
    conn: &Connection,
    table: &str,
    active: &HashSet<Identity>,
    retired_at: &DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let stamp = format_timestamp(retired_at);
    let mut stmt = conn.prepare(&format!(
        "UPDATE \"{}\" SET retired_datetime = ?1 WHERE fid = ?2 AND retired_datetime IS NULL",
        table
    ))?;
    let mut retired = 0;
    for (fid, identity) in active_identities(conn, table)? {
        if !active.contains(&identity) {
            log::debug!("Retiring {}", identity);
            retired += stmt.execute(params![stamp, fid])?;
        }
    }
    Ok(retired)
}

/// Recomputes the `gpkg_contents` bounding box from active reprojected
/// footprints and stamps `last_change`.
pub fn refresh_contents_extent(
    conn: &Connection,
    table: &str,
    changed_at: &DateTime<Utc>,
) -> Result<Option<Extent>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT geom FROM \"{}\"
         WHERE retired_datetime IS NULL AND extent_reprojected = 1 AND geom IS NOT NULL",
        table
    ))?;
    let mut bbox: Option<Extent> = None;
    for blob in stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))? {
        let blob = blob?;
        let envelope = geometry::decode(&blob).ok().and_then(|g| g.envelope);
        if let Some(envelope) = envelope {
            bbox = Some(bbox.map_or(envelope, |b| b.union(&envelope)));
        }
    }

    conn.execute(
        "UPDATE gpkg_contents SET min_x = ?1, min_y = ?2, max_x = ?3, max_y = ?4, last_change = ?5
         WHERE table_name = ?6",
        params![
            bbox.map(|b| b.min_x),
            bbox.map(|b| b.min_y),
            bbox.map(|b| b.max_x),
            bbox.map(|b| b.max_y),
            changed_at.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
            table,
        ],
    )?;
    Ok(bbox)
}

fn select_list() -> String {
    CATALOG_COLUMNS
        .iter()
        .map(|c| c.name)
        .collect::<Vec<_>>()
        .join(", ")
}

/// The active record with this identity.
pub fn find(
    conn: &Connection,
    table: &str,
    identity: &Identity,
) -> Result<Option<InventoryRecord>, DatabaseError> {
    let sql = format!(
        "SELECT {} FROM \"{}\" WHERE file_path = ?1 AND layer_name = ?2 AND retired_datetime IS NULL",
        select_list(),
        table
    );
    let record = conn
        .query_row(
            &sql,
            params![identity.file_path, identity.layer_name],
            record_from_row,
        )
        .optional()?;
    Ok(record)
}

/// Every row ever stored for this identity, oldest first.
pub fn history(
    conn: &Connection,
    table: &str,
    identity: &Identity,
) -> Result<Vec<InventoryRecord>, DatabaseError> {
    let sql = format!(
        "SELECT {} FROM \"{}\" WHERE file_path = ?1 AND layer_name = ?2 ORDER BY fid",
        select_list(),
        table
    );
    let mut stmt = conn.prepare(&sql)?;
    let records = stmt
        .query_map(params![identity.file_path, identity.layer_name], record_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

/// All active records ordered by identity.
pub fn active_records(conn: &Connection, table: &str) -> Result<Vec<InventoryRecord>, DatabaseError> {
    let sql = format!(
        "SELECT {} FROM \"{}\" WHERE retired_datetime IS NULL ORDER BY file_path, layer_name",
        select_list(),
        table
    );
    let mut stmt = conn.prepare(&sql)?;
    let records = stmt
        .query_map([], record_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

pub fn count_active(conn: &Connection, table: &str) -> Result<u64, DatabaseError> {
    let count: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM \"{}\" WHERE retired_datetime IS NULL",
            table
        ),
        [],
        |r| r.get(0),
    )?;
    Ok(u64::try_from(count).unwrap_or(0))
}

fn json_column<T: DeserializeOwned + Default>(row: &Row<'_>, name: &str) -> rusqlite::Result<T> {
    match row.get::<_, Option<String>>(name)? {
        None => Ok(T::default()),
        Some(raw) => serde_json::from_str(&raw).map_err(|e| {
            let index = row.as_ref().column_index(name).unwrap_or(0);
            rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(e))
        }),
    }
}

fn flag_column(row: &Row<'_>, name: &str, default: bool) -> rusqlite::Result<bool> {
    Ok(row.get::<_, Option<bool>>(name)?.unwrap_or(default))
}

fn timestamp_column(row: &Row<'_>, name: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    Ok(row
        .get::<_, Option<String>>(name)?
        .as_deref()
        .and_then(parse_timestamp))
}

fn unsigned<T: TryFrom<i64>>(value: Option<i64>) -> Option<T> {
    value.and_then(|v| T::try_from(v).ok())
}

pub(crate) fn management_from_row(row: &Row<'_>) -> rusqlite::Result<ManagementFields> {
    Ok(ManagementFields {
        status: MetadataStatus::from_db(row.get::<_, Option<String>>("metadata_status")?.as_deref()),
        last_updated: timestamp_column(row, "metadata_last_updated")?,
        target: row.get("metadata_target")?,
        cached: flag_column(row, "metadata_cached", false)?,
    })
}

/// Maps a row selected with every catalog column back into a record.
pub(crate) fn record_from_row(row: &Row<'_>) -> rusqlite::Result<InventoryRecord> {
    let data_type = row
        .get::<_, Option<String>>("data_type")?
        .and_then(|v| v.parse::<DataType>().ok())
        .unwrap_or(DataType::Table);
    let scan_timestamp = timestamp_column(row, "scan_timestamp")?.unwrap_or_default();

    let mut record = InventoryRecord::new(
        Identity::new(
            row.get::<_, String>("file_path")?,
            row.get::<_, String>("layer_name")?,
        ),
        data_type,
        scan_timestamp,
    );
    record.format = row.get::<_, Option<String>>("format")?.unwrap_or_default();
    record.driver_name = row.get::<_, Option<String>>("driver_name")?.unwrap_or_default();

    record.file = FileAttributes {
        relative_path: row.get::<_, Option<String>>("relative_path")?.unwrap_or_default(),
        file_name: row.get::<_, Option<String>>("file_name")?.unwrap_or_default(),
        parent_directory: row.get::<_, Option<String>>("parent_directory")?.unwrap_or_default(),
        directory_depth: unsigned(row.get("directory_depth")?).unwrap_or(0),
        size_bytes: unsigned(row.get("file_size_bytes")?).unwrap_or(0),
        modified: timestamp_column(row, "file_modified")?,
        created: timestamp_column(row, "file_created")?,
    };

    record.provenance = Provenance {
        user: row.get::<_, Option<String>>("scanned_by_user")?.unwrap_or_default(),
        machine: row.get::<_, Option<String>>("scanned_by_machine")?.unwrap_or_default(),
        os: row.get::<_, Option<String>>("scanned_from_os")?.unwrap_or_default(),
        os_version: row.get("scanned_from_os_version")?,
        storage: StorageLocation::from_db(row.get::<_, Option<String>>("storage_location")?.as_deref()),
        network_server: row.get("network_server")?,
        drive_or_mount: row.get("drive_or_mount")?,
    };

    let parse_extent = |name: &str| -> rusqlite::Result<Option<Extent>> {
        Ok(row
            .get::<_, Option<String>>(name)?
            .as_deref()
            .and_then(Extent::parse_text))
    };
    record.spatial = SpatialAttributes {
        crs_authid: row.get("crs_authid")?,
        crs_wkt: row.get("crs_wkt")?,
        native_extent: parse_extent("native_extent")?,
        global_extent: parse_extent("wgs84_extent")?,
        footprint: row
            .get::<_, Option<Vec<u8>>>("geom")?
            .as_deref()
            .and_then(geometry::decode_footprint),
        extent_reprojected: flag_column(row, "extent_reprojected", false)?,
    };

    if row.get::<_, Option<String>>("field_names")?.is_some() {
        let names: Vec<String> = json_column(row, "field_names")?;
        let types: Vec<String> = json_column(row, "field_types")?;
        let fields = names
            .into_iter()
            .enumerate()
            .map(|(i, name)| FieldInfo::new(name, types.get(i).cloned().unwrap_or_default()))
            .collect();
        record.vector = Some(VectorAttributes {
            geometry_type: row.get("geometry_type")?,
            feature_count: unsigned(row.get("feature_count")?),
            fields,
            has_z: flag_column(row, "has_z", false)?,
            has_m: flag_column(row, "has_m", false)?,
        });
    }

    if let Some(width) = row.get::<_, Option<i64>>("raster_width")? {
        let types: Vec<String> = json_column(row, "band_types")?;
        let nodata: Vec<Option<f64>> = json_column(row, "nodata_values")?;
        let bands = types
            .into_iter()
            .enumerate()
            .map(|(i, data_type)| BandInfo {
                data_type,
                nodata: nodata.get(i).copied().flatten(),
            })
            .collect();
        let pixel_width: Option<f64> = row.get("pixel_width")?;
        let pixel_height: Option<f64> = row.get("pixel_height")?;
        record.raster = Some(RasterAttributes {
            width: unsigned(Some(width)).unwrap_or(0),
            height: unsigned(row.get("raster_height")?).unwrap_or(0),
            band_count: unsigned(row.get("band_count")?).unwrap_or(0),
            pixel_size: pixel_width.zip(pixel_height),
            bands,
            compression: row.get("compression")?,
            georeference: GeoreferenceMethod::from_db(
                row.get::<_, Option<String>>("georeference_method")?.as_deref(),
            ),
        });
    }

    if let Some(standard) = row.get::<_, Option<String>>("metadata_standard")? {
        record.descriptive = Some(DescriptiveMetadata {
            standard: MetadataStandard::from_db(&standard),
            document_path: row.get::<_, Option<String>>("metadata_file_path")?.unwrap_or_default(),
            title: row.get("layer_title")?,
            abstract_text: row.get("layer_abstract")?,
            keywords: json_column(row, "keywords")?,
            lineage: row.get("lineage")?,
            constraints: row.get("constraints")?,
            contact: row.get("contact_info")?,
            links: json_column(row, "links")?,
            topic_categories: json_column(row, "topic_categories")?,
        });
    }

    record.sidecars = SidecarFlags {
        has_prj_file: flag_column(row, "has_prj_file", false)?,
        has_world_file: flag_column(row, "has_world_file", false)?,
        has_aux_xml: flag_column(row, "has_aux_xml", false)?,
        has_metadata_xml: flag_column(row, "has_metadata_xml", false)?,
    };

    record.quality = Quality {
        score: row.get::<_, Option<f64>>("quality_score")?.unwrap_or(0.0),
        is_valid: flag_column(row, "is_valid", true)?,
        issues: json_column(row, "issues")?,
    };

    record.management = management_from_row(row)?;
    record.record_created = timestamp_column(row, "record_created")?.unwrap_or(scan_timestamp);
    record.retired_datetime = timestamp_column(row, "retired_datetime")?;
    Ok(record)
}
