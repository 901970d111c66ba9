//! Writers for small but real geospatial files.
//!
//! Every fixture is produced byte by byte (or through the `tiff` encoder and
//! rusqlite) so the scan exercises the same drivers it uses in production.

#![allow(dead_code)]

use std::fs::File;
use std::path::{Path, PathBuf};

use rusqlite::Connection;
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;

pub const WGS84_PRJ: &str = r#"GEOGCS["GCS_WGS_1984",DATUM["D_WGS_1984",SPHEROID["WGS_1984",6378137.0,298.257223563]],PRIMEM["Greenwich",0.0],UNIT["Degree",0.0174532925199433]]"#;

const SHP_HEADER_LEN: usize = 100;
const POINT_RECORD_LEN: usize = 28;

const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const GEO_KEY_DIRECTORY: u16 = 34735;
const GDAL_NODATA: u16 = 42113;
const KEY_GEOGRAPHIC_TYPE: u16 = 2048;
const KEY_PROJECTED_CS_TYPE: u16 = 3072;

fn shp_header(shape_type: i32, bbox: [f64; 4], file_len: usize) -> Vec<u8> {
    let mut out = vec![0u8; SHP_HEADER_LEN];
    out[0..4].copy_from_slice(&9994i32.to_be_bytes());
    out[24..28].copy_from_slice(&((file_len / 2) as i32).to_be_bytes());
    out[28..32].copy_from_slice(&1000i32.to_le_bytes());
    out[32..36].copy_from_slice(&shape_type.to_le_bytes());
    for (i, v) in bbox.iter().enumerate() {
        out[36 + i * 8..44 + i * 8].copy_from_slice(&v.to_le_bytes());
    }
    out
}

fn bbox(points: &[(f64, f64)]) -> [f64; 4] {
    let mut b = [f64::MAX, f64::MAX, f64::MIN, f64::MIN];
    for (x, y) in points {
        b[0] = b[0].min(*x);
        b[1] = b[1].min(*y);
        b[2] = b[2].max(*x);
        b[3] = b[3].max(*y);
    }
    b
}

/// dBase III table. Fields are `(name, type, length, decimals)`.
pub fn dbf_bytes(fields: &[(&str, u8, u8, u8)], rows: &[Vec<String>]) -> Vec<u8> {
    let record_len: usize = 1 + fields.iter().map(|f| f.2 as usize).sum::<usize>();
    let header_len = 32 + fields.len() * 32 + 1;
    let mut out = vec![0u8; 32];
    out[0] = 0x03;
    out[1..4].copy_from_slice(&[124, 1, 1]);
    out[4..8].copy_from_slice(&(rows.len() as u32).to_le_bytes());
    out[8..10].copy_from_slice(&(header_len as u16).to_le_bytes());
    out[10..12].copy_from_slice(&(record_len as u16).to_le_bytes());
    for (name, kind, length, decimals) in fields {
        let mut descriptor = [0u8; 32];
        descriptor[..name.len()].copy_from_slice(name.as_bytes());
        descriptor[11] = *kind;
        descriptor[16] = *length;
        descriptor[17] = *decimals;
        out.extend_from_slice(&descriptor);
    }
    out.push(0x0d);
    for row in rows {
        out.push(b' ');
        for ((_, _, length, _), value) in fields.iter().zip(row) {
            let mut cell = value.as_bytes().to_vec();
            cell.resize(*length as usize, b' ');
            out.extend_from_slice(&cell);
        }
    }
    out.push(0x1a);
    out
}

/// Point shapefile `<dir>/<stem>.shp` with `.shx`, `.dbf` and optional
/// `.prj`. Returns the `.shp` path.
pub fn point_shapefile(dir: &Path, stem: &str, points: &[(f64, f64)], prj: Option<&str>) -> PathBuf {
    let file_len = SHP_HEADER_LEN + points.len() * POINT_RECORD_LEN;
    let header = shp_header(1, bbox(points), file_len);

    let mut shp = header.clone();
    let mut shx = shp_header(1, bbox(points), SHP_HEADER_LEN + points.len() * 8);
    for (i, (x, y)) in points.iter().enumerate() {
        let offset = SHP_HEADER_LEN + i * POINT_RECORD_LEN;
        shx.extend_from_slice(&((offset / 2) as i32).to_be_bytes());
        shx.extend_from_slice(&10i32.to_be_bytes());

        shp.extend_from_slice(&((i + 1) as i32).to_be_bytes());
        shp.extend_from_slice(&10i32.to_be_bytes());
        shp.extend_from_slice(&1i32.to_le_bytes());
        shp.extend_from_slice(&x.to_le_bytes());
        shp.extend_from_slice(&y.to_le_bytes());
    }

    let rows: Vec<Vec<String>> = (0..points.len())
        .map(|i| vec![format!("{}", i + 1), format!("site{}", i + 1)])
        .collect();
    let dbf = dbf_bytes(&[("ID", b'N', 6, 0), ("NAME", b'C', 12, 0)], &rows);

    let shp_path = dir.join(format!("{}.shp", stem));
    std::fs::write(&shp_path, shp).unwrap();
    std::fs::write(dir.join(format!("{}.shx", stem)), shx).unwrap();
    std::fs::write(dir.join(format!("{}.dbf", stem)), dbf).unwrap();
    if let Some(prj) = prj {
        std::fs::write(dir.join(format!("{}.prj", stem)), prj).unwrap();
    }
    shp_path
}

/// `count` points on a small grid around (10, 50).
pub fn grid_points(count: usize) -> Vec<(f64, f64)> {
    (0..count)
        .map(|i| (10.0 + (i % 10) as f64 * 0.1, 50.0 + (i / 10) as f64 * 0.1))
        .collect()
}

pub fn geojson_points(dir: &Path, name: &str, points: &[(f64, f64)]) -> PathBuf {
    let features: Vec<serde_json::Value> = points
        .iter()
        .enumerate()
        .map(|(i, (x, y))| {
            serde_json::json!({
                "type": "Feature",
                "properties": { "id": i, "label": format!("p{}", i) },
                "geometry": { "type": "Point", "coordinates": [x, y] }
            })
        })
        .collect();
    let doc = serde_json::json!({ "type": "FeatureCollection", "features": features });
    let path = dir.join(name);
    std::fs::write(&path, serde_json::to_string_pretty(&doc).unwrap()).unwrap();
    path
}

pub struct TiffSpec {
    pub width: u32,
    pub height: u32,
    /// 1 writes Gray8, 3 writes RGB8.
    pub bands: u8,
    pub origin: (f64, f64),
    pub pixel: f64,
    pub epsg: Option<u16>,
}

impl Default for TiffSpec {
    fn default() -> Self {
        Self {
            width: 4,
            height: 3,
            bands: 1,
            origin: (500000.0, 4600000.0),
            pixel: 10.0,
            epsg: Some(32633),
        }
    }
}

macro_rules! write_georeferenced {
    ($encoder:expr, $color:ty, $spec:expr, $samples:expr) => {{
        let spec = $spec;
        let mut image = $encoder.new_image::<$color>(spec.width, spec.height).unwrap();
        image
            .encoder()
            .write_tag(
                Tag::from_u16_exhaustive(MODEL_PIXEL_SCALE),
                &[spec.pixel, spec.pixel, 0.0][..],
            )
            .unwrap();
        image
            .encoder()
            .write_tag(
                Tag::from_u16_exhaustive(MODEL_TIEPOINT),
                &[0.0, 0.0, 0.0, spec.origin.0, spec.origin.1, 0.0][..],
            )
            .unwrap();
        if let Some(code) = spec.epsg {
            let key = if code == 4326 { KEY_GEOGRAPHIC_TYPE } else { KEY_PROJECTED_CS_TYPE };
            image
                .encoder()
                .write_tag(
                    Tag::from_u16_exhaustive(GEO_KEY_DIRECTORY),
                    &[1u16, 1, 0, 1, key, 0, 1, code][..],
                )
                .unwrap();
        }
        image
            .encoder()
            .write_tag(Tag::from_u16_exhaustive(GDAL_NODATA), "0")
            .unwrap();
        let data = vec![9u8; (spec.width * spec.height) as usize * $samples];
        image.write_data(&data).unwrap();
    }};
}

pub fn geotiff(path: &Path, spec: &TiffSpec) -> PathBuf {
    let mut file = File::create(path).unwrap();
    let mut encoder = TiffEncoder::new(&mut file).unwrap();
    match spec.bands {
        3 => write_georeferenced!(encoder, colortype::RGB8, spec, 3),
        _ => write_georeferenced!(encoder, colortype::Gray8, spec, 1),
    }
    path.to_path_buf()
}

pub fn ascii_grid(path: &Path) -> PathBuf {
    std::fs::write(
        path,
        "ncols 3\nnrows 2\nxllcorner 100.0\nyllcorner 200.0\ncellsize 5\nNODATA_value -9999\n1 2 3\n4 5 -9999\n",
    )
    .unwrap();
    path.to_path_buf()
}

pub fn csv_table(path: &Path) -> PathBuf {
    std::fs::write(path, "id,name,value\n1,alpha,1.5\n2,beta,2\n").unwrap();
    path.to_path_buf()
}

/// Bytes no driver accepts.
pub fn junk(path: &Path) -> PathBuf {
    let bytes: Vec<u8> = (0..512u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect();
    std::fs::write(path, bytes).unwrap();
    path.to_path_buf()
}

/// GeoPackage with one point feature table per entry of `layers`.
pub fn geopackage(path: &Path, layers: &[&str]) -> PathBuf {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch(
        "PRAGMA application_id = 1196444487;
         CREATE TABLE gpkg_spatial_ref_sys (
            srs_name TEXT NOT NULL, srs_id INTEGER PRIMARY KEY,
            organization TEXT NOT NULL, organization_coordsys_id INTEGER NOT NULL,
            definition TEXT NOT NULL, description TEXT);
         INSERT INTO gpkg_spatial_ref_sys VALUES
            ('WGS 84', 4326, 'EPSG', 4326, 'GEOGCS[\"WGS 84\",AUTHORITY[\"EPSG\",\"4326\"]]', NULL);
         CREATE TABLE gpkg_contents (
            table_name TEXT PRIMARY KEY, data_type TEXT NOT NULL, identifier TEXT,
            description TEXT, last_change TEXT, min_x DOUBLE, min_y DOUBLE,
            max_x DOUBLE, max_y DOUBLE, srs_id INTEGER);
         CREATE TABLE gpkg_geometry_columns (
            table_name TEXT, column_name TEXT, geometry_type_name TEXT,
            srs_id INTEGER, z TINYINT, m TINYINT);",
    )
    .unwrap();
    for (i, layer) in layers.iter().enumerate() {
        let offset = i as f64;
        conn.execute_batch(&format!(
            "CREATE TABLE \"{l}\" (fid INTEGER PRIMARY KEY, geom BLOB, name TEXT);
             INSERT INTO gpkg_contents VALUES
                ('{l}', 'features', '{l}', '', '', {x0}, 50.0, {x1}, 51.0, 4326);
             INSERT INTO gpkg_geometry_columns VALUES ('{l}', 'geom', 'POINT', 4326, 0, 0);",
            l = layer,
            x0 = 10.0 + offset,
            x1 = 11.0 + offset,
        ))
        .unwrap();
        for (x, y) in [(10.0 + offset, 50.0), (11.0 + offset, 51.0)] {
            conn.execute(
                &format!("INSERT INTO \"{}\" (geom, name) VALUES (?1, 'f')", layer),
                [gpkg_point(x, y)],
            )
            .unwrap();
        }
    }
    path.to_path_buf()
}

/// GeoPackage binary point with an XY envelope, SRS 4326.
fn gpkg_point(x: f64, y: f64) -> Vec<u8> {
    let mut out = vec![b'G', b'P', 0, 0b0000_0011];
    out.extend_from_slice(&4326i32.to_le_bytes());
    for v in [x, x, y, y] {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out.push(1);
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&x.to_le_bytes());
    out.extend_from_slice(&y.to_le_bytes());
    out
}

/// FGDC document with a title and one keyword.
pub fn fgdc_document(path: &Path, title: &str) -> PathBuf {
    std::fs::write(
        path,
        format!(
            "<metadata><idinfo><citation><citeinfo><title>{}</title></citeinfo></citation>\
             <descript><abstract>Fixture dataset.</abstract></descript>\
             <keywords><theme><themekey>fixtures</themekey></theme></keywords>\
             </idinfo></metadata>",
            title
        ),
    )
    .unwrap();
    path.to_path_buf()
}
