//! ESRI Shapefile: `.shp` geometry, `.shx` index, `.dbf` attributes and
//! `.prj` spatial reference.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use super::dbf::DbfHeader;
use super::{
    extension, file_stem, geometry_type_name, ring_is_valid, validate_vector, DatasetDriver,
    DriverError, DriverFamily, DriverLayer, FeatureSample, LayerReport, ProbeOptions,
};
use crate::record::{DataType, Extent, IssueStage, VectorAttributes};
use crate::sidecar;

const FORMAT: &str = "ESRI Shapefile";
const FILE_CODE: i32 = 9994;
const VERSION: i32 = 1000;
const HEADER_LEN: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ShapeType {
    Null,
    Point,
    PolyLine,
    Polygon,
    MultiPoint,
    MultiPatch,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ShpHeader {
    pub file_len_bytes: u64,
    pub shape: ShapeType,
    pub has_z: bool,
    pub has_m: bool,
    pub bbox: [f64; 4],
}

impl ShpHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, DriverError> {
        if bytes.len() < HEADER_LEN {
            return Err(DriverError::malformed(FORMAT, "header truncated"));
        }
        let code = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if code != FILE_CODE {
            return Err(DriverError::NotRecognized);
        }
        let words = i32::from_be_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]);
        let version = i32::from_le_bytes([bytes[28], bytes[29], bytes[30], bytes[31]]);
        if version != VERSION {
            return Err(DriverError::malformed(FORMAT, format!("unsupported version {}", version)));
        }
        let type_code = i32::from_le_bytes([bytes[32], bytes[33], bytes[34], bytes[35]]);
        let (shape, has_z, has_m) = match type_code {
            0 => (ShapeType::Null, false, false),
            1 => (ShapeType::Point, false, false),
            3 => (ShapeType::PolyLine, false, false),
            5 => (ShapeType::Polygon, false, false),
            8 => (ShapeType::MultiPoint, false, false),
            11 => (ShapeType::Point, true, false),
            13 => (ShapeType::PolyLine, true, false),
            15 => (ShapeType::Polygon, true, false),
            18 => (ShapeType::MultiPoint, true, false),
            21 => (ShapeType::Point, false, true),
            23 => (ShapeType::PolyLine, false, true),
            25 => (ShapeType::Polygon, false, true),
            28 => (ShapeType::MultiPoint, false, true),
            31 => (ShapeType::MultiPatch, true, false),
            other => {
                return Err(DriverError::malformed(FORMAT, format!("unknown shape type {}", other)))
            }
        };
        let mut bbox = [0.0; 4];
        for (i, value) in bbox.iter_mut().enumerate() {
            let at = 36 + i * 8;
            *value = f64::from_le_bytes(read8(&bytes[at..at + 8]));
        }
        Ok(Self {
            file_len_bytes: u64::from(words.max(0) as u32) * 2,
            shape,
            has_z,
            has_m,
            bbox,
        })
    }

    pub fn geometry_type(&self) -> Option<String> {
        let base = match self.shape {
            ShapeType::Null => return None,
            ShapeType::Point => "Point",
            ShapeType::PolyLine => "Line String",
            ShapeType::Polygon => "Polygon",
            ShapeType::MultiPoint => "Multi Point",
            ShapeType::MultiPatch => "Multi Polygon",
        };
        Some(geometry_type_name(base, self.has_z, self.has_m))
    }

    /// Header bounding box, or `None` for an empty file or a bogus box.
    pub fn extent(&self, feature_count: u64) -> Option<Extent> {
        let [min_x, min_y, max_x, max_y] = self.bbox;
        let all_zero = self.bbox.iter().all(|v| *v == 0.0);
        if feature_count == 0 && all_zero {
            return None;
        }
        let extent = Extent::new(min_x, min_y, max_x, max_y);
        let sane = extent.is_finite() && min_x <= max_x && min_y <= max_y && min_x > -1e38;
        sane.then_some(extent)
    }
}

fn read8(bytes: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&bytes[..8]);
    out
}

fn sibling(path: &Path, ext: &str) -> Option<PathBuf> {
    [ext.to_ascii_lowercase(), ext.to_ascii_uppercase()]
        .into_iter()
        .map(|e| path.with_extension(e))
        .find(|p| p.is_file())
}

/// Record count from the `.shx` index: fixed 8-byte entries after the header.
fn count_from_index(shx: &Path) -> Result<u64, DriverError> {
    let len = std::fs::metadata(shx)?.len();
    if len < HEADER_LEN as u64 {
        return Err(DriverError::malformed(FORMAT, "index truncated"));
    }
    Ok((len - HEADER_LEN as u64) / 8)
}

/// Record count by walking the `.shp` record headers.
fn count_from_records(shp: &Path, header: &ShpHeader) -> Result<u64, DriverError> {
    let mut file = File::open(shp)?;
    let end = header.file_len_bytes.min(file.metadata()?.len());
    let mut offset = HEADER_LEN as u64;
    let mut count = 0;
    let mut record_header = [0u8; 8];
    while offset + 8 <= end {
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut record_header)?;
        let words = i32::from_be_bytes([
            record_header[4],
            record_header[5],
            record_header[6],
            record_header[7],
        ]);
        if words < 0 {
            return Err(DriverError::malformed(FORMAT, "negative record length"));
        }
        offset += 8 + u64::from(words as u32) * 2;
        count += 1;
    }
    Ok(count)
}

fn le_i32(bytes: &[u8], at: usize) -> Option<i32> {
    bytes
        .get(at..at + 4)
        .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn le_f64(bytes: &[u8], at: usize) -> Option<f64> {
    bytes.get(at..at + 8).map(|b| f64::from_le_bytes(read8(b)))
}

/// Reads the first record and checks its geometry.
fn sample_first_shape(shp: &Path) -> FeatureSample {
    let read = || -> Result<Vec<u8>, std::io::Error> {
        let mut file = File::open(shp)?;
        file.seek(SeekFrom::Start(HEADER_LEN as u64))?;
        let mut record_header = [0u8; 8];
        file.read_exact(&mut record_header)?;
        let words = i32::from_be_bytes([
            record_header[4],
            record_header[5],
            record_header[6],
            record_header[7],
        ]);
        let len = (words.max(0) as u64) * 2;
        if len > file.metadata()?.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "record extends past end of file",
            ));
        }
        let mut content = vec![0u8; len as usize];
        file.read_exact(&mut content)?;
        Ok(content)
    };
    let content = match read() {
        Ok(content) => content,
        Err(_) => return FeatureSample::Unreadable,
    };
    match check_shape(&content) {
        Some(sample) => sample,
        None => FeatureSample::Unreadable,
    }
}

/// `None` when the content is too short for its declared shape.
fn check_shape(content: &[u8]) -> Option<FeatureSample> {
    let code = le_i32(content, 0)?;
    match code {
        0 => Some(FeatureSample::NoGeometry),
        1 | 11 | 21 => {
            let x = le_f64(content, 4)?;
            let y = le_f64(content, 12)?;
            Some(FeatureSample::Geometry {
                valid: x.is_finite() && y.is_finite(),
            })
        }
        8 | 18 | 28 => {
            let points = le_i32(content, 36)?;
            Some(FeatureSample::Geometry { valid: points >= 1 })
        }
        31 => {
            let points = le_i32(content, 40)?;
            Some(FeatureSample::Geometry { valid: points >= 3 })
        }
        3 | 13 | 23 | 5 | 15 | 25 => {
            let parts = le_i32(content, 36)?;
            let points = le_i32(content, 40)?;
            if parts < 1 || points < 1 {
                return Some(FeatureSample::Geometry { valid: false });
            }
            if parts as usize > content.len() / 4 || points as usize > content.len() / 16 {
                return None;
            }
            let mut starts = Vec::with_capacity(parts as usize);
            for i in 0..parts as usize {
                starts.push(le_i32(content, 44 + i * 4)?.max(0) as usize);
            }
            let points_at = 44 + parts as usize * 4;
            let mut xy = Vec::with_capacity(points as usize);
            for i in 0..points as usize {
                let at = points_at + i * 16;
                xy.push((le_f64(content, at)?, le_f64(content, at + 8)?));
            }
            let valid = match code {
                3 | 13 | 23 => part_slices(&starts, &xy).all(|part| part.len() >= 2),
                _ => part_slices(&starts, &xy).all(ring_is_valid),
            };
            Some(FeatureSample::Geometry { valid })
        }
        _ => None,
    }
}

fn part_slices<'a>(
    starts: &'a [usize],
    points: &'a [(f64, f64)],
) -> impl Iterator<Item = &'a [(f64, f64)]> + 'a {
    starts.iter().enumerate().map(move |(i, start)| {
        let end = starts.get(i + 1).copied().unwrap_or(points.len());
        let start = (*start).min(points.len());
        &points[start..end.max(start).min(points.len())]
    })
}

pub struct ShapefileDriver;

impl DatasetDriver for ShapefileDriver {
    fn short_name(&self) -> &'static str {
        "ESRI Shapefile"
    }

    fn long_name(&self) -> &'static str {
        "ESRI Shapefile"
    }

    fn family(&self) -> DriverFamily {
        DriverFamily::Vector
    }

    fn open(&self, path: &Path, options: &ProbeOptions) -> Result<Vec<DriverLayer>, DriverError> {
        if extension(path).as_deref() != Some("shp") {
            return Err(DriverError::NotRecognized);
        }
        let mut bytes = [0u8; HEADER_LEN];
        File::open(path)?
            .read_exact(&mut bytes)
            .map_err(|_| DriverError::malformed(FORMAT, "header truncated"))?;
        let header = ShpHeader::parse(&bytes)?;

        let mut report = LayerReport::default();
        let dbf = sibling(path, "dbf");
        let table = match &dbf {
            Some(dbf) => match DbfHeader::read(dbf) {
                Ok(table) => Some(table),
                Err(e) => {
                    report.fail(IssueStage::Fields, format!("Cannot read attribute table: {}", e));
                    None
                }
            },
            None => {
                report.fail(IssueStage::Fields, "Missing .dbf attribute table");
                None
            }
        };

        let feature_count = match (&table, sibling(path, "shx")) {
            (Some(table), _) => Some(u64::from(table.record_count)),
            (None, Some(shx)) => count_from_index(&shx).ok(),
            (None, None) => count_from_records(path, &header).ok(),
        };
        if feature_count.is_none() {
            report.fail(IssueStage::Driver, "Cannot count features");
        }

        report.crs = sidecar::read_prj(path);
        report.native_extent = header.extent(feature_count.unwrap_or(0));

        let is_table = header.shape == ShapeType::Null;
        report.vector = Some(VectorAttributes {
            geometry_type: header.geometry_type(),
            feature_count,
            fields: table.as_ref().map(DbfHeader::field_infos).unwrap_or_default(),
            has_z: header.has_z,
            has_m: header.has_m,
        });

        if options.validate {
            validate_vector(&mut report, is_table, feature_count.unwrap_or(0), || {
                sample_first_shape(path)
            });
        }

        Ok(vec![DriverLayer {
            name: file_stem(path),
            data_type: if is_table { DataType::Table } else { DataType::Vector },
            report,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::dbf::tests::dbf_bytes;
    use tempfile::TempDir;

    fn header_bytes(shape_type: i32, bbox: [f64; 4], file_len: usize) -> Vec<u8> {
        let mut out = vec![0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&FILE_CODE.to_be_bytes());
        out[24..28].copy_from_slice(&((file_len / 2) as i32).to_be_bytes());
        out[28..32].copy_from_slice(&VERSION.to_le_bytes());
        out[32..36].copy_from_slice(&shape_type.to_le_bytes());
        for (i, v) in bbox.iter().enumerate() {
            out[36 + i * 8..44 + i * 8].copy_from_slice(&v.to_le_bytes());
        }
        out
    }

    fn point_shp(points: &[(f64, f64)]) -> Vec<u8> {
        let extent = Extent::from_points(points.iter().copied()).unwrap();
        let len = HEADER_LEN + points.len() * 28;
        let mut out = header_bytes(1, [extent.min_x, extent.min_y, extent.max_x, extent.max_y], len);
        for (i, (x, y)) in points.iter().enumerate() {
            out.extend_from_slice(&((i + 1) as i32).to_be_bytes());
            out.extend_from_slice(&10i32.to_be_bytes());
            out.extend_from_slice(&1i32.to_le_bytes());
            out.extend_from_slice(&x.to_le_bytes());
            out.extend_from_slice(&y.to_le_bytes());
        }
        out
    }

    #[test]
    fn test_parse_header() {
        let header = ShpHeader::parse(&header_bytes(15, [1.0, 2.0, 3.0, 4.0], 100)).unwrap();
        assert_eq!(header.shape, ShapeType::Polygon);
        assert!(header.has_z);
        assert_eq!(header.geometry_type().as_deref(), Some("3D Polygon"));
        assert_eq!(header.extent(1), Some(Extent::new(1.0, 2.0, 3.0, 4.0)));
    }

    #[test]
    fn test_wrong_file_code_is_not_recognized() {
        let mut bytes = header_bytes(1, [0.0; 4], 100);
        bytes[3] = 0;
        assert!(matches!(ShpHeader::parse(&bytes), Err(DriverError::NotRecognized)));
    }

    #[test]
    fn test_empty_header_box_has_no_extent() {
        let header = ShpHeader::parse(&header_bytes(1, [0.0; 4], 100)).unwrap();
        assert_eq!(header.extent(0), None);
    }

    #[test]
    fn test_check_polygon_ring() {
        let mut content = Vec::new();
        content.extend_from_slice(&5i32.to_le_bytes());
        for v in [0.0f64, 0.0, 1.0, 1.0] {
            content.extend_from_slice(&v.to_le_bytes());
        }
        content.extend_from_slice(&1i32.to_le_bytes());
        content.extend_from_slice(&5i32.to_le_bytes());
        content.extend_from_slice(&0i32.to_le_bytes());
        for (x, y) in [(0.0f64, 0.0f64), (0.0, 1.0), (1.0, 1.0), (1.0, 0.0), (0.0, 0.0)] {
            content.extend_from_slice(&x.to_le_bytes());
            content.extend_from_slice(&y.to_le_bytes());
        }
        assert_eq!(check_shape(&content), Some(FeatureSample::Geometry { valid: true }));

        // Open ring.
        let len = content.len();
        content[len - 16..len - 8].copy_from_slice(&0.5f64.to_le_bytes());
        assert_eq!(check_shape(&content), Some(FeatureSample::Geometry { valid: false }));
    }

    #[test]
    fn test_open_point_shapefile() {
        let dir = TempDir::new().unwrap();
        let shp = dir.path().join("wells.shp");
        std::fs::write(&shp, point_shp(&[(10.0, 50.0), (11.0, 51.0), (12.0, 49.5)])).unwrap();
        std::fs::write(
            dir.path().join("wells.dbf"),
            dbf_bytes(
                &[("NAME", b'C', 8, 0), ("DEPTH", b'N', 6, 1)],
                &[vec!["a", "1.0"], vec!["b", "2.0"], vec!["c", "3.5"]],
            ),
        )
        .unwrap();
        std::fs::write(
            dir.path().join("wells.prj"),
            r#"GEOGCS["GCS_WGS_1984",DATUM["D_WGS_1984",SPHEROID["WGS_1984",6378137.0,298.257223563]],PRIMEM["Greenwich",0.0],UNIT["Degree",0.0174532925199433]]"#,
        )
        .unwrap();

        let layers = ShapefileDriver
            .open(&shp, &ProbeOptions { validate: true })
            .unwrap();
        assert_eq!(layers.len(), 1);
        let layer = &layers[0];
        assert_eq!(layer.name, "wells");
        assert_eq!(layer.data_type, DataType::Vector);
        let vector = layer.report.vector.as_ref().unwrap();
        assert_eq!(vector.feature_count, Some(3));
        assert_eq!(vector.geometry_type.as_deref(), Some("Point"));
        assert_eq!(vector.field_count(), 2);
        assert_eq!(layer.report.native_extent, Some(Extent::new(10.0, 49.5, 12.0, 51.0)));
        assert_eq!(layer.report.crs.as_ref().and_then(|c| c.epsg_code()), Some(4326));
        assert!(layer.report.issues.is_empty());
    }

    #[test]
    fn test_missing_dbf_degrades_record() {
        let dir = TempDir::new().unwrap();
        let shp = dir.path().join("orphan.shp");
        std::fs::write(&shp, point_shp(&[(1.0, 2.0)])).unwrap();

        let layers = ShapefileDriver.open(&shp, &ProbeOptions::default()).unwrap();
        let report = &layers[0].report;
        assert!(report.issues.iter().any(|i| i.is_failure()));
        assert_eq!(report.vector.as_ref().unwrap().feature_count, Some(1));
        assert!(report.vector.as_ref().unwrap().fields.is_empty());
    }
}
