//! The normalized inventory record.
//!
//! One `InventoryRecord` describes a single discovered data layer. Fields are
//! grouped by concern (file, provenance, spatial, vector, raster, descriptive,
//! catalog management) so extraction stages can fill their own part and leave
//! the rest untouched.

pub mod quality;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// The `(file_path, layer_name)` pair that identifies a record across rescans.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity {
    pub file_path: String,
    pub layer_name: String,
}

impl Identity {
    pub fn new(file_path: impl Into<String>, layer_name: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            layer_name: layer_name.into(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {}", self.file_path, self.layer_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Vector,
    Raster,
    Table,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Vector => "vector",
            DataType::Raster => "raster",
            DataType::Table => "table",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vector" => Ok(DataType::Vector),
            "raster" => Ok(DataType::Raster),
            "table" => Ok(DataType::Table),
            other => Err(format!("unknown data type '{}'", other)),
        }
    }
}

/// Curation state of a record's descriptive metadata. Owned by the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataStatus {
    #[default]
    None,
    Partial,
    Complete,
}

impl MetadataStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataStatus::None => "none",
            MetadataStatus::Partial => "partial",
            MetadataStatus::Complete => "complete",
        }
    }

    /// Lenient parse used when reading catalog rows: NULL and unknown
    /// values read as `None`.
    pub fn from_db(value: Option<&str>) -> Self {
        match value {
            Some("complete") => MetadataStatus::Complete,
            Some("partial") => MetadataStatus::Partial,
            _ => MetadataStatus::None,
        }
    }
}

impl fmt::Display for MetadataStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Catalog-management fields. Rescans never write these; only the diff
/// engine copies them forward and only the status-update path changes them.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ManagementFields {
    pub status: MetadataStatus,
    pub last_updated: Option<DateTime<Utc>>,
    pub target: Option<String>,
    pub cached: bool,
}

/// Axis-aligned bounding box. Always stored with `min <= max`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extent {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Extent {
    /// Builds an extent from two opposite corners in any order.
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self {
            min_x: x1.min(x2),
            min_y: y1.min(y2),
            max_x: x1.max(x2),
            max_y: y1.max(y2),
        }
    }

    /// Smallest extent covering every point, or `None` for an empty input.
    pub fn from_points<I>(points: I) -> Option<Self>
    where
        I: IntoIterator<Item = (f64, f64)>,
    {
        let mut iter = points.into_iter();
        let (x, y) = iter.next()?;
        let mut extent = Extent::new(x, y, x, y);
        for (x, y) in iter {
            extent.expand_to(x, y);
        }
        Some(extent)
    }

    pub fn expand_to(&mut self, x: f64, y: f64) {
        self.min_x = self.min_x.min(x);
        self.min_y = self.min_y.min(y);
        self.max_x = self.max_x.max(x);
        self.max_y = self.max_y.max(y);
    }

    pub fn union(&self, other: &Extent) -> Extent {
        Extent {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn is_finite(&self) -> bool {
        self.min_x.is_finite()
            && self.min_y.is_finite()
            && self.max_x.is_finite()
            && self.max_y.is_finite()
    }

    /// Corners in ring order: lower-left, lower-right, upper-right, upper-left.
    pub fn corners(&self) -> [(f64, f64); 4] {
        [
            (self.min_x, self.min_y),
            (self.max_x, self.min_y),
            (self.max_x, self.max_y),
            (self.min_x, self.max_y),
        ]
    }

    /// `"xmin,ymin,xmax,ymax"`, the catalog's text form.
    pub fn to_text(&self) -> String {
        format!("{},{},{},{}", self.min_x, self.min_y, self.max_x, self.max_y)
    }

    pub fn parse_text(text: &str) -> Option<Extent> {
        let values: Vec<f64> = text
            .split(',')
            .map(|v| v.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .ok()?;
        match values.as_slice() {
            [x1, y1, x2, y2] => Some(Extent::new(*x1, *y1, *x2, *y2)),
            _ => None,
        }
    }
}

/// Closed five-point rectangle in the global frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Footprint {
    pub ring: [(f64, f64); 5],
}

impl Footprint {
    pub fn from_extent(extent: &Extent) -> Self {
        let [ll, lr, ur, ul] = extent.corners();
        Self {
            ring: [ll, lr, ur, ul, ll],
        }
    }

    pub fn envelope(&self) -> Extent {
        // A ring is never empty, the fallback is unreachable.
        Extent::from_points(self.ring).unwrap_or(Extent::new(0.0, 0.0, 0.0, 0.0))
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FileAttributes {
    pub relative_path: String,
    pub file_name: String,
    pub parent_directory: String,
    pub directory_depth: u32,
    pub size_bytes: u64,
    pub modified: Option<DateTime<Utc>>,
    pub created: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageLocation {
    #[default]
    Local,
    Network,
}

impl StorageLocation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageLocation::Local => "local",
            StorageLocation::Network => "network",
        }
    }

    pub fn from_db(value: Option<&str>) -> Self {
        match value {
            Some("network") => StorageLocation::Network,
            _ => StorageLocation::Local,
        }
    }
}

/// Who scanned a file, from where.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Provenance {
    pub user: String,
    pub machine: String,
    pub os: String,
    pub os_version: Option<String>,
    pub storage: StorageLocation,
    pub network_server: Option<String>,
    /// Drive letter, UNC share root or mount point holding the file.
    pub drive_or_mount: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SpatialAttributes {
    /// `AUTHORITY:CODE`, e.g. `EPSG:32633`.
    pub crs_authid: Option<String>,
    pub crs_wkt: Option<String>,
    pub native_extent: Option<Extent>,
    /// Extent in the catalog frame (EPSG:4326). Holds the native extent
    /// unchanged when `extent_reprojected` is false.
    pub global_extent: Option<Extent>,
    pub footprint: Option<Footprint>,
    pub extent_reprojected: bool,
}

impl SpatialAttributes {
    pub fn has_crs(&self) -> bool {
        self.crs_authid.is_some() || self.crs_wkt.is_some()
    }

    pub fn has_extent(&self) -> bool {
        self.native_extent.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub name: String,
    pub field_type: String,
}

impl FieldInfo {
    pub fn new(name: impl Into<String>, field_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: field_type.into(),
        }
    }
}

/// Vector and table layer details. Tables leave `geometry_type` empty.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VectorAttributes {
    pub geometry_type: Option<String>,
    pub feature_count: Option<u64>,
    pub fields: Vec<FieldInfo>,
    pub has_z: bool,
    pub has_m: bool,
}

impl VectorAttributes {
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }
}

/// How a raster's pixel grid was tied to coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeoreferenceMethod {
    /// Tags inside the file (GeoTIFF keys).
    Embedded,
    /// A plain-text header (ASCII grid).
    Header,
    /// A world file next to the image.
    Sidecar,
    #[default]
    None,
}

impl GeoreferenceMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            GeoreferenceMethod::Embedded => "embedded",
            GeoreferenceMethod::Header => "header",
            GeoreferenceMethod::Sidecar => "sidecar",
            GeoreferenceMethod::None => "none",
        }
    }

    pub fn from_db(value: Option<&str>) -> Self {
        match value {
            Some("embedded") => GeoreferenceMethod::Embedded,
            Some("header") => GeoreferenceMethod::Header,
            Some("sidecar") => GeoreferenceMethod::Sidecar,
            _ => GeoreferenceMethod::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandInfo {
    pub data_type: String,
    pub nodata: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RasterAttributes {
    pub width: u32,
    pub height: u32,
    pub band_count: u32,
    /// Absolute pixel width and height in native units.
    pub pixel_size: Option<(f64, f64)>,
    /// At most the first ten bands.
    pub bands: Vec<BandInfo>,
    pub compression: Option<String>,
    pub georeference: GeoreferenceMethod,
}

/// Recognized metadata document dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetadataStandard {
    Fgdc,
    Esri,
    Iso19115,
    Iso19115_3,
    Qgis,
    Unknown,
}

impl MetadataStandard {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataStandard::Fgdc => "FGDC",
            MetadataStandard::Esri => "ESRI",
            MetadataStandard::Iso19115 => "ISO 19115",
            MetadataStandard::Iso19115_3 => "ISO 19115-3",
            MetadataStandard::Qgis => "QGIS",
            MetadataStandard::Unknown => "Unknown",
        }
    }

    pub fn from_db(value: &str) -> Self {
        match value {
            "FGDC" => MetadataStandard::Fgdc,
            "ESRI" => MetadataStandard::Esri,
            "ISO 19115" => MetadataStandard::Iso19115,
            "ISO 19115-3" => MetadataStandard::Iso19115_3,
            "QGIS" => MetadataStandard::Qgis,
            _ => MetadataStandard::Unknown,
        }
    }
}

impl fmt::Display for MetadataStandard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Descriptive fields parsed from a companion metadata document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptiveMetadata {
    pub standard: MetadataStandard,
    pub document_path: String,
    pub title: Option<String>,
    pub abstract_text: Option<String>,
    pub keywords: Vec<String>,
    pub lineage: Option<String>,
    pub constraints: Option<String>,
    pub contact: Option<String>,
    pub links: Vec<String>,
    pub topic_categories: Vec<String>,
}

impl DescriptiveMetadata {
    pub fn empty(standard: MetadataStandard, document_path: impl Into<String>) -> Self {
        Self {
            standard,
            document_path: document_path.into(),
            title: None,
            abstract_text: None,
            keywords: Vec::new(),
            lineage: None,
            constraints: None,
            contact: None,
            links: Vec::new(),
            topic_categories: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SidecarFlags {
    pub has_prj_file: bool,
    pub has_world_file: bool,
    pub has_aux_xml: bool,
    pub has_metadata_xml: bool,
}

/// Extraction stage an issue came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStage {
    File,
    Driver,
    Fields,
    Crs,
    Extent,
    Transform,
    Validation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    /// A sub-step failed; the field it would have filled is missing.
    Failure,
    /// An observation about the data, e.g. an empty layer.
    Finding,
}

/// A recoverable problem recorded against a single record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionIssue {
    pub stage: IssueStage,
    pub severity: IssueSeverity,
    pub message: String,
}

impl ExtractionIssue {
    pub fn failure(stage: IssueStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            severity: IssueSeverity::Failure,
            message: message.into(),
        }
    }

    pub fn finding(stage: IssueStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            severity: IssueSeverity::Finding,
            message: message.into(),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.severity == IssueSeverity::Failure
    }
}

impl fmt::Display for ExtractionIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quality {
    pub score: f64,
    pub is_valid: bool,
    pub issues: Vec<ExtractionIssue>,
}

impl Default for Quality {
    fn default() -> Self {
        Self {
            score: 0.0,
            is_valid: true,
            issues: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryRecord {
    pub identity: Identity,
    pub data_type: DataType,
    /// Short driver name, e.g. `GTiff`.
    pub format: String,
    /// Long driver name, e.g. `GeoTIFF`.
    pub driver_name: String,
    pub file: FileAttributes,
    pub provenance: Provenance,
    pub spatial: SpatialAttributes,
    pub vector: Option<VectorAttributes>,
    pub raster: Option<RasterAttributes>,
    pub descriptive: Option<DescriptiveMetadata>,
    pub sidecars: SidecarFlags,
    pub quality: Quality,
    pub management: ManagementFields,
    pub record_created: DateTime<Utc>,
    pub scan_timestamp: DateTime<Utc>,
    pub retired_datetime: Option<DateTime<Utc>>,
}

impl InventoryRecord {
    /// A bare record with every optional part empty.
    pub fn new(
        identity: Identity,
        data_type: DataType,
        scan_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            identity,
            data_type,
            format: String::new(),
            driver_name: String::new(),
            file: FileAttributes::default(),
            provenance: Provenance::default(),
            spatial: SpatialAttributes::default(),
            vector: None,
            raster: None,
            descriptive: None,
            sidecars: SidecarFlags::default(),
            quality: Quality::default(),
            management: ManagementFields::default(),
            record_created: scan_timestamp,
            scan_timestamp,
            retired_datetime: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.retired_datetime.is_none()
    }

    pub fn add_issue(&mut self, issue: ExtractionIssue) {
        self.quality.issues.push(issue);
    }

    /// True when any sub-step of the extraction failed.
    pub fn has_failures(&self) -> bool {
        self.quality.issues.iter().any(ExtractionIssue::is_failure)
    }
}

/// Formats a timestamp for storage in the catalog.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

/// Parses catalog timestamps written either as RFC 3339 or by SQLite's
/// `datetime('now')`.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
        .map(|naive| naive.and_utc())
}
