//! Format sniffing.
//!
//! A [`DriverRegistry`] holds one [`DatasetDriver`] per supported format.
//! [`FormatProbe`] asks the vector family first and the raster family second;
//! the first driver that opens a file describes every layer it contains in a
//! single pass. A file no driver can open is [`ProbeOutcome::NoDataSource`],
//! which is not an error.

pub mod ascii_grid;
pub mod csv;
pub mod dbf;
pub mod geojson;
pub mod geopackage;
pub mod geotiff;
pub mod image;
pub mod shapefile;

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::crs::CrsDefinition;
use crate::record::{
    DataType, ExtractionIssue, Extent, IssueStage, RasterAttributes, VectorAttributes,
};

/// Maximum number of bands whose type and no-data value are reported.
pub const MAX_REPORTED_BANDS: usize = 10;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("not recognized")]
    NotRecognized,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed {format}: {reason}")]
    Malformed { format: &'static str, reason: String },
}

impl DriverError {
    pub(crate) fn malformed(format: &'static str, reason: impl Into<String>) -> Self {
        DriverError::Malformed {
            format,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverFamily {
    Vector,
    Raster,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProbeOptions {
    /// Read the first feature or data block and record validation findings.
    pub validate: bool,
}

/// Everything a driver learned about one layer.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerReport {
    pub crs: Option<CrsDefinition>,
    pub native_extent: Option<Extent>,
    pub vector: Option<VectorAttributes>,
    pub raster: Option<RasterAttributes>,
    pub issues: Vec<ExtractionIssue>,
    pub valid: bool,
}

impl Default for LayerReport {
    fn default() -> Self {
        Self {
            crs: None,
            native_extent: None,
            vector: None,
            raster: None,
            issues: Vec::new(),
            valid: true,
        }
    }
}

impl LayerReport {
    pub fn fail(&mut self, stage: IssueStage, message: impl Into<String>) {
        self.issues.push(ExtractionIssue::failure(stage, message));
    }

    pub fn note(&mut self, stage: IssueStage, message: impl Into<String>) {
        self.issues.push(ExtractionIssue::finding(stage, message));
    }
}

/// A layer as returned by a driver.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverLayer {
    pub name: String,
    pub data_type: DataType,
    pub report: LayerReport,
}

pub trait DatasetDriver: Send + Sync {
    /// Short name stored as the record's format, e.g. `GTiff`.
    fn short_name(&self) -> &'static str;

    fn long_name(&self) -> &'static str;

    fn family(&self) -> DriverFamily;

    /// Opens `path` and describes its layers. Returns
    /// [`DriverError::NotRecognized`] for files of another format.
    fn open(&self, path: &Path, options: &ProbeOptions) -> Result<Vec<DriverLayer>, DriverError>;
}

/// One probed layer, tagged with the driver that opened it.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub path: PathBuf,
    pub layer_name: String,
    pub data_type: DataType,
    pub format: String,
    pub driver_name: String,
    pub report: LayerReport,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    /// A driver opened the file. The list may be empty when every layer was
    /// filtered out.
    Opened(Vec<ProbeResult>),
    /// No driver could open the file.
    NoDataSource,
}

impl ProbeOutcome {
    pub fn into_results(self) -> Vec<ProbeResult> {
        match self {
            ProbeOutcome::Opened(results) => results,
            ProbeOutcome::NoDataSource => Vec::new(),
        }
    }
}

pub struct DriverRegistry {
    drivers: Vec<Box<dyn DatasetDriver>>,
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverRegistry {
    /// Registry with every built-in driver.
    pub fn new() -> Self {
        let mut drivers: Vec<Box<dyn DatasetDriver>> = vec![
            Box::new(shapefile::ShapefileDriver),
            Box::new(dbf::DbfDriver),
            Box::new(geojson::GeoJsonDriver),
            Box::new(geopackage::GeoPackageDriver),
            Box::new(csv::CsvDriver),
            Box::new(geotiff::GeoTiffDriver),
            Box::new(ascii_grid::AsciiGridDriver),
        ];
        for driver in image::ImageDriver::all() {
            drivers.push(Box::new(driver));
        }
        Self { drivers }
    }

    pub fn empty() -> Self {
        Self {
            drivers: Vec::new(),
        }
    }

    pub fn register(&mut self, driver: Box<dyn DatasetDriver>) {
        self.drivers.push(driver);
    }

    pub fn drivers(&self, family: DriverFamily) -> impl Iterator<Item = &dyn DatasetDriver> + '_ {
        self.drivers
            .iter()
            .map(|d| d.as_ref())
            .filter(move |d| d.family() == family)
    }

    /// First driver in `family` that opens `path`.
    fn open_with(
        &self,
        family: DriverFamily,
        path: &Path,
        options: &ProbeOptions,
    ) -> Option<(&dyn DatasetDriver, Vec<DriverLayer>)> {
        for driver in self.drivers(family) {
            match driver.open(path, options) {
                Ok(layers) => return Some((driver, layers)),
                Err(DriverError::NotRecognized) => {}
                Err(e) => {
                    log::debug!("{} cannot open {}: {}", driver.short_name(), path.display(), e);
                }
            }
        }
        None
    }
}

/// Which logical types a scan catalogs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeFilter {
    pub include_vectors: bool,
    pub include_rasters: bool,
    pub include_tables: bool,
}

impl Default for ProbeFilter {
    fn default() -> Self {
        Self {
            include_vectors: true,
            include_rasters: true,
            include_tables: true,
        }
    }
}

impl ProbeFilter {
    fn accepts(&self, data_type: DataType) -> bool {
        match data_type {
            DataType::Vector => self.include_vectors,
            DataType::Table => self.include_tables,
            DataType::Raster => self.include_rasters,
        }
    }
}

pub struct FormatProbe {
    registry: DriverRegistry,
    filter: ProbeFilter,
    options: ProbeOptions,
}

impl FormatProbe {
    pub fn new(registry: DriverRegistry, filter: ProbeFilter, options: ProbeOptions) -> Self {
        Self {
            registry,
            filter,
            options,
        }
    }

    pub fn probe(&self, path: &Path) -> ProbeOutcome {
        if self.filter.include_vectors || self.filter.include_tables {
            if let Some((driver, layers)) =
                self.registry.open_with(DriverFamily::Vector, path, &self.options)
            {
                return ProbeOutcome::Opened(self.tag(driver, path, layers));
            }
        }

        if self.filter.include_rasters {
            if let Some((driver, layers)) =
                self.registry.open_with(DriverFamily::Raster, path, &self.options)
            {
                return ProbeOutcome::Opened(self.tag(driver, path, layers));
            }
        }

        ProbeOutcome::NoDataSource
    }

    fn tag(&self, driver: &dyn DatasetDriver, path: &Path, layers: Vec<DriverLayer>) -> Vec<ProbeResult> {
        layers
            .into_iter()
            .filter(|layer| self.filter.accepts(layer.data_type))
            .map(|layer| ProbeResult {
                path: path.to_path_buf(),
                layer_name: layer.name,
                data_type: layer.data_type,
                format: driver.short_name().to_string(),
                driver_name: driver.long_name().to_string(),
                report: layer.report,
            })
            .collect()
    }
}

/// Lower-cased file extension.
pub(crate) fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
}

pub(crate) fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Human-readable geometry type in the `3D Measured Polygon` style.
pub(crate) fn geometry_type_name(base: &str, has_z: bool, has_m: bool) -> String {
    match (has_z, has_m) {
        (true, true) => format!("3D Measured {}", base),
        (true, false) => format!("3D {}", base),
        (false, true) => format!("Measured {}", base),
        (false, false) => base.to_string(),
    }
}

/// What reading the first feature produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FeatureSample {
    Geometry { valid: bool },
    NoGeometry,
    Unreadable,
}

/// Validation findings for a vector or table layer.
pub(crate) fn validate_vector(
    report: &mut LayerReport,
    is_table: bool,
    feature_count: u64,
    sample: impl FnOnce() -> FeatureSample,
) {
    if feature_count > 0 {
        match sample() {
            FeatureSample::Unreadable => {
                report.valid = false;
                let message = if is_table {
                    "Cannot read records"
                } else {
                    "Cannot read features"
                };
                report.fail(IssueStage::Validation, message);
            }
            FeatureSample::NoGeometry if !is_table => {
                report.note(IssueStage::Validation, "Missing geometries");
            }
            FeatureSample::Geometry { valid: false } if !is_table => {
                report.note(IssueStage::Validation, "Invalid geometries detected");
            }
            _ => {}
        }
    }
    if !is_table && report.crs.is_none() {
        report.note(IssueStage::Validation, "Missing CRS");
    }
    if feature_count == 0 {
        report.note(IssueStage::Validation, "Empty dataset");
    }
}

/// Validation findings for a raster layer. `sample` reads one data block.
pub(crate) fn validate_raster(
    report: &mut LayerReport,
    georeferenced: bool,
    sample: impl FnOnce() -> Result<(), String>,
) {
    let band_count = report.raster.as_ref().map(|r| r.band_count).unwrap_or(0);
    if band_count == 0 {
        report.valid = false;
        report.note(IssueStage::Validation, "No raster bands");
        return;
    }
    if let Err(e) = sample() {
        report.valid = false;
        report.fail(IssueStage::Validation, format!("Data read error: {}", e));
    }
    if report.crs.is_none() {
        report.note(IssueStage::Validation, "Missing CRS");
    }
    if !georeferenced {
        report.note(IssueStage::Validation, "Missing geotransform");
    }
}

/// Ring checks used by the sampling validators: closed, at least four
/// positions, finite coordinates.
pub(crate) fn ring_is_valid(ring: &[(f64, f64)]) -> bool {
    ring.len() >= 4
        && ring.iter().all(|(x, y)| x.is_finite() && y.is_finite())
        && ring.first() == ring.last()
}
