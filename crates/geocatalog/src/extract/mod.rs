//! Turns probe results into normalized inventory records.
//!
//! The driver already described the layer; extraction adds what is shared by
//! every format: file statistics, provenance, the reprojected extent and
//! footprint, companion files, descriptive metadata and the quality score.
//! Sub-step problems become [`ExtractionIssue`]s on the record. Only a file
//! that cannot be stat'ed at all is an [`ExtractError`].

pub mod provenance;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::crs::{CrsError, ExtentTransformer};
use crate::probe::ProbeResult;
use crate::record::{
    quality, FileAttributes, Identity, InventoryRecord, SidecarFlags, SpatialAttributes,
};
use crate::sidecar::SidecarInspector;

pub use provenance::{classify_storage, HostInfo};

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Cannot stat '{path}': {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Optional extraction stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractOptions {
    pub parse_metadata: bool,
    pub include_sidecar: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            parse_metadata: true,
            include_sidecar: true,
        }
    }
}

pub struct MetadataExtractor {
    root: PathBuf,
    transformer: ExtentTransformer,
    sidecars: SidecarInspector,
    host: HostInfo,
    options: ExtractOptions,
}

impl MetadataExtractor {
    pub fn new(root: impl Into<PathBuf>, options: ExtractOptions) -> Result<Self, CrsError> {
        Ok(Self {
            root: root.into(),
            transformer: ExtentTransformer::new()?,
            sidecars: SidecarInspector::new(),
            host: HostInfo::detect(),
            options,
        })
    }

    pub fn with_host(mut self, host: HostInfo) -> Self {
        self.host = host;
        self
    }

    pub fn extract(
        &self,
        probe: ProbeResult,
        scan_timestamp: DateTime<Utc>,
    ) -> Result<InventoryRecord, ExtractError> {
        let file_path = probe.path.to_string_lossy().into_owned();
        let file = self.file_attributes(&probe.path)?;

        let mut record = InventoryRecord::new(
            Identity::new(file_path.clone(), probe.layer_name),
            probe.data_type,
            scan_timestamp,
        );
        record.format = probe.format;
        record.driver_name = probe.driver_name;
        record.file = file;
        record.provenance = self.host.provenance_for(&file_path);

        let report = probe.report;
        record.quality.issues = report.issues;
        record.quality.is_valid = report.valid;
        record.vector = report.vector;
        record.raster = report.raster;

        let crs = report.crs.filter(|c| !c.is_empty());
        let mut spatial = SpatialAttributes {
            crs_authid: crs.as_ref().and_then(|c| c.authid()),
            crs_wkt: crs.as_ref().and_then(|c| c.wkt.clone()),
            native_extent: report.native_extent,
            ..SpatialAttributes::default()
        };
        if let Some(native) = &report.native_extent {
            let reprojection = self.transformer.reproject(native, crs.as_ref());
            spatial.global_extent = Some(reprojection.extent);
            spatial.footprint = Some(reprojection.footprint);
            spatial.extent_reprojected = reprojection.reprojected;
            if let Some(issue) = reprojection.issue {
                record.add_issue(issue);
            }
        }
        record.spatial = spatial;

        record.sidecars = if self.options.include_sidecar {
            self.sidecars.flags(&probe.path)
        } else {
            SidecarFlags::default()
        };
        if self.options.parse_metadata {
            record.descriptive = self.sidecars.read_descriptive(&probe.path);
        }

        record.quality.score = quality::score(&record);
        Ok(record)
    }

    fn file_attributes(&self, path: &Path) -> Result<FileAttributes, ExtractError> {
        let meta = std::fs::metadata(path).map_err(|source| ExtractError::Stat {
            path: path.to_path_buf(),
            source,
        })?;
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        let depth = relative.components().count().saturating_sub(1);

        Ok(FileAttributes {
            relative_path: relative.to_string_lossy().into_owned(),
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            parent_directory: path
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default(),
            directory_depth: u32::try_from(depth).unwrap_or(u32::MAX),
            size_bytes: meta.len(),
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
            created: meta.created().ok().map(DateTime::<Utc>::from),
        })
    }
}
