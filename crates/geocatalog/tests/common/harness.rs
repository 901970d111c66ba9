//! A scratch data tree and catalog for end-to-end scans.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use geocatalog::extract::HostInfo;
use geocatalog::pipeline::CollectingSink;
use geocatalog::{
    CatalogReader, CatalogStore, Identity, ScanConfig, ScanEvent, ScanOrchestrator, ScanOutcome,
};
use tempfile::TempDir;

pub const TABLE: &str = "geospatial_inventory";

pub fn test_host() -> HostInfo {
    HostInfo {
        user: "surveyor".to_string(),
        machine: "field-laptop".to_string(),
        os: "linux".to_string(),
        os_version: Some("6.8.0-generic".to_string()),
        mount_points: vec!["/".to_string()],
    }
}

/// Owns a temp directory with `data/` to scan and `catalog.gpkg` beside it.
pub struct ScanHarness {
    dir: TempDir,
    data: PathBuf,
    catalog: PathBuf,
}

impl ScanHarness {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("data");
        std::fs::create_dir_all(&data).unwrap();
        let catalog = dir.path().join("catalog.gpkg");
        Self { dir, data, catalog }
    }

    pub fn data(&self) -> &Path {
        &self.data
    }

    pub fn catalog(&self) -> &Path {
        &self.catalog
    }

    /// Creates `data/<rel>` and returns it.
    pub fn subdir(&self, rel: &str) -> PathBuf {
        let path = self.data.join(rel);
        std::fs::create_dir_all(&path).unwrap();
        path
    }

    pub fn config(&self) -> ScanConfig {
        ScanConfig::new(&self.data, &self.catalog)
    }

    pub fn run(&self, config: ScanConfig) -> (Vec<ScanEvent>, ScanOutcome) {
        let sink = CollectingSink::new();
        let outcome = ScanOrchestrator::new(config).with_host(test_host()).run(&sink);
        (sink.events(), outcome)
    }

    /// Runs an update-mode scan with default options and expects it to
    /// complete.
    pub fn scan(&self) -> geocatalog::ScanSummary {
        self.scan_with(self.config())
    }

    pub fn scan_with(&self, config: ScanConfig) -> geocatalog::ScanSummary {
        match self.run(config).1 {
            ScanOutcome::Completed(summary) => summary,
            other => panic!("scan did not complete: {:?}", other),
        }
    }

    pub fn store(&self) -> CatalogStore {
        CatalogStore::open(&self.catalog, TABLE).unwrap()
    }

    pub fn reader(&self) -> CatalogReader {
        CatalogReader::open(&self.catalog, TABLE).unwrap()
    }

    pub fn identity(&self, path: &Path, layer: &str) -> Identity {
        Identity::new(path.to_string_lossy().into_owned(), layer)
    }
}

impl Default for ScanHarness {
    fn default() -> Self {
        Self::new()
    }
}
