use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::db::migrations::is_valid_identifier;
use crate::error::ConfigError;
use crate::extract::ExtractOptions;
use crate::probe::{ProbeFilter, ProbeOptions};

pub const CONFIG_VERSION: &str = "1.0";

/// Parameters of one scan session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanConfig {
    #[serde(default = "default_version")]
    pub version: String,
    pub root_directory: PathBuf,
    pub catalog_path: PathBuf,
    #[serde(default = "default_table_name")]
    pub table_name: String,
    /// Diff against the existing catalog instead of replacing it.
    #[serde(default = "default_true")]
    pub update_mode: bool,
    #[serde(default = "default_true")]
    pub include_vectors: bool,
    #[serde(default = "default_true")]
    pub include_rasters: bool,
    #[serde(default = "default_true")]
    pub include_tables: bool,
    #[serde(default = "default_true")]
    pub parse_metadata: bool,
    #[serde(default = "default_true")]
    pub include_sidecar: bool,
    #[serde(default)]
    pub validate_files: bool,
    #[serde(default)]
    pub follow_symlinks: bool,
    /// Glob patterns relative to the root directory.
    #[serde(default)]
    pub exclude: Vec<String>,
}

fn default_version() -> String {
    CONFIG_VERSION.to_string()
}

fn default_table_name() -> String {
    crate::db::DEFAULT_TABLE.to_string()
}

fn default_true() -> bool {
    true
}

impl ScanConfig {
    pub fn new(root_directory: impl Into<PathBuf>, catalog_path: impl Into<PathBuf>) -> Self {
        Self {
            version: default_version(),
            root_directory: root_directory.into(),
            catalog_path: catalog_path.into(),
            table_name: default_table_name(),
            update_mode: true,
            include_vectors: true,
            include_rasters: true,
            include_tables: true,
            parse_metadata: true,
            include_sidecar: true,
            validate_files: false,
            follow_symlinks: false,
            exclude: Vec::new(),
        }
    }

    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = table_name.into();
        self
    }

    pub fn with_update_mode(mut self, update_mode: bool) -> Self {
        self.update_mode = update_mode;
        self
    }

    pub fn with_types(mut self, vectors: bool, rasters: bool, tables: bool) -> Self {
        self.include_vectors = vectors;
        self.include_rasters = rasters;
        self.include_tables = tables;
        self
    }

    pub fn with_parse_metadata(mut self, parse: bool) -> Self {
        self.parse_metadata = parse;
        self
    }

    pub fn with_sidecar(mut self, include: bool) -> Self {
        self.include_sidecar = include;
        self
    }

    pub fn with_validation(mut self, validate: bool) -> Self {
        self.validate_files = validate;
        self
    }

    pub fn with_follow_symlinks(mut self, follow: bool) -> Self {
        self.follow_symlinks = follow;
        self
    }

    pub fn with_exclude<S: Into<String>>(mut self, patterns: impl IntoIterator<Item = S>) -> Self {
        self.exclude = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root_directory
    }

    /// Checks that cannot be expressed in the JSON schema.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != CONFIG_VERSION {
            return Err(ConfigError::Validation {
                message: format!("Unsupported config version: {}", self.version),
            });
        }
        if !is_valid_identifier(&self.table_name) {
            return Err(ConfigError::InvalidTableName(self.table_name.clone()));
        }
        for pattern in &self.exclude {
            if let Err(e) = glob::Pattern::new(pattern) {
                return Err(ConfigError::InvalidPattern {
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                });
            }
        }
        if !(self.include_vectors || self.include_rasters || self.include_tables) {
            return Err(ConfigError::Validation {
                message: "At least one of vectors, rasters or tables must be included".to_string(),
            });
        }
        Ok(())
    }

    pub fn probe_filter(&self) -> ProbeFilter {
        ProbeFilter {
            include_vectors: self.include_vectors,
            include_rasters: self.include_rasters,
            include_tables: self.include_tables,
        }
    }

    pub fn probe_options(&self) -> ProbeOptions {
        ProbeOptions {
            validate: self.validate_files,
        }
    }

    pub fn extract_options(&self) -> ExtractOptions {
        ExtractOptions {
            parse_metadata: self.parse_metadata,
            include_sidecar: self.include_sidecar,
        }
    }
}
