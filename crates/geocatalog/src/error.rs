use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GeoCatalogError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Logging error: {0}")]
    Logging(#[from] LoggingError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },

    #[error("Invalid catalog table name '{0}': only ASCII letters, digits and underscores are allowed")]
    InvalidTableName(String),

    #[error("Invalid exclude pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Scan root does not exist: {0}")]
    RootNotFound(PathBuf),

    #[error("Scan root is not a directory: {0}")]
    RootNotDirectory(PathBuf),

    #[error("Scan session already ran (state: {0})")]
    AlreadyStarted(String),

    #[error("Failed to spawn scan worker: {0}")]
    SpawnFailed(String),

    #[error("Invalid scan configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("Coordinate transformer unavailable: {0}")]
    Crs(#[from] crate::crs::CrsError),

    #[error("Catalog unavailable: {0}")]
    Catalog(#[from] crate::db::DatabaseError),

    #[error("Scan worker panicked")]
    WorkerPanicked,
}

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Invalid log filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("A global logger is already installed: {0}")]
    AlreadyInstalled(String),
}

pub type Result<T> = std::result::Result<T, GeoCatalogError>;
