pub mod config;
pub mod crs;
pub mod db;
pub mod diff;
pub mod error;
pub mod extract;
pub mod logging;
pub mod pipeline;
pub mod probe;
pub mod record;
pub mod scanner;
pub mod sidecar;
pub mod worker;

pub use config::{load_config, load_config_from_str, ScanConfig};
pub use db::{
    CatalogAccess, CatalogReader, CatalogStore, DatabaseError, GroupDimension, StatusUpdate,
};
pub use diff::{CatalogDiffEngine, Reconciled};
pub use error::{ConfigError, GeoCatalogError, LoggingError, Result, ScanError};
pub use pipeline::{ScanEvent, ScanEventSink, ScanOrchestrator, ScanOutcome, ScanState, ScanSummary};
pub use record::{DataType, Identity, InventoryRecord, ManagementFields, MetadataStatus};
pub use scanner::CancellationToken;
pub use worker::{ScanHandle, ScanWorker};
