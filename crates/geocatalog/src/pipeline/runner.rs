use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info_span};

use crate::config::ScanConfig;
use crate::crs::CrsError;
use crate::db::{CatalogStore, DatabaseError, ScanSession};
use crate::diff::{CatalogDiffEngine, Reconciled};
use crate::error::{ConfigError, ScanError};
use crate::extract::{HostInfo, MetadataExtractor};
use crate::probe::{DriverRegistry, FormatProbe};
use crate::record::{DataType, InventoryRecord};
use crate::scanner::{CancellationToken, PathScanner};

use super::progress::{EventReporter, LogLevel, Phase, ScanEvent, ScanEventSink};
use super::state::ScanState;

/// Counts reported when a scan commits.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummary {
    /// Records written by this scan.
    pub total: usize,
    pub vectors: usize,
    pub rasters: usize,
    pub tables: usize,
    /// Records with a failed extraction step plus files that could not be
    /// extracted at all.
    pub errors: usize,
    pub new: usize,
    pub preserved: usize,
    pub retired: usize,
    pub scan_timestamp: DateTime<Utc>,
    pub elapsed: Duration,
}

/// Terminal result of a session.
#[derive(Debug)]
pub enum ScanOutcome {
    Completed(ScanSummary),
    Canceled { reason: String },
    Failed(ScanError),
}

impl ScanOutcome {
    pub fn state(&self) -> ScanState {
        match self {
            ScanOutcome::Completed(_) => ScanState::Completed,
            ScanOutcome::Canceled { .. } => ScanState::Canceled,
            ScanOutcome::Failed(_) => ScanState::Failed,
        }
    }

    pub fn summary(&self) -> Option<&ScanSummary> {
        match self {
            ScanOutcome::Completed(summary) => Some(summary),
            _ => None,
        }
    }
}

enum Interrupt {
    Canceled(String),
    Failed(ScanError),
}

impl From<ScanError> for Interrupt {
    fn from(e: ScanError) -> Self {
        Interrupt::Failed(e)
    }
}

impl From<DatabaseError> for Interrupt {
    fn from(e: DatabaseError) -> Self {
        Interrupt::Failed(ScanError::Catalog(e))
    }
}

impl From<ConfigError> for Interrupt {
    fn from(e: ConfigError) -> Self {
        Interrupt::Failed(ScanError::InvalidConfig(e))
    }
}

impl From<CrsError> for Interrupt {
    fn from(e: CrsError) -> Self {
        Interrupt::Failed(ScanError::Crs(e))
    }
}

#[derive(Default)]
struct Tally {
    total: usize,
    vectors: usize,
    rasters: usize,
    tables: usize,
    errors: usize,
}

impl Tally {
    fn count(&mut self, record: &InventoryRecord) {
        self.total += 1;
        match record.data_type {
            DataType::Vector => self.vectors += 1,
            DataType::Raster => self.rasters += 1,
            DataType::Table => self.tables += 1,
        }
        if record.has_failures() {
            self.errors += 1;
        }
    }
}

/// Runs one scan session: discover, probe, extract, diff, persist.
///
/// The session is synchronous. Every mutation lands in a single catalog
/// transaction that is committed only when the whole tree was processed.
pub struct ScanOrchestrator {
    config: ScanConfig,
    registry: Option<DriverRegistry>,
    host: Option<HostInfo>,
    cancel: CancellationToken,
    state: ScanState,
}

impl ScanOrchestrator {
    pub fn new(config: ScanConfig) -> Self {
        Self {
            config,
            registry: None,
            host: None,
            cancel: CancellationToken::new(),
            state: ScanState::Idle,
        }
    }

    /// Replaces the built-in format drivers.
    pub fn with_registry(mut self, registry: DriverRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_host(mut self, host: HostInfo) -> Self {
        self.host = Some(host);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Runs the session to a terminal state. A session runs at most once.
    pub fn run(&mut self, sink: &dyn ScanEventSink) -> ScanOutcome {
        let reporter = EventReporter::new(sink);

        if !self.state.can_transition_to(ScanState::Scanning) {
            let error = ScanError::AlreadyStarted(self.state.to_string());
            reporter.terminal(ScanEvent::Failed {
                reason: error.to_string(),
            });
            return ScanOutcome::Failed(error);
        }
        self.state = ScanState::Scanning;

        let _scan_span = info_span!("scan",
            root = %self.config.root_directory.display(),
            catalog = %self.config.catalog_path.display(),
            table = %self.config.table_name,
            update_mode = self.config.update_mode,
        )
        .entered();

        let started = Instant::now();
        let outcome = match self.execute(&reporter, started) {
            Ok(summary) => {
                reporter.info(format!(
                    "Scan complete: {} records ({} vectors, {} rasters, {} tables), {} errors, {} retired",
                    summary.total,
                    summary.vectors,
                    summary.rasters,
                    summary.tables,
                    summary.errors,
                    summary.retired
                ));
                reporter.terminal(ScanEvent::Completed(summary.clone()));
                ScanOutcome::Completed(summary)
            }
            Err(Interrupt::Canceled(reason)) => {
                reporter.warn(format!("Scan canceled: {}", reason));
                reporter.terminal(ScanEvent::Canceled {
                    reason: reason.clone(),
                });
                ScanOutcome::Canceled { reason }
            }
            Err(Interrupt::Failed(error)) => {
                reporter.log(LogLevel::Critical, format!("Scan failed: {}", error));
                reporter.terminal(ScanEvent::Failed {
                    reason: error.to_string(),
                });
                ScanOutcome::Failed(error)
            }
        };
        self.state = outcome.state();
        outcome
    }

    fn check_cancel(&self) -> Result<(), Interrupt> {
        if self.cancel.is_cancelled() {
            Err(Interrupt::Canceled("canceled by caller".to_string()))
        } else {
            Ok(())
        }
    }

    fn execute(&mut self, reporter: &EventReporter<'_>, started: Instant) -> Result<ScanSummary, Interrupt> {
        self.config.validate()?;
        let root = self.config.root_directory.clone();
        if !root.exists() {
            return Err(ScanError::RootNotFound(root).into());
        }
        if !root.is_dir() {
            return Err(ScanError::RootNotDirectory(root).into());
        }

        let store = CatalogStore::open(&self.config.catalog_path, &self.config.table_name)?;
        let scanner = PathScanner::new(&root)
            .follow_symlinks(self.config.follow_symlinks)
            .exclude_patterns(&self.config.exclude)
            .map_err(|e| ConfigError::Validation {
                message: format!("Invalid exclude pattern: {}", e),
            })?
            .exclude_database(&self.config.catalog_path);
        let probe = FormatProbe::new(
            self.registry.take().unwrap_or_default(),
            self.config.probe_filter(),
            self.config.probe_options(),
        );
        let mut extractor = MetadataExtractor::new(&root, self.config.extract_options())?;
        if let Some(host) = self.host.take() {
            extractor = extractor.with_host(host);
        }

        let scan_timestamp = Utc::now();
        let mut session = store.begin_scan()?;
        reporter.info(format!(
            "Scanning {} ({} mode)",
            root.display(),
            if self.config.update_mode { "update" } else { "fresh" }
        ));

        let paths = self.discover(&scanner, reporter)?;

        let mut engine = if self.config.update_mode {
            CatalogDiffEngine::new(session.prior_management()?)
        } else {
            session.clear_all()?;
            CatalogDiffEngine::fresh()
        };

        let tally = self.extract_all(&paths, &probe, &extractor, &mut engine, &mut session, scan_timestamp, reporter)?;

        let retired = {
            let _phase = info_span!("retire").entered();
            self.check_cancel()?;
            reporter.phase_start(Phase::Retirement);
            let retired = if engine.is_update_mode() {
                session.retire_missing(engine.seen(), &scan_timestamp)?
            } else {
                0
            };
            if retired > 0 {
                reporter.info(format!("Retired {} records no longer found", retired));
            }
            reporter.phase_progress(Phase::Retirement, 1, 1);
            retired
        };

        {
            let _phase = info_span!("commit").entered();
            self.check_cancel()?;
            reporter.phase_start(Phase::Commit);
            session.commit(&scan_timestamp)?;
            reporter.phase_progress(Phase::Commit, 1, 1);
        }

        let counts = engine.counts();
        Ok(ScanSummary {
            total: tally.total,
            vectors: tally.vectors,
            rasters: tally.rasters,
            tables: tally.tables,
            errors: tally.errors,
            new: counts.new,
            preserved: counts.preserved,
            retired,
            scan_timestamp,
            elapsed: started.elapsed(),
        })
    }

    fn discover(
        &self,
        scanner: &PathScanner,
        reporter: &EventReporter<'_>,
    ) -> Result<Vec<PathBuf>, Interrupt> {
        let _phase = info_span!("discover").entered();
        reporter.phase_start(Phase::Discovery);

        let mut walk = scanner.paths(&self.cancel);
        let paths: Vec<PathBuf> = walk.by_ref().collect();
        self.check_cancel()?;

        if walk.skipped() > 0 {
            reporter.warn(format!("Skipped {} unreadable entries", walk.skipped()));
        }
        reporter.info(format!("Discovered {} candidate files", paths.len()));
        reporter.phase_progress(Phase::Discovery, 1, 1);
        Ok(paths)
    }

    #[allow(clippy::too_many_arguments)]
    fn extract_all(
        &self,
        paths: &[PathBuf],
        probe: &FormatProbe,
        extractor: &MetadataExtractor,
        engine: &mut CatalogDiffEngine,
        session: &mut ScanSession<'_>,
        scan_timestamp: DateTime<Utc>,
        reporter: &EventReporter<'_>,
    ) -> Result<Tally, Interrupt> {
        let _phase = info_span!("extract", files = paths.len()).entered();
        let mut tally = Tally::default();

        for (index, path) in paths.iter().enumerate() {
            self.check_cancel()?;

            for result in probe.probe(path).into_results() {
                let layer = result.layer_name.clone();
                let mut record = match extractor.extract(result, scan_timestamp) {
                    Ok(record) => record,
                    Err(e) => {
                        tally.errors += 1;
                        reporter.error(e.to_string());
                        continue;
                    }
                };

                match engine.reconcile(&mut record) {
                    Reconciled::Duplicate => {
                        reporter.warn(format!("Duplicate layer '{}' in {}", layer, path.display()));
                        continue;
                    }
                    Reconciled::New | Reconciled::Preserved => {}
                }

                for issue in record.quality.issues.iter().filter(|i| i.is_failure()) {
                    reporter.warn(format!("{}: {}", record.identity, issue));
                }
                tally.count(&record);
                session.upsert_active(std::slice::from_ref(&record))?;
                debug!(
                    file = %record.identity.file_path,
                    layer = %record.identity.layer_name,
                    data_type = %record.data_type,
                    "Cataloged layer"
                );
            }

            reporter.phase_progress(Phase::Extraction, index + 1, paths.len());
        }

        Ok(tally)
    }
}
