mod common;

use std::io::Write;
use std::time::Duration;

use common::*;
use geocatalog::pipeline::LogLevel;
use geocatalog::{
    load_config, CatalogAccess, ConfigError, ScanError, ScanEvent, ScanOrchestrator, ScanOutcome,
    ScanState, ScanWorker,
};

fn progress(events: &[ScanEvent]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|e| match e {
            ScanEvent::Progress { percent } => Some(*percent),
            _ => None,
        })
        .collect()
}

#[test]
fn test_worker_streams_events_until_terminal() {
    let harness = ScanHarness::new();
    point_shapefile(harness.data(), "wells", &grid_points(12), Some(WGS84_PRJ));
    csv_table(&harness.data().join("owners.csv"));

    let handle = ScanWorker::spawn(harness.config()).unwrap();
    let mut events = Vec::new();
    while let Some(event) = handle.next_event(Duration::from_secs(30)) {
        let terminal = event.is_terminal();
        events.push(event);
        if terminal {
            break;
        }
    }
    let outcome = handle.join();

    assert_eq!(outcome.state(), ScanState::Completed);
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    match events.last() {
        Some(ScanEvent::Completed(summary)) => {
            assert_eq!(summary.total, 2);
            assert_eq!(summary.vectors, 1);
            assert_eq!(summary.tables, 1);
        }
        other => panic!("unexpected terminal event {:?}", other),
    }

    let percents = progress(&events);
    assert!(percents.windows(2).all(|w| w[0] < w[1]), "{:?}", percents);
    assert_eq!(percents.last(), Some(&100));
    assert!(events.iter().any(|e| matches!(
        e,
        ScanEvent::Log { level: LogLevel::Info, message } if message.starts_with("Scan complete")
    )));
}

#[test]
fn test_worker_cancellation_is_not_a_failure() {
    let harness = ScanHarness::new();
    csv_table(&harness.data().join("owners.csv"));

    let orchestrator = ScanOrchestrator::new(harness.config()).with_host(test_host());
    orchestrator.cancellation_token().cancel();
    let handle = ScanWorker::spawn_orchestrator(orchestrator).unwrap();
    let (events, outcome) = handle.wait();

    assert_eq!(outcome.state(), ScanState::Canceled);
    assert!(matches!(events.last(), Some(ScanEvent::Canceled { .. })));
    assert!(!events.iter().any(|e| matches!(e, ScanEvent::Failed { .. })));
    assert_eq!(harness.store().active_count().unwrap(), 0);
}

#[test]
fn test_scan_from_config_file() {
    let harness = ScanHarness::new();
    csv_table(&harness.subdir("tables").join("owners.csv"));
    csv_table(&harness.subdir("scratch").join("tmp.csv"));
    ascii_grid(&harness.data().join("dem.asc"));

    let mut file = tempfile::NamedTempFile::new().unwrap();
    let config_json = serde_json::json!({
        "version": "1.0",
        "root_directory": harness.data(),
        "catalog_path": harness.catalog(),
        "table_name": "county_inventory",
        "include_rasters": false,
        "exclude": ["scratch/**"]
    });
    write!(file, "{}", config_json).unwrap();

    let config = load_config(file.path()).unwrap();
    assert_eq!(config.table_name, "county_inventory");
    let summary = harness.scan_with(config);
    assert_eq!(summary.total, 1);
    assert_eq!(summary.tables, 1);
}

#[test]
fn test_invalid_config_fails_session() {
    let harness = ScanHarness::new();
    let (events, outcome) = harness.run(harness.config().with_table_name("drop table"));

    assert!(matches!(
        outcome,
        ScanOutcome::Failed(ScanError::InvalidConfig(ConfigError::InvalidTableName(_)))
    ));
    assert!(matches!(events.last(), Some(ScanEvent::Failed { .. })));
    assert!(!harness.catalog().exists());
}

#[test]
fn test_bad_exclude_pattern_is_a_config_error() {
    let harness = ScanHarness::new();
    let (_, outcome) = harness.run(harness.config().with_exclude(["[unclosed"]));
    assert!(matches!(
        outcome,
        ScanOutcome::Failed(ScanError::InvalidConfig(ConfigError::InvalidPattern { .. }))
    ));
}

#[test]
fn test_config_file_errors() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{ "root_directory": "/d", "catalog_path": "/c.gpkg", "table_name": "1st" }}"#)
        .unwrap();
    assert!(matches!(
        load_config(file.path()),
        Err(ConfigError::SchemaValidation { .. })
    ));
}
