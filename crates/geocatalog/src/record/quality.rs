//! Deterministic completeness score for a record.

use super::{DataType, InventoryRecord};

const CRS_POINTS: f64 = 20.0;
const EXTENT_POINTS: f64 = 20.0;
const DESCRIPTIVE_POINTS: f64 = 20.0;
const STRUCTURE_POINTS: f64 = 15.0;
const VALIDITY_POINTS: f64 = 15.0;
const NO_ISSUE_POINTS: f64 = 10.0;

/// Weighted sum of completeness signals, clamped to `[0, 100]` and rounded
/// to one decimal.
pub fn score(record: &InventoryRecord) -> f64 {
    let mut total = 0.0;

    if record.spatial.has_crs() {
        total += CRS_POINTS;
    }
    if record.spatial.has_extent() {
        total += EXTENT_POINTS;
    }
    if record.descriptive.is_some() {
        total += DESCRIPTIVE_POINTS;
    }
    if has_structure_info(record) {
        total += STRUCTURE_POINTS;
    }
    if record.quality.is_valid {
        total += VALIDITY_POINTS;
    }
    if record.quality.issues.is_empty() {
        total += NO_ISSUE_POINTS;
    }

    let clamped: f64 = total.clamp(0.0, 100.0);
    (clamped * 10.0).round() / 10.0
}

/// Field info for vectors, band info for rasters. Tables never earn it.
fn has_structure_info(record: &InventoryRecord) -> bool {
    match record.data_type {
        DataType::Vector => record
            .vector
            .as_ref()
            .map(|v| v.field_count() > 0)
            .unwrap_or(false),
        DataType::Raster => record
            .raster
            .as_ref()
            .map(|r| r.band_count > 0)
            .unwrap_or(false),
        DataType::Table => false,
    }
}
