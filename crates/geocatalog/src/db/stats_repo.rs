//! Metadata completion statistics over active catalog records.

use rusqlite::{params, Connection};
use serde::Serialize;

use super::DatabaseError;

/// Records whose status is neither `complete` nor `partial` count as `none`.
const COUNT_COLUMNS: &str = "COUNT(*),
     COALESCE(SUM(CASE WHEN metadata_status = 'complete' THEN 1 ELSE 0 END), 0),
     COALESCE(SUM(CASE WHEN metadata_status = 'partial' THEN 1 ELSE 0 END), 0)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    pub total: u64,
    pub complete: u64,
    pub partial: u64,
    pub none: u64,
}

impl StatusCounts {
    fn from_totals(total: i64, complete: i64, partial: i64) -> Self {
        let total = u64::try_from(total).unwrap_or(0);
        let complete = u64::try_from(complete).unwrap_or(0);
        let partial = u64::try_from(partial).unwrap_or(0);
        Self {
            total,
            complete,
            partial,
            none: total.saturating_sub(complete + partial),
        }
    }

    /// Share of `complete` records, in percent, rounded to one decimal.
    pub fn completion_pct(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.complete as f64 / self.total as f64 * 1000.0).round() / 10.0
    }
}

/// Dimension for [`grouped_by`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupDimension {
    Directory,
    DataType,
    Format,
    Crs,
}

impl GroupDimension {
    fn column(self) -> &'static str {
        match self {
            GroupDimension::Directory => "parent_directory",
            GroupDimension::DataType => "data_type",
            GroupDimension::Format => "format",
            GroupDimension::Crs => "crs_authid",
        }
    }

    /// Key used for records with no value in this dimension.
    fn fallback_key(self) -> &'static str {
        match self {
            GroupDimension::Directory => "Root",
            _ => "Unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupStats {
    pub key: String,
    pub total: u64,
    pub complete: u64,
    pub partial: u64,
    pub none: u64,
    pub completion_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub directory: String,
    pub format: String,
    pub count: u64,
    pub recommendation: String,
}

pub fn overall(conn: &Connection, table: &str) -> Result<StatusCounts, DatabaseError> {
    let counts = conn.query_row(
        &format!(
            "SELECT {} FROM \"{}\" WHERE retired_datetime IS NULL",
            COUNT_COLUMNS, table
        ),
        [],
        |row| Ok(StatusCounts::from_totals(row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;
    Ok(counts)
}

/// Per-group counts, groups with the most undocumented records first.
pub fn grouped_by(
    conn: &Connection,
    table: &str,
    dimension: GroupDimension,
) -> Result<Vec<GroupStats>, DatabaseError> {
    let sql = format!(
        "SELECT NULLIF({col}, '') AS group_key, {counts}
         FROM \"{table}\" WHERE retired_datetime IS NULL
         GROUP BY group_key",
        col = dimension.column(),
        counts = COUNT_COLUMNS,
        table = table,
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut groups: Vec<GroupStats> = stmt
        .query_map([], |row| {
            let key: Option<String> = row.get(0)?;
            let counts = StatusCounts::from_totals(row.get(1)?, row.get(2)?, row.get(3)?);
            Ok(GroupStats {
                key: key.unwrap_or_else(|| dimension.fallback_key().to_string()),
                total: counts.total,
                complete: counts.complete,
                partial: counts.partial,
                none: counts.none,
                completion_pct: counts.completion_pct(),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    groups.sort_by(|a, b| {
        b.none
            .cmp(&a.none)
            .then(b.total.cmp(&a.total))
            .then_with(|| a.key.cmp(&b.key))
    });
    Ok(groups)
}

/// The `(directory, format)` groups with the most records still lacking
/// metadata.
pub fn priority_recommendations(
    conn: &Connection,
    table: &str,
    limit: usize,
) -> Result<Vec<Recommendation>, DatabaseError> {
    let sql = format!(
        "SELECT NULLIF(parent_directory, '') AS dir, NULLIF(format, '') AS fmt, COUNT(*) AS n
         FROM \"{}\"
         WHERE retired_datetime IS NULL
           AND (metadata_status IS NULL OR metadata_status NOT IN ('complete', 'partial'))
         GROUP BY dir, fmt
         ORDER BY n DESC, dir, fmt
         LIMIT ?1",
        table
    );
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![limit], |row| {
            let directory: Option<String> = row.get(0)?;
            let format: Option<String> = row.get(1)?;
            let count = u64::try_from(row.get::<_, i64>(2)?).unwrap_or(0);
            let recommendation = format!(
                "{} {} in {} need metadata",
                count,
                format.as_deref().unwrap_or("files"),
                directory.as_deref().unwrap_or("Root"),
            );
            Ok(Recommendation {
                directory: directory.unwrap_or_else(|| "Root".to_string()),
                format: format.unwrap_or_else(|| "Unknown".to_string()),
                count,
                recommendation,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
