//! Delimited text tables.

use std::fs::File;
use std::path::Path;

use csv::ReaderBuilder;

use super::{
    extension, file_stem, validate_vector, DatasetDriver, DriverError, DriverFamily, DriverLayer,
    FeatureSample, LayerReport, ProbeOptions,
};
use crate::record::{DataType, FieldInfo, VectorAttributes};

const FORMAT: &str = "CSV";
/// Rows inspected when inferring column types.
const TYPE_SAMPLE_ROWS: usize = 100;

pub struct CsvDriver;

/// Narrowest type that fits every non-empty value seen so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnType {
    Unknown,
    Integer,
    Real,
    String,
}

impl ColumnType {
    fn observe(self, value: &str) -> Self {
        let value = value.trim();
        if value.is_empty() || self == ColumnType::String {
            return self;
        }
        let seen = if value.parse::<i64>().is_ok() {
            ColumnType::Integer
        } else if value.parse::<f64>().map(f64::is_finite).unwrap_or(false) {
            ColumnType::Real
        } else {
            ColumnType::String
        };
        match (self, seen) {
            (ColumnType::Unknown, s) => s,
            (ColumnType::Integer, ColumnType::Real) => ColumnType::Real,
            (ColumnType::Real, ColumnType::Integer) => ColumnType::Real,
            (_, ColumnType::String) => ColumnType::String,
            (current, _) => current,
        }
    }

    fn name(self) -> &'static str {
        match self {
            ColumnType::Integer => "Integer",
            ColumnType::Real => "Real",
            ColumnType::Unknown | ColumnType::String => "String",
        }
    }
}

fn delimiter_for(path: &Path) -> Option<u8> {
    match extension(path).as_deref() {
        Some("csv") => Some(b','),
        Some("tsv") => Some(b'\t'),
        _ => None,
    }
}

fn csv_err(e: csv::Error) -> DriverError {
    match e.into_kind() {
        csv::ErrorKind::Io(io) => DriverError::Io(io),
        other => DriverError::malformed(FORMAT, format!("{:?}", other)),
    }
}

impl DatasetDriver for CsvDriver {
    fn short_name(&self) -> &'static str {
        FORMAT
    }

    fn long_name(&self) -> &'static str {
        "Comma Separated Value (.csv)"
    }

    fn family(&self) -> DriverFamily {
        DriverFamily::Vector
    }

    fn open(&self, path: &Path, options: &ProbeOptions) -> Result<Vec<DriverLayer>, DriverError> {
        let Some(delimiter) = delimiter_for(path) else {
            return Err(DriverError::NotRecognized);
        };
        let mut reader = ReaderBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .from_reader(File::open(path)?);

        let headers: Vec<String> = reader
            .headers()
            .map_err(csv_err)?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        if headers.iter().all(String::is_empty) {
            return Err(DriverError::malformed(FORMAT, "missing header row"));
        }

        let mut types = vec![ColumnType::Unknown; headers.len()];
        let mut rows: u64 = 0;
        let mut first_row_ok = None;
        for result in reader.records() {
            match result {
                Ok(record) => {
                    if rows < TYPE_SAMPLE_ROWS as u64 {
                        for (column, value) in types.iter_mut().zip(record.iter()) {
                            *column = column.observe(value);
                        }
                    }
                    first_row_ok.get_or_insert(true);
                    rows += 1;
                }
                Err(e) => {
                    log::debug!("Stopped reading {} at row {}: {}", path.display(), rows + 2, e);
                    first_row_ok.get_or_insert(false);
                    break;
                }
            }
        }

        let fields = headers
            .into_iter()
            .zip(&types)
            .map(|(name, ty)| FieldInfo::new(name, ty.name()))
            .collect();

        let mut report = LayerReport {
            vector: Some(VectorAttributes {
                feature_count: Some(rows),
                fields,
                ..VectorAttributes::default()
            }),
            ..LayerReport::default()
        };

        if options.validate {
            let count = if first_row_ok == Some(false) { 1 } else { rows };
            validate_vector(&mut report, true, count, || match first_row_ok {
                Some(false) => FeatureSample::Unreadable,
                _ => FeatureSample::NoGeometry,
            });
        }

        Ok(vec![DriverLayer {
            name: file_stem(path),
            data_type: DataType::Table,
            report,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_column_type_widening() {
        let ty = ColumnType::Unknown.observe("3").observe("").observe("4.5");
        assert_eq!(ty, ColumnType::Real);
        assert_eq!(ty.observe("n/a"), ColumnType::String);
        assert_eq!(ColumnType::Unknown.name(), "String");
    }

    #[test]
    fn test_reads_header_and_row_count() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wells.csv");
        std::fs::write(&path, "id,depth,name\n1,12.5,north\n2,8,south\n3,,east\n").unwrap();

        let layers = CsvDriver.open(&path, &ProbeOptions { validate: true }).unwrap();
        assert_eq!(layers.len(), 1);
        let layer = &layers[0];
        assert_eq!(layer.name, "wells");
        assert_eq!(layer.data_type, DataType::Table);
        let vector = layer.report.vector.as_ref().unwrap();
        assert_eq!(vector.feature_count, Some(3));
        assert_eq!(
            vector.fields,
            vec![
                FieldInfo::new("id", "Integer"),
                FieldInfo::new("depth", "Real"),
                FieldInfo::new("name", "String"),
            ]
        );
        assert!(layer.report.issues.is_empty());
    }

    #[test]
    fn test_header_only_file_is_empty_dataset() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.csv");
        std::fs::write(&path, "a,b\n").unwrap();
        let layers = CsvDriver.open(&path, &ProbeOptions { validate: true }).unwrap();
        let messages: Vec<_> = layers[0].report.issues.iter().map(|i| i.message.as_str()).collect();
        assert_eq!(messages, vec!["Empty dataset"]);
    }

    #[test]
    fn test_other_extensions_are_not_recognized() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "a,b\n1,2\n").unwrap();
        assert!(matches!(
            CsvDriver.open(&path, &ProbeOptions::default()),
            Err(DriverError::NotRecognized)
        ));
    }
}
