//! dBase tables, standalone or as the attribute part of a shapefile.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use super::{
    extension, file_stem, validate_vector, DatasetDriver, DriverError, DriverFamily, DriverLayer,
    FeatureSample, LayerReport, ProbeOptions,
};
use crate::record::{DataType, FieldInfo, VectorAttributes};

const FORMAT: &str = "DBF";
const HEADER_LEN: usize = 32;
const DESCRIPTOR_LEN: usize = 32;
const TERMINATOR: u8 = 0x0d;
const KNOWN_VERSIONS: &[u8] = &[
    0x02, 0x03, 0x04, 0x05, 0x30, 0x31, 0x32, 0x43, 0x63, 0x83, 0x8b, 0x8e, 0xcb, 0xf5, 0xfb,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DbfField {
    pub name: String,
    pub kind: u8,
    pub length: u8,
    pub decimals: u8,
}

impl DbfField {
    /// OGR-style type name.
    pub fn type_name(&self) -> &'static str {
        match self.kind {
            b'C' | b'M' => "String",
            b'N' if self.decimals == 0 && self.length < 10 => "Integer",
            b'N' if self.decimals == 0 && self.length < 19 => "Integer64",
            b'N' | b'F' | b'O' | b'B' => "Real",
            b'I' | b'L' => "Integer",
            b'D' => "Date",
            b'T' | b'@' => "DateTime",
            _ => "String",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DbfHeader {
    pub record_count: u32,
    pub header_len: u16,
    pub record_len: u16,
    pub fields: Vec<DbfField>,
}

impl DbfHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, DriverError> {
        if bytes.len() < HEADER_LEN + 1 {
            return Err(DriverError::malformed(FORMAT, "header truncated"));
        }
        if !KNOWN_VERSIONS.contains(&bytes[0]) {
            return Err(DriverError::NotRecognized);
        }
        let record_count = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let header_len = u16::from_le_bytes([bytes[8], bytes[9]]);
        let record_len = u16::from_le_bytes([bytes[10], bytes[11]]);
        if (header_len as usize) < HEADER_LEN + 1 || record_len == 0 {
            return Err(DriverError::malformed(FORMAT, "invalid header or record length"));
        }

        let mut fields = Vec::new();
        let mut offset = HEADER_LEN;
        loop {
            match bytes.get(offset) {
                Some(&TERMINATOR) => break,
                Some(_) if offset + DESCRIPTOR_LEN <= bytes.len() => {}
                _ => return Err(DriverError::malformed(FORMAT, "missing field terminator")),
            }
            let descriptor = &bytes[offset..offset + DESCRIPTOR_LEN];
            let raw_name = &descriptor[..11];
            let end = raw_name.iter().position(|b| *b == 0).unwrap_or(raw_name.len());
            fields.push(DbfField {
                name: String::from_utf8_lossy(&raw_name[..end]).trim().to_string(),
                kind: descriptor[11].to_ascii_uppercase(),
                length: descriptor[16],
                decimals: descriptor[17],
            });
            offset += DESCRIPTOR_LEN;
        }

        let expected: usize = 1 + fields.iter().map(|f| f.length as usize).sum::<usize>();
        if expected != record_len as usize {
            return Err(DriverError::malformed(
                FORMAT,
                format!("record length {} does not match fields ({})", record_len, expected),
            ));
        }

        Ok(Self {
            record_count,
            header_len,
            record_len,
            fields,
        })
    }

    pub fn read(path: &Path) -> Result<Self, DriverError> {
        let mut file = File::open(path)?;
        let mut prefix = [0u8; HEADER_LEN];
        file.read_exact(&mut prefix)
            .map_err(|_| DriverError::malformed(FORMAT, "header truncated"))?;
        let header_len = u16::from_le_bytes([prefix[8], prefix[9]]) as usize;
        let mut bytes = prefix.to_vec();
        if header_len > HEADER_LEN {
            let mut rest = vec![0u8; header_len - HEADER_LEN];
            file.read_exact(&mut rest)
                .map_err(|_| DriverError::malformed(FORMAT, "field descriptors truncated"))?;
            bytes.extend_from_slice(&rest);
        }
        Self::parse(&bytes)
    }

    pub fn field_infos(&self) -> Vec<FieldInfo> {
        self.fields
            .iter()
            .map(|f| FieldInfo::new(f.name.clone(), f.type_name()))
            .collect()
    }

    /// Reads the first record's values, trimmed.
    pub fn read_first_record(&self, path: &Path) -> Result<Vec<String>, DriverError> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(u64::from(self.header_len)))?;
        let mut record = vec![0u8; self.record_len as usize];
        file.read_exact(&mut record)
            .map_err(|_| DriverError::malformed(FORMAT, "record truncated"))?;
        let mut values = Vec::with_capacity(self.fields.len());
        let mut offset = 1;
        for field in &self.fields {
            let end = offset + field.length as usize;
            values.push(String::from_utf8_lossy(&record[offset..end]).trim().to_string());
            offset = end;
        }
        Ok(values)
    }
}

fn has_sibling_shapefile(path: &Path) -> bool {
    ["shp", "SHP"].iter().any(|e| path.with_extension(e).is_file())
}

pub struct DbfDriver;

impl DatasetDriver for DbfDriver {
    fn short_name(&self) -> &'static str {
        "DBF"
    }

    fn long_name(&self) -> &'static str {
        "dBase table"
    }

    fn family(&self) -> DriverFamily {
        DriverFamily::Vector
    }

    fn open(&self, path: &Path, options: &ProbeOptions) -> Result<Vec<DriverLayer>, DriverError> {
        if extension(path).as_deref() != Some("dbf") || has_sibling_shapefile(path) {
            return Err(DriverError::NotRecognized);
        }
        let header = DbfHeader::read(path)?;
        let count = u64::from(header.record_count);

        let mut report = LayerReport {
            vector: Some(VectorAttributes {
                geometry_type: None,
                feature_count: Some(count),
                fields: header.field_infos(),
                has_z: false,
                has_m: false,
            }),
            ..LayerReport::default()
        };

        if options.validate {
            validate_vector(&mut report, true, count, || {
                match header.read_first_record(path) {
                    Ok(_) => FeatureSample::NoGeometry,
                    Err(_) => FeatureSample::Unreadable,
                }
            });
        }

        Ok(vec![DriverLayer {
            name: file_stem(path),
            data_type: DataType::Table,
            report,
        }])
    }
}
