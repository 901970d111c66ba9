//! Arc/Info ASCII grids (`.asc`).

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use super::{
    extension, file_stem, validate_raster, DatasetDriver, DriverError, DriverFamily, DriverLayer,
    LayerReport, ProbeOptions,
};
use crate::record::{BandInfo, DataType, GeoreferenceMethod, RasterAttributes};
use crate::sidecar::{self, GeoTransform};

const FORMAT: &str = "AAIGrid";

pub struct AsciiGridDriver;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct GridHeader {
    pub ncols: u32,
    pub nrows: u32,
    pub x_ll: f64,
    pub y_ll: f64,
    /// `xllcenter`/`yllcenter` rather than corner.
    pub centered: bool,
    pub cell_x: f64,
    pub cell_y: f64,
    pub nodata: Option<f64>,
    /// Number of header lines.
    pub lines: usize,
}

impl GridHeader {
    pub fn parse<R: BufRead>(reader: &mut R) -> Result<Self, DriverError> {
        let mut ncols = None;
        let mut nrows = None;
        let mut x_ll = None;
        let mut y_ll = None;
        let mut centered = false;
        let mut cell_x = None;
        let mut cell_y = None;
        let mut nodata = None;
        let mut lines = 0;

        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                break;
            }
            let mut parts = line.split_whitespace();
            let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
                break;
            };
            if key.starts_with(|c: char| c.is_ascii_digit() || c == '-' || c == '.') {
                break;
            }
            let number = value.parse::<f64>().ok();
            match key.to_ascii_lowercase().as_str() {
                "ncols" => ncols = value.parse::<u32>().ok(),
                "nrows" => nrows = value.parse::<u32>().ok(),
                "xllcorner" => x_ll = number,
                "yllcorner" => y_ll = number,
                "xllcenter" => {
                    x_ll = number;
                    centered = true;
                }
                "yllcenter" => {
                    y_ll = number;
                    centered = true;
                }
                "cellsize" => {
                    cell_x = number;
                    cell_y = number;
                }
                "dx" => cell_x = number,
                "dy" => cell_y = number,
                "nodata_value" => nodata = number,
                _ if lines == 0 => return Err(DriverError::NotRecognized),
                _ => break,
            }
            lines += 1;
        }

        if ncols.is_none() {
            return Err(DriverError::NotRecognized);
        }
        match (ncols, nrows, x_ll, y_ll, cell_x, cell_y) {
            (Some(ncols), Some(nrows), Some(x_ll), Some(y_ll), Some(cell_x), Some(cell_y))
                if cell_x > 0.0 && cell_y > 0.0 =>
            {
                Ok(Self {
                    ncols,
                    nrows,
                    x_ll,
                    y_ll,
                    centered,
                    cell_x,
                    cell_y,
                    nodata,
                    lines,
                })
            }
            _ => Err(DriverError::malformed(FORMAT, "incomplete grid header")),
        }
    }

    pub fn transform(&self) -> GeoTransform {
        let (mut x, mut y) = (self.x_ll, self.y_ll);
        if self.centered {
            x -= self.cell_x / 2.0;
            y -= self.cell_y / 2.0;
        }
        GeoTransform::north_up(x, y + f64::from(self.nrows) * self.cell_y, self.cell_x, self.cell_y)
    }
}

/// Reads the first data row, checking it holds `ncols` numbers. Returns
/// whether every value was an integer.
fn read_first_row<R: BufRead>(reader: &mut R, ncols: u32) -> Result<bool, String> {
    let mut values = Vec::with_capacity(ncols as usize);
    let mut line = String::new();
    while values.len() < ncols as usize {
        line.clear();
        let n = reader.read_line(&mut line).map_err(|e| e.to_string())?;
        if n == 0 {
            return Err(format!("expected {} values, found {}", ncols, values.len()));
        }
        for token in line.split_whitespace() {
            values.push(token.to_string());
        }
    }
    let mut integral = true;
    for token in values.iter().take(ncols as usize) {
        if token.parse::<f64>().is_err() {
            return Err(format!("invalid cell value '{}'", token));
        }
        if token.contains(['.', 'e', 'E']) {
            integral = false;
        }
    }
    Ok(integral)
}

impl DatasetDriver for AsciiGridDriver {
    fn short_name(&self) -> &'static str {
        FORMAT
    }

    fn long_name(&self) -> &'static str {
        "Arc/Info ASCII Grid"
    }

    fn family(&self) -> DriverFamily {
        DriverFamily::Raster
    }

    fn open(&self, path: &Path, options: &ProbeOptions) -> Result<Vec<DriverLayer>, DriverError> {
        if extension(path).as_deref() != Some("asc") {
            return Err(DriverError::NotRecognized);
        }
        let mut reader = BufReader::new(File::open(path)?);
        let header = GridHeader::parse(&mut reader)?;

        let mut reopened = BufReader::new(File::open(path)?);
        let mut skipped = String::new();
        for _ in 0..header.lines {
            skipped.clear();
            reopened.read_line(&mut skipped)?;
        }
        let first_row = read_first_row(&mut reopened, header.ncols);
        let data_type = match (&first_row, header.nodata) {
            (Ok(true), nodata) if nodata.map(|v| v.fract() == 0.0).unwrap_or(true) => "Int32",
            _ => "Float32",
        };

        let transform = header.transform();
        let mut report = LayerReport {
            crs: sidecar::read_prj(path),
            native_extent: Some(transform.extent(header.ncols, header.nrows)),
            raster: Some(RasterAttributes {
                width: header.ncols,
                height: header.nrows,
                band_count: 1,
                pixel_size: Some(transform.pixel_size()),
                bands: vec![BandInfo {
                    data_type: data_type.to_string(),
                    nodata: header.nodata,
                }],
                compression: None,
                georeference: GeoreferenceMethod::Header,
            }),
            ..LayerReport::default()
        };

        if options.validate {
            validate_raster(&mut report, true, || first_row.map(|_| ()));
        }

        Ok(vec![DriverLayer {
            name: file_stem(path),
            data_type: DataType::Raster,
            report,
        }])
    }
}
