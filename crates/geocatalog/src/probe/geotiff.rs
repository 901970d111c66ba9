//! GeoTIFF rasters through the `tiff` decoder.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use tiff::decoder::ifd::Value;
use tiff::decoder::Decoder;
use tiff::tags::Tag;
use tiff::TiffError;

use super::{
    file_stem, validate_raster, DatasetDriver, DriverError, DriverFamily, DriverLayer,
    LayerReport, ProbeOptions, MAX_REPORTED_BANDS,
};
use crate::crs::CrsDefinition;
use crate::record::{BandInfo, DataType, GeoreferenceMethod, RasterAttributes};
use crate::sidecar::{self, GeoTransform};

const FORMAT: &str = "GTiff";

const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const MODEL_TRANSFORMATION: u16 = 34264;
const GEO_KEY_DIRECTORY: u16 = 34735;
const GDAL_NODATA: u16 = 42113;

const KEY_RASTER_TYPE: u16 = 1025;
const KEY_GEOGRAPHIC_TYPE: u16 = 2048;
const KEY_PROJECTED_CS_TYPE: u16 = 3072;
const USER_DEFINED: u16 = 32767;
const RASTER_PIXEL_IS_POINT: u16 = 2;

pub struct GeoTiffDriver;

fn is_tiff(path: &Path) -> bool {
    let mut magic = [0u8; 4];
    let read = File::open(path).and_then(|mut f| f.read_exact(&mut magic));
    read.is_ok() && matches!(&magic, b"II*\0" | b"MM\0*" | b"II+\0" | b"MM\0+")
}

fn tiff_err(e: TiffError) -> DriverError {
    match e {
        TiffError::IoError(io) => DriverError::Io(io),
        other => DriverError::malformed(FORMAT, other.to_string()),
    }
}

/// GeoKey directory entries whose value is stored inline.
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct GeoKeys {
    entries: Vec<(u16, u16)>,
}

impl GeoKeys {
    pub fn parse(directory: &[u16]) -> Self {
        let Some(header) = directory.get(..4) else {
            return Self::default();
        };
        let count = header[3] as usize;
        let entries = directory[4..]
            .chunks_exact(4)
            .take(count)
            .filter(|e| e[1] == 0)
            .map(|e| (e[0], e[3]))
            .collect();
        Self { entries }
    }

    pub fn get(&self, key: u16) -> Option<u16> {
        self.entries.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
    }

    /// EPSG code of the projected or geographic system, if not user-defined.
    pub fn epsg(&self) -> Option<u32> {
        [KEY_PROJECTED_CS_TYPE, KEY_GEOGRAPHIC_TYPE]
            .iter()
            .filter_map(|k| self.get(*k))
            .find(|code| *code != 0 && *code != USER_DEFINED)
            .map(u32::from)
    }

    fn pixel_is_point(&self) -> bool {
        self.get(KEY_RASTER_TYPE) == Some(RASTER_PIXEL_IS_POINT)
    }
}

/// Geotransform from the model transformation matrix, or from the first
/// tie point and pixel scale.
pub(crate) fn embedded_transform(
    transformation: Option<&[f64]>,
    tiepoint: Option<&[f64]>,
    scale: Option<&[f64]>,
    pixel_is_point: bool,
) -> Option<GeoTransform> {
    let mut transform = if let Some(m) = transformation.filter(|m| m.len() >= 16) {
        GeoTransform {
            origin_x: m[3],
            pixel_width: m[0],
            row_rotation: m[1],
            origin_y: m[7],
            col_rotation: m[4],
            pixel_height: m[5],
        }
    } else {
        let tie = tiepoint.filter(|t| t.len() >= 6)?;
        let scale = scale.filter(|s| s.len() >= 2)?;
        GeoTransform {
            origin_x: tie[3] - tie[0] * scale[0],
            pixel_width: scale[0],
            row_rotation: 0.0,
            origin_y: tie[4] + tie[1] * scale[1],
            col_rotation: 0.0,
            pixel_height: -scale[1],
        }
    };
    if pixel_is_point {
        transform.origin_x -= transform.pixel_width / 2.0 + transform.row_rotation / 2.0;
        transform.origin_y -= transform.col_rotation / 2.0 + transform.pixel_height / 2.0;
    }
    let finite = [
        transform.origin_x,
        transform.pixel_width,
        transform.origin_y,
        transform.pixel_height,
    ]
    .iter()
    .all(|v| v.is_finite());
    (finite && transform.pixel_width != 0.0 && transform.pixel_height != 0.0).then_some(transform)
}

/// GDAL data type name for a sample layout.
pub(crate) fn band_type_name(bits: u16, sample_format: u16) -> &'static str {
    match (bits, sample_format) {
        (1..=8, 1) => "Byte",
        (8, 2) => "Int8",
        (16, 1) => "UInt16",
        (16, 2) => "Int16",
        (32, 1) => "UInt32",
        (32, 2) => "Int32",
        (32, 3) => "Float32",
        (64, 1) => "UInt64",
        (64, 2) => "Int64",
        (64, 3) => "Float64",
        _ => "Unknown",
    }
}

fn compression_name(code: u16) -> Option<&'static str> {
    match code {
        1 => None,
        2..=4 => Some("CCITT"),
        5 => Some("LZW"),
        6 | 7 => Some("JPEG"),
        8 | 32946 => Some("DEFLATE"),
        32773 => Some("PACKBITS"),
        34887 => Some("LERC"),
        34925 => Some("LZMA"),
        50000 => Some("ZSTD"),
        50001 => Some("WEBP"),
        _ => Some("UNKNOWN"),
    }
}

fn tag<R: Read + std::io::Seek>(decoder: &mut Decoder<R>, code: u16) -> Option<Value> {
    decoder.find_tag(Tag::from_u16_exhaustive(code)).ok().flatten()
}

fn f64_vec<R: Read + std::io::Seek>(decoder: &mut Decoder<R>, code: u16) -> Option<Vec<f64>> {
    tag(decoder, code).and_then(|v| v.into_f64_vec().ok())
}

/// SHORT values of a tag. A single SHORT decodes as `Value::Unsigned`, which
/// `into_u16_vec` rejects, so scalars and lists are unpacked separately.
fn u16_values<R: Read + std::io::Seek>(decoder: &mut Decoder<R>, code: u16) -> Option<Vec<u16>> {
    match tag(decoder, code)? {
        Value::List(items) => items.into_iter().map(|v| v.into_u16().ok()).collect(),
        scalar => scalar.into_u16().ok().map(|v| vec![v]),
    }
}

/// Per-sample value from a tag list; a single entry applies to every sample.
fn per_sample(values: &[u16], index: usize, default: u16) -> u16 {
    match values {
        [] => default,
        [only] => *only,
        many => many.get(index).copied().unwrap_or(many[0]),
    }
}

impl DatasetDriver for GeoTiffDriver {
    fn short_name(&self) -> &'static str {
        FORMAT
    }

    fn long_name(&self) -> &'static str {
        "GeoTIFF"
    }

    fn family(&self) -> DriverFamily {
        DriverFamily::Raster
    }

    fn open(&self, path: &Path, options: &ProbeOptions) -> Result<Vec<DriverLayer>, DriverError> {
        if !is_tiff(path) {
            return Err(DriverError::NotRecognized);
        }
        let mut decoder = Decoder::new(BufReader::new(File::open(path)?)).map_err(tiff_err)?;
        let (width, height) = decoder.dimensions().map_err(tiff_err)?;

        let samples = u16_values(&mut decoder, Tag::SamplesPerPixel.to_u16())
            .and_then(|v| v.first().copied())
            .unwrap_or(1);
        let bits = u16_values(&mut decoder, Tag::BitsPerSample.to_u16()).unwrap_or_default();
        let formats = u16_values(&mut decoder, Tag::SampleFormat.to_u16()).unwrap_or_default();
        let compression = u16_values(&mut decoder, Tag::Compression.to_u16())
            .and_then(|v| v.first().copied())
            .and_then(compression_name)
            .map(str::to_string);
        let nodata = tag(&mut decoder, GDAL_NODATA)
            .and_then(|v| v.into_string().ok())
            .and_then(|s| s.trim_matches(char::from(0)).trim().parse::<f64>().ok());

        let bands = (0..usize::from(samples).min(MAX_REPORTED_BANDS))
            .map(|i| {
                BandInfo {
                    data_type: band_type_name(per_sample(&bits, i, 1), per_sample(&formats, i, 1))
                        .to_string(),
                    nodata,
                }
            })
            .collect();

        let geokeys = u16_values(&mut decoder, GEO_KEY_DIRECTORY)
            .map(|d| GeoKeys::parse(&d))
            .unwrap_or_default();
        let embedded = embedded_transform(
            f64_vec(&mut decoder, MODEL_TRANSFORMATION).as_deref(),
            f64_vec(&mut decoder, MODEL_TIEPOINT).as_deref(),
            f64_vec(&mut decoder, MODEL_PIXEL_SCALE).as_deref(),
            geokeys.pixel_is_point(),
        );
        let (transform, georeference) = match embedded {
            Some(t) => (Some(t), GeoreferenceMethod::Embedded),
            None => match sidecar::read_world_file(path) {
                Some(t) => (Some(t), GeoreferenceMethod::Sidecar),
                None => (None, GeoreferenceMethod::None),
            },
        };

        let crs = geokeys
            .epsg()
            .map(CrsDefinition::epsg)
            .or_else(|| sidecar::read_aux_srs(path))
            .or_else(|| sidecar::read_prj(path));

        let mut report = LayerReport {
            crs,
            native_extent: transform.map(|t| t.extent(width, height)),
            raster: Some(RasterAttributes {
                width,
                height,
                band_count: u32::from(samples),
                pixel_size: transform.map(|t| t.pixel_size()),
                bands,
                compression,
                georeference,
            }),
            ..LayerReport::default()
        };

        if options.validate {
            validate_raster(&mut report, transform.is_some(), || {
                decoder.read_chunk(0).map(|_| ()).map_err(|e| e.to_string())
            });
        }

        Ok(vec![DriverLayer {
            name: file_stem(path),
            data_type: DataType::Raster,
            report,
        }])
    }
}
