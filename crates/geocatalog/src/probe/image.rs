//! Plain images that become rasters when a world file sits next to them.

use std::path::Path;

use image::{ImageDecoder, ImageFormat, ImageReader};

use super::{
    file_stem, validate_raster, DatasetDriver, DriverError, DriverFamily, DriverLayer,
    LayerReport, ProbeOptions, MAX_REPORTED_BANDS,
};
use crate::record::{BandInfo, DataType, GeoreferenceMethod, RasterAttributes};
use crate::sidecar;

/// One driver per image container, so the catalog records the exact format.
pub struct ImageDriver {
    format: ImageFormat,
    short_name: &'static str,
    long_name: &'static str,
}

impl ImageDriver {
    pub fn png() -> Self {
        Self {
            format: ImageFormat::Png,
            short_name: "PNG",
            long_name: "Portable Network Graphics",
        }
    }

    pub fn jpeg() -> Self {
        Self {
            format: ImageFormat::Jpeg,
            short_name: "JPEG",
            long_name: "JPEG JFIF",
        }
    }

    pub fn gif() -> Self {
        Self {
            format: ImageFormat::Gif,
            short_name: "GIF",
            long_name: "Graphics Interchange Format (.gif)",
        }
    }

    pub fn bmp() -> Self {
        Self {
            format: ImageFormat::Bmp,
            short_name: "BMP",
            long_name: "MS Windows Device Independent Bitmap",
        }
    }

    pub fn all() -> Vec<Self> {
        vec![Self::png(), Self::jpeg(), Self::gif(), Self::bmp()]
    }
}

fn sample_type(bytes_per_channel: u8) -> &'static str {
    match bytes_per_channel {
        1 => "Byte",
        2 => "UInt16",
        4 => "Float32",
        _ => "Unknown",
    }
}

impl DatasetDriver for ImageDriver {
    fn short_name(&self) -> &'static str {
        self.short_name
    }

    fn long_name(&self) -> &'static str {
        self.long_name
    }

    fn family(&self) -> DriverFamily {
        DriverFamily::Raster
    }

    fn open(&self, path: &Path, options: &ProbeOptions) -> Result<Vec<DriverLayer>, DriverError> {
        let reader = ImageReader::open(path)?.with_guessed_format()?;
        if reader.format() != Some(self.format) {
            return Err(DriverError::NotRecognized);
        }
        let decoder = reader
            .into_decoder()
            .map_err(|e| DriverError::malformed(self.short_name, e.to_string()))?;
        let (width, height) = decoder.dimensions();
        let color = decoder.color_type();
        let channels = color.channel_count();
        let per_channel = color.bytes_per_pixel() / channels.max(1);

        let transform = sidecar::read_world_file(path);
        let crs = sidecar::read_aux_srs(path).or_else(|| sidecar::read_prj(path));
        let bands = (0..usize::from(channels).min(MAX_REPORTED_BANDS))
            .map(|_| BandInfo {
                data_type: sample_type(per_channel).to_string(),
                nodata: None,
            })
            .collect();

        let mut report = LayerReport {
            crs,
            native_extent: transform.map(|t| t.extent(width, height)),
            raster: Some(RasterAttributes {
                width,
                height,
                band_count: u32::from(channels),
                pixel_size: transform.map(|t| t.pixel_size()),
                bands,
                compression: None,
                georeference: if transform.is_some() {
                    GeoreferenceMethod::Sidecar
                } else {
                    GeoreferenceMethod::None
                },
            }),
            ..LayerReport::default()
        };

        if options.validate {
            validate_raster(&mut report, transform.is_some(), || {
                let total = usize::try_from(decoder.total_bytes()).map_err(|e| e.to_string())?;
                let mut buf = vec![0u8; total];
                decoder.read_image(&mut buf).map_err(|e| e.to_string())
            });
        }

        Ok(vec![DriverLayer {
            name: file_stem(path),
            data_type: DataType::Raster,
            report,
        }])
    }
}
