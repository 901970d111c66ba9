//! World files and affine geotransforms.

use std::path::Path;

use crate::record::Extent;

/// GDAL-style affine transform: pixel `(col, row)` maps to
/// `x = origin_x + col * pixel_width + row * row_rotation`,
/// `y = origin_y + col * col_rotation + row * pixel_height`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub pixel_width: f64,
    pub row_rotation: f64,
    pub origin_y: f64,
    pub col_rotation: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// Transform from a north-up grid anchored at its upper-left corner.
    pub fn north_up(origin_x: f64, origin_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            origin_x,
            pixel_width,
            row_rotation: 0.0,
            origin_y,
            col_rotation: 0.0,
            pixel_height: -pixel_height.abs(),
        }
    }

    /// The identity transform GDAL reports for ungeoreferenced images.
    pub fn is_default(&self) -> bool {
        self.origin_x == 0.0
            && self.pixel_width == 1.0
            && self.row_rotation == 0.0
            && self.origin_y == 0.0
            && self.col_rotation == 0.0
            && self.pixel_height == 1.0
    }

    pub fn apply(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.origin_x + col * self.pixel_width + row * self.row_rotation,
            self.origin_y + col * self.col_rotation + row * self.pixel_height,
        )
    }

    /// Bounding extent of a `width` x `height` grid.
    pub fn extent(&self, width: u32, height: u32) -> Extent {
        let (w, h) = (f64::from(width), f64::from(height));
        let corners = [
            self.apply(0.0, 0.0),
            self.apply(w, 0.0),
            self.apply(w, h),
            self.apply(0.0, h),
        ];
        let [first, rest @ ..] = corners;
        let mut extent = Extent::new(first.0, first.1, first.0, first.1);
        for (x, y) in rest {
            extent.expand_to(x, y);
        }
        extent
    }

    pub fn pixel_size(&self) -> (f64, f64) {
        (self.pixel_width.abs(), self.pixel_height.abs())
    }
}

/// The six coefficients of an ESRI world file. Coordinates refer to the
/// centre of the upper-left pixel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorldFile {
    pub x_scale: f64,
    pub y_skew: f64,
    pub x_skew: f64,
    pub y_scale: f64,
    pub x_origin: f64,
    pub y_origin: f64,
}

impl WorldFile {
    pub fn parse(text: &str) -> Option<Self> {
        let values: Vec<f64> = text
            .split_whitespace()
            .take(6)
            .map(|v| v.parse::<f64>())
            .collect::<Result<_, _>>()
            .ok()?;
        if values.len() != 6 || values.iter().any(|v| !v.is_finite()) {
            return None;
        }
        Some(Self {
            x_scale: values[0],
            y_skew: values[1],
            x_skew: values[2],
            y_scale: values[3],
            x_origin: values[4],
            y_origin: values[5],
        })
    }

    pub fn read(path: &Path) -> Option<Self> {
        std::fs::read_to_string(path).ok().and_then(|t| Self::parse(&t))
    }

    /// Shifts the origin from the pixel centre to the pixel corner.
    pub fn to_geotransform(&self) -> GeoTransform {
        GeoTransform {
            origin_x: self.x_origin - self.x_scale / 2.0 - self.x_skew / 2.0,
            pixel_width: self.x_scale,
            row_rotation: self.x_skew,
            origin_y: self.y_origin - self.y_skew / 2.0 - self.y_scale / 2.0,
            col_rotation: self.y_skew,
            pixel_height: self.y_scale,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_world_file() {
        let wf = WorldFile::parse("10.0\n0.0\n0.0\n-10.0\n500005.0\n4600095.0\n").unwrap();
        assert_eq!(wf.x_scale, 10.0);
        assert_eq!(wf.y_scale, -10.0);
        let gt = wf.to_geotransform();
        assert_eq!(gt.origin_x, 500000.0);
        assert_eq!(gt.origin_y, 4600100.0);
    }

    #[test]
    fn test_parse_rejects_short_or_garbage() {
        assert!(WorldFile::parse("1\n2\n3").is_none());
        assert!(WorldFile::parse("a b c d e f").is_none());
    }

    #[test]
    fn test_extent_of_north_up_grid() {
        let gt = GeoTransform::north_up(100.0, 200.0, 2.0, 4.0);
        let extent = gt.extent(10, 5);
        assert_eq!(extent, Extent::new(100.0, 180.0, 120.0, 200.0));
        assert_eq!(gt.pixel_size(), (2.0, 4.0));
    }
}
