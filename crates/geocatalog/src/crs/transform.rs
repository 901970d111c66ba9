//! Reprojection of native extents into the catalog's global frame.

use proj4rs::proj::Proj;

use super::{CrsDefinition, CrsError};
use crate::record::{ExtractionIssue, Extent, Footprint, IssueStage};

/// Authority id of the catalog's global frame.
pub const GLOBAL_AUTHID: &str = "EPSG:4326";
pub const GLOBAL_EPSG: u32 = 4326;

const GLOBAL_PROJ4: &str = "+proj=longlat +ellps=WGS84 +no_defs";
const RANGE_TOLERANCE: f64 = 1e-6;
/// Points sampled along each extent edge, corners included.
const EDGE_SAMPLES: usize = 21;

/// Result of moving an extent into the global frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Reprojection {
    pub extent: Extent,
    pub footprint: Footprint,
    /// False when the native extent was passed through untouched.
    pub reprojected: bool,
    pub issue: Option<ExtractionIssue>,
}

struct Frame {
    proj: Proj,
    latlong: bool,
}

impl Frame {
    fn from_proj4(definition: &str) -> Result<Self, CrsError> {
        let cleaned = sanitize_proj4(definition);
        let proj = Proj::from_proj_string(&cleaned).map_err(|e| CrsError::InvalidDefinition {
            definition: cleaned.clone(),
            reason: format!("{:?}", e),
        })?;
        Ok(Self {
            proj,
            latlong: is_latlong(&cleaned),
        })
    }
}

/// Reprojects extents into EPSG:4326 longitude/latitude through their
/// densified outline.
pub struct ExtentTransformer {
    global: Frame,
}

impl ExtentTransformer {
    pub fn new() -> Result<Self, CrsError> {
        Ok(Self {
            global: Frame::from_proj4(GLOBAL_PROJ4)?,
        })
    }

    /// Native → global.
    pub fn to_global(&self, extent: &Extent, crs: &CrsDefinition) -> Result<Extent, CrsError> {
        if crs.epsg_code() == Some(GLOBAL_EPSG) {
            return check_global_range(*extent);
        }
        let source = Frame::from_proj4(&crs.proj4()?)?;
        let out = transform_extent(&source, &self.global, extent)?;
        check_global_range(out)
    }

    /// Global → native.
    pub fn from_global(&self, extent: &Extent, crs: &CrsDefinition) -> Result<Extent, CrsError> {
        if crs.epsg_code() == Some(GLOBAL_EPSG) {
            return Ok(*extent);
        }
        let target = Frame::from_proj4(&crs.proj4()?)?;
        transform_extent(&self.global, &target, extent)
    }

    /// Reprojects with fallback: on any failure, or without a CRS, the
    /// native extent is passed through and an issue describes why. A
    /// missing CRS is a finding; a failed transformation is a failure.
    pub fn reproject(&self, native: &Extent, crs: Option<&CrsDefinition>) -> Reprojection {
        let crs = match crs {
            Some(crs) if !crs.is_empty() => crs,
            _ => {
                return Reprojection {
                    extent: *native,
                    footprint: Footprint::from_extent(native),
                    reprojected: false,
                    issue: Some(ExtractionIssue::finding(
                        IssueStage::Transform,
                        format!(
                            "Extent not reprojected to {}: no coordinate reference system",
                            GLOBAL_AUTHID
                        ),
                    )),
                }
            }
        };
        match self.to_global(native, crs) {
            Ok(extent) => Reprojection {
                extent,
                footprint: Footprint::from_extent(&extent),
                reprojected: true,
                issue: None,
            },
            Err(err) => Reprojection {
                extent: *native,
                footprint: Footprint::from_extent(native),
                reprojected: false,
                issue: Some(ExtractionIssue::failure(
                    IssueStage::Transform,
                    format!("Extent not reprojected to {}: {}", GLOBAL_AUTHID, err),
                )),
            },
        }
    }
}

/// Outline of an extent with `EDGE_SAMPLES` points per edge, so curved
/// images of straight edges keep their interior extremes.
fn densify(extent: &Extent) -> Vec<(f64, f64)> {
    let corners = extent.corners();
    let steps = EDGE_SAMPLES - 1;
    let mut points = Vec::with_capacity(4 * steps);
    for (i, &(x0, y0)) in corners.iter().enumerate() {
        let (x1, y1) = corners[(i + 1) % corners.len()];
        for step in 0..steps {
            let t = step as f64 / steps as f64;
            points.push((x0 + (x1 - x0) * t, y0 + (y1 - y0) * t));
        }
    }
    points
}

fn transform_extent(source: &Frame, target: &Frame, extent: &Extent) -> Result<Extent, CrsError> {
    let outline = densify(extent);
    let mut points = Vec::with_capacity(outline.len());
    for (x, y) in outline {
        let mut point = if source.latlong {
            (x.to_radians(), y.to_radians(), 0.0)
        } else {
            (x, y, 0.0)
        };
        proj4rs::transform::transform(&source.proj, &target.proj, &mut point)
            .map_err(|e| CrsError::Transform(format!("{:?}", e)))?;
        let (ox, oy) = if target.latlong {
            (point.0.to_degrees(), point.1.to_degrees())
        } else {
            (point.0, point.1)
        };
        if !ox.is_finite() || !oy.is_finite() {
            return Err(CrsError::Transform(format!(
                "non-finite result for point ({}, {})",
                x, y
            )));
        }
        points.push((ox, oy));
    }
    Extent::from_points(points).ok_or_else(|| CrsError::Transform("empty extent".to_string()))
}

fn check_global_range(extent: Extent) -> Result<Extent, CrsError> {
    let lon_ok = extent.min_x >= -180.0 - RANGE_TOLERANCE && extent.max_x <= 180.0 + RANGE_TOLERANCE;
    let lat_ok = extent.min_y >= -90.0 - RANGE_TOLERANCE && extent.max_y <= 90.0 + RANGE_TOLERANCE;
    if extent.is_finite() && lon_ok && lat_ok {
        Ok(extent)
    } else {
        Err(CrsError::OutOfRange(extent.to_text()))
    }
}

fn is_latlong(definition: &str) -> bool {
    definition.split_whitespace().any(|token| {
        matches!(
            token,
            "+proj=longlat" | "+proj=latlong" | "+proj=lonlat" | "+proj=latlon"
        )
    })
}

/// Drops datum-shift parameters so every frame shares the WGS 84 datum.
fn sanitize_proj4(definition: &str) -> String {
    let mut tokens: Vec<String> = Vec::new();
    let mut has_ellipsoid = definition
        .split_whitespace()
        .any(|t| t.starts_with("+ellps=") || t.starts_with("+a=") || t.starts_with("+R="));
    for token in definition.split_whitespace() {
        if token.starts_with("+nadgrids=") || token.starts_with("+towgs84=") || token == "+wktext" {
            continue;
        }
        if let Some(datum) = token.strip_prefix("+datum=") {
            if !has_ellipsoid {
                let ellps = match datum.to_ascii_uppercase().as_str() {
                    "NAD27" => "clrk66",
                    "NAD83" => "GRS80",
                    "OSGB36" => "airy",
                    "POTSDAM" => "bessel",
                    _ => "WGS84",
                };
                tokens.push(format!("+ellps={}", ellps));
                has_ellipsoid = true;
            }
            continue;
        }
        tokens.push(token.to_string());
    }
    tokens.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f64, b: f64, tolerance: f64) {
        assert!((a - b).abs() <= tolerance, "{} != {} (±{})", a, b, tolerance);
    }

    fn assert_extent_close(a: &Extent, b: &Extent, tolerance: f64) {
        assert_close(a.min_x, b.min_x, tolerance);
        assert_close(a.min_y, b.min_y, tolerance);
        assert_close(a.max_x, b.max_x, tolerance);
        assert_close(a.max_y, b.max_y, tolerance);
    }

    #[test]
    fn test_global_crs_is_identity() {
        let transformer = ExtentTransformer::new().unwrap();
        let extent = Extent::new(-10.0, 40.0, 5.0, 50.0);
        let out = transformer.to_global(&extent, &CrsDefinition::epsg(4326)).unwrap();
        assert_eq!(out, extent);
    }

    #[test]
    fn test_utm_central_meridian_maps_to_zone_longitude() {
        let transformer = ExtentTransformer::new().unwrap();
        let extent = Extent::new(500000.0, 0.0, 500000.0, 0.0);
        let out = transformer.to_global(&extent, &CrsDefinition::epsg(32633)).unwrap();
        assert_close(out.min_x, 15.0, 1e-6);
        assert_close(out.min_y, 0.0, 1e-6);
    }

    #[test]
    fn test_web_mercator_round_trip() {
        let transformer = ExtentTransformer::new().unwrap();
        let crs = CrsDefinition::epsg(3857);
        let native = Extent::new(-1_113_194.9, 4_865_942.3, 1_113_194.9, 6_446_275.8);
        let global = transformer.to_global(&native, &crs).unwrap();
        assert!(global.min_x < 0.0 && global.max_x > 0.0);
        let back = transformer.from_global(&global, &crs).unwrap();
        assert_extent_close(&back, &native, 1e-3);
    }

    #[test]
    fn test_utm_round_trip_from_wkt() {
        let transformer = ExtentTransformer::new().unwrap();
        let crs = CrsDefinition {
            authority: None,
            wkt: Some(r#"PROJCS["custom tm",GEOGCS["WGS 84",DATUM["WGS_1984",SPHEROID["WGS 84",6378137,298.257223563]]],PROJECTION["Transverse_Mercator"],PARAMETER["latitude_of_origin",0],PARAMETER["central_meridian",15],PARAMETER["scale_factor",0.9996],PARAMETER["false_easting",500000],PARAMETER["false_northing",0],UNIT["metre",1]]"#.to_string()),
        };
        let native = Extent::new(480000.0, 4_650_000.0, 480000.0, 4_650_000.0);
        let global = transformer.to_global(&native, &crs).unwrap();
        let back = transformer.from_global(&global, &crs).unwrap();
        assert_extent_close(&back, &native, 1e-3);
    }

    #[test]
    fn test_densified_outline_covers_every_edge() {
        let outline = densify(&Extent::new(0.0, 0.0, 20.0, 10.0));
        assert_eq!(outline.len(), 4 * (EDGE_SAMPLES - 1));
        assert_eq!(outline[0], (0.0, 0.0));
        assert!(outline.contains(&(10.0, 0.0)));
        assert!(outline.contains(&(20.0, 5.0)));
        assert!(outline.contains(&(10.0, 10.0)));
        assert!(outline.contains(&(0.0, 5.0)));
    }

    #[test]
    fn test_envelope_keeps_edge_interior_extreme() {
        // Constant northing across the central meridian: latitude peaks at
        // the meridian, halfway along the top edge.
        let transformer = ExtentTransformer::new().unwrap();
        let crs = CrsDefinition::epsg(32633);
        let native = Extent::new(490000.0, 4_600_000.0, 510000.0, 4_610_000.0);
        let global = transformer.to_global(&native, &crs).unwrap();

        let top_middle = Extent::new(500000.0, 4_610_000.0, 500000.0, 4_610_000.0);
        let peak = transformer.to_global(&top_middle, &crs).unwrap();
        let top_corner = Extent::new(510000.0, 4_610_000.0, 510000.0, 4_610_000.0);
        let corner = transformer.to_global(&top_corner, &crs).unwrap();

        assert!(peak.max_y > corner.max_y);
        assert!(global.max_y >= peak.max_y - 1e-12, "{:?} vs {:?}", global, peak);
    }

    #[test]
    fn test_reproject_falls_back_without_crs() {
        let transformer = ExtentTransformer::new().unwrap();
        let native = Extent::new(100.0, 200.0, 300.0, 400.0);
        let result = transformer.reproject(&native, None);
        assert!(!result.reprojected);
        assert_eq!(result.extent, native);
        assert_eq!(result.footprint.ring[0], (100.0, 200.0));
        assert!(!result.issue.unwrap().is_failure());
    }

    #[test]
    fn test_reproject_flags_out_of_range_geographic() {
        let transformer = ExtentTransformer::new().unwrap();
        // Projected metres mislabelled as EPSG:4326.
        let native = Extent::new(500000.0, 4_000_000.0, 510000.0, 4_010_000.0);
        let result = transformer.reproject(&native, Some(&CrsDefinition::epsg(4326)));
        assert!(!result.reprojected);
        assert_eq!(result.extent, native);
        assert!(result.issue.unwrap().is_failure());
    }

    #[test]
    fn test_sanitize_drops_datum_shift() {
        let cleaned = sanitize_proj4(
            "+proj=merc +a=6378137 +b=6378137 +nadgrids=@null +wktext +no_defs",
        );
        assert_eq!(cleaned, "+proj=merc +a=6378137 +b=6378137 +no_defs");
        let cleaned = sanitize_proj4("+proj=utm +zone=33 +datum=WGS84 +units=m +no_defs");
        assert_eq!(cleaned, "+proj=utm +zone=33 +ellps=WGS84 +units=m +no_defs");
    }
}
