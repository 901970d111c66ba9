//! Coordinate reference systems and extent reprojection.

pub mod transform;
pub mod wkt;

use std::fmt;

use thiserror::Error;

pub use transform::{ExtentTransformer, Reprojection, GLOBAL_AUTHID};
pub use wkt::{WktError, WktNode};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CrsError {
    #[error("Invalid WKT: {0}")]
    Wkt(#[from] WktError),

    #[error("Unsupported coordinate reference system: {0}")]
    Unsupported(String),

    #[error("Invalid projection definition '{definition}': {reason}")]
    InvalidDefinition { definition: String, reason: String },

    #[error("Coordinate transformation failed: {0}")]
    Transform(String),

    #[error("Transformed coordinates out of range: {0}")]
    OutOfRange(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AuthorityCode {
    pub authority: String,
    pub code: String,
}

impl AuthorityCode {
    pub fn epsg(code: u32) -> Self {
        Self {
            authority: "EPSG".to_string(),
            code: code.to_string(),
        }
    }

    pub fn epsg_code(&self) -> Option<u32> {
        if self.authority.eq_ignore_ascii_case("EPSG") {
            self.code.parse().ok()
        } else {
            None
        }
    }
}

impl fmt::Display for AuthorityCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.authority.to_ascii_uppercase(), self.code)
    }
}

/// A reference frame as found in a dataset: an authority code, a WKT
/// definition, or both.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CrsDefinition {
    pub authority: Option<AuthorityCode>,
    pub wkt: Option<String>,
}

impl CrsDefinition {
    pub fn epsg(code: u32) -> Self {
        Self {
            authority: Some(AuthorityCode::epsg(code)),
            wkt: None,
        }
    }

    /// Builds a definition from WKT text. The authority comes from the
    /// outermost `AUTHORITY`/`ID` node, or from well-known CRS names when the
    /// WKT carries none (typical of ESRI `.prj` files). Unparseable WKT is
    /// kept verbatim without an authority.
    pub fn from_wkt(wkt: &str) -> Self {
        let trimmed = wkt.trim().trim_start_matches('\u{feff}');
        let authority = WktNode::parse(trimmed).ok().and_then(|root| {
            root.authority()
                .map(|(authority, code)| AuthorityCode { authority, code })
                .or_else(|| root.name().and_then(epsg_from_name).map(AuthorityCode::epsg))
        });
        Self {
            authority,
            wkt: Some(trimmed.to_string()),
        }
    }

    /// Parses an authority string such as `EPSG:3857`,
    /// `urn:ogc:def:crs:EPSG::3857` or `urn:ogc:def:crs:OGC:1.3:CRS84`.
    pub fn from_authority_string(value: &str) -> Option<Self> {
        let value = value.trim();
        let upper = value.to_ascii_uppercase();
        if upper.ends_with("CRS84") || upper.ends_with("CRS:84") {
            return Some(Self::epsg(4326));
        }
        let mut parts = value.split(':').filter(|p| !p.is_empty());
        let mut authority = None;
        let mut code = None;
        while let Some(part) = parts.next() {
            if part.eq_ignore_ascii_case("EPSG") {
                authority = Some("EPSG");
                code = parts.last();
                break;
            }
        }
        let code: u32 = code?.trim().parse().ok()?;
        authority.map(|_| Self::epsg(code))
    }

    pub fn authid(&self) -> Option<String> {
        self.authority.as_ref().map(|a| a.to_string())
    }

    pub fn epsg_code(&self) -> Option<u32> {
        self.authority.as_ref().and_then(AuthorityCode::epsg_code)
    }

    pub fn is_empty(&self) -> bool {
        self.authority.is_none() && self.wkt.is_none()
    }

    /// PROJ.4 definition used for transformation.
    pub fn proj4(&self) -> Result<String, CrsError> {
        if let Some(code) = self.epsg_code() {
            if let Some(def) = u16::try_from(code).ok().and_then(crs_definitions::from_code) {
                return Ok(def.proj4.to_string());
            }
        }
        if let Some(wkt) = &self.wkt {
            let root = WktNode::parse(wkt)?;
            if let Some(proj) = wkt::to_proj4(&root) {
                return Ok(proj);
            }
        }
        Err(CrsError::Unsupported(self.to_string()))
    }
}

impl fmt::Display for CrsDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.authority, &self.wkt) {
            (Some(a), _) => write!(f, "{}", a),
            (None, Some(wkt)) => {
                let name = WktNode::parse(wkt)
                    .ok()
                    .and_then(|n| n.name().map(str::to_string));
                write!(f, "{}", name.unwrap_or_else(|| "custom WKT".to_string()))
            }
            (None, None) => f.write_str("undefined"),
        }
    }
}

/// EPSG code for CRS names commonly written without an authority.
pub(crate) fn epsg_from_name(name: &str) -> Option<u32> {
    let n = wkt::normalize_name(name);
    match n.as_str() {
        "gcs_wgs_1984" | "wgs_84" | "wgs84" | "wgs_1984" => return Some(4326),
        "gcs_north_american_1983" | "nad83" | "nad_83" => return Some(4269),
        "gcs_north_american_1927" | "nad27" => return Some(4267),
        "gcs_etrs_1989" | "etrs89" => return Some(4258),
        "wgs_1984_web_mercator_auxiliary_sphere"
        | "wgs_84_pseudo_mercator"
        | "wgs_84_pseudo_mercator_epsg_3857"
        | "wgs_1984_web_mercator" => return Some(3857),
        _ => {}
    }

    let (datum, zone) = utm_zone(&n)?;
    let (number, north) = zone;
    match datum {
        "wgs_1984" | "wgs_84" if (1..=60).contains(&number) => {
            Some(if north { 32600 } else { 32700 } + number)
        }
        "nad_1983" | "nad83" if north && (1..=23).contains(&number) => Some(26900 + number),
        "nad_1927" | "nad27" if north && (1..=22).contains(&number) => Some(26700 + number),
        "etrs_1989" | "etrs89" if north && (28..=38).contains(&number) => Some(25800 + number),
        _ => None,
    }
}

/// Splits `wgs_1984_utm_zone_33n` into `("wgs_1984", (33, true))`.
fn utm_zone(normalized: &str) -> Option<(&str, (u32, bool))> {
    let idx = normalized.find("_utm_zone_")?;
    let datum = &normalized[..idx];
    let zone = &normalized[idx + "_utm_zone_".len()..];
    let digits: String = zone.chars().take_while(|c| c.is_ascii_digit()).collect();
    let number: u32 = digits.parse().ok()?;
    let north = match &zone[digits.len()..] {
        "n" | "" => true,
        "s" => false,
        _ => return None,
    };
    Some((datum, (number, north)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authority_from_wkt() {
        let crs = CrsDefinition::from_wkt(
            r#"GEOGCS["WGS 84",DATUM["WGS_1984",SPHEROID["WGS 84",6378137,298.257223563]],AUTHORITY["EPSG","4326"]]"#,
        );
        assert_eq!(crs.authid().as_deref(), Some("EPSG:4326"));
        assert_eq!(crs.epsg_code(), Some(4326));
    }

    #[test]
    fn test_authority_from_esri_name() {
        let crs = CrsDefinition::from_wkt(
            r#"PROJCS["WGS_1984_UTM_Zone_33N",GEOGCS["GCS_WGS_1984",DATUM["D_WGS_1984",SPHEROID["WGS_1984",6378137.0,298.257223563]]],PROJECTION["Transverse_Mercator"],UNIT["Meter",1.0]]"#,
        );
        assert_eq!(crs.epsg_code(), Some(32633));
    }

    #[test]
    fn test_epsg_from_name_variants() {
        assert_eq!(epsg_from_name("GCS_WGS_1984"), Some(4326));
        assert_eq!(epsg_from_name("WGS 84 / UTM zone 12S"), Some(32712));
        assert_eq!(epsg_from_name("NAD_1983_UTM_Zone_10N"), Some(26910));
        assert_eq!(epsg_from_name("WGS 84 / Pseudo-Mercator"), Some(3857));
        assert_eq!(epsg_from_name("WGS_1984_UTM_Zone_99N"), None);
        assert_eq!(epsg_from_name("Local grid"), None);
    }

    #[test]
    fn test_from_authority_string() {
        assert_eq!(
            CrsDefinition::from_authority_string("urn:ogc:def:crs:EPSG::3857"),
            Some(CrsDefinition::epsg(3857))
        );
        assert_eq!(
            CrsDefinition::from_authority_string("EPSG:32633"),
            Some(CrsDefinition::epsg(32633))
        );
        assert_eq!(
            CrsDefinition::from_authority_string("urn:ogc:def:crs:OGC:1.3:CRS84"),
            Some(CrsDefinition::epsg(4326))
        );
        assert_eq!(CrsDefinition::from_authority_string("local"), None);
    }

    #[test]
    fn test_proj4_from_epsg_registry() {
        let proj = CrsDefinition::epsg(32633).proj4().unwrap();
        assert!(proj.contains("+proj=utm"));
        assert!(proj.contains("+zone=33"));
    }

    #[test]
    fn test_garbage_wkt_keeps_text_without_authority() {
        let crs = CrsDefinition::from_wkt("garbage");
        assert!(crs.authority.is_none());
        assert_eq!(crs.wkt.as_deref(), Some("garbage"));
        assert!(crs.proj4().is_err());
    }
}
