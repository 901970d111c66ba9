//! Minimal WKT (1 and 2) reader.
//!
//! Only the bracket grammar is parsed; semantics are limited to what the
//! catalog needs: authority codes, the CRS name, and enough projection
//! parameters to build a PROJ.4 string for the common projection methods.

use std::fmt::Write as _;

use thiserror::Error;

const MAX_DEPTH: usize = 64;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WktError {
    #[error("unexpected end of WKT input")]
    UnexpectedEnd,

    #[error("unexpected character '{found}' at offset {offset}")]
    Unexpected { found: char, offset: usize },

    #[error("invalid number '{0}'")]
    InvalidNumber(String),

    #[error("WKT nesting deeper than {MAX_DEPTH} levels")]
    TooDeep,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WktValue {
    Text(String),
    Number(f64),
    /// Bare enumeration word, e.g. `EAST` in `AXIS["x",EAST]`.
    Word(String),
    Node(WktNode),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WktNode {
    pub keyword: String,
    pub values: Vec<WktValue>,
}

impl WktNode {
    pub fn parse(input: &str) -> Result<WktNode, WktError> {
        let mut parser = Parser { src: input, pos: 0 };
        let node = parser.node(0)?;
        parser.skip_ws();
        match parser.peek() {
            None => Ok(node),
            Some(c) => Err(WktError::Unexpected {
                found: c as char,
                offset: parser.pos,
            }),
        }
    }

    pub fn is(&self, keyword: &str) -> bool {
        self.keyword.eq_ignore_ascii_case(keyword)
    }

    /// The first quoted string, conventionally the object name.
    pub fn name(&self) -> Option<&str> {
        self.values.iter().find_map(|v| match v {
            WktValue::Text(s) => Some(s.as_str()),
            _ => None,
        })
    }

    /// The `index`-th numeric value.
    pub fn number(&self, index: usize) -> Option<f64> {
        self.values
            .iter()
            .filter_map(|v| match v {
                WktValue::Number(n) => Some(*n),
                _ => None,
            })
            .nth(index)
    }

    pub fn children(&self) -> impl Iterator<Item = &WktNode> {
        self.values.iter().filter_map(|v| match v {
            WktValue::Node(n) => Some(n),
            _ => None,
        })
    }

    /// First direct child with any of the given keywords.
    pub fn child(&self, keywords: &[&str]) -> Option<&WktNode> {
        self.children()
            .find(|c| keywords.iter().any(|k| c.is(k)))
    }

    /// First descendant (depth-first, self excluded) with any of the keywords.
    pub fn find(&self, keywords: &[&str]) -> Option<&WktNode> {
        for child in self.children() {
            if keywords.iter().any(|k| child.is(k)) {
                return Some(child);
            }
            if let Some(found) = child.find(keywords) {
                return Some(found);
            }
        }
        None
    }

    /// `(authority, code)` declared directly on this node, from
    /// `AUTHORITY["EPSG","4326"]` or `ID["EPSG",4326]`.
    pub fn authority(&self) -> Option<(String, String)> {
        let node = self.child(&["AUTHORITY", "ID"])?;
        let authority = node.name()?.to_string();
        let code = node.values.iter().skip(1).find_map(|v| match v {
            WktValue::Text(s) => Some(s.clone()),
            WktValue::Number(n) if n.fract() == 0.0 => Some(format!("{}", *n as i64)),
            _ => None,
        })?;
        Some((authority, code))
    }
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<u8> {
        self.src.as_bytes().get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn unexpected(&self) -> WktError {
        match self.peek() {
            Some(c) => WktError::Unexpected {
                found: c as char,
                offset: self.pos,
            },
            None => WktError::UnexpectedEnd,
        }
    }

    fn ident(&mut self) -> Result<String, WktError> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == b'_') {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.unexpected());
        }
        Ok(self.src[start..self.pos].to_string())
    }

    fn string(&mut self) -> Result<String, WktError> {
        // Opening quote.
        self.pos += 1;
        let mut out = String::new();
        loop {
            let rest = &self.src[self.pos..];
            let Some(idx) = rest.find('"') else {
                return Err(WktError::UnexpectedEnd);
            };
            out.push_str(&rest[..idx]);
            self.pos += idx + 1;
            // A doubled quote is an escaped quote.
            if self.peek() == Some(b'"') {
                out.push('"');
                self.pos += 1;
            } else {
                return Ok(out);
            }
        }
    }

    fn number(&mut self) -> Result<f64, WktError> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit() || matches!(c, b'+' | b'-' | b'.' | b'e' | b'E'))
        {
            self.pos += 1;
        }
        let text = &self.src[start..self.pos];
        text.parse::<f64>()
            .map_err(|_| WktError::InvalidNumber(text.to_string()))
    }

    fn node(&mut self, depth: usize) -> Result<WktNode, WktError> {
        if depth > MAX_DEPTH {
            return Err(WktError::TooDeep);
        }
        self.skip_ws();
        let keyword = self.ident()?;
        self.skip_ws();
        match self.peek() {
            Some(b'[') | Some(b'(') => self.pos += 1,
            _ => return Err(self.unexpected()),
        }

        let mut values = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                Some(b']') | Some(b')') => {
                    self.pos += 1;
                    break;
                }
                Some(b',') => self.pos += 1,
                Some(b'"') => values.push(WktValue::Text(self.string()?)),
                Some(c) if c.is_ascii_digit() || matches!(c, b'-' | b'+' | b'.') => {
                    values.push(WktValue::Number(self.number()?))
                }
                Some(c) if c.is_ascii_alphabetic() || c == b'_' => {
                    let start = self.pos;
                    let word = self.ident()?;
                    self.skip_ws();
                    if matches!(self.peek(), Some(b'[') | Some(b'(')) {
                        self.pos = start;
                        values.push(WktValue::Node(self.node(depth + 1)?));
                    } else {
                        values.push(WktValue::Word(word));
                    }
                }
                _ => return Err(self.unexpected()),
            }
        }

        Ok(WktNode { keyword, values })
    }
}

/// Lowercases and folds every run of non-alphanumerics into one `_`.
pub(crate) fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_sep = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }
    out
}

const GEOGRAPHIC_KEYWORDS: &[&str] = &["GEOGCS", "GEOGCRS", "GEOGRAPHICCRS", "GEODCRS", "GEODETICCRS"];
const PROJECTED_KEYWORDS: &[&str] = &["PROJCS", "PROJCRS", "PROJECTEDCRS"];

pub(crate) fn is_geographic(root: &WktNode) -> bool {
    GEOGRAPHIC_KEYWORDS.iter().any(|k| root.is(k))
}

pub(crate) fn is_projected(root: &WktNode) -> bool {
    PROJECTED_KEYWORDS.iter().any(|k| root.is(k))
}

/// Builds a PROJ.4 definition for a parsed CRS, or `None` when the method is
/// not one the catalog knows how to express.
pub fn to_proj4(root: &WktNode) -> Option<String> {
    let ellipsoid = ellipsoid_params(root);

    if is_geographic(root) {
        return Some(format!("+proj=longlat {} +no_defs", ellipsoid));
    }
    if !is_projected(root) {
        return None;
    }

    let method = root
        .child(&["PROJECTION"])
        .or_else(|| root.child(&["CONVERSION"]).and_then(|c| c.child(&["METHOD", "PROJECTION"])))
        .and_then(WktNode::name)
        .map(normalize_name)?;

    let to_meter = linear_unit_factor(root);
    let params = ProjParams::collect(root, to_meter);

    let mut out = String::new();
    match method.as_str() {
        "transverse_mercator" | "gauss_kruger" => {
            let _ = write!(out, "+proj=tmerc");
            params.push_all(&mut out, &["lat_0", "lon_0", "k_0", "x_0", "y_0"]);
        }
        "mercator_auxiliary_sphere" | "popular_visualisation_pseudo_mercator" => {
            let _ = write!(out, "+proj=merc +a=6378137 +b=6378137 +lat_ts=0");
            params.push_all(&mut out, &["lon_0", "x_0", "y_0"]);
            return Some(finish(out, to_meter, None));
        }
        "mercator" | "mercator_1sp" | "mercator_variant_a" => {
            let _ = write!(out, "+proj=merc");
            params.push_all(&mut out, &["lon_0", "k_0", "x_0", "y_0"]);
        }
        "mercator_2sp" | "mercator_variant_b" => {
            let _ = write!(out, "+proj=merc");
            params.push_as(&mut out, "lat_1", "lat_ts");
            params.push_all(&mut out, &["lon_0", "x_0", "y_0"]);
        }
        "lambert_conformal_conic"
        | "lambert_conformal_conic_2sp"
        | "lambert_conic_conformal_2sp" => {
            let _ = write!(out, "+proj=lcc");
            params.push_all(&mut out, &["lat_1", "lat_2", "lat_0", "lon_0", "x_0", "y_0"]);
        }
        "lambert_conformal_conic_1sp" | "lambert_conic_conformal_1sp" => {
            let _ = write!(out, "+proj=lcc");
            params.push_as(&mut out, "lat_0", "lat_1");
            params.push_all(&mut out, &["lat_0", "lon_0", "k_0", "x_0", "y_0"]);
        }
        "albers" | "albers_conic_equal_area" | "albers_equal_area" => {
            let _ = write!(out, "+proj=aea");
            params.push_all(&mut out, &["lat_1", "lat_2", "lat_0", "lon_0", "x_0", "y_0"]);
        }
        "polar_stereographic"
        | "polar_stereographic_variant_a"
        | "polar_stereographic_variant_b" => {
            let _ = write!(out, "+proj=stere");
            let lat_0 = params.get("lat_0").or(params.get("lat_ts")).unwrap_or(90.0);
            let _ = write!(out, " +lat_0={}", if lat_0 < 0.0 { -90.0 } else { 90.0 });
            if params.get("lat_ts").is_some() {
                params.push_all(&mut out, &["lat_ts"]);
            } else {
                params.push_as(&mut out, "lat_0", "lat_ts");
            }
            params.push_all(&mut out, &["lon_0", "k_0", "x_0", "y_0"]);
        }
        "oblique_stereographic" | "stereographic" | "double_stereographic" => {
            let _ = write!(out, "+proj=sterea");
            params.push_all(&mut out, &["lat_0", "lon_0", "k_0", "x_0", "y_0"]);
        }
        "equirectangular" | "plate_carree" | "equidistant_cylindrical" => {
            let _ = write!(out, "+proj=eqc");
            params.push_as(&mut out, "lat_1", "lat_ts");
            params.push_all(&mut out, &["lat_0", "lon_0", "x_0", "y_0"]);
        }
        "lambert_azimuthal_equal_area" => {
            let _ = write!(out, "+proj=laea");
            params.push_all(&mut out, &["lat_0", "lon_0", "x_0", "y_0"]);
        }
        _ => return None,
    }

    Some(finish(out, to_meter, Some(&ellipsoid)))
}

fn finish(mut out: String, to_meter: f64, ellipsoid: Option<&str>) -> String {
    if let Some(ellipsoid) = ellipsoid {
        let _ = write!(out, " {}", ellipsoid);
    }
    if (to_meter - 1.0).abs() > 1e-12 {
        let _ = write!(out, " +to_meter={}", to_meter);
    } else {
        out.push_str(" +units=m");
    }
    out.push_str(" +no_defs");
    out
}

fn ellipsoid_params(root: &WktNode) -> String {
    let spheroid = root.find(&["SPHEROID", "ELLIPSOID"]);
    let (a, rf) = match spheroid {
        Some(s) => (s.number(0).unwrap_or(6_378_137.0), s.number(1).unwrap_or(298.257_223_563)),
        None => (6_378_137.0, 298.257_223_563),
    };
    let b = if rf == 0.0 { a } else { a * (1.0 - 1.0 / rf) };
    format!("+a={} +b={}", a, b)
}

/// Metres per linear unit of a projected CRS.
fn linear_unit_factor(root: &WktNode) -> f64 {
    root.child(&["UNIT", "LENGTHUNIT"])
        .or_else(|| root.find(&["LENGTHUNIT"]))
        .and_then(|u| u.number(0))
        .filter(|f| *f > 0.0)
        .unwrap_or(1.0)
}

struct ProjParams {
    values: Vec<(&'static str, f64)>,
}

impl ProjParams {
    fn collect(root: &WktNode, to_meter: f64) -> Self {
        let mut values = Vec::new();
        let holders = [Some(root), root.child(&["CONVERSION"])];
        for holder in holders.into_iter().flatten() {
            for param in holder.children().filter(|c| c.is("PARAMETER")) {
                let (Some(name), Some(raw)) = (param.name(), param.number(0)) else {
                    continue;
                };
                let Some(key) = proj_key(&normalize_name(name)) else {
                    continue;
                };
                let value = if let Some(unit) = param.child(&["ANGLEUNIT"]) {
                    unit.number(0).map(|f| (raw * f).to_degrees()).unwrap_or(raw)
                } else if let Some(unit) = param.child(&["LENGTHUNIT"]) {
                    raw * unit.number(0).unwrap_or(1.0)
                } else if matches!(key, "x_0" | "y_0") {
                    raw * to_meter
                } else {
                    raw
                };
                values.push((key, value));
            }
        }
        Self { values }
    }

    fn get(&self, key: &str) -> Option<f64> {
        self.values.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
    }

    fn push_all(&self, out: &mut String, keys: &[&str]) {
        for key in keys {
            if let Some(value) = self.get(key) {
                let _ = write!(out, " +{}={}", key, value);
            }
        }
    }

    fn push_as(&self, out: &mut String, key: &str, as_key: &str) {
        if let Some(value) = self.get(key) {
            let _ = write!(out, " +{}={}", as_key, value);
        }
    }
}

fn proj_key(normalized: &str) -> Option<&'static str> {
    let key = match normalized {
        "central_meridian"
        | "longitude_of_natural_origin"
        | "longitude_of_origin"
        | "longitude_of_center"
        | "longitude_of_centre"
        | "longitude_of_false_origin"
        | "straight_vertical_longitude_from_pole" => "lon_0",
        "latitude_of_origin"
        | "latitude_of_natural_origin"
        | "latitude_of_center"
        | "latitude_of_centre"
        | "latitude_of_false_origin" => "lat_0",
        "standard_parallel_1" | "latitude_of_1st_standard_parallel" => "lat_1",
        "standard_parallel_2" | "latitude_of_2nd_standard_parallel" => "lat_2",
        "latitude_of_standard_parallel" | "standard_parallel" => "lat_ts",
        "scale_factor" | "scale_factor_at_natural_origin" => "k_0",
        "false_easting" | "easting_at_false_origin" => "x_0",
        "false_northing" | "northing_at_false_origin" => "y_0",
        _ => return None,
    };
    Some(key)
}
