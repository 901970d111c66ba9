//! GeoJSON feature collections.

use std::path::Path;

use serde_json::{Map, Value};

use super::{
    extension, file_stem, geometry_type_name, ring_is_valid, validate_vector, DatasetDriver,
    DriverError, DriverFamily, DriverLayer, FeatureSample, LayerReport, ProbeOptions,
};
use crate::crs::CrsDefinition;
use crate::record::{DataType, Extent, FieldInfo, VectorAttributes};

const FORMAT: &str = "GeoJSON";
const UNKNOWN_GEOMETRY: &str = "Unknown (any)";

const GEOMETRY_TYPES: &[&str] = &[
    "Point",
    "MultiPoint",
    "LineString",
    "MultiLineString",
    "Polygon",
    "MultiPolygon",
    "GeometryCollection",
];

pub struct GeoJsonDriver;

impl DatasetDriver for GeoJsonDriver {
    fn short_name(&self) -> &'static str {
        "GeoJSON"
    }

    fn long_name(&self) -> &'static str {
        "GeoJSON"
    }

    fn family(&self) -> DriverFamily {
        DriverFamily::Vector
    }

    fn open(&self, path: &Path, options: &ProbeOptions) -> Result<Vec<DriverLayer>, DriverError> {
        let strict = match extension(path).as_deref() {
            Some("geojson") => true,
            Some("json") => false,
            _ => return Err(DriverError::NotRecognized),
        };
        let text = std::fs::read_to_string(path)?;
        let root: Value = match serde_json::from_str(&text) {
            Ok(root) => root,
            Err(e) if strict => return Err(DriverError::malformed(FORMAT, e.to_string())),
            Err(_) => return Err(DriverError::NotRecognized),
        };
        let Some(object) = root.as_object() else {
            return if strict {
                Err(DriverError::malformed(FORMAT, "top level is not an object"))
            } else {
                Err(DriverError::NotRecognized)
            };
        };

        let features: Vec<&Value> = match object.get("type").and_then(Value::as_str) {
            Some("FeatureCollection") => match object.get("features") {
                Some(Value::Array(features)) => features.iter().collect(),
                _ => return Err(DriverError::malformed(FORMAT, "missing features array")),
            },
            Some("Feature") => vec![&root],
            Some(t) if strict && GEOMETRY_TYPES.contains(&t) => vec![&root],
            _ if strict => return Err(DriverError::malformed(FORMAT, "not a GeoJSON object")),
            _ => return Err(DriverError::NotRecognized),
        };

        let name = object
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| file_stem(path));

        Ok(vec![describe(name, object, &features, options)])
    }
}

fn feature_geometry(feature: &Value) -> Option<&Value> {
    match feature.get("type").and_then(Value::as_str) {
        Some("Feature") => feature.get("geometry").filter(|g| !g.is_null()),
        Some(t) if GEOMETRY_TYPES.contains(&t) => Some(feature),
        _ => None,
    }
}

fn describe(
    name: String,
    root: &Map<String, Value>,
    features: &[&Value],
    options: &ProbeOptions,
) -> DriverLayer {
    let mut report = LayerReport::default();

    let mut types: Vec<&str> = Vec::new();
    let mut positions = Vec::new();
    let mut has_z = false;
    for geometry in features.iter().filter_map(|f| feature_geometry(f)) {
        if let Some(t) = geometry.get("type").and_then(Value::as_str) {
            if !types.contains(&t) {
                types.push(t);
            }
        }
        collect_positions(geometry, &mut positions, &mut has_z);
    }

    let is_table = !features.is_empty() && types.is_empty();
    let geometry_type = if is_table {
        None
    } else {
        Some(geometry_type_name(&merged_type_name(&types), has_z, false))
    };

    report.native_extent = declared_bbox(root).or_else(|| Extent::from_points(positions));
    report.crs = Some(legacy_crs(root).unwrap_or_else(|| CrsDefinition::epsg(4326)));

    let count = features.len() as u64;
    report.vector = Some(VectorAttributes {
        geometry_type,
        feature_count: Some(count),
        fields: infer_fields(features),
        has_z,
        has_m: false,
    });

    if options.validate {
        validate_vector(&mut report, is_table, count, || sample(features.first().copied()));
    }

    DriverLayer {
        name,
        data_type: if is_table { DataType::Table } else { DataType::Vector },
        report,
    }
}

/// A single type, `X` + `MultiX` promoted to `MultiX`, otherwise unknown.
fn merged_type_name(types: &[&str]) -> String {
    fn display(t: &str) -> String {
        match t {
            "Point" => "Point",
            "MultiPoint" => "Multi Point",
            "LineString" => "Line String",
            "MultiLineString" => "Multi Line String",
            "Polygon" => "Polygon",
            "MultiPolygon" => "Multi Polygon",
            "GeometryCollection" => "Geometry Collection",
            _ => UNKNOWN_GEOMETRY,
        }
        .to_string()
    }
    match types {
        [] => UNKNOWN_GEOMETRY.to_string(),
        [single] => display(single),
        [a, b] => {
            let multi = if a.starts_with("Multi") { a } else { b };
            let single = if a.starts_with("Multi") { b } else { a };
            if multi.strip_prefix("Multi") == Some(*single) {
                display(multi)
            } else {
                UNKNOWN_GEOMETRY.to_string()
            }
        }
        _ => UNKNOWN_GEOMETRY.to_string(),
    }
}

fn collect_positions(geometry: &Value, out: &mut Vec<(f64, f64)>, has_z: &mut bool) {
    if let Some(Value::Array(members)) = geometry.get("geometries") {
        for member in members {
            collect_positions(member, out, has_z);
        }
        return;
    }
    if let Some(coordinates) = geometry.get("coordinates") {
        walk_coordinates(coordinates, out, has_z);
    }
}

fn walk_coordinates(value: &Value, out: &mut Vec<(f64, f64)>, has_z: &mut bool) {
    let Value::Array(items) = value else {
        return;
    };
    if items.first().map(Value::is_number).unwrap_or(false) {
        let numbers: Vec<f64> = items.iter().filter_map(Value::as_f64).collect();
        if numbers.len() >= 2 && numbers[0].is_finite() && numbers[1].is_finite() {
            out.push((numbers[0], numbers[1]));
            if numbers.len() >= 3 {
                *has_z = true;
            }
        }
        return;
    }
    for item in items {
        walk_coordinates(item, out, has_z);
    }
}

fn declared_bbox(root: &Map<String, Value>) -> Option<Extent> {
    let values: Vec<f64> = root
        .get("bbox")?
        .as_array()?
        .iter()
        .map(Value::as_f64)
        .collect::<Option<_>>()?;
    let extent = match values.as_slice() {
        [x1, y1, x2, y2] => Extent::new(*x1, *y1, *x2, *y2),
        [x1, y1, _, x2, y2, _] => Extent::new(*x1, *y1, *x2, *y2),
        _ => return None,
    };
    extent.is_finite().then_some(extent)
}

/// The pre-RFC 7946 `crs` member, named or linked by EPSG code.
fn legacy_crs(root: &Map<String, Value>) -> Option<CrsDefinition> {
    let crs = root.get("crs")?;
    let properties = crs.get("properties")?;
    match crs.get("type").and_then(Value::as_str)? {
        "name" => properties
            .get("name")
            .and_then(Value::as_str)
            .and_then(CrsDefinition::from_authority_string),
        "EPSG" => properties
            .get("code")
            .and_then(|c| c.as_u64().or_else(|| c.as_str().and_then(|s| s.parse().ok())))
            .and_then(|c| u32::try_from(c).ok())
            .map(CrsDefinition::epsg),
        _ => None,
    }
}

fn value_type(value: &Value) -> Option<&'static str> {
    match value {
        Value::Null => None,
        Value::Bool(_) => Some("Integer"),
        Value::Number(n) if n.is_i64() || n.is_u64() => {
            let fits = n.as_i64().map(|v| i32::try_from(v).is_ok()).unwrap_or(false);
            Some(if fits { "Integer" } else { "Integer64" })
        }
        Value::Number(_) => Some("Real"),
        Value::String(_) => Some("String"),
        Value::Array(items) => {
            let all_ints = items.iter().all(|i| i.is_i64() || i.is_u64());
            let all_numbers = items.iter().all(Value::is_number);
            Some(if items.is_empty() {
                "StringList"
            } else if all_ints {
                "IntegerList"
            } else if all_numbers {
                "RealList"
            } else {
                "StringList"
            })
        }
        Value::Object(_) => Some("String"),
    }
}

fn widen(current: &'static str, next: &'static str) -> &'static str {
    match (current, next) {
        (a, b) if a == b => a,
        ("Integer", "Integer64") | ("Integer64", "Integer") => "Integer64",
        ("Integer" | "Integer64" | "Real", "Integer" | "Integer64" | "Real") => "Real",
        ("IntegerList", "RealList") | ("RealList", "IntegerList") => "RealList",
        _ => "String",
    }
}

/// Union of property names in first-seen order with widened types.
fn infer_fields(features: &[&Value]) -> Vec<FieldInfo> {
    let mut fields: Vec<(String, Option<&'static str>)> = Vec::new();
    for feature in features {
        let Some(Value::Object(properties)) = feature.get("properties") else {
            continue;
        };
        for (key, value) in properties {
            let kind = value_type(value);
            match fields.iter_mut().find(|(name, _)| name == key) {
                Some((_, current)) => {
                    *current = match (*current, kind) {
                        (Some(a), Some(b)) => Some(widen(a, b)),
                        (a, b) => a.or(b),
                    };
                }
                None => fields.push((key.clone(), kind)),
            }
        }
    }
    fields
        .into_iter()
        .map(|(name, kind)| FieldInfo::new(name, kind.unwrap_or("String")))
        .collect()
}

fn sample(feature: Option<&Value>) -> FeatureSample {
    let Some(feature) = feature.filter(|f| f.is_object()) else {
        return FeatureSample::Unreadable;
    };
    match feature_geometry(feature) {
        None => FeatureSample::NoGeometry,
        Some(geometry) => FeatureSample::Geometry {
            valid: geometry_is_valid(geometry),
        },
    }
}

fn positions(value: &Value) -> Option<Vec<(f64, f64)>> {
    value
        .as_array()?
        .iter()
        .map(|p| {
            let p = p.as_array()?;
            Some((p.first()?.as_f64()?, p.get(1)?.as_f64()?))
        })
        .collect()
}

fn polygon_is_valid(rings: &Value) -> bool {
    match rings.as_array() {
        Some(rings) if !rings.is_empty() => rings
            .iter()
            .all(|r| positions(r).map(|r| ring_is_valid(&r)).unwrap_or(false)),
        _ => false,
    }
}

fn geometry_is_valid(geometry: &Value) -> bool {
    let coordinates = geometry.get("coordinates");
    let each = |check: &dyn Fn(&Value) -> bool| {
        coordinates
            .and_then(Value::as_array)
            .map(|parts| !parts.is_empty() && parts.iter().all(check))
            .unwrap_or(false)
    };
    match geometry.get("type").and_then(Value::as_str) {
        Some("Point") => coordinates
            .map(|c| positions(&Value::Array(vec![c.clone()])).is_some())
            .unwrap_or(false),
        Some("MultiPoint") => coordinates.and_then(positions).map(|p| !p.is_empty()).unwrap_or(false),
        Some("LineString") => coordinates.and_then(positions).map(|p| p.len() >= 2).unwrap_or(false),
        Some("MultiLineString") => {
            each(&|line| positions(line).map(|p| p.len() >= 2).unwrap_or(false))
        }
        Some("Polygon") => coordinates.map(polygon_is_valid).unwrap_or(false),
        Some("MultiPolygon") => each(&polygon_is_valid),
        Some("GeometryCollection") => geometry
            .get("geometries")
            .and_then(Value::as_array)
            .map(|members| members.iter().all(geometry_is_valid))
            .unwrap_or(false),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(name: &str, content: &str) -> Result<Vec<DriverLayer>, DriverError> {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        GeoJsonDriver.open(&path, &ProbeOptions { validate: true })
    }

    #[test]
    fn test_feature_collection() {
        let layers = open(
            "parks.geojson",
            r#"{"type":"FeatureCollection","features":[
                {"type":"Feature","properties":{"name":"A","area":1},"geometry":{"type":"Polygon","coordinates":[[[0,0],[1,0],[1,1],[0,0]]]}},
                {"type":"Feature","properties":{"name":"B","area":2.5,"open":true},"geometry":{"type":"MultiPolygon","coordinates":[[[[2,2],[3,2],[3,4],[2,2]]]]}}
            ]}"#,
        )
        .unwrap();
        let layer = &layers[0];
        assert_eq!(layer.name, "parks");
        assert_eq!(layer.data_type, DataType::Vector);
        let vector = layer.report.vector.as_ref().unwrap();
        assert_eq!(vector.geometry_type.as_deref(), Some("Multi Polygon"));
        assert_eq!(vector.feature_count, Some(2));
        assert_eq!(
            vector.fields,
            vec![
                FieldInfo::new("area", "Real"),
                FieldInfo::new("name", "String"),
                FieldInfo::new("open", "Integer"),
            ]
        );
        assert_eq!(layer.report.native_extent, Some(Extent::new(0.0, 0.0, 3.0, 4.0)));
        assert_eq!(layer.report.crs, Some(CrsDefinition::epsg(4326)));
        assert!(layer.report.issues.is_empty());
    }

    #[test]
    fn test_legacy_crs_and_declared_bbox() {
        let layers = open(
            "sites.geojson",
            r#"{"type":"FeatureCollection","name":"survey_sites",
                "crs":{"type":"name","properties":{"name":"urn:ogc:def:crs:EPSG::3857"}},
                "bbox":[100,200,300,400],
                "features":[{"type":"Feature","properties":{},"geometry":{"type":"Point","coordinates":[150,250,12]}}]}"#,
        )
        .unwrap();
        let layer = &layers[0];
        assert_eq!(layer.name, "survey_sites");
        assert_eq!(layer.report.crs, Some(CrsDefinition::epsg(3857)));
        assert_eq!(layer.report.native_extent, Some(Extent::new(100.0, 200.0, 300.0, 400.0)));
        let vector = layer.report.vector.as_ref().unwrap();
        assert_eq!(vector.geometry_type.as_deref(), Some("3D Point"));
        assert!(vector.has_z);
    }

    #[test]
    fn test_geometry_less_collection_is_table() {
        let layers = open(
            "lookup.geojson",
            r#"{"type":"FeatureCollection","features":[{"type":"Feature","properties":{"code":1},"geometry":null}]}"#,
        )
        .unwrap();
        assert_eq!(layers[0].data_type, DataType::Table);
        assert!(layers[0].report.vector.as_ref().unwrap().geometry_type.is_none());
    }

    #[test]
    fn test_plain_json_is_not_recognized() {
        assert!(matches!(
            open("package.json", r#"{"name":"x","version":"1.0"}"#),
            Err(DriverError::NotRecognized)
        ));
        assert!(matches!(open("broken.json", "{"), Err(DriverError::NotRecognized)));
        assert!(matches!(
            open("broken.geojson", "{"),
            Err(DriverError::Malformed { .. })
        ));
    }

    #[test]
    fn test_validation_flags_open_ring_and_empty_collection() {
        let layers = open(
            "bad.geojson",
            r#"{"type":"FeatureCollection","features":[{"type":"Feature","properties":{},"geometry":{"type":"Polygon","coordinates":[[[0,0],[1,0],[1,1]]]}}]}"#,
        )
        .unwrap();
        let messages: Vec<_> = layers[0].report.issues.iter().map(|i| i.message.clone()).collect();
        assert_eq!(messages, vec!["Invalid geometries detected"]);

        let layers = open("empty.geojson", r#"{"type":"FeatureCollection","features":[]}"#).unwrap();
        let vector = layers[0].report.vector.as_ref().unwrap();
        assert_eq!(vector.geometry_type.as_deref(), Some(UNKNOWN_GEOMETRY));
        assert!(layers[0].report.native_extent.is_none());
        assert_eq!(layers[0].report.issues[0].message, "Empty dataset");
    }

    #[test]
    fn test_merged_type_names() {
        assert_eq!(merged_type_name(&["LineString", "MultiLineString"]), "Multi Line String");
        assert_eq!(merged_type_name(&["Point", "Polygon"]), UNKNOWN_GEOMETRY);
    }
}
