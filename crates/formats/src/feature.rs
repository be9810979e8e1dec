use std::fmt;

use foundation::QueryBounds;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DecodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GeometryType {
    Point,
    LineString,
    Polygon,
}

impl GeometryType {
    /// Maps the vector tile `GeomType` enum; `UNKNOWN` (0) is not supported.
    pub fn from_wire(code: i32) -> Result<Self, DecodeError> {
        match code {
            1 => Ok(GeometryType::Point),
            2 => Ok(GeometryType::LineString),
            3 => Ok(GeometryType::Polygon),
            other => Err(DecodeError::UnsupportedGeometry {
                geometry: format!("geometry type code {other}"),
            }),
        }
    }

    pub fn wire_code(self) -> i32 {
        match self {
            GeometryType::Point => 1,
            GeometryType::LineString => 2,
            GeometryType::Polygon => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GeometryType::Point => "Point",
            GeometryType::LineString => "LineString",
            GeometryType::Polygon => "Polygon",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureId {
    Number(u64),
    String(String),
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureId::Number(n) => write!(f, "{n}"),
            FeatureId::String(s) => f.write_str(s),
        }
    }
}

impl From<&FeatureId> for Value {
    fn from(id: &FeatureId) -> Self {
        match id {
            FeatureId::Number(n) => Value::from(*n),
            FeatureId::String(s) => Value::String(s.clone()),
        }
    }
}

/// One ordered run of coordinates: the points of a Point feature, one line, or
/// one closed polygon ring.
pub type Part = Vec<[f64; 2]>;

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFeature {
    pub id: Option<FeatureId>,
    pub layer_name: String,
    pub geometry_type: GeometryType,
    pub coordinates: Vec<Part>,
    pub properties: Map<String, Value>,
    /// `Some(extent)` when `coordinates` are tile-local in `[0, extent]`,
    /// `None` when they are already in source coordinates.
    pub extent: Option<u32>,
}

impl DecodedFeature {
    pub fn point_count(&self) -> usize {
        self.coordinates.iter().map(Vec::len).sum()
    }

    pub fn bounds(&self) -> Option<QueryBounds> {
        QueryBounds::from_points(self.coordinates.iter().flatten().copied())
    }

    /// Identity used for picking: the named property when present, the feature
    /// id otherwise. Empty strings and nulls count as missing.
    pub fn unique_id(&self, property: Option<&str>) -> Option<Value> {
        let from_property = property
            .and_then(|p| self.properties.get(p))
            .filter(|v| is_defined_id(v))
            .cloned();
        from_property.or_else(|| self.id.as_ref().map(Value::from))
    }

    pub fn to_geojson_value(&self) -> Value {
        feature_to_geojson_value(
            self.id.as_ref(),
            &self.layer_name,
            geometry_to_geojson_value(self.geometry_type, &self.coordinates),
            &self.properties,
        )
    }

    /// Parses a GeoJSON `Feature` object whose geometry is already in source
    /// coordinates.
    ///
    /// Returns `Ok(None)` for a feature without coordinates.
    pub fn from_geojson_value(value: &Value, layer_name: &str) -> Result<Option<Self>, DecodeError> {
        let obj = value
            .as_object()
            .ok_or_else(|| DecodeError::invalid_record("feature must be an object"))?;

        let ty = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| DecodeError::invalid_record("feature missing type"))?;
        if ty != "Feature" {
            return Err(DecodeError::invalid_record(format!(
                "unexpected feature type: {ty}"
            )));
        }

        let id = match obj.get("id") {
            Some(Value::String(s)) => Some(FeatureId::String(s.clone())),
            Some(Value::Number(n)) => Some(match n.as_u64() {
                Some(u) => FeatureId::Number(u),
                None => FeatureId::String(n.to_string()),
            }),
            _ => None,
        };

        let properties = obj
            .get("properties")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let geometry = match obj.get("geometry") {
            None | Some(Value::Null) => return Ok(None),
            Some(g) => g,
        };
        let (geometry_type, coordinates) = parse_geometry(geometry)?;
        if coordinates.iter().all(Vec::is_empty) {
            return Ok(None);
        }

        Ok(Some(DecodedFeature {
            id,
            layer_name: layer_name.to_string(),
            geometry_type,
            coordinates,
            properties,
            extent: None,
        }))
    }
}

fn is_defined_id(v: &Value) -> bool {
    !matches!(v, Value::Null) && v.as_str() != Some("")
}

/// Ordered features in decode order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureCollection {
    pub features: Vec<DecodedFeature>,
}

impl FeatureCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn push(&mut self, feature: DecodedFeature) {
        self.features.push(feature);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DecodedFeature> {
        self.features.iter()
    }

    pub fn to_geojson_value(&self) -> Value {
        let mut root = Map::new();
        root.insert(
            "type".to_string(),
            Value::String("FeatureCollection".to_string()),
        );
        root.insert(
            "features".to_string(),
            Value::Array(self.features.iter().map(|f| f.to_geojson_value()).collect()),
        );
        Value::Object(root)
    }
}

impl From<Vec<DecodedFeature>> for FeatureCollection {
    fn from(features: Vec<DecodedFeature>) -> Self {
        Self { features }
    }
}

impl FromIterator<DecodedFeature> for FeatureCollection {
    fn from_iter<I: IntoIterator<Item = DecodedFeature>>(iter: I) -> Self {
        Self {
            features: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for FeatureCollection {
    type Item = DecodedFeature;
    type IntoIter = std::vec::IntoIter<DecodedFeature>;

    fn into_iter(self) -> Self::IntoIter {
        self.features.into_iter()
    }
}

/// Builds `{"type": "Feature", "geometry", "properties", "layerName"}`.
pub fn feature_to_geojson_value(
    id: Option<&FeatureId>,
    layer_name: &str,
    geometry: Value,
    properties: &Map<String, Value>,
) -> Value {
    let mut obj = Map::new();
    obj.insert("type".to_string(), Value::String("Feature".to_string()));
    if let Some(id) = id {
        obj.insert("id".to_string(), Value::from(id));
    }
    obj.insert("geometry".to_string(), geometry);
    obj.insert("properties".to_string(), Value::Object(properties.clone()));
    obj.insert(
        "layerName".to_string(),
        Value::String(layer_name.to_string()),
    );
    Value::Object(obj)
}

/// GeoJSON geometry for decoded parts. Several points or lines are emitted as
/// the corresponding `Multi*` type.
pub fn geometry_to_geojson_value(geometry_type: GeometryType, parts: &[Part]) -> Value {
    let (ty, coordinates) = match geometry_type {
        GeometryType::Point => {
            let points: Vec<&[f64; 2]> = parts.iter().flatten().collect();
            if points.len() == 1 {
                ("Point", position(points[0]))
            } else {
                (
                    "MultiPoint",
                    Value::Array(points.into_iter().map(position).collect()),
                )
            }
        }
        GeometryType::LineString if parts.len() == 1 => ("LineString", positions(&parts[0])),
        GeometryType::LineString => (
            "MultiLineString",
            Value::Array(parts.iter().map(|p| positions(p)).collect()),
        ),
        GeometryType::Polygon => (
            "Polygon",
            Value::Array(parts.iter().map(|p| positions(p)).collect()),
        ),
    };

    let mut obj = Map::new();
    obj.insert("type".to_string(), Value::String(ty.to_string()));
    obj.insert("coordinates".to_string(), coordinates);
    Value::Object(obj)
}

fn position(p: &[f64; 2]) -> Value {
    Value::Array(vec![Value::from(p[0]), Value::from(p[1])])
}

fn positions(part: &[[f64; 2]]) -> Value {
    Value::Array(part.iter().map(position).collect())
}

fn parse_geometry(value: &Value) -> Result<(GeometryType, Vec<Part>), DecodeError> {
    let obj = value
        .as_object()
        .ok_or_else(|| DecodeError::invalid_record("geometry must be an object"))?;
    let ty = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| DecodeError::invalid_record("geometry missing type"))?;

    let coords = match ty {
        "Point" | "MultiPoint" | "LineString" | "MultiLineString" | "Polygon" => obj
            .get("coordinates")
            .ok_or_else(|| DecodeError::invalid_record("geometry missing coordinates"))?,
        other => {
            return Err(DecodeError::UnsupportedGeometry {
                geometry: other.to_string(),
            });
        }
    };

    match ty {
        "Point" => Ok((GeometryType::Point, vec![vec![parse_position(coords)?]])),
        "MultiPoint" => Ok((GeometryType::Point, vec![parse_positions(coords)?])),
        "LineString" => Ok((GeometryType::LineString, vec![parse_positions(coords)?])),
        "MultiLineString" => Ok((GeometryType::LineString, parse_parts(coords)?)),
        _ => {
            let mut rings = parse_parts(coords)?;
            for ring in &mut rings {
                close_ring(ring);
            }
            Ok((GeometryType::Polygon, rings))
        }
    }
}

/// Appends the first point when the ring does not already end on it.
pub(crate) fn close_ring(ring: &mut Part) {
    if let (Some(&first), Some(&last)) = (ring.first(), ring.last()) {
        if first != last {
            ring.push(first);
        }
    }
}

fn parse_position(coords: &Value) -> Result<[f64; 2], DecodeError> {
    let arr = coords
        .as_array()
        .ok_or_else(|| DecodeError::invalid_record("position must be an array"))?;
    if arr.len() < 2 {
        return Err(DecodeError::invalid_record("position must have [x, y]"));
    }
    let x = arr[0]
        .as_f64()
        .ok_or_else(|| DecodeError::invalid_record("x must be a number"))?;
    let y = arr[1]
        .as_f64()
        .ok_or_else(|| DecodeError::invalid_record("y must be a number"))?;
    Ok([x, y])
}

fn parse_positions(coords: &Value) -> Result<Part, DecodeError> {
    let arr = coords
        .as_array()
        .ok_or_else(|| DecodeError::invalid_record("coordinates must be an array"))?;
    arr.iter().map(parse_position).collect()
}

fn parse_parts(coords: &Value) -> Result<Vec<Part>, DecodeError> {
    let arr = coords
        .as_array()
        .ok_or_else(|| DecodeError::invalid_record("coordinates must be an array of parts"))?;
    arr.iter().map(parse_positions).collect()
}

#[cfg(test)]
mod tests {
    use super::{DecodedFeature, FeatureId, GeometryType};
    use crate::error::DecodeError;
    use serde_json::json;

    #[test]
    fn parses_polygon_and_closes_open_ring() {
        let value = json!({
            "type": "Feature",
            "id": 7,
            "properties": {"name": "square"},
            "geometry": {
                "type": "Polygon",
                "coordinates": [[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]]]
            }
        });
        let f = DecodedFeature::from_geojson_value(&value, "counties")
            .expect("parse")
            .expect("has geometry");
        assert_eq!(f.id, Some(FeatureId::Number(7)));
        assert_eq!(f.layer_name, "counties");
        assert_eq!(f.geometry_type, GeometryType::Polygon);
        assert_eq!(f.coordinates[0].len(), 5);
        assert_eq!(f.coordinates[0].first(), f.coordinates[0].last());
        assert_eq!(f.extent, None);
    }

    #[test]
    fn multi_polygon_is_unsupported() {
        let value = json!({
            "type": "Feature",
            "properties": {},
            "geometry": {"type": "MultiPolygon", "coordinates": []}
        });
        let err = DecodedFeature::from_geojson_value(&value, "l").unwrap_err();
        assert!(matches!(err, DecodeError::UnsupportedGeometry { .. }));
    }

    #[test]
    fn null_geometry_is_dropped() {
        let value = json!({"type": "Feature", "properties": {}, "geometry": null});
        assert!(DecodedFeature::from_geojson_value(&value, "l").unwrap().is_none());
    }

    #[test]
    fn unique_id_prefers_defined_property() {
        let value = json!({
            "type": "Feature",
            "id": "abc",
            "properties": {"fips": "06075", "blank": ""},
            "geometry": {"type": "Point", "coordinates": [1.0, 2.0]}
        });
        let f = DecodedFeature::from_geojson_value(&value, "l").unwrap().unwrap();
        assert_eq!(f.unique_id(Some("fips")), Some(json!("06075")));
        assert_eq!(f.unique_id(Some("blank")), Some(json!("abc")));
        assert_eq!(f.unique_id(None), Some(json!("abc")));
    }

    #[test]
    fn geojson_export_uses_multi_types_for_several_parts() {
        let value = json!({
            "type": "Feature",
            "properties": {},
            "geometry": {"type": "MultiPoint", "coordinates": [[1.0, 2.0], [3.0, 4.0]]}
        });
        let f = DecodedFeature::from_geojson_value(&value, "pts").unwrap().unwrap();
        let out = f.to_geojson_value();
        assert_eq!(out["geometry"]["type"], "MultiPoint");
        assert_eq!(out["layerName"], "pts");
    }
}
