//! Mapbox Vector Tile (protobuf) decoding.
//!
//! The protobuf envelope is handled by `prost`; this module resolves feature
//! tags against the layer tables and runs the geometry command stream.

mod encode;
mod proto;

pub use encode::{LayerBuilder, command_integer, encode_geometry, encode_tile, zigzag_decode, zigzag_encode};
pub use proto::{VectorTile, VectorTileFeature, VectorTileGeomType, VectorTileLayer, VectorTileValue};

use prost::Message;
use serde_json::{Map, Number, Value};
use tracing::trace;

use crate::error::DecodeError;
use crate::feature::{DecodedFeature, FeatureCollection, FeatureId, GeometryType, Part, close_ring};

pub const DEFAULT_EXTENT: u32 = 4096;

pub(crate) const CMD_MOVE_TO: u32 = 1;
pub(crate) const CMD_LINE_TO: u32 = 2;
pub(crate) const CMD_CLOSE_PATH: u32 = 7;

/// Per-request decode switches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeOptions {
    /// Only layers with these names are decoded; `None` keeps every layer.
    pub layers: Option<Vec<String>>,
    /// When set, each feature gets its layer name under this property key.
    pub layer_property: Option<String>,
}

impl DecodeOptions {
    fn wants(&self, layer: &str) -> bool {
        self.layers
            .as_ref()
            .is_none_or(|names| names.iter().any(|n| n == layer))
    }
}

/// Decodes every layer of a raw (already decompressed) tile.
pub fn decode(buf: &[u8]) -> Result<FeatureCollection, DecodeError> {
    decode_with(buf, &DecodeOptions::default())
}

pub fn decode_with(buf: &[u8], options: &DecodeOptions) -> Result<FeatureCollection, DecodeError> {
    let tile = VectorTile::decode(buf)?;
    let mut out = FeatureCollection::new();
    for (i, layer) in tile.layers.iter().enumerate() {
        decode_layer(i, layer, options, &mut out)?;
    }
    Ok(out)
}

fn decode_layer(
    index: usize,
    layer: &VectorTileLayer,
    options: &DecodeOptions,
    out: &mut FeatureCollection,
) -> Result<(), DecodeError> {
    if layer.name.is_empty() {
        return Err(DecodeError::malformed(format!("layer {index}"), "layer without a name"));
    }
    if !options.wants(&layer.name) {
        trace!(layer = %layer.name, "layer filtered out");
        return Ok(());
    }
    let extent = match layer.extent {
        None => DEFAULT_EXTENT,
        Some(0) => {
            return Err(DecodeError::malformed(format!("layer {:?}", layer.name), "layer extent is 0"));
        }
        Some(e) => e,
    };
    let values: Vec<Value> = layer.values.iter().map(value_to_json).collect();

    let before = out.len();
    for (i, feature) in layer.features.iter().enumerate() {
        let located = |err| at_feature(err, &layer.name, i);
        if let Some(f) = decode_feature(feature, layer, &values, extent, options).map_err(located)? {
            out.push(f);
        }
    }
    trace!(layer = %layer.name, extent, features = out.len() - before, "decoded layer");
    Ok(())
}

fn at_feature(err: DecodeError, layer: &str, index: usize) -> DecodeError {
    match err {
        DecodeError::MalformedWireFormat { location, reason } => DecodeError::MalformedWireFormat {
            location: format!("layer {layer:?} feature {index} {location}"),
            reason,
        },
        other => other,
    }
}

/// A value message with no field set, or a non-finite float, becomes null.
fn value_to_json(v: &VectorTileValue) -> Value {
    if let Some(s) = &v.string_value {
        Value::String(s.clone())
    } else if let Some(f) = v.float_value {
        number_from_f64(f as f64)
    } else if let Some(d) = v.double_value {
        number_from_f64(d)
    } else if let Some(i) = v.int_value {
        Value::from(i)
    } else if let Some(u) = v.uint_value {
        Value::from(u)
    } else if let Some(i) = v.sint_value {
        Value::from(i)
    } else if let Some(b) = v.bool_value {
        Value::Bool(b)
    } else {
        Value::Null
    }
}

fn number_from_f64(v: f64) -> Value {
    Number::from_f64(v).map_or(Value::Null, Value::Number)
}

fn decode_feature(
    feature: &VectorTileFeature,
    layer: &VectorTileLayer,
    values: &[Value],
    extent: u32,
    options: &DecodeOptions,
) -> Result<Option<DecodedFeature>, DecodeError> {
    let geometry_type = GeometryType::from_wire(feature.geometry_type.unwrap_or(0))?;
    let mut properties = resolve_tags(&feature.tags, &layer.keys, values)?;
    let coordinates = decode_geometry(&feature.geometry, geometry_type)?;
    if coordinates.is_empty() {
        return Ok(None);
    }

    if let Some(key) = &options.layer_property {
        properties.insert(key.clone(), Value::String(layer.name.clone()));
    }

    Ok(Some(DecodedFeature {
        id: feature.id.map(FeatureId::Number),
        layer_name: layer.name.clone(),
        geometry_type,
        coordinates,
        properties,
        extent: Some(extent),
    }))
}

fn resolve_tags(
    tags: &[u32],
    keys: &[String],
    values: &[Value],
) -> Result<Map<String, Value>, DecodeError> {
    if tags.len() % 2 != 0 {
        return Err(DecodeError::malformed("tags", "odd number of feature tags"));
    }
    let mut properties = Map::new();
    for (i, pair) in tags.chunks_exact(2).enumerate() {
        let (k, v) = (pair[0], pair[1]);
        let key = keys
            .get(k as usize)
            .ok_or_else(|| DecodeError::malformed(format!("tags[{}]", 2 * i), format!("key index {k} out of range")))?;
        let value = values.get(v as usize).ok_or_else(|| {
            DecodeError::malformed(format!("tags[{}]", 2 * i + 1), format!("value index {v} out of range"))
        })?;
        properties.insert(key.clone(), value.clone());
    }
    Ok(properties)
}

/// Runs the MoveTo/LineTo/ClosePath command stream with a cumulative cursor.
///
/// Polygon rings come out closed. Every MoveTo of a line or polygon starts a
/// new part; for points all MoveTo positions share one part. ClosePath is only
/// valid on an open polygon ring, and a closed ring needs a MoveTo before the
/// next LineTo.
pub(crate) fn decode_geometry(commands: &[u32], geometry_type: GeometryType) -> Result<Vec<Part>, DecodeError> {
    let malformed = |at: usize, reason: &str| DecodeError::malformed(format!("geometry[{at}]"), reason);

    let mut parts: Vec<Part> = Vec::new();
    let mut current: Part = Vec::new();
    let mut closed = false;
    let (mut x, mut y) = (0i32, 0i32);
    let mut pos = 0;

    while pos < commands.len() {
        let at = pos;
        let command = commands[pos];
        pos += 1;
        let op = command & 0x7;
        let count = (command >> 3) as usize;

        match op {
            CMD_MOVE_TO | CMD_LINE_TO => {
                if op == CMD_LINE_TO && (current.is_empty() || closed) {
                    return Err(malformed(at, "LineTo without a preceding MoveTo"));
                }
                let params = &commands[pos..];
                if params.len() / 2 < count {
                    return Err(malformed(at, "geometry command is missing parameters"));
                }
                for pair in params[..2 * count].chunks_exact(2) {
                    x = x.wrapping_add(zigzag_decode(pair[0]));
                    y = y.wrapping_add(zigzag_decode(pair[1]));
                    if op == CMD_MOVE_TO && geometry_type != GeometryType::Point {
                        finish_part(&mut parts, std::mem::take(&mut current), geometry_type);
                        closed = false;
                    }
                    current.push([x as f64, y as f64]);
                }
                pos += 2 * count;
            }
            CMD_CLOSE_PATH => {
                if geometry_type != GeometryType::Polygon {
                    return Err(malformed(at, "ClosePath outside a polygon"));
                }
                if current.is_empty() || closed {
                    return Err(malformed(at, "ClosePath without an open ring"));
                }
                closed = true;
            }
            other => {
                return Err(malformed(at, &format!("unknown geometry command {other}")));
            }
        }
    }
    finish_part(&mut parts, current, geometry_type);
    Ok(parts)
}

fn finish_part(parts: &mut Vec<Part>, mut part: Part, geometry_type: GeometryType) {
    if part.is_empty() {
        return;
    }
    if geometry_type == GeometryType::Polygon {
        close_ring(&mut part);
    }
    parts.push(part);
}

#[cfg(test)]
mod tests {
    use super::{DecodeOptions, LayerBuilder, decode, decode_with, encode_tile};
    use crate::error::DecodeError;
    use crate::feature::{FeatureId, GeometryType};
    use serde_json::{Map, Value, json};

    fn props(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap_or_default()
    }

    fn sample_tile() -> Vec<u8> {
        let mut roads = LayerBuilder::new("roads");
        roads.add_feature(
            Some(1),
            GeometryType::LineString,
            &[vec![[0, 0], [10, 0], [10, 10]]],
            &props(json!({"kind": "primary", "lanes": 2})),
        );
        let mut water = LayerBuilder::new("water").with_extent(512);
        water.add_feature(
            Some(2),
            GeometryType::Polygon,
            &[vec![[0, 0], [100, 0], [100, 100], [0, 0]]],
            &props(json!({"name": "lake", "depth": -3, "area": 1.5, "fresh": true})),
        );
        encode_tile(&[roads, water])
    }

    #[test]
    fn decodes_layers_in_order_with_properties() {
        let fc = decode(&sample_tile()).expect("decode");
        assert_eq!(fc.len(), 2);

        let road = &fc.features[0];
        assert_eq!(road.layer_name, "roads");
        assert_eq!(road.id, Some(FeatureId::Number(1)));
        assert_eq!(road.geometry_type, GeometryType::LineString);
        assert_eq!(road.coordinates, vec![vec![[0.0, 0.0], [10.0, 0.0], [10.0, 10.0]]]);
        assert_eq!(road.properties["kind"], "primary");
        assert_eq!(road.properties["lanes"], 2);
        assert_eq!(road.extent, Some(4096));

        let lake = &fc.features[1];
        assert_eq!(lake.extent, Some(512));
        assert_eq!(lake.properties["depth"], -3);
        assert_eq!(lake.properties["area"], 1.5);
        assert_eq!(lake.properties["fresh"], true);
        let ring = &lake.coordinates[0];
        assert_eq!(ring.first(), ring.last());
        assert_eq!(ring.len(), 4);
    }

    #[test]
    fn cursor_is_cumulative_across_commands() {
        // MoveTo(1) (+5,+5), LineTo(2) (+1,0) (0,+1), MoveTo(1) (-3,-3), LineTo(1) (+2,0)
        let mut layer = LayerBuilder::new("l");
        layer.push_raw_feature(None, 2, &[], &[9, 10, 10, 18, 2, 0, 0, 2, 9, 5, 5, 10, 4, 0]);
        let fc = decode(&encode_tile(&[layer])).unwrap();
        assert_eq!(
            fc.features[0].coordinates,
            vec![
                vec![[5.0, 5.0], [6.0, 5.0], [6.0, 6.0]],
                vec![[3.0, 3.0], [5.0, 3.0]],
            ]
        );
    }

    #[test]
    fn multi_point_shares_one_part() {
        let mut layer = LayerBuilder::new("pois");
        layer.add_feature(None, GeometryType::Point, &[vec![[1, 1], [4, 5]]], &Map::new());
        let fc = decode(&encode_tile(&[layer])).unwrap();
        assert_eq!(fc.features[0].coordinates, vec![vec![[1.0, 1.0], [4.0, 5.0]]]);
    }

    #[test]
    fn feature_without_geometry_is_dropped() {
        let mut layer = LayerBuilder::new("l");
        layer.push_raw_feature(Some(3), 1, &[], &[]);
        layer.add_feature(Some(4), GeometryType::Point, &[vec![[0, 0]]], &Map::new());
        let fc = decode(&encode_tile(&[layer])).unwrap();
        assert_eq!(fc.len(), 1);
        assert_eq!(fc.features[0].id, Some(FeatureId::Number(4)));
    }

    #[test]
    fn unknown_geometry_type_is_unsupported() {
        let mut layer = LayerBuilder::new("l");
        layer.push_raw_feature(None, 0, &[], &[9, 0, 0]);
        let err = decode(&encode_tile(&[layer])).unwrap_err();
        assert!(matches!(err, DecodeError::UnsupportedGeometry { .. }));
    }

    #[test]
    fn truncated_buffer_fails_without_partial_output() {
        let tile = sample_tile();
        let err = decode(&tile[..tile.len() - 3]).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedWireFormat { .. }));
    }

    #[test]
    fn wrong_wire_type_is_malformed() {
        // field 3 (layer) as varint
        let err = decode(&[0x18, 0x01]).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedWireFormat { .. }));
    }

    #[test]
    fn truncated_geometry_command_is_malformed() {
        // MoveTo(1) with only the x parameter
        let mut layer = LayerBuilder::new("l");
        layer.push_raw_feature(None, 1, &[], &[9, 4]);
        let err = decode(&encode_tile(&[layer])).unwrap_err();
        match err {
            DecodeError::MalformedWireFormat { location, .. } => {
                assert_eq!(location, "layer \"l\" feature 0 geometry[0]");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn close_path_outside_polygons_is_malformed() {
        for type_code in [1, 2] {
            let mut layer = LayerBuilder::new("l");
            layer.push_raw_feature(None, type_code, &[], &[9, 4, 4, 15]);
            let err = decode(&encode_tile(&[layer])).unwrap_err();
            assert!(matches!(err, DecodeError::MalformedWireFormat { .. }), "type {type_code}");
        }
    }

    #[test]
    fn line_to_after_close_path_needs_a_move_to() {
        // MoveTo (0,0), LineTo (2,0) (0,2), ClosePath, LineTo (1,1)
        let mut layer = LayerBuilder::new("l");
        layer.push_raw_feature(None, 3, &[], &[9, 0, 0, 18, 4, 0, 0, 4, 15, 10, 2, 2]);
        let err = decode(&encode_tile(&[layer])).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedWireFormat { .. }));
    }

    #[test]
    fn second_ring_after_close_path_is_a_new_part() {
        let mut layer = LayerBuilder::new("l");
        layer.push_raw_feature(
            None,
            3,
            &[],
            &[9, 0, 0, 18, 4, 0, 0, 4, 15, 9, 1, 1, 18, 2, 0, 0, 2, 15],
        );
        let fc = decode(&encode_tile(&[layer])).unwrap();
        assert_eq!(
            fc.features[0].coordinates,
            vec![
                vec![[0.0, 0.0], [2.0, 0.0], [2.0, 2.0], [0.0, 0.0]],
                vec![[1.0, 1.0], [2.0, 1.0], [2.0, 2.0], [1.0, 1.0]],
            ]
        );
    }

    #[test]
    fn zero_extent_is_malformed() {
        let mut layer = LayerBuilder::new("l").with_extent(0);
        layer.add_feature(None, GeometryType::Point, &[vec![[0, 0]]], &Map::new());
        let err = decode(&encode_tile(&[layer])).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedWireFormat { .. }));
    }

    #[test]
    fn tag_index_out_of_range_is_malformed() {
        let mut layer = LayerBuilder::new("l");
        layer.push_raw_feature(None, 1, &[0, 7], &[9, 0, 0]);
        let err = decode(&encode_tile(&[layer])).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedWireFormat { .. }));
    }

    #[test]
    fn layer_filter_and_layer_property() {
        let options = DecodeOptions {
            layers: Some(vec!["water".to_string()]),
            layer_property: Some("layerName".to_string()),
        };
        let fc = decode_with(&sample_tile(), &options).unwrap();
        assert_eq!(fc.len(), 1);
        assert_eq!(fc.features[0].properties["layerName"], "water");
    }

    #[test]
    fn empty_buffer_is_empty_collection() {
        assert!(decode(&[]).unwrap().is_empty());
    }
}
