//! Vector tile writer used for fixtures and the `tilepipe` tooling.

use prost::Message;
use serde_json::{Map, Value};

use super::proto::{VectorTile, VectorTileFeature, VectorTileLayer, VectorTileValue};
use super::{CMD_CLOSE_PATH, CMD_LINE_TO, CMD_MOVE_TO, DEFAULT_EXTENT};
use crate::feature::GeometryType;

pub fn zigzag_encode(v: i32) -> u32 {
    ((v << 1) ^ (v >> 31)) as u32
}

pub fn zigzag_decode(v: u32) -> i32 {
    ((v >> 1) as i32) ^ -((v & 1) as i32)
}

pub fn command_integer(op: u32, count: u32) -> u32 {
    (count << 3) | (op & 0x7)
}

/// Command stream for tile-local integer parts.
///
/// Polygon rings may be passed closed or open; the closing point is never
/// written, ClosePath stands in for it. Deltas wrap, matching the decoder.
pub fn encode_geometry(geometry_type: GeometryType, parts: &[Vec<[i32; 2]>]) -> Vec<u32> {
    let mut out = Vec::new();
    let mut cursor = [0i32, 0i32];
    let mut push_delta = |out: &mut Vec<u32>, p: [i32; 2]| {
        out.push(zigzag_encode(p[0].wrapping_sub(cursor[0])));
        out.push(zigzag_encode(p[1].wrapping_sub(cursor[1])));
        cursor = p;
    };

    match geometry_type {
        GeometryType::Point => {
            let points: Vec<[i32; 2]> = parts.iter().flatten().copied().collect();
            if points.is_empty() {
                return out;
            }
            out.push(command_integer(CMD_MOVE_TO, points.len() as u32));
            for p in points {
                push_delta(&mut out, p);
            }
        }
        GeometryType::LineString | GeometryType::Polygon => {
            for part in parts {
                let mut points: &[[i32; 2]] = part;
                if geometry_type == GeometryType::Polygon && points.len() > 1 && points.first() == points.last() {
                    points = &points[..points.len() - 1];
                }
                let Some((first, rest)) = points.split_first() else {
                    continue;
                };
                out.push(command_integer(CMD_MOVE_TO, 1));
                push_delta(&mut out, *first);
                if !rest.is_empty() {
                    out.push(command_integer(CMD_LINE_TO, rest.len() as u32));
                    for p in rest {
                        push_delta(&mut out, *p);
                    }
                }
                if geometry_type == GeometryType::Polygon {
                    out.push(command_integer(CMD_CLOSE_PATH, 1));
                }
            }
        }
    }
    out
}

/// Accumulates one layer, interning keys and values as features are added.
#[derive(Debug, Clone)]
pub struct LayerBuilder {
    layer: VectorTileLayer,
    interned: Vec<Value>,
}

impl LayerBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            layer: VectorTileLayer {
                name: name.into(),
                extent: Some(DEFAULT_EXTENT),
                version: 2,
                ..Default::default()
            },
            interned: Vec::new(),
        }
    }

    pub fn with_extent(mut self, extent: u32) -> Self {
        self.layer.extent = Some(extent);
        self
    }

    pub fn name(&self) -> &str {
        &self.layer.name
    }

    pub fn feature_count(&self) -> usize {
        self.layer.features.len()
    }

    pub fn add_feature(
        &mut self,
        id: Option<u64>,
        geometry_type: GeometryType,
        parts: &[Vec<[i32; 2]>],
        properties: &Map<String, Value>,
    ) -> &mut Self {
        let mut tags = Vec::with_capacity(properties.len() * 2);
        for (k, v) in properties {
            if v.is_null() {
                continue;
            }
            tags.push(self.key_index(k));
            tags.push(self.value_index(v));
        }
        let geometry = encode_geometry(geometry_type, parts);
        self.push_raw_feature(id, geometry_type.wire_code(), &tags, &geometry)
    }

    /// Adds a feature from already-encoded tag and command integers.
    pub fn push_raw_feature(
        &mut self,
        id: Option<u64>,
        type_code: i32,
        tags: &[u32],
        geometry: &[u32],
    ) -> &mut Self {
        self.layer.features.push(VectorTileFeature {
            id,
            tags: tags.to_vec(),
            geometry_type: Some(type_code),
            geometry: geometry.to_vec(),
        });
        self
    }

    fn key_index(&mut self, key: &str) -> u32 {
        let keys = &mut self.layer.keys;
        match keys.iter().position(|k| k == key) {
            Some(i) => i as u32,
            None => {
                keys.push(key.to_string());
                (keys.len() - 1) as u32
            }
        }
    }

    fn value_index(&mut self, value: &Value) -> u32 {
        match self.interned.iter().position(|v| v == value) {
            Some(i) => i as u32,
            None => {
                self.interned.push(value.clone());
                self.layer.values.push(encode_value(value));
                (self.interned.len() - 1) as u32
            }
        }
    }
}

fn encode_value(value: &Value) -> VectorTileValue {
    let mut out = VectorTileValue::default();
    match value {
        Value::String(s) => out.string_value = Some(s.clone()),
        Value::Bool(b) => out.bool_value = Some(*b),
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                out.uint_value = Some(u);
            } else if let Some(i) = n.as_i64() {
                out.sint_value = Some(i);
            } else {
                out.double_value = n.as_f64();
            }
        }
        Value::Null => {}
        // Nested values have no wire representation; keep them as JSON text.
        Value::Array(_) | Value::Object(_) => out.string_value = Some(value.to_string()),
    }
    out
}

pub fn encode_tile(layers: &[LayerBuilder]) -> Vec<u8> {
    VectorTile {
        layers: layers.iter().map(|b| b.layer.clone()).collect(),
    }
    .encode_to_vec()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{command_integer, encode_geometry, zigzag_decode, zigzag_encode};
    use crate::feature::GeometryType;
    use crate::mvt::decode_geometry;

    #[test]
    fn zigzag_small_values() {
        assert_eq!(zigzag_encode(0), 0);
        assert_eq!(zigzag_encode(-1), 1);
        assert_eq!(zigzag_encode(1), 2);
        assert_eq!(zigzag_encode(-2), 3);
        assert_eq!(zigzag_decode(3), -2);
        assert_eq!(zigzag_decode(zigzag_encode(i32::MIN)), i32::MIN);
    }

    #[test]
    fn polygon_ring_uses_close_path() {
        let cmds = encode_geometry(
            GeometryType::Polygon,
            &[vec![[3, 6], [8, 12], [20, 34], [3, 6]]],
        );
        assert_eq!(cmds, vec![9, 6, 12, 18, 10, 12, 24, 44, 15]);
        assert_eq!(cmds[0], command_integer(1, 1));
    }

    fn as_f64(parts: &[Vec<[i32; 2]>]) -> Vec<Vec<[f64; 2]>> {
        parts
            .iter()
            .map(|p| p.iter().map(|&[x, y]| [x as f64, y as f64]).collect())
            .collect()
    }

    fn point() -> impl Strategy<Value = [i32; 2]> {
        (any::<i32>(), any::<i32>()).prop_map(|(x, y)| [x, y])
    }

    proptest! {
        #[test]
        fn line_strings_decode_to_their_absolute_coordinates(
            parts in prop::collection::vec(prop::collection::vec(point(), 2..8), 1..4)
        ) {
            let cmds = encode_geometry(GeometryType::LineString, &parts);
            let decoded = decode_geometry(&cmds, GeometryType::LineString).unwrap();
            prop_assert_eq!(decoded, as_f64(&parts));
        }

        #[test]
        fn points_decode_into_one_part(points in prop::collection::vec(point(), 1..16)) {
            let parts = vec![points];
            let cmds = encode_geometry(GeometryType::Point, &parts);
            let decoded = decode_geometry(&cmds, GeometryType::Point).unwrap();
            prop_assert_eq!(decoded, as_f64(&parts));
        }

        #[test]
        fn polygon_rings_come_back_closed(
            ring in prop::collection::vec(point(), 3..10)
        ) {
            prop_assume!(ring.first() != ring.last());
            let cmds = encode_geometry(GeometryType::Polygon, &[ring.clone()]);
            let decoded = decode_geometry(&cmds, GeometryType::Polygon).unwrap();
            let mut expected = as_f64(&[ring]);
            let first = expected[0][0];
            expected[0].push(first);
            prop_assert_eq!(decoded, expected);
        }
    }
}
