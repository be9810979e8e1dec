use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::feature::{DecodedFeature, FeatureCollection, FeatureId, GeometryType, Part};

/// Shape of a worker result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputShape {
    /// One `DecodedFeature` per feature.
    Features,
    /// Flat coordinate columns grouped by geometry kind.
    #[default]
    Columnar,
}

/// Flat xy positions plus, per vertex, the index of the owning feature.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointColumns {
    pub positions: Vec<f64>,
    pub feature_indices: Vec<u32>,
}

/// `path_indices` holds the start vertex of every path plus a trailing end.
#[derive(Debug, Clone, PartialEq)]
pub struct LineColumns {
    pub positions: Vec<f64>,
    pub path_indices: Vec<u32>,
    pub feature_indices: Vec<u32>,
}

impl Default for LineColumns {
    fn default() -> Self {
        Self {
            positions: Vec::new(),
            path_indices: vec![0],
            feature_indices: Vec::new(),
        }
    }
}

/// `polygon_indices` delimits features, `ring_indices` delimits rings; both
/// are vertex offsets with a trailing end.
#[derive(Debug, Clone, PartialEq)]
pub struct PolygonColumns {
    pub positions: Vec<f64>,
    pub polygon_indices: Vec<u32>,
    pub ring_indices: Vec<u32>,
    pub feature_indices: Vec<u32>,
}

impl Default for PolygonColumns {
    fn default() -> Self {
        Self {
            positions: Vec::new(),
            polygon_indices: vec![0],
            ring_indices: vec![0],
            feature_indices: Vec::new(),
        }
    }
}

/// Column-oriented equivalent of a `FeatureCollection`.
///
/// Per-feature attributes (`ids`, `layer_names`, `properties`,
/// `geometry_types`) are indexed by the feature indices stored with each
/// vertex. Tile-local coordinates are divided by their extent, so every
/// position lies in `[0, 1]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnarFeatures {
    pub points: PointColumns,
    pub lines: LineColumns,
    pub polygons: PolygonColumns,
    pub ids: Vec<Option<FeatureId>>,
    pub layer_names: Vec<String>,
    pub properties: Vec<Map<String, Value>>,
    pub geometry_types: Vec<GeometryType>,
    normalized: Vec<bool>,
}

impl ColumnarFeatures {
    pub fn from_collection(collection: &FeatureCollection) -> Self {
        let mut out = Self::default();
        for feature in collection.iter() {
            out.push(feature);
        }
        out
    }

    pub fn feature_count(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn vertex_count(&self) -> usize {
        (self.points.positions.len() + self.lines.positions.len() + self.polygons.positions.len())
            / 2
    }

    pub fn push(&mut self, feature: &DecodedFeature) {
        let index = self.ids.len() as u32;
        let scale = feature.extent.map_or(1.0, |e| 1.0 / e as f64);

        match feature.geometry_type {
            GeometryType::Point => {
                for p in feature.coordinates.iter().flatten() {
                    push_position(&mut self.points.positions, *p, scale);
                    self.points.feature_indices.push(index);
                }
            }
            GeometryType::LineString => {
                for part in &feature.coordinates {
                    for p in part {
                        push_position(&mut self.lines.positions, *p, scale);
                        self.lines.feature_indices.push(index);
                    }
                    self.lines
                        .path_indices
                        .push(self.lines.feature_indices.len() as u32);
                }
            }
            GeometryType::Polygon => {
                for ring in &feature.coordinates {
                    for p in ring {
                        push_position(&mut self.polygons.positions, *p, scale);
                        self.polygons.feature_indices.push(index);
                    }
                    self.polygons
                        .ring_indices
                        .push(self.polygons.feature_indices.len() as u32);
                }
                self.polygons
                    .polygon_indices
                    .push(self.polygons.feature_indices.len() as u32);
            }
        }

        self.ids.push(feature.id.clone());
        self.layer_names.push(feature.layer_name.clone());
        self.properties.push(feature.properties.clone());
        self.geometry_types.push(feature.geometry_type);
        self.normalized.push(feature.extent.is_some());
    }

    /// Rebuilds feature `index` from the columns. Normalized features come
    /// back with an extent of 1.
    pub fn feature(&self, index: usize) -> Option<DecodedFeature> {
        let geometry_type = *self.geometry_types.get(index)?;
        let owner = index as u32;
        let coordinates = match geometry_type {
            GeometryType::Point => {
                let part: Part = self
                    .points
                    .feature_indices
                    .iter()
                    .enumerate()
                    .filter(|(_, f)| **f == owner)
                    .map(|(v, _)| vertex(&self.points.positions, v))
                    .collect();
                vec![part]
            }
            GeometryType::LineString => collect_parts(
                &self.lines.path_indices,
                &self.lines.feature_indices,
                &self.lines.positions,
                owner,
            ),
            GeometryType::Polygon => collect_parts(
                &self.polygons.ring_indices,
                &self.polygons.feature_indices,
                &self.polygons.positions,
                owner,
            ),
        };

        Some(DecodedFeature {
            id: self.ids[index].clone(),
            layer_name: self.layer_names[index].clone(),
            geometry_type,
            coordinates,
            properties: self.properties[index].clone(),
            extent: self.normalized[index].then_some(1),
        })
    }

    pub fn to_collection(&self) -> FeatureCollection {
        (0..self.feature_count())
            .filter_map(|i| self.feature(i))
            .collect()
    }
}

impl From<&FeatureCollection> for ColumnarFeatures {
    fn from(collection: &FeatureCollection) -> Self {
        Self::from_collection(collection)
    }
}

fn push_position(positions: &mut Vec<f64>, [x, y]: [f64; 2], scale: f64) {
    positions.push(x * scale);
    positions.push(y * scale);
}

fn vertex(positions: &[f64], v: usize) -> [f64; 2] {
    [positions[v * 2], positions[v * 2 + 1]]
}

fn collect_parts(starts: &[u32], owners: &[u32], positions: &[f64], owner: u32) -> Vec<Part> {
    starts
        .windows(2)
        .filter(|w| w[0] < w[1] && owners[w[0] as usize] == owner)
        .map(|w| (w[0] as usize..w[1] as usize).map(|v| vertex(positions, v)).collect())
        .collect()
}
