use std::sync::Arc;

use formats::{
    DecodedFeature, FeatureCollection, FeatureId, GeometryType, Part, feature_to_geojson_value,
    geometry_to_geojson_value,
};
use foundation::math::{Projection, WebMercator};
use foundation::{QueryBounds, TileIndex};
use once_cell::sync::OnceCell;
use serde_json::{Map, Value};

/// A decoded feature whose geographic coordinates are computed on first read.
///
/// `coordinates()` maps tile-local points through the tile's world box and
/// the projection's inverse once, then serves the memoized result.
#[derive(Debug, Clone)]
pub struct GeoFeature {
    feature: Arc<DecodedFeature>,
    tile_bounds: Option<QueryBounds>,
    projection: Arc<dyn Projection>,
    resolved: OnceCell<Vec<Part>>,
}

impl GeoFeature {
    pub fn feature(&self) -> &DecodedFeature {
        &self.feature
    }

    pub fn id(&self) -> Option<&FeatureId> {
        self.feature.id.as_ref()
    }

    pub fn layer_name(&self) -> &str {
        &self.feature.layer_name
    }

    pub fn geometry_type(&self) -> GeometryType {
        self.feature.geometry_type
    }

    pub fn properties(&self) -> &Map<String, Value> {
        &self.feature.properties
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.get().is_some()
    }

    /// `[lon, lat]` parts.
    pub fn coordinates(&self) -> &[Part] {
        self.resolved.get_or_init(|| self.compute())
    }

    fn compute(&self) -> Vec<Part> {
        let (Some(extent), Some(bbox)) = (self.feature.extent, self.tile_bounds) else {
            return self.feature.coordinates.clone();
        };
        let extent = extent as f64;
        let (w, h) = (bbox.width(), bbox.height());
        self.feature
            .coordinates
            .iter()
            .map(|part| {
                part.iter()
                    .map(|[x, y]| {
                        let world = [bbox.min_x + x / extent * w, bbox.min_y + y / extent * h];
                        self.projection.unproject(world)
                    })
                    .collect()
            })
            .collect()
    }

    /// `{"type": "Feature", geometry, properties, layerName}` with resolved
    /// coordinates.
    pub fn to_geojson_value(&self) -> Value {
        feature_to_geojson_value(
            self.id(),
            self.layer_name(),
            geometry_to_geojson_value(self.geometry_type(), self.coordinates()),
            self.properties(),
        )
    }
}

#[derive(Debug, Clone)]
pub struct CoordinateTransformer {
    projection: Arc<dyn Projection>,
}

impl Default for CoordinateTransformer {
    fn default() -> Self {
        Self::new(Arc::new(WebMercator))
    }
}

impl CoordinateTransformer {
    pub fn new(projection: Arc<dyn Projection>) -> Self {
        Self { projection }
    }

    /// Wraps `feature` without transforming anything yet. `tile_bounds` is the
    /// tile's box in world space; `None` marks already-geographic input.
    pub fn resolve(&self, feature: Arc<DecodedFeature>, tile_bounds: Option<QueryBounds>) -> GeoFeature {
        GeoFeature {
            feature,
            tile_bounds,
            projection: Arc::clone(&self.projection),
            resolved: OnceCell::new(),
        }
    }

    pub fn resolve_tile(&self, collection: FeatureCollection, index: TileIndex) -> Vec<GeoFeature> {
        let bounds = index.world_bounds();
        collection
            .into_iter()
            .map(|f| self.resolve(Arc::new(f), Some(bounds)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use formats::{DecodedFeature, FeatureCollection, GeometryType};
    use foundation::TileIndex;
    use serde_json::Map;

    use super::CoordinateTransformer;

    fn local(points: Vec<[f64; 2]>) -> DecodedFeature {
        DecodedFeature {
            id: None,
            layer_name: "l".to_string(),
            geometry_type: GeometryType::Point,
            coordinates: vec![points],
            properties: Map::new(),
            extent: Some(4096),
        }
    }

    #[test]
    fn tile_origin_maps_to_north_west_corner() {
        let tile = TileIndex::new(0, 0, 1);
        let nw = tile.bounds_wgs84();
        let fc = FeatureCollection::from(vec![local(vec![[0.0, 0.0], [4096.0, 4096.0]])]);
        let out = CoordinateTransformer::default().resolve_tile(fc, tile);

        assert!(!out[0].is_resolved());
        let coords = out[0].coordinates();
        assert!(out[0].is_resolved());
        assert_eq!(coords[0][0], [nw.min_x, nw.max_y]);
        assert_eq!(coords[0][1][0], 0.0);
        assert!(coords[0][1][1].abs() < 1e-9);
    }

    #[test]
    fn memoized_result_is_reused() {
        let t = CoordinateTransformer::default();
        let g = t.resolve(Arc::new(local(vec![[2048.0, 2048.0]])), Some(TileIndex::new(0, 0, 0).world_bounds()));
        let first = g.coordinates().as_ptr();
        assert_eq!(first, g.coordinates().as_ptr());
        assert_eq!(g.coordinates()[0][0], [0.0, 0.0]);
    }

    #[test]
    fn geographic_input_passes_through() {
        let mut f = local(vec![[13.4, 52.5]]);
        f.extent = None;
        let g = CoordinateTransformer::default().resolve(Arc::new(f), None);
        assert_eq!(g.coordinates(), &[vec![[13.4, 52.5]]]);
        assert_eq!(g.to_geojson_value()["geometry"]["coordinates"][0], 13.4);
    }
}
