//! Source + config + worker pool: turns one `LoadRequest` into one result.

use std::sync::Arc;

use formats::mvt;
use formats::{ColumnarFeatures, DecodedFeature, FeatureCollection, OutputShape};
use foundation::math::{Projection, WebMercator};
use foundation::{QueryBounds, TileIndex, TileRange};
use runtime::{CancelFlag, DispatchError, Dispatched, WorkerDispatcher};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::archive::ArchiveTileFetcher;
use crate::config::PipelineConfig;
use crate::error::{FetchError, LoadError, StreamError};
use crate::events::LoadPayload;
use crate::request::{Generation, LoadRequest, LoadTarget};
use crate::spatial::SpatialStreamReader;
use crate::transform::CoordinateTransformer;
use crate::viewport::{Viewport, visible_bounds};

/// Where features come from: tile mode or bbox-stream mode.
#[derive(Clone)]
pub enum PipelineSource {
    Archive(Arc<ArchiveTileFetcher>),
    Spatial(Arc<SpatialStreamReader>),
}

impl From<ArchiveTileFetcher> for PipelineSource {
    fn from(fetcher: ArchiveTileFetcher) -> Self {
        PipelineSource::Archive(Arc::new(fetcher))
    }
}

impl From<SpatialStreamReader> for PipelineSource {
    fn from(reader: SpatialStreamReader) -> Self {
        PipelineSource::Spatial(Arc::new(reader))
    }
}

/// Worker-side end state of one request.
#[derive(Debug)]
pub(crate) enum WorkerOutcome {
    Loaded(LoadPayload),
    Failed(LoadError),
    Cancelled,
}

/// Intermediate batch of a bounds query, sent while the worker keeps going.
#[derive(Debug)]
pub(crate) struct PartialResult {
    pub generation: Generation,
    pub target: LoadTarget,
    pub payload: LoadPayload,
}

#[derive(Clone)]
pub struct Pipeline {
    source: PipelineSource,
    config: Arc<PipelineConfig>,
    dispatcher: Arc<WorkerDispatcher>,
    transformer: CoordinateTransformer,
}

impl Pipeline {
    /// Starts a dedicated worker runtime sized by `config.worker`.
    pub fn with_worker_runtime(
        source: impl Into<PipelineSource>,
        config: PipelineConfig,
    ) -> Result<Self, DispatchError> {
        let dispatcher = WorkerDispatcher::new(&config.worker)?;
        Ok(Self::new(source, config, Arc::new(dispatcher)))
    }

    pub fn new(
        source: impl Into<PipelineSource>,
        config: PipelineConfig,
        dispatcher: Arc<WorkerDispatcher>,
    ) -> Self {
        Self {
            source: source.into(),
            config: Arc::new(config),
            dispatcher,
            transformer: CoordinateTransformer::default(),
        }
    }

    /// Replaces the Web Mercator transformer used for tile-local output.
    pub fn with_transformer(mut self, transformer: CoordinateTransformer) -> Self {
        self.transformer = transformer;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn is_tiled(&self) -> bool {
        matches!(self.source, PipelineSource::Archive(_))
    }

    /// Load targets for a viewport with their queue priority (lower first).
    ///
    /// Tile mode covers the visible bounds at the configured tile zoom and
    /// ranks tiles by distance from the view center. When the cover exceeds
    /// `max_tiles_per_request` the zoom steps down, no lower than `min_zoom`;
    /// past that only the tiles nearest the center are kept.
    pub fn targets_for(&self, viewport: &dyn Viewport) -> Vec<(u64, LoadTarget)> {
        let bounds = visible_bounds(viewport);
        if !self.is_tiled() {
            return vec![(0, LoadTarget::Bounds(bounds))];
        }

        let limit = self.config.max_tiles_per_request.max(1);
        let mut z = self.config.tile_zoom(viewport.zoom());
        let floor = self.config.min_zoom.min(z);
        let mut range = TileRange::covering(&bounds, z);
        while range.count() > limit && z > floor {
            z -= 1;
            range = TileRange::covering(&bounds, z);
        }

        let n = TileIndex::tiles_per_side(z) as f64;
        let center = viewport.unproject([viewport.width() / 2.0, viewport.height() / 2.0]);
        let [cx, cy] = WebMercator.project(center);
        let (cx, cy) = (cx * n, cy * n);

        if range.count() > limit {
            warn!("{} tiles cover the view at z{z}, loading the {limit} nearest the center", range.count());
            range = range.around([cx, cy], limit);
        }

        range
            .tiles()
            .map(|tile| {
                let dx = tile.x as f64 + 0.5 - cx;
                let dy = tile.y as f64 + 0.5 - cy;
                let priority = ((dx * dx + dy * dy) * 1024.0) as u64;
                (priority, LoadTarget::Tile(tile))
            })
            .collect()
    }

    /// Pull interface: all features intersecting `bounds`, in source
    /// coordinates.
    ///
    /// Archives are read at `min_zoom`; use `request_tile` for other levels.
    pub async fn request(&self, bounds: QueryBounds) -> Result<FeatureCollection, LoadError> {
        let pipeline = self.clone();
        let job = self
            .dispatcher
            .run(async move { pipeline.load_bounds(bounds, None).await });
        job.await?
    }

    /// Pull interface for one tile; tile-local coordinates in archive mode.
    pub async fn request_tile(&self, index: TileIndex) -> Result<Option<FeatureCollection>, LoadError> {
        match &self.source {
            PipelineSource::Archive(_) => {
                let pipeline = self.clone();
                let job = self.dispatcher.run(async move { pipeline.fetch_tile(index).await });
                job.await?
            }
            PipelineSource::Spatial(_) => {
                if !index.is_valid() {
                    return Ok(None);
                }
                self.request(index.bounds_wgs84()).await.map(Some)
            }
        }
    }

    pub(crate) fn dispatch(
        &self,
        request: LoadRequest,
        output: OutputShape,
        partials: mpsc::UnboundedSender<PartialResult>,
    ) -> Dispatched<WorkerOutcome> {
        let pipeline = self.clone();
        let job = self
            .dispatcher
            .run(async move { pipeline.execute(request, output, partials).await });
        trace!("Dispatched task {:?}", job.id());
        job
    }

    async fn execute(
        &self,
        request: LoadRequest,
        output: OutputShape,
        partials: mpsc::UnboundedSender<PartialResult>,
    ) -> WorkerOutcome {
        if request.is_cancelled() {
            return WorkerOutcome::Cancelled;
        }

        let result = match request.target {
            LoadTarget::Tile(index) => self.load_tile(index, output).await,
            LoadTarget::Bounds(bounds) => {
                let (generation, target) = (request.generation, request.target);
                let on_partial = |buf: &FeatureCollection| {
                    let payload = shape_features(buf.clone(), output);
                    let _ = partials.send(PartialResult {
                        generation,
                        target,
                        payload,
                    });
                };
                self.load_bounds_with(bounds, Some(request.cancel.clone()), on_partial)
                    .await
                    .map(|fc| shape_features(fc, output))
            }
        };

        match result {
            Ok(payload) => WorkerOutcome::Loaded(payload),
            Err(e) if e.is_cancellation() => WorkerOutcome::Cancelled,
            Err(e) => WorkerOutcome::Failed(e),
        }
    }

    async fn load_tile(&self, index: TileIndex, output: OutputShape) -> Result<LoadPayload, LoadError> {
        match &self.source {
            PipelineSource::Archive(_) => {
                let fc = self.fetch_tile(index).await?.unwrap_or_default();
                Ok(match output {
                    OutputShape::Columnar => LoadPayload::Columnar(ColumnarFeatures::from_collection(&fc)),
                    OutputShape::Features => LoadPayload::Tiled(self.transformer.resolve_tile(fc, index)),
                })
            }
            PipelineSource::Spatial(_) => {
                let fc = self.load_bounds(index.bounds_wgs84(), None).await?;
                Ok(shape_features(fc, output))
            }
        }
    }

    /// Fetches one tile; decoding runs on the blocking pool so large tiles do
    /// not hold up other requests on the worker threads.
    async fn fetch_tile(&self, index: TileIndex) -> Result<Option<FeatureCollection>, LoadError> {
        let PipelineSource::Archive(fetcher) = &self.source else {
            return Ok(None);
        };
        let Some(buf) = fetcher.fetch(index).await? else {
            return Ok(None);
        };
        let options = self.config.decode_options();
        let fc = self
            .dispatcher
            .run_blocking(move || mvt::decode_with(&buf, &options))
            .await??;
        Ok(Some(fc))
    }

    async fn load_bounds(
        &self,
        bounds: QueryBounds,
        cancel: Option<CancelFlag>,
    ) -> Result<FeatureCollection, LoadError> {
        self.load_bounds_with(bounds, cancel, |_| {}).await
    }

    async fn load_bounds_with<F>(
        &self,
        bounds: QueryBounds,
        cancel: Option<CancelFlag>,
        on_partial: F,
    ) -> Result<FeatureCollection, LoadError>
    where
        F: FnMut(&FeatureCollection) + Send,
    {
        match &self.source {
            PipelineSource::Spatial(reader) => {
                let mut query = reader.open(bounds).with_batch_size(self.config.batch_size);
                if let Some(cancel) = cancel {
                    query = query.with_cancel_flag(cancel);
                }
                Ok(query.collect_batched(on_partial).await?)
            }
            PipelineSource::Archive(_) => {
                let z = self.config.tile_zoom(self.config.min_zoom as f64);
                let limit = self.config.max_tiles_per_request;
                let tiles = TileIndex::covering(&bounds, z, limit).ok_or_else(|| FetchError::TooManyTiles {
                    zoom: z,
                    count: TileRange::covering(&bounds, z).count(),
                    limit,
                })?;
                let mut out = FeatureCollection::new();
                for index in tiles {
                    if cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
                        return Err(StreamError::AbortedByCancellation.into());
                    }
                    let Some(fc) = self.fetch_tile(index).await? else {
                        continue;
                    };
                    for g in self.transformer.resolve_tile(fc, index) {
                        out.push(DecodedFeature {
                            coordinates: g.coordinates().to_vec(),
                            extent: None,
                            ..g.feature().clone()
                        });
                    }
                }
                debug!("Archive bounds request at z{z}: {} features", out.len());
                Ok(out)
            }
        }
    }
}

fn shape_features(fc: FeatureCollection, output: OutputShape) -> LoadPayload {
    match output {
        OutputShape::Columnar => LoadPayload::Columnar(ColumnarFeatures::from_collection(&fc)),
        OutputShape::Features => LoadPayload::Features(fc),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use formats::mvt::{LayerBuilder, encode_tile};
    use formats::{GeometryType, OutputShape};
    use foundation::math::Projection;
    use foundation::{ByteRange, QueryBounds, TileIndex};
    use runtime::{CancelFlag, WorkerDispatcher};
    use serde_json::{Map, json};
    use tokio::sync::mpsc;

    use super::{Pipeline, WorkerOutcome};
    use crate::archive::{ArchiveTileFetcher, MemoryByteSource, MemoryDirectory};
    use crate::config::PipelineConfig;
    use crate::error::{ErrorKind, FetchError, LoadError};
    use crate::events::LoadPayload;
    use crate::request::{Generation, LoadRequest, LoadTarget};
    use crate::spatial::{GeoJsonRecordDecoder, MemorySpatialSource, SpatialStreamReader};
    use crate::transform::CoordinateTransformer;
    use crate::viewport::WebMercatorViewport;

    fn archive_pipeline(config: PipelineConfig) -> Pipeline {
        let mut layer = LayerBuilder::new("cities");
        layer.add_feature(Some(1), GeometryType::Point, &[vec![[2048, 2048]]], &Map::new());
        single_tile_pipeline(encode_tile(&[layer]), config)
    }

    fn single_tile_pipeline(tile: Vec<u8>, config: PipelineConfig) -> Pipeline {
        let mut dir = MemoryDirectory::new();
        dir.insert(TileIndex::new(0, 0, 0), ByteRange::new(0, tile.len() as u64));
        let fetcher = ArchiveTileFetcher::new(
            Arc::new(MemoryByteSource::new("mem", tile)),
            Arc::new(dir),
        );
        Pipeline::new(fetcher, config, Arc::new(WorkerDispatcher::current()))
    }

    fn spatial_pipeline() -> Pipeline {
        let fc = json!({"type": "FeatureCollection", "features": [
            {"type": "Feature", "properties": {"n": 1}, "geometry": {"type": "Point", "coordinates": [1.0, 1.0]}},
            {"type": "Feature", "properties": {"n": 2}, "geometry": {"type": "Point", "coordinates": [50.0, 50.0]}}
        ]});
        let source = Arc::new(MemorySpatialSource::from_geojson("pts", &fc).unwrap());
        let reader = SpatialStreamReader::new(source, Arc::new(GeoJsonRecordDecoder::new("pts")));
        Pipeline::new(reader, PipelineConfig::default(), Arc::new(WorkerDispatcher::current()))
    }

    #[tokio::test]
    async fn pull_requests_in_both_modes() {
        let spatial = spatial_pipeline();
        let fc = spatial.request(QueryBounds::new(0.0, 0.0, 10.0, 10.0)).await.unwrap();
        assert_eq!(fc.len(), 1);
        assert_eq!(fc.features[0].properties["n"], 1);

        let archive = archive_pipeline(PipelineConfig::default());
        let tile = archive.request_tile(TileIndex::new(0, 0, 0)).await.unwrap().unwrap();
        assert_eq!(tile.features[0].coordinates, vec![vec![[2048.0, 2048.0]]]);
        assert!(archive.request_tile(TileIndex::new(0, 0, 1)).await.unwrap().is_none());

        let geo = archive.request(QueryBounds::new(-10.0, -10.0, 10.0, 10.0)).await.unwrap();
        assert_eq!(geo.features[0].extent, None);
        assert_eq!(geo.features[0].coordinates[0][0], [0.0, 0.0]);
    }

    #[tokio::test]
    async fn tile_targets_are_center_first() {
        let config = PipelineConfig {
            max_zoom: 2,
            ..PipelineConfig::default()
        };
        let pipeline = archive_pipeline(config);
        let view = WebMercatorViewport::new([0.0, 0.0], 2.0, 1800.0, 1800.0);
        let mut targets = pipeline.targets_for(&view);
        assert_eq!(targets.len(), 16);
        targets.sort_by_key(|(p, _)| *p);
        for (_, target) in &targets[..4] {
            let LoadTarget::Tile(tile) = target else {
                panic!("tile target expected");
            };
            assert!((1..=2).contains(&tile.x) && (1..=2).contains(&tile.y), "{tile}");
        }
    }

    #[tokio::test]
    async fn tile_output_follows_shape() {
        let pipeline = archive_pipeline(PipelineConfig::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let request = |flag| LoadRequest::new(LoadTarget::Tile(TileIndex::new(0, 0, 0)), Generation(1), flag);

        match pipeline.dispatch(request(CancelFlag::new()), OutputShape::Columnar, tx.clone()).await {
            Ok(WorkerOutcome::Loaded(LoadPayload::Columnar(cols))) => {
                assert_eq!(cols.points.positions, vec![0.5, 0.5]);
            }
            other => panic!("unexpected {other:?}"),
        }

        match pipeline.dispatch(request(CancelFlag::new()), OutputShape::Features, tx.clone()).await {
            Ok(WorkerOutcome::Loaded(LoadPayload::Tiled(features))) => {
                assert!(!features[0].is_resolved());
                assert_eq!(features[0].coordinates()[0][0], [0.0, 0.0]);
            }
            other => panic!("unexpected {other:?}"),
        }

        let flag = CancelFlag::new();
        flag.cancel();
        let outcome = pipeline.dispatch(request(flag), OutputShape::Columnar, tx).await;
        assert!(matches!(outcome, Ok(WorkerOutcome::Cancelled)));
    }

    fn tiles_of(targets: &[(u64, LoadTarget)]) -> Vec<TileIndex> {
        targets
            .iter()
            .map(|(_, t)| match t {
                LoadTarget::Tile(tile) => *tile,
                LoadTarget::Bounds(_) => panic!("tile target expected"),
            })
            .collect()
    }

    #[tokio::test]
    async fn oversized_cover_steps_the_zoom_down() {
        let config = PipelineConfig {
            max_zoom: 16,
            zoom_offset: 15,
            max_tiles_per_request: 64,
            ..PipelineConfig::default()
        };
        let pipeline = archive_pipeline(config);
        let world_view = WebMercatorViewport::new([0.0, 0.0], 1.0, 1800.0, 1800.0);
        let tiles = tiles_of(&pipeline.targets_for(&world_view));
        assert_eq!(tiles.len(), 64);
        assert!(tiles.iter().all(|t| t.z == 3));
    }

    #[tokio::test]
    async fn cover_at_min_zoom_keeps_the_tiles_nearest_the_center() {
        let config = PipelineConfig {
            min_zoom: 16,
            max_zoom: 16,
            max_tiles_per_request: 64,
            ..PipelineConfig::default()
        };
        let pipeline = archive_pipeline(config);
        let world_view = WebMercatorViewport::new([0.0, 0.0], 1.0, 1800.0, 1800.0);
        let tiles = tiles_of(&pipeline.targets_for(&world_view));
        assert_eq!(tiles.len(), 64);
        assert!(tiles.iter().all(|t| t.z == 16));
        assert!(tiles.contains(&TileIndex::new(32768, 32768, 16)));
    }

    #[tokio::test]
    async fn archive_bounds_request_over_the_cap_fails() {
        let config = PipelineConfig {
            min_zoom: 16,
            max_zoom: 16,
            ..PipelineConfig::default()
        };
        let pipeline = archive_pipeline(config);
        let err = pipeline
            .request(QueryBounds::new(-180.0, -90.0, 180.0, 90.0))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            LoadError::Fetch(FetchError::TooManyTiles {
                zoom: 16,
                count: 1 << 32,
                limit: 256
            })
        );
        assert_eq!(err.kind(), ErrorKind::TooManyTiles);
    }

    #[tokio::test]
    async fn malformed_tile_fails_through_the_blocking_decode() {
        // field 3 (layer) as varint
        let pipeline = single_tile_pipeline(vec![0x18, 0x01], PipelineConfig::default());
        let err = pipeline.request_tile(TileIndex::new(0, 0, 0)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedWireFormat);
    }

    #[derive(Debug)]
    struct PlateCarree;

    impl Projection for PlateCarree {
        fn project(&self, [lon, lat]: [f64; 2]) -> [f64; 2] {
            [(lon + 180.0) / 360.0, (90.0 - lat) / 180.0]
        }

        fn unproject(&self, [x, y]: [f64; 2]) -> [f64; 2] {
            [x * 360.0 - 180.0, 90.0 - y * 180.0]
        }
    }

    #[tokio::test]
    async fn custom_projection_places_tile_features() {
        let mut layer = LayerBuilder::new("cities");
        layer.add_feature(Some(1), GeometryType::Point, &[vec![[1024, 1024]]], &Map::new());
        let pipeline = single_tile_pipeline(encode_tile(&[layer]), PipelineConfig::default())
            .with_transformer(CoordinateTransformer::new(Arc::new(PlateCarree)));
        let fc = pipeline.request(QueryBounds::new(-10.0, -10.0, 10.0, 10.0)).await.unwrap();
        assert_eq!(fc.features[0].coordinates, vec![vec![[-90.0, 45.0]]]);
    }
}
