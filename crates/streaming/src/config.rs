use std::time::Duration;

use formats::OutputShape;
use formats::mvt::DecodeOptions;
use foundation::MAX_ZOOM;
use runtime::WorkerConfig;
use serde::{Deserialize, Serialize};

use crate::viewport::Viewport;

/// Pipeline tuning, fixed for the lifetime of a `Pipeline`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Quiet period after the last viewport change before loading.
    pub debounce_ms: u64,

    /// Features per partial result on bounds queries.
    pub batch_size: usize,

    pub output: OutputShape,

    /// Tiles of one generation being fetched/decoded at once.
    pub max_inflight_tiles: usize,

    /// Upper bound on the tiles one request may cover. Viewport loads step the
    /// zoom down to fit; archive bounds requests over it fail.
    pub max_tiles_per_request: u64,

    pub min_zoom: u8,
    pub max_zoom: u8,

    /// Added to the viewport zoom before picking the tile zoom.
    pub zoom_offset: i8,

    /// Restrict decoding to these layers.
    pub layers: Option<Vec<String>>,

    /// Copy each feature's layer name into this property.
    pub layer_property: Option<String>,

    pub worker: WorkerConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 250,
            batch_size: 200,
            output: OutputShape::Columnar,
            max_inflight_tiles: 6,
            max_tiles_per_request: 256,
            min_zoom: 0,
            max_zoom: 14,
            zoom_offset: 0,
            layers: None,
            layer_property: None,
            worker: WorkerConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_json_str(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn decode_options(&self) -> DecodeOptions {
        DecodeOptions {
            layers: self.layers.clone(),
            layer_property: self.layer_property.clone(),
        }
    }

    /// `clamp(floor(zoom) + zoom_offset, min_zoom, max_zoom)`.
    pub fn tile_zoom(&self, viewport_zoom: f64) -> u8 {
        let max = self.max_zoom.min(MAX_ZOOM);
        let min = self.min_zoom.min(max);
        let z = viewport_zoom.floor() as i64 + self.zoom_offset as i64;
        z.clamp(min as i64, max as i64) as u8
    }

    /// The configured shape, except that globe views always get features.
    pub fn output_for(&self, viewport: &dyn Viewport) -> OutputShape {
        if viewport.is_globe() {
            OutputShape::Features
        } else {
            self.output
        }
    }
}
