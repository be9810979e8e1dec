use formats::{ColumnarFeatures, FeatureCollection};
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::ErrorKind;
use crate::request::{Generation, LoadTarget};
use crate::transform::GeoFeature;

/// Result data in the pipeline's configured output shape.
#[derive(Debug, Clone)]
pub enum LoadPayload {
    /// Bounds queries with feature output.
    Features(FeatureCollection),
    /// Tile loads with feature output; coordinates resolve lazily.
    Tiled(Vec<GeoFeature>),
    Columnar(ColumnarFeatures),
}

impl LoadPayload {
    pub fn feature_count(&self) -> usize {
        match self {
            LoadPayload::Features(fc) => fc.len(),
            LoadPayload::Tiled(features) => features.len(),
            LoadPayload::Columnar(cols) => cols.feature_count(),
        }
    }
}

/// Consumer of applied results. Only results of the current generation ever
/// reach a sink, and cancellations are never reported.
pub trait LoadSink: Send + Sync {
    fn on_load(&self, generation: Generation, target: LoadTarget, payload: LoadPayload);

    fn on_partial(&self, generation: Generation, target: LoadTarget, payload: LoadPayload);

    fn on_error(&self, generation: Generation, kind: ErrorKind, detail: String);
}

#[derive(Debug, Clone)]
pub enum LoadEvent {
    Partial {
        generation: Generation,
        target: LoadTarget,
        payload: LoadPayload,
    },
    Loaded {
        generation: Generation,
        target: LoadTarget,
        payload: LoadPayload,
    },
    Failed {
        generation: Generation,
        kind: ErrorKind,
        detail: String,
    },
}

impl LoadEvent {
    pub fn generation(&self) -> Generation {
        match self {
            LoadEvent::Partial { generation, .. }
            | LoadEvent::Loaded { generation, .. }
            | LoadEvent::Failed { generation, .. } => *generation,
        }
    }
}

/// Forwards sink callbacks as `LoadEvent`s.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<LoadEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LoadEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: LoadEvent) {
        if self.tx.send(event).is_err() {
            trace!("Load event receiver dropped");
        }
    }
}

impl LoadSink for ChannelSink {
    fn on_load(&self, generation: Generation, target: LoadTarget, payload: LoadPayload) {
        self.send(LoadEvent::Loaded {
            generation,
            target,
            payload,
        });
    }

    fn on_partial(&self, generation: Generation, target: LoadTarget, payload: LoadPayload) {
        self.send(LoadEvent::Partial {
            generation,
            target,
            payload,
        });
    }

    fn on_error(&self, generation: Generation, kind: ErrorKind, detail: String) {
        self.send(LoadEvent::Failed {
            generation,
            kind,
            detail,
        });
    }
}
