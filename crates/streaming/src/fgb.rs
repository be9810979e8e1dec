//! FlatGeobuf files as a [`SpatialSource`].
//!
//! The packed R-tree search is done by the `flatgeobuf` crate on the blocking
//! pool; each hit is forwarded as a GeoJSON `Feature` record.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Cursor};
use std::path::PathBuf;

use bytes::Bytes;
use fallible_streaming_iterator::FallibleStreamingIterator;
use flatgeobuf::{FgbFeature, FgbReader};
use foundation::QueryBounds;
use futures_util::stream::{self, StreamExt};
use geozero::{FeatureProperties, ToJson};
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::archive::ReadSeek;
use crate::error::SourceError;
use crate::spatial::{RecordStream, SpatialSource};

/// Records buffered ahead of the consumer.
const RECORD_BUFFER: usize = 64;

#[derive(Clone)]
enum FgbData {
    File(PathBuf),
    Memory(Bytes),
}

impl FgbData {
    fn open(&self) -> Result<Box<dyn ReadSeek>, SourceError> {
        match self {
            FgbData::File(path) => {
                let file = File::open(path).map_err(|e| SourceError::new(format!("{}: {e}", path.display())))?;
                Ok(Box::new(BufReader::new(file)))
            }
            FgbData::Memory(bytes) => Ok(Box::new(Cursor::new(bytes.clone()))),
        }
    }
}

/// A `.fgb` file with a spatial index. Features come out in file order, which
/// is the index's Hilbert order.
pub struct FgbSpatialSource {
    identifier: String,
    data: FgbData,
}

impl FgbSpatialSource {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            identifier: path.display().to_string(),
            data: FgbData::File(path),
        }
    }

    pub fn from_bytes(identifier: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            identifier: identifier.into(),
            data: FgbData::Memory(data.into()),
        }
    }
}

impl SpatialSource for FgbSpatialSource {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn open_spatial_stream(&self, bounds: QueryBounds) -> RecordStream {
        let (tx, rx) = mpsc::channel(RECORD_BUFFER);
        // The reader starts on first poll so opening a stream needs no runtime.
        let mut pending = Some((self.data.clone(), self.identifier.clone(), tx));
        stream::unfold(rx, move |mut rx| {
            if let Some((data, identifier, tx)) = pending.take() {
                tokio::task::spawn_blocking(move || {
                    if let Err(e) = send_hits(&data, bounds, &tx) {
                        debug!("FlatGeobuf query on {identifier} failed: {e}");
                        let _ = tx.blocking_send(Err(e));
                    }
                });
            }
            async move { rx.recv().await.map(|record| (record, rx)) }
        })
        .boxed()
    }
}

fn fgb_error(e: impl std::fmt::Display) -> SourceError {
    SourceError::new(format!("flatgeobuf: {e}"))
}

fn send_hits(
    data: &FgbData,
    bounds: QueryBounds,
    tx: &mpsc::Sender<Result<Bytes, SourceError>>,
) -> Result<(), SourceError> {
    let mut hits = FgbReader::open(data.open()?)
        .map_err(fgb_error)?
        .select_bbox(bounds.min_x, bounds.min_y, bounds.max_x, bounds.max_y)
        .map_err(fgb_error)?;
    while let Some(feature) = hits.next().map_err(fgb_error)? {
        let record = feature_record(feature)?;
        if tx.blocking_send(Ok(record)).is_err() {
            trace!("FlatGeobuf consumer went away");
            break;
        }
    }
    Ok(())
}

fn feature_record(feature: &FgbFeature) -> Result<Bytes, SourceError> {
    let geometry: Value = serde_json::from_str(&feature.to_json().map_err(fgb_error)?).map_err(fgb_error)?;
    let properties: HashMap<String, String> = feature.properties().map_err(fgb_error)?;
    let properties: Map<String, Value> = properties
        .into_iter()
        .map(|(k, v)| (k, property_value(v)))
        .collect();
    let record = json!({"type": "Feature", "geometry": geometry, "properties": properties});
    Ok(Bytes::from(record.to_string()))
}

/// Properties arrive as text; numbers and booleans are restored.
fn property_value(text: String) -> Value {
    match serde_json::from_str::<Value>(&text) {
        Ok(v @ (Value::Number(_) | Value::Bool(_))) => v,
        _ => Value::String(text),
    }
}
