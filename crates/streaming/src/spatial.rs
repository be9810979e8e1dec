//! Bounding-box queries against a spatially indexed record stream.
//!
//! The index itself is an external capability ([`SpatialSource`]); the reader
//! decodes what it yields, batches partial results and honours cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use formats::{DecodeError, DecodedFeature, FeatureCollection};
use foundation::QueryBounds;
use futures_util::future::ready;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use parking_lot::Mutex;
use runtime::CancelFlag;
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::{SourceError, StreamError};

pub const DEFAULT_BATCH_SIZE: usize = 200;

pub type RecordStream = BoxStream<'static, Result<Bytes, SourceError>>;

/// Spatially sorted record store. Only records intersecting `bounds` are
/// produced, in source order.
pub trait SpatialSource: Send + Sync {
    fn identifier(&self) -> &str;

    fn open_spatial_stream(&self, bounds: QueryBounds) -> RecordStream;
}

/// Turns one raw record into a feature; `Ok(None)` skips records without
/// geometry.
pub trait RecordDecoder: Send + Sync {
    fn decode_record(&self, record: &[u8]) -> Result<Option<DecodedFeature>, DecodeError>;
}

/// Records encoded as GeoJSON `Feature` objects.
#[derive(Debug, Clone)]
pub struct GeoJsonRecordDecoder {
    layer_name: String,
}

impl GeoJsonRecordDecoder {
    pub fn new(layer_name: impl Into<String>) -> Self {
        Self {
            layer_name: layer_name.into(),
        }
    }
}

impl RecordDecoder for GeoJsonRecordDecoder {
    fn decode_record(&self, record: &[u8]) -> Result<Option<DecodedFeature>, DecodeError> {
        let value: Value = serde_json::from_slice(record).map_err(|e| DecodeError::InvalidRecord {
            reason: e.to_string(),
        })?;
        DecodedFeature::from_geojson_value(&value, &self.layer_name)
    }
}

struct IndexedRecord {
    bounds: QueryBounds,
    bytes: Bytes,
}

/// In-memory spatial source over GeoJSON features, each indexed by its
/// bounding box.
pub struct MemorySpatialSource {
    identifier: String,
    records: Arc<Vec<IndexedRecord>>,
    reads: Arc<AtomicUsize>,
    queries: Mutex<Vec<QueryBounds>>,
}

impl MemorySpatialSource {
    /// Builds the index from a GeoJSON `FeatureCollection`. Features that do
    /// not parse or carry no geometry are rejected.
    pub fn from_geojson(identifier: impl Into<String>, collection: &Value) -> Result<Self, DecodeError> {
        let features = collection
            .get("features")
            .and_then(Value::as_array)
            .ok_or_else(|| DecodeError::InvalidRecord {
                reason: "expected a FeatureCollection with a features array".to_string(),
            })?;

        let mut records = Vec::with_capacity(features.len());
        for value in features {
            let bounds = DecodedFeature::from_geojson_value(value, "")?
                .and_then(|f| f.bounds())
                .ok_or_else(|| DecodeError::InvalidRecord {
                    reason: "feature without coordinates".to_string(),
                })?;
            records.push(IndexedRecord {
                bounds,
                bytes: Bytes::from(value.to_string()),
            });
        }

        Ok(Self {
            identifier: identifier.into(),
            records: Arc::new(records),
            reads: Arc::new(AtomicUsize::new(0)),
            queries: Mutex::new(Vec::new()),
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records handed out so far, across all queries.
    pub fn records_read(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// Bounds of every stream opened so far, oldest first.
    pub fn queries(&self) -> Vec<QueryBounds> {
        self.queries.lock().clone()
    }
}

impl SpatialSource for MemorySpatialSource {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn open_spatial_stream(&self, bounds: QueryBounds) -> RecordStream {
        self.queries.lock().push(bounds);
        let records = Arc::clone(&self.records);
        let reads = Arc::clone(&self.reads);
        stream::iter(0..records.len())
            .filter_map(move |i| {
                let record = &records[i];
                let hit = record.bounds.intersects(&bounds).then(|| {
                    reads.fetch_add(1, Ordering::Relaxed);
                    Ok(record.bytes.clone())
                });
                ready(hit)
            })
            .boxed()
    }
}

pub struct SpatialStreamReader {
    source: Arc<dyn SpatialSource>,
    decoder: Arc<dyn RecordDecoder>,
    batch_size: usize,
}

impl SpatialStreamReader {
    pub fn new(source: Arc<dyn SpatialSource>, decoder: Arc<dyn RecordDecoder>) -> Self {
        Self {
            source,
            decoder,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn identifier(&self) -> &str {
        self.source.identifier()
    }

    /// Lazy query: the source is not touched until the first poll.
    pub fn open(&self, bounds: QueryBounds) -> SpatialQuery {
        SpatialQuery {
            source: Arc::clone(&self.source),
            decoder: Arc::clone(&self.decoder),
            bounds,
            batch_size: self.batch_size,
            cancel: CancelFlag::new(),
            stream: None,
            done: false,
        }
    }
}

/// One finite, cancellable pass over the records intersecting `bounds`.
/// Not restartable once finished or cancelled.
pub struct SpatialQuery {
    source: Arc<dyn SpatialSource>,
    decoder: Arc<dyn RecordDecoder>,
    bounds: QueryBounds,
    batch_size: usize,
    cancel: CancelFlag,
    stream: Option<RecordStream>,
    done: bool,
}

impl SpatialQuery {
    pub fn bounds(&self) -> QueryBounds {
        self.bounds
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Shares an externally owned flag, e.g. the one of a `LoadRequest`.
    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Next decoded feature. The cancel flag is checked before every read;
    /// once it is set this yields `AbortedByCancellation` and then ends.
    pub async fn next_feature(&mut self) -> Option<Result<DecodedFeature, StreamError>> {
        loop {
            if self.done {
                return None;
            }
            if self.cancel.is_cancelled() {
                self.done = true;
                self.stream = None;
                return Some(Err(StreamError::AbortedByCancellation));
            }

            if self.stream.is_none() {
                trace!("Opening spatial stream on {}", self.source.identifier());
                self.stream = Some(self.source.open_spatial_stream(self.bounds));
            }
            let Some(stream) = self.stream.as_mut() else {
                return None;
            };

            match stream.next().await {
                None => {
                    self.done = true;
                    return None;
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(StreamError::Source(e.message)));
                }
                Some(Ok(record)) => match self.decoder.decode_record(&record) {
                    Ok(Some(feature)) => return Some(Ok(feature)),
                    Ok(None) => continue,
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e.into()));
                    }
                },
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<DecodedFeature, StreamError>> + Send {
        stream::unfold(self, |mut query| async move {
            let item = query.next_feature().await?;
            Some((item, query))
        })
    }

    /// Drains the query, calling `on_partial` with the accumulated features
    /// every `batch_size` features, and returns the complete collection.
    ///
    /// No callback fires once the flag is set; the call then returns
    /// `AbortedByCancellation`.
    pub async fn collect_batched<F>(mut self, mut on_partial: F) -> Result<FeatureCollection, StreamError>
    where
        F: FnMut(&FeatureCollection) + Send,
    {
        let mut buffer = FeatureCollection::new();
        while let Some(item) = self.next_feature().await {
            buffer.push(item?);
            if buffer.len() % self.batch_size == 0 {
                if self.cancel.is_cancelled() {
                    return Err(StreamError::AbortedByCancellation);
                }
                trace!("Partial spatial batch: {} features", buffer.len());
                on_partial(&buffer);
            }
        }
        if self.cancel.is_cancelled() {
            return Err(StreamError::AbortedByCancellation);
        }
        debug!(
            "Spatial query on {} complete: {} features",
            self.source.identifier(),
            buffer.len()
        );
        Ok(buffer)
    }
}
