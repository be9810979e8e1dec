//! Tile fetching from a single packed archive.
//!
//! The archive's directory search is an external capability
//! ([`TileDirectory`]); this module turns its byte ranges into tile buffers.
//! PMTiles archives bring their own directory and are read as a whole.

use std::collections::HashMap;
use std::future::Future;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use flate2::read::GzDecoder;
use foundation::{ByteRange, TileIndex};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, trace, warn};

use crate::error::{FetchError, SourceError};
use crate::pmtiles::PmTilesArchive;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Blocking reader handed to file-format crates.
pub(crate) trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// Byte-addressable backing store of an archive.
///
/// Implementations must be `Send + Sync` for use across worker tasks.
/// Methods return boxed futures for dyn-compatibility.
pub trait ByteSource: Send + Sync {
    /// Name used in logs and errors (path, URL, ...).
    fn identifier(&self) -> &str;

    /// Total size when known up front.
    fn size(&self) -> Option<u64> {
        None
    }

    fn get_bytes(&self, offset: u64, length: u64) -> BoxFuture<'_, Result<Bytes, SourceError>>;
}

/// Resolves a tile to the byte range holding it; `None` for sparse tiles.
pub trait TileDirectory: Send + Sync {
    fn resolve_tile_byte_range(
        &self,
        index: TileIndex,
    ) -> BoxFuture<'_, Result<Option<ByteRange>, SourceError>>;
}

pub struct MemoryByteSource {
    identifier: String,
    data: Bytes,
}

impl MemoryByteSource {
    pub fn new(identifier: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            identifier: identifier.into(),
            data: data.into(),
        }
    }
}

impl ByteSource for MemoryByteSource {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn size(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    fn get_bytes(&self, offset: u64, length: u64) -> BoxFuture<'_, Result<Bytes, SourceError>> {
        let range = ByteRange::new(offset, length);
        let result = if range.fits_within(self.data.len() as u64) {
            Ok(self.data.slice(offset as usize..(offset + length) as usize))
        } else {
            Err(SourceError::new(format!(
                "range {offset}+{length} outside {} bytes",
                self.data.len()
            )))
        };
        Box::pin(async move { result })
    }
}

/// Local archive file, read with a seek per request.
pub struct FileByteSource {
    identifier: String,
    path: PathBuf,
    size: u64,
}

impl FileByteSource {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref().to_path_buf();
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| SourceError::new(format!("{}: {e}", path.display())))?;
        Ok(Self {
            identifier: path.display().to_string(),
            path,
            size: meta.len(),
        })
    }
}

impl ByteSource for FileByteSource {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn size(&self) -> Option<u64> {
        Some(self.size)
    }

    fn get_bytes(&self, offset: u64, length: u64) -> BoxFuture<'_, Result<Bytes, SourceError>> {
        Box::pin(async move {
            let len = usize::try_from(length)
                .map_err(|_| SourceError::new(format!("range length {length} too large")))?;
            let mut file = tokio::fs::File::open(&self.path)
                .await
                .map_err(|e| SourceError::new(format!("open failed: {e}")))?;
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| SourceError::new(format!("seek failed: {e}")))?;
            let mut buf = vec![0u8; len];
            file.read_exact(&mut buf)
                .await
                .map_err(|e| SourceError::new(format!("read failed: {e}")))?;
            Ok(Bytes::from(buf))
        })
    }
}

/// Remote archive read with HTTP `Range` requests.
pub struct HttpByteSource {
    url: String,
    client: reqwest::Client,
    size: Option<u64>,
}

impl HttpByteSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
            size: None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }
}

impl ByteSource for HttpByteSource {
    fn identifier(&self) -> &str {
        &self.url
    }

    fn size(&self) -> Option<u64> {
        self.size
    }

    fn get_bytes(&self, offset: u64, length: u64) -> BoxFuture<'_, Result<Bytes, SourceError>> {
        Box::pin(async move {
            if length == 0 {
                return Ok(Bytes::new());
            }
            let last = offset
                .checked_add(length - 1)
                .ok_or_else(|| SourceError::new("range end overflows"))?;
            let resp = self
                .client
                .get(&self.url)
                .header(reqwest::header::RANGE, format!("bytes={offset}-{last}"))
                .send()
                .await
                .map_err(|e| SourceError::new(format!("HTTP request failed: {e}")))?;

            let status = resp.status();
            if !status.is_success() {
                return Err(SourceError::new(format!("HTTP error: {status}")));
            }

            let body = resp
                .bytes()
                .await
                .map_err(|e| SourceError::new(format!("failed to read response: {e}")))?;

            // Servers ignoring Range answer 200 with the whole object.
            if status == reqwest::StatusCode::OK && body.len() as u64 > length {
                let end = offset.saturating_add(length).min(body.len() as u64);
                let start = offset.min(end);
                return Ok(body.slice(start as usize..end as usize));
            }
            Ok(body)
        })
    }
}

/// Directory held in memory, keyed by tile.
#[derive(Debug, Clone, Default)]
pub struct MemoryDirectory {
    entries: HashMap<TileIndex, ByteRange>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, index: TileIndex, range: ByteRange) {
        self.entries.insert(index, range);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parses `{"z/x/y": [offset, length], ...}`.
    pub fn from_json_str(s: &str) -> Result<Self, FetchError> {
        let value: Value =
            serde_json::from_str(s).map_err(|e| FetchError::Directory(e.to_string()))?;
        let obj = value
            .as_object()
            .ok_or_else(|| FetchError::Directory("directory must be a JSON object".into()))?;

        let mut dir = Self::new();
        for (key, entry) in obj {
            let index = TileIndex::parse(key)
                .ok_or_else(|| FetchError::Directory(format!("invalid tile key {key:?}")))?;
            let range = entry
                .as_array()
                .filter(|a| a.len() == 2)
                .and_then(|a| Some(ByteRange::new(a[0].as_u64()?, a[1].as_u64()?)))
                .ok_or_else(|| {
                    FetchError::Directory(format!("entry for {key} must be [offset, length]"))
                })?;
            dir.insert(index, range);
        }
        Ok(dir)
    }
}

impl TileDirectory for MemoryDirectory {
    fn resolve_tile_byte_range(
        &self,
        index: TileIndex,
    ) -> BoxFuture<'_, Result<Option<ByteRange>, SourceError>> {
        let range = self.entries.get(&index).copied();
        Box::pin(async move { Ok(range) })
    }
}

pub fn is_gzipped(buf: &[u8]) -> bool {
    buf.len() >= 2 && buf[0] == 0x1F && buf[1] == 0x8B
}

/// Inflates gzip-framed tile data; anything else is returned as is.
pub fn decompress_tile(bytes: Bytes) -> std::io::Result<Bytes> {
    if !is_gzipped(&bytes) {
        return Ok(bytes);
    }
    let mut out = Vec::with_capacity(bytes.len() * 4);
    GzDecoder::new(&bytes[..]).read_to_end(&mut out)?;
    trace!("Decompressed tile: {} -> {} bytes", bytes.len(), out.len());
    Ok(Bytes::from(out))
}

enum TileStore {
    Ranged {
        source: Arc<dyn ByteSource>,
        directory: Arc<dyn TileDirectory>,
    },
    PmTiles(PmTilesArchive),
}

pub struct ArchiveTileFetcher {
    store: TileStore,
}

impl ArchiveTileFetcher {
    pub fn new(source: Arc<dyn ByteSource>, directory: Arc<dyn TileDirectory>) -> Self {
        Self {
            store: TileStore::Ranged { source, directory },
        }
    }

    pub fn pmtiles(archive: PmTilesArchive) -> Self {
        Self {
            store: TileStore::PmTiles(archive),
        }
    }

    pub fn identifier(&self) -> &str {
        match &self.store {
            TileStore::Ranged { source, .. } => source.identifier(),
            TileStore::PmTiles(archive) => archive.identifier(),
        }
    }

    /// Zoom levels the archive declares, when its format records them.
    pub fn zoom_range(&self) -> Option<(u8, u8)> {
        match &self.store {
            TileStore::Ranged { .. } => None,
            TileStore::PmTiles(archive) => Some(archive.zoom_range()),
        }
    }

    /// Raw (decompressed) tile bytes; `Ok(None)` when the archive has no such
    /// tile or the index is out of range for its zoom.
    pub async fn fetch(&self, index: TileIndex) -> Result<Option<Bytes>, FetchError> {
        if !index.is_valid() {
            debug!("Ignoring out-of-range tile {index}");
            return Ok(None);
        }

        let stored = match &self.store {
            TileStore::Ranged { source, directory } => {
                fetch_range(source.as_ref(), directory.as_ref(), index).await?
            }
            TileStore::PmTiles(archive) => archive.read_tile(index).await?,
        };
        let Some(bytes) = stored else {
            trace!("No directory entry for tile {index}");
            return Ok(None);
        };

        decompress_tile(bytes)
            .map(Some)
            .map_err(|e| FetchError::Decompress {
                tile: index.to_string(),
                reason: e.to_string(),
            })
    }
}

async fn fetch_range(
    source: &dyn ByteSource,
    directory: &dyn TileDirectory,
    index: TileIndex,
) -> Result<Option<Bytes>, FetchError> {
    let range = directory
        .resolve_tile_byte_range(index)
        .await
        .map_err(|e| FetchError::Directory(e.message))?;
    let Some(range) = range else {
        return Ok(None);
    };

    let unavailable = |reason: String| FetchError::RangeUnavailable {
        archive: source.identifier().to_string(),
        offset: range.offset,
        length: range.length,
        reason,
    };

    match source.size() {
        Some(total) if !range.fits_within(total) => {
            return Err(unavailable(format!("range exceeds archive size {total}")));
        }
        None if range.end().is_none() => {
            return Err(unavailable("range end overflows".to_string()));
        }
        _ => {}
    }

    let bytes = source
        .get_bytes(range.offset, range.length)
        .await
        .map_err(|e| {
            warn!("Tile fetch error for {index}: {e}");
            unavailable(e.message)
        })?;
    if bytes.len() as u64 != range.length {
        return Err(unavailable(format!("short read: got {} bytes", bytes.len())));
    }
    Ok(Some(bytes))
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Arc;

    use flate2::Compression;
    use flate2::write::GzEncoder;
    use formats::GeometryType;
    use formats::mvt::{self, DecodeOptions, LayerBuilder, encode_tile};
    use foundation::{ByteRange, TileIndex};
    use serde_json::Map;

    use super::{ArchiveTileFetcher, MemoryByteSource, MemoryDirectory, is_gzipped};
    use crate::error::FetchError;

    fn tile_bytes() -> Vec<u8> {
        let mut layer = LayerBuilder::new("places");
        layer.add_feature(Some(1), GeometryType::Point, &[vec![[10, 20]]], &Map::new());
        encode_tile(&[layer])
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn fetcher(archive: Vec<u8>, dir: MemoryDirectory) -> ArchiveTileFetcher {
        ArchiveTileFetcher::new(
            Arc::new(MemoryByteSource::new("mem", archive)),
            Arc::new(dir),
        )
    }

    #[tokio::test]
    async fn fetches_plain_and_gzipped_tiles() {
        let plain = tile_bytes();
        let zipped = gzip(&plain);
        assert!(is_gzipped(&zipped));

        let mut archive = vec![0u8; 7];
        archive.extend_from_slice(&plain);
        let zipped_at = archive.len() as u64;
        archive.extend_from_slice(&zipped);

        let mut dir = MemoryDirectory::new();
        dir.insert(TileIndex::new(0, 0, 0), ByteRange::new(7, plain.len() as u64));
        dir.insert(TileIndex::new(1, 0, 1), ByteRange::new(zipped_at, zipped.len() as u64));
        let f = fetcher(archive, dir);

        let a = f.fetch(TileIndex::new(0, 0, 0)).await.unwrap().unwrap();
        let b = f.fetch(TileIndex::new(1, 0, 1)).await.unwrap().unwrap();
        assert_eq!(&a[..], &plain[..]);
        assert_eq!(&b[..], &plain[..]);

        let fc = mvt::decode_with(&b, &DecodeOptions::default()).unwrap();
        assert_eq!(fc.features[0].coordinates, vec![vec![[10.0, 20.0]]]);
    }

    #[tokio::test]
    async fn sparse_and_invalid_tiles_are_none() {
        let f = fetcher(tile_bytes(), MemoryDirectory::new());
        assert!(f.fetch(TileIndex::new(0, 0, 3)).await.unwrap().is_none());
        assert!(f.fetch(TileIndex::new(5, 0, 1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn range_past_archive_end_is_unavailable() {
        let mut dir = MemoryDirectory::new();
        dir.insert(TileIndex::new(0, 0, 0), ByteRange::new(4, 1000));
        let f = fetcher(tile_bytes(), dir);
        let err = f.fetch(TileIndex::new(0, 0, 0)).await.unwrap_err();
        assert!(matches!(err, FetchError::RangeUnavailable { offset: 4, length: 1000, .. }));
    }

    #[tokio::test]
    async fn corrupt_gzip_is_decompress_error() {
        let archive = vec![0x1F, 0x8B, 0x00, 0x01, 0x02];
        let mut dir = MemoryDirectory::new();
        dir.insert(TileIndex::new(0, 0, 0), ByteRange::new(0, 5));
        let err = fetcher(archive, dir).fetch(TileIndex::new(0, 0, 0)).await.unwrap_err();
        assert!(matches!(err, FetchError::Decompress { .. }));
    }

    #[test]
    fn directory_from_json() {
        let dir = MemoryDirectory::from_json_str(r#"{"0/0/0": [0, 10], "1/1/0": [10, 5]}"#).unwrap();
        assert_eq!(dir.len(), 2);
        assert!(MemoryDirectory::from_json_str(r#"{"1/2/0": [0, 1]}"#).is_err());
        assert!(MemoryDirectory::from_json_str(r#"{"0/0/0": [0]}"#).is_err());
    }
}
