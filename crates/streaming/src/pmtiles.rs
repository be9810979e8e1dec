//! PMTiles v3 archives.
//!
//! Header and directory handling come from `pmtiles2`; tiles are read through
//! it on the blocking pool and handed back still compressed.

use std::fs::File;
use std::io::{BufReader, Cursor};
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use foundation::{QueryBounds, TileIndex};
use parking_lot::Mutex;
use pmtiles2::PMTiles;
use tracing::debug;

use crate::archive::ReadSeek;
use crate::error::{FetchError, SourceError};

type Reader = PMTiles<Box<dyn ReadSeek>>;

pub struct PmTilesArchive {
    identifier: String,
    reader: Arc<Mutex<Reader>>,
    min_zoom: u8,
    max_zoom: u8,
    bounds: QueryBounds,
}

impl PmTilesArchive {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref().to_path_buf();
        let identifier = path.display().to_string();
        let id = identifier.clone();
        tokio::task::spawn_blocking(move || {
            let file = File::open(&path).map_err(|e| SourceError::new(format!("{id}: {e}")))?;
            Self::from_reader(id, Box::new(BufReader::new(file)))
        })
        .await
        .map_err(|e| SourceError::new(format!("{identifier}: {e}")))?
    }

    pub fn from_bytes(identifier: impl Into<String>, data: impl Into<Bytes>) -> Result<Self, SourceError> {
        Self::from_reader(identifier.into(), Box::new(Cursor::new(data.into())))
    }

    fn from_reader(identifier: String, input: Box<dyn ReadSeek>) -> Result<Self, SourceError> {
        let reader = Reader::from_reader(input)
            .map_err(|e| SourceError::new(format!("{identifier}: not a PMTiles archive: {e}")))?;
        let bounds = QueryBounds::new(
            reader.min_longitude,
            reader.min_latitude,
            reader.max_longitude,
            reader.max_latitude,
        );
        let (min_zoom, max_zoom) = (reader.min_zoom, reader.max_zoom);
        debug!("Opened {identifier}: z{min_zoom}-z{max_zoom}");
        Ok(Self {
            identifier,
            reader: Arc::new(Mutex::new(reader)),
            min_zoom,
            max_zoom,
            bounds,
        })
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// `(min_zoom, max_zoom)` from the archive header.
    pub fn zoom_range(&self) -> (u8, u8) {
        (self.min_zoom, self.max_zoom)
    }

    /// Geographic extent from the archive header.
    pub fn bounds(&self) -> QueryBounds {
        self.bounds
    }

    /// Tile bytes as stored, `None` when the archive has no entry.
    pub async fn read_tile(&self, index: TileIndex) -> Result<Option<Bytes>, FetchError> {
        let reader = Arc::clone(&self.reader);
        let (x, y, z) = (u64::from(index.x), u64::from(index.y), index.z);
        let read = tokio::task::spawn_blocking(move || reader.lock().get_tile(x, y, z))
            .await
            .map_err(|e| FetchError::Directory(format!("{}: {e}", self.identifier)))?;
        read.map(|tile| tile.map(Bytes::from))
            .map_err(|e| FetchError::Directory(format!("{}: tile {index}: {e}", self.identifier)))
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Write};

    use flate2::Compression;
    use flate2::write::GzEncoder;
    use formats::GeometryType;
    use formats::mvt::{LayerBuilder, encode_tile};
    use foundation::TileIndex;
    use pmtiles2::util::tile_id;
    use pmtiles2::{Compression as PmtilesCompression, PMTiles, TileType};
    use serde_json::Map;

    use super::PmTilesArchive;
    use crate::archive::ArchiveTileFetcher;

    fn archive_bytes(tile: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(tile).unwrap();

        let mut pm = PMTiles::new(TileType::Mvt, PmtilesCompression::GZip);
        pm.min_zoom = 0;
        pm.max_zoom = 1;
        pm.min_longitude = -180.0;
        pm.min_latitude = -85.0;
        pm.max_longitude = 180.0;
        pm.max_latitude = 85.0;
        pm.add_tile(tile_id(1, 1, 0), enc.finish().unwrap()).unwrap();
        let mut out = Cursor::new(Vec::new());
        pm.to_writer(&mut out).unwrap();
        out.into_inner()
    }

    #[tokio::test]
    async fn reads_header_and_tiles() {
        let mut layer = LayerBuilder::new("places");
        layer.add_feature(Some(9), GeometryType::Point, &[vec![[10, 20]]], &Map::new());
        let plain = encode_tile(&[layer]);

        let archive = PmTilesArchive::from_bytes("mem.pmtiles", archive_bytes(&plain)).unwrap();
        assert_eq!(archive.zoom_range(), (0, 1));
        assert_eq!(archive.bounds().max_x, 180.0);

        let fetcher = ArchiveTileFetcher::pmtiles(archive);
        assert_eq!(fetcher.zoom_range(), Some((0, 1)));
        let tile = fetcher.fetch(TileIndex::new(1, 0, 1)).await.unwrap().unwrap();
        assert_eq!(&tile[..], &plain[..]);
        assert!(fetcher.fetch(TileIndex::new(0, 0, 0)).await.unwrap().is_none());
    }

    #[test]
    fn garbage_is_not_an_archive() {
        assert!(PmTilesArchive::from_bytes("junk", vec![0u8; 16]).is_err());
    }
}
