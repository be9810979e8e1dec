use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Args;
use foundation::{QueryBounds, TileIndex};
use serde_json::Value;
use streaming::{
    ArchiveTileFetcher, ByteSource, FgbSpatialSource, FileByteSource, GeoJsonRecordDecoder, HttpByteSource,
    MemoryDirectory, MemorySpatialSource, PipelineConfig, PipelineSource, PmTilesArchive, SpatialStreamReader,
};
use tracing::info;

pub mod archive;
pub mod decode;
pub mod encode;
pub mod pack;
pub mod query;
pub mod simulate;

pub fn parse_tile(s: &str) -> Result<TileIndex, String> {
    TileIndex::parse(s).ok_or_else(|| format!("expected z/x/y within range, got {s:?}"))
}

/// `min_lon,min_lat,max_lon,max_lat`
pub fn parse_bbox(s: &str) -> Result<QueryBounds, String> {
    let v = parse_floats(s, 4)?;
    Ok(QueryBounds::new(v[0], v[1], v[2], v[3]))
}

pub fn parse_floats(s: &str, n: usize) -> Result<Vec<f64>, String> {
    let values = s
        .split(',')
        .map(|p| p.trim().parse::<f64>().map_err(|e| format!("{p:?}: {e}")))
        .collect::<Result<Vec<_>, _>>()?;
    if values.len() != n {
        return Err(format!("expected {n} comma-separated numbers, got {}", values.len()));
    }
    Ok(values)
}

/// Where features come from: a tile archive (a PMTiles file, or any file or
/// URL plus a JSON directory), or a GeoJSON or FlatGeobuf file served as a
/// bbox-queryable stream.
#[derive(Args, Debug, Clone)]
pub struct SourceArgs {
    /// Archive file path or http(s) URL
    #[arg(long, requires = "directory", conflicts_with_all = ["pmtiles", "geojson", "fgb"])]
    pub archive: Option<String>,

    /// Archive directory as JSON (`{"z/x/y": [offset, length]}`)
    #[arg(long)]
    pub directory: Option<PathBuf>,

    /// PMTiles v3 archive; its header sets the zoom range
    #[arg(long, conflicts_with_all = ["geojson", "fgb"])]
    pub pmtiles: Option<PathBuf>,

    /// GeoJSON FeatureCollection to stream by bounding box
    #[arg(long, conflicts_with = "fgb")]
    pub geojson: Option<PathBuf>,

    /// FlatGeobuf file with a spatial index
    #[arg(long)]
    pub fgb: Option<PathBuf>,

    /// Layer name given to streamed features
    #[arg(long, default_value = "features")]
    pub layer_name: String,
}

impl SourceArgs {
    pub fn is_tiled(&self) -> bool {
        self.archive.is_some() || self.pmtiles.is_some()
    }

    pub async fn open(&self, config: &mut PipelineConfig) -> Result<PipelineSource> {
        if self.is_tiled() {
            Ok(self.open_tiles(config).await?.into())
        } else {
            Ok(self.open_spatial().await?.into())
        }
    }

    /// Tile archive; a PMTiles header overrides the configured zoom range.
    pub async fn open_tiles(&self, config: &mut PipelineConfig) -> Result<ArchiveTileFetcher> {
        if let Some(path) = &self.pmtiles {
            let archive = PmTilesArchive::open(path).await?;
            let (min_zoom, max_zoom) = archive.zoom_range();
            info!("{}: zoom range z{min_zoom}-z{max_zoom} from header", archive.identifier());
            config.min_zoom = min_zoom;
            config.max_zoom = max_zoom;
            return Ok(ArchiveTileFetcher::pmtiles(archive));
        }

        let Some(archive) = &self.archive else {
            bail!("pass --pmtiles, or --archive with --directory");
        };
        let Some(dir_path) = &self.directory else {
            bail!("--archive requires --directory");
        };
        let text = tokio::fs::read_to_string(dir_path)
            .await
            .with_context(|| format!("read {}", dir_path.display()))?;
        let directory = MemoryDirectory::from_json_str(&text)?;

        let source: Arc<dyn ByteSource> =
            if archive.starts_with("http://") || archive.starts_with("https://") {
                Arc::new(HttpByteSource::new(archive))
            } else {
                Arc::new(FileByteSource::open(archive).await?)
            };
        tracing::debug!("Opened {} with {} directory entries", source.identifier(), directory.len());
        Ok(ArchiveTileFetcher::new(source, Arc::new(directory)))
    }

    pub async fn open_spatial(&self) -> Result<SpatialStreamReader> {
        let decoder = Arc::new(GeoJsonRecordDecoder::new(self.layer_name.clone()));
        if let Some(path) = &self.fgb {
            return Ok(SpatialStreamReader::new(Arc::new(FgbSpatialSource::open(path)), decoder));
        }

        let Some(path) = &self.geojson else {
            bail!("pass --geojson or --fgb");
        };
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("read {}", path.display()))?;
        let value: Value = serde_json::from_str(&text).context("parse geojson")?;
        let source = MemorySpatialSource::from_geojson(path.display().to_string(), &value)?;
        Ok(SpatialStreamReader::new(Arc::new(source), decoder))
    }
}

pub fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{SourceArgs, parse_bbox, parse_tile};

    #[derive(Parser)]
    struct SourceOnly {
        #[command(flatten)]
        source: SourceArgs,
    }

    #[test]
    fn source_flags_pick_one_kind() {
        let fgb = SourceOnly::try_parse_from(["t", "--fgb", "a.fgb"]).unwrap().source;
        assert!(!fgb.is_tiled());
        let pm = SourceOnly::try_parse_from(["t", "--pmtiles", "a.pmtiles"]).unwrap().source;
        assert!(pm.is_tiled());
        assert!(SourceOnly::try_parse_from(["t", "--pmtiles", "a.pmtiles", "--fgb", "a.fgb"]).is_err());
        assert!(SourceOnly::try_parse_from(["t", "--archive", "a.bin"]).is_err());
    }

    #[test]
    fn parses_cli_values() {
        let b = parse_bbox("10, -5, 0, 5").unwrap();
        assert_eq!((b.min_x, b.max_x, b.min_y, b.max_y), (0.0, 10.0, -5.0, 5.0));
        assert!(parse_bbox("1,2,3").is_err());
        assert_eq!(parse_tile("2/3/1").unwrap().to_string(), "2/3/1");
        assert!(parse_tile("2/4/1").is_err());
    }
}
