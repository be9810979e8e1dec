use anyhow::{Result, bail};
use clap::Args;
use foundation::{QueryBounds, TileIndex};
use serde_json::{Value, json};
use streaming::{CoordinateTransformer, Pipeline, PipelineConfig};

use super::{SourceArgs, parse_bbox, parse_tile, print_json};

/// Fetch and decode tiles from a packed archive or PMTiles file
#[derive(Args, Debug)]
pub struct ArchiveArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Tiles to fetch (repeatable)
    #[arg(long = "tile", value_parser = parse_tile)]
    pub tiles: Vec<TileIndex>,

    /// Load every tile at min_zoom covering `min_lon,min_lat,max_lon,max_lat`
    #[arg(long, value_parser = parse_bbox, allow_hyphen_values = true, conflicts_with = "tiles")]
    pub bbox: Option<QueryBounds>,

    /// Keep tile-local coordinates instead of lon/lat
    #[arg(long)]
    pub local: bool,
}

pub async fn run_archive(args: ArchiveArgs, mut config: PipelineConfig) -> Result<()> {
    if !args.source.is_tiled() {
        bail!("--archive or --pmtiles is required");
    }
    let fetcher = args.source.open_tiles(&mut config).await?;
    let pipeline = Pipeline::with_worker_runtime(fetcher, config)?;

    if let Some(bounds) = args.bbox {
        let fc = pipeline.request(bounds).await?;
        eprintln!("{} features in bounds", fc.len());
        return print_json(&fc.to_geojson_value());
    }
    if args.tiles.is_empty() {
        bail!("pass --tile z/x/y or --bbox");
    }

    let transformer = CoordinateTransformer::default();
    let mut features: Vec<Value> = Vec::new();
    for index in args.tiles {
        let Some(fc) = pipeline.request_tile(index).await? else {
            eprintln!("{index}: no tile");
            continue;
        };
        eprintln!("{index}: {} features", fc.len());
        if args.local {
            features.extend(fc.iter().map(|f| f.to_geojson_value()));
        } else {
            features.extend(transformer.resolve_tile(fc, index).iter().map(|g| g.to_geojson_value()));
        }
    }
    print_json(&json!({"type": "FeatureCollection", "features": features}))
}
