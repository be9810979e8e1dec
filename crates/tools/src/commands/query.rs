use anyhow::{Result, bail};
use clap::Args;
use foundation::QueryBounds;
use streaming::PipelineConfig;

use super::{SourceArgs, parse_bbox, print_json};

/// Stream the features of a GeoJSON or FlatGeobuf source intersecting a bounding box
#[derive(Args, Debug)]
pub struct QueryArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// `min_lon,min_lat,max_lon,max_lat`
    #[arg(long, value_parser = parse_bbox, allow_hyphen_values = true)]
    pub bbox: QueryBounds,

    /// Features per partial batch (defaults to the configured batch size)
    #[arg(long)]
    pub batch: Option<usize>,
}

pub async fn run_query(args: QueryArgs, config: PipelineConfig) -> Result<()> {
    if args.source.is_tiled() {
        bail!("query streams --geojson or --fgb sources; use `archive --bbox` for tiles");
    }
    let reader = args
        .source
        .open_spatial()
        .await?
        .with_batch_size(args.batch.unwrap_or(config.batch_size));

    let mut batches = 0;
    let fc = reader
        .open(args.bbox)
        .collect_batched(|partial| {
            batches += 1;
            eprintln!("partial #{batches}: {} features", partial.len());
        })
        .await?;

    eprintln!("{} features after {batches} partial batches", fc.len());
    print_json(&fc.to_geojson_value())
}
