use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use formats::mvt;
use foundation::TileIndex;
use serde_json::{Value, json};
use streaming::{CoordinateTransformer, PipelineConfig, decompress_tile};

use super::{parse_tile, print_json};

/// Decode one tile buffer and print it as GeoJSON
#[derive(Args, Debug)]
pub struct DecodeArgs {
    /// Tile file, plain or gzipped
    pub input: PathBuf,

    /// Place the tile at z/x/y and print lon/lat coordinates
    #[arg(long, value_parser = parse_tile)]
    pub tile: Option<TileIndex>,

    /// Print per-layer feature counts only
    #[arg(long)]
    pub summary: bool,
}

pub fn run_decode(args: DecodeArgs, config: &PipelineConfig) -> Result<()> {
    let raw = std::fs::read(&args.input).with_context(|| format!("read {}", args.input.display()))?;
    let buf = decompress_tile(raw.into()).context("gunzip")?;
    let fc = mvt::decode_with(&buf, &config.decode_options())?;

    if args.summary {
        let mut layers: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
        for f in fc.iter() {
            let entry = layers.entry(f.layer_name.as_str()).or_default();
            entry.0 += 1;
            entry.1 += f.point_count();
        }
        for (name, (features, points)) in &layers {
            println!("{name}: {features} features, {points} vertices");
        }
        eprintln!("decoded {} ({} bytes)", args.input.display(), buf.len());
        return Ok(());
    }

    let value = match args.tile {
        Some(index) => {
            let features: Vec<Value> = CoordinateTransformer::default()
                .resolve_tile(fc, index)
                .iter()
                .map(|g| g.to_geojson_value())
                .collect();
            json!({"type": "FeatureCollection", "features": features})
        }
        None => fc.to_geojson_value(),
    };
    print_json(&value)
}
