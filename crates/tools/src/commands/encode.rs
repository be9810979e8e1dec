use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Args;
use flate2::Compression;
use flate2::write::GzEncoder;
use formats::mvt::{DEFAULT_EXTENT, LayerBuilder, encode_tile};
use formats::{DecodedFeature, FeatureId};
use foundation::TileIndex;
use foundation::math::{Projection, WebMercator};
use serde_json::Value;

use super::parse_tile;

/// Encode a GeoJSON FeatureCollection into one vector tile
#[derive(Args, Debug)]
pub struct EncodeArgs {
    /// GeoJSON FeatureCollection in lon/lat
    pub input: PathBuf,

    /// Output tile file
    pub output: PathBuf,

    /// Tile the features are placed in
    #[arg(long, value_parser = parse_tile)]
    pub tile: TileIndex,

    #[arg(long, default_value = "features")]
    pub layer: String,

    #[arg(long, default_value_t = DEFAULT_EXTENT)]
    pub extent: u32,

    /// Gzip the encoded tile
    #[arg(long)]
    pub gzip: bool,
}

pub fn run_encode(args: EncodeArgs) -> Result<()> {
    if args.extent == 0 {
        bail!("--extent must be positive");
    }
    let text = std::fs::read_to_string(&args.input)
        .with_context(|| format!("read {}", args.input.display()))?;
    let value: Value = serde_json::from_str(&text).context("parse geojson")?;
    let Some(features) = value.get("features").and_then(Value::as_array) else {
        bail!("{} is not a FeatureCollection", args.input.display());
    };

    let mut layer = LayerBuilder::new(args.layer.clone()).with_extent(args.extent);
    let mut skipped = 0;
    for raw in features {
        let Some(feature) = DecodedFeature::from_geojson_value(raw, &args.layer)? else {
            skipped += 1;
            continue;
        };
        let id = match feature.id {
            Some(FeatureId::Number(n)) => Some(n),
            _ => None,
        };
        let parts = to_tile_local(&feature, args.tile, args.extent);
        layer.add_feature(id, feature.geometry_type, &parts, &feature.properties);
    }

    let mut bytes = encode_tile(&[layer]);
    if args.gzip {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&bytes)?;
        bytes = enc.finish()?;
    }
    std::fs::write(&args.output, &bytes).with_context(|| format!("write {}", args.output.display()))?;

    eprintln!(
        "wrote {} ({} features, {} skipped, {} bytes)",
        args.output.display(),
        features.len() - skipped,
        skipped,
        bytes.len()
    );
    Ok(())
}

/// Lon/lat to integer tile-local coordinates; may fall outside `[0, extent]`.
fn to_tile_local(feature: &DecodedFeature, tile: TileIndex, extent: u32) -> Vec<Vec<[i32; 2]>> {
    let n = TileIndex::tiles_per_side(tile.z) as f64;
    let extent = extent as f64;
    feature
        .coordinates
        .iter()
        .map(|part| {
            part.iter()
                .map(|&lon_lat| {
                    let [wx, wy] = WebMercator.project(lon_lat);
                    [
                        ((wx * n - tile.x as f64) * extent).round() as i32,
                        ((wy * n - tile.y as f64) * extent).round() as i32,
                    ]
                })
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use formats::{DecodedFeature, GeometryType};
    use foundation::TileIndex;
    use serde_json::Map;

    use super::to_tile_local;

    #[test]
    fn corners_map_to_tile_edges() {
        let feature = DecodedFeature {
            id: None,
            layer_name: "l".into(),
            geometry_type: GeometryType::Point,
            coordinates: vec![vec![[-180.0, 0.0], [0.0, 0.0]]],
            properties: Map::new(),
            extent: None,
        };
        let local = to_tile_local(&feature, TileIndex::new(0, 1, 1), 4096);
        assert_eq!(local, vec![vec![[0, 0], [4096, 0]]]);
    }
}
