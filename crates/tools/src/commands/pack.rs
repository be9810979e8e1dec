use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use foundation::TileIndex;
use serde_json::{Map, Value, json};

/// Concatenate tile files into an archive plus a JSON directory
#[derive(Args, Debug)]
pub struct PackArgs {
    /// Archive to write
    pub archive: PathBuf,

    /// Directory JSON to write
    pub directory: PathBuf,

    /// Tiles as `z/x/y=path`
    #[arg(required = true, value_parser = parse_entry)]
    pub tiles: Vec<(TileIndex, PathBuf)>,
}

fn parse_entry(s: &str) -> Result<(TileIndex, PathBuf), String> {
    let (key, path) = s.split_once('=').ok_or_else(|| format!("expected z/x/y=path, got {s:?}"))?;
    let index = super::parse_tile(key)?;
    Ok((index, PathBuf::from(path)))
}

pub fn run_pack(args: PackArgs) -> Result<()> {
    let mut archive = Vec::new();
    let mut directory = Map::new();
    for (index, path) in &args.tiles {
        let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
        directory.insert(index.to_string(), json!([archive.len(), bytes.len()]));
        archive.extend_from_slice(&bytes);
    }

    std::fs::write(&args.archive, &archive).with_context(|| format!("write {}", args.archive.display()))?;
    let dir_json = serde_json::to_string_pretty(&Value::Object(directory))?;
    std::fs::write(&args.directory, dir_json).with_context(|| format!("write {}", args.directory.display()))?;

    eprintln!(
        "wrote {} ({} tiles, {} bytes) and {}",
        args.archive.display(),
        args.tiles.len(),
        archive.len(),
        args.directory.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::parse_entry;

    #[test]
    fn entries_need_a_path() {
        let (index, path) = parse_entry("3/1/2=tiles/a.mvt").unwrap();
        assert_eq!(index.to_string(), "3/1/2");
        assert_eq!(path.to_str(), Some("tiles/a.mvt"));
        assert!(parse_entry("3/1/2").is_err());
    }
}
