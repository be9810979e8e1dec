use std::fmt;

use serde::{Deserialize, Serialize};

use crate::bounds::QueryBounds;
use crate::math::{Projection, WebMercator};

/// Deepest zoom level representable with `u32` rows/columns.
pub const MAX_ZOOM: u8 = 30;

/// Tile coordinate in the XYZ scheme (row 0 is the northernmost row).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileIndex {
    pub x: u32,
    pub y: u32,
    pub z: u8,
}

impl TileIndex {
    pub fn new(x: u32, y: u32, z: u8) -> Self {
        Self { x, y, z }
    }

    /// Returns `None` unless `x, y < 2^z` and `z <= MAX_ZOOM`.
    pub fn checked(x: u32, y: u32, z: u8) -> Option<Self> {
        let index = Self { x, y, z };
        index.is_valid().then_some(index)
    }

    /// Parses the `z/x/y` form produced by `Display`; out-of-range indices
    /// are rejected.
    pub fn parse(key: &str) -> Option<Self> {
        let mut parts = key.trim().split('/');
        let z = parts.next()?.parse().ok()?;
        let x = parts.next()?.parse().ok()?;
        let y = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Self::checked(x, y, z)
    }

    pub fn tiles_per_side(z: u8) -> u32 {
        1u32 << z.min(MAX_ZOOM)
    }

    pub fn is_valid(&self) -> bool {
        if self.z > MAX_ZOOM {
            return false;
        }
        let n = Self::tiles_per_side(self.z);
        self.x < n && self.y < n
    }

    /// Row index in the TMS scheme (the `{-y}` template variable).
    pub fn tms_y(&self) -> u32 {
        Self::tiles_per_side(self.z) - 1 - self.y
    }

    /// Tile footprint in normalized world space (`[0, 1]²`, y southwards).
    pub fn world_bounds(&self) -> QueryBounds {
        let n = Self::tiles_per_side(self.z) as f64;
        QueryBounds::new(
            self.x as f64 / n,
            self.y as f64 / n,
            (self.x + 1) as f64 / n,
            (self.y + 1) as f64 / n,
        )
    }

    /// Geographic footprint as `(west, south, east, north)` bounds in degrees.
    pub fn bounds_wgs84(&self) -> QueryBounds {
        let world = self.world_bounds();
        let [west, north] = WebMercator.unproject([world.min_x, world.min_y]);
        let [east, south] = WebMercator.unproject([world.max_x, world.max_y]);
        QueryBounds::new(west, south, east, north)
    }

    /// Tiles at zoom `z` covering a lon/lat rectangle, row-major; `None`
    /// when that takes more than `max_tiles` tiles.
    pub fn covering(bounds: &QueryBounds, z: u8, max_tiles: u64) -> Option<Vec<TileIndex>> {
        let range = TileRange::covering(bounds, z);
        if range.count() > max_tiles {
            return None;
        }
        Some(range.tiles().collect())
    }
}

/// Inclusive rectangle of tiles at one zoom level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileRange {
    pub z: u8,
    pub x_min: u32,
    pub x_max: u32,
    pub y_min: u32,
    pub y_max: u32,
}

impl TileRange {
    pub fn covering(bounds: &QueryBounds, z: u8) -> Self {
        let z = z.min(MAX_ZOOM);
        Self {
            z,
            x_min: lon_to_tile_x(bounds.min_x, z),
            x_max: lon_to_tile_x(bounds.max_x, z),
            // Rows grow southwards.
            y_min: lat_to_tile_y(bounds.max_y, z),
            y_max: lat_to_tile_y(bounds.min_y, z),
        }
    }

    pub fn count(&self) -> u64 {
        let width = u64::from(self.x_max.saturating_sub(self.x_min)) + 1;
        let height = u64::from(self.y_max.saturating_sub(self.y_min)) + 1;
        width.checked_mul(height).unwrap_or(u64::MAX)
    }

    /// Largest square window of at most `max_tiles` tiles inside this range,
    /// centered as close to `center` (fractional tile units) as the range allows.
    pub fn around(&self, center: [f64; 2], max_tiles: u64) -> Self {
        let side = ((max_tiles as f64).sqrt().floor() as u32).max(1);
        let (x_min, x_max) = window(self.x_min, self.x_max, center[0], side);
        let (y_min, y_max) = window(self.y_min, self.y_max, center[1], side);
        Self {
            z: self.z,
            x_min,
            x_max,
            y_min,
            y_max,
        }
    }

    /// Row-major.
    pub fn tiles(self) -> impl Iterator<Item = TileIndex> {
        let Self {
            z,
            x_min,
            x_max,
            y_min,
            y_max,
        } = self;
        (y_min..=y_max).flat_map(move |y| (x_min..=x_max).map(move |x| TileIndex::new(x, y, z)))
    }
}

fn window(min: u32, max: u32, center: f64, side: u32) -> (u32, u32) {
    if max - min < side {
        return (min, max);
    }
    let start = (center - side as f64 / 2.0).round().max(min as f64) as u32;
    let start = start.min(max - side + 1);
    (start, start + side - 1)
}

impl fmt::Display for TileIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

fn lon_to_tile_x(lon: f64, z: u8) -> u32 {
    let n = TileIndex::tiles_per_side(z) as i64;
    let x = ((lon + 180.0) / 360.0 * n as f64).floor() as i64;
    x.clamp(0, n - 1) as u32
}

fn lat_to_tile_y(lat: f64, z: u8) -> u32 {
    let n = TileIndex::tiles_per_side(z) as i64;
    let [_, y] = WebMercator.project([0.0, lat]);
    let y = (y * n as f64).floor() as i64;
    y.clamp(0, n - 1) as u32
}

/// Location of one tile's bytes inside an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

impl ByteRange {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Exclusive end offset, `None` on overflow.
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.length)
    }

    pub fn fits_within(&self, total_size: u64) -> bool {
        self.end().is_some_and(|end| end <= total_size)
    }
}

#[cfg(test)]
mod tests {
    use super::{ByteRange, TileIndex, TileRange};
    use crate::bounds::QueryBounds;

    #[test]
    fn validity_follows_zoom() {
        assert!(TileIndex::checked(1, 1, 1).is_some());
        assert!(TileIndex::checked(2, 0, 1).is_none());
        assert!(TileIndex::checked(0, 0, 31).is_none());
        assert_eq!(TileIndex::new(0, 0, 2).tms_y(), 3);
    }

    #[test]
    fn parse_matches_display() {
        let t = TileIndex::new(5, 3, 4);
        assert_eq!(TileIndex::parse(&t.to_string()), Some(t));
        assert_eq!(TileIndex::parse("1/2/0"), None);
        assert_eq!(TileIndex::parse("1/0/0/0"), None);
        assert_eq!(TileIndex::parse("a/0/0"), None);
    }

    #[test]
    fn zoom_zero_covers_the_world() {
        let b = TileIndex::new(0, 0, 0).bounds_wgs84();
        assert_eq!(b.min_x, -180.0);
        assert_eq!(b.max_x, 180.0);
        assert!(b.min_y < 0.0 && b.max_y > 85.0);
    }

    #[test]
    fn covering_spans_quadrants() {
        let all = TileIndex::covering(&QueryBounds::new(-10.0, -10.0, 10.0, 10.0), 1, 16).unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0], TileIndex::new(0, 0, 1));
        assert_eq!(all[3], TileIndex::new(1, 1, 1));

        let ne = TileIndex::covering(&QueryBounds::new(10.0, 10.0, 20.0, 20.0), 1, 16).unwrap();
        assert_eq!(ne, vec![TileIndex::new(1, 0, 1)]);
    }

    #[test]
    fn whole_world_at_deep_zoom_is_refused_without_allocating() {
        let world = QueryBounds::new(-180.0, -90.0, 180.0, 90.0);
        assert_eq!(TileRange::covering(&world, 16).count(), 1 << 32);
        assert_eq!(TileRange::covering(&world, 30).count(), 1 << 60);
        assert!(TileIndex::covering(&world, 16, 256).is_none());
        assert_eq!(TileIndex::covering(&world, 2, 256).map(|t| t.len()), Some(16));
    }

    #[test]
    fn window_stays_inside_the_range() {
        let world = TileRange::covering(&QueryBounds::new(-180.0, -90.0, 180.0, 90.0), 4);
        let middle = world.around([8.0, 8.0], 16);
        assert_eq!((middle.x_min, middle.x_max, middle.y_min, middle.y_max), (6, 9, 6, 9));
        assert_eq!(middle.count(), 16);

        let corner = world.around([0.2, 15.9], 9);
        assert_eq!((corner.x_min, corner.x_max, corner.y_min, corner.y_max), (0, 2, 13, 15));

        let small = TileRange::covering(&QueryBounds::new(-10.0, -10.0, 10.0, 10.0), 1);
        assert_eq!(small.around([1.0, 1.0], 100), small);
    }

    #[test]
    fn byte_range_bounds() {
        assert!(ByteRange::new(10, 5).fits_within(15));
        assert!(!ByteRange::new(10, 6).fits_within(15));
        assert!(!ByteRange::new(u64::MAX, 2).fits_within(u64::MAX));
    }
}
