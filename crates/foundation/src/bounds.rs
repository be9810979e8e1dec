use serde::{Deserialize, Serialize};

/// Axis-aligned query rectangle in whatever coordinate space the caller uses
/// (lon/lat for spatial sources, normalized world space for tile boxes).
///
/// Construction always normalizes the corners, so `min_x <= max_x` and
/// `min_y <= max_y` hold for every value of this type.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryBounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl QueryBounds {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self {
            min_x: x1.min(x2),
            min_y: y1.min(y2),
            max_x: x1.max(x2),
            max_y: y1.max(y2),
        }
    }

    /// Smallest rectangle containing every point, or `None` for an empty input.
    pub fn from_points<I>(points: I) -> Option<Self>
    where
        I: IntoIterator<Item = [f64; 2]>,
    {
        let mut iter = points.into_iter();
        let [x, y] = iter.next()?;
        let mut out = Self::new(x, y, x, y);
        for p in iter {
            out.extend(p);
        }
        Some(out)
    }

    pub fn extend(&mut self, [x, y]: [f64; 2]) {
        self.min_x = self.min_x.min(x);
        self.min_y = self.min_y.min(y);
        self.max_x = self.max_x.max(x);
        self.max_y = self.max_y.max(y);
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn center(&self) -> [f64; 2] {
        [
            (self.min_x + self.max_x) / 2.0,
            (self.min_y + self.max_y) / 2.0,
        ]
    }

    /// Edges count as intersecting.
    pub fn intersects(&self, other: &QueryBounds) -> bool {
        self.min_x <= other.max_x
            && other.min_x <= self.max_x
            && self.min_y <= other.max_y
            && other.min_y <= self.max_y
    }

    pub fn contains_point(&self, [x, y]: [f64; 2]) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }
}
