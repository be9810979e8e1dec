use std::fmt::Debug;

use foundation::QueryBounds;
use foundation::math::{Projection, WebMercator};
use serde::{Deserialize, Serialize};

/// Pixel size of one tile at integer zoom levels.
pub const TILE_SIZE: f64 = 512.0;

/// The visible map area, as seen by the scheduler.
pub trait Viewport: Debug + Send + Sync {
    fn width(&self) -> f64;

    fn height(&self) -> f64;

    /// Screen pixel (origin top-left) to source `[lon, lat]`.
    fn unproject(&self, screen: [f64; 2]) -> [f64; 2];

    fn zoom(&self) -> f64;

    /// Globe views cannot consume columnar tile output.
    fn is_globe(&self) -> bool {
        false
    }
}

/// Axis-aligned box around the four unprojected screen corners.
pub fn visible_bounds(viewport: &dyn Viewport) -> QueryBounds {
    let (w, h) = (viewport.width(), viewport.height());
    let [x, y] = viewport.unproject([0.0, 0.0]);
    let mut bounds = QueryBounds::new(x, y, x, y);
    for corner in [[w, 0.0], [0.0, h], [w, h]] {
        bounds.extend(viewport.unproject(corner));
    }
    bounds
}

/// Flat Web Mercator map view centered on `center` (`[lon, lat]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebMercatorViewport {
    pub center: [f64; 2],
    pub zoom: f64,
    pub width: f64,
    pub height: f64,
    #[serde(default)]
    pub globe: bool,
}

impl WebMercatorViewport {
    pub fn new(center: [f64; 2], zoom: f64, width: f64, height: f64) -> Self {
        Self {
            center,
            zoom,
            width,
            height,
            globe: false,
        }
    }

    pub fn as_globe(mut self) -> Self {
        self.globe = true;
        self
    }

    fn world_size(&self) -> f64 {
        TILE_SIZE * self.zoom.exp2()
    }

    /// Normalized world position of the view center.
    pub fn center_world(&self) -> [f64; 2] {
        WebMercator.project(self.center)
    }
}

impl Viewport for WebMercatorViewport {
    fn width(&self) -> f64 {
        self.width
    }

    fn height(&self) -> f64 {
        self.height
    }

    fn unproject(&self, [sx, sy]: [f64; 2]) -> [f64; 2] {
        let size = self.world_size();
        let [cx, cy] = self.center_world();
        let x = cx + (sx - self.width / 2.0) / size;
        let y = (cy + (sy - self.height / 2.0) / size).clamp(0.0, 1.0);
        WebMercator.unproject([x.clamp(0.0, 1.0), y])
    }

    fn zoom(&self) -> f64 {
        self.zoom
    }

    fn is_globe(&self) -> bool {
        self.globe
    }
}

#[cfg(test)]
mod tests {
    use foundation::math::MAX_MERCATOR_LAT;

    use super::{Viewport, WebMercatorViewport, visible_bounds};

    #[test]
    fn whole_world_at_zoom_zero() {
        let v = WebMercatorViewport::new([0.0, 0.0], 0.0, 512.0, 512.0);
        let b = visible_bounds(&v);
        assert_eq!(b.min_x, -180.0);
        assert_eq!(b.max_x, 180.0);
        assert!((b.max_y - MAX_MERCATOR_LAT).abs() < 1e-9);
        assert!((b.min_y + MAX_MERCATOR_LAT).abs() < 1e-9);
    }

    #[test]
    fn center_pixel_is_view_center() {
        let v = WebMercatorViewport::new([13.4, 52.5], 10.0, 800.0, 600.0);
        let [lon, lat] = v.unproject([400.0, 300.0]);
        assert!((lon - 13.4).abs() < 1e-9);
        assert!((lat - 52.5).abs() < 1e-9);
        let b = visible_bounds(&v);
        assert!(b.contains_point([13.4, 52.5]));
        assert!(b.width() < 1.0);
    }
}
