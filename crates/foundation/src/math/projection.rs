use std::f64::consts::PI;
use std::fmt::Debug;

/// Latitude where square Web Mercator ends.
pub const MAX_MERCATOR_LAT: f64 = 85.051_128_779_806_59;

/// Maps between geographic `[lon, lat]` degrees and a projection's world space.
///
/// World space is normalized: the whole projected extent covers `[0, 1]` on
/// both axes, with y growing southwards like tile rows do.
pub trait Projection: Debug + Send + Sync {
    fn project(&self, lon_lat: [f64; 2]) -> [f64; 2];

    fn unproject(&self, world: [f64; 2]) -> [f64; 2];
}

/// Spherical Web Mercator (EPSG:3857), normalized to the unit square.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct WebMercator;

impl Projection for WebMercator {
    fn project(&self, [lon, lat]: [f64; 2]) -> [f64; 2] {
        let lat = lat.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT).to_radians();
        let x = (lon + 180.0) / 360.0;
        let y = (1.0 - lat.tan().asinh() / PI) / 2.0;
        [x, y]
    }

    fn unproject(&self, [x, y]: [f64; 2]) -> [f64; 2] {
        let lon = x * 360.0 - 180.0;
        let n = PI - 2.0 * PI * y;
        let lat = n.sinh().atan().to_degrees();
        [lon, lat]
    }
}

#[cfg(test)]
mod tests {
    use super::{MAX_MERCATOR_LAT, Projection, WebMercator};

    fn assert_close(a: f64, b: f64, eps: f64) {
        let diff = (a - b).abs();
        assert!(diff <= eps, "expected {a} ~= {b} (diff {diff})");
    }

    #[test]
    fn world_corners() {
        let [lon, lat] = WebMercator.unproject([0.0, 0.0]);
        assert_eq!(lon, -180.0);
        assert_close(lat, MAX_MERCATOR_LAT, 1e-9);

        let [lon, lat] = WebMercator.unproject([0.5, 0.5]);
        assert_close(lon, 0.0, 1e-12);
        assert_close(lat, 0.0, 1e-12);
    }

    #[test]
    fn project_unproject_round_trip() {
        let p = [13.405, 52.52];
        let world = WebMercator.project(p);
        let back = WebMercator.unproject(world);
        assert_close(back[0], p[0], 1e-9);
        assert_close(back[1], p[1], 1e-9);
    }
}
