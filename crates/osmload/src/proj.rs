use anyhow::{bail, Result};
use osmcache::Coord;

/// WGS-84 semi-major axis in meters; the sphere radius of web mercator.
pub const EARTH_RADIUS_M: f64 = 6_378_137.0;

/// Latitude at which web mercator becomes square.
pub const MAX_MERCATOR_LAT: f64 = 85.051_128_78;

/// Target spatial reference of the exported geometries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projection {
    /// EPSG:3857
    WebMercator,
    /// EPSG:4326, coordinates pass through unchanged.
    Wgs84,
}

impl Projection {
    pub fn from_srid(srid: u32) -> Result<Self> {
        match srid {
            3857 => Ok(Projection::WebMercator),
            4326 => Ok(Projection::Wgs84),
            other => bail!("unsupported srid {other}, expected 3857 or 4326"),
        }
    }

    /// Projects a longitude/latitude pair in degrees to `[x, y]`.
    #[inline]
    pub fn project(self, lon: f64, lat: f64) -> [f64; 2] {
        match self {
            Projection::Wgs84 => [lon, lat],
            Projection::WebMercator => {
                let lat = lat.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT);
                let x = EARTH_RADIUS_M * lon.to_radians();
                let y = EARTH_RADIUS_M
                    * (std::f64::consts::FRAC_PI_4 + lat.to_radians() / 2.0)
                        .tan()
                        .ln();
                [x, y]
            }
        }
    }

    pub fn project_all(self, nodes: &[Coord]) -> Vec<[f64; 2]> {
        nodes.iter().map(|c| self.project(c.lon, c.lat)).collect()
    }
}
