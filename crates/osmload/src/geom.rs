//! Well-known binary for line geometries.
//!
//! LineString layout (little-endian, `NDR`):
//!
//!   u8       byte order = 1
//!   u32      geometry type = 2
//!   u32      point count
//!   f64[2]   x, y per point

use anyhow::{ensure, Result};
use osmcache::Way;

const WKB_NDR: u8 = 1;
const WKB_LINESTRING: u32 = 2;

/// A way whose coordinates have been resolved, projected and serialized.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledWay {
    pub way: Way,
    pub projected: Vec<[f64; 2]>,
    pub wkb: Vec<u8>,
}

/// Per-worker geometry builder with a reusable scratch buffer.
///
/// Not shared between threads; each assembly worker owns one.
pub struct GeometryEngine {
    worker: usize,
    scratch: Vec<u8>,
    built: u64,
}

impl GeometryEngine {
    pub fn acquire(worker: usize) -> Self {
        log::trace!("geometry engine {worker} acquired");
        Self {
            worker,
            scratch: Vec::with_capacity(4096),
            built: 0,
        }
    }

    /// Serializes `points` as a LineString.
    ///
    /// Fails for fewer than two points or non-finite coordinates.
    pub fn line_string(&mut self, points: &[[f64; 2]]) -> Result<Vec<u8>> {
        ensure!(
            points.len() >= 2,
            "line string needs at least 2 points, got {}",
            points.len()
        );
        ensure!(
            points.iter().flatten().all(|v| v.is_finite()),
            "line string has a non-finite coordinate"
        );

        let buf = &mut self.scratch;
        buf.clear();
        buf.push(WKB_NDR);
        buf.extend_from_slice(&WKB_LINESTRING.to_le_bytes());
        buf.extend_from_slice(&(points.len() as u32).to_le_bytes());
        for [x, y] in points {
            buf.extend_from_slice(&x.to_le_bytes());
            buf.extend_from_slice(&y.to_le_bytes());
        }
        self.built += 1;
        Ok(buf.clone())
    }
}

impl Drop for GeometryEngine {
    fn drop(&mut self) {
        log::debug!(
            "geometry engine {} released after {} geometries",
            self.worker,
            self.built
        );
    }
}
