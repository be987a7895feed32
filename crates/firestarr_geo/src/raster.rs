//! Single-band float raster with an affine pixel transform.

use crate::proj::{self, Crs};
use crate::{GeoError, Result};
use geo::{Coord, Polygon};
use serde::{Deserialize, Serialize};

/// Affine mapping from pixel (col, row) to world coordinates.
///
/// North-up only: `pixel_height` is stored positive and rows grow southwards
/// from `origin_y` (the top edge).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelTransform {
    pub origin_x: f64,
    pub origin_y: f64,
    pub pixel_width: f64,
    pub pixel_height: f64,
}

impl PixelTransform {
    /// World coordinate of the top-left corner of pixel (col, row).
    pub fn pixel_to_world(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.origin_x + col * self.pixel_width,
            self.origin_y - row * self.pixel_height,
        )
    }

    /// Fractional pixel position of a world coordinate.
    pub fn world_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (x - self.origin_x) / self.pixel_width,
            (self.origin_y - y) / self.pixel_height,
        )
    }
}

/// World-space bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extent {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Extent {
    pub fn union(&self, other: &Extent) -> Extent {
        Extent {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    /// Snap outward to a multiple of `cell` so overlapping rasters share a grid.
    pub fn snapped(&self, cell: f64) -> Extent {
        Extent {
            min_x: (self.min_x / cell).floor() * cell,
            min_y: (self.min_y / cell).floor() * cell,
            max_x: (self.max_x / cell).ceil() * cell,
            max_y: (self.max_y / cell).ceil() * cell,
        }
    }
}

/// A single-band f32 raster.
#[derive(Debug, Clone)]
pub struct Raster {
    pub width: usize,
    pub height: usize,
    pub data: Vec<f32>,
    pub nodata: f32,
    pub transform: PixelTransform,
    pub crs: Crs,
}

impl Raster {
    /// New raster filled with nodata.
    pub fn filled(
        width: usize,
        height: usize,
        nodata: f32,
        transform: PixelTransform,
        crs: Crs,
    ) -> Raster {
        Raster {
            width,
            height,
            data: vec![nodata; width * height],
            nodata,
            transform,
            crs,
        }
    }

    /// New raster covering `extent` at `cell` resolution, snapped to the grid.
    pub fn covering(extent: &Extent, cell: f64, nodata: f32, crs: Crs) -> Raster {
        let snapped = extent.snapped(cell);
        let width = ((snapped.max_x - snapped.min_x) / cell).round().max(1.0) as usize;
        let height = ((snapped.max_y - snapped.min_y) / cell).round().max(1.0) as usize;
        Raster::filled(
            width,
            height,
            nodata,
            PixelTransform {
                origin_x: snapped.min_x,
                origin_y: snapped.max_y,
                pixel_width: cell,
                pixel_height: cell,
            },
            crs,
        )
    }

    pub fn get(&self, col: usize, row: usize) -> f32 {
        self.data[row * self.width + col]
    }

    pub fn set(&mut self, col: usize, row: usize, value: f32) {
        self.data[row * self.width + col] = value;
    }

    pub fn is_nodata(&self, value: f32) -> bool {
        value.is_nan() || value == self.nodata || (self.nodata.is_nan() && value.is_nan())
    }

    pub fn extent(&self) -> Extent {
        let (max_x, min_y) = self
            .transform
            .pixel_to_world(self.width as f64, self.height as f64);
        Extent {
            min_x: self.transform.origin_x,
            min_y,
            max_x,
            max_y: self.transform.origin_y,
        }
    }

    /// Extent reprojected to another CRS by sampling the raster boundary.
    pub fn extent_in(&self, crs: Crs) -> Result<Extent> {
        let e = self.extent();
        let mut min_x = f64::INFINITY;
        let mut min_y = f64::INFINITY;
        let mut max_x = f64::NEG_INFINITY;
        let mut max_y = f64::NEG_INFINITY;
        // sample edges, not just corners; projected edges curve
        const STEPS: usize = 16;
        for i in 0..=STEPS {
            let f = i as f64 / STEPS as f64;
            let edge_points = [
                (e.min_x + f * (e.max_x - e.min_x), e.min_y),
                (e.min_x + f * (e.max_x - e.min_x), e.max_y),
                (e.min_x, e.min_y + f * (e.max_y - e.min_y)),
                (e.max_x, e.min_y + f * (e.max_y - e.min_y)),
            ];
            for (x, y) in edge_points {
                let (px, py) = proj::transform(x, y, self.crs, crs)?;
                min_x = min_x.min(px);
                min_y = min_y.min(py);
                max_x = max_x.max(px);
                max_y = max_y.max(py);
            }
        }
        Ok(Extent {
            min_x,
            min_y,
            max_x,
            max_y,
        })
    }

    /// Count of pixels holding data.
    pub fn data_pixels(&self) -> usize {
        self.data.iter().filter(|v| !self.is_nodata(**v)).count()
    }

    /// Reproject into the grid of `target` by nearest-neighbour inverse
    /// sampling: for each target pixel, look up the source pixel under its
    /// centre. Target pixels outside the source stay nodata.
    pub fn reproject_into(&self, target: &mut Raster) -> Result<()> {
        for row in 0..target.height {
            for col in 0..target.width {
                let (tx, ty) = target
                    .transform
                    .pixel_to_world(col as f64 + 0.5, row as f64 + 0.5);
                let (sx, sy) = proj::transform(tx, ty, target.crs, self.crs)?;
                let (fc, fr) = self.transform.world_to_pixel(sx, sy);
                if fc < 0.0 || fr < 0.0 {
                    continue;
                }
                let (sc, sr) = (fc.floor() as usize, fr.floor() as usize);
                if sc >= self.width || sr >= self.height {
                    continue;
                }
                let v = self.get(sc, sr);
                if !self.is_nodata(v) {
                    target.set(col, row, v);
                }
            }
        }
        Ok(())
    }

    /// Burn `value` into every pixel whose centre falls inside the polygon.
    ///
    /// Even-odd scanline test against the exterior ring minus the interiors,
    /// in the raster's own CRS.
    pub fn rasterize_polygon(&mut self, polygon: &Polygon<f64>, value: f32) {
        for row in 0..self.height {
            for col in 0..self.width {
                let (x, y) = self
                    .transform
                    .pixel_to_world(col as f64 + 0.5, row as f64 + 0.5);
                if polygon_contains(polygon, x, y) {
                    self.set(col, row, value);
                }
            }
        }
    }

    /// Check that two rasters share grid geometry so they can be merged
    /// pixelwise.
    pub fn same_grid(&self, other: &Raster) -> bool {
        self.width == other.width
            && self.height == other.height
            && self.crs == other.crs
            && self.transform == other.transform
    }

    pub fn assert_same_grid(&self, other: &Raster) -> Result<()> {
        if self.same_grid(other) {
            Ok(())
        } else {
            Err(GeoError::Raster(format!(
                "grid mismatch: {}x{} {} vs {}x{} {}",
                self.width, self.height, self.crs, other.width, other.height, other.crs
            )))
        }
    }
}

fn polygon_contains(polygon: &Polygon<f64>, x: f64, y: f64) -> bool {
    if !ring_contains(polygon.exterior().0.as_slice(), x, y) {
        return false;
    }
    for interior in polygon.interiors() {
        if ring_contains(interior.0.as_slice(), x, y) {
            return false;
        }
    }
    true
}

fn ring_contains(ring: &[Coord<f64>], x: f64, y: f64) -> bool {
    let mut inside = false;
    let n = ring.len();
    if n < 3 {
        return false;
    }
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = (ring[i].x, ring[i].y);
        let (xj, yj) = (ring[j].x, ring[j].y);
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meter_transform() -> PixelTransform {
        PixelTransform {
            origin_x: 0.0,
            origin_y: 1000.0,
            pixel_width: 100.0,
            pixel_height: 100.0,
        }
    }

    #[test]
    fn test_pixel_world_roundtrip() {
        let t = meter_transform();
        let (x, y) = t.pixel_to_world(3.0, 2.0);
        assert_eq!((x, y), (300.0, 800.0));
        assert_eq!(t.world_to_pixel(x, y), (3.0, 2.0));
    }

    #[test]
    fn test_covering_snaps_to_grid() {
        let extent = Extent {
            min_x: 151.0,
            min_y: 149.0,
            max_x: 449.0,
            max_y: 551.0,
        };
        let r = Raster::covering(&extent, 100.0, 0.0, Crs::LambertCanada);
        assert_eq!(r.transform.origin_x, 100.0);
        assert_eq!(r.transform.origin_y, 600.0);
        assert_eq!((r.width, r.height), (4, 5));
    }

    #[test]
    fn test_rasterize_square() {
        let mut r = Raster::filled(10, 10, 0.0, meter_transform(), Crs::LambertCanada);
        let square = Polygon::new(
            geo::LineString::from(vec![
                (200.0, 200.0),
                (500.0, 200.0),
                (500.0, 500.0),
                (200.0, 500.0),
                (200.0, 200.0),
            ]),
            vec![],
        );
        r.rasterize_polygon(&square, 1.0);
        // 3x3 pixel centres fall inside
        assert_eq!(r.data.iter().filter(|v| **v == 1.0).count(), 9);
    }

    #[test]
    fn test_reproject_identity_grid_shift() {
        // same CRS, shifted grid: values land in the overlapping cells
        let mut src = Raster::filled(4, 4, 0.0, meter_transform(), Crs::LambertCanada);
        src.set(1, 1, 7.0);
        let mut dst = Raster::filled(
            4,
            4,
            0.0,
            PixelTransform {
                origin_x: 100.0,
                origin_y: 900.0,
                pixel_width: 100.0,
                pixel_height: 100.0,
            },
            Crs::LambertCanada,
        );
        src.reproject_into(&mut dst).unwrap();
        assert_eq!(dst.get(0, 0), 7.0);
    }

    #[test]
    fn test_grid_mismatch_rejected() {
        let a = Raster::filled(4, 4, 0.0, meter_transform(), Crs::LambertCanada);
        let b = Raster::filled(5, 4, 0.0, meter_transform(), Crs::LambertCanada);
        assert!(a.assert_same_grid(&b).is_err());
    }
}
