//! Geodata primitives for the firestarr pipeline.
//!
//! Pure-Rust projections (no PROJ/GDAL link), a single-band float raster
//! with GeoTIFF persistence, polygon rasterization, reprojection and
//! nodata-aware max-merging. Everything here is pure with respect to its
//! input files.

pub mod geotiff;
pub mod merge;
pub mod proj;
pub mod raster;
pub mod zones;

use geo::{Area, Geometry, MapCoords, Point};
use std::f64::consts::PI;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub use proj::Crs;
pub use raster::{Extent, PixelTransform, Raster};

#[derive(Debug, Error)]
pub enum GeoError {
    #[error("projection error: {0}")]
    Projection(String),
    #[error("raster error: {0}")]
    Raster(String),
    #[error("no fuels raster found under {0}")]
    NoZoneRaster(PathBuf),
    #[error("tiff error: {0}")]
    Tiff(#[from] tiff::TiffError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, GeoError>;

/// Reproject a geometry between coordinate systems.
pub fn project_geometry(geom: &Geometry<f64>, from: Crs, to: Crs) -> Result<Geometry<f64>> {
    if from == to {
        return Ok(geom.clone());
    }
    let failed = std::cell::Cell::new(None);
    let out = geom.map_coords(|c| match proj::transform(c.x, c.y, from, to) {
        Ok((x, y)) => geo::Coord { x, y },
        Err(e) => {
            failed.set(Some(e));
            c
        }
    });
    match failed.into_inner() {
        Some(e) => Err(e),
        None => Ok(out),
    }
}

/// Reproject a single point between coordinate systems.
pub fn project_point(pt: Point<f64>, from: Crs, to: Crs) -> Result<Point<f64>> {
    let (x, y) = proj::transform(pt.x(), pt.y(), from, to)?;
    Ok(Point::new(x, y))
}

/// Area in hectares, computed in the comparison CRS (EPSG:3978).
pub fn area_ha(geom: &Geometry<f64>, crs: Crs) -> Result<f64> {
    let projected = project_geometry(geom, crs, Crs::LambertCanada)?;
    Ok(projected.unsigned_area() / 10_000.0)
}

/// Radius in meters of a circle with the given area in hectares.
///
/// Used to inflate point fires of known size into circles for spatial joins.
pub fn area_ha_to_radius_m(area_ha: f64) -> f64 {
    (area_ha * 10_000.0 / PI).sqrt()
}

/// A circle approximated as a polygon, for point fires with a known area.
pub fn circle(center: Point<f64>, radius_m: f64, segments: usize) -> geo::Polygon<f64> {
    let n = segments.max(8);
    let ring: Vec<geo::Coord<f64>> = (0..=n)
        .map(|i| {
            let theta = 2.0 * PI * (i as f64) / (n as f64);
            geo::Coord {
                x: center.x() + radius_m * theta.cos(),
                y: center.y() + radius_m * theta.sin(),
            }
        })
        .collect();
    geo::Polygon::new(geo::LineString::from(ring), vec![])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_area_to_radius_roundtrip() {
        // 1 ha circle has radius sqrt(10000/pi)
        let r = area_ha_to_radius_m(1.0);
        assert!((r - 56.418_958).abs() < 1e-3, "r = {r}");
        let c = circle(Point::new(0.0, 0.0), r, 720);
        let a = c.unsigned_area() / 10_000.0;
        assert!((a - 1.0).abs() < 1e-3, "area = {a}");
    }

    #[test]
    fn test_area_ha_known_square() {
        // 1 km x 1 km square in the comparison CRS is 100 ha by definition
        let square = Geometry::Polygon(geo::Polygon::new(
            geo::LineString::from(vec![
                (0.0, 0.0),
                (1000.0, 0.0),
                (1000.0, 1000.0),
                (0.0, 1000.0),
                (0.0, 0.0),
            ]),
            vec![],
        ));
        let a = area_ha(&square, Crs::LambertCanada).unwrap();
        assert!((a - 100.0).abs() < 1e-6);
    }
}
