//! Discovery of per-zone environment rasters.
//!
//! The simulator needs a fuels raster in the UTM zone a fire burns in. The
//! raster directory holds one GeoTIFF per zone; selection picks the raster
//! whose central meridian is closest to the fire's longitude, first match
//! winning on ties so selection is deterministic across runs.

use crate::geotiff;
use crate::proj::{utm_central_meridian, Crs};
use crate::{GeoError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// A zone raster found on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneRaster {
    pub path: PathBuf,
    pub zone: u8,
    pub north: bool,
}

impl ZoneRaster {
    pub fn crs(&self) -> Crs {
        Crs::Utm {
            zone: self.zone,
            north: self.north,
        }
    }

    pub fn central_meridian(&self) -> f64 {
        utm_central_meridian(self.zone)
    }
}

/// Scan a directory tree for UTM-projected GeoTIFFs, sorted by path.
///
/// Files that are not readable GeoTIFFs or are not in a UTM CRS are skipped
/// with a warning rather than failing the scan.
pub fn scan(dir: &Path) -> Result<Vec<ZoneRaster>> {
    let mut rasters = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| GeoError::Raster(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let is_tif = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("tif") || e.eq_ignore_ascii_case("tiff"));
        if !is_tif {
            continue;
        }
        match geotiff::read_crs_only(path) {
            Ok(Some(Crs::Utm { zone, north })) => {
                debug!(path = %path.display(), zone, "found zone raster");
                rasters.push(ZoneRaster {
                    path: path.to_path_buf(),
                    zone,
                    north,
                });
            }
            Ok(_) => {
                warn!(path = %path.display(), "skipping raster: not in a UTM zone");
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable raster");
            }
        }
    }
    Ok(rasters)
}

/// Pick the raster whose central meridian is closest to `lon`.
///
/// Ties keep the earliest raster in scan order.
pub fn find_best_raster(rasters: &[ZoneRaster], lon: f64) -> Result<&ZoneRaster> {
    let mut best: Option<(&ZoneRaster, f64)> = None;
    for raster in rasters {
        let dist = (raster.central_meridian() - lon).abs();
        let better = match best {
            Some((_, d)) => dist < d,
            None => true,
        };
        if better {
            best = Some((raster, dist));
        }
    }
    best.map(|(r, _)| r)
        .ok_or_else(|| GeoError::NoZoneRaster(PathBuf::new()))
}

/// Scan `dir` and pick the best raster for `lon` in one step.
pub fn best_raster_for(dir: &Path, lon: f64) -> Result<ZoneRaster> {
    let rasters = scan(dir)?;
    if rasters.is_empty() {
        return Err(GeoError::NoZoneRaster(dir.to_path_buf()));
    }
    Ok(find_best_raster(&rasters, lon)?.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone(zone: u8, name: &str) -> ZoneRaster {
        ZoneRaster {
            path: PathBuf::from(name),
            zone,
            north: true,
        }
    }

    #[test]
    fn test_picks_closest_central_meridian() {
        let rasters = vec![zone(14, "z14.tif"), zone(15, "z15.tif"), zone(16, "z16.tif")];
        // -89.024 is in zone 16 (cm -87), closer than zone 15 (cm -93)
        let best = find_best_raster(&rasters, -89.024).unwrap();
        assert_eq!(best.zone, 16);
        let best = find_best_raster(&rasters, -93.5).unwrap();
        assert_eq!(best.zone, 15);
    }

    #[test]
    fn test_tie_keeps_first() {
        // -90 is equidistant from cm -93 (z15) and cm -87 (z16)
        let rasters = vec![zone(15, "z15.tif"), zone(16, "z16.tif")];
        assert_eq!(find_best_raster(&rasters, -90.0).unwrap().zone, 15);
        let flipped = vec![zone(16, "z16.tif"), zone(15, "z15.tif")];
        assert_eq!(find_best_raster(&flipped, -90.0).unwrap().zone, 16);
    }

    #[test]
    fn test_empty_set_errors() {
        assert!(find_best_raster(&[], -90.0).is_err());
    }

    #[test]
    fn test_scan_finds_written_rasters() {
        use crate::raster::{PixelTransform, Raster};
        let dir = tempfile::tempdir().unwrap();
        let r = Raster::filled(
            2,
            2,
            0.0,
            PixelTransform {
                origin_x: 500_000.0,
                origin_y: 5_800_000.0,
                pixel_width: 100.0,
                pixel_height: 100.0,
            },
            Crs::Utm {
                zone: 15,
                north: true,
            },
        );
        geotiff::write_raster(&dir.path().join("fuel_z15.tif"), &r).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a raster").unwrap();
        let found = scan(dir.path()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].zone, 15);
    }
}
