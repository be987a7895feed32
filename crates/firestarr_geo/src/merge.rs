//! Nodata-aware raster merging.
//!
//! Probability rasters from overlapping simulations combine by pixelwise
//! maximum, so re-merging the same inputs is idempotent and merge order
//! never matters.

use crate::geotiff;
use crate::proj::Crs;
use crate::raster::{Extent, Raster};
use crate::{GeoError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Pixelwise maximum of `src` into `dst`, ignoring nodata on either side.
pub fn combine_max(dst: &mut Raster, src: &Raster) -> Result<()> {
    dst.assert_same_grid(src)?;
    for i in 0..dst.data.len() {
        let s = src.data[i];
        if src.is_nodata(s) {
            continue;
        }
        let d = dst.data[i];
        if dst.is_nodata(d) || s > d {
            dst.data[i] = s;
        }
    }
    Ok(())
}

/// Merge rasters into a single grid at `cell` resolution in `crs`, taking the
/// pixelwise maximum, and write the result to `out`.
///
/// The output grid is snapped to `cell` so repeated merges of overlapping
/// inputs align. Writing goes through a sibling temp file and a rename, so a
/// crash never leaves a truncated output behind.
pub fn merge_max(paths: &[PathBuf], out: &Path, cell: f64, crs: Crs, nodata: f32) -> Result<Raster> {
    if paths.is_empty() {
        return Err(GeoError::Raster("nothing to merge".to_string()));
    }

    let sources: Vec<Raster> = paths
        .iter()
        .map(|p| geotiff::read_raster(p))
        .collect::<Result<_>>()?;

    let mut extent: Option<Extent> = None;
    for src in &sources {
        let e = src.extent_in(crs)?;
        extent = Some(match extent {
            Some(acc) => acc.union(&e),
            None => e,
        });
    }
    let extent = extent.expect("sources is non-empty");

    let mut merged = Raster::covering(&extent, cell, nodata, crs);
    let mut scratch = merged.clone();
    for (src, path) in sources.iter().zip(paths) {
        scratch.data.fill(nodata);
        src.reproject_into(&mut scratch)?;
        combine_max(&mut merged, &scratch)?;
        debug!(
            source = %path.display(),
            pixels = scratch.data_pixels(),
            "merged raster"
        );
    }

    write_atomic(out, &merged)?;
    Ok(merged)
}

/// Write a raster through a sibling temp file and rename into place.
pub fn write_atomic(out: &Path, raster: &Raster) -> Result<()> {
    if let Some(parent) = out.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = temp_sibling(out);
    geotiff::write_raster(&tmp, raster)?;
    fs::rename(&tmp, out)?;
    Ok(())
}

fn temp_sibling(out: &Path) -> PathBuf {
    let mut name = out
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "merge".to_string());
    name.push_str(".tmp");
    out.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::PixelTransform;

    fn grid(nodata: f32) -> Raster {
        Raster::filled(
            4,
            4,
            nodata,
            PixelTransform {
                origin_x: 0.0,
                origin_y: 400.0,
                pixel_width: 100.0,
                pixel_height: 100.0,
            },
            Crs::LambertCanada,
        )
    }

    #[test]
    fn test_combine_takes_max_and_keeps_data_over_nodata() {
        let mut a = grid(0.0);
        let mut b = grid(0.0);
        a.set(0, 0, 0.3);
        b.set(0, 0, 0.7);
        b.set(1, 1, 0.2);
        combine_max(&mut a, &b).unwrap();
        assert_eq!(a.get(0, 0), 0.7);
        assert_eq!(a.get(1, 1), 0.2);
        assert_eq!(a.get(2, 2), 0.0);
    }

    #[test]
    fn test_combine_is_idempotent() {
        let mut a = grid(0.0);
        let mut b = grid(0.0);
        b.set(2, 3, 0.9);
        combine_max(&mut a, &b).unwrap();
        let once = a.data.clone();
        combine_max(&mut a, &b).unwrap();
        assert_eq!(a.data, once);
    }

    #[test]
    fn test_merge_files_order_independent() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = grid(0.0);
        a.set(0, 0, 0.4);
        let mut b = grid(0.0);
        b.set(0, 0, 0.6);
        b.set(3, 3, 0.1);
        let pa = dir.path().join("a.tif");
        let pb = dir.path().join("b.tif");
        geotiff::write_raster(&pa, &a).unwrap();
        geotiff::write_raster(&pb, &b).unwrap();

        let m1 = merge_max(
            &[pa.clone(), pb.clone()],
            &dir.path().join("m1.tif"),
            100.0,
            Crs::LambertCanada,
            0.0,
        )
        .unwrap();
        let m2 = merge_max(
            &[pb, pa],
            &dir.path().join("m2.tif"),
            100.0,
            Crs::LambertCanada,
            0.0,
        )
        .unwrap();
        assert_eq!(m1.data, m2.data);
        assert!(m1.data.contains(&0.6));
        assert!(!m1.data.contains(&0.4));
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = grid(0.0);
        a.set(1, 1, 1.0);
        let pa = dir.path().join("a.tif");
        geotiff::write_raster(&pa, &a).unwrap();
        let out = dir.path().join("out.tif");
        merge_max(&[pa], &out, 100.0, Crs::LambertCanada, 0.0).unwrap();
        assert!(out.exists());
        let leftovers = fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .path()
                    .extension()
                    .is_some_and(|ext| ext == "tmp")
            })
            .count();
        assert_eq!(leftovers, 0);
    }
}
