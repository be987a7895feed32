//! Output aggregation: collect per-group rasters, merge across zones per
//! date, package and hand off for publishing.
//!
//! Merging happens in the comparison CRS (EPSG:3978), never in the UTM
//! zones, so overlaps at zone boundaries resolve by pixel maximum instead
//! of seams. Merges are serialized by an advisory lock on the output
//! directory since buckets publish concurrently with later simulations.

use crate::run::Run;
use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use firestarr_geo::raster::Raster;
use firestarr_geo::{geotiff, merge, Crs};
use fs2::FileExt;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;

/// Cell size of combined products, meters.
const MERGE_CELL_M: f64 = 100.0;
const MERGE_NODATA: f32 = 0.0;
const PERIM_DIR: &str = "perim";

pub struct Aggregator<'a> {
    pub run: &'a Run,
}

impl<'a> Aggregator<'a> {
    pub fn new(run: &'a Run) -> Aggregator<'a> {
        Aggregator { run }
    }

    fn initial_dir(&self) -> PathBuf {
        self.run.out_dir.join("initial")
    }

    fn reprojected_dir(&self) -> PathBuf {
        self.run.out_dir.join("reprojected")
    }

    fn combined_dir(&self) -> PathBuf {
        self.run.out_dir.join("combined")
    }

    /// Pull one group's simulator outputs into `initial/`, reprojected to
    /// the comparison CRS.
    pub fn collect_group(&self, fire_name: &str, sim_dir: &Path) -> Result<()> {
        let mut collected = 0usize;
        for entry in fs::read_dir(sim_dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(date) = probability_date(name) {
                let out = self
                    .initial_dir()
                    .join(date.format("%Y%m%d").to_string())
                    .join(format!("{fire_name}.tif"));
                if let Err(e) = reproject_to_comparison(&path, &out) {
                    warn!(path = %path.display(), error = %e, "skipping unreadable output");
                    continue;
                }
                collected += 1;
            } else if name.starts_with("perim") && name.ends_with(".tif") {
                let out = self
                    .initial_dir()
                    .join(PERIM_DIR)
                    .join(format!("{fire_name}.tif"));
                if let Err(e) = reproject_to_comparison(&path, &out) {
                    warn!(path = %path.display(), error = %e, "skipping unreadable perimeter");
                }
            }
        }
        info!(fire = %fire_name, rasters = collected, "collected group outputs");
        Ok(())
    }

    /// Merge everything currently collected into `combined/`, returning the
    /// files written. Safe to call repeatedly; merging is idempotent.
    pub fn merge_all(&self) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(&self.run.out_dir)?;
        let _lock = OutputLock::acquire(&self.run.out_dir)?;

        let initial = self.initial_dir();
        if !initial.is_dir() {
            fs::create_dir_all(self.combined_dir())?;
            return Ok(Vec::new());
        }

        let mut date_dirs: BTreeMap<NaiveDate, PathBuf> = BTreeMap::new();
        for entry in fs::read_dir(&initial)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name == PERIM_DIR {
                continue;
            }
            if let Ok(date) = NaiveDate::parse_from_str(name, "%Y%m%d") {
                date_dirs.insert(date, path);
            }
        }

        let mut written = Vec::new();
        let first_date = date_dirs.keys().next().copied().unwrap_or_default();
        for (date, dir) in &date_dirs {
            let day = (*date - first_date).num_days() + 1;
            let name = format!(
                "firestarr_{}_day_{:02}_{}.tif",
                self.run.id,
                day,
                date.format("%Y%m%d")
            );
            if let Some(path) = self.merge_date_dir(dir, date, &name)? {
                written.push(path);
            }
        }

        // perimeters merge the same way, without the day numbering
        let perim_dir = initial.join(PERIM_DIR);
        if perim_dir.is_dir() {
            let name = format!("firestarr_{}_perim.tif", self.run.id);
            if let Some(path) = self.merge_perim_dir(&perim_dir, &name)? {
                written.push(path);
            }
        }

        fs::create_dir_all(self.combined_dir())?;
        info!(files = written.len(), "merged run outputs");
        Ok(written)
    }

    fn merge_date_dir(
        &self,
        dir: &Path,
        date: &NaiveDate,
        combined_name: &str,
    ) -> Result<Option<PathBuf>> {
        let cache = self
            .reprojected_dir()
            .join(date.format("%Y%m%d").to_string());
        let by_zone = self.bucket_by_zone(dir, &cache)?;
        if by_zone.is_empty() {
            return Ok(None);
        }

        let mut zone_outputs = Vec::new();
        for (zone, files) in by_zone {
            let zone_out = self
                .run
                .out_dir
                .join("zones")
                .join(&zone)
                .join(combined_name);
            match merge::merge_max(&files, &zone_out, MERGE_CELL_M, Crs::LambertCanada, MERGE_NODATA)
            {
                Ok(_) => zone_outputs.push(zone_out),
                Err(e) => warn!(zone = %zone, error = %e, "zone merge failed"),
            }
        }
        if zone_outputs.is_empty() {
            return Ok(None);
        }

        let combined = self.combined_dir().join(combined_name);
        merge::merge_max(
            &zone_outputs,
            &combined,
            MERGE_CELL_M,
            Crs::LambertCanada,
            MERGE_NODATA,
        )
        .map_err(|e| anyhow!(e))?;
        Ok(Some(combined))
    }

    fn merge_perim_dir(&self, dir: &Path, combined_name: &str) -> Result<Option<PathBuf>> {
        let cache = self.reprojected_dir().join(PERIM_DIR);
        let by_zone = self.bucket_by_zone(dir, &cache)?;
        if by_zone.is_empty() {
            return Ok(None);
        }
        let files: Vec<PathBuf> = by_zone.into_values().flatten().collect();
        let combined = self.combined_dir().join(combined_name);
        merge::merge_max(
            &files,
            &combined,
            MERGE_CELL_M,
            Crs::LambertCanada,
            MERGE_NODATA,
        )
        .map_err(|e| anyhow!(e))?;
        Ok(Some(combined))
    }

    /// Refresh the reprojection cache for one date directory and bucket the
    /// cached files by the UTM-zone prefix of the fire name.
    ///
    /// Unreadable rasters are removed so one bad file cannot wedge every
    /// later merge of the run.
    fn bucket_by_zone(
        &self,
        dir: &Path,
        cache: &Path,
    ) -> Result<BTreeMap<String, Vec<PathBuf>>> {
        fs::create_dir_all(cache)?;
        let mut by_zone: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(".tif") {
                continue;
            }
            let cached = cache.join(name);
            if !is_current(&cached, &path) {
                match geotiff::read_raster(&path) {
                    Ok(raster) => merge::write_atomic(&cached, &raster)
                        .map_err(|e| anyhow!(e))
                        .with_context(|| format!("caching {}", path.display()))?,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "removing unreadable raster");
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                }
            }
            let zone = name.split('_').next().unwrap_or("unknown").to_string();
            by_zone.entry(zone).or_default().push(cached);
        }
        Ok(by_zone)
    }

    /// Zip `combined/` into `zip/<run>.zip`.
    pub fn zip_combined(&self) -> Result<PathBuf> {
        let combined = self.combined_dir();
        fs::create_dir_all(&combined)?;
        if let Some(parent) = self.run.zip_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::File::create(&self.run.zip_path)
            .with_context(|| format!("Failed to create {}", self.run.zip_path.display()))?;
        let mut writer = zip::ZipWriter::new(file);
        let options = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        for entry in WalkDir::new(&combined).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&combined)
                .expect("entry under combined");
            writer.start_file(relative.to_string_lossy(), options)?;
            writer.write_all(&fs::read(entry.path())?)?;
        }
        writer.finish()?;
        info!(zip = %self.run.zip_path.display(), "packaged combined outputs");
        Ok(self.run.zip_path.clone())
    }
}

/// Reproject any single-band raster onto the comparison grid.
fn reproject_to_comparison(src: &Path, dst: &Path) -> Result<()> {
    let source = geotiff::read_raster(src).map_err(|e| anyhow!(e))?;
    let extent = source.extent_in(Crs::LambertCanada).map_err(|e| anyhow!(e))?;
    let mut target = Raster::covering(&extent, MERGE_CELL_M, MERGE_NODATA, Crs::LambertCanada);
    source.reproject_into(&mut target).map_err(|e| anyhow!(e))?;
    merge::write_atomic(dst, &target).map_err(|e| anyhow!(e))?;
    Ok(())
}

fn probability_date(file_name: &str) -> Option<NaiveDate> {
    let rest = file_name.strip_prefix("probability_")?;
    let stem = rest.strip_suffix(".tif")?;
    NaiveDate::parse_from_str(stem, "%Y-%m-%d").ok()
}

fn is_current(cached: &Path, source: &Path) -> bool {
    match (cached.metadata(), source.metadata()) {
        (Ok(c), Ok(s)) => match (c.modified(), s.modified()) {
            (Ok(cm), Ok(sm)) => cm >= sm,
            _ => false,
        },
        _ => false,
    }
}

/// Advisory lock serializing merges into one output directory.
struct OutputLock {
    file: fs::File,
}

impl OutputLock {
    fn acquire(out_dir: &Path) -> Result<OutputLock> {
        let path = out_dir.join("merge.lock");
        let file = fs::OpenOptions::new().create(true).write(true).open(&path)?;
        file.lock_exclusive()?;
        Ok(OutputLock { file })
    }
}

impl Drop for OutputLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}
