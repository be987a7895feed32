//! Run identity and on-disk lifecycle.
//!
//! A run is a directory tree named `<prefix>_<YYYYMMDDhhmm>`; everything the
//! pipeline produces for one invocation lives under it, which is what makes
//! runs resumable: re-opening the directory recovers all state.

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

const RUN_TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M";
const METADATA_FILE: &str = "run.json";

/// Persisted run metadata, also attached to published blobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunMetadata {
    pub run_id: String,
    pub source: String,
    pub run_length: u32,
    pub origin_date: String,
    /// Issue time of the ensemble model run this run consumed.
    #[serde(default)]
    pub model_run: Option<String>,
    /// True once a publish of current outputs has succeeded for this run.
    #[serde(default)]
    pub published_clean: bool,
}

#[derive(Debug, Clone)]
pub struct Run {
    /// `<prefix>_<YYYYMMDDhhmm>`
    pub id: String,
    pub prefix: String,
    pub origin: DateTime<Utc>,
    /// `sims/<run_id>` under the working root.
    pub dir: PathBuf,
    pub out_dir: PathBuf,
    pub zip_path: PathBuf,
    pub max_days: u32,
}

impl Run {
    /// Create a fresh run rooted at `base`.
    pub fn create(base: &Path, prefix: &str, max_days: u32) -> Result<Run> {
        let origin = Utc::now();
        let id = format!("{prefix}_{}", origin.format(RUN_TIMESTAMP_FORMAT));
        let run = Run::layout(base, &id, prefix.to_string(), origin, max_days);
        fs::create_dir_all(run.sims_dir())?;
        fs::create_dir_all(run.data_dir())?;
        fs::create_dir_all(&run.out_dir)?;
        run.save_metadata()?;
        info!(run = %run.id, dir = %run.dir.display(), "created run");
        Ok(run)
    }

    /// Re-open the most recent run with this prefix, for `--resume`.
    pub fn resume_latest(base: &Path, prefix: &str, max_days: u32) -> Result<Run> {
        let sims = base.join("sims");
        let mut candidates: Vec<String> = fs::read_dir(&sims)
            .with_context(|| format!("No runs under {}", sims.display()))?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|name| name.starts_with(&format!("{prefix}_")))
            .collect();
        candidates.sort();
        let id = candidates
            .pop()
            .ok_or_else(|| anyhow!("no previous run with prefix {prefix} to resume"))?;
        Run::open(&base.join("sims").join(&id), max_days)
    }

    /// Open an existing run directory.
    pub fn open(dir: &Path, max_days: u32) -> Result<Run> {
        let id = dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("bad run directory: {}", dir.display()))?
            .to_string();
        let (prefix, origin) = parse_run_id(&id)?;
        let base = dir
            .parent()
            .and_then(Path::parent)
            .ok_or_else(|| anyhow!("run directory has no root: {}", dir.display()))?;
        let run = Run::layout(base, &id, prefix, origin, max_days);
        if !run.dir.is_dir() {
            bail!("run directory does not exist: {}", run.dir.display());
        }
        info!(run = %run.id, "opened existing run");
        Ok(run)
    }

    fn layout(
        base: &Path,
        id: &str,
        prefix: String,
        origin: DateTime<Utc>,
        max_days: u32,
    ) -> Run {
        Run {
            id: id.to_string(),
            prefix,
            origin,
            dir: base.join("sims").join(id),
            out_dir: base.join("output").join(id),
            zip_path: base.join("zip").join(format!("{id}.zip")),
            max_days,
        }
    }

    /// Directory holding one subdirectory per fire group.
    pub fn sims_dir(&self) -> PathBuf {
        self.dir.join("sims")
    }

    /// Run-level derived data (group lists and the like).
    pub fn data_dir(&self) -> PathBuf {
        self.dir.join("data")
    }

    pub fn group_dir(&self, fire_name: &str) -> PathBuf {
        self.sims_dir().join(fire_name)
    }

    pub fn metadata(&self) -> RunMetadata {
        RunMetadata {
            run_id: self.id.clone(),
            source: self.prefix.clone(),
            run_length: self.max_days,
            origin_date: self.origin.format("%Y-%m-%d").to_string(),
            model_run: None,
            published_clean: false,
        }
    }

    pub fn save_metadata(&self) -> Result<()> {
        let path = self.dir.join(METADATA_FILE);
        let json = serde_json::to_string_pretty(&self.metadata())?;
        fs::write(&path, json)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn load_metadata(&self) -> Result<RunMetadata> {
        let path = self.dir.join(METADATA_FILE);
        let text = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Record which ensemble model run fed this run's forecasts. Later
    /// groups sharing the run leave it untouched.
    pub fn record_model_run(&self, issued: DateTime<Utc>) -> Result<()> {
        let issued = issued.format("%Y-%m-%d %H:%M").to_string();
        let mut meta = self.load_metadata().unwrap_or_else(|_| self.metadata());
        if meta.model_run.as_deref() == Some(issued.as_str()) {
            return Ok(());
        }
        meta.model_run = Some(issued);
        let path = self.dir.join(METADATA_FILE);
        fs::write(&path, serde_json::to_string_pretty(&meta)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Record that current outputs have been published for this run, and
    /// clean up any advisory lock files left behind under its directories.
    pub fn mark_published_clean(&self) -> Result<()> {
        let mut meta = self.load_metadata().unwrap_or_else(|_| self.metadata());
        meta.published_clean = true;
        let path = self.dir.join(METADATA_FILE);
        fs::write(&path, serde_json::to_string_pretty(&meta)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        for root in [&self.dir, &self.out_dir] {
            for entry in walkdir::WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
                if entry.file_type().is_file()
                    && entry.path().extension().is_some_and(|e| e == "lock")
                {
                    let _ = fs::remove_file(entry.path());
                }
            }
        }
        Ok(())
    }

    /// Group directories already present on disk, sorted by name.
    pub fn existing_groups(&self) -> Result<Vec<PathBuf>> {
        let sims = self.sims_dir();
        if !sims.is_dir() {
            return Ok(Vec::new());
        }
        let mut dirs: Vec<PathBuf> = fs::read_dir(&sims)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();
        Ok(dirs)
    }
}

fn parse_run_id(id: &str) -> Result<(String, DateTime<Utc>)> {
    let (prefix, stamp) = id
        .rsplit_once('_')
        .ok_or_else(|| anyhow!("run id has no timestamp: {id}"))?;
    let naive = NaiveDateTime::parse_from_str(stamp, RUN_TIMESTAMP_FORMAT)
        .with_context(|| format!("bad run timestamp in {id}"))?;
    Ok((prefix.to_string(), Utc.from_utc_datetime(&naive)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_then_open_roundtrip() {
        let base = tempfile::tempdir().unwrap();
        let created = Run::create(base.path(), "m3", 14).unwrap();
        assert!(created.sims_dir().is_dir());
        assert!(created.dir.join(METADATA_FILE).is_file());

        let opened = Run::open(&created.dir, 14).unwrap();
        assert_eq!(opened.id, created.id);
        assert_eq!(opened.prefix, "m3");
        assert_eq!(
            opened.origin.format(RUN_TIMESTAMP_FORMAT).to_string(),
            created.origin.format(RUN_TIMESTAMP_FORMAT).to_string()
        );
        assert_eq!(opened.out_dir, created.out_dir);
    }

    #[test]
    fn test_resume_picks_latest() {
        let base = tempfile::tempdir().unwrap();
        for stamp in ["m3_202406140000", "m3_202406150210", "m3_202406150100"] {
            fs::create_dir_all(base.path().join("sims").join(stamp)).unwrap();
        }
        let run = Run::resume_latest(base.path(), "m3", 14).unwrap();
        assert_eq!(run.id, "m3_202406150210");
    }

    #[test]
    fn test_resume_without_runs_fails() {
        let base = tempfile::tempdir().unwrap();
        fs::create_dir_all(base.path().join("sims")).unwrap();
        assert!(Run::resume_latest(base.path(), "m3", 14).is_err());
    }

    #[test]
    fn test_prefix_with_underscore() {
        let (prefix, _) = parse_run_id("my_input_dir_202406150210").unwrap();
        assert_eq!(prefix, "my_input_dir");
        assert!(parse_run_id("noprefix").is_err());
    }

    #[test]
    fn test_metadata_shape() {
        let base = tempfile::tempdir().unwrap();
        let run = Run::create(base.path(), "m3", 7).unwrap();
        let meta = run.metadata();
        assert_eq!(meta.run_id, run.id);
        assert_eq!(meta.run_length, 7);
        let text = fs::read_to_string(run.dir.join(METADATA_FILE)).unwrap();
        let parsed: RunMetadata = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, meta);
    }

    #[test]
    fn test_mark_published_clean_removes_locks() {
        let base = tempfile::tempdir().unwrap();
        let run = Run::create(base.path(), "m3", 7).unwrap();
        let lock = run.out_dir.join("merge.lock");
        fs::write(&lock, b"").unwrap();
        assert!(!run.load_metadata().unwrap().published_clean);

        run.mark_published_clean().unwrap();
        assert!(run.load_metadata().unwrap().published_clean);
        assert!(!lock.exists());
    }
}
