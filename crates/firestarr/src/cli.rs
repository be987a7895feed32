//! Command line interface and pipeline orchestration.
//!
//! One invocation is one run: discover fires, reconcile them into named
//! groups, prepare a simulation folder per group, schedule the simulator
//! over them in priority order, and assemble the combined products.

use crate::aggregate::Aggregator;
use crate::config::{load_bounds_regions, Settings};
use crate::prepare;
use crate::publish::BlobPublisher;
use crate::reconcile::{assign_priorities, FireGroup, Reconciler};
use crate::run::Run;
use crate::sched::{Backend, Scheduler, SimResult, SimTask, TaskOutcome};
use anyhow::{anyhow, bail, Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use clap::Parser;
use firestarr_fwi::Startup;
use firestarr_sources::fire::{parse_fire_geojson, FireSourceRegistry};
use firestarr_sources::net::HttpCache;
use firestarr_sources::ratelimit::RateLimiter;
use firestarr_sources::types::FireFeature;
use firestarr_sources::wx::{self, EnsembleSource};
use firestarr_sources::SourceError;
use geo::{Centroid, Geometry};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{info, warn};

/// Hours after which an ensemble run is considered superseded.
const MODEL_MAX_AGE_HOURS: i64 = 30;
const DEFAULT_RUN_PREFIX: &str = "m3";

#[derive(Debug, Parser)]
#[command(name = "firestarr", about = "Wildfire spread simulation orchestrator")]
pub struct Cli {
    /// Re-open the most recent run instead of starting a new one.
    #[arg(long)]
    pub resume: bool,

    /// Skip uploading combined outputs.
    #[arg(long)]
    pub no_publish: bool,

    /// Skip merging outputs into combined products.
    #[arg(long)]
    pub no_merge: bool,

    /// Fail instead of waiting when a group is already running elsewhere.
    #[arg(long)]
    pub no_wait: bool,

    /// Mirror debug output to stderr.
    #[arg(short, long)]
    pub verbose: bool,

    /// Working root for runs, caches and outputs.
    #[arg(long, env = "FIRESTARR_DATA", default_value = "/appl/data")]
    pub data_dir: PathBuf,

    /// Either a directory of staged fire GeoJSON files or an existing run
    /// directory to re-open.
    pub target: Option<PathBuf>,

    /// Maximum days to simulate each group.
    pub max_days: Option<u32>,
}

pub async fn execute(cli: Cli) -> Result<()> {
    let settings = Settings::load(Some(&cli.data_dir.join("settings.ini")))?;
    let max_days = cli.max_days.unwrap_or(settings.max_days);

    let (run, staged_dir) = resolve_run(&cli, max_days)?;
    firestarr_logging::init_logging(&firestarr_logging::LogConfig {
        run_dir: &run.dir,
        run_name: &run.id,
        verbose: cli.verbose,
    })?;
    info!(run = %run.id, max_days, "starting");

    let result = run_pipeline(&cli, &settings, &run, staged_dir.as_deref()).await;
    match &result {
        Ok(()) => info!(run = %run.id, "run complete"),
        Err(e) => warn!(run = %run.id, error = %e, "run failed"),
    }
    result
}

/// Decide which run this invocation works on.
fn resolve_run(cli: &Cli, max_days: u32) -> Result<(Run, Option<PathBuf>)> {
    if let Some(target) = &cli.target {
        if target.join("run.json").is_file() {
            return Ok((Run::open(target, max_days)?, None));
        }
        if !target.is_dir() {
            bail!("{} is neither a run nor a fires directory", target.display());
        }
        let prefix = target
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("unusable staged directory: {}", target.display()))?;
        let run = if cli.resume {
            Run::resume_latest(&cli.data_dir, prefix, max_days)?
        } else {
            Run::create(&cli.data_dir, prefix, max_days)?
        };
        return Ok((run, Some(target.clone())));
    }
    let run = if cli.resume {
        Run::resume_latest(&cli.data_dir, DEFAULT_RUN_PREFIX, max_days)?
    } else {
        Run::create(&cli.data_dir, DEFAULT_RUN_PREFIX, max_days)?
    };
    Ok((run, None))
}

async fn run_pipeline(
    cli: &Cli,
    settings: &Settings,
    run: &Run,
    staged_dir: Option<&Path>,
) -> Result<()> {
    let cache = HttpCache::new()?;
    let download_dir = run.data_dir();

    let zones = firestarr_geo::zones::scan(&settings.raster_dir)
        .map_err(|e| anyhow!("scanning {}: {e}", settings.raster_dir.display()))?;
    if zones.is_empty() {
        bail!("no zone rasters under {}", settings.raster_dir.display());
    }

    let (fire_lists, perimeters) =
        discover_fires(settings, &cache, &download_dir, staged_dir).await?;

    let now = Utc::now();
    let reconciler = Reconciler {
        group_distance_km: settings.group_distance_km,
        unmatched_keep_days: settings.unmatched_keep_days,
        zones: &zones,
        now,
    };
    let mut groups = reconciler.reconcile(fire_lists, perimeters)?;
    save_groups_geojson(&run.data_dir().join("fires_groups.geojson"), &groups)?;
    let regions = match &settings.bounds_file {
        Some(path) => load_bounds_regions(path, run.max_days)?,
        None => Vec::new(),
    };
    assign_priorities(&mut groups, &regions, run.max_days);
    save_groups_geojson(&run.data_dir().join("fires_prioritized.geojson"), &groups)?;
    info!(groups = groups.len(), "reconciled fire groups");

    let tasks = prepare_groups(settings, run, &cache, &zones, groups).await?;
    if tasks.is_empty() {
        info!("no simulations to run");
    }

    let backend = Backend::select(
        &run.data_dir(),
        settings.batch_configured(),
        settings.sim_pool_size(),
    )?;
    let scheduler = Scheduler::new(backend, settings.retries, cli.no_wait);
    let cancel = scheduler.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, draining running simulations");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    let no_merge = cli.no_merge;
    let results = scheduler
        .run_all(tasks, |finished: &[SimResult]| {
            if no_merge {
                return Ok(());
            }
            let aggregator = Aggregator::new(run);
            for result in finished {
                if result.outcome != TaskOutcome::Failed {
                    aggregator.collect_group(&result.task.fire_name, &result.task.dir)?;
                }
            }
            aggregator.merge_all()?;
            Ok(())
        })
        .await?;

    let failed = results
        .iter()
        .filter(|r| r.outcome == TaskOutcome::Failed)
        .count();
    if failed > 0 {
        warn!(failed, total = results.len(), "some groups did not complete");
    }
    log_sim_times(&results);

    finalize(cli, settings, run).await
}

/// Final aggregation, packaging and publish.
async fn finalize(cli: &Cli, settings: &Settings, run: &Run) -> Result<()> {
    let aggregator = Aggregator::new(run);
    let combined = if cli.no_merge {
        Vec::new()
    } else {
        aggregator.merge_all()?
    };
    aggregator.zip_combined()?;

    if cli.no_publish {
        info!("publish skipped");
        return Ok(());
    }
    match BlobPublisher::from_settings(settings)? {
        Some(publisher) if !combined.is_empty() => {
            publisher.publish(&combined, &run.metadata()).await?;
            run.mark_published_clean()?;
        }
        Some(_) => info!("nothing to publish"),
        None => info!("no blob store configured, publish skipped"),
    }
    Ok(())
}

/// Fetch fires and perimeters, either from the live feeds or a staged
/// directory of GeoJSON files.
async fn discover_fires(
    settings: &Settings,
    cache: &HttpCache,
    download_dir: &Path,
    staged_dir: Option<&Path>,
) -> Result<(Vec<Vec<FireFeature>>, Vec<FireFeature>)> {
    let mut fire_lists = Vec::new();
    let mut perimeters = Vec::new();

    if let Some(dir) = staged_dir {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "geojson"))
            .collect();
        paths.sort();
        for path in paths {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let features = parse_fire_geojson(&text, &path.display().to_string())?;
            fire_lists.push(features);
        }
    } else {
        match FireSourceRegistry::active_fires(None)
            .get_fires(cache, download_dir)
            .await
        {
            Ok(features) => fire_lists.push(features),
            Err(SourceError::Exhausted(_)) => warn!("no active fires from any source"),
            Err(e) => return Err(e.into()),
        }
        match FireSourceRegistry::perimeters(None)
            .get_fires(cache, download_dir)
            .await
        {
            Ok(features) => perimeters = features,
            Err(SourceError::Exhausted(_)) => warn!("no perimeters from any source"),
            Err(e) => return Err(e.into()),
        }
    }

    let in_bounds = |f: &FireFeature| match f.geometry.centroid() {
        Some(c) => settings.in_bounds(c.y(), c.x()),
        None => false,
    };
    for list in fire_lists.iter_mut() {
        list.retain(in_bounds);
    }
    let perimeter_cutoff = Utc::now() - ChronoDuration::days(settings.perimeter_keep_days);
    perimeters.retain(|p| in_bounds(p) && p.datetime.map_or(true, |d| d >= perimeter_cutoff));

    Ok((fire_lists, perimeters))
}

/// Prepare every group's simulation folder; groups that cannot be prepared
/// are logged and dropped rather than failing the run.
async fn prepare_groups(
    settings: &Settings,
    run: &Run,
    cache: &HttpCache,
    zones: &[firestarr_geo::zones::ZoneRaster],
    groups: Vec<FireGroup>,
) -> Result<Vec<SimTask>> {
    let finder = tzf_rs::DefaultFinder::new();
    let ensemble = match &settings.spotwx_api_key {
        Some(key) => {
            let limiter = RateLimiter::new(
                &run.data_dir().join("spotwx.limit"),
                settings.spotwx_api_limit,
                Duration::from_secs(60),
            );
            Some(EnsembleSource::new(&settings.spotwx_api_url, key, limiter))
        }
        None => None,
    };
    let dailies_by_day = fetch_station_dailies(cache, &run.data_dir()).await;

    let progress = ProgressBar::new(groups.len() as u64).with_style(
        ProgressStyle::with_template("preparing {pos}/{len} {msg}").expect("static template"),
    );
    let mut tasks = Vec::new();
    for group in groups {
        progress.set_message(group.name.clone());
        let dir = run.group_dir(&group.name);
        match prepare_group(settings, cache, &finder, ensemble.as_ref(), &dailies_by_day, zones, &group, &dir, run)
            .await
        {
            Ok(true) => tasks.push(SimTask {
                fire_name: group.name.clone(),
                dir,
                priority: group.priority,
                region_id: group.region_id.clone(),
                duration_days: group.duration_days,
                area_ha: group.area_ha,
            }),
            Ok(false) => {}
            Err(e) => warn!(fire = %group.name, error = %e, "group preparation failed"),
        }
        progress.inc(1);
    }
    progress.finish_and_clear();
    Ok(tasks)
}

async fn fetch_station_dailies(
    cache: &HttpCache,
    download_dir: &Path,
) -> Vec<Vec<firestarr_sources::types::StationDaily>> {
    let today = Utc::now().date_naive();
    let mut by_day = Vec::new();
    for age in 0..4i64 {
        let date = today - ChronoDuration::days(age);
        match wx::get_station_dailies(cache, download_dir, wx::DEFAULT_CWFIS_URL, date).await {
            Ok(dailies) => by_day.push(dailies),
            Err(e) => {
                warn!(date = %date, error = %e, "station report unavailable");
                by_day.push(Vec::new());
            }
        }
    }
    by_day
}

#[allow(clippy::too_many_arguments)]
async fn prepare_group(
    settings: &Settings,
    cache: &HttpCache,
    finder: &tzf_rs::DefaultFinder,
    ensemble: Option<&EnsembleSource>,
    dailies_by_day: &[Vec<firestarr_sources::types::StationDaily>],
    zones: &[firestarr_geo::zones::ZoneRaster],
    group: &FireGroup,
    dir: &Path,
    run: &Run,
) -> Result<bool> {
    // resumed groups that are already prepared keep their folder untouched
    if prepare::read_spec(dir, &group.name).is_ok() {
        info!(fire = %group.name, "already prepared");
        return Ok(true);
    }

    let Some(ensemble) = ensemble else {
        bail!("SPOTWX_API_KEY is required to prepare simulations");
    };
    let utc_offset = prepare::lst_offset_hours(finder, group.lat, group.lon)?;
    let (station, _distance_km) = prepare::select_station(dailies_by_day, group.lat, group.lon)?;

    let model = ensemble
        .get_geps(cache, &run.data_dir(), group.lat, group.lon)
        .await?;
    if !wx::run_is_current(model.issued, Utc::now(), MODEL_MAX_AGE_HOURS) {
        warn!(fire = %group.name, issued = %model.issued, "ensemble run is stale");
    }
    run.record_model_run(model.issued)?;
    let observed = load_staged_observations(&run.data_dir(), group.lat, group.lon)?;
    let scenarios = prepare::build_scenarios(observed.as_ref(), &[model]);
    let stream_end = scenarios
        .iter()
        .filter_map(|s| s.rows.last())
        .map(|r| r.datetime)
        .max()
        .ok_or_else(|| anyhow!("no forecast rows for {}", group.name))?;

    let startup = Startup {
        ffmc: station.ffmc,
        dmc: station.dmc,
        dc: station.dc,
        apcp_prev: 0.0,
    };
    let latest_obs = observed
        .as_ref()
        .and_then(|o| o.rows.last())
        .map(|r| r.datetime);
    let has_perimeter = matches!(
        group.geometry,
        Geometry::Polygon(_) | Geometry::MultiPolygon(_)
    );
    let spec = prepare::build_spec(
        group,
        &station,
        startup.apcp_prev,
        utc_offset,
        latest_obs,
        Utc::now().date_naive(),
        stream_end,
        has_perimeter,
    )?;
    let indexed = prepare::index_scenarios(scenarios, startup)?;
    prepare::write_group_files(group, dir, &spec, &indexed, &settings.sim_binary)?;
    write_point_file(dir, group)?;

    if has_perimeter {
        let zone = firestarr_geo::zones::find_best_raster(zones, group.lon)
            .map_err(|e| anyhow!(e))?;
        prepare::rasterize_ignition(
            &group.geometry,
            &zone.path,
            &dir.join(format!("{}.tif", group.name)),
        )?;
    }
    Ok(true)
}

/// Hourly observations staged as `obs_<lat>_<lon>.csv` next to the run data.
fn load_staged_observations(
    data_dir: &Path,
    lat: f64,
    lon: f64,
) -> Result<Option<firestarr_sources::types::WeatherStream>> {
    let path = data_dir.join(format!(
        "obs_{:.2}_{:.2}.csv",
        (lat * 100.0).round() / 100.0,
        (lon * 100.0).round() / 100.0
    ));
    if !path.is_file() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&path)?;
    Ok(Some(wx::parse_observed_csv(&text)?))
}

/// Summarize simulator wall time over the groups that actually ran.
fn log_sim_times(results: &[SimResult]) {
    let times: Vec<f64> = results
        .iter()
        .filter(|r| r.outcome != TaskOutcome::Skipped)
        .map(|r| r.sim_time.as_secs_f64())
        .collect();
    if times.is_empty() {
        return;
    }
    let total: f64 = times.iter().sum();
    let min = times.iter().copied().fold(f64::INFINITY, f64::min);
    let max = times.iter().copied().fold(0.0_f64, f64::max);
    info!(
        groups = times.len(),
        total_s = total.round(),
        min_s = min.round(),
        max_s = max.round(),
        "simulation time"
    );
}

/// Persist the reconciled group set, one feature per group.
fn save_groups_geojson(path: &Path, groups: &[FireGroup]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let features = groups
        .iter()
        .map(|g| {
            let mut properties = serde_json::Map::new();
            properties.insert("name".to_string(), g.name.clone().into());
            properties.insert("status".to_string(), g.status.to_string().into());
            properties.insert("area_ha".to_string(), g.area_ha.into());
            properties.insert("region".to_string(), g.region_id.clone().into());
            properties.insert("priority".to_string(), g.priority.into());
            properties.insert("duration".to_string(), g.duration_days.into());
            geojson::Feature {
                bbox: None,
                geometry: Some(geojson::Geometry::new(geojson::Value::from(&g.geometry))),
                id: None,
                properties: Some(properties),
                foreign_members: None,
            }
        })
        .collect();
    let collection = geojson::FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    };
    std::fs::write(path, geojson::GeoJson::FeatureCollection(collection).to_string())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// The group centroid as a standalone GeoJSON point, for inspection.
fn write_point_file(dir: &Path, group: &FireGroup) -> Result<()> {
    let mut properties = serde_json::Map::new();
    properties.insert("name".to_string(), group.name.clone().into());
    properties.insert("area_ha".to_string(), group.area_ha.into());
    properties.insert("status".to_string(), group.status.to_string().into());
    let feature = geojson::Feature {
        bbox: None,
        geometry: Some(geojson::Geometry::new(geojson::Value::Point(vec![
            group.lon, group.lat,
        ]))),
        id: None,
        properties: Some(properties),
        foreign_members: None,
    };
    let path = dir.join(format!("{}_point.geojson", group.name));
    std::fs::write(&path, geojson::GeoJson::Feature(feature).to_string())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
        let cli = Cli::parse_from([
            "firestarr",
            "--resume",
            "--no-publish",
            "--data-dir",
            "/tmp/fs",
            "/tmp/fires",
            "7",
        ]);
        assert!(cli.resume);
        assert!(cli.no_publish);
        assert_eq!(cli.target.as_deref(), Some(Path::new("/tmp/fires")));
        assert_eq!(cli.max_days, Some(7));
    }

    #[test]
    fn test_resolve_run_creates_under_data_dir() {
        let base = tempfile::tempdir().unwrap();
        let cli = Cli::parse_from([
            "firestarr",
            "--data-dir",
            base.path().to_str().unwrap(),
        ]);
        let (run, staged) = resolve_run(&cli, 14).unwrap();
        assert!(staged.is_none());
        assert!(run.dir.starts_with(base.path()));
        assert!(run.id.starts_with("m3_"));
    }

    #[test]
    fn test_resolve_run_reopens_run_dir() {
        let base = tempfile::tempdir().unwrap();
        let created = Run::create(base.path(), "m3", 14).unwrap();
        let cli = Cli::parse_from([
            "firestarr",
            "--data-dir",
            base.path().to_str().unwrap(),
            created.dir.to_str().unwrap(),
        ]);
        let (run, staged) = resolve_run(&cli, 14).unwrap();
        assert!(staged.is_none());
        assert_eq!(run.id, created.id);
    }

    #[test]
    fn test_resolve_run_staged_dir() {
        let base = tempfile::tempdir().unwrap();
        let fires = base.path().join("june_fires");
        std::fs::create_dir_all(&fires).unwrap();
        let cli = Cli::parse_from([
            "firestarr",
            "--data-dir",
            base.path().to_str().unwrap(),
            fires.to_str().unwrap(),
        ]);
        let (run, staged) = resolve_run(&cli, 14).unwrap();
        assert_eq!(staged.as_deref(), Some(fires.as_path()));
        assert!(run.id.starts_with("june_fires_"));
    }
}
