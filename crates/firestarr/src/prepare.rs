//! Per-group simulation input preparation.
//!
//! Takes one reconciled fire group and produces everything the external
//! simulator needs in the group directory: the weather CSV with one
//! scenario per spliced stream, the spec GeoJSON, an ignition raster when
//! the group has a perimeter, and an executable `sim.sh`.

use crate::reconcile::FireGroup;
use anyhow::{anyhow, bail, Context, Result};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use firestarr_fwi::{calculate_stream, stream::retain_noon_days, FwiRow, Startup};
use firestarr_geo::raster::{PixelTransform, Raster};
use firestarr_geo::{geotiff, project_geometry, Crs};
use firestarr_sources::types::{ModelRun, StationDaily, WeatherStream};
use geo::Geometry;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Offsets the simulator can be asked to emit, in days from start.
pub const OUTPUT_DAY_OFFSETS: [u32; 5] = [1, 2, 3, 7, 14];
/// How many days back station startup codes stay usable.
const STATION_LOOKBACK_DAYS: usize = 3;
const STATION_DISTANCE_WARN_KM: f64 = 100.0;
/// Padding around the ignition geometry in the rasterized window, meters.
const IGNITION_PAD_M: f64 = 1000.0;

/// The resolved simulation spec, persisted as the GeoJSON properties so a
/// resumed run can reconstruct expectations without recomputing anything.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimSpec {
    pub fire_name: String,
    pub lat: f64,
    pub lon: f64,
    pub start_time: NaiveDateTime,
    pub utc_offset_hours: i32,
    pub ffmc_old: f64,
    pub dmc_old: f64,
    pub dc_old: f64,
    pub apcp_prev: f64,
    pub duration_days: u32,
    pub offsets: Vec<u32>,
    pub wx_file: String,
    pub perim_file: Option<String>,
    /// Dates the simulator will write `probability_<date>.tif` for.
    pub for_dates: Vec<NaiveDate>,
}

impl SimSpec {
    pub fn expected_outputs(&self) -> Vec<String> {
        self.for_dates
            .iter()
            .map(|d| format!("probability_{}.tif", d.format("%Y-%m-%d")))
            .collect()
    }
}

/// One weather scenario fed to the simulator.
#[derive(Debug, Clone, PartialEq)]
pub struct Scenario {
    pub model: String,
    pub id: String,
    pub rows: Vec<firestarr_fwi::HourlyWeather>,
}

/// Resolve the group's DST-free LST offset from UTC, in whole hours.
///
/// The simulator reads naive local times; a half-hour zone would shift its
/// noon alignment, so non-integer offsets are fatal for the group.
pub fn lst_offset_hours(finder: &tzf_rs::DefaultFinder, lat: f64, lon: f64) -> Result<i32> {
    let zone_name = finder.get_tz_name(lon, lat);
    if zone_name.is_empty() {
        bail!("no timezone found for ({lat}, {lon})");
    }
    let tz: chrono_tz::Tz = zone_name
        .parse()
        .map_err(|e| anyhow!("unknown timezone {zone_name}: {e}"))?;
    use chrono::TimeZone;
    use chrono_tz::OffsetComponents;
    let offset = tz
        .offset_from_utc_datetime(&chrono::Utc::now().naive_utc())
        .base_utc_offset();
    let seconds = offset.num_seconds();
    if seconds % 3600 != 0 {
        bail!("timezone {zone_name} has non-integer LST offset ({seconds} s)");
    }
    Ok((seconds / 3600) as i32)
}

/// Pick the startup station: newest day first, nearest station with all
/// three codes present.
///
/// `dailies_by_day[0]` is today, `[1]` yesterday, and so on.
pub fn select_station(
    dailies_by_day: &[Vec<StationDaily>],
    lat: f64,
    lon: f64,
) -> Result<(StationDaily, f64)> {
    for (age, dailies) in dailies_by_day
        .iter()
        .take(STATION_LOOKBACK_DAYS + 1)
        .enumerate()
    {
        let best = dailies
            .iter()
            .filter(|s| s.ffmc.is_finite() && s.dmc.is_finite() && s.dc.is_finite())
            .map(|s| (*s, haversine_km(lat, lon, s.lat, s.lon)))
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        if let Some((station, distance_km)) = best {
            if distance_km > STATION_DISTANCE_WARN_KM {
                warn!(
                    distance_km = distance_km.round(),
                    age_days = age,
                    "startup station is far from the fire"
                );
            }
            return Ok((station, distance_km));
        }
    }
    bail!("no station with startup codes within {STATION_LOOKBACK_DAYS} days")
}

pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let (dphi, dlam) = ((lat2 - lat1).to_radians(), (lon2 - lon1).to_radians());
    let a = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlam / 2.0).sin().powi(2);
    2.0 * 6371.0 * a.sqrt().asin()
}

/// Build the scenario set: splice shorter models onto longer ones, then
/// prepend observations onto every forecast stream.
///
/// Forecast rows at or before the last observed hour are dropped first, so
/// a splice point is always the observation tail. Names keep provenance:
/// `obs×geps` with id `0×12` is member 12 of GEPS behind the observed hours.
pub fn build_scenarios(observed: Option<&WeatherStream>, models: &[ModelRun]) -> Vec<Scenario> {
    let obs_end = observed.and_then(|o| o.rows.last()).map(|r| r.datetime);

    let mut forecast: Vec<Scenario> = Vec::new();
    for run in models {
        for member in &run.members {
            let rows: Vec<_> = member
                .rows
                .iter()
                .filter(|r| obs_end.map(|end| r.datetime > end).unwrap_or(true))
                .copied()
                .collect();
            if !rows.is_empty() {
                forecast.push(Scenario {
                    model: run.model.clone(),
                    id: member.member.to_string(),
                    rows,
                });
            }
        }
    }

    // extend every shorter model with the tail of the next-longer model
    let mut horizons: Vec<(String, NaiveDateTime)> = forecast
        .iter()
        .map(|s| (s.model.clone(), s.rows.last().expect("non-empty").datetime))
        .fold(Vec::new(), |mut acc, (model, end)| {
            match acc.iter_mut().find(|(m, _)| *m == model) {
                Some((_, e)) => *e = (*e).max(end),
                None => acc.push((model, end)),
            }
            acc
        });
    horizons.sort_by_key(|(_, end)| *end);
    let mut spliced: Vec<Scenario> = forecast.clone();
    for window in horizons.windows(2) {
        let (short_model, short_end) = &window[0];
        let (long_model, _) = &window[1];
        for short in forecast.iter().filter(|s| &s.model == short_model) {
            for long in forecast.iter().filter(|s| &s.model == long_model) {
                let tail: Vec<_> = long
                    .rows
                    .iter()
                    .filter(|r| r.datetime > *short_end)
                    .copied()
                    .collect();
                if tail.is_empty() {
                    continue;
                }
                let mut rows = short.rows.clone();
                rows.extend(tail);
                spliced.push(Scenario {
                    model: format!("{short_model}×{long_model}"),
                    id: format!("{}×{}", short.id, long.id),
                    rows,
                });
            }
        }
    }

    match observed {
        None => spliced,
        Some(obs) => spliced
            .into_iter()
            .map(|s| {
                let mut rows = obs.rows.clone();
                rows.extend(s.rows.iter().copied());
                Scenario {
                    model: format!("{}×{}", obs.model, s.model),
                    id: format!("{}×{}", obs.member, s.id),
                    rows,
                }
            })
            .collect(),
    }
}

/// Simulation start: the hour after the later of the last observation and
/// local midnight today.
pub fn compute_start(latest_obs: Option<NaiveDateTime>, today: NaiveDate) -> NaiveDateTime {
    let midnight = today.and_hms_opt(0, 0, 0).expect("valid midnight");
    let base = latest_obs.map(|t| t.max(midnight)).unwrap_or(midnight);
    base + Duration::hours(1)
}

/// Valid output-day offsets for a duration.
pub fn offsets_for(duration_days: u32) -> Vec<u32> {
    OUTPUT_DAY_OFFSETS
        .iter()
        .copied()
        .filter(|d| *d >= 1 && *d <= duration_days)
        .collect()
}

/// A scenario with its computed indices, ready to serialize.
pub struct IndexedScenario {
    pub scenario_id: u32,
    pub model: String,
    pub id: String,
    pub rows: Vec<FwiRow>,
}

/// Run FWI through every scenario, anchor the startup hour, and drop days
/// without a local noon.
pub fn index_scenarios(
    mut scenarios: Vec<Scenario>,
    startup: Startup,
) -> Result<Vec<IndexedScenario>> {
    scenarios.sort_by(|a, b| a.model.cmp(&b.model).then(a.id.cmp(&b.id)));
    let mut out = Vec::with_capacity(scenarios.len());
    for (index, scenario) in scenarios.into_iter().enumerate() {
        let mut rows = calculate_stream(&scenario.rows, startup)
            .map_err(|e| anyhow!("scenario {}:{}: {e}", scenario.model, scenario.id))?;
        if let Some(first) = rows.first_mut() {
            // the startup hour carries the anchored codes, not one update step
            let startup = startup.sanitized();
            first.ffmc = startup.ffmc;
            first.dmc = startup.dmc;
            first.dc = startup.dc;
            first.isi = firestarr_fwi::isi(first.ffmc, first.weather.ws);
            first.bui = firestarr_fwi::bui(first.dmc, first.dc);
            first.fwi = firestarr_fwi::fwi(first.isi, first.bui);
        }
        retain_noon_days(&mut rows);
        if rows.is_empty() {
            warn!(
                model = %scenario.model,
                id = %scenario.id,
                "scenario empty after noon filter"
            );
            continue;
        }
        out.push(IndexedScenario {
            scenario_id: (index + 1) as u32,
            model: scenario.model,
            id: scenario.id,
            rows,
        });
    }
    if out.is_empty() {
        bail!("no usable weather scenarios");
    }
    Ok(out)
}

/// Write `<fire>_wx.csv` in the column order the simulator expects.
pub fn write_wx_csv(path: &Path, scenarios: &[IndexedScenario]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    writer.write_record([
        "Scenario", "Date", "PREC", "TEMP", "RH", "WS", "WD", "FFMC", "DMC", "DC", "ISI", "BUI",
        "FWI",
    ])?;
    for scenario in scenarios {
        for row in &scenario.rows {
            writer.write_record([
                scenario.scenario_id.to_string(),
                row.weather.datetime.format("%Y-%m-%d %H:%M:%S").to_string(),
                format!("{:.2}", row.weather.prec),
                format!("{:.2}", row.weather.temp),
                format!("{:.2}", row.weather.rh),
                format!("{:.2}", row.weather.ws),
                format!("{:.2}", row.weather.wd),
                format!("{:.1}", row.ffmc),
                format!("{:.1}", row.dmc),
                format!("{:.1}", row.dc),
                format!("{:.1}", row.isi),
                format!("{:.1}", row.bui),
                format!("{:.1}", row.fwi),
            ])?;
        }
    }
    writer.flush()?;
    Ok(())
}

/// Burn the group polygon as 1 onto a zero raster aligned to the zone fuels
/// raster's grid, windowed to the geometry plus padding.
pub fn rasterize_ignition(
    geometry: &Geometry<f64>,
    zone_raster: &Path,
    out_path: &Path,
) -> Result<()> {
    let header = geotiff::read_header(zone_raster).map_err(|e| anyhow!(e))?;
    let projected =
        project_geometry(geometry, Crs::Wgs84, header.crs).map_err(|e| anyhow!(e))?;
    let polygons = match &projected {
        Geometry::Polygon(p) => vec![p.clone()],
        Geometry::MultiPolygon(mp) => mp.0.clone(),
        other => bail!("cannot rasterize non-polygon ignition: {other:?}"),
    };

    use geo::BoundingRect;
    let rect = projected
        .bounding_rect()
        .ok_or_else(|| anyhow!("ignition geometry has no extent"))?;
    let t = header.transform;
    // window snapped to the reference grid
    let col0 = ((rect.min().x - IGNITION_PAD_M - t.origin_x) / t.pixel_width).floor();
    let col1 = ((rect.max().x + IGNITION_PAD_M - t.origin_x) / t.pixel_width).ceil();
    let row0 = ((t.origin_y - (rect.max().y + IGNITION_PAD_M)) / t.pixel_height).floor();
    let row1 = ((t.origin_y - (rect.min().y - IGNITION_PAD_M)) / t.pixel_height).ceil();
    let width = (col1 - col0).max(1.0) as usize;
    let height = (row1 - row0).max(1.0) as usize;
    let window = PixelTransform {
        origin_x: t.origin_x + col0 * t.pixel_width,
        origin_y: t.origin_y - row0 * t.pixel_height,
        pixel_width: t.pixel_width,
        pixel_height: t.pixel_height,
    };

    let mut raster = Raster::filled(width, height, 0.0, window, header.crs);
    for polygon in &polygons {
        raster.rasterize_polygon(polygon, 1.0);
    }
    geotiff::write_raster(out_path, &raster).map_err(|e| anyhow!(e))?;
    Ok(())
}

/// Materialize the spec GeoJSON, weather CSV pointer and `sim.sh`.
pub fn write_group_files(
    group: &FireGroup,
    dir: &Path,
    spec: &SimSpec,
    scenarios: &[IndexedScenario],
    sim_binary: &str,
) -> Result<()> {
    fs::create_dir_all(dir)?;
    write_wx_csv(&dir.join(&spec.wx_file), scenarios)?;
    write_spec_geojson(group, dir, spec)?;
    write_sim_script(dir, spec, sim_binary)?;
    info!(
        fire = %group.name,
        scenarios = scenarios.len(),
        start = %spec.start_time,
        "prepared group"
    );
    Ok(())
}

pub fn spec_path(dir: &Path, fire_name: &str) -> PathBuf {
    dir.join(format!("firestarr_{fire_name}.geojson"))
}

fn write_spec_geojson(group: &FireGroup, dir: &Path, spec: &SimSpec) -> Result<()> {
    let properties = match serde_json::to_value(spec)? {
        serde_json::Value::Object(map) => map,
        _ => unreachable!("spec serializes to an object"),
    };
    let feature = geojson::Feature {
        bbox: None,
        geometry: Some(geojson::Geometry::new(geojson::Value::from(&group.geometry))),
        id: None,
        properties: Some(properties),
        foreign_members: None,
    };
    let collection = geojson::FeatureCollection {
        bbox: None,
        features: vec![feature],
        foreign_members: None,
    };
    let path = spec_path(dir, &group.name);
    fs::write(&path, collection.to_string())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Read a previously written spec back, for resume.
pub fn read_spec(dir: &Path, fire_name: &str) -> Result<SimSpec> {
    let path = spec_path(dir, fire_name);
    let text = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let geojson: geojson::GeoJson = text.parse()?;
    let geojson::GeoJson::FeatureCollection(fc) = geojson else {
        bail!("spec is not a FeatureCollection: {}", path.display());
    };
    let feature = fc
        .features
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("empty spec: {}", path.display()))?;
    let properties = feature
        .properties
        .ok_or_else(|| anyhow!("spec without properties: {}", path.display()))?;
    Ok(serde_json::from_value(serde_json::Value::Object(
        properties,
    ))?)
}

fn write_sim_script(dir: &Path, spec: &SimSpec, sim_binary: &str) -> Result<()> {
    let offsets = spec
        .offsets
        .iter()
        .map(|o| o.to_string())
        .collect::<Vec<_>>()
        .join(",");
    let perim = spec
        .perim_file
        .as_ref()
        .map(|p| format!(" --perim {p}"))
        .unwrap_or_default();
    let script = format!(
        "#!/bin/bash\n\
         cd \"$(dirname \"$0\")\"\n\
         {sim_binary} . {date} {lat:.4} {lon:.4} {time} \
         --ffmc {ffmc:.1} --dmc {dmc:.1} --dc {dc:.1} --apcp_prev {apcp:.1} \
         --wx {wx} --output_date_offsets \"[{offsets}]\"{perim} --no-intensity -v\n",
        date = spec.start_time.format("%Y-%m-%d"),
        lat = spec.lat,
        lon = spec.lon,
        time = spec.start_time.format("%H:%M"),
        ffmc = spec.ffmc_old,
        dmc = spec.dmc_old,
        dc = spec.dc_old,
        apcp = spec.apcp_prev,
        wx = spec.wx_file,
    );
    let path = dir.join("sim.sh");
    let mut file = fs::File::create(&path)?;
    file.write_all(script.as_bytes())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

/// Assemble the full spec for a group from its inputs.
#[allow(clippy::too_many_arguments)]
pub fn build_spec(
    group: &FireGroup,
    startup: &StationDaily,
    apcp_prev: f64,
    utc_offset_hours: i32,
    latest_obs: Option<NaiveDateTime>,
    today: NaiveDate,
    stream_end: NaiveDateTime,
    has_perimeter: bool,
) -> Result<SimSpec> {
    let start_time = compute_start(latest_obs, today);
    if stream_end <= start_time {
        bail!(
            "weather ends at {stream_end} before simulation start {start_time}"
        );
    }
    let horizon_days = ((stream_end - start_time).num_hours() / 24) as u32;
    let duration = group.duration_days.min(horizon_days).max(1);
    let offsets = offsets_for(duration);
    let for_dates = offsets
        .iter()
        .map(|o| start_time.date() + Duration::days(i64::from(*o)))
        .collect();
    Ok(SimSpec {
        fire_name: group.name.clone(),
        lat: group.lat,
        lon: group.lon,
        start_time,
        utc_offset_hours,
        ffmc_old: startup.ffmc,
        dmc_old: startup.dmc,
        dc_old: startup.dc,
        apcp_prev,
        duration_days: duration,
        offsets,
        wx_file: format!("{}_wx.csv", group.name),
        perim_file: has_perimeter.then(|| format!("{}.tif", group.name)),
        for_dates,
    })
}
