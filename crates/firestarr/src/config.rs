//! Run configuration from a key=value file and the environment.
//!
//! Environment variables override the file. Everything has a default except
//! the ensemble API key, which is required the moment a forecast is needed.

use anyhow::{bail, Context, Result};
use geo::{Contains, Point};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const DEFAULT_GROUP_DISTANCE_KM: f64 = 20.0;
pub const DEFAULT_MAX_DAYS: u32 = 14;
pub const DEFAULT_UNMATCHED_KEEP_DAYS: i64 = 1;
pub const DEFAULT_PERIMETER_KEEP_DAYS: i64 = 30;
pub const DEFAULT_SPOTWX_LIMIT: usize = 5;
pub const DEFAULT_RETRIES: u32 = 5;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Geographic area of interest; fires outside are ignored.
    pub bounds_lat_min: f64,
    pub bounds_lat_max: f64,
    pub bounds_lon_min: f64,
    pub bounds_lon_max: f64,
    /// Optional GeoJSON of subregions with ID/PRIORITY/DURATION fields.
    pub bounds_file: Option<PathBuf>,

    pub spotwx_api_key: Option<String>,
    pub spotwx_api_url: String,
    /// Requests per minute against the ensemble API.
    pub spotwx_api_limit: usize,

    /// Presence of all three selects the batch backend.
    pub batch_account_name: Option<String>,
    pub batch_account_key: Option<String>,
    pub storage_container: Option<String>,

    pub azure_url: Option<String>,
    pub azure_token: Option<String>,
    pub azure_container: Option<String>,
    pub geoserver_url: Option<String>,
    pub geoserver_credentials: Option<String>,

    /// Directory of per-zone fuels rasters.
    pub raster_dir: PathBuf,
    /// External simulator binary invoked from sim.sh.
    pub sim_binary: String,

    pub group_distance_km: f64,
    pub max_days: u32,
    pub unmatched_keep_days: i64,
    pub perimeter_keep_days: i64,
    pub retries: u32,
    /// Local simulation pool size; 0 means `max(1, cpus / 2)`.
    pub concurrent_sims: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            bounds_lat_min: 41.0,
            bounds_lat_max: 84.0,
            bounds_lon_min: -141.0,
            bounds_lon_max: -52.0,
            bounds_file: None,
            spotwx_api_key: None,
            spotwx_api_url: "https://spotwx.io/api/v1".to_string(),
            spotwx_api_limit: DEFAULT_SPOTWX_LIMIT,
            batch_account_name: None,
            batch_account_key: None,
            storage_container: None,
            azure_url: None,
            azure_token: None,
            azure_container: None,
            geoserver_url: None,
            geoserver_credentials: None,
            raster_dir: PathBuf::from("/appl/data/generated/grid/default"),
            sim_binary: "tbd".to_string(),
            group_distance_km: DEFAULT_GROUP_DISTANCE_KM,
            max_days: DEFAULT_MAX_DAYS,
            unmatched_keep_days: DEFAULT_UNMATCHED_KEEP_DAYS,
            perimeter_keep_days: DEFAULT_PERIMETER_KEEP_DAYS,
            retries: DEFAULT_RETRIES,
            concurrent_sims: 0,
        }
    }
}

impl Settings {
    /// Load from `path` if it exists, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Settings> {
        let mut values = HashMap::new();
        if let Some(path) = path {
            if path.exists() {
                parse_config_file(path, &mut values)?;
            }
        }
        for (key, value) in std::env::vars() {
            values.insert(key, value);
        }
        Settings::from_values(&values)
    }

    fn from_values(values: &HashMap<String, String>) -> Result<Settings> {
        let mut s = Settings::default();
        let get = |key: &str| values.get(key).map(String::as_str);
        let num = |key: &str, current: f64| -> Result<f64> {
            match get(key) {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .with_context(|| format!("invalid number for {key}: {raw:?}")),
                None => Ok(current),
            }
        };

        s.bounds_lat_min = num("BOUNDS_LATITUDE_MIN", s.bounds_lat_min)?;
        s.bounds_lat_max = num("BOUNDS_LATITUDE_MAX", s.bounds_lat_max)?;
        s.bounds_lon_min = num("BOUNDS_LONGITUDE_MIN", s.bounds_lon_min)?;
        s.bounds_lon_max = num("BOUNDS_LONGITUDE_MAX", s.bounds_lon_max)?;
        if s.bounds_lat_min >= s.bounds_lat_max || s.bounds_lon_min >= s.bounds_lon_max {
            bail!("invalid bounds: min must be below max");
        }
        s.bounds_file = get("BOUNDS_FILE").map(PathBuf::from);

        s.spotwx_api_key = get("SPOTWX_API_KEY").map(str::to_string);
        if let Some(url) = get("SPOTWX_API_URL") {
            s.spotwx_api_url = url.to_string();
        }
        if let Some(raw) = get("SPOTWX_API_LIMIT") {
            s.spotwx_api_limit = raw
                .trim()
                .parse()
                .with_context(|| format!("invalid SPOTWX_API_LIMIT: {raw:?}"))?;
        }

        s.batch_account_name = get("BATCH_ACCOUNT_NAME").map(str::to_string);
        s.batch_account_key = get("BATCH_ACCOUNT_KEY").map(str::to_string);
        s.storage_container = get("STORAGE_CONTAINER").map(str::to_string);

        s.azure_url = get("AZURE_URL").map(str::to_string);
        s.azure_token = get("AZURE_TOKEN").map(str::to_string);
        s.azure_container = get("AZURE_CONTAINER").map(str::to_string);
        s.geoserver_url = get("GEOSERVER_URL").map(str::to_string);
        s.geoserver_credentials = get("GEOSERVER_CREDENTIALS").map(str::to_string);

        if let Some(dir) = get("RASTER_DIR") {
            s.raster_dir = PathBuf::from(dir);
        }
        if let Some(binary) = get("SIM_BINARY") {
            s.sim_binary = binary.to_string();
        }

        s.group_distance_km = num("GROUP_DISTANCE_KM", s.group_distance_km)?;
        if let Some(raw) = get("MAX_DAYS") {
            s.max_days = raw.trim().parse().context("invalid MAX_DAYS")?;
        }
        if let Some(raw) = get("UNMATCHED_KEEP_DAYS") {
            s.unmatched_keep_days = raw.trim().parse().context("invalid UNMATCHED_KEEP_DAYS")?;
        }
        if let Some(raw) = get("PERIMETER_KEEP_DAYS") {
            s.perimeter_keep_days = raw.trim().parse().context("invalid PERIMETER_KEEP_DAYS")?;
        }
        if let Some(raw) = get("CONCURRENT_SIMS") {
            s.concurrent_sims = raw.trim().parse().context("invalid CONCURRENT_SIMS")?;
        }
        Ok(s)
    }

    pub fn batch_configured(&self) -> bool {
        self.batch_account_name.is_some()
            && self.batch_account_key.is_some()
            && self.storage_container.is_some()
    }

    pub fn sim_pool_size(&self) -> usize {
        if self.concurrent_sims > 0 {
            self.concurrent_sims
        } else {
            (num_cpus() / 2).max(1)
        }
    }

    pub fn in_bounds(&self, lat: f64, lon: f64) -> bool {
        (self.bounds_lat_min..=self.bounds_lat_max).contains(&lat)
            && (self.bounds_lon_min..=self.bounds_lon_max).contains(&lon)
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn parse_config_file(path: &Path, values: &mut HashMap<String, String>) -> Result<()> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            debug!(line, "skipping malformed config line");
            continue;
        };
        values.insert(
            key.trim().to_string(),
            value.trim().trim_matches('"').to_string(),
        );
    }
    Ok(())
}

/// A prioritized subregion from the bounds file.
#[derive(Debug, Clone)]
pub struct BoundsRegion {
    pub id: String,
    pub priority: u32,
    pub duration_days: u32,
    pub polygon: geo::MultiPolygon<f64>,
}

impl BoundsRegion {
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        self.polygon.contains(&Point::new(lon, lat))
    }
}

/// Parse the bounds GeoJSON, sorted by ascending priority.
///
/// A missing file is a cross-run fatal since priorities silently defaulting
/// would reorder publishes.
pub fn load_bounds_regions(path: &Path, max_days: u32) -> Result<Vec<BoundsRegion>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read bounds file: {}", path.display()))?;
    let geojson: geojson::GeoJson = text
        .parse()
        .with_context(|| format!("Invalid GeoJSON in bounds file: {}", path.display()))?;
    let geojson::GeoJson::FeatureCollection(fc) = geojson else {
        bail!("bounds file is not a FeatureCollection: {}", path.display());
    };

    let mut regions = Vec::new();
    for feature in fc.features {
        let props = feature.properties.unwrap_or_default();
        let id = props
            .get("ID")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("region_{}", regions.len()));
        let priority = props
            .get("PRIORITY")
            .and_then(|v| v.as_u64())
            .unwrap_or(u32::MAX as u64) as u32;
        let duration_days = props
            .get("DURATION")
            .and_then(|v| v.as_u64())
            .map(|d| (d as u32).min(max_days))
            .unwrap_or(max_days);
        let Some(geometry) = feature.geometry else {
            continue;
        };
        let polygon = match geo::Geometry::<f64>::try_from(&geometry.value) {
            Ok(geo::Geometry::Polygon(p)) => geo::MultiPolygon(vec![p]),
            Ok(geo::Geometry::MultiPolygon(mp)) => mp,
            _ => bail!("bounds region {id} is not a polygon"),
        };
        regions.push(BoundsRegion {
            id,
            priority,
            duration_days,
            polygon,
        });
    }
    regions.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.id.cmp(&b.id)));
    Ok(regions)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_cover_canada() {
        let s = Settings::from_values(&HashMap::new()).unwrap();
        assert!(s.in_bounds(52.01, -89.024));
        assert!(!s.in_bounds(30.0, -89.0));
        assert_eq!(s.group_distance_km, 20.0);
        assert_eq!(s.unmatched_keep_days, 1);
    }

    #[test]
    fn test_overrides_and_validation() {
        let s = Settings::from_values(&values(&[
            ("BOUNDS_LATITUDE_MIN", "48"),
            ("BOUNDS_LATITUDE_MAX", "58"),
            ("SPOTWX_API_KEY", "k"),
            ("SPOTWX_API_LIMIT", "10"),
            ("CONCURRENT_SIMS", "4"),
        ]))
        .unwrap();
        assert_eq!(s.bounds_lat_min, 48.0);
        assert_eq!(s.spotwx_api_limit, 10);
        assert_eq!(s.sim_pool_size(), 4);

        let bad = Settings::from_values(&values(&[
            ("BOUNDS_LATITUDE_MIN", "60"),
            ("BOUNDS_LATITUDE_MAX", "50"),
        ]));
        assert!(bad.is_err());
    }

    #[test]
    fn test_config_file_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.ini");
        fs::write(
            &path,
            "# comment\nBOUNDS_LATITUDE_MIN = 45\nSPOTWX_API_KEY = \"secret\"\nnot a pair\n",
        )
        .unwrap();
        let mut values = HashMap::new();
        parse_config_file(&path, &mut values).unwrap();
        assert_eq!(values.get("BOUNDS_LATITUDE_MIN").unwrap(), "45");
        assert_eq!(values.get("SPOTWX_API_KEY").unwrap(), "secret");
    }

    #[test]
    fn test_batch_needs_all_three() {
        let partial = Settings::from_values(&values(&[("BATCH_ACCOUNT_NAME", "acct")])).unwrap();
        assert!(!partial.batch_configured());
        let full = Settings::from_values(&values(&[
            ("BATCH_ACCOUNT_NAME", "acct"),
            ("BATCH_ACCOUNT_KEY", "key"),
            ("STORAGE_CONTAINER", "container"),
        ]))
        .unwrap();
        assert!(full.batch_configured());
    }

    #[test]
    fn test_bounds_regions_sorted_by_priority() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bounds.geojson");
        fs::write(
            &path,
            r#"{"type":"FeatureCollection","features":[
                {"type":"Feature","properties":{"ID":"ON","PRIORITY":2,"DURATION":7},
                 "geometry":{"type":"Polygon","coordinates":[[[-95,48],[-80,48],[-80,57],[-95,57],[-95,48]]]}},
                {"type":"Feature","properties":{"ID":"MB","PRIORITY":1,"DURATION":3},
                 "geometry":{"type":"Polygon","coordinates":[[[-102,49],[-95,49],[-95,60],[-102,60],[-102,49]]]}}
            ]}"#,
        )
        .unwrap();
        let regions = load_bounds_regions(&path, 14).unwrap();
        assert_eq!(regions[0].id, "MB");
        assert_eq!(regions[0].duration_days, 3);
        assert!(regions[1].contains(52.0, -89.0));
        assert!(!regions[0].contains(52.0, -89.0));
    }
}
