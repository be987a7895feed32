//! Active fire and perimeter sources.
//!
//! The national feed (CIFFC WFS) is authoritative; the DIP ArcGIS mirror
//! and any locally staged GeoJSON act as fallbacks, tried in order with the
//! static fallback last. Perimeters come from the M3 hotspot service with
//! the same fallback pattern.

use crate::net::HttpCache;
use crate::types::{FireFeature, FireStatus};
use crate::{Result, SourceError};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value as JsonValue;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const DEFAULT_CIFFC_URL: &str = "https://ciffc.net/geoserver/wfs?service=WFS&version=2.0.0\
    &request=GetFeature&typename=ciffc:ytd_fires&outputFormat=application/json";
pub const DEFAULT_DIP_URL: &str = "https://services.arcgis.com/XjsbIhnEHvSHZYSz/arcgis/rest/services\
    /Active_Wildfires/FeatureServer/0/query?where=1%3D1&outFields=*&f=geojson";
pub const DEFAULT_M3_URL: &str = "https://cwfis.cfs.nrcan.gc.ca/geoserver/public/wfs?service=WFS\
    &version=2.0.0&request=GetFeature&typename=public:m3_polygons_current&outputFormat=application/json";

/// Where a set of fire features can come from.
pub enum FireSource {
    /// A GeoJSON feed fetched over HTTP.
    Feed { name: &'static str, url: String },
    /// A GeoJSON file already on disk, the fallback of last resort.
    Staged { name: &'static str, path: PathBuf },
}

impl FireSource {
    pub fn name(&self) -> &'static str {
        match self {
            FireSource::Feed { name, .. } | FireSource::Staged { name, .. } => name,
        }
    }

    async fn fetch(&self, cache: &HttpCache, download_dir: &Path) -> Result<Vec<FireFeature>> {
        let text = match self {
            FireSource::Feed { name, url } => {
                let path = download_dir.join(format!("{name}.json"));
                cache
                    .get_text(url, &path, false, Some(&crate::net::not_markup))
                    .await?
            }
            FireSource::Staged { path, .. } => fs::read_to_string(path)?,
        };
        parse_fire_geojson(&text, self.name())
    }
}

/// Ordered set of sources; the first that yields features wins.
pub struct FireSourceRegistry {
    sources: Vec<FireSource>,
}

impl FireSourceRegistry {
    /// Active-fire points: CIFFC, then DIP, then any staged file.
    pub fn active_fires(staged: Option<PathBuf>) -> FireSourceRegistry {
        let mut sources = vec![
            FireSource::Feed {
                name: "ciffc",
                url: DEFAULT_CIFFC_URL.to_string(),
            },
            FireSource::Feed {
                name: "dip",
                url: DEFAULT_DIP_URL.to_string(),
            },
        ];
        if let Some(path) = staged {
            sources.push(FireSource::Staged {
                name: "staged_fires",
                path,
            });
        }
        FireSourceRegistry { sources }
    }

    /// Perimeter polygons: the M3 service, then any staged file.
    pub fn perimeters(staged: Option<PathBuf>) -> FireSourceRegistry {
        let mut sources = vec![FireSource::Feed {
            name: "m3",
            url: DEFAULT_M3_URL.to_string(),
        }];
        if let Some(path) = staged {
            sources.push(FireSource::Staged {
                name: "staged_perimeters",
                path,
            });
        }
        FireSourceRegistry { sources }
    }

    pub fn with_sources(sources: Vec<FireSource>) -> FireSourceRegistry {
        FireSourceRegistry { sources }
    }

    pub async fn get_fires(
        &self,
        cache: &HttpCache,
        download_dir: &Path,
    ) -> Result<Vec<FireFeature>> {
        for source in &self.sources {
            match source.fetch(cache, download_dir).await {
                Ok(features) if !features.is_empty() => {
                    info!(source = source.name(), count = features.len(), "got fires");
                    return Ok(features);
                }
                Ok(_) => {
                    warn!(source = source.name(), "source returned no features");
                }
                Err(e) => {
                    warn!(source = source.name(), error = %e, "fire source failed");
                }
            }
        }
        Err(SourceError::Exhausted("fires"))
    }
}

/// Parse a GeoJSON feature collection of fires from any of the feeds.
///
/// The feeds disagree on property names, so each field is looked up under
/// every known alias. Features with unusable geometry are skipped with a
/// warning rather than failing the whole feed.
pub fn parse_fire_geojson(text: &str, context: &str) -> Result<Vec<FireFeature>> {
    let geojson: geojson::GeoJson = text.parse().map_err(|e: geojson::Error| {
        SourceError::Malformed {
            url: context.to_string(),
            message: e.to_string(),
        }
    })?;
    let collection = match geojson {
        geojson::GeoJson::FeatureCollection(fc) => fc,
        other => {
            return Err(SourceError::Malformed {
                url: context.to_string(),
                message: format!("expected FeatureCollection, got {other:?}"),
            })
        }
    };

    let mut features = Vec::with_capacity(collection.features.len());
    for (index, feature) in collection.features.into_iter().enumerate() {
        let Some(geometry) = feature.geometry else {
            warn!(context, index, "feature without geometry");
            continue;
        };
        let geometry = match geo::Geometry::<f64>::try_from(&geometry.value) {
            Ok(g) => g,
            Err(e) => {
                warn!(context, index, error = %e, "unusable geometry");
                continue;
            }
        };
        let props = feature.properties.unwrap_or_default();
        let guid = prop_string(
            &props,
            &["field_agency_fire_id", "FIRE_NUMBER", "firename", "uid", "guid", "id"],
        )
        .unwrap_or_else(|| format!("{context}_{index}"));
        let status = prop_string(
            &props,
            &[
                "field_stage_of_control_status",
                "FIRE_STATUS",
                "stage_of_control",
                "status",
            ],
        )
        .map(|s| FireStatus::parse(&s))
        .unwrap_or(FireStatus::Unknown);
        let area_ha = prop_f64(
            &props,
            &["field_fire_size", "FIRE_SIZE_HA", "CURRENT_SIZE", "area", "hcount"],
        );
        let datetime = prop_string(
            &props,
            &["field_status_date", "LAST_UPDATE", "lastdate", "datetime"],
        )
        .and_then(|s| parse_datetime(&s));

        features.push(FireFeature {
            guid,
            status,
            area_ha,
            geometry,
            datetime,
        });
    }
    Ok(features)
}

fn prop_string(props: &serde_json::Map<String, JsonValue>, keys: &[&str]) -> Option<String> {
    for key in keys {
        match props.get(*key) {
            Some(JsonValue::String(s)) if !s.trim().is_empty() => return Some(s.clone()),
            Some(JsonValue::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

fn prop_f64(props: &serde_json::Map<String, JsonValue>, keys: &[&str]) -> Option<f64> {
    for key in keys {
        match props.get(*key) {
            Some(JsonValue::Number(n)) => return n.as_f64(),
            Some(JsonValue::String(s)) => {
                if let Ok(v) = s.trim().parse::<f64>() {
                    return Some(v);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // epoch milliseconds, the ArcGIS convention
    if let Ok(ms) = s.parse::<i64>() {
        return Utc.timestamp_millis_opt(ms).single();
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y%m%d%H%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&dt));
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0)?));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const CIFFC_SAMPLE: &str = r#"{
        "type": "FeatureCollection",
        "features": [
            {
                "type": "Feature",
                "geometry": {"type": "Point", "coordinates": [-89.024, 52.01]},
                "properties": {
                    "field_agency_fire_id": "RED034",
                    "field_stage_of_control_status": "OC",
                    "field_fire_size": 1250.5,
                    "field_status_date": "2024-06-15 08:30:00"
                }
            },
            {
                "type": "Feature",
                "geometry": {"type": "Point", "coordinates": [-95.5, 54.2]},
                "properties": {
                    "field_agency_fire_id": "WIN002",
                    "field_stage_of_control_status": "mystery",
                    "field_fire_size": "15"
                }
            }
        ]
    }"#;

    #[test]
    fn test_parse_ciffc_sample() {
        let fires = parse_fire_geojson(CIFFC_SAMPLE, "test").unwrap();
        assert_eq!(fires.len(), 2);
        assert_eq!(fires[0].guid, "RED034");
        assert_eq!(fires[0].status, FireStatus::OutOfControl);
        assert_eq!(fires[0].area_ha, Some(1250.5));
        assert!(fires[0].datetime.is_some());
        // unrecognized status falls back to worst rank
        assert_eq!(fires[1].status, FireStatus::Unknown);
        assert_eq!(fires[1].area_ha, Some(15.0));
    }

    #[test]
    fn test_parse_polygon_perimeter() {
        let text = r#"{
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "geometry": {
                    "type": "Polygon",
                    "coordinates": [[[-89.0, 52.0], [-88.9, 52.0], [-88.9, 52.1], [-89.0, 52.0]]]
                },
                "properties": {"uid": "m3_771", "lastdate": "2024-06-14"}
            }]
        }"#;
        let fires = parse_fire_geojson(text, "test").unwrap();
        assert_eq!(fires.len(), 1);
        assert_eq!(fires[0].guid, "m3_771");
        assert!(matches!(fires[0].geometry, geo::Geometry::Polygon(_)));
    }

    #[test]
    fn test_feature_without_geometry_skipped() {
        let text = r#"{
            "type": "FeatureCollection",
            "features": [
                {"type": "Feature", "geometry": null, "properties": {"id": "x"}},
                {
                    "type": "Feature",
                    "geometry": {"type": "Point", "coordinates": [-100.0, 55.0]},
                    "properties": {"id": "y"}
                }
            ]
        }"#;
        let fires = parse_fire_geojson(text, "test").unwrap();
        assert_eq!(fires.len(), 1);
        assert_eq!(fires[0].guid, "y");
    }

    #[test]
    fn test_non_collection_rejected() {
        assert!(parse_fire_geojson(
            r#"{"type": "Point", "coordinates": [0, 0]}"#,
            "test"
        )
        .is_err());
    }

    #[test]
    fn test_epoch_millis_datetime() {
        let dt = parse_datetime("1718400000000").unwrap();
        assert_eq!(dt.timestamp(), 1_718_400_000);
    }
}
