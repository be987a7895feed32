//! Shared shapes for what the sources return.

use crate::{Result, SourceError};
use chrono::{DateTime, NaiveDate, Utc};
use firestarr_fwi::HourlyWeather;
use geo::Geometry;
use serde::{Deserialize, Serialize};

/// Control status of an active fire, ordered from best to worst.
///
/// Unknown ranks worst so a fire with conflicting reports is treated as the
/// most severe interpretation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FireStatus {
    Out,
    UnderControl,
    BeingHeld,
    OutOfControl,
    Unknown,
}

impl FireStatus {
    /// Severity rank; higher is worse.
    pub fn rank(&self) -> u8 {
        match self {
            FireStatus::Out => 0,
            FireStatus::UnderControl => 1,
            FireStatus::BeingHeld => 2,
            FireStatus::OutOfControl => 3,
            FireStatus::Unknown => 4,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            FireStatus::Out => "OUT",
            FireStatus::UnderControl => "UC",
            FireStatus::BeingHeld => "BH",
            FireStatus::OutOfControl => "OC",
            FireStatus::Unknown => "UNK",
        }
    }

    /// Parse agency status strings; anything unrecognized is Unknown.
    pub fn parse(s: &str) -> FireStatus {
        let normalized = s.trim().to_ascii_uppercase();
        match normalized.as_str() {
            "OUT" | "EX" | "EXTINGUISHED" => FireStatus::Out,
            "UC" | "UNDER CONTROL" | "UNDER_CONTROL" => FireStatus::UnderControl,
            "BH" | "BEING HELD" | "BEING_HELD" | "HOLDING" => FireStatus::BeingHeld,
            "OC" | "OUT OF CONTROL" | "OUT_OF_CONTROL" | "ACTIVE" => FireStatus::OutOfControl,
            _ => FireStatus::Unknown,
        }
    }
}

impl std::fmt::Display for FireStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// One fire observation from a source: either a point with a reported size
/// or a perimeter polygon.
#[derive(Debug, Clone)]
pub struct FireFeature {
    /// Source-scoped identifier, unique within one fetch.
    pub guid: String,
    pub status: FireStatus,
    /// Reported size in hectares, when the source carries one.
    pub area_ha: Option<f64>,
    /// Geometry in lon/lat (WGS84).
    pub geometry: Geometry<f64>,
    /// When the observation was made, if known.
    pub datetime: Option<DateTime<Utc>>,
}

/// One ensemble member (or observation series) of hourly weather.
#[derive(Debug, Clone, PartialEq)]
pub struct WeatherStream {
    pub model: String,
    pub member: u32,
    pub rows: Vec<HourlyWeather>,
}

/// A complete model run: all members issued at the same time for one point.
#[derive(Debug, Clone)]
pub struct ModelRun {
    pub model: String,
    pub issued: DateTime<Utc>,
    /// Rounded coordinates the run was extracted for.
    pub lat: f64,
    pub lon: f64,
    pub members: Vec<WeatherStream>,
}

/// Daily index observations reported by a weather station.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StationDaily {
    pub date: NaiveDate,
    pub lat: f64,
    pub lon: f64,
    pub ffmc: f64,
    pub dmc: f64,
    pub dc: f64,
}

/// Verify a delimited header carries every required column.
pub fn require_columns(headers: &[&str], required: &[&str], context: &str) -> Result<()> {
    for column in required {
        if !headers.iter().any(|h| h.eq_ignore_ascii_case(column)) {
            return Err(SourceError::MissingColumn {
                column: (*column).to_string(),
                context: context.to_string(),
            });
        }
    }
    Ok(())
}

/// Round coordinates the way the weather API keys its extractions.
pub fn round_coord(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
