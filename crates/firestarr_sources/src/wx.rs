//! Weather sources: ensemble forecasts, hourly observations and daily
//! station indices.
//!
//! The forecast API returns one CSV per extraction point with every
//! ensemble member interleaved and precipitation accumulated since the run
//! start. Parsing converts accumulation to hourly amounts by first
//! difference, clamped at zero since accumulation resets between output
//! intervals can otherwise go negative.

use crate::net::HttpCache;
use crate::ratelimit::RateLimiter;
use crate::types::{round_coord, require_columns, ModelRun, StationDaily, WeatherStream};
use crate::{Result, SourceError};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use firestarr_fwi::HourlyWeather;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// The ensemble forecast API.
pub struct EnsembleSource {
    base_url: String,
    api_key: String,
    limiter: RateLimiter,
}

impl EnsembleSource {
    pub fn new(base_url: &str, api_key: &str, limiter: RateLimiter) -> EnsembleSource {
        EnsembleSource {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            limiter,
        }
    }

    /// Fetch the current GEPS run for a point.
    ///
    /// Coordinates round to two decimals so nearby fires share one cached
    /// extraction.
    pub async fn get_geps(
        &self,
        cache: &HttpCache,
        download_dir: &Path,
        lat: f64,
        lon: f64,
    ) -> Result<ModelRun> {
        let (lat, lon) = (round_coord(lat), round_coord(lon));
        let url = format!(
            "{}/models?key={}&model=geps&lat={lat}&lon={lon}&tz=0&output=archive_csv",
            self.base_url, self.api_key
        );
        let path = download_dir.join(format!("geps_{lat}_{lon}.csv"));
        self.limiter.acquire().await?;
        let text = cache
            .get_text(&url, &path, false, Some(&crate::net::not_markup))
            .await?;
        let run = parse_ensemble_csv(&text, "geps", lat, lon)?;
        info!(
            lat,
            lon,
            members = run.members.len(),
            issued = %run.issued,
            "got ensemble run"
        );
        Ok(run)
    }
}

/// Whether a model run is recent enough to splice into a forecast.
pub fn run_is_current(issued: DateTime<Utc>, now: DateTime<Utc>, max_age_hours: i64) -> bool {
    now - issued <= Duration::hours(max_age_hours)
}

/// Parse an ensemble extraction CSV into per-member hourly streams.
///
/// Expects columns `MODEL, UTC_OFFSET, DATETIME, MEMBER, TMP, RH, WSPD,
/// WDIR, APCP` with APCP accumulated since run start. Any nonzero
/// UTC_OFFSET is fatal: downstream splicing assumes UTC throughout.
pub fn parse_ensemble_csv(text: &str, model: &str, lat: f64, lon: f64) -> Result<ModelRun> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());
    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.to_string())
        .collect();
    let header_refs: Vec<&str> = headers.iter().map(String::as_str).collect();
    require_columns(
        &header_refs,
        &["UTC_OFFSET", "DATETIME", "MEMBER", "TMP", "RH", "WSPD", "WDIR", "APCP"],
        model,
    )?;
    let col = |name: &str| {
        header_refs
            .iter()
            .position(|h| h.eq_ignore_ascii_case(name))
            .expect("required column present")
    };
    let (c_off, c_dt, c_member) = (col("UTC_OFFSET"), col("DATETIME"), col("MEMBER"));
    let (c_tmp, c_rh, c_ws, c_wd, c_apcp) =
        (col("TMP"), col("RH"), col("WSPD"), col("WDIR"), col("APCP"));

    let mut by_member: BTreeMap<u32, Vec<(NaiveDateTime, f64, f64, f64, f64, f64)>> =
        BTreeMap::new();
    for record in reader.records() {
        let record = record?;
        let field = |i: usize| -> Result<&str> {
            record.get(i).ok_or_else(|| SourceError::Malformed {
                url: model.to_string(),
                message: format!("short record at line {:?}", record.position()),
            })
        };
        let offset: i64 = field(c_off)?.parse().map_err(|_| SourceError::Malformed {
            url: model.to_string(),
            message: format!("bad UTC_OFFSET {:?}", field(c_off)),
        })?;
        if offset != 0 {
            return Err(SourceError::BadUtcOffset(offset));
        }
        let datetime = NaiveDateTime::parse_from_str(field(c_dt)?, DATETIME_FORMAT)
            .map_err(|e| SourceError::Malformed {
                url: model.to_string(),
                message: format!("bad DATETIME: {e}"),
            })?;
        let member: u32 = field(c_member)?.parse().unwrap_or(0);
        let parse_f = |i: usize| -> Result<f64> {
            let raw = field(i)?;
            if raw.is_empty() {
                return Ok(f64::NAN);
            }
            raw.parse().map_err(|_| SourceError::Malformed {
                url: model.to_string(),
                message: format!("bad numeric field {raw:?}"),
            })
        };
        by_member.entry(member).or_default().push((
            datetime,
            parse_f(c_tmp)?,
            parse_f(c_rh)?,
            parse_f(c_ws)?,
            parse_f(c_wd)?,
            parse_f(c_apcp)?,
        ));
    }

    if by_member.is_empty() {
        return Err(SourceError::Malformed {
            url: model.to_string(),
            message: "no data rows".to_string(),
        });
    }

    let mut members = Vec::with_capacity(by_member.len());
    let mut issued: Option<NaiveDateTime> = None;
    for (member, mut rows) in by_member {
        rows.sort_by_key(|r| r.0);
        issued = Some(match issued {
            Some(t) => t.min(rows[0].0),
            None => rows[0].0,
        });
        let mut prev_accum = 0.0;
        let hourly = rows
            .into_iter()
            .map(|(datetime, temp, rh, ws, wd, apcp)| {
                let prec = round2((apcp - prev_accum).max(0.0));
                if apcp.is_finite() {
                    prev_accum = apcp;
                }
                HourlyWeather {
                    datetime,
                    temp: round2(temp),
                    rh: round2(rh),
                    ws: round2(ws),
                    wd: round2(wd),
                    prec,
                }
            })
            .collect();
        members.push(WeatherStream {
            model: model.to_string(),
            member,
            rows: fill_hourly_gaps(hourly),
        });
    }

    Ok(ModelRun {
        model: model.to_string(),
        issued: Utc.from_utc_datetime(&issued.expect("members is non-empty")),
        lat,
        lon,
        members,
    })
}

/// Expand a stream to strict hourly cadence.
///
/// Forecast output widens to 3 h and 6 h steps at longer lead times; the
/// FWI loop needs every hour. Missing hours carry the previous row's
/// values, except precipitation: the accumulated amount already landed on
/// the reported hour, so filled hours get zero.
pub fn fill_hourly_gaps(rows: Vec<HourlyWeather>) -> Vec<HourlyWeather> {
    let mut out: Vec<HourlyWeather> = Vec::with_capacity(rows.len());
    for row in rows {
        if let Some(prev) = out.last().copied() {
            let mut t = prev.datetime + Duration::hours(1);
            while t < row.datetime {
                out.push(HourlyWeather {
                    datetime: t,
                    prec: 0.0,
                    ..prev
                });
                t += Duration::hours(1);
            }
        }
        out.push(row);
    }
    out
}

/// Parse hourly station observations.
///
/// Expects columns `DATETIME, TMP, RH, WSPD, WDIR, PCP` with precipitation
/// already per hour.
pub fn parse_observed_csv(text: &str) -> Result<WeatherStream> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());
    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();
    let header_refs: Vec<&str> = headers.iter().map(String::as_str).collect();
    require_columns(
        &header_refs,
        &["DATETIME", "TMP", "RH", "WSPD", "WDIR", "PCP"],
        "observed",
    )?;
    let col = |name: &str| {
        header_refs
            .iter()
            .position(|h| h.eq_ignore_ascii_case(name))
            .expect("required column present")
    };
    let (c_dt, c_tmp, c_rh, c_ws, c_wd, c_pcp) = (
        col("DATETIME"),
        col("TMP"),
        col("RH"),
        col("WSPD"),
        col("WDIR"),
        col("PCP"),
    );

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let get = |i: usize| record.get(i).unwrap_or("");
        let datetime = NaiveDateTime::parse_from_str(get(c_dt), DATETIME_FORMAT).map_err(|e| {
            SourceError::Malformed {
                url: "observed".to_string(),
                message: format!("bad DATETIME: {e}"),
            }
        })?;
        let num = |i: usize| get(i).parse::<f64>().unwrap_or(f64::NAN);
        rows.push(HourlyWeather {
            datetime,
            temp: num(c_tmp),
            rh: num(c_rh),
            ws: num(c_ws),
            wd: num(c_wd),
            prec: num(c_pcp).max(0.0),
        });
    }
    rows.sort_by_key(|r| r.datetime);
    Ok(WeatherStream {
        model: "obs".to_string(),
        member: 0,
        rows,
    })
}

/// Base URL for the national fire-weather download area.
pub const DEFAULT_CWFIS_URL: &str = "https://cwfis.cfs.nrcan.gc.ca/downloads";

/// Fetch the daily station index report for one date.
///
/// Reports for past dates never change, so a previously downloaded copy is
/// used without touching the network; today's report keeps updating.
pub async fn get_station_dailies(
    cache: &HttpCache,
    download_dir: &Path,
    base_url: &str,
    date: NaiveDate,
) -> Result<Vec<StationDaily>> {
    let ymd = date.format("%Y%m%d");
    let url = format!("{base_url}/fwi_obs/current/cwfis_fwi_{ymd}.csv");
    let path = download_dir.join(format!("cwfis_fwi_{ymd}.csv"));
    let keep_existing = date < Utc::now().date_naive();
    let text = cache
        .get_text(&url, &path, keep_existing, Some(&crate::net::not_markup))
        .await?;
    parse_station_csv(&text)
}

/// Parse daily station index reports.
///
/// Expects columns `DATE, LAT, LONG, FFMC, DMC, DC`.
pub fn parse_station_csv(text: &str) -> Result<Vec<StationDaily>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());
    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();
    let header_refs: Vec<&str> = headers.iter().map(String::as_str).collect();
    require_columns(
        &header_refs,
        &["DATE", "LAT", "LONG", "FFMC", "DMC", "DC"],
        "stations",
    )?;
    let col = |name: &str| {
        header_refs
            .iter()
            .position(|h| h.eq_ignore_ascii_case(name))
            .expect("required column present")
    };
    let (c_date, c_lat, c_lon) = (col("DATE"), col("LAT"), col("LONG"));
    let (c_ffmc, c_dmc, c_dc) = (col("FFMC"), col("DMC"), col("DC"));

    let mut out = Vec::new();
    for record in reader.records() {
        let record = record?;
        let get = |i: usize| record.get(i).unwrap_or("");
        let Ok(date) = NaiveDate::parse_from_str(get(c_date), "%Y-%m-%d") else {
            continue;
        };
        let num = |i: usize| get(i).parse::<f64>().unwrap_or(f64::NAN);
        out.push(StationDaily {
            date,
            lat: num(c_lat),
            lon: num(c_lon),
            ffmc: num(c_ffmc),
            dmc: num(c_dmc),
            dc: num(c_dc),
        });
    }
    Ok(out)
}

fn round2(v: f64) -> f64 {
    if v.is_finite() {
        (v * 100.0).round() / 100.0
    } else {
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENSEMBLE_SAMPLE: &str = "\
MODEL,UTC_OFFSET,DATETIME,MEMBER,TMP,RH,WSPD,WDIR,APCP
geps,0,2024-06-15 00:00:00,0,18.5,65,10.2,270,0.0
geps,0,2024-06-15 01:00:00,0,17.9,70,9.8,265,1.5
geps,0,2024-06-15 02:00:00,0,17.1,74,9.1,260,1.2
geps,0,2024-06-15 00:00:00,1,19.0,60,11.0,280,0.0
geps,0,2024-06-15 01:00:00,1,18.2,63,10.5,275,0.4
geps,0,2024-06-15 02:00:00,1,17.5,68,10.0,270,0.9
";

    #[test]
    fn test_parse_ensemble_members_and_precip_diff() {
        let run = parse_ensemble_csv(ENSEMBLE_SAMPLE, "geps", 52.01, -89.02).unwrap();
        assert_eq!(run.members.len(), 2);
        let m0 = &run.members[0];
        assert_eq!(m0.member, 0);
        // accumulated 0.0, 1.5, 1.2 -> hourly 0.0, 1.5, clamp(−0.3)=0
        let precs: Vec<f64> = m0.rows.iter().map(|r| r.prec).collect();
        assert_eq!(precs, vec![0.0, 1.5, 0.0]);
        assert!(m0.rows.iter().all(|r| r.prec >= 0.0));
        assert_eq!(run.issued.format("%H").to_string(), "00");
    }

    #[test]
    fn test_nonzero_utc_offset_fatal() {
        let bad = ENSEMBLE_SAMPLE.replace("geps,0,", "geps,-5,");
        assert!(matches!(
            parse_ensemble_csv(&bad, "geps", 52.0, -89.0),
            Err(SourceError::BadUtcOffset(-5))
        ));
    }

    #[test]
    fn test_missing_column_rejected() {
        let bad = "MODEL,DATETIME,MEMBER,TMP,RH,WSPD,WDIR,APCP\n";
        assert!(matches!(
            parse_ensemble_csv(bad, "geps", 52.0, -89.0),
            Err(SourceError::MissingColumn { .. })
        ));
    }

    #[test]
    fn test_values_rounded_two_decimals() {
        let text = "\
MODEL,UTC_OFFSET,DATETIME,MEMBER,TMP,RH,WSPD,WDIR,APCP
geps,0,2024-06-15 00:00:00,0,18.5678,65.333,10.234,270.111,0.0
";
        let run = parse_ensemble_csv(text, "geps", 52.0, -89.0).unwrap();
        let row = run.members[0].rows[0];
        assert_eq!(row.temp, 18.57);
        assert_eq!(row.rh, 65.33);
        assert_eq!(row.ws, 10.23);
    }

    #[test]
    fn test_gap_fill_to_hourly() {
        let text = "\
MODEL,UTC_OFFSET,DATETIME,MEMBER,TMP,RH,WSPD,WDIR,APCP
geps,0,2024-06-15 00:00:00,0,18.5,65,10.2,270,0.0
geps,0,2024-06-15 03:00:00,0,16.0,80,8.0,250,2.4
";
        let run = parse_ensemble_csv(text, "geps", 52.0, -89.0).unwrap();
        let rows = &run.members[0].rows;
        assert_eq!(rows.len(), 4);
        // filled hours carry the previous values with zero precip
        assert_eq!(rows[1].temp, 18.5);
        assert_eq!(rows[1].prec, 0.0);
        assert_eq!(rows[2].prec, 0.0);
        // the accumulated amount stays on the reported hour
        assert_eq!(rows[3].prec, 2.4);
        for pair in rows.windows(2) {
            assert_eq!(pair[1].datetime - pair[0].datetime, Duration::hours(1));
        }
    }

    #[test]
    fn test_parse_observed() {
        let text = "\
DATETIME,TMP,RH,WSPD,WDIR,PCP
2024-06-15 01:00:00,17.0,70,8.0,260,0.2
2024-06-15 00:00:00,18.0,65,9.0,270,0.0
";
        let stream = parse_observed_csv(text).unwrap();
        assert_eq!(stream.model, "obs");
        assert_eq!(stream.rows.len(), 2);
        // sorted by time even when the feed is not
        assert!(stream.rows[0].datetime < stream.rows[1].datetime);
    }

    #[test]
    fn test_parse_stations_skips_bad_dates() {
        let text = "\
DATE,LAT,LONG,FFMC,DMC,DC
2024-06-14,52.1,-89.5,88.2,41.0,310.5
not-a-date,52.2,-89.6,80.0,30.0,200.0
";
        let dailies = parse_station_csv(text).unwrap();
        assert_eq!(dailies.len(), 1);
        assert_eq!(dailies[0].ffmc, 88.2);
    }

    #[test]
    fn test_run_currency() {
        let issued = Utc.with_ymd_and_hms(2024, 6, 15, 0, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 10, 0, 0).unwrap();
        assert!(run_is_current(issued, now, 12));
        assert!(!run_is_current(issued, now, 6));
    }
}
