//! FWI over an hourly weather stream.

use crate::indices;
use crate::{FwiError, Result};
use chrono::{Datelike, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Local noon, when the daily codes update.
const NOON_HOUR: u32 = 12;

/// Station startup defaults used when observed indices are missing or bad.
pub const DEFAULT_FFMC: f64 = 85.0;
pub const DEFAULT_DMC: f64 = 6.0;
pub const DEFAULT_DC: f64 = 15.0;

/// One hour of weather in local time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HourlyWeather {
    pub datetime: NaiveDateTime,
    pub temp: f64,
    pub rh: f64,
    pub ws: f64,
    pub wd: f64,
    pub prec: f64,
}

impl HourlyWeather {
    fn has_nan(&self) -> bool {
        self.temp.is_nan()
            || self.rh.is_nan()
            || self.ws.is_nan()
            || self.wd.is_nan()
            || self.prec.is_nan()
    }
}

/// Indices to anchor the start of the stream to.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Startup {
    pub ffmc: f64,
    pub dmc: f64,
    pub dc: f64,
    /// Rain accumulated between the previous daily update and the first hour
    /// of the stream, in mm.
    pub apcp_prev: f64,
}

impl Default for Startup {
    fn default() -> Self {
        Startup {
            ffmc: DEFAULT_FFMC,
            dmc: DEFAULT_DMC,
            dc: DEFAULT_DC,
            apcp_prev: 0.0,
        }
    }
}

impl Startup {
    /// Clamp negative or non-finite values to zero. Zero indices read as
    /// fully wet fuels, so a bad station record errs toward no spread.
    pub fn sanitized(self) -> Startup {
        let fix = |name: &str, value: f64| {
            if value.is_finite() && value >= 0.0 {
                value
            } else {
                warn!(index = name, value, "bad startup index, treating as zero");
                0.0
            }
        };
        Startup {
            ffmc: fix("ffmc", self.ffmc),
            dmc: fix("dmc", self.dmc),
            dc: fix("dc", self.dc),
            apcp_prev: fix("apcp_prev", self.apcp_prev),
        }
    }
}

/// One hour of weather with its computed indices.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FwiRow {
    pub weather: HourlyWeather,
    pub ffmc: f64,
    pub dmc: f64,
    pub dc: f64,
    pub isi: f64,
    pub bui: f64,
    pub fwi: f64,
}

/// Compute indices for every hour of the stream.
///
/// Trailing hours with missing weather are dropped first. The stream must
/// then be strictly hourly. FFMC updates every hour from the startup value;
/// DMC and DC hold their startup values until the first local noon, then
/// update at each noon using the rain accumulated over the preceding
/// 24 hours (the startup `apcp_prev` feeds the first update).
pub fn calculate_stream(rows: &[HourlyWeather], startup: Startup) -> Result<Vec<FwiRow>> {
    let rows = trim_nan_tail(rows);
    if rows.is_empty() {
        return Err(FwiError::EmptyStream);
    }
    for pair in rows.windows(2) {
        if pair[1].datetime - pair[0].datetime != chrono::Duration::hours(1) {
            return Err(FwiError::NotHourly(pair[1].datetime));
        }
    }

    let startup = startup.sanitized();
    let mut ffmc = startup.ffmc;
    let mut dmc = startup.dmc;
    let mut dc = startup.dc;
    let mut rain_since_update = startup.apcp_prev;

    let mut out = Vec::with_capacity(rows.len());
    for wx in rows {
        rain_since_update += wx.prec;
        if wx.datetime.hour() == NOON_HOUR {
            let month = wx.datetime.month();
            dmc = indices::daily_dmc(dmc, wx.temp, wx.rh, rain_since_update, month);
            dc = indices::daily_dc(dc, wx.temp, rain_since_update, month);
            rain_since_update = 0.0;
        }
        ffmc = indices::hourly_ffmc(ffmc, wx.temp, wx.rh, wx.ws, wx.prec);
        let isi = indices::isi(ffmc, wx.ws);
        let bui = indices::bui(dmc, dc);
        let fwi = indices::fwi(isi, bui);
        out.push(FwiRow {
            weather: *wx,
            ffmc,
            dmc,
            dc,
            isi,
            bui,
            fwi,
        });
    }
    Ok(out)
}

/// Keep only rows on days that contain a local noon observation.
///
/// Days clipped by the stream boundaries never saw a daily update, so their
/// codes are not comparable with the rest.
pub fn retain_noon_days(rows: &mut Vec<FwiRow>) {
    let noon_days: std::collections::HashSet<chrono::NaiveDate> = rows
        .iter()
        .filter(|r| r.weather.datetime.hour() == NOON_HOUR)
        .map(|r| r.weather.datetime.date())
        .collect();
    rows.retain(|r| noon_days.contains(&r.weather.datetime.date()));
}

fn trim_nan_tail(rows: &[HourlyWeather]) -> &[HourlyWeather] {
    let mut end = rows.len();
    while end > 0 && rows[end - 1].has_nan() {
        end -= 1;
    }
    &rows[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn hour(day: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, day)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    fn dry_stream(hours: usize) -> Vec<HourlyWeather> {
        (0..hours)
            .map(|i| HourlyWeather {
                datetime: hour(10, 0) + chrono::Duration::hours(i as i64),
                temp: 25.0,
                rh: 25.0,
                ws: 12.0,
                wd: 270.0,
                prec: 0.0,
            })
            .collect()
    }

    #[test]
    fn test_dry_down_is_monotone() {
        let rows = calculate_stream(&dry_stream(72), Startup::default()).unwrap();
        // FFMC climbs toward equilibrium with no rain
        for pair in rows.windows(2) {
            assert!(pair[1].ffmc >= pair[0].ffmc - 1e-9);
        }
        // DC steps up at each noon and never falls
        let noon_dcs: Vec<f64> = rows
            .iter()
            .filter(|r| r.weather.datetime.hour() == 12)
            .map(|r| r.dc)
            .collect();
        assert_eq!(noon_dcs.len(), 3);
        for pair in noon_dcs.windows(2) {
            assert!(pair[1] > pair[0]);
        }
    }

    #[test]
    fn test_codes_hold_until_first_noon() {
        let startup = Startup {
            ffmc: 88.0,
            dmc: 30.0,
            dc: 250.0,
            apcp_prev: 0.0,
        };
        let rows = calculate_stream(&dry_stream(24), startup).unwrap();
        for r in rows.iter().take_while(|r| r.weather.datetime.hour() < 12) {
            assert_eq!(r.dmc, 30.0);
            assert_eq!(r.dc, 250.0);
        }
        let noon = rows
            .iter()
            .find(|r| r.weather.datetime.hour() == 12)
            .unwrap();
        assert!(noon.dmc > 30.0);
    }

    #[test]
    fn test_apcp_prev_feeds_first_update() {
        let base = calculate_stream(&dry_stream(24), Startup::default()).unwrap();
        let soaked = calculate_stream(
            &dry_stream(24),
            Startup {
                apcp_prev: 30.0,
                ..Startup::default()
            },
        )
        .unwrap();
        let noon_of = |rows: &[FwiRow]| {
            rows.iter()
                .find(|r| r.weather.datetime.hour() == 12)
                .map(|r| r.dc)
                .unwrap()
        };
        assert!(noon_of(&soaked) < noon_of(&base));
    }

    #[test]
    fn test_negative_startup_zeroed() {
        let s = Startup {
            ffmc: -1.0,
            dmc: -5.0,
            dc: f64::NAN,
            apcp_prev: -2.0,
        }
        .sanitized();
        assert_eq!(s.ffmc, 0.0);
        assert_eq!(s.dmc, 0.0);
        assert_eq!(s.dc, 0.0);
        assert_eq!(s.apcp_prev, 0.0);

        let good = Startup::default().sanitized();
        assert_eq!(good.ffmc, DEFAULT_FFMC);
        assert_eq!(good.dmc, DEFAULT_DMC);
        assert_eq!(good.dc, DEFAULT_DC);
    }

    #[test]
    fn test_nan_tail_dropped() {
        let mut rows = dry_stream(30);
        for r in rows.iter_mut().skip(26) {
            r.temp = f64::NAN;
        }
        let out = calculate_stream(&rows, Startup::default()).unwrap();
        assert_eq!(out.len(), 26);
    }

    #[test]
    fn test_gap_rejected() {
        let mut rows = dry_stream(10);
        rows.remove(5);
        assert!(matches!(
            calculate_stream(&rows, Startup::default()),
            Err(FwiError::NotHourly(_))
        ));
    }

    #[test]
    fn test_retain_noon_days_drops_clipped_day() {
        // stream starts at 18:00, first day has no noon
        let rows: Vec<HourlyWeather> = (0..30)
            .map(|i| HourlyWeather {
                datetime: hour(10, 18) + chrono::Duration::hours(i),
                temp: 20.0,
                rh: 40.0,
                ws: 10.0,
                wd: 180.0,
                prec: 0.0,
            })
            .collect();
        let mut out = calculate_stream(&rows, Startup::default()).unwrap();
        retain_noon_days(&mut out);
        assert!(out
            .iter()
            .all(|r| r.weather.datetime.date() != hour(10, 18).date()));
        assert!(!out.is_empty());
    }
}
