//! Canadian Fire Weather Index calculations on hourly weather streams.
//!
//! Fine fuel moisture updates every hour (Van Wagner's hourly FFMC); the
//! slower duff and drought codes update once per day at local noon, using
//! the precipitation accumulated over the preceding 24 hours and the noon
//! temperature and humidity. ISI, BUI and FWI derive from those per hour.
//!
//! Equations follow Van Wagner & Pickett (1985), with the hourly FFMC
//! moisture constant 147.27723.

pub mod indices;
pub mod stream;

pub use indices::{bui, daily_dc, daily_dmc, fwi, hourly_ffmc, isi};
pub use stream::{calculate_stream, FwiRow, HourlyWeather, Startup};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FwiError {
    #[error("weather stream is empty")]
    EmptyStream,
    #[error("weather stream is not hourly at {0}")]
    NotHourly(chrono::NaiveDateTime),
    #[error("no local noon in weather stream")]
    NoNoon,
}

pub type Result<T> = std::result::Result<T, FwiError>;
