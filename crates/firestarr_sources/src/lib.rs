//! External data acquisition: active fires, fire perimeters and weather.
//!
//! Every fetch goes through the caching HTTP layer in [`net`], so a re-run
//! inside the same process never downloads the same file twice and files on
//! disk are reused when the server copy has not changed. Sources are tried
//! in registry order with static fallbacks last.

pub mod fire;
pub mod net;
pub mod ratelimit;
pub mod types;
pub mod wx;

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("http error for {url}: {message}")]
    Http { url: String, message: String },
    #[error("server rejected {url} with status {status}")]
    Rejected { url: String, status: u16 },
    #[error("malformed response from {url}: {message}")]
    Malformed { url: String, message: String },
    #[error("missing column {column} in {context}")]
    MissingColumn { column: String, context: String },
    #[error("model run uses UTC offset {0}, expected 0")]
    BadUtcOffset(i64),
    #[error("all sources failed for {0}")]
    Exhausted(&'static str),
    #[error("rate limit state at {path}: {message}")]
    RateLimit { path: PathBuf, message: String },
    #[error(transparent)]
    Geo(#[from] firestarr_geo::GeoError),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SourceError>;
