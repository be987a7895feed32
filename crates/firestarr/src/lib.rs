//! Orchestration for wildfire spread simulations.
//!
//! Discovers active fires and perimeters, reconciles them into named
//! groups, prepares per-group simulation inputs (weather scenarios with
//! fire weather indices, ignition rasters, launch scripts), schedules the
//! external simulator over a bounded pool, and assembles per-day combined
//! probability rasters across UTM zones.

pub mod aggregate;
pub mod cli;
pub mod config;
pub mod prepare;
pub mod publish;
pub mod reconcile;
pub mod run;
pub mod sched;
