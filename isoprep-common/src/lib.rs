//! # ISO Preparation Common Library
//!
//! Shared code for the ISO preparation workspace:
//! - Error and result types
//! - TOML configuration loading
//! - Label grammar (rack markers, ISO/job/worklist labels)
//! - Pipetting specs and dead-volume rules
//! - Volume and concentration rounding helpers
//! - SQLite schema initialization

pub mod config;
#[cfg(feature = "sqlx")]
pub mod db;
pub mod error;
pub mod labels;
pub mod pipetting;
pub mod units;

pub use error::{Error, Result};
pub use labels::{RackMarker, RackRole};
pub use pipetting::{PipettingSpecs, Pipettor, ReservoirSpecs};
