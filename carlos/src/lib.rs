//! carlos library crate.
//!
//! Schedules radio-telescope acquisitions on a single shared SDR receiver:
//! requests are admitted over HTTP, stored in SQLite, and run one at a time
//! as a pointing sweep whose captures are bundled into a `.tar.gz` archive.

pub mod acquisition;
pub mod api;
pub mod archive;
pub mod config;
pub mod database;
pub mod device;
pub mod domain;
pub mod error;
pub mod logging;
pub mod scheduler;
pub mod services;

pub use error::{Error, Result};
