//! HTTP API.
//!
//! A thin adapter over the store: it admits requests, reports their status
//! and serves finished archives. It can observe the busy flag and poke the
//! scheduler's refresh signal, nothing more.

pub mod error;
pub mod routes;
pub mod server;

pub use error::{ApiError, ApiResult};
pub use server::{ApiServer, ApiServerConfig, AppState};
