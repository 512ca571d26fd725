//! Database models.
//!
//! These map directly to the database schema and convert to and from the
//! domain types.

pub mod recording;

pub use recording::*;
