//! Repository layer for database access.

pub mod recording;

pub use recording::*;
