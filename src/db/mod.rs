//! Database module for pingcheck.
//!
//! Best-effort SQLite storage of probe samples and their rollups.

mod models;
mod store;

pub use models::*;
pub use store::*;
