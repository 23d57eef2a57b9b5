//! Target state, rolling statistics and the shared registry.

mod registry;
mod state;
mod stats;

pub use registry::*;
pub use state::*;
