//! Lineage decisions for a run: which parameter is the primary input, and
//! what source the run is registered under.

mod select;
mod source;

pub use select::{select_primary_input, PrimaryInput, DEFAULT_PRIMARY_CANDIDATES};
pub use source::resolve_source;
