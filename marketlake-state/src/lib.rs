//! State Queryer (spec §4.D): computes the maximum ingested date per entity
//! by scanning the lake with a column-pruned projection. Read-only, safe to
//! call concurrently with writers (readers always see whole, closed files).

pub mod queryer;

pub use queryer::StateQueryer;
