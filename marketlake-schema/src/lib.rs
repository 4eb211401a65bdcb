//! Schema Registry (spec §4.A): per-table metadata, loaded once at startup
//! from a static declarative TOML source and treated as immutable for the
//! process's lifetime.

pub mod entry;
pub mod registry;

pub use entry::SchemaEntry;
pub use registry::SchemaRegistry;
