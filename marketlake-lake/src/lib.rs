//! Data Lake Layout (spec §4.B) and Parquet Writer (spec §4.C): the two
//! components that own the on-disk shape of the lake.

pub mod async_writer;
pub mod batch_ops;
pub mod layout;
pub mod writer;

pub use batch_ops::{derive_year_column, sort_by_primary_key};
pub use layout::LakeLayout;
pub use writer::{swap_directories, ParquetWriter, ReplaceError, WriteError};
