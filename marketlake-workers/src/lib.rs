//! Fast and Slow Worker Pools (spec §4.H, §4.I): the two concurrency stages
//! that turn planned jobs into written Parquet files.

pub mod fast_pool;
pub mod retry;
pub mod slow_pool;

pub use fast_pool::FastWorkerPool;
pub use slow_pool::SlowWorkerPool;
