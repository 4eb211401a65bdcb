//! Bridges `object_store`'s buffered writer to `parquet`'s async file writer
//! trait, counting bytes written along the way. Same shape as the
//! `object_store`+`parquet` pairing used elsewhere in this lineage for
//! streaming Arrow batches to blob storage without buffering a whole file in
//! memory first.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use object_store::buffered::BufWriter;
use parquet::arrow::async_writer::AsyncFileWriter;
use parquet::errors::ParquetError;
use tokio::io::AsyncWriteExt;

#[derive(Debug)]
pub struct ObjectStoreAsyncWriter {
    inner: BufWriter,
    bytes_written: Arc<AtomicU64>,
}

impl ObjectStoreAsyncWriter {
    pub fn new(inner: BufWriter, bytes_written: Arc<AtomicU64>) -> Self {
        Self { inner, bytes_written }
    }
}

impl AsyncFileWriter for ObjectStoreAsyncWriter {
    fn write(&mut self, bs: Bytes) -> BoxFuture<'_, parquet::errors::Result<()>> {
        self.bytes_written.fetch_add(bs.len() as u64, Ordering::Relaxed);
        Box::pin(async {
            self.inner
                .put(bs)
                .await
                .map_err(|err| ParquetError::External(Box::new(err)))
        })
    }

    fn complete(&mut self) -> BoxFuture<'_, parquet::errors::Result<()>> {
        Box::pin(async {
            self.inner
                .shutdown()
                .await
                .map_err(|err| ParquetError::External(Box::new(err)))
        })
    }
}
