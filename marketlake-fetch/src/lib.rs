//! Fetcher (spec §4.F): `fetch(table, params) -> batch | error`. Stateless,
//! safe to call concurrently. The upstream HTTP API itself is a black box —
//! the contract here is only that a table identifier and a merged parameter
//! set come back as a rectangular record batch, or an error already
//! classified as retryable or fatal so the fast pool knows what to do with
//! it without inspecting transport details itself.

use std::collections::HashMap;
use std::io::{BufReader, Cursor};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use datafusion::arrow::compute::concat_batches;
use datafusion::arrow::datatypes::Schema;
use datafusion::arrow::json::reader::{infer_json_schema, ReaderBuilder};
use datafusion::arrow::record_batch::RecordBatch;
use marketlake_core::error::FetchError;
use marketlake_schema::SchemaEntry;
use reqwest::StatusCode;

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, entry: &SchemaEntry, params: &HashMap<String, String>) -> Result<RecordBatch, FetchError>;
}

/// Calls `{base_url}/{upstream_api_id}` with `table.required_params` merged
/// under whatever `params` the caller supplies for this invocation — a
/// per-call param always wins a key collision, since it represents the
/// concrete thing being asked for right now (a date range, an entity) where
/// `required_params` is just the table's fixed routing defaults.
pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFetcher {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self { client, base_url: base_url.into() })
    }

    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self { client, base_url: base_url.into() }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, entry: &SchemaEntry, params: &HashMap<String, String>) -> Result<RecordBatch, FetchError> {
        let mut merged = entry.required_params.clone();
        merged.extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));

        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), entry.upstream_api_id);
        tracing::debug!(table = %entry.name, %url, "fetching from upstream");

        let response = self
            .client
            .get(&url)
            .query(&merged)
            .send()
            .await
            .map_err(|e| classify_transport_error(&entry.name, &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status_error(&entry.name, status));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::Retryable(format!("{}: reading response body: {e}", entry.name)))?;

        rows_to_batch(&entry.name, &body)
    }
}

fn classify_transport_error(table: &str, err: &reqwest::Error) -> FetchError {
    if err.is_timeout() || err.is_connect() {
        FetchError::Retryable(format!("{table}: {err}"))
    } else {
        FetchError::Fatal(format!("{table}: {err}"))
    }
}

fn classify_status_error(table: &str, status: StatusCode) -> FetchError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        FetchError::Retryable(format!("{table}: upstream returned {status}"))
    } else {
        FetchError::Fatal(format!("{table}: upstream returned {status}"))
    }
}

/// Upstream responses are a JSON array of flat row objects. Arrow's JSON
/// reader wants newline-delimited records, so re-serialize each element
/// onto its own line before inferring a schema and decoding.
fn rows_to_batch(table: &str, body: &[u8]) -> Result<RecordBatch, FetchError> {
    let rows: Vec<serde_json::Value> =
        serde_json::from_slice(body).map_err(|e| FetchError::Fatal(format!("{table}: invalid JSON response: {e}")))?;

    if rows.is_empty() {
        return Ok(RecordBatch::new_empty(Arc::new(Schema::empty())));
    }

    let mut ndjson = Vec::new();
    for row in &rows {
        serde_json::to_writer(&mut ndjson, row)
            .map_err(|e| FetchError::Fatal(format!("{table}: re-encoding row: {e}")))?;
        ndjson.push(b'\n');
    }

    let (schema, _) = infer_json_schema(&mut BufReader::new(Cursor::new(&ndjson)), None)
        .map_err(|e| FetchError::Fatal(format!("{table}: inferring schema from response: {e}")))?;
    let schema = Arc::new(schema);

    let reader = ReaderBuilder::new(schema.clone())
        .build(BufReader::new(Cursor::new(&ndjson)))
        .map_err(|e| FetchError::Fatal(format!("{table}: building json decoder: {e}")))?;

    let mut batches = Vec::new();
    for batch in reader {
        batches.push(batch.map_err(|e| FetchError::Fatal(format!("{table}: decoding response rows: {e}")))?);
    }
    concat_batches(&schema, &batches).map_err(|e| FetchError::Fatal(format!("{table}: assembling batch: {e}")))
}
