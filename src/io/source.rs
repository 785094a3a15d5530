//! Report sources - where raw stop report batches come from
//!
//! Both sources return raw JSON records for the requested window; admission
//! into `VehicleReport`s happens afterwards against the route catalog.

use crate::domain::report::StopReportsEnvelope;
use crate::domain::types::TimeWindow;
use anyhow::Context;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;

/// A provider of complete, transport-deduplicated stop report batches
#[async_trait]
pub trait ReportSource: Send + Sync {
    /// Fetch every raw record covering `window`
    async fn fetch(&self, window: &TimeWindow) -> anyhow::Result<Vec<serde_json::Value>>;

    /// Short label for logs
    fn describe(&self) -> String;
}

/// Replays a saved API response from disk.
///
/// Accepts either the API envelope or a bare JSON array of records.
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }
}

/// Decode a response body into raw records
pub fn decode_records(body: &[u8]) -> anyhow::Result<Vec<serde_json::Value>> {
    let value: serde_json::Value =
        serde_json::from_slice(body).context("Failed to decode stop report JSON")?;
    match value {
        serde_json::Value::Array(records) => Ok(records),
        other => {
            let envelope: StopReportsEnvelope =
                serde_json::from_value(other).context("Unexpected stop report envelope")?;
            Ok(envelope.into_records())
        }
    }
}

#[async_trait]
impl ReportSource for FileSource {
    async fn fetch(&self, window: &TimeWindow) -> anyhow::Result<Vec<serde_json::Value>> {
        let body = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("Failed to read report file {}", self.path.display()))?;
        let records = decode_records(&body)?;
        info!(
            file = %self.path.display(),
            window = %window,
            records = %records.len(),
            "report_file_loaded"
        );
        Ok(records)
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}
