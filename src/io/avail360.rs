//! Avail360 StopReports API client
//!
//! Request format:
//! `{base_url}StopReports/v1/{agency}/{start}/{end}?subscription-key={key}`
//! with `%Y-%m-%dT%H:%M:%SZ` timestamps. Long windows are split into
//! chunks no longer than `api.chunk_hours`. Identical records returned by
//! neighbouring chunks are dropped before the batch is handed over.

use crate::domain::types::TimeWindow;
use crate::infra::config::{Config, SUBSCRIPTION_KEY_ENV};
use crate::infra::metrics::Metrics;
use crate::io::source::{decode_records, ReportSource};
use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use rustc_hash::FxHashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Log a chunk that exhausted its retries (cold path)
#[cold]
fn log_fetch_failed(chunk: &TimeWindow, attempts: u32, e: &anyhow::Error) {
    warn!(chunk = %chunk, attempts = %attempts, error = %format!("{:#}", e), "avail360_fetch_failed");
}

/// Split a window into consecutive chunks of at most `chunk`
pub fn chunk_windows(window: &TimeWindow, chunk: chrono::Duration) -> Vec<TimeWindow> {
    let mut chunks = Vec::new();
    if chunk <= chrono::Duration::zero() {
        return chunks;
    }
    let mut start = window.start;
    while start < window.end {
        let end = (start + chunk).min(window.end);
        chunks.push(TimeWindow::new(start, end));
        start = end;
    }
    chunks
}

/// Outcome of one HTTP attempt
enum Attempt {
    Done(Vec<serde_json::Value>),
    Retry(anyhow::Error),
    Fatal(anyhow::Error),
}

/// Client for the Avail360 stop report endpoint
pub struct Avail360Client {
    http: reqwest::Client,
    base_url: String,
    agency: String,
    subscription_key: String,
    chunk: chrono::Duration,
    max_retries: u32,
    retry_backoff: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl Avail360Client {
    /// Build a client from config. Fails when no subscription key is set.
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let subscription_key = config
            .subscription_key()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                anyhow!(
                    "No Avail360 subscription key: set [api].subscription_key or {}",
                    SUBSCRIPTION_KEY_ENV
                )
            })?
            .to_string();

        // Create HTTP client once for reuse (connection pooling)
        let http = reqwest::Client::builder()
            .timeout(config.api_timeout())
            .build()
            .context("Failed to build HTTP client")?;

        let chunk = chrono::Duration::from_std(config.api_chunk())
            .context("api.chunk_hours out of range")?;

        Ok(Self {
            http,
            base_url: config.api_base_url().to_string(),
            agency: config.api_agency().to_string(),
            subscription_key,
            chunk,
            max_retries: config.api_max_retries(),
            retry_backoff: config.api_retry_backoff(),
            metrics: None,
        })
    }

    /// Attach metrics recording
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Request URL for one chunk, without the subscription key
    pub fn chunk_url(&self, chunk: &TimeWindow) -> String {
        let base = if self.base_url.ends_with('/') {
            self.base_url.clone()
        } else {
            format!("{}/", self.base_url)
        };
        format!(
            "{}StopReports/v1/{}/{}/{}",
            base,
            self.agency,
            chunk.start.format(TIMESTAMP_FORMAT),
            chunk.end.format(TIMESTAMP_FORMAT)
        )
    }

    async fn attempt(&self, url: &str) -> Attempt {
        if let Some(ref metrics) = self.metrics {
            metrics.record_fetch_request();
        }

        let response = match self
            .http
            .get(url)
            .query(&[("subscription-key", self.subscription_key.as_str())])
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return Attempt::Retry(anyhow!(e).context("request failed")),
        };

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Attempt::Retry(anyhow!("server responded {}", status));
        }
        if !status.is_success() {
            return Attempt::Fatal(anyhow!("server responded {}", status));
        }

        match response.bytes().await {
            Ok(body) => match decode_records(&body) {
                Ok(records) => Attempt::Done(records),
                Err(e) => Attempt::Fatal(e),
            },
            Err(e) => Attempt::Retry(anyhow!(e).context("reading response body failed")),
        }
    }

    /// Fetch one chunk, retrying transport errors and 5xx/429 responses
    async fn fetch_chunk(&self, chunk: &TimeWindow) -> anyhow::Result<Vec<serde_json::Value>> {
        let url = self.chunk_url(chunk);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let error = match self.attempt(&url).await {
                Attempt::Done(records) => {
                    debug!(url = %url, records = %records.len(), attempts = %attempts, "avail360_chunk_fetched");
                    return Ok(records);
                }
                Attempt::Fatal(e) => e,
                Attempt::Retry(e) if attempts <= self.max_retries => {
                    if let Some(ref metrics) = self.metrics {
                        metrics.record_fetch_retry();
                    }
                    let backoff = self.retry_backoff * attempts;
                    warn!(
                        url = %url,
                        attempt = %attempts,
                        backoff_ms = %backoff.as_millis(),
                        error = %format!("{:#}", e),
                        "avail360_retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    continue;
                }
                Attempt::Retry(e) => e,
            };

            if let Some(ref metrics) = self.metrics {
                metrics.record_fetch_failure();
            }
            log_fetch_failed(chunk, attempts, &error);
            return Err(error.context(format!("Failed to fetch stop reports for {}", chunk)));
        }
    }
}

#[async_trait]
impl ReportSource for Avail360Client {
    async fn fetch(&self, window: &TimeWindow) -> anyhow::Result<Vec<serde_json::Value>> {
        let chunks = chunk_windows(window, self.chunk);
        if chunks.is_empty() {
            bail!("Empty fetch window {}", window);
        }

        let mut seen: FxHashSet<String> = FxHashSet::default();
        let mut records = Vec::new();
        let mut duplicates = 0usize;

        for (i, chunk) in chunks.iter().enumerate() {
            for record in self.fetch_chunk(chunk).await? {
                if seen.insert(record.to_string()) {
                    records.push(record);
                } else {
                    duplicates += 1;
                }
            }
            info!(chunk = %(i + 1), chunks = %chunks.len(), records = %records.len(), "avail360_progress");
        }

        info!(
            window = %window,
            chunks = %chunks.len(),
            records = %records.len(),
            duplicates = %duplicates,
            "avail360_fetch_complete"
        );
        Ok(records)
    }

    fn describe(&self) -> String {
        format!("avail360:{}", self.agency)
    }
}
