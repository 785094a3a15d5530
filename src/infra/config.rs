//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml
//!
//! The Avail360 subscription key may be left out of the file and supplied
//! through AVAIL360_SUBSCRIPTION_KEY instead.

use crate::domain::route::{RouteCatalog, RouteSpec};
use crate::domain::types::RouteId;
use crate::services::loop_detector::DetectorConfig;
use anyhow::{bail, Context};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Environment variable consulted when `[api].subscription_key` is absent
pub const SUBSCRIPTION_KEY_ENV: &str = "AVAIL360_SUBSCRIPTION_KEY";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SiteConfig {
    /// Agency/site identifier included in egress records
    #[serde(default = "default_site_id")]
    pub id: String,
}

fn default_site_id() -> String {
    "cata".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_agency")]
    pub agency: String,
    #[serde(default)]
    pub subscription_key: Option<String>,
    /// Maximum span of a single request
    #[serde(default = "default_chunk_hours")]
    pub chunk_hours: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Backoff grows linearly: attempt × retry_backoff_ms
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            agency: default_agency(),
            subscription_key: None,
            chunk_hours: default_chunk_hours(),
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

fn default_base_url() -> String {
    "https://avail360-api.myavail.cloud/".to_string()
}

fn default_agency() -> String {
    "CATA".to_string()
}

fn default_chunk_hours() -> u64 {
    24
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectorToml {
    /// Longest silence between reports still treated as continuous travel
    #[serde(default = "default_max_gap_secs")]
    pub max_gap_secs: u64,
    /// Backward moves shorter than this route fraction are treated as jitter
    #[serde(default = "default_backward_tolerance")]
    pub backward_tolerance: f64,
}

impl Default for DetectorToml {
    fn default() -> Self {
        Self {
            max_gap_secs: default_max_gap_secs(),
            backward_tolerance: default_backward_tolerance(),
        }
    }
}

fn default_max_gap_secs() -> u64 {
    1800
}

fn default_backward_tolerance() -> f64 {
    0.5
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceDayConfig {
    #[serde(default = "default_service_start_hour")]
    pub start_hour: u32,
    /// Hour on the following day when the service day ends
    #[serde(default = "default_service_end_hour")]
    pub end_hour: u32,
}

impl Default for ServiceDayConfig {
    fn default() -> Self {
        Self { start_hour: default_service_start_hour(), end_hour: default_service_end_hour() }
    }
}

fn default_service_start_hour() -> u32 {
    6
}

fn default_service_end_hour() -> u32 {
    3
}

#[derive(Debug, Clone, Deserialize)]
pub struct EgressConfig {
    /// File path for summary egress (JSONL format)
    #[serde(default = "default_egress_file")]
    pub file: String,
    /// Optional loop event CSV export
    #[serde(default)]
    pub events_csv: Option<String>,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self { file: default_egress_file(), events_csv: None }
    }
}

fn default_egress_file() -> String {
    "loop_summaries.jsonl".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteToml {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Ordered stop names, first entry is the loop start
    #[serde(default)]
    pub stops: Vec<String>,
    /// Stop domain size for feeds that report indices rather than names
    #[serde(default)]
    pub stop_count: Option<u32>,
    #[serde(default)]
    pub loop_miles: Option<f64>,
    #[serde(default)]
    pub direction: Option<String>,
}

impl RouteToml {
    fn into_spec(self) -> anyhow::Result<RouteSpec> {
        let stop_count = match (self.stops.len() as u32, self.stop_count) {
            (0, None) | (0, Some(0)) => {
                bail!("route {} needs a stop list or a stop_count", self.id)
            }
            (0, Some(count)) => count,
            (listed, Some(count)) if count != listed => {
                bail!(
                    "route {} lists {} stops but stop_count is {}",
                    self.id,
                    listed,
                    count
                )
            }
            (listed, _) => listed,
        };
        if let Some(miles) = self.loop_miles {
            if !(miles.is_finite() && miles > 0.0) {
                bail!("route {} loop_miles must be positive", self.id);
            }
        }

        Ok(RouteSpec {
            name: self.name.unwrap_or_else(|| self.id.clone()),
            id: RouteId(self.id),
            stops: self.stops,
            stop_count,
            loop_miles: self.loop_miles,
            direction: self.direction,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub detector: DetectorToml,
    #[serde(default)]
    pub service_day: ServiceDayConfig,
    #[serde(default)]
    pub egress: EgressConfig,
    pub routes: Vec<RouteToml>,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    api_base_url: String,
    api_agency: String,
    subscription_key: Option<String>,
    api_chunk_hours: u64,
    api_timeout_ms: u64,
    api_max_retries: u32,
    api_retry_backoff_ms: u64,
    max_gap_secs: u64,
    backward_tolerance: f64,
    service_start_hour: u32,
    service_end_hour: u32,
    egress_file: String,
    events_csv: Option<String>,
    routes: RouteCatalog,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        let api = ApiConfig::default();
        Self {
            site_id: default_site_id(),
            api_base_url: api.base_url,
            api_agency: api.agency,
            subscription_key: env::var(SUBSCRIPTION_KEY_ENV).ok(),
            api_chunk_hours: api.chunk_hours,
            api_timeout_ms: api.timeout_ms,
            api_max_retries: api.max_retries,
            api_retry_backoff_ms: api.retry_backoff_ms,
            max_gap_secs: default_max_gap_secs(),
            backward_tolerance: default_backward_tolerance(),
            service_start_hour: default_service_start_hour(),
            service_end_hour: default_service_end_hour(),
            egress_file: default_egress_file(),
            events_csv: None,
            routes: Self::default_routes(),
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    /// The two CATA campus loops
    fn default_routes() -> RouteCatalog {
        RouteCatalog::new([
            RouteSpec::with_stops(
                "55",
                "BL",
                &["Pattee TC EB", "Nittany Com Ctr", "Jordan East Pk", "College_Allen"],
            )
            .with_loop_miles(4.3)
            .with_direction("L"),
            RouteSpec::with_stops(
                "57",
                "WL",
                &["Pattee TC WB", "Lot 83 West", "Schlow Lib_CATA", "College_Allen"],
            )
            .with_loop_miles(4.3)
            .with_direction("L"),
        ])
    }

    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        // Check for --config argument
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let mut config = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.config_file = path.display().to_string();
        Ok(config)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let toml_config: TomlConfig = toml::from_str(content)?;

        if toml_config.api.chunk_hours == 0 {
            bail!("api.chunk_hours must be at least 1");
        }
        if !(0.0..1.0).contains(&toml_config.detector.backward_tolerance) {
            bail!("detector.backward_tolerance must be in [0, 1)");
        }
        if toml_config.service_day.start_hour > 23 || toml_config.service_day.end_hour > 23 {
            bail!("service_day hours must be in 0..=23");
        }
        // The day ends on the following calendar day; a later end hour would
        // make consecutive service days overlap
        if toml_config.service_day.end_hour > toml_config.service_day.start_hour {
            bail!(
                "service_day.end_hour ({}) must not be after start_hour ({})",
                toml_config.service_day.end_hour,
                toml_config.service_day.start_hour
            );
        }

        let mut routes = Vec::with_capacity(toml_config.routes.len());
        for route in toml_config.routes {
            routes.push(route.into_spec()?);
        }

        let subscription_key = toml_config
            .api
            .subscription_key
            .filter(|k| !k.is_empty())
            .or_else(|| env::var(SUBSCRIPTION_KEY_ENV).ok());

        Ok(Self {
            site_id: toml_config.site.id,
            api_base_url: toml_config.api.base_url,
            api_agency: toml_config.api.agency,
            subscription_key,
            api_chunk_hours: toml_config.api.chunk_hours,
            api_timeout_ms: toml_config.api.timeout_ms,
            api_max_retries: toml_config.api.max_retries,
            api_retry_backoff_ms: toml_config.api.retry_backoff_ms,
            max_gap_secs: toml_config.detector.max_gap_secs,
            backward_tolerance: toml_config.detector.backward_tolerance,
            service_start_hour: toml_config.service_day.start_hour,
            service_end_hour: toml_config.service_day.end_hour,
            egress_file: toml_config.egress.file,
            events_csv: toml_config.egress.events_csv,
            routes: RouteCatalog::new(routes),
            config_file: "inline".to_string(),
        })
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    /// Loop detector settings
    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            max_gap: chrono::Duration::seconds(self.max_gap_secs as i64),
            backward_tolerance: self.backward_tolerance,
        }
    }

    // Getters for all config fields
    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn api_base_url(&self) -> &str {
        &self.api_base_url
    }

    pub fn api_agency(&self) -> &str {
        &self.api_agency
    }

    pub fn subscription_key(&self) -> Option<&str> {
        self.subscription_key.as_deref()
    }

    pub fn api_chunk(&self) -> Duration {
        Duration::from_secs(self.api_chunk_hours * 3600)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_millis(self.api_timeout_ms)
    }

    pub fn api_max_retries(&self) -> u32 {
        self.api_max_retries
    }

    pub fn api_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.api_retry_backoff_ms)
    }

    pub fn max_gap_secs(&self) -> u64 {
        self.max_gap_secs
    }

    pub fn backward_tolerance(&self) -> f64 {
        self.backward_tolerance
    }

    pub fn service_start_hour(&self) -> u32 {
        self.service_start_hour
    }

    pub fn service_end_hour(&self) -> u32 {
        self.service_end_hour
    }

    pub fn egress_file(&self) -> &str {
        &self.egress_file
    }

    pub fn events_csv(&self) -> Option<&str> {
        self.events_csv.as_deref()
    }

    pub fn routes(&self) -> &RouteCatalog {
        &self.routes
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to set the gap threshold
    #[cfg(test)]
    pub fn with_max_gap_secs(mut self, secs: u64) -> Self {
        self.max_gap_secs = secs;
        self
    }
}
