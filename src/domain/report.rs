//! Avail360 stop report wire schema and admission into `VehicleReport`s
//!
//! The API returns `{"result": {"Stop Reports": [...]}}`. Each record is
//! decoded on its own so one bad record never rejects the batch.

use crate::domain::route::RouteCatalog;
use crate::domain::types::{Position, RouteId, VehicleId, VehicleReport};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeSet;
use thiserror::Error;

/// Why a single report was not admitted
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReportError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("unparseable timestamp `{0}`")]
    BadTimestamp(String),
    #[error("route {0} has no configured stop count")]
    UnknownRoute(RouteId),
    #[error("position out of domain")]
    OutOfDomain,
    #[error("undecodable record: {0}")]
    Undecodable(String),
}

/// Top-level API response
#[derive(Debug, Default, Deserialize)]
pub struct StopReportsEnvelope {
    #[serde(default)]
    pub result: Option<StopReportsResult>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StopReportsResult {
    #[serde(rename = "Stop Reports", default)]
    pub stop_reports: Option<Vec<serde_json::Value>>,
}

impl StopReportsEnvelope {
    /// Raw records, empty when the envelope carries none
    pub fn into_records(self) -> Vec<serde_json::Value> {
        self.result.and_then(|r| r.stop_reports).unwrap_or_default()
    }
}

/// One Avail360 stop report. Unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct StopReport {
    #[serde(rename = "Vehicle", default, deserialize_with = "deserialize_id")]
    pub vehicle: Option<String>,
    #[serde(rename = "Route", default, deserialize_with = "deserialize_id")]
    pub route: Option<String>,
    #[serde(rename = "Trip", default, deserialize_with = "deserialize_id")]
    pub trip: Option<String>,
    #[serde(rename = "Stop_Name", default)]
    pub stop_name: Option<String>,
    #[serde(rename = "Timestamp", default)]
    pub timestamp: Option<String>,
    #[serde(rename = "Direction", default)]
    pub direction: Option<String>,
}

/// Identifier that can be a JSON string or integer
fn deserialize_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct IdVisitor;

    impl<'de> Visitor<'de> for IdVisitor {
        type Value = Option<String>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string or integer identifier")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            let trimmed = value.trim();
            Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Some(value.to_string()))
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Some(value.to_string()))
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }

        fn visit_none<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }
    }

    deserializer.deserialize_any(IdVisitor)
}

/// Parse an Avail360 timestamp.
///
/// Accepts RFC 3339 and zone-less ISO 8601 (taken as UTC).
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ReportError> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(naive.and_utc());
        }
    }
    Err(ReportError::BadTimestamp(raw.to_string()))
}

impl StopReport {
    /// Convert to a `VehicleReport`.
    ///
    /// Returns `Ok(None)` when the report belongs to a route outside `selected`,
    /// fails the route's direction filter, or names a stop that is not on the
    /// route's stop list.
    pub fn admit(
        &self,
        catalog: &RouteCatalog,
        selected: &BTreeSet<RouteId>,
    ) -> Result<Option<VehicleReport>, ReportError> {
        let route = RouteId(self.route.clone().ok_or(ReportError::MissingField("Route"))?);
        if !selected.contains(&route) {
            return Ok(None);
        }
        let spec = catalog.get(&route).ok_or_else(|| ReportError::UnknownRoute(route.clone()))?;
        if !spec.accepts_direction(self.direction.as_deref()) {
            return Ok(None);
        }

        let stop = self.stop_name.as_deref().ok_or(ReportError::MissingField("Stop_Name"))?;
        let Some(index) = spec.stop_index(stop) else {
            return Ok(None);
        };

        let vehicle = VehicleId(self.vehicle.clone().ok_or(ReportError::MissingField("Vehicle"))?);
        let raw_ts = self.timestamp.as_deref().ok_or(ReportError::MissingField("Timestamp"))?;
        let timestamp = parse_timestamp(raw_ts)?;

        Ok(Some(VehicleReport {
            vehicle,
            route,
            timestamp,
            position: Position::StopIndex(index),
            heading: self.direction.clone(),
        }))
    }
}

/// Result of admitting a raw batch at the adapter boundary
#[derive(Debug, Default)]
pub struct AdmittedBatch {
    pub reports: Vec<VehicleReport>,
    /// Records rejected as malformed (never fatal)
    pub malformed: usize,
    /// Records outside the route/direction selection
    pub filtered: usize,
    /// Selected routes that have no configuration
    pub unknown_routes: BTreeSet<RouteId>,
}

/// Decode and admit raw API records
pub fn admit_records(
    records: &[serde_json::Value],
    catalog: &RouteCatalog,
    selected: &BTreeSet<RouteId>,
) -> AdmittedBatch {
    let mut batch = AdmittedBatch::default();

    for record in records {
        let admitted = StopReport::deserialize(record)
            .map_err(|e| ReportError::Undecodable(e.to_string()))
            .and_then(|report| report.admit(catalog, selected));

        match admitted {
            Ok(Some(report)) => batch.reports.push(report),
            Ok(None) => batch.filtered += 1,
            Err(ReportError::UnknownRoute(route)) => {
                batch.unknown_routes.insert(route);
            }
            Err(e) => {
                tracing::debug!(error = %e, "stop_report_rejected");
                batch.malformed += 1;
            }
        }
    }

    batch
}
