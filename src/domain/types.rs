//! Shared types for the loop counter

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Newtype wrapper for vehicle IDs to provide type safety
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VehicleId(pub String);

impl std::fmt::Display for VehicleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for VehicleId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Newtype wrapper for route IDs to provide type safety
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteId(pub String);

impl std::fmt::Display for RouteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RouteId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Where a vehicle was when it reported
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Position {
    /// Route-relative progress fraction, valid in [0, 1)
    Progress(f64),
    /// Index into the route's ordered stop list
    StopIndex(u32),
}

/// One observation of a vehicle at a point in time
#[derive(Debug, Clone, PartialEq)]
pub struct VehicleReport {
    pub vehicle: VehicleId,
    pub route: RouteId,
    pub timestamp: DateTime<Utc>,
    pub position: Position,
    pub heading: Option<String>,
}

impl VehicleReport {
    pub fn new(
        vehicle: impl Into<VehicleId>,
        route: impl Into<RouteId>,
        timestamp: DateTime<Utc>,
        position: Position,
    ) -> Self {
        Self {
            vehicle: vehicle.into(),
            route: route.into(),
            timestamp,
            position,
            heading: None,
        }
    }

    pub fn with_heading(mut self, heading: &str) -> Self {
        self.heading = Some(heading.to_string());
        self
    }
}

impl From<String> for VehicleId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<String> for RouteId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A validated report with its position expressed as a progress fraction
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedReport {
    pub timestamp: DateTime<Utc>,
    /// Always in [0, 1)
    pub progress: f64,
    pub heading: Option<String>,
    /// Position came from a stop index. Stop positions carry no noise, so
    /// any decrease between two of them is a pass through the route start.
    pub discrete: bool,
}

/// Time-ordered reports for one vehicle on one route.
///
/// Timestamps are strictly increasing.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedSeries {
    pub vehicle: VehicleId,
    pub route: RouteId,
    pub reports: Vec<NormalizedReport>,
}

/// A detected loop completion
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoopEvent {
    pub vehicle: VehicleId,
    pub route: RouteId,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// False when the boundary crossing was imputed across a data gap
    pub confident: bool,
}

/// Half-open time window `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    #[inline]
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// One window per service day between `first` and `last` (inclusive).
    ///
    /// A service day runs from `start_hour` on day D to `end_hour` on day D+1;
    /// config validation keeps `end_hour <= start_hour` so days never overlap.
    pub fn service_days(
        first: NaiveDate,
        last: NaiveDate,
        start_hour: u32,
        end_hour: u32,
    ) -> Vec<TimeWindow> {
        let mut windows = Vec::new();
        let mut day = first;
        while day <= last {
            windows.push(Self::service_day(day, start_hour, end_hour));
            match day.succ_opt() {
                Some(next) => day = next,
                None => break,
            }
        }
        windows
    }

    /// Single window covering every service day from `first` through `last`
    pub fn service_span(
        first: NaiveDate,
        last: NaiveDate,
        start_hour: u32,
        end_hour: u32,
    ) -> TimeWindow {
        let start = Self::service_day(first, start_hour, end_hour).start;
        let end = Self::service_day(last, start_hour, end_hour).end;
        Self { start, end }
    }

    fn service_day(day: NaiveDate, start_hour: u32, end_hour: u32) -> TimeWindow {
        let start_time = NaiveTime::from_hms_opt(start_hour.min(23), 0, 0).unwrap_or_default();
        let end_time = NaiveTime::from_hms_opt(end_hour.min(23), 0, 0).unwrap_or_default();
        let start = day.and_time(start_time).and_utc();
        let end = (day + Duration::days(1)).and_time(end_time).and_utc();
        Self { start, end }
    }
}

impl std::fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// Per-route, per-window loop totals handed to the presentation layer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteLoopSummary {
    pub route: RouteId,
    /// Display name from config (e.g. "BL"), if the route is configured
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_name: Option<String>,
    pub window: TimeWindow,
    pub loop_count: u32,
    /// Loops whose boundary crossing was imputed across a data gap
    pub imputed_count: u32,
    pub vehicles: BTreeMap<VehicleId, u32>,
    /// loop_count × configured loop mileage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub miles: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_window_contains_is_half_open() {
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 6, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 3, 2, 3, 0, 0).unwrap();
        let window = TimeWindow::new(start, end);

        assert!(window.contains(start));
        assert!(window.contains(end - Duration::seconds(1)));
        assert!(!window.contains(end));
        assert_eq!(window.duration(), Duration::hours(21));
    }

    #[test]
    fn test_service_days() {
        let first = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        let last = NaiveDate::from_ymd_opt(2025, 3, 3).unwrap();
        let windows = TimeWindow::service_days(first, last, 6, 3);

        assert_eq!(windows.len(), 3);
        assert_eq!(windows[0].start, Utc.with_ymd_and_hms(2025, 3, 1, 6, 0, 0).unwrap());
        assert_eq!(windows[0].end, Utc.with_ymd_and_hms(2025, 3, 2, 3, 0, 0).unwrap());
        assert_eq!(windows[2].end, Utc.with_ymd_and_hms(2025, 3, 4, 3, 0, 0).unwrap());
    }

    #[test]
    fn test_service_span_covers_all_days() {
        let first = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        let last = NaiveDate::from_ymd_opt(2025, 3, 2).unwrap();
        let span = TimeWindow::service_span(first, last, 6, 3);

        assert_eq!(span.start, Utc.with_ymd_and_hms(2025, 3, 1, 6, 0, 0).unwrap());
        assert_eq!(span.end, Utc.with_ymd_and_hms(2025, 3, 3, 3, 0, 0).unwrap());
    }

    #[test]
    fn test_ids_display() {
        assert_eq!(VehicleId::from("1204").to_string(), "1204");
        assert_eq!(RouteId::from("55").to_string(), "55");
    }
}
