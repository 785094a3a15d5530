//! Refresh pipeline: normalize → detect → aggregate
//!
//! `Pipeline::refresh` is the entry point the presentation layer calls on a
//! timer or user action. It is a pure function of the batch, the windows and
//! the configuration; the only side channel is the metrics counters.

use crate::domain::report::AdmittedBatch;
use crate::domain::route::RouteCatalog;
use crate::domain::types::{LoopEvent, RouteId, RouteLoopSummary, TimeWindow, VehicleReport};
use crate::infra::metrics::{Metrics, RefreshStats};
use crate::services::aggregator::aggregate;
use crate::services::loop_detector::{DetectorConfig, LoopDetector};
use crate::services::normalizer::normalize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// A route that could not be summarized in this refresh
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RouteError {
    #[error("route {0} has no configured stop count")]
    UnknownRoute(RouteId),
}

/// Everything one refresh produced
#[derive(Debug, Clone)]
pub struct RefreshOutcome {
    /// UUIDv7, time-sortable across refreshes
    pub run_id: String,
    pub windows: Vec<TimeWindow>,
    pub summaries: Vec<RouteLoopSummary>,
    pub failures: BTreeMap<RouteId, RouteError>,
    /// Loop events ending inside one of the windows, ordered by route,
    /// vehicle, then end time
    pub events: Vec<LoopEvent>,
    /// Malformed reports skipped (adapter + normalizer)
    pub skipped: usize,
    /// Reports outside the route/direction selection
    pub filtered: usize,
}

impl RefreshOutcome {
    pub fn total_loops(&self) -> u32 {
        self.summaries.iter().map(|s| s.loop_count).sum()
    }

    /// Distinct vehicles that completed at least one loop
    pub fn unique_vehicles(&self) -> usize {
        self.events.iter().map(|e| &e.vehicle).collect::<BTreeSet<_>>().len()
    }

    pub fn total_miles(&self) -> Option<f64> {
        let miles: Vec<f64> = self.summaries.iter().filter_map(|s| s.miles).collect();
        (!miles.is_empty()).then(|| crate::services::aggregator::round_miles(miles.iter().sum()))
    }
}

/// Loop counting pipeline bound to one route catalog and detector config
pub struct Pipeline {
    catalog: RouteCatalog,
    detector: LoopDetector,
    metrics: Option<Arc<Metrics>>,
}

impl Pipeline {
    pub fn new(catalog: RouteCatalog, detector: DetectorConfig) -> Self {
        Self { catalog, detector: LoopDetector::new(detector), metrics: None }
    }

    /// Create a pipeline with metrics recording
    pub fn with_metrics(catalog: RouteCatalog, detector: DetectorConfig, metrics: Arc<Metrics>) -> Self {
        Self { catalog, detector: LoopDetector::new(detector), metrics: Some(metrics) }
    }

    pub fn catalog(&self) -> &RouteCatalog {
        &self.catalog
    }

    /// Run one refresh over a batch of reports
    pub fn refresh(&self, reports: &[VehicleReport], windows: &[TimeWindow]) -> RefreshOutcome {
        self.run(reports, windows, 0, 0, BTreeMap::new())
    }

    /// Run one refresh over a batch admitted at the adapter boundary
    pub fn refresh_admitted(&self, batch: &AdmittedBatch, windows: &[TimeWindow]) -> RefreshOutcome {
        let failures = batch
            .unknown_routes
            .iter()
            .map(|route| (route.clone(), RouteError::UnknownRoute(route.clone())))
            .collect();
        self.run(&batch.reports, windows, batch.malformed, batch.filtered, failures)
    }

    fn run(
        &self,
        reports: &[VehicleReport],
        windows: &[TimeWindow],
        pre_skipped: usize,
        filtered: usize,
        mut failures: BTreeMap<RouteId, RouteError>,
    ) -> RefreshOutcome {
        let started = Instant::now();
        let run_id = Uuid::now_v7().to_string();

        let normalized = normalize(reports, &self.catalog);
        for route in &normalized.failed_routes {
            failures.insert(route.clone(), RouteError::UnknownRoute(route.clone()));
        }

        let mut events: Vec<LoopEvent> = normalized
            .series
            .iter()
            .flat_map(|series| self.detector.detect(series))
            .collect();
        events.retain(|e| windows.iter().any(|w| w.contains(e.ended_at)));

        let summaries = aggregate(&events, windows, &self.catalog);
        let skipped = pre_skipped + normalized.skipped;
        let imputed = events.iter().filter(|e| !e.confident).count();

        for (route, error) in &failures {
            warn!(run_id = %run_id, route = %route, error = %error, "route_refresh_failed");
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        info!(
            run_id = %run_id,
            reports = %reports.len(),
            series = %normalized.series.len(),
            skipped = %skipped,
            superseded = %normalized.superseded,
            filtered = %filtered,
            loops = %events.len(),
            imputed = %imputed,
            routes = %summaries.len(),
            failed_routes = %failures.len(),
            duration_ms = %duration_ms,
            "refresh_completed"
        );

        if let Some(ref metrics) = self.metrics {
            metrics.record_refresh(RefreshStats {
                reports: (reports.len() + pre_skipped) as u64,
                skipped: skipped as u64,
                filtered: filtered as u64,
                loops: events.len() as u64,
                imputed: imputed as u64,
                route_failures: failures.len() as u64,
                duration_ms,
            });
        }

        RefreshOutcome {
            run_id,
            windows: windows.to_vec(),
            summaries,
            failures,
            events,
            skipped,
            filtered,
        }
    }
}
