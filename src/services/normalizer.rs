//! Telemetry normalizer
//!
//! Turns an unordered batch of vehicle reports into one strictly time-ordered
//! series per (vehicle, route), with positions mapped to progress fractions.
//! Out-of-domain reports are skipped and counted, never fatal. A stop-index
//! report on a route without a known stop count fails that route only.

use crate::domain::report::ReportError;
use crate::domain::route::RouteCatalog;
use crate::domain::types::{
    NormalizedReport, NormalizedSeries, Position, RouteId, VehicleId, VehicleReport,
};
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Output of one normalization pass
#[derive(Debug, Default)]
pub struct NormalizeOutcome {
    /// Sorted by (route, vehicle)
    pub series: Vec<NormalizedSeries>,
    /// Reports dropped as malformed
    pub skipped: usize,
    /// Duplicate-timestamp reports superseded by another report
    pub superseded: usize,
    /// Routes that could not be normalized at all
    pub failed_routes: BTreeSet<RouteId>,
}

/// Map a position to a progress fraction in [0, 1)
pub fn to_progress(position: Position, stop_count: Option<u32>) -> Result<f64, ReportError> {
    match position {
        Position::Progress(p) if p.is_finite() && (0.0..1.0).contains(&p) => Ok(p),
        Position::Progress(_) => Err(ReportError::OutOfDomain),
        Position::StopIndex(idx) => match stop_count {
            Some(count) if idx < count => Ok(idx as f64 / count as f64),
            Some(_) => Err(ReportError::OutOfDomain),
            None => Err(ReportError::MissingField("stop_count")),
        },
    }
}

/// Group, validate, sort and de-duplicate a batch of reports
pub fn normalize(reports: &[VehicleReport], catalog: &RouteCatalog) -> NormalizeOutcome {
    let mut outcome = NormalizeOutcome::default();
    // (insertion order, report) per series
    let mut groups: FxHashMap<(&RouteId, &VehicleId), Vec<(usize, NormalizedReport)>> =
        FxHashMap::default();

    for (seq, report) in reports.iter().enumerate() {
        let stop_count = catalog.stop_count(&report.route);
        if matches!(report.position, Position::StopIndex(_)) && stop_count.is_none() {
            outcome.failed_routes.insert(report.route.clone());
            continue;
        }

        match to_progress(report.position, stop_count) {
            Ok(progress) => {
                groups.entry((&report.route, &report.vehicle)).or_default().push((
                    seq,
                    NormalizedReport {
                        timestamp: report.timestamp,
                        progress,
                        heading: report.heading.clone(),
                        discrete: matches!(report.position, Position::StopIndex(_)),
                    },
                ));
            }
            Err(e) => {
                debug!(
                    vehicle = %report.vehicle,
                    route = %report.route,
                    position = ?report.position,
                    error = %e,
                    "report_skipped"
                );
                outcome.skipped += 1;
            }
        }
    }

    let ordered: BTreeMap<(&RouteId, &VehicleId), Vec<(usize, NormalizedReport)>> =
        groups.into_iter().collect();

    for ((route, vehicle), group) in ordered {
        if outcome.failed_routes.contains(route) {
            continue;
        }
        let (reports, superseded) = order_group(group);
        outcome.superseded += superseded;
        outcome.series.push(NormalizedSeries {
            vehicle: vehicle.clone(),
            route: route.clone(),
            reports,
        });
    }

    outcome
}

/// Sort one group by timestamp and keep one report per timestamp.
///
/// Among equal timestamps a report with a heading beats one without, and
/// otherwise the later-inserted report wins.
fn order_group(mut group: Vec<(usize, NormalizedReport)>) -> (Vec<NormalizedReport>, usize) {
    group.sort_by(|(seq_a, a), (seq_b, b)| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.heading.is_some().cmp(&b.heading.is_some()))
            .then_with(|| seq_a.cmp(seq_b))
    });

    let total = group.len();
    let mut ordered: Vec<NormalizedReport> = Vec::with_capacity(total);
    for (_, report) in group {
        match ordered.last_mut() {
            // Sorted so the preferred report comes last within a timestamp
            Some(last) if last.timestamp == report.timestamp => *last = report,
            _ => ordered.push(report),
        }
    }

    let superseded = total - ordered.len();
    (ordered, superseded)
}
