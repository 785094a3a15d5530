//! Rolls loop events up into per-route, per-window summaries
//!
//! An event is attributed to the window containing its end timestamp.
//! Low-confidence events are counted and also surfaced as `imputed_count`.

use crate::domain::route::RouteCatalog;
use crate::domain::types::{LoopEvent, RouteId, RouteLoopSummary, TimeWindow};
use std::collections::BTreeMap;

/// Summaries for every (route, window) with at least one event.
///
/// Output is ordered by route, then window start. Events outside every
/// window are ignored.
pub fn aggregate(
    events: &[LoopEvent],
    windows: &[TimeWindow],
    catalog: &RouteCatalog,
) -> Vec<RouteLoopSummary> {
    let mut buckets: BTreeMap<(RouteId, TimeWindow), RouteLoopSummary> = BTreeMap::new();

    for event in events {
        let Some(window) = windows.iter().find(|w| w.contains(event.ended_at)) else {
            continue;
        };

        let summary = buckets
            .entry((event.route.clone(), *window))
            .or_insert_with(|| empty_summary(&event.route, *window, catalog));
        summary.loop_count += 1;
        if !event.confident {
            summary.imputed_count += 1;
        }
        *summary.vehicles.entry(event.vehicle.clone()).or_insert(0) += 1;
    }

    buckets
        .into_values()
        .map(|mut summary| {
            summary.miles = catalog
                .get(&summary.route)
                .and_then(|r| r.loop_miles)
                .map(|miles| round_miles(summary.loop_count as f64 * miles));
            summary
        })
        .collect()
}

fn empty_summary(route: &RouteId, window: TimeWindow, catalog: &RouteCatalog) -> RouteLoopSummary {
    RouteLoopSummary {
        route: route.clone(),
        route_name: catalog.get(route).map(|r| r.name.clone()),
        window,
        loop_count: 0,
        imputed_count: 0,
        vehicles: BTreeMap::new(),
        miles: None,
    }
}

/// Round to hundredths of a mile
pub fn round_miles(miles: f64) -> f64 {
    (miles * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::route::RouteSpec;
    use crate::domain::types::VehicleId;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn event(vehicle: &str, route: &str, end: i64, confident: bool) -> LoopEvent {
        LoopEvent {
            vehicle: VehicleId::from(vehicle),
            route: RouteId::from(route),
            started_at: t(end - 600),
            ended_at: t(end),
            confident,
        }
    }

    fn window() -> TimeWindow {
        TimeWindow::new(t(0), t(3600))
    }

    #[test]
    fn test_route_and_vehicle_breakdown() {
        let events = vec![
            event("A", "route1", 100, true),
            event("B", "route1", 200, true),
            event("A", "route2", 300, true),
        ];

        let summaries = aggregate(&events, &[window()], &RouteCatalog::default());
        assert_eq!(summaries.len(), 2);

        let route1 = &summaries[0];
        assert_eq!(route1.route, RouteId::from("route1"));
        assert_eq!(route1.loop_count, 2);
        assert_eq!(route1.vehicles.get(&VehicleId::from("A")), Some(&1));
        assert_eq!(route1.vehicles.get(&VehicleId::from("B")), Some(&1));

        let route2 = &summaries[1];
        assert_eq!(route2.loop_count, 1);
        assert_eq!(route2.vehicles.len(), 1);
        assert_eq!(route2.vehicles.get(&VehicleId::from("A")), Some(&1));
    }

    #[test]
    fn test_empty_input() {
        assert!(aggregate(&[], &[window()], &RouteCatalog::default()).is_empty());
    }

    #[test]
    fn test_imputed_events_counted_and_flagged() {
        let events = vec![event("A", "55", 100, true), event("A", "55", 900, false)];

        let summaries = aggregate(&events, &[window()], &RouteCatalog::default());
        assert_eq!(summaries[0].loop_count, 2);
        assert_eq!(summaries[0].imputed_count, 1);
    }

    #[test]
    fn test_attributed_by_end_timestamp() {
        let first = TimeWindow::new(t(0), t(1000));
        let second = TimeWindow::new(t(1000), t(2000));
        // Starts in the first window, ends in the second
        let events = vec![event("A", "55", 1200, true), event("A", "55", 3000, true)];

        let summaries = aggregate(&events, &[first, second], &RouteCatalog::default());
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].window, second);
        assert_eq!(summaries[0].loop_count, 1);
    }

    #[test]
    fn test_miles_and_name_from_catalog() {
        let catalog = RouteCatalog::new([
            RouteSpec::with_stops("55", "BL", &["A", "B"]).with_loop_miles(4.3)
        ]);
        let events: Vec<LoopEvent> = (1..=3).map(|i| event("A", "55", i * 100, true)).collect();

        let summaries = aggregate(&events, &[window()], &catalog);
        assert_eq!(summaries[0].route_name.as_deref(), Some("BL"));
        assert_eq!(summaries[0].miles, Some(12.9));
    }
}
