//! End-to-end loop counting tests over the public pipeline API

use chrono::{DateTime, Duration, TimeZone, Utc};
use loop_counter::domain::report::admit_records;
use loop_counter::domain::route::{RouteCatalog, RouteSpec};
use loop_counter::domain::types::{LoopEvent, Position, RouteId, TimeWindow, VehicleId, VehicleReport};
use loop_counter::io::{FileSource, ReportSource};
use loop_counter::services::aggregator::aggregate;
use loop_counter::services::{DetectorConfig, Pipeline};
use std::collections::BTreeSet;
use std::io::Write;
use tempfile::NamedTempFile;

fn t(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap() + Duration::seconds(secs)
}

fn catalog() -> RouteCatalog {
    RouteCatalog::new([
        RouteSpec::with_stops("55", "BL", &["Pattee TC EB", "Nittany Com Ctr", "College_Allen"])
            .with_loop_miles(4.3)
            .with_direction("L"),
        RouteSpec::with_stops("57", "WL", &["Pattee TC WB", "Lot 83 West", "College_Allen"])
            .with_loop_miles(4.3)
            .with_direction("L"),
    ])
}

fn pipeline() -> Pipeline {
    Pipeline::new(catalog(), DetectorConfig::default())
}

fn window() -> TimeWindow {
    TimeWindow::new(t(0), t(24 * 3600))
}

fn progress_reports(vehicle: &str, route: &str, points: &[(i64, f64)]) -> Vec<VehicleReport> {
    points
        .iter()
        .map(|&(secs, p)| VehicleReport::new(vehicle, route, t(secs), Position::Progress(p)))
        .collect()
}

#[test]
fn test_stationary_vehicle_has_no_loops() {
    let points: Vec<(i64, f64)> = (0..10).map(|i| (i * 60, 0.3)).collect();
    let outcome = pipeline().refresh(&progress_reports("bus1", "55", &points), &[window()]);

    assert!(outcome.events.is_empty());
    assert!(outcome.summaries.is_empty());
    assert_eq!(outcome.total_loops(), 0);
}

#[test]
fn test_single_wrap_interpolated_between_reports() {
    let reports = progress_reports(
        "bus1",
        "55",
        &[(0, 0.0), (60, 0.5), (120, 0.99), (180, 0.01), (240, 0.5)],
    );
    let outcome = pipeline().refresh(&reports, &[window()]);

    assert_eq!(outcome.events.len(), 1);
    let event = &outcome.events[0];
    assert!(event.confident);
    assert!(event.ended_at > t(120) && event.ended_at < t(180));
    assert_eq!(outcome.summaries[0].loop_count, 1);
    assert_eq!(outcome.summaries[0].miles, Some(4.3));
}

#[test]
fn test_refresh_is_idempotent() {
    let mut reports = progress_reports(
        "bus1",
        "55",
        &[(0, 0.0), (300, 0.4), (600, 0.8), (900, 0.1), (1200, 0.6), (1500, 0.05)],
    );
    reports.extend(progress_reports("bus2", "57", &[(0, 0.0), (400, 0.7), (800, 0.2)]));

    let pipeline = pipeline();
    let first = pipeline.refresh(&reports, &[window()]);
    let second = pipeline.refresh(&reports, &[window()]);

    assert_eq!(first.summaries, second.summaries);
    assert_eq!(first.events, second.events);
    assert_ne!(first.run_id, second.run_id);
}

#[test]
fn test_appending_later_reports_never_decreases_counts() {
    let points = [
        (0, 0.0),
        (300, 0.4),
        (600, 0.8),
        (900, 0.1),
        (1200, 0.6),
        (1500, 0.05),
        (1800, 0.5),
        (2100, 0.95),
        (2400, 0.3),
    ];
    let pipeline = pipeline();

    let mut previous = 0;
    for len in 2..=points.len() {
        let outcome = pipeline.refresh(&progress_reports("bus1", "55", &points[..len]), &[window()]);
        let count = outcome.total_loops();
        assert!(count >= previous, "prefix {} counted {} < {}", len, count, previous);
        previous = count;
    }
    assert_eq!(previous, 3);
}

#[test]
fn test_gap_crossing_is_low_confidence() {
    let reports = progress_reports("bus1", "55", &[(0, 0.0), (60, 0.6), (60 + 3600, 0.1)]);
    let outcome = pipeline().refresh(&reports, &[window()]);

    assert_eq!(outcome.events.len(), 1);
    assert!(!outcome.events[0].confident);
    assert_eq!(outcome.summaries[0].imputed_count, 1);
}

#[test]
fn test_aggregation_per_route_and_vehicle() {
    let event = |vehicle: &str, route: &str, end: i64| LoopEvent {
        vehicle: VehicleId::from(vehicle),
        route: RouteId::from(route),
        started_at: t(end - 900),
        ended_at: t(end),
        confident: true,
    };
    let events = [event("A", "55", 1000), event("B", "55", 2000), event("A", "57", 1500)];

    let summaries = aggregate(&events, &[window()], &catalog());
    assert_eq!(summaries.len(), 2);

    let first = &summaries[0];
    assert_eq!(first.route, RouteId::from("55"));
    assert_eq!(first.loop_count, 2);
    assert_eq!(first.vehicles.get(&VehicleId::from("A")), Some(&1));
    assert_eq!(first.vehicles.get(&VehicleId::from("B")), Some(&1));

    let second = &summaries[1];
    assert_eq!(second.route, RouteId::from("57"));
    assert_eq!(second.loop_count, 1);
    assert_eq!(second.vehicles.get(&VehicleId::from("A")), Some(&1));
}

#[test]
fn test_malformed_report_skipped_not_fatal() {
    let valid = progress_reports(
        "bus1",
        "55",
        &[
            (0, 0.0),
            (100, 0.2),
            (200, 0.4),
            (300, 0.6),
            (400, 0.8),
            (500, 0.1),
            (600, 0.3),
            (700, 0.5),
            (800, 0.7),
        ],
    );
    let mut with_bad = valid.clone();
    with_bad.insert(3, VehicleReport::new("bus1", "55", t(250), Position::Progress(-0.2)));

    let pipeline = pipeline();
    let clean = pipeline.refresh(&valid, &[window()]);
    let dirty = pipeline.refresh(&with_bad, &[window()]);

    assert_eq!(dirty.skipped, 1);
    assert_eq!(clean.skipped, 0);
    assert_eq!(dirty.summaries, clean.summaries);
    assert_eq!(dirty.total_loops(), 1);
}

#[test]
fn test_stop_feed_counts_every_return_to_start() {
    // Later laps miss the far stop; each return to stop 0 still closes a loop
    let stops = [(0, 0), (300, 1), (600, 2), (900, 0), (1200, 1), (1500, 0), (1800, 1)];
    let reports: Vec<VehicleReport> = stops
        .iter()
        .map(|&(secs, idx)| VehicleReport::new("bus1", "55", t(secs), Position::StopIndex(idx)))
        .collect();

    let outcome = pipeline().refresh(&reports, &[window()]);
    assert_eq!(outcome.total_loops(), 2);
    assert!(outcome.events.iter().all(|e| e.confident));
    assert_eq!(outcome.events[1].ended_at, t(1500));
}

#[test]
fn test_daily_windows_split_loops() {
    let day = chrono::NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
    let windows = TimeWindow::service_days(day, day.succ_opt().unwrap(), 6, 3);
    assert_eq!(windows.len(), 2);

    let day_two = 24 * 3600;
    let mut reports = progress_reports("bus1", "55", &[(0, 0.0), (600, 0.5), (1200, 0.0)]);
    reports.extend(progress_reports(
        "bus1",
        "55",
        &[(day_two, 0.0), (day_two + 600, 0.5), (day_two + 1200, 0.0)],
    ));

    let outcome = pipeline().refresh(&reports, &windows);
    assert_eq!(outcome.summaries.len(), 2);
    assert!(outcome.summaries.iter().all(|s| s.loop_count == 1));
}

#[tokio::test]
async fn test_saved_response_end_to_end() {
    let body = serde_json::json!({
        "result": {
            "Stop Reports": [
                {"Vehicle": 101, "Route": "55", "Trip": 1, "Stop_Name": "Pattee TC EB", "Timestamp": "2025-03-01T08:00:00", "Direction": "L"},
                {"Vehicle": 101, "Route": "55", "Trip": 1, "Stop_Name": "Nittany Com Ctr", "Timestamp": "2025-03-01T08:05:00", "Direction": "L"},
                {"Vehicle": 101, "Route": "55", "Trip": 1, "Stop_Name": "College_Allen", "Timestamp": "2025-03-01T08:10:00", "Direction": "L"},
                {"Vehicle": 101, "Route": "55", "Trip": 2, "Stop_Name": "Pattee TC EB", "Timestamp": "2025-03-01T08:15:00", "Direction": "L"},
                {"Vehicle": 101, "Route": "55", "Trip": 2, "Stop_Name": "Pattee TC EB", "Timestamp": "2025-03-01T08:15:00", "Direction": "X"},
                {"Vehicle": 202, "Route": "30", "Trip": 9, "Stop_Name": "Elsewhere", "Timestamp": "2025-03-01T08:15:00", "Direction": "L"},
                {"Vehicle": 101, "Route": "55", "Stop_Name": "Nowhere", "Timestamp": "2025-03-01T08:20:00", "Direction": "L"},
                {"Vehicle": 101, "Route": "55", "Stop_Name": "College_Allen", "Direction": "L"}
            ]
        }
    });
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(body.to_string().as_bytes()).unwrap();
    file.flush().unwrap();

    let source = FileSource::new(file.path());
    let records = source.fetch(&window()).await.unwrap();
    assert_eq!(records.len(), 8);

    let selected = BTreeSet::from([RouteId::from("55")]);
    let batch = admit_records(&records, &catalog(), &selected);
    assert_eq!(batch.reports.len(), 4);
    assert_eq!(batch.filtered, 3);
    assert_eq!(batch.malformed, 1);

    let outcome = pipeline().refresh_admitted(&batch, &[window()]);
    assert_eq!(outcome.total_loops(), 1);
    assert_eq!(outcome.skipped, 1);
    assert_eq!(outcome.filtered, 3);
    assert_eq!(outcome.summaries[0].route_name.as_deref(), Some("BL"));
    assert_eq!(outcome.summaries[0].vehicles.get(&VehicleId::from("101")), Some(&1));
}
