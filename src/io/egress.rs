//! Refresh egress - writes loop summaries and loop event exports
//!
//! Summaries are appended in JSONL format (one JSON object per line) to the
//! file specified in config. Loop events can additionally be exported as a
//! CSV with a running per-vehicle loop count and a final `Total` row.

use crate::domain::route::RouteCatalog;
use crate::domain::types::RouteLoopSummary;
use crate::services::aggregator::round_miles;
use crate::services::pipeline::RefreshOutcome;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tracing::{debug, error, info};

/// One JSONL record
#[derive(Debug, Serialize)]
struct SummaryRecord<'a> {
    run_id: &'a str,
    site: &'a str,
    #[serde(flatten)]
    summary: &'a RouteLoopSummary,
}

/// Egress writer for refresh summaries
pub struct Egress {
    file_path: String,
    site_id: String,
}

impl Egress {
    pub fn new(file_path: &str, site_id: &str) -> Self {
        info!(file_path = %file_path, "egress_initialized");
        Self { file_path: file_path.to_string(), site_id: site_id.to_string() }
    }

    /// Append every summary of a refresh to the egress file
    /// Returns the number of summaries written
    pub fn write_outcome(&self, outcome: &RefreshOutcome) -> usize {
        let mut written = 0;
        for summary in &outcome.summaries {
            let record = SummaryRecord { run_id: &outcome.run_id, site: &self.site_id, summary };
            let line = match serde_json::to_string(&record) {
                Ok(line) => line,
                Err(e) => {
                    error!(route = %summary.route, error = %e, "summary_serialize_failed");
                    continue;
                }
            };

            match self.append_line(&line) {
                Ok(()) => written += 1,
                Err(e) => {
                    error!(run_id = %outcome.run_id, route = %summary.route, error = %e, "summary_egress_failed");
                }
            }
        }

        info!(run_id = %outcome.run_id, summaries = %written, "summaries_egressed");
        written
    }

    /// Append a line to the egress file
    fn append_line(&self, line: &str) -> std::io::Result<()> {
        let path = Path::new(&self.file_path);

        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;

        writeln!(file, "{}", line)?;
        debug!(file = %self.file_path, bytes = %line.len(), "egress_written");

        Ok(())
    }
}

/// One row of the loop event CSV
#[derive(Debug, Serialize)]
struct EventRow {
    #[serde(rename = "Vehicle")]
    vehicle: String,
    #[serde(rename = "Route")]
    route: String,
    #[serde(rename = "Started")]
    started: String,
    #[serde(rename = "Ended")]
    ended: String,
    #[serde(rename = "Confident")]
    confident: String,
    #[serde(rename = "Loop_Count")]
    loop_count: u32,
    #[serde(rename = "Total_Miles")]
    total_miles: String,
}

/// Export loop events as CSV, ending with a `Total` row.
///
/// `Loop_Count` is the running count for the row's vehicle on its route.
/// Returns the number of event rows written.
pub fn write_events_csv(
    path: impl AsRef<Path>,
    outcome: &RefreshOutcome,
    catalog: &RouteCatalog,
) -> anyhow::Result<usize> {
    use anyhow::Context;

    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("opening {}", path.display()))?;

    let mut running: FxHashMap<(&str, &str), u32> = FxHashMap::default();
    let mut total_miles: Option<f64> = None;

    for event in &outcome.events {
        let count = running.entry((event.vehicle.0.as_str(), event.route.0.as_str())).or_insert(0);
        *count += 1;

        let loop_miles = catalog.get(&event.route).and_then(|r| r.loop_miles);
        if let Some(miles) = loop_miles {
            *total_miles.get_or_insert(0.0) += miles;
        }

        writer
            .serialize(EventRow {
                vehicle: event.vehicle.to_string(),
                route: event.route.to_string(),
                started: event.started_at.to_rfc3339(),
                ended: event.ended_at.to_rfc3339(),
                confident: event.confident.to_string(),
                loop_count: *count,
                total_miles: loop_miles
                    .map(|m| format!("{:.2}", round_miles(*count as f64 * m)))
                    .unwrap_or_default(),
            })
            .context("writing CSV row")?;
    }

    writer
        .serialize(EventRow {
            vehicle: "Total".to_string(),
            route: String::new(),
            started: String::new(),
            ended: String::new(),
            confident: String::new(),
            loop_count: outcome.events.len() as u32,
            total_miles: total_miles.map(|m| format!("{:.2}", round_miles(m))).unwrap_or_default(),
        })
        .context("writing CSV total row")?;
    writer.flush().context("flushing CSV")?;

    info!(file = %path.display(), events = %outcome.events.len(), "events_csv_written");
    Ok(outcome.events.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::route::RouteSpec;
    use crate::domain::types::{LoopEvent, RouteId, TimeWindow, VehicleId};
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::collections::BTreeMap;
    use std::fs;
    use tempfile::tempdir;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn event(vehicle: &str, end: i64) -> LoopEvent {
        LoopEvent {
            vehicle: VehicleId::from(vehicle),
            route: RouteId::from("55"),
            started_at: t(end - 900),
            ended_at: t(end),
            confident: true,
        }
    }

    fn outcome() -> RefreshOutcome {
        let window = TimeWindow::new(t(0), t(7200));
        let summary = RouteLoopSummary {
            route: RouteId::from("55"),
            route_name: Some("BL".to_string()),
            window,
            loop_count: 3,
            imputed_count: 0,
            vehicles: BTreeMap::from([(VehicleId::from("A"), 2), (VehicleId::from("B"), 1)]),
            miles: Some(12.9),
        };
        RefreshOutcome {
            run_id: "run-1".to_string(),
            windows: vec![window],
            summaries: vec![summary],
            failures: BTreeMap::new(),
            events: vec![event("A", 1000), event("A", 2000), event("B", 1500)],
            skipped: 0,
            filtered: 0,
        }
    }

    fn catalog() -> RouteCatalog {
        RouteCatalog::new([RouteSpec::with_stops("55", "BL", &["A"]).with_loop_miles(4.3)])
    }

    #[test]
    fn test_egress_new() {
        let egress = Egress::new("test.jsonl", "cata");
        assert_eq!(egress.file_path, "test.jsonl");
    }

    #[test]
    fn test_write_outcome() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("summaries.jsonl");
        let egress = Egress::new(file_path.to_str().unwrap(), "cata");

        assert_eq!(egress.write_outcome(&outcome()), 1);

        let content = fs::read_to_string(&file_path).unwrap();
        assert!(content.ends_with('\n'));
        let parsed: serde_json::Value = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(parsed["run_id"], "run-1");
        assert_eq!(parsed["site"], "cata");
        assert_eq!(parsed["route"], "55");
        assert_eq!(parsed["route_name"], "BL");
        assert_eq!(parsed["loop_count"], 3);
        assert_eq!(parsed["vehicles"]["A"], 2);
    }

    #[test]
    fn test_append_mode() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("nested").join("summaries.jsonl");
        let egress = Egress::new(file_path.to_str().unwrap(), "cata");

        egress.write_outcome(&outcome());
        egress.write_outcome(&outcome());

        let content = fs::read_to_string(&file_path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn test_events_csv_running_count_and_total() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("loops.csv");

        let written = write_events_csv(&file_path, &outcome(), &catalog()).unwrap();
        assert_eq!(written, 3);

        let mut reader = csv::Reader::from_path(&file_path).unwrap();
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 4);
        assert_eq!(&rows[1][0], "A");
        assert_eq!(&rows[1][5], "2");
        assert_eq!(&rows[1][6], "8.60");
        assert_eq!(&rows[2][5], "1");
        assert_eq!(&rows[3][0], "Total");
        assert_eq!(&rows[3][5], "3");
        assert_eq!(&rows[3][6], "12.90");
    }

    #[test]
    fn test_events_csv_without_mileage() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("loops.csv");
        let mut empty = outcome();
        empty.events.clear();

        write_events_csv(&file_path, &empty, &RouteCatalog::default()).unwrap();
        let content = fs::read_to_string(&file_path).unwrap();
        assert!(content.starts_with("Vehicle,Route,Started,Ended,Confident,Loop_Count,Total_Miles"));
        assert!(content.contains("Total,,,,,0,"));
    }
}
