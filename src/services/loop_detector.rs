//! Loop detection over one vehicle's normalized series
//!
//! Progress is unwrapped into a cumulative value (completed laps + current
//! fraction). Each step adds a non-negative forward delta, so loops are never
//! decremented. Because a single forward delta is always < 1, a step crosses
//! an integer boundary exactly when it wraps past the route start, and one
//! report closes at most one loop.
//!
//! A loop runs start to start: the first boundary crossing of a series only
//! opens a loop unless the series began at the route start.
//!
//! Backward moves between two stop-index reports are always wraps; the jitter
//! tolerance only applies to continuous progress.
//!
//! Steps longer than `max_gap` are data gaps. Crossings inside a gap are
//! placed at the gap midpoint, and the next emitted event is low-confidence.

use crate::domain::types::{LoopEvent, NormalizedReport, NormalizedSeries};
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

/// Largest forward delta one step may contribute
const MAX_STEP: f64 = 1.0 - f64::EPSILON;

/// Loop detector settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorConfig {
    /// Longest interval between reports still treated as continuous travel
    pub max_gap: Duration,
    /// Backward moves shorter than this route fraction are jitter, longer
    /// ones are wraps past the route start
    pub backward_tolerance: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self { max_gap: Duration::minutes(30), backward_tolerance: 0.5 }
    }
}

/// Per-vehicle tracker state after the latest report
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrackerState {
    /// Continuous reporting; carries cumulative unwrapped progress
    Accumulating { progress: f64 },
    /// The latest step bridged a data gap
    Gap { progress: f64 },
}

impl TrackerState {
    pub fn progress(&self) -> f64 {
        match *self {
            TrackerState::Accumulating { progress } | TrackerState::Gap { progress } => progress,
        }
    }
}

/// How the tracker interpreted one step
#[derive(Debug, Clone, Copy, PartialEq)]
enum Step {
    /// Forward travel within the current lap
    Forward,
    /// Backward movement treated as positional noise
    Jitter,
    /// Travel past the route start into the next lap
    Wrap { fraction_before_boundary: f64 },
}

/// Detection result for one series
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SeriesDetection {
    pub events: Vec<LoopEvent>,
    /// Steps that bridged a data gap
    pub gaps: usize,
    /// Steps discarded as backward jitter
    pub jitter_steps: usize,
    /// Cumulative unwrapped progress at the end of the series
    pub progress: f64,
}

/// Mutable per-vehicle tracking state, scoped to one detection pass
struct VehicleTracker {
    config: DetectorConfig,
    laps: u32,
    /// Reference position for forward deltas; held at the high-water mark
    /// while the vehicle jitters backward
    anchor: f64,
    loop_started_at: Option<DateTime<Utc>>,
    low_confidence: bool,
    state: TrackerState,
}

impl VehicleTracker {
    fn new(config: DetectorConfig, first: &NormalizedReport) -> Self {
        Self {
            config,
            laps: 0,
            anchor: first.progress,
            // A series that begins at the route start has already opened a loop
            loop_started_at: (first.progress == 0.0).then_some(first.timestamp),
            low_confidence: false,
            state: TrackerState::Accumulating { progress: first.progress },
        }
    }

    fn classify(&self, to: f64, across_gap: bool, discrete: bool) -> Step {
        let from = self.anchor;
        let raw = to - from;
        if raw >= 0.0 {
            return Step::Forward;
        }
        // Across a gap the anchor is stale, so any decrease is a wrap
        if across_gap || discrete || -raw >= self.config.backward_tolerance {
            let delta = raw.rem_euclid(1.0).min(MAX_STEP);
            return Step::Wrap { fraction_before_boundary: (1.0 - from) / delta };
        }
        Step::Jitter
    }

    fn observe(
        &mut self,
        prev: &NormalizedReport,
        cur: &NormalizedReport,
        detection: &mut SeriesDetection,
    ) -> Option<(DateTime<Utc>, DateTime<Utc>, bool)> {
        let across_gap = cur.timestamp - prev.timestamp > self.config.max_gap;
        if across_gap {
            detection.gaps += 1;
            self.low_confidence = true;
        }

        let discrete = prev.discrete && cur.discrete;
        let closed = match self.classify(cur.progress, across_gap, discrete) {
            Step::Forward => {
                self.anchor = cur.progress;
                None
            }
            Step::Jitter => {
                detection.jitter_steps += 1;
                None
            }
            Step::Wrap { fraction_before_boundary } => {
                let crossed_at = if across_gap {
                    midpoint(prev.timestamp, cur.timestamp)
                } else {
                    interpolate(prev.timestamp, cur.timestamp, fraction_before_boundary)
                };
                self.laps += 1;
                self.anchor = cur.progress;
                self.loop_started_at.replace(crossed_at).map(|started| {
                    let confident = !self.low_confidence;
                    self.low_confidence = false;
                    (started, crossed_at, confident)
                })
            }
        };

        let progress = self.laps as f64 + self.anchor;
        self.state = if across_gap {
            TrackerState::Gap { progress }
        } else {
            TrackerState::Accumulating { progress }
        };

        closed
    }
}

fn midpoint(a: DateTime<Utc>, b: DateTime<Utc>) -> DateTime<Utc> {
    a + Duration::milliseconds((b - a).num_milliseconds() / 2)
}

fn interpolate(a: DateTime<Utc>, b: DateTime<Utc>, fraction: f64) -> DateTime<Utc> {
    let span_ms = (b - a).num_milliseconds() as f64;
    a + Duration::milliseconds((span_ms * fraction.clamp(0.0, 1.0)).round() as i64)
}

/// Converts normalized series into loop completion events
#[derive(Debug, Clone, Default)]
pub struct LoopDetector {
    config: DetectorConfig,
}

impl LoopDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    /// Loop events for one series. Never fails; fewer than two reports
    /// yields no events.
    pub fn detect(&self, series: &NormalizedSeries) -> Vec<LoopEvent> {
        self.detect_series(series).events
    }

    /// Loop events plus gap/jitter statistics for one series
    pub fn detect_series(&self, series: &NormalizedSeries) -> SeriesDetection {
        let mut detection = SeriesDetection::default();
        let Some(first) = series.reports.first() else {
            return detection;
        };
        detection.progress = first.progress;
        if series.reports.len() < 2 {
            debug!(vehicle = %series.vehicle, route = %series.route, "series_insufficient_data");
            return detection;
        }

        let mut tracker = VehicleTracker::new(self.config, first);
        for pair in series.reports.windows(2) {
            if let Some((started_at, ended_at, confident)) =
                tracker.observe(&pair[0], &pair[1], &mut detection)
            {
                detection.events.push(LoopEvent {
                    vehicle: series.vehicle.clone(),
                    route: series.route.clone(),
                    started_at,
                    ended_at,
                    confident,
                });
            }
        }
        detection.progress = tracker.state.progress();

        debug!(
            vehicle = %series.vehicle,
            route = %series.route,
            loops = %detection.events.len(),
            gaps = %detection.gaps,
            jitter_steps = %detection.jitter_steps,
            progress = format!("{:.3}", detection.progress),
            state = ?tracker.state,
            "series_detected"
        );

        detection
    }
}
