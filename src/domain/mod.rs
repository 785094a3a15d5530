//! Domain models - core loop counting types
//!
//! This module contains the canonical data types used throughout the system:
//! - `VehicleReport` - one observation of a vehicle on a route
//! - `NormalizedSeries` - validated, time-ordered reports for one vehicle
//! - `LoopEvent` - a detected loop completion
//! - `RouteLoopSummary` - per-route, per-window totals
//! - `RouteCatalog` - configured routes and their stop lists
//! - `StopReport` - Avail360 wire record

pub mod report;
pub mod route;
pub mod types;

// Re-export commonly used types at module level
pub use report::{AdmittedBatch, ReportError, StopReport};
pub use route::{RouteCatalog, RouteSpec};
pub use types::{
    LoopEvent, NormalizedReport, NormalizedSeries, Position, RouteId, RouteLoopSummary,
    TimeWindow, VehicleId, VehicleReport,
};
