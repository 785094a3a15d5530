//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `source` - `ReportSource` trait and saved-response file replay
//! - `avail360` - HTTP client for the Avail360 StopReports API
//! - `egress` - Summary output to file (JSONL) and loop event CSV export

pub mod avail360;
pub mod egress;
pub mod source;

// Re-export commonly used types
pub use avail360::Avail360Client;
pub use egress::{write_events_csv, Egress};
pub use source::{FileSource, ReportSource};
