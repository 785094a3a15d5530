//! Services - loop counting logic
//!
//! This module contains the core business logic services:
//! - `normalizer` - Groups, validates and orders reports per vehicle
//! - `loop_detector` - Finds loop completions in a normalized series
//! - `aggregator` - Rolls loop events up per route and window
//! - `pipeline` - Runs one refresh end to end

pub mod aggregator;
pub mod loop_detector;
pub mod normalizer;
pub mod pipeline;

// Re-export commonly used types
pub use loop_detector::{DetectorConfig, LoopDetector};
pub use pipeline::{Pipeline, RefreshOutcome, RouteError};
