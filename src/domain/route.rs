//! Route catalog - the per-route knowledge the pipeline needs
//!
//! Built from the `[[routes]]` config sections. The stop list order defines
//! stop indices; index 0 is the loop start.

use crate::domain::types::RouteId;
use rustc_hash::FxHashMap;

/// Static description of one route
#[derive(Debug, Clone, PartialEq)]
pub struct RouteSpec {
    pub id: RouteId,
    /// Short display name (e.g. "BL")
    pub name: String,
    /// Ordered stop names, first entry is the loop start
    pub stops: Vec<String>,
    /// Number of positions in the stop domain (>= 1)
    pub stop_count: u32,
    /// Miles driven for one loop, if known
    pub loop_miles: Option<f64>,
    /// Only reports with this direction flag are counted
    pub direction: Option<String>,
}

impl RouteSpec {
    /// Route whose stop domain is its ordered stop list
    pub fn with_stops(id: &str, name: &str, stops: &[&str]) -> Self {
        Self {
            id: RouteId::from(id),
            name: name.to_string(),
            stops: stops.iter().map(|s| s.to_string()).collect(),
            stop_count: stops.len() as u32,
            loop_miles: None,
            direction: None,
        }
    }

    pub fn with_loop_miles(mut self, miles: f64) -> Self {
        self.loop_miles = Some(miles);
        self
    }

    pub fn with_direction(mut self, direction: &str) -> Self {
        self.direction = Some(direction.to_string());
        self
    }

    /// Index of a stop name in the route's stop list
    pub fn stop_index(&self, stop_name: &str) -> Option<u32> {
        self.stops.iter().position(|s| s == stop_name.trim()).map(|i| i as u32)
    }

    /// Whether a report's direction flag passes this route's direction filter
    pub fn accepts_direction(&self, direction: Option<&str>) -> bool {
        match (&self.direction, direction) {
            (None, _) => true,
            (Some(want), Some(got)) => want.eq_ignore_ascii_case(got.trim()),
            (Some(_), None) => false,
        }
    }
}

/// Lookup of configured routes by id or display name
#[derive(Debug, Clone, Default)]
pub struct RouteCatalog {
    routes: FxHashMap<RouteId, RouteSpec>,
}

impl RouteCatalog {
    pub fn new(routes: impl IntoIterator<Item = RouteSpec>) -> Self {
        Self { routes: routes.into_iter().map(|r| (r.id.clone(), r)).collect() }
    }

    pub fn get(&self, id: &RouteId) -> Option<&RouteSpec> {
        self.routes.get(id)
    }

    /// Resolve a CLI selector that may be either a route id ("55") or name ("BL")
    pub fn resolve(&self, selector: &str) -> Option<&RouteSpec> {
        self.routes
            .get(&RouteId::from(selector))
            .or_else(|| self.routes.values().find(|r| r.name.eq_ignore_ascii_case(selector)))
    }

    pub fn stop_count(&self, id: &RouteId) -> Option<u32> {
        self.routes.get(id).map(|r| r.stop_count)
    }

    /// Route ids in sorted order
    pub fn ids(&self) -> Vec<RouteId> {
        let mut ids: Vec<RouteId> = self.routes.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
