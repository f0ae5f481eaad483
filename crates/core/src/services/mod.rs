//! Seams for everything the engine consumes but does not implement: route
//! solving, elevation, distance, feature queries, line of sight and the
//! host's frame scheduling.

use std::{collections::BTreeMap, f64::consts::PI, time::Duration, time::SystemTime};

use geo::{Coord, HaversineDestination, HaversineDistance, LineString, Polygon};
use serde::{Deserialize, Serialize};

use crate::{CandidateId, CandidateSeed, FrameToken, Location, MeasuredPath, Result};

pub mod memory;

/// Host facility that runs a callback before the next repaint, or after a
/// delay. The host answers by calling back into the tour with the token.
pub trait FrameScheduler {
    fn request_frame(&mut self, token: FrameToken);

    fn request_timer(&mut self, token: FrameToken, delay: Duration);
}

pub trait ElevationLookup {
    /// Places `location` on the ground surface, raised by `offset` meters.
    fn elevate(&self, location: Location, offset: f64) -> Location;
}

pub trait GeodesicDistance {
    fn distance_meters(&self, a: &Location, b: &Location) -> f64;
}

/// Great-circle distance on a spherical earth.
#[derive(Debug, Clone, Copy, Default)]
pub struct HaversineMeters;

impl GeodesicDistance for HaversineMeters {
    fn distance_meters(&self, a: &Location, b: &Location) -> f64 {
        a.to_point().haversine_distance(&b.to_point())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRequest {
    pub start: Location,
    pub end: Location,
    pub travel_mode: String,
    pub start_time: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolvedRoute {
    /// Measures are simulated minutes from departure.
    pub path: MeasuredPath,
    pub total_minutes: f64,
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

pub trait RouteSolver {
    fn solve(&mut self, request: &RouteRequest) -> Result<SolvedRoute>;
}

pub trait SearchAreaQuery {
    fn query(&mut self, area: &Polygon<f64>) -> Result<Vec<CandidateSeed>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VisibilityTarget {
    pub id: CandidateId,
    pub location: Location,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VisibilityEvent {
    pub id: CandidateId,
    pub visible: bool,
}

/// Line-of-sight analysis between one observer and many targets. Results
/// arrive later, as [`VisibilityEvent`]s delivered by the host.
pub trait VisibilityOracle {
    fn start(&mut self);

    fn stop(&mut self);

    fn clear(&mut self);

    fn set_observer(&mut self, observer: Location);

    fn set_targets(&mut self, targets: &[VisibilityTarget]);
}

/// Approximates a geodesic circle of `radius_meters` around `center` with a
/// closed ring of `segments` vertices. The ring circumscribes the circle:
/// its edges touch the radius at their midpoints, so every point within
/// `radius_meters` lies inside the polygon.
pub fn geodesic_buffer(center: &Location, radius_meters: f64, segments: usize) -> Polygon<f64> {
    let segments = segments.max(8);
    let vertex_radius = radius_meters / (PI / segments as f64).cos();
    let origin = center.to_point();
    let ring: Vec<Coord<f64>> = (0..segments)
        .map(|step| {
            let bearing = 360.0 * step as f64 / segments as f64;
            origin.haversine_destination(bearing, vertex_radius).into()
        })
        .collect();
    Polygon::new(LineString::from(ring), vec![])
}
