//! Core library for the Route Tour application.
//!
//! A solved route is played back as an observer moving along a measured
//! path. Every frame the observer's position feeds a proximity filter that
//! keeps track of which nearby candidates a line-of-sight oracle reports as
//! visible. Routing, elevation, feature queries and line of sight are
//! consumed through the traits in [`services`].

pub mod config;
pub mod error;
pub mod path;
pub mod proximity;
pub mod services;
pub mod timeline;
pub mod tour;

pub use config::{AppConfig, PlaybackConfig, ProximityConfig, RouteConfig};
pub use error::{Result, TourError};
pub use path::{heading_degrees, locate_along, Location, MeasuredPath, Position, Vertex};
pub use proximity::{
    Access, Candidate, CandidateAttributes, CandidateId, CandidateSeed, ProximityFilter,
    SelectionSummary, VisibilityUpdate,
};
pub use services::{
    geodesic_buffer, ElevationLookup, FrameScheduler, GeodesicDistance, HaversineMeters,
    RouteRequest, RouteSolver, SearchAreaQuery, SolvedRoute, VisibilityEvent, VisibilityOracle,
    VisibilityTarget,
};
pub use timeline::{
    format_clock, FrameSink, FrameToken, PlaybackFrame, PlaybackProgress, PlaybackRate,
    PlaybackScheduler, PlaybackState, PlaybackStatus, TickOutcome,
};
pub use tour::{Collaborators, ObserverView, RouteAvailable, RouteTour, StopOutcome};
