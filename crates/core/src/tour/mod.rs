//! Wires path playback, proximity filtering and the external collaborators
//! into the lifecycle the map UI drives: stops are added, a route becomes
//! available, the observer tours it, and the route is cleared.

use std::{fmt, time::SystemTime};

use geo::Polygon;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    format_clock, geodesic_buffer, heading_degrees, AppConfig, Candidate, ElevationLookup,
    FrameScheduler, FrameSink, FrameToken, GeodesicDistance, Location,
    MeasuredPath, PlaybackFrame, PlaybackProgress, PlaybackRate, PlaybackScheduler,
    PlaybackState, PlaybackStatus, Position, ProximityConfig, ProximityFilter, Result,
    RouteRequest, RouteSolver, SearchAreaQuery, SelectionSummary, SolvedRoute, TickOutcome,
    TourError, VisibilityEvent, VisibilityOracle, VisibilityTarget, VisibilityUpdate,
};

/// External services the tour depends on.
pub struct Collaborators {
    pub solver: Box<dyn RouteSolver>,
    pub elevation: Box<dyn ElevationLookup>,
    /// Used for the radius check and for measuring observer drift.
    pub distance: Box<dyn GeodesicDistance>,
    pub search_area: Box<dyn SearchAreaQuery>,
    pub oracle: Box<dyn VisibilityOracle>,
    pub frames: Box<dyn FrameScheduler>,
}

/// Payload of the "route available" signal.
#[derive(Debug, Clone)]
pub struct RouteAvailable {
    pub path: MeasuredPath,
    pub total_minutes: f64,
    /// Area for the first candidate query. Defaults to a geodesic buffer
    /// around the start of the path.
    pub search_area: Option<Polygon<f64>>,
}

impl From<SolvedRoute> for RouteAvailable {
    fn from(route: SolvedRoute) -> Self {
        Self {
            path: route.path,
            total_minutes: route.total_minutes,
            search_area: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ObserverView {
    /// Elevated observer location, as handed to the visibility oracle.
    pub location: Location,
    pub heading_degrees: f64,
    pub elapsed_minutes: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StopOutcome {
    /// First stop of a new route; nothing to solve yet.
    StartRecorded,
    RouteStarted { total_minutes: f64 },
    /// Solving failed. Whatever was playing keeps playing.
    NoRoute,
}

/// Everything that follows the observer: the proximity filter and the
/// collaborators that feed it.
struct Surroundings {
    proximity: ProximityConfig,
    filter: ProximityFilter,
    elevation: Box<dyn ElevationLookup>,
    search_area: Box<dyn SearchAreaQuery>,
    oracle: Box<dyn VisibilityOracle>,
    observer: Option<ObserverView>,
    search_center: Option<Location>,
    search_polygon: Option<Polygon<f64>>,
    completed: bool,
}

impl Surroundings {
    fn query(&mut self, center: Location, area: Polygon<f64>) {
        let seeds = match self.search_area.query(&area) {
            Ok(seeds) => seeds,
            Err(err) => {
                warn!(error = %err, "candidate query failed, continuing without targets");
                Vec::new()
            }
        };

        self.filter.set_candidates(
            seeds,
            self.proximity.target_height_m,
            self.elevation.as_ref(),
        );
        self.search_center = Some(center);
        self.search_polygon = Some(area);

        let targets: Vec<VisibilityTarget> = self
            .filter
            .candidates()
            .iter()
            .map(|candidate| VisibilityTarget {
                id: candidate.id,
                location: candidate.offset_location,
            })
            .collect();
        self.oracle.set_targets(&targets);
    }

    fn query_around(&mut self, center: Location) {
        let area = geodesic_buffer(
            &center,
            self.proximity.search_radius_meters(),
            self.proximity.buffer_segments,
        );
        self.query(center, area);
    }

    fn needs_requery(&self, location: &Location) -> bool {
        match self.search_center {
            Some(center) => {
                self.filter.distance_meters(&center, location)
                    > self.proximity.requery_distance_meters()
            }
            None => true,
        }
    }

    fn move_observer(&mut self, position: &Position, elapsed_minutes: f64) {
        let ground = Location::new(position.x, position.y);
        let heading = match self.observer {
            Some(previous) if previous.location.x != ground.x || previous.location.y != ground.y => {
                heading_degrees(&previous.location, &ground)
            }
            Some(previous) => previous.heading_degrees,
            None => 0.0,
        };

        if self.needs_requery(&ground) {
            self.query_around(ground);
        }
        self.filter.set_observer(ground);

        let elevated = self
            .elevation
            .elevate(ground, self.proximity.observer_height_m);
        self.oracle.set_observer(elevated);
        self.observer = Some(ObserverView {
            location: elevated,
            heading_degrees: heading,
            elapsed_minutes,
        });
    }

    fn reset(&mut self) {
        self.filter.clear();
        self.oracle.stop();
        self.oracle.clear();
        self.observer = None;
        self.search_center = None;
        self.search_polygon = None;
        self.completed = false;
    }
}

impl FrameSink for Surroundings {
    fn on_frame(&mut self, frame: &PlaybackFrame) {
        self.move_observer(&frame.position, frame.elapsed_minutes);
    }

    fn on_completed(&mut self, state: &PlaybackState) {
        self.completed = true;
        debug!(
            total_minutes = state.total_minutes,
            selected = self.filter.selection_count(),
            "tour reached the end of the route"
        );
    }
}

/// Orchestrates one active route at a time.
pub struct RouteTour {
    config: AppConfig,
    scheduler: PlaybackScheduler,
    frames: Box<dyn FrameScheduler>,
    solver: Box<dyn RouteSolver>,
    surroundings: Surroundings,
    stops: Vec<Location>,
    restart: Option<FrameToken>,
    timer_epoch: u64,
}

impl RouteTour {
    pub fn new(config: AppConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let Collaborators {
            solver,
            elevation,
            distance,
            search_area,
            oracle,
            frames,
        } = collaborators;
        let filter = ProximityFilter::with_distance(config.proximity.radius_meters, distance)?;

        Ok(Self {
            scheduler: PlaybackScheduler::new(config.playback.rate),
            frames,
            solver,
            surroundings: Surroundings {
                proximity: config.proximity.clone(),
                filter,
                elevation,
                search_area,
                oracle,
                observer: None,
                search_center: None,
                search_polygon: None,
                completed: false,
            },
            stops: Vec::new(),
            restart: None,
            timer_epoch: 0,
            config,
        })
    }

    /// Adds a stop the way map clicks do: the first stop starts a new
    /// route, the second solves it, every later stop moves the previous end
    /// to the start and solves again.
    pub fn add_stop(&mut self, location: Location) -> StopOutcome {
        match self.stops.len() {
            0 => {
                self.reset_route();
                self.stops.push(location);
                return StopOutcome::StartRecorded;
            }
            1 => self.stops.push(location),
            _ => {
                let previous_end = self.stops[1];
                self.stops = vec![previous_end, location];
            }
        }
        self.solve_stops()
    }

    fn solve_stops(&mut self) -> StopOutcome {
        let request = RouteRequest {
            start: self.stops[0],
            end: self.stops[1],
            travel_mode: self.config.route.travel_mode.clone(),
            start_time: SystemTime::now(),
        };

        let route = match self.solver.solve(&request) {
            Ok(route) => route,
            Err(err) => {
                warn!(error = %err, "no route available");
                return StopOutcome::NoRoute;
            }
        };

        let total_minutes = route.total_minutes;
        match self.route_available(route.into()) {
            Ok(()) => StopOutcome::RouteStarted { total_minutes },
            Err(err) => {
                warn!(error = %err, "solved route rejected");
                StopOutcome::NoRoute
            }
        }
    }

    /// Replaces whatever is playing with `route`. An invalid duration is
    /// rejected before any state is touched.
    pub fn route_available(&mut self, route: RouteAvailable) -> Result<()> {
        if !(route.total_minutes.is_finite() && route.total_minutes > 0.0) {
            return Err(TourError::invalid(format!(
                "route duration must be positive, got {}",
                route.total_minutes
            )));
        }

        self.reset_route();
        let origin = *route.path.start();
        self.surroundings.oracle.start();
        match route.search_area {
            Some(area) => self.surroundings.query(origin.location(), area),
            None => self.surroundings.query_around(origin.location()),
        }
        self.surroundings.move_observer(&origin, 0.0);
        self.scheduler
            .start(route.path, route.total_minutes, self.frames.as_mut())?;

        info!(
            total = %format_clock(route.total_minutes),
            candidates = self.surroundings.filter.candidates().len(),
            "route available"
        );
        Ok(())
    }

    /// Stops playback and clears the route, its stops and every derived
    /// display value.
    pub fn route_cleared(&mut self) {
        self.reset_route();
        self.stops.clear();
        info!("route cleared");
    }

    fn reset_route(&mut self) {
        self.scheduler.stop();
        self.surroundings.reset();
        self.restart = None;
    }

    /// Host callback for a frame requested through the [`FrameScheduler`].
    pub fn on_frame(&mut self, token: FrameToken, frame_delta_ms: f64) -> TickOutcome {
        let outcome = self.scheduler.tick(
            token,
            frame_delta_ms,
            self.frames.as_mut(),
            &mut self.surroundings,
        );
        if let TickOutcome::Advanced { completed: true, .. } = outcome {
            self.schedule_restart();
        }
        outcome
    }

    fn schedule_restart(&mut self) {
        if !self.config.playback.continuous_demo {
            return;
        }
        self.timer_epoch += 1;
        let token = FrameToken::new(self.timer_epoch);
        self.restart = Some(token);
        let delay = self.config.playback.demo_restart_delay();
        debug!(delay_ms = delay.as_millis() as u64, "scheduling demo restart");
        self.frames.request_timer(token, delay);
    }

    /// Host callback for a timer. Returns true when it restarted the route.
    pub fn on_timer(&mut self, token: FrameToken) -> bool {
        if self.restart != Some(token) {
            debug!(epoch = token.epoch(), "ignoring stale timer");
            return false;
        }
        self.restart = None;
        self.surroundings.completed = false;
        // Heading restarts with the lap.
        self.surroundings.observer = None;

        match self.scheduler.replay(self.frames.as_mut()) {
            Ok(_) => {
                info!("demo restart");
                true
            }
            Err(err) => {
                warn!(error = %err, "demo restart failed");
                false
            }
        }
    }

    /// Applies one report from the visibility oracle.
    pub fn on_visibility_changed(&mut self, event: VisibilityEvent) -> VisibilityUpdate {
        let update = self
            .surroundings
            .filter
            .on_visibility_changed(event.id, event.visible);
        if matches!(update, VisibilityUpdate::Selected | VisibilityUpdate::Deselected) {
            debug!(
                feature_id = event.id.feature_id,
                ?update,
                selected = self.surroundings.filter.selection_count(),
                "selection changed"
            );
        }
        update
    }

    /// Play/pause control. Returns the new status.
    pub fn toggle_playback(&mut self) -> Result<PlaybackStatus> {
        match self.scheduler.status() {
            PlaybackStatus::Running => self.scheduler.pause()?,
            PlaybackStatus::Paused => {
                self.scheduler.resume(self.frames.as_mut())?;
            }
            status => {
                return Err(TourError::InvalidTransition {
                    action: "toggle",
                    state: status.as_str(),
                })
            }
        }
        Ok(self.scheduler.status())
    }

    pub fn set_rate(&mut self, rate: PlaybackRate) {
        self.scheduler.set_rate(rate);
        self.config.playback.rate = rate;
    }

    /// Changes the proximity radius and queries candidates again around the
    /// current observer.
    pub fn set_radius(&mut self, radius_meters: f64) -> Result<()> {
        self.surroundings.filter.set_radius(radius_meters)?;
        self.surroundings.proximity.radius_meters = radius_meters;
        self.config.proximity.radius_meters = radius_meters;

        if let Some(observer) = self.surroundings.filter.observer() {
            self.surroundings.query_around(observer);
            self.surroundings.filter.set_observer(observer);
        }
        Ok(())
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn playback(&self) -> &PlaybackState {
        self.scheduler.state()
    }

    pub fn progress(&self) -> PlaybackProgress {
        self.scheduler.progress()
    }

    pub fn elapsed_clock(&self) -> String {
        format_clock(self.scheduler.progress().elapsed_minutes)
    }

    pub fn remaining_clock(&self) -> String {
        format_clock(self.scheduler.progress().remaining_minutes)
    }

    pub fn is_completed(&self) -> bool {
        self.surroundings.completed
    }

    pub fn stops(&self) -> &[Location] {
        &self.stops
    }

    pub fn observer(&self) -> Option<&ObserverView> {
        self.surroundings.observer.as_ref()
    }

    pub fn search_area(&self) -> Option<&Polygon<f64>> {
        self.surroundings.search_polygon.as_ref()
    }

    pub fn filter(&self) -> &ProximityFilter {
        &self.surroundings.filter
    }

    pub fn candidates(&self) -> &[Candidate] {
        self.surroundings.filter.candidates()
    }

    pub fn selection(&self) -> impl Iterator<Item = &Candidate> + '_ {
        self.surroundings.filter.selection()
    }

    pub fn selection_count(&self) -> usize {
        self.surroundings.filter.selection_count()
    }

    pub fn selection_summary(&self) -> SelectionSummary {
        self.surroundings.filter.selection_summary()
    }
}

impl fmt::Debug for RouteTour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteTour")
            .field("playback", self.scheduler.state())
            .field("filter", &self.surroundings.filter)
            .field("stops", &self.stops)
            .field("completed", &self.surroundings.completed)
            .finish()
    }
}
