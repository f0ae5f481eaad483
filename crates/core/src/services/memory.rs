//! In-memory collaborators used by the command line host and by tests.
//!
//! Handles that need to be inspected after being boxed into a
//! [`RouteTour`](crate::RouteTour) share their state through `Rc`, matching
//! the single-threaded frame loop they run in.

use std::{
    cell::{Cell, RefCell},
    collections::{BTreeMap, HashMap, VecDeque},
    rc::Rc,
    sync::mpsc::Sender,
    time::Duration,
};

use geo::{Contains, Intersects, Line, Polygon};
use tracing::debug;

use crate::{
    CandidateId, CandidateSeed, ElevationLookup, FrameScheduler, FrameToken, GeodesicDistance,
    HaversineMeters, Location, MeasuredPath, Result, RouteRequest, RouteSolver, SearchAreaQuery,
    SolvedRoute, TourError, Vertex, VisibilityEvent, VisibilityOracle, VisibilityTarget,
};

/// Flat terrain at a fixed height.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConstantElevation {
    ground_m: f64,
}

impl ConstantElevation {
    pub fn new(ground_m: f64) -> Self {
        Self { ground_m }
    }
}

impl ElevationLookup for ConstantElevation {
    fn elevate(&self, location: Location, offset: f64) -> Location {
        location.at_elevation(self.ground_m + offset)
    }
}

/// Solves every request with a straight two-vertex path travelled at a
/// constant speed. Measures are minutes from departure.
#[derive(Debug, Clone)]
pub struct StraightLineSolver {
    speed_kmh: f64,
    failing: Rc<Cell<bool>>,
    solved: Rc<Cell<usize>>,
}

impl StraightLineSolver {
    pub fn new(speed_kmh: f64) -> Result<Self> {
        if !(speed_kmh.is_finite() && speed_kmh > 0.0) {
            return Err(TourError::invalid(format!(
                "solver speed must be positive, got {speed_kmh}"
            )));
        }
        Ok(Self {
            speed_kmh,
            failing: Rc::new(Cell::new(false)),
            solved: Rc::new(Cell::new(0)),
        })
    }

    /// Makes subsequent solves fail as if the routing service were down.
    pub fn set_failing(&self, failing: bool) {
        self.failing.set(failing);
    }

    pub fn solved(&self) -> usize {
        self.solved.get()
    }
}

impl RouteSolver for StraightLineSolver {
    fn solve(&mut self, request: &RouteRequest) -> Result<SolvedRoute> {
        if self.failing.get() {
            return Err(TourError::NoRouteAvailable(
                "routing service unavailable".to_string(),
            ));
        }

        let meters = HaversineMeters.distance_meters(&request.start, &request.end);
        let total_minutes = meters / (self.speed_kmh * 1000.0 / 60.0);
        if total_minutes <= 0.0 {
            return Err(TourError::NoRouteAvailable(
                "start and end stops coincide".to_string(),
            ));
        }

        let path = MeasuredPath::single(vec![
            vertex_at(&request.start, 0.0),
            vertex_at(&request.end, total_minutes),
        ])?;

        let mut attributes = BTreeMap::new();
        attributes.insert("total_travel_time".to_string(), total_minutes.into());
        attributes.insert("total_kilometers".to_string(), (meters / 1000.0).into());
        attributes.insert("travel_mode".to_string(), request.travel_mode.clone().into());

        self.solved.set(self.solved.get() + 1);
        Ok(SolvedRoute {
            path,
            total_minutes,
            attributes,
        })
    }
}

fn vertex_at(location: &Location, m: f64) -> Vertex {
    Vertex {
        x: location.x,
        y: location.y,
        z: location.z,
        m,
    }
}

/// Feature layer held in memory; queries return the features inside the
/// search polygon.
#[derive(Debug, Clone, Default)]
pub struct InMemorySearchArea {
    features: Rc<Vec<CandidateSeed>>,
    failing: Rc<Cell<bool>>,
    queries: Rc<Cell<usize>>,
}

impl InMemorySearchArea {
    pub fn new(features: Vec<CandidateSeed>) -> Self {
        Self {
            features: Rc::new(features),
            ..Self::default()
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.set(failing);
    }

    pub fn queries(&self) -> usize {
        self.queries.get()
    }
}

impl SearchAreaQuery for InMemorySearchArea {
    fn query(&mut self, area: &Polygon<f64>) -> Result<Vec<CandidateSeed>> {
        self.queries.set(self.queries.get() + 1);
        if self.failing.get() {
            return Err(TourError::CandidateQuery("feature layer unavailable".to_string()));
        }
        Ok(self
            .features
            .iter()
            .filter(|seed| area.contains(&seed.location.to_point()))
            .cloned()
            .collect())
    }
}

/// Line of sight blocked by footprint polygons. Reports only flips, through
/// the channel the host drains between frames.
#[derive(Debug)]
pub struct ObstructionOracle {
    obstructions: Vec<Polygon<f64>>,
    events: Sender<VisibilityEvent>,
    active: bool,
    observer: Option<Location>,
    targets: Vec<VisibilityTarget>,
    reported: HashMap<CandidateId, bool>,
}

impl ObstructionOracle {
    pub fn new(obstructions: Vec<Polygon<f64>>, events: Sender<VisibilityEvent>) -> Self {
        Self {
            obstructions,
            events,
            active: false,
            observer: None,
            targets: Vec::new(),
            reported: HashMap::new(),
        }
    }

    fn is_visible(&self, observer: &Location, target: &Location) -> bool {
        let sight = Line::new(observer.to_point(), target.to_point());
        !self
            .obstructions
            .iter()
            .any(|footprint| sight.intersects(footprint))
    }

    fn analyse(&mut self) {
        if !self.active {
            return;
        }
        let Some(observer) = self.observer else {
            return;
        };

        for target in &self.targets {
            let visible = self.is_visible(&observer, &target.location);
            let previous = self.reported.insert(target.id, visible).unwrap_or(false);
            if previous != visible {
                let event = VisibilityEvent {
                    id: target.id,
                    visible,
                };
                if self.events.send(event).is_err() {
                    debug!("visibility listener dropped");
                }
            }
        }
    }
}

impl VisibilityOracle for ObstructionOracle {
    fn start(&mut self) {
        self.active = true;
        self.analyse();
    }

    fn stop(&mut self) {
        self.active = false;
    }

    fn clear(&mut self) {
        self.observer = None;
        self.targets.clear();
        self.reported.clear();
    }

    fn set_observer(&mut self, observer: Location) {
        self.observer = Some(observer);
        self.analyse();
    }

    fn set_targets(&mut self, targets: &[VisibilityTarget]) {
        self.targets = targets.to_vec();
        self.reported
            .retain(|id, _| targets.iter().any(|target| target.id == *id));
        self.analyse();
    }
}

#[derive(Debug, Default)]
struct QueuedCallbacks {
    frames: VecDeque<FrameToken>,
    timers: VecDeque<(FrameToken, Duration)>,
}

/// Records frame and timer requests so a host loop (or a test) can replay
/// them in order.
#[derive(Debug, Clone, Default)]
pub struct FrameQueue {
    inner: Rc<RefCell<QueuedCallbacks>>,
}

impl FrameQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_frame(&self) -> Option<FrameToken> {
        self.inner.borrow_mut().frames.pop_front()
    }

    pub fn next_timer(&self) -> Option<(FrameToken, Duration)> {
        self.inner.borrow_mut().timers.pop_front()
    }

    pub fn pending_frames(&self) -> usize {
        self.inner.borrow().frames.len()
    }

    pub fn pending_timers(&self) -> usize {
        self.inner.borrow().timers.len()
    }
}

impl FrameScheduler for FrameQueue {
    fn request_frame(&mut self, token: FrameToken) {
        self.inner.borrow_mut().frames.push_back(token);
    }

    fn request_timer(&mut self, token: FrameToken, delay: Duration) {
        self.inner.borrow_mut().timers.push_back((token, delay));
    }
}
