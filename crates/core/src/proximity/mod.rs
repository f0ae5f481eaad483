use std::{
    collections::{BTreeSet, HashMap},
    fmt,
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{ElevationLookup, GeodesicDistance, HaversineMeters, Location, Result, TourError};

/// Identifies a candidate within one generation of the candidate set.
///
/// The generation changes on every [`ProximityFilter::set_candidates`], so
/// ids handed out before a replacement never match the new set even when the
/// same feature is queried again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CandidateId {
    pub generation: u64,
    pub feature_id: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    #[default]
    Free,
    Fee,
}

/// Display attributes carried by a candidate feature.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CandidateAttributes {
    pub name: String,
    pub address: String,
    pub access: Access,
}

/// A feature returned by a search-area query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateSeed {
    pub feature_id: u64,
    pub location: Location,
    #[serde(default)]
    pub attributes: CandidateAttributes,
}

impl CandidateSeed {
    pub fn new(feature_id: u64, location: Location) -> Self {
        Self {
            feature_id,
            location,
            attributes: CandidateAttributes::default(),
        }
    }

    pub fn with_attributes(mut self, attributes: CandidateAttributes) -> Self {
        self.attributes = attributes;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub id: CandidateId,
    pub raw_location: Location,
    /// Elevation-adjusted location handed to the visibility oracle.
    pub offset_location: Location,
    pub visible: bool,
    pub within_radius: bool,
    pub attributes: CandidateAttributes,
}

impl Candidate {
    pub fn is_selected(&self) -> bool {
        self.visible && self.within_radius
    }
}

/// Result of applying one visibility report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityUpdate {
    Selected,
    Deselected,
    Unchanged,
    /// The report named a candidate that is not in the current set.
    Stale,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SelectionSummary {
    pub total: usize,
    pub free: usize,
    pub fee: usize,
}

/// Tracks which candidates are within `radius_meters` of the observer and
/// which of those the visibility oracle currently reports as visible.
pub struct ProximityFilter {
    radius_meters: f64,
    distance: Box<dyn GeodesicDistance>,
    generation: u64,
    candidates: Vec<Candidate>,
    by_feature: HashMap<u64, usize>,
    selected: BTreeSet<usize>,
    observer: Option<Location>,
    stale_events: u64,
}

impl ProximityFilter {
    /// Creates a filter that measures great-circle distance with the
    /// haversine formula.
    pub fn new(radius_meters: f64) -> Result<Self> {
        Self::with_distance(radius_meters, Box::new(HaversineMeters))
    }

    pub fn with_distance(radius_meters: f64, distance: Box<dyn GeodesicDistance>) -> Result<Self> {
        validate_radius(radius_meters)?;
        Ok(Self {
            radius_meters,
            distance,
            generation: 0,
            candidates: Vec::new(),
            by_feature: HashMap::new(),
            selected: BTreeSet::new(),
            observer: None,
            stale_events: 0,
        })
    }

    pub fn radius_meters(&self) -> f64 {
        self.radius_meters
    }

    /// Distance between two locations, measured the way the radius check
    /// measures it.
    pub fn distance_meters(&self, a: &Location, b: &Location) -> f64 {
        self.distance.distance_meters(a, b)
    }

    pub fn observer(&self) -> Option<Location> {
        self.observer
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn candidate(&self, id: CandidateId) -> Option<&Candidate> {
        self.index_of(id).map(|index| &self.candidates[index])
    }

    /// Number of visibility reports ignored because their candidate was no
    /// longer part of the set.
    pub fn stale_events(&self) -> u64 {
        self.stale_events
    }

    /// Replaces the candidate set. Visibility starts out false for every
    /// candidate, so the selection is empty afterwards.
    pub fn set_candidates(
        &mut self,
        seeds: Vec<CandidateSeed>,
        elevation_offset: f64,
        elevation: &dyn ElevationLookup,
    ) {
        self.generation += 1;
        self.candidates.clear();
        self.by_feature.clear();
        self.selected.clear();

        for seed in seeds {
            if self.by_feature.contains_key(&seed.feature_id) {
                debug!(feature_id = seed.feature_id, "skipping duplicate candidate");
                continue;
            }
            let within_radius = self
                .observer
                .map_or(false, |observer| self.is_within(&observer, &seed.location));
            self.by_feature.insert(seed.feature_id, self.candidates.len());
            self.candidates.push(Candidate {
                id: CandidateId {
                    generation: self.generation,
                    feature_id: seed.feature_id,
                },
                raw_location: seed.location,
                offset_location: elevation.elevate(seed.location, elevation_offset),
                visible: false,
                within_radius,
                attributes: seed.attributes,
            });
        }

        debug!(
            generation = self.generation,
            candidates = self.candidates.len(),
            "candidate set replaced"
        );
    }

    /// Moves the observer and re-evaluates every candidate's distance.
    /// Visible candidates that leave the radius drop out of the selection
    /// immediately; visible candidates that enter it are selected.
    pub fn set_observer(&mut self, observer: Location) {
        self.observer = Some(observer);
        self.refresh_proximity();
    }

    pub fn set_radius(&mut self, radius_meters: f64) -> Result<()> {
        validate_radius(radius_meters)?;
        self.radius_meters = radius_meters;
        self.refresh_proximity();
        Ok(())
    }

    pub fn on_visibility_changed(&mut self, id: CandidateId, visible: bool) -> VisibilityUpdate {
        let Some(index) = self.index_of(id) else {
            self.stale_events += 1;
            debug!(?id, generation = self.generation, "ignoring stale visibility event");
            return VisibilityUpdate::Stale;
        };

        let candidate = &mut self.candidates[index];
        candidate.visible = visible;
        let selected = candidate.is_selected();

        match (self.selected.contains(&index), selected) {
            (false, true) => {
                self.selected.insert(index);
                VisibilityUpdate::Selected
            }
            (true, false) => {
                self.selected.remove(&index);
                VisibilityUpdate::Deselected
            }
            _ => VisibilityUpdate::Unchanged,
        }
    }

    /// Selected candidates in query order.
    pub fn selection(&self) -> impl Iterator<Item = &Candidate> + '_ {
        self.selected.iter().map(move |&index| &self.candidates[index])
    }

    pub fn selection_count(&self) -> usize {
        self.selected.len()
    }

    pub fn selection_summary(&self) -> SelectionSummary {
        self.selection().fold(SelectionSummary::default(), |mut summary, candidate| {
            summary.total += 1;
            match candidate.attributes.access {
                Access::Free => summary.free += 1,
                Access::Fee => summary.fee += 1,
            }
            summary
        })
    }

    pub fn clear(&mut self) {
        self.generation += 1;
        self.candidates.clear();
        self.by_feature.clear();
        self.selected.clear();
        self.observer = None;
    }

    fn index_of(&self, id: CandidateId) -> Option<usize> {
        if id.generation != self.generation {
            return None;
        }
        self.by_feature.get(&id.feature_id).copied()
    }

    fn is_within(&self, observer: &Location, target: &Location) -> bool {
        self.distance.distance_meters(observer, target) <= self.radius_meters
    }

    fn refresh_proximity(&mut self) {
        let Some(observer) = self.observer else {
            return;
        };

        let mut entered = 0usize;
        let mut left = 0usize;
        for index in 0..self.candidates.len() {
            let within = self.is_within(&observer, &self.candidates[index].raw_location);
            let candidate = &mut self.candidates[index];
            candidate.within_radius = within;

            if candidate.is_selected() {
                if self.selected.insert(index) {
                    entered += 1;
                }
            } else if self.selected.remove(&index) {
                left += 1;
            }
        }

        if entered > 0 || left > 0 {
            debug!(entered, left, selected = self.selected.len(), "selection moved with observer");
        }
    }
}

fn validate_radius(radius_meters: f64) -> Result<()> {
    if radius_meters.is_finite() && radius_meters > 0.0 {
        Ok(())
    } else {
        Err(TourError::invalid(format!(
            "proximity radius must be positive, got {radius_meters}"
        )))
    }
}

impl fmt::Debug for ProximityFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProximityFilter")
            .field("radius_meters", &self.radius_meters)
            .field("generation", &self.generation)
            .field("candidates", &self.candidates.len())
            .field("selected", &self.selected.len())
            .field("observer", &self.observer)
            .field("stale_events", &self.stale_events)
            .finish()
    }
}
