//! Measured paths and the locator that turns a measure value into a position.

use geo::{HaversineBearing, Point};
use serde::{Deserialize, Serialize};

use crate::{Result, TourError};

/// Geographic location: `x` is longitude, `y` latitude (degrees), `z` an
/// optional elevation in meters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<f64>,
}

impl Location {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y, z: None }
    }

    pub fn with_z(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z: Some(z) }
    }

    /// Returns a copy of this location placed at elevation `z`.
    pub fn at_elevation(self, z: f64) -> Self {
        Self { z: Some(z), ..self }
    }

    pub fn to_point(&self) -> Point<f64> {
        Point::new(self.x, self.y)
    }
}

impl From<Location> for Point<f64> {
    fn from(location: Location) -> Self {
        location.to_point()
    }
}

/// A path vertex carrying a measure (distance or time along the path).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vertex {
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<f64>,
    pub m: f64,
}

/// Located positions have the same shape as vertices; `m` is the measure the
/// position was located at.
pub type Position = Vertex;

impl Vertex {
    pub fn new(x: f64, y: f64, m: f64) -> Self {
        Self { x, y, z: None, m }
    }

    pub fn with_z(x: f64, y: f64, z: f64, m: f64) -> Self {
        Self { x, y, z: Some(z), m }
    }

    pub fn location(&self) -> Location {
        Location {
            x: self.x,
            y: self.y,
            z: self.z,
        }
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite()
            && self.y.is_finite()
            && self.m.is_finite()
            && self.z.map_or(true, f64::is_finite)
    }
}

#[derive(Debug, Deserialize)]
struct PathParts {
    parts: Vec<Vec<Vertex>>,
}

/// Ordered parts of measured vertices.
///
/// Measures are non-decreasing inside each part. Nothing is enforced across
/// part boundaries; the locator bridges the gap between the last vertex of a
/// part and the first vertex of the next one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PathParts")]
pub struct MeasuredPath {
    parts: Vec<Vec<Vertex>>,
}

impl TryFrom<PathParts> for MeasuredPath {
    type Error = TourError;

    fn try_from(value: PathParts) -> Result<Self> {
        Self::new(value.parts)
    }
}

impl MeasuredPath {
    /// Builds a path, rejecting empty parts, non-finite values and measures
    /// that decrease within a part.
    pub fn new(parts: Vec<Vec<Vertex>>) -> Result<Self> {
        if parts.is_empty() {
            return Err(TourError::MalformedPath(
                "path requires at least one part".to_string(),
            ));
        }

        for (part_idx, part) in parts.iter().enumerate() {
            if part.is_empty() {
                return Err(TourError::MalformedPath(format!(
                    "part {part_idx} has no vertices"
                )));
            }
            if let Some(vertex_idx) = part.iter().position(|v| !v.is_finite()) {
                return Err(TourError::MalformedPath(format!(
                    "vertex {vertex_idx} of part {part_idx} is not finite"
                )));
            }
            if let Some(vertex_idx) = part.windows(2).position(|pair| pair[1].m < pair[0].m) {
                return Err(TourError::MalformedPath(format!(
                    "measure decreases after vertex {vertex_idx} of part {part_idx}"
                )));
            }
        }

        Ok(Self { parts })
    }

    /// Convenience constructor for a single-part path.
    pub fn single(vertices: Vec<Vertex>) -> Result<Self> {
        Self::new(vec![vertices])
    }

    pub fn parts(&self) -> &[Vec<Vertex>] {
        &self.parts
    }

    pub fn vertex_count(&self) -> usize {
        self.parts.iter().map(Vec::len).sum()
    }

    /// First vertex of the first part.
    pub fn start(&self) -> &Vertex {
        &self.parts[0][0]
    }

    /// Last vertex of the last part.
    pub fn end(&self) -> &Vertex {
        let last = &self.parts[self.parts.len() - 1];
        &last[last.len() - 1]
    }

    /// Measures of the start and end vertices.
    pub fn measure_range(&self) -> (f64, f64) {
        (self.start().m, self.end().m)
    }
}

/// Returns the position at `measure` along `path`.
///
/// The first vertex with `m >= measure` decides the segment. Measures before
/// the start clamp to the first vertex, measures past the end (and NaN)
/// clamp to the last vertex.
pub fn locate_along(path: &MeasuredPath, measure: f64) -> Result<Position> {
    let parts = path.parts();

    for (part_idx, part) in parts.iter().enumerate() {
        for (vertex_idx, vertex) in part.iter().enumerate() {
            let reached = vertex.m >= measure;
            if !reached {
                continue;
            }

            return match (part_idx, vertex_idx) {
                (0, 0) => Ok(*vertex),
                (_, 0) => {
                    let previous = parts[part_idx - 1].last().ok_or_else(|| {
                        TourError::MalformedPath(format!("part {} is empty", part_idx - 1))
                    })?;
                    interpolate_between(previous, vertex, measure)
                }
                _ => interpolate_between(&part[vertex_idx - 1], vertex, measure),
            };
        }
    }

    Ok(*path.end())
}

fn interpolate_between(a: &Vertex, b: &Vertex, measure: f64) -> Result<Position> {
    let span = a.m - b.m;
    if span == 0.0 {
        return Err(TourError::DegenerateSegment { measure: a.m });
    }

    let t = (a.m - measure) / span;
    let z = match (a.z, b.z) {
        (Some(za), Some(zb)) => Some(za + (zb - za) * t),
        _ => None,
    };

    Ok(Position {
        x: a.x + (b.x - a.x) * t,
        y: a.y + (b.y - a.y) * t,
        z,
        m: measure,
    })
}

/// Initial great-circle bearing in degrees (0 = north, clockwise) from
/// `from` to `to`. Returns 0 for coincident points.
pub fn heading_degrees(from: &Location, to: &Location) -> f64 {
    if from.x == to.x && from.y == to.y {
        return 0.0;
    }
    from.to_point()
        .haversine_bearing(to.to_point())
        .rem_euclid(360.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    fn straight_path() -> MeasuredPath {
        MeasuredPath::single(vec![Vertex::new(0.0, 0.0, 0.0), Vertex::new(10.0, 0.0, 10.0)])
            .unwrap()
    }

    #[test]
    fn interpolates_inside_a_segment() {
        let position = locate_along(&straight_path(), 5.0).unwrap();
        assert_abs_diff_eq!(position.x, 5.0);
        assert_abs_diff_eq!(position.y, 0.0);
        assert_abs_diff_eq!(position.m, 5.0);
    }

    #[test]
    fn clamps_to_path_ends() {
        let path = straight_path();
        assert_eq!(locate_along(&path, -1.0).unwrap(), Vertex::new(0.0, 0.0, 0.0));
        assert_eq!(locate_along(&path, 999.0).unwrap(), Vertex::new(10.0, 0.0, 10.0));
        assert_eq!(locate_along(&path, f64::NAN).unwrap(), Vertex::new(10.0, 0.0, 10.0));
    }

    #[test]
    fn exact_vertex_measure_lands_on_the_vertex() {
        let path = MeasuredPath::single(vec![
            Vertex::new(0.0, 0.0, 0.0),
            Vertex::new(4.0, 0.0, 4.0),
            Vertex::new(4.0, 6.0, 10.0),
        ])
        .unwrap();

        let position = locate_along(&path, 4.0).unwrap();
        assert_abs_diff_eq!(position.x, 4.0);
        assert_abs_diff_eq!(position.y, 0.0);

        let position = locate_along(&path, 7.0).unwrap();
        assert_abs_diff_eq!(position.x, 4.0);
        assert_abs_diff_eq!(position.y, 3.0);
    }

    #[test]
    fn contiguous_parts_resolve_inside_the_earlier_part() {
        let path = MeasuredPath::new(vec![
            vec![Vertex::new(0.0, 0.0, 0.0), Vertex::new(5.0, 0.0, 5.0)],
            vec![Vertex::new(5.0, 5.0, 5.0), Vertex::new(5.0, 10.0, 10.0)],
        ])
        .unwrap();

        let position = locate_along(&path, 5.0).unwrap();
        assert_abs_diff_eq!(position.x, 5.0);
        assert_abs_diff_eq!(position.y, 0.0);

        let position = locate_along(&path, 7.5).unwrap();
        assert_abs_diff_eq!(position.x, 5.0);
        assert_abs_diff_eq!(position.y, 7.5);
    }

    #[test]
    fn bridges_the_gap_between_parts() {
        let path = MeasuredPath::new(vec![
            vec![Vertex::new(0.0, 0.0, 0.0), Vertex::new(5.0, 0.0, 5.0)],
            vec![Vertex::new(5.0, 5.0, 8.0), Vertex::new(5.0, 10.0, 10.0)],
        ])
        .unwrap();

        let position = locate_along(&path, 6.0).unwrap();
        assert_abs_diff_eq!(position.x, 5.0);
        assert_abs_diff_eq!(position.y, 5.0 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(position.m, 6.0);
    }

    #[test]
    fn interpolates_elevation_only_when_both_ends_have_it() {
        let path = MeasuredPath::single(vec![
            Vertex::with_z(0.0, 0.0, 100.0, 0.0),
            Vertex::with_z(2.0, 0.0, 120.0, 2.0),
            Vertex::new(4.0, 0.0, 4.0),
        ])
        .unwrap();

        let position = locate_along(&path, 1.0).unwrap();
        assert_abs_diff_eq!(position.z.unwrap(), 110.0);

        let position = locate_along(&path, 3.0).unwrap();
        assert!(position.z.is_none());
    }

    #[test]
    fn degenerate_segment_is_rejected() {
        let a = Vertex::new(0.0, 0.0, 3.0);
        let b = Vertex::new(1.0, 0.0, 3.0);
        let err = interpolate_between(&a, &b, 3.0).unwrap_err();
        assert!(matches!(err, TourError::DegenerateSegment { .. }));
    }

    #[test]
    fn repeated_measures_inside_a_part_never_hit_the_degenerate_guard() {
        let path = MeasuredPath::single(vec![
            Vertex::new(0.0, 0.0, 0.0),
            Vertex::new(1.0, 0.0, 2.0),
            Vertex::new(1.0, 1.0, 2.0),
            Vertex::new(2.0, 1.0, 4.0),
        ])
        .unwrap();

        for measure in [0.0, 1.0, 2.0, 3.0, 4.0] {
            assert!(locate_along(&path, measure).is_ok());
        }
    }

    #[test]
    fn rejects_malformed_paths() {
        assert!(MeasuredPath::new(vec![]).is_err());
        assert!(MeasuredPath::new(vec![vec![]]).is_err());
        assert!(MeasuredPath::single(vec![
            Vertex::new(0.0, 0.0, 5.0),
            Vertex::new(1.0, 0.0, 4.0),
        ])
        .is_err());
        assert!(MeasuredPath::single(vec![Vertex::new(f64::NAN, 0.0, 0.0)]).is_err());
    }

    #[test]
    fn deserializes_and_validates_json() {
        let path: MeasuredPath = serde_json::from_str(
            r#"{"parts": [[{"x": 0.0, "y": 0.0, "m": 0.0}, {"x": 1.0, "y": 1.0, "z": 5.0, "m": 2.0}]]}"#,
        )
        .unwrap();
        assert_eq!(path.vertex_count(), 2);
        assert_eq!(path.measure_range(), (0.0, 2.0));

        let broken = serde_json::from_str::<MeasuredPath>(r#"{"parts": []}"#);
        assert!(broken.is_err());
    }

    #[test]
    fn heading_follows_compass_convention() {
        let origin = Location::new(0.0, 0.0);
        let heading = |to: Location| heading_degrees(&origin, &to);
        assert_abs_diff_eq!(heading(Location::new(0.0, 1.0)), 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(heading(Location::new(1.0, 0.0)), 90.0, epsilon = 1e-9);
        assert_abs_diff_eq!(heading(Location::new(0.0, -1.0)), 180.0, epsilon = 1e-9);
        assert_abs_diff_eq!(heading(Location::new(-1.0, 0.0)), 270.0, epsilon = 1e-9);
        assert_eq!(heading(origin), 0.0);
    }

    #[test]
    fn heading_is_a_true_bearing_away_from_the_equator() {
        use geo::HaversineDestination;

        let origin = Location::new(0.0, 40.0);
        for bearing in [45.0, 135.0, 300.0] {
            let target = origin.to_point().haversine_destination(bearing, 1_000.0);
            let target = Location::new(target.x(), target.y());
            assert_abs_diff_eq!(heading_degrees(&origin, &target), bearing, epsilon = 1e-6);
        }
    }

    proptest! {
        #[test]
        fn located_positions_stay_on_the_segment(measure in -20.0f64..40.0) {
            let path = MeasuredPath::single(vec![
                Vertex::new(0.0, 0.0, 0.0),
                Vertex::new(10.0, 0.0, 10.0),
                Vertex::new(10.0, 10.0, 20.0),
            ])
            .unwrap();

            let position = locate_along(&path, measure).unwrap();
            prop_assert!((0.0..=10.0).contains(&position.x));
            prop_assert!((0.0..=10.0).contains(&position.y));
            if (0.0..=20.0).contains(&measure) {
                prop_assert!((position.m - measure).abs() < 1e-9);
            }
        }
    }
}
