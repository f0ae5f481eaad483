use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{PlaybackRate, Result, TourError};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub playback: PlaybackConfig,
    pub proximity: ProximityConfig,
    pub route: RouteConfig,
}

impl AppConfig {
    /// Reads a JSON config file. Missing sections and fields fall back to
    /// their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let proximity = &self.proximity;
        positive("proximity.radius_meters", proximity.radius_meters)?;
        if !(proximity.requery_fraction.is_finite() && proximity.requery_fraction >= 0.0) {
            return Err(TourError::invalid(format!(
                "proximity.requery_fraction must be zero or positive, got {}",
                proximity.requery_fraction
            )));
        }
        if !proximity.observer_height_m.is_finite() || !proximity.target_height_m.is_finite() {
            return Err(TourError::invalid("proximity heights must be finite"));
        }
        positive("route.speed_kmh", self.route.speed_kmh)?;
        if self.route.travel_mode.trim().is_empty() {
            return Err(TourError::invalid("route.travel_mode must not be empty"));
        }
        Ok(())
    }
}

fn positive(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(TourError::invalid(format!("{name} must be positive, got {value}")))
    }
}

/// Configuration of the playback loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub rate: PlaybackRate,
    /// Replay the route after it completes.
    pub continuous_demo: bool,
    pub demo_restart_delay_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            rate: PlaybackRate::DEMO,
            continuous_demo: false,
            demo_restart_delay_ms: 3_000,
        }
    }
}

impl PlaybackConfig {
    pub fn demo_restart_delay(&self) -> Duration {
        Duration::from_millis(self.demo_restart_delay_ms)
    }
}

/// Configuration of the proximity search around the observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProximityConfig {
    pub radius_meters: f64,
    /// Fraction of the radius the observer may drift from the last query
    /// centre before candidates are queried again.
    pub requery_fraction: f64,
    pub observer_height_m: f64,
    pub target_height_m: f64,
    pub buffer_segments: usize,
}

impl Default for ProximityConfig {
    fn default() -> Self {
        Self {
            // 400 ft
            radius_meters: 121.92,
            requery_fraction: 0.5,
            observer_height_m: 2.0,
            target_height_m: 0.0,
            buffer_segments: 64,
        }
    }
}

impl ProximityConfig {
    pub fn requery_distance_meters(&self) -> f64 {
        self.radius_meters * self.requery_fraction
    }

    /// Radius of the queried buffer. Any candidate within `radius_meters` of
    /// an observer that has not drifted past the re-query distance lies
    /// inside it.
    pub fn search_radius_meters(&self) -> f64 {
        self.radius_meters + self.requery_distance_meters()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    pub travel_mode: String,
    /// Travel speed used by the straight-line solver.
    pub speed_kmh: f64,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            travel_mode: "driving".to_string(),
            speed_kmh: 40.0,
        }
    }
}
