use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::mpsc,
    thread,
    time::Duration,
};

use clap::{Parser, Subcommand};
use geo::{LineString, Polygon};
use route_tour_core::{
    locate_along,
    services::memory::{
        ConstantElevation, FrameQueue, InMemorySearchArea, ObstructionOracle, StraightLineSolver,
    },
    AppConfig, CandidateSeed, Collaborators, HaversineMeters, Location, MeasuredPath,
    PlaybackRate, RouteAvailable, RouteTour, SelectionSummary, StopOutcome, TickOutcome,
    TourError,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

fn main() -> route_tour_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Play(args) => run_play(args),
        Commands::Locate { path, measure } => run_locate(&path, measure),
    }
}

fn run_play(args: PlayArgs) -> route_tour_core::Result<()> {
    let mut config = match &args.config {
        Some(path) => AppConfig::from_json_file(path)?,
        None => AppConfig::default(),
    };
    if let Some(rate) = args.rate {
        config.playback.rate = rate;
    }
    tracing::info!(scenario = ?args.scenario, rate = config.playback.rate.seconds_per_sim_hour(), "starting tour");

    let scenario = Scenario::from_json_file(&args.scenario)?;
    let frames = FrameQueue::new();
    let (events_tx, events) = mpsc::channel();
    let obstructions = scenario.obstruction_polygons();

    let collaborators = Collaborators {
        solver: Box::new(StraightLineSolver::new(config.route.speed_kmh)?),
        elevation: Box::new(ConstantElevation::new(scenario.ground_elevation_m)),
        distance: Box::new(HaversineMeters),
        search_area: Box::new(InMemorySearchArea::new(scenario.candidates)),
        oracle: Box::new(ObstructionOracle::new(obstructions, events_tx)),
        frames: Box::new(frames.clone()),
    };
    let mut tour = RouteTour::new(config, collaborators)?;

    let mut stops = scenario.stops.into_iter();
    match scenario.route {
        Some(route) => {
            let path = route.path;
            tour.route_available(RouteAvailable {
                path,
                total_minutes: route.total_minutes,
                search_area: None,
            })?;
        }
        None => next_leg(&mut tour, &mut stops)?,
    }

    let mut report = TourReport::default();
    let mut last_selection = SelectionSummary::default();
    loop {
        if let Some(token) = frames.next_frame() {
            let outcome = tour.on_frame(token, args.frame_ms);
            for event in events.try_iter() {
                tour.on_visibility_changed(event);
            }
            report.frames += 1;

            let selection = tour.selection_summary();
            if selection != last_selection {
                tracing::info!(
                    elapsed = %tour.elapsed_clock(),
                    remaining = %tour.remaining_clock(),
                    selected = selection.total,
                    free = selection.free,
                    fee = selection.fee,
                    "selection changed"
                );
                last_selection = selection;
            }
            report.record_selection(tour.selection().map(|c| c.attributes.name.as_str()));

            if let TickOutcome::Advanced { completed: true, .. } = outcome {
                report.legs_completed += 1;
                tracing::info!(total = %tour.elapsed_clock(), "leg completed");
            }
            if report.frames >= args.max_frames {
                tracing::warn!(max_frames = args.max_frames, "frame budget exhausted");
                break;
            }
            if args.paced {
                thread::sleep(Duration::from_secs_f64(args.frame_ms / 1000.0));
            }
            continue;
        }

        if let Some((token, delay)) = frames.next_timer() {
            tracing::info!(delay_ms = delay.as_millis() as u64, "demo restart");
            if args.paced {
                thread::sleep(delay);
            }
            tour.on_timer(token);
            continue;
        }

        if stops.len() == 0 {
            break;
        }
        next_leg(&mut tour, &mut stops)?;
    }

    report.stale_events = tour.filter().stale_events();
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Feeds stops to the tour until a route starts or the stops run out.
fn next_leg(
    tour: &mut RouteTour,
    stops: &mut impl Iterator<Item = Location>,
) -> route_tour_core::Result<()> {
    for stop in stops.by_ref() {
        match tour.add_stop(stop) {
            StopOutcome::StartRecorded => continue,
            StopOutcome::RouteStarted { total_minutes } => {
                tracing::info!(total_minutes, "route started");
                return Ok(());
            }
            StopOutcome::NoRoute => tracing::warn!(?stop, "no route to stop"),
        }
    }
    Ok(())
}

fn run_locate(path: &Path, measure: f64) -> route_tour_core::Result<()> {
    tracing::info!(?path, measure, "locating position");
    let raw = std::fs::read_to_string(path)?;
    let path: MeasuredPath = serde_json::from_str(&raw)?;
    let position = locate_along(&path, measure)?;
    println!("{}", serde_json::to_string_pretty(&position)?);
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

/// Scenario file consumed by `play`.
#[derive(Debug, Deserialize)]
struct Scenario {
    #[serde(default)]
    stops: Vec<Location>,
    /// Pre-solved route; when present the stops are only used for later legs.
    #[serde(default)]
    route: Option<ScenarioRoute>,
    #[serde(default)]
    candidates: Vec<CandidateSeed>,
    /// Building footprints as rings of `[x, y]` pairs.
    #[serde(default)]
    obstructions: Vec<Vec<[f64; 2]>>,
    #[serde(default)]
    ground_elevation_m: f64,
}

#[derive(Debug, Deserialize)]
struct ScenarioRoute {
    path: MeasuredPath,
    total_minutes: f64,
}

impl Scenario {
    fn from_json_file(path: &Path) -> route_tour_core::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let scenario: Self = serde_json::from_str(&raw)?;
        if scenario.route.is_none() && scenario.stops.len() < 2 {
            return Err(TourError::msg(format!(
                "scenario `{}` needs a route or at least two stops",
                path.display()
            )));
        }
        Ok(scenario)
    }

    fn obstruction_polygons(&self) -> Vec<Polygon<f64>> {
        self.obstructions
            .iter()
            .filter(|ring| ring.len() >= 3)
            .map(|ring| {
                let coords: Vec<(f64, f64)> = ring.iter().map(|[x, y]| (*x, *y)).collect();
                Polygon::new(LineString::from(coords), vec![])
            })
            .collect()
    }
}

#[derive(Debug, Default, Serialize)]
struct TourReport {
    frames: u64,
    legs_completed: u32,
    peak_selection: usize,
    selected_features: BTreeSet<String>,
    stale_events: u64,
}

impl TourReport {
    fn record_selection<'a>(&mut self, names: impl Iterator<Item = &'a str>) {
        let mut selected = 0;
        for name in names {
            selected += 1;
            if !self.selected_features.contains(name) {
                self.selected_features.insert(name.to_string());
            }
        }
        self.peak_selection = self.peak_selection.max(selected);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Route playback with proximity-filtered visibility", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Play a scenario headlessly and print a summary.
    Play(PlayArgs),
    /// Print the position at a measure along a path file.
    Locate {
        /// JSON file holding a measured path.
        path: PathBuf,
        /// Measure value to locate.
        #[arg(allow_negative_numbers = true)]
        measure: f64,
    },
}

#[derive(clap::Args, Debug)]
struct PlayArgs {
    /// Scenario file with stops, candidates and obstructions.
    scenario: PathBuf,
    /// Optional JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Playback rate: `demo`, `real-time` or wall seconds per simulated hour.
    #[arg(short, long)]
    rate: Option<PlaybackRate>,
    /// Wall-clock duration of one frame in milliseconds.
    #[arg(long, default_value_t = 1000.0 / 60.0)]
    frame_ms: f64,
    /// Stop after this many frames.
    #[arg(long, default_value_t = 100_000)]
    max_frames: u64,
    /// Sleep between frames and timers instead of running flat out.
    #[arg(long)]
    paced: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_keeps_each_selected_feature_once() {
        let mut report = TourReport::default();
        for _ in 0..1_000 {
            report.record_selection(["Library", "Museum"].into_iter());
        }
        report.record_selection(["Library"].into_iter());

        assert_eq!(report.selected_features.len(), 2);
        assert_eq!(report.peak_selection, 2);
        assert!(report.selected_features.contains("Museum"));
    }

    #[test]
    fn obstruction_rings_need_three_corners() {
        let scenario: Scenario = serde_json::from_str(
            r#"{
                "route": {
                    "path": {"parts": [[{"x": 0.0, "y": 0.0, "m": 0.0}, {"x": 0.0, "y": 0.01, "m": 1.0}]]},
                    "total_minutes": 1.0
                },
                "obstructions": [[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0]], [[0.0, 0.0], [1.0, 1.0]]]
            }"#,
        )
        .unwrap();

        assert_eq!(scenario.obstruction_polygons().len(), 1);
        assert!(scenario.stops.is_empty());
    }
}
