use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{locate_along, FrameScheduler, MeasuredPath, Position, Result, TourError};

/// Playback speed expressed as wall-clock seconds per simulated hour.
/// Larger values play back slower.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct PlaybackRate(f64);

impl PlaybackRate {
    /// One simulated minute per wall-clock second.
    pub const DEMO: Self = Self(60.0);
    /// Simulated time runs at wall-clock speed.
    pub const REAL_TIME: Self = Self(3600.0);

    pub fn new(seconds_per_sim_hour: f64) -> Result<Self> {
        if seconds_per_sim_hour.is_finite() && seconds_per_sim_hour > 0.0 {
            Ok(Self(seconds_per_sim_hour))
        } else {
            Err(TourError::invalid(format!(
                "playback rate must be positive, got {seconds_per_sim_hour}"
            )))
        }
    }

    pub fn seconds_per_sim_hour(self) -> f64 {
        self.0
    }

    /// Simulated minutes covered by a frame lasting `frame_delta_ms` of
    /// wall-clock time.
    pub fn sim_minutes_for(self, frame_delta_ms: f64) -> f64 {
        frame_delta_ms * (60.0 / (1000.0 * self.0))
    }
}

impl Default for PlaybackRate {
    fn default() -> Self {
        Self::DEMO
    }
}

impl TryFrom<f64> for PlaybackRate {
    type Error = TourError;

    fn try_from(value: f64) -> Result<Self> {
        Self::new(value)
    }
}

impl From<PlaybackRate> for f64 {
    fn from(rate: PlaybackRate) -> Self {
        rate.0
    }
}

impl FromStr for PlaybackRate {
    type Err = TourError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "demo" | "fast" => Ok(Self::DEMO),
            "real-time" | "realtime" => Ok(Self::REAL_TIME),
            other => other
                .parse::<f64>()
                .map_err(|_| TourError::invalid(format!("unknown playback rate `{value}`")))
                .and_then(Self::new),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlaybackStatus {
    Idle,
    Running,
    Paused,
    Completed,
}

impl PlaybackStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for PlaybackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle for one requested frame or timer. Only the most recently issued
/// token is honoured; everything older is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameToken {
    epoch: u64,
}

impl FrameToken {
    pub(crate) fn new(epoch: u64) -> Self {
        Self { epoch }
    }

    pub fn epoch(self) -> u64 {
        self.epoch
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaybackState {
    pub elapsed_minutes: f64,
    pub total_minutes: f64,
    pub rate: PlaybackRate,
    pub status: PlaybackStatus,
}

impl PlaybackState {
    pub fn idle(rate: PlaybackRate) -> Self {
        Self {
            elapsed_minutes: 0.0,
            total_minutes: 0.0,
            rate,
            status: PlaybackStatus::Idle,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == PlaybackStatus::Running
    }
}

/// Snapshot published once per successful tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PlaybackFrame {
    pub elapsed_minutes: f64,
    pub position: Position,
}

/// Receives frames from [`PlaybackScheduler::tick`].
pub trait FrameSink {
    fn on_frame(&mut self, frame: &PlaybackFrame);

    /// Called exactly once when playback reaches the total duration.
    fn on_completed(&mut self, state: &PlaybackState);
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// The token predates the latest start/stop/pause and was discarded.
    Stale,
    /// The token was current but playback is not running.
    Ignored,
    /// Progress advanced. `frame` is `None` when the position could not be
    /// located; progress is kept in that case.
    Advanced {
        frame: Option<PlaybackFrame>,
        completed: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PlaybackProgress {
    pub elapsed_minutes: f64,
    pub remaining_minutes: f64,
    pub total_minutes: f64,
    pub fraction: f64,
}

/// Frame-driven playback along a measured path.
///
/// The host calls [`tick`](Self::tick) with the token it was handed through
/// [`FrameScheduler::request_frame`]. Starting, stopping and pausing all
/// invalidate outstanding tokens.
#[derive(Debug)]
pub struct PlaybackScheduler {
    state: PlaybackState,
    path: Option<MeasuredPath>,
    epoch: u64,
    pending: Option<FrameToken>,
}

impl Default for PlaybackScheduler {
    fn default() -> Self {
        Self::new(PlaybackRate::default())
    }
}

impl PlaybackScheduler {
    pub fn new(rate: PlaybackRate) -> Self {
        Self {
            state: PlaybackState::idle(rate),
            path: None,
            epoch: 0,
            pending: None,
        }
    }

    pub fn state(&self) -> &PlaybackState {
        &self.state
    }

    pub fn status(&self) -> PlaybackStatus {
        self.state.status
    }

    pub fn path(&self) -> Option<&MeasuredPath> {
        self.path.as_ref()
    }

    pub fn pending_frame(&self) -> Option<FrameToken> {
        self.pending
    }

    pub fn start(
        &mut self,
        path: MeasuredPath,
        total_minutes: f64,
        frames: &mut dyn FrameScheduler,
    ) -> Result<FrameToken> {
        self.ensure(&[PlaybackStatus::Idle, PlaybackStatus::Completed], "start")?;
        if !(total_minutes.is_finite() && total_minutes > 0.0) {
            return Err(TourError::invalid(format!(
                "total duration must be positive, got {total_minutes}"
            )));
        }

        self.state.elapsed_minutes = 0.0;
        self.state.total_minutes = total_minutes;
        self.state.status = PlaybackStatus::Running;
        self.path = Some(path);
        info!(total_minutes, rate = self.state.rate.seconds_per_sim_hour(), "playback started");
        Ok(self.request_frame(frames))
    }

    /// Plays the current path again from the beginning after completion.
    pub fn replay(&mut self, frames: &mut dyn FrameScheduler) -> Result<FrameToken> {
        self.ensure(&[PlaybackStatus::Completed], "replay")?;
        self.state.elapsed_minutes = 0.0;
        self.state.status = PlaybackStatus::Running;
        info!(total_minutes = self.state.total_minutes, "playback replay");
        Ok(self.request_frame(frames))
    }

    pub fn pause(&mut self) -> Result<()> {
        self.ensure(&[PlaybackStatus::Running], "pause")?;
        self.invalidate();
        self.state.status = PlaybackStatus::Paused;
        debug!(elapsed = self.state.elapsed_minutes, "playback paused");
        Ok(())
    }

    pub fn resume(&mut self, frames: &mut dyn FrameScheduler) -> Result<FrameToken> {
        self.ensure(&[PlaybackStatus::Paused], "resume")?;
        self.state.status = PlaybackStatus::Running;
        debug!(elapsed = self.state.elapsed_minutes, "playback resumed");
        Ok(self.request_frame(frames))
    }

    /// Returns to idle from any state, dropping the path and cancelling the
    /// pending frame.
    pub fn stop(&mut self) {
        self.invalidate();
        if self.state.status != PlaybackStatus::Idle {
            info!(status = %self.state.status, "playback stopped");
        }
        self.state = PlaybackState::idle(self.state.rate);
        self.path = None;
    }

    /// Changes the rate without touching progress.
    pub fn set_rate(&mut self, rate: PlaybackRate) {
        self.state.rate = rate;
    }

    pub fn tick(
        &mut self,
        token: FrameToken,
        frame_delta_ms: f64,
        frames: &mut dyn FrameScheduler,
        sink: &mut dyn FrameSink,
    ) -> TickOutcome {
        if self.pending != Some(token) {
            debug!(epoch = token.epoch(), "discarding stale frame");
            return TickOutcome::Stale;
        }
        self.pending = None;
        if self.state.status != PlaybackStatus::Running {
            return TickOutcome::Ignored;
        }

        let delta = if frame_delta_ms.is_finite() {
            frame_delta_ms.max(0.0)
        } else {
            0.0
        };
        let advanced = self.state.elapsed_minutes + self.state.rate.sim_minutes_for(delta);
        let completed = advanced >= self.state.total_minutes;
        self.state.elapsed_minutes = advanced.min(self.state.total_minutes);

        let located = match self.path.as_ref() {
            Some(path) => locate_along(path, self.state.elapsed_minutes),
            None => return TickOutcome::Ignored,
        };
        let frame = match located {
            Ok(position) => {
                let frame = PlaybackFrame {
                    elapsed_minutes: self.state.elapsed_minutes,
                    position,
                };
                sink.on_frame(&frame);
                Some(frame)
            }
            Err(err) => {
                warn!(error = %err, elapsed = self.state.elapsed_minutes, "skipping frame");
                None
            }
        };

        if completed {
            self.state.status = PlaybackStatus::Completed;
            info!(total_minutes = self.state.total_minutes, "playback completed");
            sink.on_completed(&self.state);
        } else {
            self.request_frame(frames);
        }

        TickOutcome::Advanced { frame, completed }
    }

    pub fn progress(&self) -> PlaybackProgress {
        let total = self.state.total_minutes;
        let elapsed = self.state.elapsed_minutes;
        PlaybackProgress {
            elapsed_minutes: elapsed,
            remaining_minutes: (total - elapsed).max(0.0),
            total_minutes: total,
            fraction: if total > 0.0 { elapsed / total } else { 0.0 },
        }
    }

    fn request_frame(&mut self, frames: &mut dyn FrameScheduler) -> FrameToken {
        self.epoch += 1;
        let token = FrameToken::new(self.epoch);
        self.pending = Some(token);
        frames.request_frame(token);
        token
    }

    fn invalidate(&mut self) {
        self.epoch += 1;
        self.pending = None;
    }

    fn ensure(&self, allowed: &[PlaybackStatus], action: &'static str) -> Result<()> {
        if allowed.contains(&self.state.status) {
            Ok(())
        } else {
            Err(TourError::InvalidTransition {
                action,
                state: self.state.status.as_str(),
            })
        }
    }
}

/// Formats simulated minutes as `MM:SS`. Minutes are not wrapped into hours.
pub fn format_clock(minutes: f64) -> String {
    if !minutes.is_finite() || minutes <= 0.0 {
        return "00:00".to_string();
    }
    let total_seconds = (minutes * 60.0).floor() as u64;
    format!("{:02}:{:02}", total_seconds / 60, total_seconds % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{services::memory::FrameQueue, Vertex};
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    #[derive(Default)]
    struct RecordingSink {
        frames: Vec<PlaybackFrame>,
        completions: usize,
    }

    impl FrameSink for RecordingSink {
        fn on_frame(&mut self, frame: &PlaybackFrame) {
            self.frames.push(*frame);
        }

        fn on_completed(&mut self, _state: &PlaybackState) {
            self.completions += 1;
        }
    }

    fn path() -> MeasuredPath {
        MeasuredPath::single(vec![Vertex::new(0.0, 0.0, 0.0), Vertex::new(10.0, 0.0, 10.0)])
            .unwrap()
    }

    fn pump(
        scheduler: &mut PlaybackScheduler,
        frames: &mut FrameQueue,
        sink: &mut RecordingSink,
        delta_ms: f64,
    ) -> Option<TickOutcome> {
        let token = frames.next_frame()?;
        Some(scheduler.tick(token, delta_ms, frames, sink))
    }

    #[test]
    fn demo_rate_plays_one_minute_per_second() {
        assert_abs_diff_eq!(PlaybackRate::DEMO.sim_minutes_for(1000.0), 1.0);
        assert_abs_diff_eq!(PlaybackRate::REAL_TIME.sim_minutes_for(60_000.0), 1.0);
    }

    #[test]
    fn parses_named_and_numeric_rates() {
        assert_eq!("demo".parse::<PlaybackRate>().unwrap(), PlaybackRate::DEMO);
        assert_eq!("Real-Time".parse::<PlaybackRate>().unwrap(), PlaybackRate::REAL_TIME);
        assert_eq!("120".parse::<PlaybackRate>().unwrap().seconds_per_sim_hour(), 120.0);
        assert!("0".parse::<PlaybackRate>().is_err());
        assert!("warp".parse::<PlaybackRate>().is_err());
    }

    #[test]
    fn runs_to_completion_and_signals_once() {
        let mut scheduler = PlaybackScheduler::new(PlaybackRate::DEMO);
        let mut frames = FrameQueue::new();
        let mut sink = RecordingSink::default();
        scheduler.start(path(), 10.0, &mut frames).unwrap();

        let mut ticks = 0;
        while let Some(outcome) = pump(&mut scheduler, &mut frames, &mut sink, 700.0) {
            ticks += 1;
            if let TickOutcome::Advanced { completed: true, .. } = outcome {
                break;
            }
        }

        assert_eq!(ticks, 15);
        assert_eq!(scheduler.status(), PlaybackStatus::Completed);
        assert_eq!(scheduler.state().elapsed_minutes, 10.0);
        assert_eq!(sink.completions, 1);
        assert_eq!(sink.frames.last().unwrap().position.x, 10.0);
        assert!(frames.next_frame().is_none());
        assert!(sink
            .frames
            .windows(2)
            .all(|pair| pair[0].elapsed_minutes <= pair[1].elapsed_minutes));
    }

    #[test]
    fn ticks_after_completion_change_nothing() {
        let mut scheduler = PlaybackScheduler::new(PlaybackRate::DEMO);
        let mut frames = FrameQueue::new();
        let mut sink = RecordingSink::default();
        let token = scheduler.start(path(), 1.0, &mut frames).unwrap();
        frames.next_frame();

        let outcome = scheduler.tick(token, 5_000.0, &mut frames, &mut sink);
        assert!(matches!(outcome, TickOutcome::Advanced { completed: true, .. }));

        let outcome = scheduler.tick(token, 5_000.0, &mut frames, &mut sink);
        assert_eq!(outcome, TickOutcome::Stale);
        assert_eq!(sink.completions, 1);
        assert_eq!(scheduler.state().elapsed_minutes, 1.0);
    }

    #[test]
    fn stop_discards_in_flight_frames() {
        let mut scheduler = PlaybackScheduler::new(PlaybackRate::DEMO);
        let mut frames = FrameQueue::new();
        let mut sink = RecordingSink::default();
        scheduler.start(path(), 10.0, &mut frames).unwrap();
        pump(&mut scheduler, &mut frames, &mut sink, 1000.0);
        let in_flight = frames.next_frame().unwrap();

        scheduler.stop();
        let outcome = scheduler.tick(in_flight, 1000.0, &mut frames, &mut sink);

        assert_eq!(outcome, TickOutcome::Stale);
        assert_eq!(scheduler.state(), &PlaybackState::idle(PlaybackRate::DEMO));
        assert!(scheduler.path().is_none());
        assert_eq!(sink.frames.len(), 1);
    }

    #[test]
    fn pause_holds_progress_until_resume() {
        let mut scheduler = PlaybackScheduler::new(PlaybackRate::DEMO);
        let mut frames = FrameQueue::new();
        let mut sink = RecordingSink::default();
        scheduler.start(path(), 10.0, &mut frames).unwrap();
        pump(&mut scheduler, &mut frames, &mut sink, 2000.0);

        let pending = frames.next_frame().unwrap();
        scheduler.pause().unwrap();
        assert_eq!(scheduler.tick(pending, 2000.0, &mut frames, &mut sink), TickOutcome::Stale);
        assert_abs_diff_eq!(scheduler.state().elapsed_minutes, 2.0);

        scheduler.resume(&mut frames).unwrap();
        pump(&mut scheduler, &mut frames, &mut sink, 2000.0);
        assert_abs_diff_eq!(scheduler.state().elapsed_minutes, 4.0);
    }

    #[test]
    fn switching_rate_keeps_progress() {
        let mut scheduler = PlaybackScheduler::new(PlaybackRate::DEMO);
        let mut frames = FrameQueue::new();
        let mut sink = RecordingSink::default();
        scheduler.start(path(), 10.0, &mut frames).unwrap();
        pump(&mut scheduler, &mut frames, &mut sink, 3000.0);

        scheduler.set_rate(PlaybackRate::REAL_TIME);
        assert_abs_diff_eq!(scheduler.state().elapsed_minutes, 3.0);
        pump(&mut scheduler, &mut frames, &mut sink, 60_000.0);
        assert_abs_diff_eq!(scheduler.state().elapsed_minutes, 4.0);
    }

    #[test]
    fn rejects_invalid_transitions_and_durations() {
        let mut scheduler = PlaybackScheduler::default();
        let mut frames = FrameQueue::new();

        assert!(scheduler.pause().is_err());
        assert!(scheduler.resume(&mut frames).is_err());
        assert!(matches!(
            scheduler.start(path(), 0.0, &mut frames),
            Err(TourError::InvalidParameter(_))
        ));

        scheduler.start(path(), 5.0, &mut frames).unwrap();
        let err = scheduler.start(path(), 5.0, &mut frames).unwrap_err();
        assert!(matches!(err, TourError::InvalidTransition { action: "start", .. }));
    }

    #[test]
    fn replay_restarts_a_completed_route() {
        let mut scheduler = PlaybackScheduler::new(PlaybackRate::DEMO);
        let mut frames = FrameQueue::new();
        let mut sink = RecordingSink::default();
        scheduler.start(path(), 1.0, &mut frames).unwrap();
        pump(&mut scheduler, &mut frames, &mut sink, 60_000.0);
        assert_eq!(scheduler.status(), PlaybackStatus::Completed);

        scheduler.replay(&mut frames).unwrap();
        assert_eq!(scheduler.status(), PlaybackStatus::Running);
        assert_eq!(scheduler.state().elapsed_minutes, 0.0);
        assert!(frames.next_frame().is_some());
    }

    #[test]
    fn progress_and_clock_formatting() {
        let mut scheduler = PlaybackScheduler::new(PlaybackRate::DEMO);
        let mut frames = FrameQueue::new();
        let mut sink = RecordingSink::default();
        scheduler.start(path(), 10.0, &mut frames).unwrap();
        pump(&mut scheduler, &mut frames, &mut sink, 2500.0);

        let progress = scheduler.progress();
        assert_abs_diff_eq!(progress.remaining_minutes, 7.5);
        assert_abs_diff_eq!(progress.fraction, 0.25);

        assert_eq!(format_clock(2.5), "02:30");
        assert_eq!(format_clock(75.0), "75:00");
        assert_eq!(format_clock(-3.0), "00:00");
        assert_eq!(format_clock(f64::NAN), "00:00");
    }

    proptest! {
        #[test]
        fn elapsed_never_decreases(deltas in proptest::collection::vec(-50.0f64..2000.0, 1..60)) {
            let mut scheduler = PlaybackScheduler::new(PlaybackRate::DEMO);
            let mut frames = FrameQueue::new();
            let mut sink = RecordingSink::default();
            scheduler.start(path(), 10.0, &mut frames).unwrap();

            let mut last = 0.0;
            for delta in deltas {
                if pump(&mut scheduler, &mut frames, &mut sink, delta).is_none() {
                    break;
                }
                let elapsed = scheduler.state().elapsed_minutes;
                prop_assert!(elapsed >= last);
                prop_assert!(elapsed <= 10.0);
                last = elapsed;
            }
            prop_assert!(sink.completions <= 1);
        }
    }
}
