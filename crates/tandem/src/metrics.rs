//! Performance accounting.
//!
//! Every frame that makes it through the pipeline contributes a [`FrameTiming`], computed from the
//! timestamps its [`Extras`] collected on the way. Timings are summed up in a [`MetricsState`],
//! which is shared by [`Arc`][std::sync::Arc] between the pipeline and whoever wants to watch it.

use std::{
    fmt,
    ops::AddAssign,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, PoisonError,
    },
    time::{Duration, Instant},
};

use crate::job::{Extras, CAP_IN_TIME, CAP_OUT_TIME, TOP_IN_TIME};
use crate::stage::StageId;

/// Tolerance for `lost` going negative due to clock granularity, in seconds.
const LOST_EPSILON: f64 = 1e-6;

/// Interval of the short-term FPS measurement.
pub const SNAPSHOT_INTERVAL: Duration = Duration::from_millis(200);

/// Where the time spent on one frame went, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameTiming {
    pub capture: f64,
    pub fast_stage: f64,
    pub slow_stage: f64,
    pub visualization: f64,
    /// Time not attributed to any of the above (waiting for a stage to pick the job up, handoff
    /// between stages, scheduler overhead).
    pub lost: f64,
    pub total: f64,
}

impl FrameTiming {
    /// Computes the timing of a finished frame.
    ///
    /// `total` spans from the frame's `top_in_time` to `vis_out`. Returns [`None`] if `extras`
    /// lacks a timestamp, which is the case for warm-up jobs.
    pub fn measure(
        extras: &Extras,
        fast: &StageId,
        slow: Option<&StageId>,
        vis_in: Instant,
        vis_out: Instant,
    ) -> Option<Self> {
        let secs = |from: &str, to: &str| extras.between(from, to).map(|d| d.as_secs_f64());

        let capture = secs(CAP_IN_TIME, CAP_OUT_TIME)?;
        let fast_stage = secs(&fast.in_time_key(), &fast.out_time_key())?;
        let slow_stage = match slow {
            Some(slow) => secs(&slow.in_time_key(), &slow.out_time_key())?,
            None => 0.0,
        };
        let visualization = vis_out.saturating_duration_since(vis_in).as_secs_f64();
        let total = vis_out
            .saturating_duration_since(extras.get(TOP_IN_TIME)?)
            .as_secs_f64();
        let lost = total - (capture + fast_stage + slow_stage + visualization);

        if lost < -LOST_EPSILON {
            log::warn!(
                "frame {:?}: stage times exceed total by {:.6}s, timestamps are inconsistent",
                extras.seq(),
                -lost,
            );
        }

        Some(Self {
            capture,
            fast_stage,
            slow_stage,
            visualization,
            lost,
            total,
        })
    }
}

impl fmt::Display for FrameTiming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total:{:^10.5} cap:{:^10.5} fast:{:^10.5} slow:{:^10.5} vis:{:^10.5} lost:{:^10.5}",
            self.total, self.capture, self.fast_stage, self.slow_stage, self.visualization, self.lost,
        )
    }
}

/// Running sums of [`FrameTiming`]s, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StageTotals {
    pub capture: f64,
    pub fast_stage: f64,
    pub slow_stage: f64,
    pub visualization: f64,
    pub lost: f64,
    pub total: f64,
}

impl AddAssign<&FrameTiming> for StageTotals {
    fn add_assign(&mut self, t: &FrameTiming) {
        self.capture += t.capture;
        self.fast_stage += t.fast_stage;
        self.slow_stage += t.slow_stage;
        self.visualization += t.visualization;
        self.lost += t.lost;
        self.total += t.total;
    }
}

/// A point-in-time copy of the pipeline's counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metrics {
    /// Frames completed in the current FPS window.
    pub frame_counter: u64,
    /// Frames completed since the pipeline started.
    pub total_frames: u64,
    /// Frame rate over the last full FPS window.
    pub fps: f64,
    /// Frame rate over the last [`SNAPSHOT_INTERVAL`].
    pub fps_snapshot: f64,
    /// Current pacing wait of the scheduler loop.
    pub sleep_interval: Duration,
    pub totals: StageTotals,
    /// Captured frames that were never submitted because the fast stage was busy.
    pub dropped_frames: u64,
    /// Fast-stage results discarded because the slow stage was busy.
    pub dropped_intermediate: u64,
    /// Finished results that were replaced by a newer one before anybody read them.
    pub superseded_results: u64,
    /// Jobs that failed in a stage.
    pub failed_jobs: u64,
}

impl Metrics {
    /// Average time per frame spent in each stage.
    pub fn averages(&self) -> StageTotals {
        if self.total_frames == 0 {
            return StageTotals::default();
        }
        let n = self.total_frames as f64;
        let t = &self.totals;
        StageTotals {
            capture: t.capture / n,
            fast_stage: t.fast_stage / n,
            slow_stage: t.slow_stage / n,
            visualization: t.visualization / n,
            lost: t.lost / n,
            total: t.total / n,
        }
    }
}

/// Summary for the end of a run.
impl fmt::Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let avg = self.averages();
        let ms = |secs: f64| secs * 1000.0;
        write!(
            f,
            "{} frames, {:.1} FPS; avg per frame: total {:.1}ms (cap {:.1}ms, fast {:.1}ms, \
             slow {:.1}ms, vis {:.1}ms, lost {:.1}ms); dropped {} frames, {} intermediate results, \
             {} superseded, {} failed",
            self.total_frames,
            self.fps,
            ms(avg.total),
            ms(avg.capture),
            ms(avg.fast_stage),
            ms(avg.slow_stage),
            ms(avg.visualization),
            ms(avg.lost),
            self.dropped_frames,
            self.dropped_intermediate,
            self.superseded_results,
            self.failed_jobs,
        )
    }
}

/// Pipeline state shared between the scheduler and its observers.
#[derive(Debug, Default)]
pub struct MetricsState {
    running: AtomicBool,
    metrics: Mutex<Metrics>,
}

impl MetricsState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether the pipeline is in its detection loop.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    /// Returns a copy of the current counters.
    pub fn snapshot(&self) -> Metrics {
        self.lock().clone()
    }

    /// Modifies the counters under the lock.
    pub fn update<T>(&self, f: impl FnOnce(&mut Metrics) -> T) -> T {
        f(&mut self.lock())
    }

    /// Accounts a completed frame.
    pub fn record_frame(&self, timing: &FrameTiming) {
        self.update(|m| {
            m.totals += timing;
            m.total_frames += 1;
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Metrics> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Measures a frame rate over fixed-length windows.
#[derive(Debug)]
pub struct FpsWindow {
    name: &'static str,
    interval: Duration,
    start: Instant,
    frames: u64,
}

impl FpsWindow {
    pub fn new(name: &'static str, interval: Duration) -> Self {
        Self::starting_at(name, interval, Instant::now())
    }

    fn starting_at(name: &'static str, interval: Duration, start: Instant) -> Self {
        Self {
            name,
            interval,
            start,
            frames: 0,
        }
    }

    /// Number of frames counted in the current window.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Counts a frame. Returns the frame rate if this frame completed a window.
    pub fn tick(&mut self) -> Option<f64> {
        self.tick_at(Instant::now())
    }

    fn tick_at(&mut self, now: Instant) -> Option<f64> {
        self.frames += 1;
        let elapsed = now.saturating_duration_since(self.start);
        if elapsed < self.interval {
            return None;
        }

        let fps = self.frames as f64 / elapsed.as_secs_f64();
        log::trace!("{}: {} frames in {:?}", self.name, self.frames, elapsed);
        self.frames = 0;
        self.start = now;
        Some(fps)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    fn extras_at(base: Instant, stamps: &[(&str, u64)]) -> Extras {
        let mut extras = Extras::for_frame(0);
        for &(key, ms) in stamps {
            extras.set(key, base + Duration::from_millis(ms));
        }
        extras
    }

    #[test]
    fn timing_is_conserved() {
        let base = Instant::now();
        let extras = extras_at(
            base,
            &[
                (TOP_IN_TIME, 0),
                (CAP_IN_TIME, 1),
                (CAP_OUT_TIME, 4),
                ("fast_in_time", 5),
                ("fast_out_time", 25),
                ("slow_in_time", 30),
                ("slow_out_time", 40),
            ],
        );
        let vis_in = base + Duration::from_millis(41);
        let vis_out = base + Duration::from_millis(45);

        let t = FrameTiming::measure(&extras, &StageId::FAST, Some(&StageId::SLOW), vis_in, vis_out)
            .unwrap();
        assert_relative_eq!(t.capture, 0.003, epsilon = 1e-9);
        assert_relative_eq!(t.fast_stage, 0.020, epsilon = 1e-9);
        assert_relative_eq!(t.slow_stage, 0.010, epsilon = 1e-9);
        assert_relative_eq!(t.visualization, 0.004, epsilon = 1e-9);
        assert_relative_eq!(t.total, 0.045, epsilon = 1e-9);
        assert_relative_eq!(
            t.total,
            t.capture + t.fast_stage + t.slow_stage + t.visualization + t.lost,
            epsilon = 1e-9
        );
        assert_relative_eq!(t.lost, 0.008, epsilon = 1e-9);
    }

    #[test]
    fn single_stage_timing() {
        let base = Instant::now();
        let extras = extras_at(
            base,
            &[
                (TOP_IN_TIME, 0),
                (CAP_IN_TIME, 0),
                (CAP_OUT_TIME, 2),
                ("fast_in_time", 2),
                ("fast_out_time", 12),
            ],
        );
        let t = FrameTiming::measure(
            &extras,
            &StageId::FAST,
            None,
            base + Duration::from_millis(12),
            base + Duration::from_millis(13),
        )
        .unwrap();
        assert_eq!(t.slow_stage, 0.0);
        assert_relative_eq!(t.lost, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn warm_up_jobs_are_not_measured() {
        let now = Instant::now();
        assert!(FrameTiming::measure(&Extras::new(), &StageId::FAST, None, now, now).is_none());
    }

    #[test]
    fn totals_and_averages() {
        let state = MetricsState::new();
        assert!(!state.is_running());
        let timing = FrameTiming {
            capture: 0.001,
            fast_stage: 0.01,
            slow_stage: 0.02,
            visualization: 0.002,
            lost: 0.003,
            total: 0.036,
        };
        state.record_frame(&timing);
        state.record_frame(&timing);
        state.update(|m| m.dropped_frames += 5);

        let metrics = state.snapshot();
        assert_eq!(metrics.total_frames, 2);
        assert_eq!(metrics.dropped_frames, 5);
        assert_relative_eq!(metrics.totals.total, 0.072, epsilon = 1e-12);
        assert_relative_eq!(metrics.averages().slow_stage, 0.02, epsilon = 1e-12);
        assert_eq!(Metrics::default().averages(), StageTotals::default());
        assert!(metrics.to_string().starts_with("2 frames"));
    }

    #[test]
    fn fps_window() {
        let start = Instant::now();
        let mut window = FpsWindow::starting_at("test", Duration::from_secs(1), start);
        for i in 1..10 {
            assert_eq!(window.tick_at(start + Duration::from_millis(i * 100)), None);
        }
        assert_eq!(window.frames(), 9);
        let fps = window.tick_at(start + Duration::from_secs(2)).unwrap();
        assert_relative_eq!(fps, 5.0);
        assert_eq!(window.frames(), 0);
        assert_eq!(window.tick_at(start + Duration::from_millis(2500)), None);
    }
}
