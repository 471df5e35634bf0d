//! The scheduler that moves frames through the stages.
//!
//! A [`Pipeline`] runs on the calling thread and never blocks on a computation: each iteration it
//! takes whatever results the stages have published, hands new work to every stage that is idle,
//! and passes finished frames on to the [`ResultConsumer`]. Stages that are busy do not get queued
//! work. Frames captured in the meantime are skipped, and an intermediate result the slow stage
//! cannot take is dealt with according to the [`HandoffPolicy`].

use std::{
    io, iter,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crate::config::{Config, ConfigError, HandoffPolicy, SsdShape, TensorNames};
use crate::consumer::{Flow, FrameOutput, ResultConsumer};
use crate::detection::Detections;
use crate::job::{Extras, JobResult, CAP_IN_TIME, CAP_OUT_TIME, TOP_IN_TIME};
use crate::metrics::{FpsWindow, FrameTiming, Metrics, MetricsState, SNAPSHOT_INTERVAL};
use crate::nn::{frame_to_tensor, Feeds, Tensor};
use crate::stage::{
    wait_for_any, ExecutionResource, StageError, StageId, StageWorker, Submission,
};
use crate::video::FrameSource;

/// Idle wait of the loop until the first frame rate is known.
const INITIAL_SLEEP_INTERVAL: Duration = Duration::from_millis(5);
/// The idle wait is this fraction of the measured frame period.
const PACING_FACTOR: f64 = 0.05;
const WARM_UP_POLL: Duration = Duration::from_millis(100);
const WARM_UP_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Requests a running pipeline to shut down. Cloned handles share the same flag.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// An error that ends the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("warm-up failed")]
    WarmUp(#[source] StageError),
    #[error("failed to spawn stage `{stage}`")]
    Spawn {
        stage: StageId,
        #[source]
        source: io::Error,
    },
    #[error("stage `{stage}` did not accept work")]
    StageUnavailable { stage: StageId },
    #[error("video source failed")]
    Source(#[source] anyhow::Error),
    #[error("result consumer failed")]
    Consumer(#[source] anyhow::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Spawns a [`StageWorker`], reporting failure as a [`PipelineError`].
pub fn spawn_stage<R: ExecutionResource>(
    id: StageId,
    resource: R,
) -> Result<StageWorker, PipelineError> {
    StageWorker::spawn(id.clone(), resource)
        .map_err(|source| PipelineError::Spawn { stage: id, source })
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Stop after this many frames were output. `None` runs until the source ends, the consumer
    /// quits, or a stop is requested.
    pub max_frames: Option<u64>,
    pub fps_interval: Duration,
    /// Log the timing of every frame.
    pub debug_mode: bool,
    pub handoff: HandoffPolicy,
    pub ssd_shape: SsdShape,
    pub num_classes: usize,
    pub tensors: TensorNames,
    /// `(width, height)` frames are resized to before inference. `None` feeds them as captured.
    pub input_resolution: Option<(u32, u32)>,
}

impl PipelineOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_frames: (!config.visualize).then_some(config.max_frames),
            fps_interval: config.fps_interval(),
            debug_mode: config.debug_mode,
            handoff: config.handoff,
            ssd_shape: config.ssd_shape,
            num_classes: config.num_classes,
            tensors: config.tensors.clone(),
            input_resolution: None,
        }
    }
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Drives frames from a [`FrameSource`] through one or two [`StageWorker`]s into a
/// [`ResultConsumer`].
///
/// With a single stage, the fast stage runs the complete detector. With two, the fast stage
/// computes the box predictor's raw scores and encodings and the slow stage turns them into
/// detections.
///
/// Whichever way [`Pipeline::run`] ends, including by panic, the pipeline shuts down exactly once:
/// the stages are stopped and joined, then the source is stopped, then the consumer is closed.
pub struct Pipeline<S: FrameSource, C: ResultConsumer> {
    fast: StageWorker,
    slow: Option<StageWorker>,
    source: S,
    consumer: C,
    metrics: Arc<MetricsState>,
    stop: StopSignal,
    options: PipelineOptions,
    fast_fetches: Vec<String>,
    slow_fetches: Vec<String>,
    shut_down: bool,
}

impl<S: FrameSource, C: ResultConsumer> Pipeline<S, C> {
    /// Creates a pipeline from freshly spawned stages. The source must not be started yet.
    pub fn new(
        fast: StageWorker,
        slow: Option<StageWorker>,
        source: S,
        consumer: C,
        options: PipelineOptions,
    ) -> Self {
        let (fast_fetches, slow_fetches) = match slow {
            Some(_) => (
                options.tensors.intermediate_fetches(),
                options.tensors.detection_fetches(),
            ),
            None => (options.tensors.detection_fetches(), Vec::new()),
        };
        Self {
            fast,
            slow,
            source,
            consumer,
            metrics: Arc::new(MetricsState::new()),
            stop: StopSignal::new(),
            options,
            fast_fetches,
            slow_fetches,
            shut_down: false,
        }
    }

    /// Reports into `metrics` instead of a private [`MetricsState`].
    pub fn with_metrics(mut self, metrics: Arc<MetricsState>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn metrics(&self) -> &Arc<MetricsState> {
        &self.metrics
    }

    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    /// Warms up the stages, starts the source, and processes frames until the pipeline ends.
    ///
    /// Returns the final metrics.
    pub fn run(mut self) -> Result<Metrics, PipelineError> {
        let result = self.run_until_done();
        let metrics = self.shutdown();
        result.map(|()| metrics)
    }

    fn run_until_done(&mut self) -> Result<(), PipelineError> {
        if !self.warm_up()? {
            log::info!("stop requested during warm-up");
            return Ok(());
        }

        self.source.start().map_err(PipelineError::Source)?;
        self.metrics.set_running(true);
        log::info!("detection started");

        let mut state = LoopState::new(self.options.fps_interval);
        self.metrics.update(|m| m.sleep_interval = state.sleep_interval);
        loop {
            if self.stop.is_raised() {
                log::info!("stop requested");
                break;
            }
            if !self.source.is_running() {
                if let Some(e) = self.source.take_error() {
                    return Err(PipelineError::Source(e));
                }
                log::info!("video source ended");
                break;
            }
            if let Some(max) = self.options.max_frames {
                if state.processed >= max {
                    log::info!("processed {max} frames");
                    break;
                }
            }

            let Some(result) = self.step(&mut state)? else {
                let stages = iter::once(&self.fast).chain(self.slow.as_ref());
                wait_for_any(stages, state.sleep_interval);
                continue;
            };
            if self.output(result, &mut state)? == Flow::Quit {
                log::info!("consumer quit");
                break;
            }
        }
        Ok(())
    }

    /// Runs an all-zero job through every stage, so that lazy initialization does not delay the
    /// first frames. Returns `false` if a stop was requested before it finished.
    fn warm_up(&mut self) -> Result<bool, PipelineError> {
        let side = self.options.ssd_shape.side();
        let (width, height) = self
            .options
            .input_resolution
            .map_or((side, side), |(w, h)| (w as usize, h as usize));
        let tensors = &self.options.tensors;

        submit_warm_up(
            &mut self.fast,
            self.fast_fetches.clone(),
            Feeds::from([(
                tensors.image.as_str(),
                Tensor::zeros(&[1, height, width, 3]),
            )]),
        )?;
        if let Some(slow) = &mut self.slow {
            let anchors = self.options.ssd_shape.anchors();
            submit_warm_up(
                slow,
                self.slow_fetches.clone(),
                Feeds::from([
                    (
                        tensors.score_in.as_str(),
                        Tensor::zeros(&[1, anchors, self.options.num_classes]),
                    ),
                    (
                        tensors.expand_in.as_str(),
                        Tensor::zeros(&[1, anchors, 1, 4]),
                    ),
                ]),
            )?;
        }
        log::info!("warming up");

        let start = Instant::now();
        let mut last_report = start;
        let mut fast_pending = true;
        let mut slow_pending = self.slow.is_some();
        loop {
            if fast_pending {
                fast_pending = !warmed_up(&mut self.fast, start)?;
            }
            if let Some(slow) = self.slow.as_mut().filter(|_| slow_pending) {
                slow_pending = !warmed_up(slow, start)?;
            }
            if !fast_pending && !slow_pending {
                break;
            }
            if self.stop.is_raised() {
                return Ok(false);
            }

            let pending = iter::once(&self.fast)
                .filter(|_| fast_pending)
                .chain(self.slow.iter().filter(|_| slow_pending));
            wait_for_any(pending, WARM_UP_POLL);
            if last_report.elapsed() >= WARM_UP_REPORT_INTERVAL {
                log::info!("still warming up after {:.1?}", start.elapsed());
                last_report = Instant::now();
            }
        }

        log::info!("warm-up done in {:.1?}", start.elapsed());
        Ok(true)
    }

    /// Gives every idle stage new work. Returns the result that left the last stage, if any.
    fn step(&mut self, state: &mut LoopState) -> Result<Option<JobResult>, PipelineError> {
        let top_in = Instant::now();

        let mut fast_out = self.fast.try_take_result();
        if self.fast.is_ready_for_new_job() {
            // A stage publishes before it becomes ready, so taking the result here means the
            // submission below never supersedes one.
            if fast_out.is_none() {
                fast_out = self.fast.try_take_result();
            }
            self.capture_and_submit(top_in, state)?;
        }
        let fast_out = accept(&self.metrics, fast_out);

        let Some(slow) = &mut self.slow else {
            return Ok(fast_out);
        };

        if let Some(result) = fast_out {
            if state.held.replace(result).is_some() {
                log::trace!("newer intermediate result replaces the held one");
                self.metrics.update(|m| m.dropped_intermediate += 1);
            }
        }

        let mut slow_out = slow.try_take_result();
        if let Some(result) = state.held.take() {
            if slow.is_ready_for_new_job() {
                if slow_out.is_none() {
                    slow_out = slow.try_take_result();
                }
                let (outputs, extras) = result.into_parts();
                match handoff_feeds(&self.options.tensors, outputs) {
                    Some(feeds) => match slow.submit(self.slow_fetches.clone(), feeds, extras) {
                        Submission::Accepted => {}
                        Submission::Busy(_) => {
                            self.metrics.update(|m| m.dropped_intermediate += 1);
                        }
                        Submission::Stopped(_) => {
                            return Err(PipelineError::StageUnavailable {
                                stage: slow.id().clone(),
                            });
                        }
                    },
                    None => self.metrics.update(|m| m.failed_jobs += 1),
                }
            } else {
                match self.options.handoff {
                    HandoffPolicy::DropNewest => {
                        log::trace!("stage `{}` busy, dropping intermediate result", slow.id());
                        self.metrics.update(|m| m.dropped_intermediate += 1);
                    }
                    HandoffPolicy::HoldLatest => state.held = Some(result),
                }
            }
        }

        Ok(accept(&self.metrics, slow_out))
    }

    fn capture_and_submit(
        &mut self,
        top_in: Instant,
        state: &mut LoopState,
    ) -> Result<(), PipelineError> {
        let cap_in = Instant::now();
        let Some(frame) = self.source.read() else {
            return Ok(());
        };

        let seq = frame.seq();
        match state.last_seq {
            Some(last) if seq > last => {
                let skipped = seq - last - 1;
                if skipped > 0 {
                    self.metrics.update(|m| m.dropped_frames += skipped);
                }
                state.last_seq = Some(seq);
            }
            Some(_) => {}
            None => state.last_seq = Some(seq),
        }

        let tensor = frame_to_tensor(frame.image(), self.options.input_resolution);
        let mut extras = Extras::for_frame(seq);
        extras.set(TOP_IN_TIME, top_in);
        extras.set(CAP_IN_TIME, cap_in);
        extras.stamp(CAP_OUT_TIME);
        if self.consumer.needs_frames() {
            extras.set_frame(frame);
        }

        let feeds = Feeds::from([(self.options.tensors.image.as_str(), tensor)]);
        match self.fast.submit(self.fast_fetches.clone(), feeds, extras) {
            Submission::Accepted => Ok(()),
            Submission::Busy(_) => {
                self.metrics.update(|m| m.dropped_frames += 1);
                Ok(())
            }
            Submission::Stopped(_) => Err(PipelineError::StageUnavailable {
                stage: self.fast.id().clone(),
            }),
        }
    }

    fn output(&mut self, result: JobResult, state: &mut LoopState) -> Result<Flow, PipelineError> {
        let vis_in = Instant::now();
        let (outputs, mut extras) = result.into_parts();
        let detections = match Detections::decode(&outputs) {
            Ok(detections) => detections,
            Err(e) => {
                log::warn!("dropping frame {:?}: {e:#}", extras.seq());
                self.metrics.update(|m| m.failed_jobs += 1);
                return Ok(Flow::Continue);
            }
        };

        let output = FrameOutput {
            index: state.processed,
            seq: extras.seq(),
            detections,
            frame: extras.take_frame(),
            fps: state.fps,
            fps_snapshot: state.fps_snapshot,
        };
        let flow = self
            .consumer
            .consume(&output)
            .map_err(PipelineError::Consumer)?;
        let vis_out = Instant::now();

        let slow = self.slow.as_ref().map(StageWorker::id);
        if let Some(timing) = FrameTiming::measure(&extras, self.fast.id(), slow, vis_in, vis_out) {
            self.metrics.record_frame(&timing);
            if self.options.debug_mode {
                log::debug!("snapshot FPS:{:^5.1} {timing}", state.fps_snapshot);
            }
        }
        state.processed += 1;

        if let Some(fps) = state.fps_window.tick() {
            state.fps = fps;
            if fps > 0.0 {
                state.sleep_interval = Duration::from_secs_f64(PACING_FACTOR / fps);
            }
            log::info!("{fps:.1} FPS");
        }
        if let Some(fps) = state.snapshot_window.tick() {
            state.fps_snapshot = fps;
        }

        let (fps, fps_snapshot, sleep_interval) =
            (state.fps, state.fps_snapshot, state.sleep_interval);
        let frame_counter = state.fps_window.frames();
        self.metrics.update(|m| {
            m.fps = fps;
            m.fps_snapshot = fps_snapshot;
            m.sleep_interval = sleep_interval;
            m.frame_counter = frame_counter;
        });

        Ok(flow)
    }

    /// Stops everything. Only the first call has an effect; every call returns the final metrics.
    fn shutdown(&mut self) -> Metrics {
        if !self.shut_down {
            self.shut_down = true;
            log::debug!("shutting down pipeline");

            self.metrics.set_running(false);
            self.fast.stop();
            if let Some(slow) = &mut self.slow {
                slow.stop();
            }
            self.source.stop();
            self.consumer.close();

            let superseded = iter::once(&self.fast)
                .chain(self.slow.as_ref())
                .map(|stage| stage.stats().superseded)
                .sum();
            self.metrics.update(|m| m.superseded_results = superseded);
            log::info!("{}", self.metrics.snapshot());
        }
        self.metrics.snapshot()
    }
}

impl<S: FrameSource, C: ResultConsumer> Drop for Pipeline<S, C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct LoopState {
    /// Frames output so far.
    processed: u64,
    /// Highest sequence number submitted.
    last_seq: Option<u64>,
    /// Intermediate result waiting for the slow stage (under [`HandoffPolicy::HoldLatest`]).
    held: Option<JobResult>,
    sleep_interval: Duration,
    fps_window: FpsWindow,
    snapshot_window: FpsWindow,
    fps: f64,
    fps_snapshot: f64,
}

impl LoopState {
    fn new(fps_interval: Duration) -> Self {
        Self {
            processed: 0,
            last_seq: None,
            held: None,
            sleep_interval: INITIAL_SLEEP_INTERVAL,
            fps_window: FpsWindow::new("fps", fps_interval),
            snapshot_window: FpsWindow::new("fps snapshot", SNAPSHOT_INTERVAL),
            fps: 0.0,
            fps_snapshot: 0.0,
        }
    }
}

fn submit_warm_up(
    stage: &mut StageWorker,
    fetches: Vec<String>,
    feeds: Feeds,
) -> Result<(), PipelineError> {
    match stage.submit(fetches, feeds, Extras::new()) {
        Submission::Accepted => Ok(()),
        Submission::Busy(_) | Submission::Stopped(_) => Err(PipelineError::StageUnavailable {
            stage: stage.id().clone(),
        }),
    }
}

fn warmed_up(stage: &mut StageWorker, start: Instant) -> Result<bool, PipelineError> {
    match stage.try_take_result() {
        None => Ok(false),
        Some(Ok(_)) => {
            log::debug!("stage `{}` warmed up in {:.1?}", stage.id(), start.elapsed());
            Ok(true)
        }
        Some(Err(e)) => Err(PipelineError::WarmUp(e)),
    }
}

/// Unwraps a stage result, accounting a failed job.
fn accept(
    metrics: &MetricsState,
    result: Option<Result<JobResult, StageError>>,
) -> Option<JobResult> {
    match result? {
        Ok(result) => Some(result),
        Err(e) => {
            match &e {
                StageError::Execution { source, .. } => log::warn!("{e}: {source:#}"),
                StageError::Panicked { .. } => log::warn!("{e}"),
            }
            metrics.update(|m| m.failed_jobs += 1);
            None
        }
    }
}

/// Binds the fast stage's intermediate outputs to the slow stage's inputs.
fn handoff_feeds(tensors: &TensorNames, outputs: Vec<Tensor>) -> Option<Feeds> {
    match <[Tensor; 2]>::try_from(outputs) {
        Ok([scores, boxes]) => Some(Feeds::from([
            (tensors.score_in.as_str(), scores),
            (tensors.expand_in.as_str(), boxes),
        ])),
        Err(outputs) => {
            log::warn!(
                "expected 2 intermediate outputs, got {}; dropping frame",
                outputs.len()
            );
            None
        }
    }
}
