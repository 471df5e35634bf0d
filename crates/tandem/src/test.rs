//! Mock stages, sources, and consumers shared by the unit tests.

use std::{
    collections::BTreeMap,
    panic,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::anyhow;
use crossbeam::channel::{self, Receiver, Sender};
use image::RgbImage;

use crate::consumer::{Flow, FrameOutput, ResultConsumer};
use crate::nn::{Feeds, Tensor};
use crate::pipeline::StopSignal;
use crate::stage::ExecutionResource;
use crate::video::{Frame, FrameSource};

/// Pins the signature of a closure used as an [`ExecutionResource`].
pub fn resource<F>(f: F) -> F
where
    F: FnMut(&[String], &Feeds) -> anyhow::Result<Vec<Tensor>> + Send + 'static,
{
    f
}

/// Feeds binding `value` to the input `in`.
pub fn tagged(value: f32) -> Feeds {
    Feeds::from([("in", Tensor::from(value))])
}

/// Detector outputs `[boxes, scores, classes, num_detections]` for the given `(class, score)`
/// pairs. Every box is `[0.1, 0.2, 0.5, 0.6]`.
pub fn ssd_outputs(detections: &[(u32, f32)]) -> Vec<Tensor> {
    let n = detections.len();
    vec![
        Tensor::from_iter(
            &[1, n, 4],
            detections.iter().flat_map(|_| [0.1, 0.2, 0.5, 0.6]),
        ),
        Tensor::from_iter(&[1, n], detections.iter().map(|&(_, score)| score)),
        Tensor::from_iter(&[1, n], detections.iter().map(|&(class, _)| class as f32)),
        Tensor::from([n as f32]),
    ]
}

/// Counts how many [`DropGuard`]s created from it were dropped.
#[derive(Debug, Clone, Default)]
pub struct DropCounter(Arc<AtomicUsize>);

impl DropCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    pub fn guard(&self) -> DropGuard {
        DropGuard(self.clone())
    }
}

/// Moved into a resource to observe when the resource is dropped.
#[derive(Debug)]
pub struct DropGuard(DropCounter);

impl Drop for DropGuard {
    fn drop(&mut self) {
        self.0 .0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Lets jobs of a [`GateResource`] finish one at a time.
pub struct Gate {
    permits: Sender<()>,
}

impl Gate {
    pub fn release(&self, jobs: usize) {
        for _ in 0..jobs {
            // The resource may already be gone.
            self.permits.send(()).ok();
        }
    }

    /// Number of released permits no job has used yet.
    pub fn released(&self) -> usize {
        self.permits.len()
    }
}

/// Echoes its `in` input, but only once the [`Gate`] lets it.
pub struct GateResource {
    permits: Receiver<()>,
    _drops: Option<DropGuard>,
}

impl GateResource {
    pub fn with_drop_counter(mut self, counter: DropCounter) -> Self {
        self._drops = Some(counter.guard());
        self
    }
}

impl ExecutionResource for GateResource {
    fn run(&mut self, _fetches: &[String], inputs: &Feeds) -> anyhow::Result<Vec<Tensor>> {
        self.permits
            .recv()
            .map_err(|_| anyhow!("gate dropped while job was waiting"))?;
        let input = inputs.get("in").ok_or_else(|| anyhow!("missing `in`"))?;
        Ok(vec![input.clone()])
    }
}

pub fn gated() -> (GateResource, Gate) {
    let (permits_tx, permits_rx) = channel::unbounded();
    (
        GateResource {
            permits: permits_rx,
            _drops: None,
        },
        Gate {
            permits: permits_tx,
        },
    )
}

/// One invocation of a [`mock_stage`].
#[derive(Debug, Clone)]
pub struct Run {
    pub at: Instant,
    pub shapes: BTreeMap<String, Vec<usize>>,
    pub all_zero: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RunLog(Arc<Mutex<Vec<Run>>>);

impl RunLog {
    pub fn runs(&self) -> Vec<Run> {
        self.0.lock().unwrap().clone()
    }
}

/// A stage that records its inputs, takes `delay` to compute, and returns `outputs(inputs)`.
pub fn mock_stage<F>(
    delay: Duration,
    log: &RunLog,
    drops: &DropCounter,
    mut outputs: F,
) -> impl ExecutionResource
where
    F: FnMut(&Feeds) -> anyhow::Result<Vec<Tensor>> + Send + 'static,
{
    let log = log.clone();
    let guard = drops.guard();
    resource(move |_, inputs| {
        let _alive = &guard;
        log.0.lock().unwrap().push(Run {
            at: Instant::now(),
            shapes: inputs
                .iter()
                .map(|(name, t)| (name.to_string(), t.shape().to_vec()))
                .collect(),
            all_zero: inputs.iter().all(|(_, t)| t.data().iter().all(|&v| v == 0.0)),
        });
        thread::sleep(delay);
        outputs(inputs)
    })
}

#[derive(Debug, Default)]
struct SourceState {
    started: Mutex<Option<Instant>>,
    stops: AtomicUsize,
}

/// Observes a [`ClockSource`] after it was moved into a pipeline.
#[derive(Debug, Clone, Default)]
pub struct SourceProbe(Arc<SourceState>);

impl SourceProbe {
    pub fn started(&self) -> Option<Instant> {
        *self.0.started.lock().unwrap()
    }

    pub fn stops(&self) -> usize {
        self.0.stops.load(Ordering::SeqCst)
    }
}

/// A source whose frame sequence number advances with wall-clock time, one per `period`.
pub struct ClockSource {
    period: Duration,
    start: Option<Instant>,
    limit: Option<u64>,
    fail_at_limit: bool,
    running: bool,
    probe: SourceProbe,
}

impl ClockSource {
    pub fn new(period: Duration) -> (Self, SourceProbe) {
        let probe = SourceProbe::default();
        let source = Self {
            period,
            start: None,
            limit: None,
            fail_at_limit: false,
            running: false,
            probe: probe.clone(),
        };
        (source, probe)
    }

    /// Ends the stream once frame `frames` would be captured.
    pub fn limit(mut self, frames: u64) -> Self {
        self.limit = Some(frames);
        self
    }

    /// Reports an error once the limit is reached.
    pub fn fail_at_limit(mut self) -> Self {
        self.fail_at_limit = true;
        self
    }
}

impl FrameSource for ClockSource {
    fn start(&mut self) -> anyhow::Result<()> {
        let now = Instant::now();
        self.start = Some(now);
        self.running = true;
        *self.probe.0.started.lock().unwrap() = Some(now);
        Ok(())
    }

    fn read(&mut self) -> Option<Frame> {
        let start = self.start?;
        let mut seq = (start.elapsed().as_nanos() / self.period.as_nanos()) as u64;
        if let Some(limit) = self.limit {
            if seq + 1 >= limit {
                self.running = false;
                seq = seq.min(limit.saturating_sub(1));
            }
        }
        Some(Frame::new(seq, RgbImage::new(4, 4)))
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn stop(&mut self) {
        self.running = false;
        self.probe.0.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn take_error(&mut self) -> Option<anyhow::Error> {
        if self.fail_at_limit && !self.running {
            self.fail_at_limit = false;
            return Some(anyhow!("camera unplugged"));
        }
        None
    }
}

/// What a [`Recorder`] saw of one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Seen {
    pub index: u64,
    pub seq: Option<u64>,
    pub detections: usize,
    pub has_frame: bool,
}

#[derive(Debug, Default)]
struct RecorderState {
    seen: Mutex<Vec<Seen>>,
    closes: AtomicUsize,
}

#[derive(Debug, Clone, Default)]
pub struct RecorderProbe(Arc<RecorderState>);

impl RecorderProbe {
    pub fn seen(&self) -> Vec<Seen> {
        self.0.seen.lock().unwrap().clone()
    }

    pub fn closes(&self) -> usize {
        self.0.closes.load(Ordering::SeqCst)
    }
}

/// A consumer that records what it is given, and misbehaves on request.
#[derive(Default)]
pub struct Recorder {
    state: RecorderProbe,
    needs_frames: bool,
    quit_at: Option<u64>,
    fail_at: Option<u64>,
    panic_at: Option<u64>,
    raise_at: Option<(u64, StopSignal)>,
}

impl Recorder {
    pub fn new() -> (Self, RecorderProbe) {
        let recorder = Self::default();
        let probe = recorder.state.clone();
        (recorder, probe)
    }

    pub fn needs_frames(mut self) -> Self {
        self.needs_frames = true;
        self
    }

    /// Requests to quit when given the frame with this index.
    pub fn quit_at(mut self, index: u64) -> Self {
        self.quit_at = Some(index);
        self
    }

    pub fn fail_at(mut self, index: u64) -> Self {
        self.fail_at = Some(index);
        self
    }

    pub fn panic_at(mut self, index: u64) -> Self {
        self.panic_at = Some(index);
        self
    }

    pub fn raise_at(mut self, index: u64, stop: StopSignal) -> Self {
        self.raise_at = Some((index, stop));
        self
    }
}

impl ResultConsumer for Recorder {
    fn needs_frames(&self) -> bool {
        self.needs_frames
    }

    fn consume(&mut self, output: &FrameOutput) -> anyhow::Result<Flow> {
        let index = output.index;
        self.state.0.seen.lock().unwrap().push(Seen {
            index,
            seq: output.seq,
            detections: output.detections.len(),
            has_frame: output.frame.is_some(),
        });

        if self.fail_at == Some(index) {
            anyhow::bail!("display went away");
        }
        if self.panic_at == Some(index) {
            // Unwind without invoking the panic hook, to keep test output clean.
            panic::resume_unwind(Box::new("consumer exploded"));
        }
        if let Some((at, stop)) = &self.raise_at {
            if *at == index {
                stop.raise();
            }
        }
        if self.quit_at == Some(index) {
            return Ok(Flow::Quit);
        }
        Ok(Flow::Continue)
    }

    fn close(&mut self) {
        self.state.0.closes.fetch_add(1, Ordering::SeqCst);
    }
}
