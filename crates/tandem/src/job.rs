//! Units of work flowing through the inference stages.

use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use crate::nn::{Feeds, Tensor};
use crate::video::Frame;

/// Timestamp taken at the start of the scheduler iteration that captured the frame.
pub const TOP_IN_TIME: &str = "top_in_time";
/// Timestamp taken right before the frame was read from the source.
pub const CAP_IN_TIME: &str = "cap_in_time";
/// Timestamp taken after the frame was converted to the input tensor.
pub const CAP_OUT_TIME: &str = "cap_out_time";

/// Metadata threaded alongside a [`Job`] through every stage.
///
/// Holds the source frame's sequence number, the frame itself (only when it is needed downstream,
/// e.g. for visualization), and a set of named timestamps. Stages add `<stage>_in_time` and
/// `<stage>_out_time` entries as the job passes through them.
#[derive(Debug, Clone, Default)]
pub struct Extras {
    seq: Option<u64>,
    frame: Option<Frame>,
    stamps: BTreeMap<String, Instant>,
}

impl Extras {
    /// Creates an empty set of extras, as used for synthetic warm-up jobs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates extras for the frame with sequence number `seq`.
    pub fn for_frame(seq: u64) -> Self {
        Self {
            seq: Some(seq),
            ..Self::default()
        }
    }

    /// Returns the sequence number of the source frame, if this job was created from one.
    pub fn seq(&self) -> Option<u64> {
        self.seq
    }

    /// Attaches the source frame.
    pub fn set_frame(&mut self, frame: Frame) {
        self.frame = Some(frame);
    }

    pub fn frame(&self) -> Option<&Frame> {
        self.frame.as_ref()
    }

    /// Removes and returns the attached frame.
    pub fn take_frame(&mut self) -> Option<Frame> {
        self.frame.take()
    }

    /// Records the current time under `key`, returning it.
    pub fn stamp(&mut self, key: impl Into<String>) -> Instant {
        let now = Instant::now();
        self.stamps.insert(key.into(), now);
        now
    }

    /// Records `time` under `key`, replacing any earlier entry.
    pub fn set(&mut self, key: impl Into<String>, time: Instant) {
        self.stamps.insert(key.into(), time);
    }

    pub fn get(&self, key: &str) -> Option<Instant> {
        self.stamps.get(key).copied()
    }

    /// Returns the time elapsed between the `from` and `to` timestamps.
    ///
    /// Returns [`None`] if either timestamp is missing. If `to` precedes `from`, the result is zero.
    pub fn between(&self, from: &str, to: &str) -> Option<Duration> {
        Some(self.get(to)?.saturating_duration_since(self.get(from)?))
    }

    /// Returns an iterator over all recorded timestamps, ordered by key.
    pub fn stamps(&self) -> impl Iterator<Item = (&str, Instant)> {
        self.stamps.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// A unit of work submitted to a [`StageWorker`][crate::stage::StageWorker].
///
/// `fetches` names the outputs to compute, `inputs` binds tensors to the named inputs of the
/// stage's execution resource.
#[derive(Debug)]
pub struct Job {
    pub(crate) fetches: Vec<String>,
    pub(crate) inputs: Feeds,
    pub(crate) extras: Extras,
}

impl Job {
    pub fn new(fetches: Vec<String>, inputs: Feeds, extras: Extras) -> Self {
        Self {
            fetches,
            inputs,
            extras,
        }
    }

    pub fn fetches(&self) -> &[String] {
        &self.fetches
    }

    pub fn inputs(&self) -> &Feeds {
        &self.inputs
    }

    pub fn extras(&self) -> &Extras {
        &self.extras
    }
}

/// The outputs of a completed [`Job`], one tensor per requested fetch, plus its extras.
#[derive(Debug)]
pub struct JobResult {
    pub(crate) outputs: Vec<Tensor>,
    pub(crate) extras: Extras,
}

impl JobResult {
    pub fn outputs(&self) -> &[Tensor] {
        &self.outputs
    }

    pub fn extras(&self) -> &Extras {
        &self.extras
    }

    pub fn into_parts(self) -> (Vec<Tensor>, Extras) {
        (self.outputs, self.extras)
    }
}
