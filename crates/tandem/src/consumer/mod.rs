//! What happens to the detections of a finished frame.

mod visualize;

use itertools::Itertools;

use crate::detection::Detections;
use crate::labels::LabelMap;
use crate::video::Frame;

pub use visualize::{Display, FrameWriter, Visualizer};

/// Whether the pipeline should keep going after a frame was consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// The consumer is done; the pipeline shuts down cleanly.
    Quit,
}

/// A frame that made it through every stage.
#[derive(Debug, Clone)]
pub struct FrameOutput {
    /// Number of frames output before this one.
    pub index: u64,
    /// Capture sequence number of the frame.
    pub seq: Option<u64>,
    pub detections: Detections,
    /// The captured image, if the consumer asked for frames.
    pub frame: Option<Frame>,
    /// Frame rate over the last full FPS window.
    pub fps: f64,
    /// Frame rate over the last 0.2 seconds.
    pub fps_snapshot: f64,
}

/// Receives the output of the pipeline, one frame at a time, on the scheduler thread.
pub trait ResultConsumer {
    /// Whether captured images have to be carried along with the jobs so that they are available
    /// in [`FrameOutput::frame`].
    fn needs_frames(&self) -> bool {
        false
    }

    /// Handles a finished frame.
    ///
    /// Returning an error ends the pipeline.
    fn consume(&mut self, output: &FrameOutput) -> anyhow::Result<Flow>;

    /// Called once when the pipeline shuts down, however it ends.
    fn close(&mut self) {}
}

impl<C: ResultConsumer + ?Sized> ResultConsumer for Box<C> {
    fn needs_frames(&self) -> bool {
        (**self).needs_frames()
    }

    fn consume(&mut self, output: &FrameOutput) -> anyhow::Result<Flow> {
        (**self).consume(output)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Headless consumer that logs confident detections of every `interval`-th frame.
pub struct DetectionLog {
    labels: LabelMap,
    interval: u64,
    threshold: f32,
    reported: u64,
}

impl DetectionLog {
    /// `interval` must be at least 1.
    pub fn new(labels: LabelMap, interval: u64, threshold: f32) -> Self {
        Self {
            labels,
            interval: interval.max(1),
            threshold,
            reported: 0,
        }
    }

    /// Number of detections logged so far.
    pub fn reported(&self) -> u64 {
        self.reported
    }
}

impl ResultConsumer for DetectionLog {
    fn consume(&mut self, output: &FrameOutput) -> anyhow::Result<Flow> {
        if output.index % self.interval != 0 {
            return Ok(Flow::Continue);
        }

        let confident = output.detections.above(self.threshold).collect::<Vec<_>>();
        if !confident.is_empty() {
            log::info!(
                "frame {}: {}",
                output.index,
                confident
                    .iter()
                    .map(|det| format!(
                        "{} ({:.2}) at {}",
                        self.labels.label(det.class),
                        det.score,
                        det.bbox
                    ))
                    .format(", ")
            );
            self.reported += confident.len() as u64;
        }
        Ok(Flow::Continue)
    }
}
