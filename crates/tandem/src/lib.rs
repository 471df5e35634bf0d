//! Real-time object detection with overlapped capture, inference, and display.
//!
//! Frames flow from a [`video::FrameSource`] through one or two [`stage::StageWorker`]s, each
//! running a neural network on its own thread, into a [`consumer::ResultConsumer`]. The
//! [`pipeline::Pipeline`] ties them together without ever queueing work: a stage that is busy
//! simply does not get the next frame, so latency stays bounded by the slowest stage instead of
//! growing with a backlog.
//!
//! The detector can optionally be split in two (see [`config::Config::split_model`]): the fast
//! stage runs the convolutional part of an SSD network, the slow stage its post-processing, so
//! both can work on different frames at the same time.
//!
//! # Environment Variables
//!
//! * `TANDEM_WEBCAM_NAME`: Forces the device to use for webcams opened without an explicit device
//!   name. If unset, the first device that supports JPEG capture will be used.
//! * `RUST_LOG`: Overrides the log levels set by [`init_logger!`].

use log::LevelFilter;

pub mod config;
pub mod consumer;
pub mod detection;
pub mod draw;
pub mod drop;
pub mod iter;
pub mod job;
pub mod labels;
pub mod metrics;
pub mod nn;
pub mod pipeline;
pub mod stage;
pub mod video;

#[cfg(test)]
mod test;

/// macro-use only, not part of public API.
#[doc(hidden)]
pub fn init_logger(calling_crate: &'static str) {
    let log_level = if cfg!(debug_assertions) {
        LevelFilter::Trace
    } else {
        LevelFilter::Debug
    };
    env_logger::Builder::new()
        .filter_level(LevelFilter::Info)
        .filter(Some(calling_crate), log_level)
        .filter(Some(env!("CARGO_PKG_NAME")), log_level)
        .filter(Some("tract_onnx"), LevelFilter::Warn)
        .filter(Some("tract_hir"), LevelFilter::Warn)
        .filter(Some("tract_core"), LevelFilter::Warn)
        .parse_default_env()
        .try_init()
        .ok();
}

/// Initializes logging to *stderr*.
///
/// If `cfg!(debug_assertions)` is enabled, the calling crate and tandem will log at *trace* level.
/// Otherwise, they will log at *debug* level. tract logs at *warn* level, everything else at
/// *info*. `RUST_LOG` overrides all of these.
///
/// If a global logger is already registered, this macro will do nothing.
#[macro_export]
macro_rules! init_logger {
    () => {
        $crate::init_logger(env!("CARGO_CRATE_NAME"))
    };
}
