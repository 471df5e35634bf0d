use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tandem::config::Config;
use tandem::consumer::{DetectionLog, FrameWriter, ResultConsumer, Visualizer};
use tandem::labels::LabelMap;
use tandem::nn::NeuralNetwork;
use tandem::pipeline::{spawn_stage, Pipeline, PipelineOptions, StopSignal};
use tandem::stage::StageId;
use tandem::video;

/// Real-time object detection on a video stream.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// TOML configuration file. Built-in defaults are used for everything it leaves out.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Where to read frames from: `webcam[:<name>]`, `http://<host>:<port>/<path>`,
    /// `synthetic`, or an image file or directory.
    #[arg(long)]
    video_input: Option<String>,
    /// Draw detections and write the annotated frames into the output directory.
    #[arg(long)]
    visualize: bool,
    /// Number of frames to process before exiting (ignored with `--visualize`).
    #[arg(long)]
    max_frames: Option<u64>,
    /// Split the detector into a fast and a slow stage.
    #[arg(long)]
    split_model: bool,
}

fn main() -> anyhow::Result<()> {
    tandem::init_logger!();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(input) = cli.video_input {
        config.video_input = input;
    }
    if let Some(max_frames) = cli.max_frames {
        config.max_frames = max_frames;
    }
    config.visualize |= cli.visualize;
    config.split_model |= cli.split_model;
    config.validate()?;
    log::debug!("{config:#?}");

    let stop = StopSignal::new();
    ctrlc::set_handler({
        let stop = stop.clone();
        move || {
            log::info!("interrupted, shutting down");
            stop.raise();
        }
    })
    .context("failed to install Ctrl-C handler")?;

    let mut options = PipelineOptions::from_config(&config);
    let fast_net = NeuralNetwork::from_path(&config.model_path)?
        .with_outputs(config.fast_fetches())
        .load()
        .with_context(|| format!("failed to load `{}`", config.model_path.display()))?;
    options.input_resolution = fast_net.image_input_resolution(&config.tensors.image);
    let fast = spawn_stage(StageId::FAST, fast_net)?;

    let slow = match (&config.slow_model_path, config.split_model) {
        (Some(path), true) => {
            let slow_net = NeuralNetwork::from_path(path)?
                .with_outputs(config.tensors.detection_fetches())
                .load()
                .with_context(|| format!("failed to load `{}`", path.display()))?;
            Some(spawn_stage(StageId::SLOW, slow_net)?)
        }
        _ => None,
    };

    let source = video::open_source(&config.video_input()?, config.resolution())?;
    let labels = LabelMap::load_or_empty(&config.label_path);
    let consumer: Box<dyn ResultConsumer> = if config.visualize {
        let mut visualizer = Visualizer::new(
            FrameWriter::create(&config.output_dir)?,
            labels,
            stop.clone(),
        )
        .threshold(config.det_th)
        .vis_text(config.vis_text);
        if config.debug_mode {
            visualizer = visualizer.debug(config.fps_interval());
        }
        Box::new(visualizer)
    } else {
        Box::new(DetectionLog::new(
            labels,
            config.det_interval,
            config.det_th,
        ))
    };

    Pipeline::new(fast, slow, source, consumer, options)
        .with_stop_signal(stop)
        .run()?;
    Ok(())
}
