use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use image::RgbImage;

use crate::draw;
use crate::labels::LabelMap;
use crate::metrics::SNAPSHOT_INTERVAL;
use crate::pipeline::StopSignal;

use super::{Flow, FrameOutput, ResultConsumer};

/// Somewhere to show annotated frames.
pub trait Display {
    fn show(&mut self, image: &RgbImage) -> anyhow::Result<()>;

    fn close(&mut self) {}
}

/// Writes annotated frames as JPEG files into a directory.
///
/// By default only `latest.jpg` is kept, replaced atomically for every frame so that an image
/// viewer watching the file never sees a partial write.
pub struct FrameWriter {
    dir: PathBuf,
    keep_all: bool,
    written: u64,
}

impl FrameWriter {
    /// Creates `dir` if it does not exist.
    pub fn create<P: AsRef<Path>>(dir: P) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create output directory `{}`", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            keep_all: false,
            written: 0,
        })
    }

    /// Writes every frame to its own numbered file instead.
    pub fn keep_all(mut self, keep_all: bool) -> Self {
        self.keep_all = keep_all;
        self
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn latest_path(&self) -> PathBuf {
        self.dir.join("latest.jpg")
    }
}

impl Display for FrameWriter {
    fn show(&mut self, image: &RgbImage) -> anyhow::Result<()> {
        if self.keep_all {
            let path = self.dir.join(format!("frame_{:06}.jpg", self.written));
            image
                .save(&path)
                .with_context(|| format!("failed to write `{}`", path.display()))?;
        } else {
            let tmp = self.dir.join("latest.tmp.jpg");
            image
                .save(&tmp)
                .with_context(|| format!("failed to write `{}`", tmp.display()))?;
            fs::rename(&tmp, self.latest_path())?;
        }
        self.written += 1;
        Ok(())
    }

    fn close(&mut self) {
        log::info!("wrote {} frames to `{}`", self.written, self.dir.display());
    }
}

/// Draws detections and frame rate onto each frame and hands it to a [`Display`].
///
/// Quits as soon as the [`StopSignal`] is raised.
pub struct Visualizer<D> {
    display: D,
    labels: LabelMap,
    stop: StopSignal,
    threshold: f32,
    vis_text: bool,
    debug_interval: Option<Duration>,
}

impl<D: Display> Visualizer<D> {
    pub fn new(display: D, labels: LabelMap, stop: StopSignal) -> Self {
        Self {
            display,
            labels,
            stop,
            threshold: 0.5,
            vis_text: true,
            debug_interval: None,
        }
    }

    /// Minimum score of the detections to draw. Defaults to 0.5.
    pub fn threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Whether to draw the frame rate.
    pub fn vis_text(mut self, vis_text: bool) -> Self {
        self.vis_text = vis_text;
        self
    }

    /// Draws the short-term frame rate above the long-term one, labeled with their windows.
    pub fn debug(mut self, fps_interval: Duration) -> Self {
        self.debug_interval = Some(fps_interval);
        self
    }

    pub fn display(&self) -> &D {
        &self.display
    }

    fn annotate(&self, image: &mut RgbImage, output: &FrameOutput) {
        let (width, height) = image.dimensions();
        for det in output.detections.above(self.threshold) {
            let (x, y, w, h) = det.bbox.to_pixels(width, height);
            let color = draw::class_color(det.class);
            draw::rect(image, x, y, w, h).color(color).stroke_width(2);

            let caption = format!(
                "{}: {:.0}%",
                self.labels.label(det.class),
                det.score * 100.0
            );
            draw::text(image, x, y, &caption)
                .align_bottom()
                .color(draw::BLACK)
                .background(color);
        }

        if !self.vis_text {
            return;
        }
        match self.debug_interval {
            None => {
                let fps = format!("fps: {:.1}", output.fps);
                draw::text(image, 10, 10, &fps)
                    .color(draw::GREEN)
                    .background(draw::BLACK);
            }
            Some(interval) => {
                let snapshot = format!(
                    "fps: {:.1} {}sec",
                    output.fps_snapshot,
                    SNAPSHOT_INTERVAL.as_secs_f64()
                );
                let fps = format!("fps: {:.1} {}sec", output.fps, interval.as_secs_f64());
                draw::text(image, 10, 10, &snapshot)
                    .color(draw::GREEN)
                    .background(draw::BLACK);
                draw::text(image, 10, 22, &fps)
                    .color(draw::GREEN)
                    .background(draw::BLACK);
            }
        }
    }
}

impl<D: Display> ResultConsumer for Visualizer<D> {
    fn needs_frames(&self) -> bool {
        true
    }

    fn consume(&mut self, output: &FrameOutput) -> anyhow::Result<Flow> {
        if self.stop.is_raised() {
            return Ok(Flow::Quit);
        }
        let Some(frame) = &output.frame else {
            log::warn!("frame {:?} arrived without its image", output.seq);
            return Ok(Flow::Continue);
        };

        let mut image = frame.image().clone();
        self.annotate(&mut image, output);
        self.display.show(&image)?;
        Ok(Flow::Continue)
    }

    fn close(&mut self) {
        self.display.close();
    }
}

#[cfg(test)]
mod tests {
    use std::env;

    use image::Rgb;

    use crate::detection::{BoundingBox, Detection};
    use crate::video::Frame;

    use super::*;

    #[derive(Default)]
    struct Shown {
        images: Vec<RgbImage>,
        closed: bool,
    }

    impl Display for Shown {
        fn show(&mut self, image: &RgbImage) -> anyhow::Result<()> {
            self.images.push(image.clone());
            Ok(())
        }

        fn close(&mut self) {
            self.closed = true;
        }
    }

    const GRAY: Rgb<u8> = Rgb([128, 128, 128]);

    fn output(score: f32) -> FrameOutput {
        FrameOutput {
            index: 0,
            seq: Some(0),
            detections: [Detection {
                class: 3,
                score,
                bbox: BoundingBox {
                    ymin: 0.5,
                    xmin: 0.25,
                    ymax: 1.0,
                    xmax: 0.75,
                },
            }]
            .into_iter()
            .collect(),
            frame: Some(Frame::new(0, RgbImage::from_pixel(120, 80, GRAY))),
            fps: 29.97,
            fps_snapshot: 31.0,
        }
    }

    fn to_rgb(color: embedded_graphics::pixelcolor::Rgb888) -> Rgb<u8> {
        use embedded_graphics::pixelcolor::RgbColor;
        Rgb([color.r(), color.g(), color.b()])
    }

    #[test]
    fn draws_confident_detections() {
        let mut vis = Visualizer::new(Shown::default(), LabelMap::default(), StopSignal::new())
            .threshold(0.5)
            .vis_text(false);
        assert!(vis.needs_frames());

        assert_eq!(vis.consume(&output(0.9)).unwrap(), Flow::Continue);
        assert_eq!(vis.consume(&output(0.3)).unwrap(), Flow::Continue);

        let images = &vis.display().images;
        assert_eq!(images.len(), 2);
        // Box from (30, 40) to (90, 80), outline drawn in the class color.
        let color = to_rgb(draw::class_color(3));
        assert_eq!(*images[0].get_pixel(30, 60), color);
        assert_eq!(*images[0].get_pixel(60, 60), GRAY);
        // Too unconfident to draw.
        assert!(images[1].pixels().all(|p| *p == GRAY));
    }

    #[test]
    fn draws_frame_rate() {
        let mut vis = Visualizer::new(Shown::default(), LabelMap::default(), StopSignal::new())
            .threshold(1.0)
            .debug(Duration::from_secs(5));
        vis.consume(&output(0.9)).unwrap();

        let image = &vis.display().images[0];
        let green = to_rgb(draw::GREEN);
        let rows_with_green = |rows: std::ops::Range<u32>| {
            rows.flat_map(|y| (0..image.width()).map(move |x| (x, y)))
                .any(|(x, y)| *image.get_pixel(x, y) == green)
        };
        assert!(rows_with_green(10..20));
        assert!(rows_with_green(22..32));
        assert!(!rows_with_green(40..80));
    }

    #[test]
    fn quits_when_stopped() {
        let stop = StopSignal::new();
        let mut vis = Visualizer::new(Shown::default(), LabelMap::default(), stop.clone());
        assert_eq!(vis.consume(&output(0.9)).unwrap(), Flow::Continue);
        stop.raise();
        assert_eq!(vis.consume(&output(0.9)).unwrap(), Flow::Quit);
        assert_eq!(vis.display().images.len(), 1);

        vis.close();
        assert!(vis.display().closed);
    }

    #[test]
    fn frame_writer_replaces_latest() {
        let dir = env::temp_dir().join(format!("tandem-writer-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);

        let mut writer = FrameWriter::create(&dir).unwrap();
        writer.show(&RgbImage::from_pixel(8, 8, GRAY)).unwrap();
        writer.show(&RgbImage::from_pixel(16, 8, GRAY)).unwrap();
        assert_eq!(writer.written(), 2);
        let latest = image::open(writer.latest_path()).unwrap();
        assert_eq!((latest.width(), latest.height()), (16, 8));
        assert!(!dir.join("latest.tmp.jpg").exists());

        let mut writer = FrameWriter::create(&dir).unwrap().keep_all(true);
        writer.show(&RgbImage::from_pixel(8, 8, GRAY)).unwrap();
        assert!(dir.join("frame_000000.jpg").exists());

        fs::remove_dir_all(&dir).unwrap();
    }
}
